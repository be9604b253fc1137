//! The post-build pass.
//!
//! Wraps another sink and, for every build-scenario predicate and every
//! update, additionally emits the matching post-build predicate read from
//! the final model state of the command's ref. Stale post-build predicates
//! from the input stream are dropped and regenerated. A future build checks
//! these against its pre-build filesystem to detect changes made after this
//! build finished.

use std::collections::HashSet;
use std::path::Path;

use super::{ContentData, MetadataData, TraceSink};
use crate::artifact::SpecialEntity;
use crate::command::{CommandDef, CommandId, RefId, RefOutcome};
use crate::engine::{Build, EngineError};
use crate::flags::AccessFlags;
use crate::version::Scenario;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Facet {
  Result,
  Metadata,
  Content,
}

pub struct PostBuildChecker<'a, 'obs, S: TraceSink> {
  build: &'a mut Build<'obs>,
  inner: S,
  emitted: HashSet<(CommandId, RefId, Facet)>,
}

impl<'a, 'obs, S: TraceSink> PostBuildChecker<'a, 'obs, S> {
  pub fn new(build: &'a mut Build<'obs>, inner: S) -> Self {
    PostBuildChecker {
      build,
      inner,
      emitted: HashSet::new(),
    }
  }

  pub fn into_inner(self) -> S {
    self.inner
  }

  /// One post-build predicate per (command, ref, facet); the final state
  /// does not change between emissions.
  fn first(&mut self, c: CommandId, r: RefId, facet: Facet) -> bool {
    self.emitted.insert((c, r, facet))
  }

  fn emit_result(&mut self, c: CommandId, r: RefId) -> Result<(), EngineError> {
    if !self.first(c, r, Facet::Result) {
      return Ok(());
    }
    if let Some(observed) = self.build.peek_ref_result(c, r) {
      self.inner.expect_result(c, Scenario::PostBuild, r, observed)?;
    }
    Ok(())
  }

  fn emit_metadata(&mut self, c: CommandId, r: RefId) -> Result<(), EngineError> {
    if !self.first(c, r, Facet::Metadata) {
      return Ok(());
    }
    if let Some(version) = self.build.peek_ref_metadata(c, r) {
      self.inner.match_metadata(c, Scenario::PostBuild, r, &version)?;
    }
    Ok(())
  }

  fn emit_content(&mut self, c: CommandId, r: RefId) -> Result<(), EngineError> {
    if !self.first(c, r, Facet::Content) {
      return Ok(());
    }
    if let Some(version) = self.build.peek_ref_content(c, r) {
      self.inner.match_content(c, Scenario::PostBuild, r, &version)?;
    }
    Ok(())
  }
}

impl<S: TraceSink> TraceSink for PostBuildChecker<'_, '_, S> {
  fn define_command(&mut self, id: CommandId, def: &CommandDef) -> Result<(), EngineError> {
    self.inner.define_command(id, def)
  }

  fn special_ref(&mut self, c: CommandId, entity: SpecialEntity, output: RefId) -> Result<(), EngineError> {
    self.inner.special_ref(c, entity, output)
  }

  fn pipe_ref(&mut self, c: CommandId, read_end: RefId, write_end: RefId) -> Result<(), EngineError> {
    self.inner.pipe_ref(c, read_end, write_end)
  }

  fn file_ref(&mut self, c: CommandId, mode: u32, output: RefId) -> Result<(), EngineError> {
    self.inner.file_ref(c, mode, output)
  }

  fn symlink_ref(&mut self, c: CommandId, target: &Path, output: RefId) -> Result<(), EngineError> {
    self.inner.symlink_ref(c, target, output)
  }

  fn dir_ref(&mut self, c: CommandId, mode: u32, output: RefId) -> Result<(), EngineError> {
    self.inner.dir_ref(c, mode, output)
  }

  fn path_ref(
    &mut self,
    c: CommandId,
    base: RefId,
    path: &Path,
    flags: AccessFlags,
    output: RefId,
  ) -> Result<(), EngineError> {
    self.inner.path_ref(c, base, path, flags, output)
  }

  fn using_ref(&mut self, c: CommandId, r: RefId) -> Result<(), EngineError> {
    self.inner.using_ref(c, r)
  }

  fn done_with_ref(&mut self, c: CommandId, r: RefId) -> Result<(), EngineError> {
    self.inner.done_with_ref(c, r)
  }

  fn compare_refs(&mut self, c: CommandId, r1: RefId, r2: RefId, outcome: RefOutcome) -> Result<(), EngineError> {
    self.inner.compare_refs(c, r1, r2, outcome)
  }

  fn expect_result(
    &mut self,
    c: CommandId,
    scenario: Scenario,
    r: RefId,
    expected: i32,
  ) -> Result<(), EngineError> {
    if scenario != Scenario::Build {
      return Ok(());
    }
    self.inner.expect_result(c, Scenario::Build, r, expected)?;
    self.emit_result(c, r)
  }

  fn match_metadata(
    &mut self,
    c: CommandId,
    scenario: Scenario,
    r: RefId,
    version: &MetadataData,
  ) -> Result<(), EngineError> {
    if scenario != Scenario::Build {
      return Ok(());
    }
    self.inner.match_metadata(c, Scenario::Build, r, version)?;
    self.emit_metadata(c, r)
  }

  fn match_content(
    &mut self,
    c: CommandId,
    scenario: Scenario,
    r: RefId,
    version: &ContentData,
  ) -> Result<(), EngineError> {
    if scenario != Scenario::Build {
      return Ok(());
    }
    self.inner.match_content(c, Scenario::Build, r, version)?;
    self.emit_content(c, r)
  }

  fn update_metadata(&mut self, c: CommandId, r: RefId, version: &MetadataData) -> Result<(), EngineError> {
    self.inner.update_metadata(c, r, version)?;
    self.emit_metadata(c, r)
  }

  fn update_content(&mut self, c: CommandId, r: RefId, version: &ContentData) -> Result<(), EngineError> {
    self.inner.update_content(c, r, version)?;
    self.emit_content(c, r)
  }

  fn add_entry(&mut self, c: CommandId, dir: RefId, name: &str, target: RefId) -> Result<(), EngineError> {
    self.inner.add_entry(c, dir, name, target)
  }

  fn remove_entry(&mut self, c: CommandId, dir: RefId, name: &str, target: RefId) -> Result<(), EngineError> {
    self.inner.remove_entry(c, dir, name, target)
  }

  fn launch(
    &mut self,
    c: CommandId,
    child: CommandId,
    refs: &[(RefId, RefId)],
    def: &CommandDef,
  ) -> Result<(), EngineError> {
    self.inner.launch(c, child, refs, def)
  }

  fn join(&mut self, c: CommandId, child: CommandId, exit_status: i32) -> Result<(), EngineError> {
    self.inner.join(c, child, exit_status)
  }

  fn exit(&mut self, c: CommandId, exit_status: i32) -> Result<(), EngineError> {
    self.inner.exit(c, exit_status)
  }

  fn finish(&mut self) -> Result<(), EngineError> {
    self.inner.finish()
  }
}
