//! Trace I/O: the record stream, its readers and writers, and the sink
//! indirection that lets post-processing passes chain between them.

mod input;
mod output;
mod postbuild;
mod record;

pub use input::InputTrace;
pub use output::{OutputTrace, TraceBuffer};
pub use postbuild::PostBuildChecker;
pub use record::{ContentData, MetadataData, Record};

use std::collections::HashMap;
use std::io;
use std::path::Path;

use thiserror::Error;

use crate::artifact::SpecialEntity;
use crate::command::{CommandDef, CommandId, RefId, RefOutcome};
use crate::engine::EngineError;
use crate::flags::AccessFlags;
use crate::version::Scenario;

/// Errors from loading a trace. Every variant means "no usable trace"; the
/// caller falls back to the default trace and a full build.
#[derive(Debug, Error)]
pub enum TraceError {
  #[error(transparent)]
  Io(#[from] io::Error),

  #[error("bad magic number {found:#018x}")]
  BadMagic { found: u64 },

  #[error("unsupported trace version {found}")]
  UnsupportedVersion { found: u64 },

  #[error("malformed record stream: {0}")]
  Decode(#[from] bincode::Error),

  #[error("trace ends without an end record")]
  Truncated,
}

/// Receives a trace one step at a time.
///
/// The engine implements this to emulate; [`TraceBuffer`] and [`OutputTrace`]
/// implement it to record; [`PostBuildChecker`] wraps another sink to inject
/// post-build predicates.
pub trait TraceSink {
  /// A command's identity enters the stream. Always precedes any step
  /// attributed to the command.
  fn define_command(&mut self, id: CommandId, def: &CommandDef) -> Result<(), EngineError>;

  fn special_ref(&mut self, c: CommandId, entity: SpecialEntity, output: RefId) -> Result<(), EngineError>;

  fn pipe_ref(&mut self, c: CommandId, read_end: RefId, write_end: RefId) -> Result<(), EngineError>;

  fn file_ref(&mut self, c: CommandId, mode: u32, output: RefId) -> Result<(), EngineError>;

  fn symlink_ref(&mut self, c: CommandId, target: &Path, output: RefId) -> Result<(), EngineError>;

  fn dir_ref(&mut self, c: CommandId, mode: u32, output: RefId) -> Result<(), EngineError>;

  fn path_ref(
    &mut self,
    c: CommandId,
    base: RefId,
    path: &Path,
    flags: AccessFlags,
    output: RefId,
  ) -> Result<(), EngineError>;

  fn using_ref(&mut self, c: CommandId, r: RefId) -> Result<(), EngineError>;

  fn done_with_ref(&mut self, c: CommandId, r: RefId) -> Result<(), EngineError>;

  fn compare_refs(&mut self, c: CommandId, r1: RefId, r2: RefId, outcome: RefOutcome) -> Result<(), EngineError>;

  fn expect_result(&mut self, c: CommandId, scenario: Scenario, r: RefId, expected: i32)
    -> Result<(), EngineError>;

  fn match_metadata(
    &mut self,
    c: CommandId,
    scenario: Scenario,
    r: RefId,
    version: &MetadataData,
  ) -> Result<(), EngineError>;

  fn match_content(
    &mut self,
    c: CommandId,
    scenario: Scenario,
    r: RefId,
    version: &ContentData,
  ) -> Result<(), EngineError>;

  fn update_metadata(&mut self, c: CommandId, r: RefId, version: &MetadataData) -> Result<(), EngineError>;

  fn update_content(&mut self, c: CommandId, r: RefId, version: &ContentData) -> Result<(), EngineError>;

  fn add_entry(&mut self, c: CommandId, dir: RefId, name: &str, target: RefId) -> Result<(), EngineError>;

  fn remove_entry(&mut self, c: CommandId, dir: RefId, name: &str, target: RefId) -> Result<(), EngineError>;

  fn launch(
    &mut self,
    c: CommandId,
    child: CommandId,
    refs: &[(RefId, RefId)],
    def: &CommandDef,
  ) -> Result<(), EngineError>;

  fn join(&mut self, c: CommandId, child: CommandId, exit_status: i32) -> Result<(), EngineError>;

  fn exit(&mut self, c: CommandId, exit_status: i32) -> Result<(), EngineError>;

  /// The stream is complete.
  fn finish(&mut self) -> Result<(), EngineError>;
}

/// Dispatch a record stream into a sink, calling `finish` at the end record.
pub fn replay(records: &[Record], sink: &mut dyn TraceSink) -> Result<(), EngineError> {
  let mut defs: HashMap<u32, CommandDef> = HashMap::new();

  for record in records {
    match record {
      Record::Command { id, def } => {
        defs.insert(*id, def.clone());
        sink.define_command(CommandId(*id), def)?;
      }
      Record::SpecialRef { cmd, entity, output } => {
        sink.special_ref(CommandId(*cmd), *entity, *output)?;
      }
      Record::PipeRef {
        cmd,
        read_end,
        write_end,
      } => {
        sink.pipe_ref(CommandId(*cmd), *read_end, *write_end)?;
      }
      Record::FileRef { cmd, mode, output } => {
        sink.file_ref(CommandId(*cmd), *mode, *output)?;
      }
      Record::SymlinkRef { cmd, target, output } => {
        sink.symlink_ref(CommandId(*cmd), target, *output)?;
      }
      Record::DirRef { cmd, mode, output } => {
        sink.dir_ref(CommandId(*cmd), *mode, *output)?;
      }
      Record::PathRef {
        cmd,
        base,
        path,
        flags,
        output,
      } => {
        sink.path_ref(CommandId(*cmd), *base, path, *flags, *output)?;
      }
      Record::UsingRef { cmd, r } => {
        sink.using_ref(CommandId(*cmd), *r)?;
      }
      Record::DoneWithRef { cmd, r } => {
        sink.done_with_ref(CommandId(*cmd), *r)?;
      }
      Record::CompareRefs { cmd, r1, r2, outcome } => {
        sink.compare_refs(CommandId(*cmd), *r1, *r2, *outcome)?;
      }
      Record::ExpectResult {
        cmd,
        scenario,
        r,
        expected,
      } => {
        sink.expect_result(CommandId(*cmd), *scenario, *r, *expected)?;
      }
      Record::MatchMetadata {
        cmd,
        scenario,
        r,
        version,
      } => {
        sink.match_metadata(CommandId(*cmd), *scenario, *r, version)?;
      }
      Record::MatchContent {
        cmd,
        scenario,
        r,
        version,
      } => {
        sink.match_content(CommandId(*cmd), *scenario, *r, version)?;
      }
      Record::UpdateMetadata { cmd, r, version } => {
        sink.update_metadata(CommandId(*cmd), *r, version)?;
      }
      Record::UpdateContent { cmd, r, version } => {
        sink.update_content(CommandId(*cmd), *r, version)?;
      }
      Record::AddEntry { cmd, dir, name, target } => {
        sink.add_entry(CommandId(*cmd), *dir, name, *target)?;
      }
      Record::RemoveEntry { cmd, dir, name, target } => {
        sink.remove_entry(CommandId(*cmd), *dir, name, *target)?;
      }
      Record::Launch { cmd, child, refs } => {
        let def = defs.get(child).ok_or(EngineError::UnknownCommand(*child))?.clone();
        sink.launch(CommandId(*cmd), CommandId(*child), refs, &def)?;
      }
      Record::Join {
        cmd,
        child,
        exit_status,
      } => {
        sink.join(CommandId(*cmd), CommandId(*child), *exit_status)?;
      }
      Record::Exit { cmd, exit_status } => {
        sink.exit(CommandId(*cmd), *exit_status)?;
      }
      Record::End => break,
    }
  }

  sink.finish()
}
