//! Recording sinks: the in-memory step buffer and the on-disk trace writer.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::record::{ContentData, MetadataData, Record};
use super::TraceSink;
use crate::artifact::SpecialEntity;
use crate::command::{CommandDef, CommandId, RefId, RefOutcome};
use crate::consts::{TRACE_MAGIC, TRACE_VERSION};
use crate::engine::EngineError;
use crate::fingerprint::Fingerprint;
use crate::flags::AccessFlags;
use crate::version::Scenario;

/// An in-memory trace, collected while a build runs and replayed through the
/// post-build pass before it is persisted. Command ids are engine ids.
#[derive(Debug, Default)]
pub struct TraceBuffer {
  records: Vec<Record>,
}

impl TraceBuffer {
  pub fn records(&self) -> &[Record] {
    &self.records
  }

  pub fn into_records(self) -> Vec<Record> {
    self.records
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  fn push(&mut self, record: Record) -> Result<(), EngineError> {
    self.records.push(record);
    Ok(())
  }
}

impl TraceSink for TraceBuffer {
  fn define_command(&mut self, id: CommandId, def: &CommandDef) -> Result<(), EngineError> {
    self.push(Record::Command {
      id: id.0,
      def: def.clone(),
    })
  }

  fn special_ref(&mut self, c: CommandId, entity: SpecialEntity, output: RefId) -> Result<(), EngineError> {
    self.push(Record::SpecialRef {
      cmd: c.0,
      entity,
      output,
    })
  }

  fn pipe_ref(&mut self, c: CommandId, read_end: RefId, write_end: RefId) -> Result<(), EngineError> {
    self.push(Record::PipeRef {
      cmd: c.0,
      read_end,
      write_end,
    })
  }

  fn file_ref(&mut self, c: CommandId, mode: u32, output: RefId) -> Result<(), EngineError> {
    self.push(Record::FileRef { cmd: c.0, mode, output })
  }

  fn symlink_ref(&mut self, c: CommandId, target: &Path, output: RefId) -> Result<(), EngineError> {
    self.push(Record::SymlinkRef {
      cmd: c.0,
      target: target.to_path_buf(),
      output,
    })
  }

  fn dir_ref(&mut self, c: CommandId, mode: u32, output: RefId) -> Result<(), EngineError> {
    self.push(Record::DirRef { cmd: c.0, mode, output })
  }

  fn path_ref(
    &mut self,
    c: CommandId,
    base: RefId,
    path: &Path,
    flags: AccessFlags,
    output: RefId,
  ) -> Result<(), EngineError> {
    self.push(Record::PathRef {
      cmd: c.0,
      base,
      path: path.to_path_buf(),
      flags,
      output,
    })
  }

  fn using_ref(&mut self, c: CommandId, r: RefId) -> Result<(), EngineError> {
    self.push(Record::UsingRef { cmd: c.0, r })
  }

  fn done_with_ref(&mut self, c: CommandId, r: RefId) -> Result<(), EngineError> {
    self.push(Record::DoneWithRef { cmd: c.0, r })
  }

  fn compare_refs(&mut self, c: CommandId, r1: RefId, r2: RefId, outcome: RefOutcome) -> Result<(), EngineError> {
    self.push(Record::CompareRefs {
      cmd: c.0,
      r1,
      r2,
      outcome,
    })
  }

  fn expect_result(
    &mut self,
    c: CommandId,
    scenario: Scenario,
    r: RefId,
    expected: i32,
  ) -> Result<(), EngineError> {
    self.push(Record::ExpectResult {
      cmd: c.0,
      scenario,
      r,
      expected,
    })
  }

  fn match_metadata(
    &mut self,
    c: CommandId,
    scenario: Scenario,
    r: RefId,
    version: &MetadataData,
  ) -> Result<(), EngineError> {
    self.push(Record::MatchMetadata {
      cmd: c.0,
      scenario,
      r,
      version: *version,
    })
  }

  fn match_content(
    &mut self,
    c: CommandId,
    scenario: Scenario,
    r: RefId,
    version: &ContentData,
  ) -> Result<(), EngineError> {
    self.push(Record::MatchContent {
      cmd: c.0,
      scenario,
      r,
      version: version.clone(),
    })
  }

  fn update_metadata(&mut self, c: CommandId, r: RefId, version: &MetadataData) -> Result<(), EngineError> {
    self.push(Record::UpdateMetadata {
      cmd: c.0,
      r,
      version: *version,
    })
  }

  fn update_content(&mut self, c: CommandId, r: RefId, version: &ContentData) -> Result<(), EngineError> {
    self.push(Record::UpdateContent {
      cmd: c.0,
      r,
      version: version.clone(),
    })
  }

  fn add_entry(&mut self, c: CommandId, dir: RefId, name: &str, target: RefId) -> Result<(), EngineError> {
    self.push(Record::AddEntry {
      cmd: c.0,
      dir,
      name: name.to_string(),
      target,
    })
  }

  fn remove_entry(&mut self, c: CommandId, dir: RefId, name: &str, target: RefId) -> Result<(), EngineError> {
    self.push(Record::RemoveEntry {
      cmd: c.0,
      dir,
      name: name.to_string(),
      target,
    })
  }

  fn launch(
    &mut self,
    c: CommandId,
    child: CommandId,
    refs: &[(RefId, RefId)],
    _def: &CommandDef,
  ) -> Result<(), EngineError> {
    self.push(Record::Launch {
      cmd: c.0,
      child: child.0,
      refs: refs.to_vec(),
    })
  }

  fn join(&mut self, c: CommandId, child: CommandId, exit_status: i32) -> Result<(), EngineError> {
    self.push(Record::Join {
      cmd: c.0,
      child: child.0,
      exit_status,
    })
  }

  fn exit(&mut self, c: CommandId, exit_status: i32) -> Result<(), EngineError> {
    self.push(Record::Exit {
      cmd: c.0,
      exit_status,
    })
  }

  fn finish(&mut self) -> Result<(), EngineError> {
    self.push(Record::End)
  }
}

/// Writes the binary trace file.
///
/// Records stream to a temporary file; `finish` writes the end record and
/// renames it over the final path, so an interrupted build leaves the prior
/// trace intact. Command ids are reassigned canonically in first-mention
/// order.
pub struct OutputTrace {
  writer: BufWriter<File>,
  temp_path: PathBuf,
  final_path: PathBuf,
  ids: HashMap<CommandId, u32>,
  referenced: HashSet<Fingerprint>,
  finished: bool,
}

impl OutputTrace {
  pub fn create(temp_path: PathBuf, final_path: PathBuf) -> Result<Self, EngineError> {
    if let Some(parent) = temp_path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let mut writer = BufWriter::new(File::create(&temp_path)?);
    writer.write_all(&TRACE_MAGIC.to_le_bytes())?;
    writer.write_all(&TRACE_VERSION.to_le_bytes())?;

    Ok(OutputTrace {
      writer,
      temp_path,
      final_path,
      ids: HashMap::new(),
      referenced: HashSet::new(),
      finished: false,
    })
  }

  /// File hashes referenced by the written trace; the cache keeps these.
  pub fn referenced(&self) -> &HashSet<Fingerprint> {
    &self.referenced
  }

  fn id_of(&mut self, c: CommandId) -> u32 {
    let next = self.ids.len() as u32;
    *self.ids.entry(c).or_insert(next)
  }

  fn write(&mut self, record: &Record) -> Result<(), EngineError> {
    bincode::serialize_into(&mut self.writer, record)
      .map_err(|e| EngineError::Io(std::io::Error::other(e)))
  }

  fn write_step(&mut self, c: CommandId, build: impl FnOnce(u32) -> Record) -> Result<(), EngineError> {
    let cmd = self.id_of(c);
    self.write(&build(cmd))
  }
}

impl TraceSink for OutputTrace {
  fn define_command(&mut self, id: CommandId, def: &CommandDef) -> Result<(), EngineError> {
    let canonical = self.id_of(id);
    self.write(&Record::Command {
      id: canonical,
      def: def.clone(),
    })
  }

  fn special_ref(&mut self, c: CommandId, entity: SpecialEntity, output: RefId) -> Result<(), EngineError> {
    self.write_step(c, |cmd| Record::SpecialRef { cmd, entity, output })
  }

  fn pipe_ref(&mut self, c: CommandId, read_end: RefId, write_end: RefId) -> Result<(), EngineError> {
    self.write_step(c, |cmd| Record::PipeRef {
      cmd,
      read_end,
      write_end,
    })
  }

  fn file_ref(&mut self, c: CommandId, mode: u32, output: RefId) -> Result<(), EngineError> {
    self.write_step(c, |cmd| Record::FileRef { cmd, mode, output })
  }

  fn symlink_ref(&mut self, c: CommandId, target: &Path, output: RefId) -> Result<(), EngineError> {
    let target = target.to_path_buf();
    self.write_step(c, |cmd| Record::SymlinkRef { cmd, target, output })
  }

  fn dir_ref(&mut self, c: CommandId, mode: u32, output: RefId) -> Result<(), EngineError> {
    self.write_step(c, |cmd| Record::DirRef { cmd, mode, output })
  }

  fn path_ref(
    &mut self,
    c: CommandId,
    base: RefId,
    path: &Path,
    flags: AccessFlags,
    output: RefId,
  ) -> Result<(), EngineError> {
    let path = path.to_path_buf();
    self.write_step(c, |cmd| Record::PathRef {
      cmd,
      base,
      path,
      flags,
      output,
    })
  }

  fn using_ref(&mut self, c: CommandId, r: RefId) -> Result<(), EngineError> {
    self.write_step(c, |cmd| Record::UsingRef { cmd, r })
  }

  fn done_with_ref(&mut self, c: CommandId, r: RefId) -> Result<(), EngineError> {
    self.write_step(c, |cmd| Record::DoneWithRef { cmd, r })
  }

  fn compare_refs(&mut self, c: CommandId, r1: RefId, r2: RefId, outcome: RefOutcome) -> Result<(), EngineError> {
    self.write_step(c, |cmd| Record::CompareRefs { cmd, r1, r2, outcome })
  }

  fn expect_result(
    &mut self,
    c: CommandId,
    scenario: Scenario,
    r: RefId,
    expected: i32,
  ) -> Result<(), EngineError> {
    self.write_step(c, |cmd| Record::ExpectResult {
      cmd,
      scenario,
      r,
      expected,
    })
  }

  fn match_metadata(
    &mut self,
    c: CommandId,
    scenario: Scenario,
    r: RefId,
    version: &MetadataData,
  ) -> Result<(), EngineError> {
    let version = *version;
    self.write_step(c, |cmd| Record::MatchMetadata {
      cmd,
      scenario,
      r,
      version,
    })
  }

  fn match_content(
    &mut self,
    c: CommandId,
    scenario: Scenario,
    r: RefId,
    version: &ContentData,
  ) -> Result<(), EngineError> {
    if let Some(hash) = version.cache_reference() {
      self.referenced.insert(hash);
    }
    let version = version.clone();
    self.write_step(c, |cmd| Record::MatchContent {
      cmd,
      scenario,
      r,
      version,
    })
  }

  fn update_metadata(&mut self, c: CommandId, r: RefId, version: &MetadataData) -> Result<(), EngineError> {
    let version = *version;
    self.write_step(c, |cmd| Record::UpdateMetadata { cmd, r, version })
  }

  fn update_content(&mut self, c: CommandId, r: RefId, version: &ContentData) -> Result<(), EngineError> {
    if let Some(hash) = version.cache_reference() {
      self.referenced.insert(hash);
    }
    let version = version.clone();
    self.write_step(c, |cmd| Record::UpdateContent { cmd, r, version })
  }

  fn add_entry(&mut self, c: CommandId, dir: RefId, name: &str, target: RefId) -> Result<(), EngineError> {
    let name = name.to_string();
    self.write_step(c, |cmd| Record::AddEntry {
      cmd,
      dir,
      name,
      target,
    })
  }

  fn remove_entry(&mut self, c: CommandId, dir: RefId, name: &str, target: RefId) -> Result<(), EngineError> {
    let name = name.to_string();
    self.write_step(c, |cmd| Record::RemoveEntry {
      cmd,
      dir,
      name,
      target,
    })
  }

  fn launch(
    &mut self,
    c: CommandId,
    child: CommandId,
    refs: &[(RefId, RefId)],
    _def: &CommandDef,
  ) -> Result<(), EngineError> {
    let cmd = self.id_of(c);
    let child = self.id_of(child);
    self.write(&Record::Launch {
      cmd,
      child,
      refs: refs.to_vec(),
    })
  }

  fn join(&mut self, c: CommandId, child: CommandId, exit_status: i32) -> Result<(), EngineError> {
    let cmd = self.id_of(c);
    let child = self.id_of(child);
    self.write(&Record::Join {
      cmd,
      child,
      exit_status,
    })
  }

  fn exit(&mut self, c: CommandId, exit_status: i32) -> Result<(), EngineError> {
    self.write_step(c, |cmd| Record::Exit { cmd, exit_status })
  }

  fn finish(&mut self) -> Result<(), EngineError> {
    if self.finished {
      return Ok(());
    }

    self.write(&Record::End)?;
    self.writer.flush()?;
    self.writer.get_ref().sync_all()?;

    std::fs::rename(&self.temp_path, &self.final_path)?;
    self.finished = true;

    debug!(path = %self.final_path.display(), commands = self.ids.len(), "trace written");
    Ok(())
  }
}
