//! Loading traces from disk, and the default trace used without one.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use tracing::{debug, info};

use super::record::Record;
use super::{replay, TraceError, TraceSink};
use crate::artifact::SpecialEntity;
use crate::command::{CommandDef, RefId};
use crate::consts::{BUILD_FILE, TRACE_MAGIC, TRACE_VERSION};
use crate::engine::EngineError;

/// A loaded (or synthesized) trace, ready to replay into a sink.
pub struct InputTrace {
  records: Vec<Record>,
}

impl InputTrace {
  /// Open and validate a trace file. Any failure means "no usable trace".
  pub fn load(path: &Path) -> Result<Self, TraceError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut word = [0u8; 8];
    reader.read_exact(&mut word)?;
    let magic = u64::from_le_bytes(word);
    if magic != TRACE_MAGIC {
      return Err(TraceError::BadMagic { found: magic });
    }

    reader.read_exact(&mut word)?;
    let version = u64::from_le_bytes(word);
    if version != TRACE_VERSION {
      return Err(TraceError::UnsupportedVersion { found: version });
    }

    let mut records = Vec::new();
    loop {
      let record: Record = bincode::deserialize_from(&mut reader)?;
      let end = record == Record::End;
      records.push(record);
      if end {
        break;
      }
    }

    debug!(path = %path.display(), records = records.len(), "loaded trace");
    Ok(InputTrace { records })
  }

  /// Load the trace at `path`, or synthesize the default trace when the file
  /// is missing or unusable.
  pub fn load_or_default(path: &Path) -> Self {
    match Self::load(path) {
      Ok(trace) => trace,
      Err(error) => {
        info!(path = %path.display(), %error, "no usable trace, planning a full build");
        Self::default_trace()
      }
    }
  }

  /// Construct a trace directly from records, for tests and tools.
  pub fn from_records(records: Vec<Record>) -> Self {
    InputTrace { records }
  }

  /// The trace a build starts from when none exists: a virtual root that
  /// opens the standard streams and launches the build command, which has
  /// never run.
  pub fn default_trace() -> Self {
    let root_def = CommandDef {
      args: Vec::new(),
      exe: RefId(5),
      cwd: RefId(4),
      root: RefId(3),
      initial_fds: BTreeMap::from([(0, RefId(0)), (1, RefId(1)), (2, RefId(2))]),
      executed: true,
    };

    let build_def = CommandDef {
      args: vec!["sh".to_string(), BUILD_FILE.to_string()],
      exe: RefId(0),
      cwd: RefId(1),
      root: RefId(2),
      initial_fds: BTreeMap::from([(0, RefId(3)), (1, RefId(4)), (2, RefId(5))]),
      executed: false,
    };

    let records = vec![
      Record::Command { id: 0, def: root_def },
      Record::SpecialRef {
        cmd: 0,
        entity: SpecialEntity::Stdin,
        output: RefId(0),
      },
      Record::SpecialRef {
        cmd: 0,
        entity: SpecialEntity::Stdout,
        output: RefId(1),
      },
      Record::SpecialRef {
        cmd: 0,
        entity: SpecialEntity::Stderr,
        output: RefId(2),
      },
      Record::SpecialRef {
        cmd: 0,
        entity: SpecialEntity::Root,
        output: RefId(3),
      },
      Record::SpecialRef {
        cmd: 0,
        entity: SpecialEntity::Cwd,
        output: RefId(4),
      },
      Record::SpecialRef {
        cmd: 0,
        entity: SpecialEntity::LaunchExe,
        output: RefId(5),
      },
      Record::UsingRef { cmd: 0, r: RefId(0) },
      Record::UsingRef { cmd: 0, r: RefId(1) },
      Record::UsingRef { cmd: 0, r: RefId(2) },
      Record::Command { id: 1, def: build_def },
      Record::Launch {
        cmd: 0,
        child: 1,
        refs: vec![
          (RefId(5), RefId(0)),
          (RefId(4), RefId(1)),
          (RefId(3), RefId(2)),
          (RefId(0), RefId(3)),
          (RefId(1), RefId(4)),
          (RefId(2), RefId(5)),
        ],
      },
      Record::Join {
        cmd: 0,
        child: 1,
        exit_status: 0,
      },
      Record::Exit { cmd: 0, exit_status: 0 },
      Record::End,
    ];

    InputTrace { records }
  }

  pub fn records(&self) -> &[Record] {
    &self.records
  }

  /// Feed every record to the sink, finishing at the end record.
  pub fn replay(&self, sink: &mut dyn TraceSink) -> Result<(), EngineError> {
    replay(&self.records, sink)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn missing_file_falls_back_to_default() {
    let temp = TempDir::new().unwrap();
    let trace = InputTrace::load_or_default(&temp.path().join("trace"));
    assert!(matches!(trace.records().first(), Some(Record::Command { id: 0, .. })));
  }

  #[test]
  fn bad_magic_is_rejected() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("trace");
    let mut bytes = 0xDEADu64.to_le_bytes().to_vec();
    bytes.extend_from_slice(&TRACE_VERSION.to_le_bytes());
    std::fs::write(&path, bytes).unwrap();

    assert!(matches!(InputTrace::load(&path), Err(TraceError::BadMagic { .. })));
  }

  #[test]
  fn wrong_version_is_rejected() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("trace");
    let mut bytes = TRACE_MAGIC.to_le_bytes().to_vec();
    bytes.extend_from_slice(&99u64.to_le_bytes());
    std::fs::write(&path, bytes).unwrap();

    assert!(matches!(
      InputTrace::load(&path),
      Err(TraceError::UnsupportedVersion { found: 99 })
    ));
  }

  #[test]
  fn header_only_file_is_unusable() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("trace");
    let mut bytes = TRACE_MAGIC.to_le_bytes().to_vec();
    bytes.extend_from_slice(&TRACE_VERSION.to_le_bytes());
    std::fs::write(&path, bytes).unwrap();

    assert!(InputTrace::load(&path).is_err());
  }

  #[test]
  fn default_trace_launches_an_unexecuted_build_command() {
    let trace = InputTrace::default_trace();
    let build = trace.records().iter().find_map(|r| match r {
      Record::Command { id: 1, def } => Some(def.clone()),
      _ => None,
    });

    let build = build.expect("default trace defines the build command");
    assert!(!build.executed);
    assert_eq!(build.args[1], BUILD_FILE);
  }
}
