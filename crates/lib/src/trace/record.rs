//! Persisted trace records.
//!
//! The trace file is a tagged object stream: one [`Record`] per IR step,
//! a `Command` record for each command introduced, and a terminal `End`.
//! Version payloads are embedded in their records as [`MetadataData`] and
//! [`ContentData`], which mirror the in-memory version kinds.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::command::{CommandDef, RefId, RefOutcome};
use crate::artifact::SpecialEntity;
use crate::fingerprint::Fingerprint;
use crate::flags::AccessFlags;
use crate::version::{
  ContentVersion, DirListVersion, FileVersion, MetadataVersion, Mtime, PipeCloseVersion,
  PipeReadVersion, PipeWriteVersion, Scenario, SymlinkVersion,
};

/// Serialized form of a metadata version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataData {
  pub uid: u32,
  pub gid: u32,
  pub mode: u32,
}

impl MetadataData {
  pub fn from_version(version: &MetadataVersion) -> Self {
    MetadataData {
      uid: version.uid(),
      gid: version.gid(),
      mode: version.mode(),
    }
  }

  pub fn materialize(&self) -> Rc<MetadataVersion> {
    Rc::new(MetadataVersion::new(self.uid, self.gid, self.mode))
  }
}

/// Serialized form of a content version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ContentData {
  File {
    empty: bool,
    cached: bool,
    mtime: Option<Mtime>,
    hash: Option<Fingerprint>,
  },
  Symlink {
    target: PathBuf,
  },
  DirList {
    entries: BTreeSet<String>,
    baseline: bool,
  },
  PipeWrite {
    len: u64,
    hash: Option<Fingerprint>,
  },
  PipeClose,
  PipeRead {
    writes: u64,
  },
}

impl ContentData {
  /// Serialize a content version. Directory entry patches are carried by
  /// AddEntry/RemoveEntry records, not as version payloads.
  pub fn from_version(version: &ContentVersion) -> Option<Self> {
    match version {
      ContentVersion::File(v) => Some(ContentData::File {
        empty: v.is_empty(),
        cached: v.is_cached(),
        mtime: v.mtime(),
        hash: v.hash(),
      }),
      ContentVersion::Symlink(v) => Some(ContentData::Symlink {
        target: v.target().to_path_buf(),
      }),
      ContentVersion::DirList(v) => Some(ContentData::DirList {
        entries: v.entries().clone(),
        baseline: v.is_baseline(),
      }),
      ContentVersion::DirEntry(_) => None,
      ContentVersion::PipeWrite(v) => Some(ContentData::PipeWrite {
        len: v.len,
        hash: v.hash,
      }),
      ContentVersion::PipeClose(_) => Some(ContentData::PipeClose),
      ContentVersion::PipeRead(v) => Some(ContentData::PipeRead { writes: v.writes }),
    }
  }

  pub fn materialize(&self) -> ContentVersion {
    match self {
      ContentData::File {
        empty,
        cached,
        mtime,
        hash,
      } => ContentVersion::File(Rc::new(FileVersion::from_parts(*empty, *cached, *mtime, *hash))),
      ContentData::Symlink { target } => ContentVersion::Symlink(Rc::new(SymlinkVersion::new(target.clone()))),
      ContentData::DirList { entries, baseline } => {
        let version = if *baseline {
          let v = DirListVersion::baseline(entries.clone());
          // A deserialized baseline is a comparison payload, not disk truth.
          v.state.set_committed(false);
          v
        } else {
          DirListVersion::listing(entries.clone())
        };
        ContentVersion::DirList(Rc::new(version))
      }
      ContentData::PipeWrite { len, hash } => {
        ContentVersion::PipeWrite(Rc::new(PipeWriteVersion::new(*len, *hash)))
      }
      ContentData::PipeClose => ContentVersion::PipeClose(Rc::new(PipeCloseVersion::default())),
      ContentData::PipeRead { writes } => ContentVersion::PipeRead(Rc::new(PipeReadVersion::new(*writes))),
    }
  }

  /// The file hash this payload pins in the cache, if any.
  pub fn cache_reference(&self) -> Option<Fingerprint> {
    match self {
      ContentData::File { hash, .. } => *hash,
      _ => None,
    }
  }
}

/// One element of the persisted trace stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
  Command {
    id: u32,
    def: CommandDef,
  },
  SpecialRef {
    cmd: u32,
    entity: SpecialEntity,
    output: RefId,
  },
  PipeRef {
    cmd: u32,
    read_end: RefId,
    write_end: RefId,
  },
  FileRef {
    cmd: u32,
    mode: u32,
    output: RefId,
  },
  SymlinkRef {
    cmd: u32,
    target: PathBuf,
    output: RefId,
  },
  DirRef {
    cmd: u32,
    mode: u32,
    output: RefId,
  },
  PathRef {
    cmd: u32,
    base: RefId,
    path: PathBuf,
    flags: AccessFlags,
    output: RefId,
  },
  UsingRef {
    cmd: u32,
    r: RefId,
  },
  DoneWithRef {
    cmd: u32,
    r: RefId,
  },
  CompareRefs {
    cmd: u32,
    r1: RefId,
    r2: RefId,
    outcome: RefOutcome,
  },
  ExpectResult {
    cmd: u32,
    scenario: Scenario,
    r: RefId,
    expected: i32,
  },
  MatchMetadata {
    cmd: u32,
    scenario: Scenario,
    r: RefId,
    version: MetadataData,
  },
  MatchContent {
    cmd: u32,
    scenario: Scenario,
    r: RefId,
    version: ContentData,
  },
  UpdateMetadata {
    cmd: u32,
    r: RefId,
    version: MetadataData,
  },
  UpdateContent {
    cmd: u32,
    r: RefId,
    version: ContentData,
  },
  AddEntry {
    cmd: u32,
    dir: RefId,
    name: String,
    target: RefId,
  },
  RemoveEntry {
    cmd: u32,
    dir: RefId,
    name: String,
    target: RefId,
  },
  Launch {
    cmd: u32,
    child: u32,
    refs: Vec<(RefId, RefId)>,
  },
  Join {
    cmd: u32,
    child: u32,
    exit_status: i32,
  },
  Exit {
    cmd: u32,
    exit_status: i32,
  },
  End,
}
