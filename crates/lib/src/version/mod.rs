//! Versioned snapshots of artifact state.
//!
//! A version captures one facet of an artifact at a point in the build:
//! metadata (owner/group/mode) or content (file bytes, symlink target,
//! directory listing, pipe traffic). Versions are immutable apart from a
//! small shared [`VersionState`]: who created them, whether their state is
//! reified on disk (*committed*), and whether anyone has read them since the
//! last write (consumed by the write-combining filter).

mod dir;
mod file;
mod metadata;
mod pipe;
mod symlink;

pub use dir::{DirEntryVersion, DirListVersion, EntryAction};
pub use file::{FileVersion, Mtime};
pub use metadata::MetadataVersion;
pub use pipe::{PipeCloseVersion, PipeReadVersion, PipeWriteVersion};
pub use symlink::SymlinkVersion;

use std::cell::Cell;
use std::io;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::CommandId;

/// Which build phase a recorded predicate describes.
///
/// `Build` predicates capture what a command observed while it ran;
/// `PostBuild` predicates capture the state left behind when the build
/// finished, and are checked against the pre-build state of the next run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scenario {
  Build,
  PostBuild,
}

/// Errors from committing a version to the filesystem.
#[derive(Debug, Error)]
pub enum CommitError {
  /// The version has no stored content that could be reified on disk.
  #[error("version has no stored content to commit")]
  Uncommittable,

  #[error(transparent)]
  Io(#[from] io::Error),
}

/// Shared mutable bookkeeping attached to every version.
#[derive(Debug, Default)]
pub struct VersionState {
  creator: Cell<Option<CommandId>>,
  committed: Cell<bool>,
  accessed: Cell<bool>,
}

impl VersionState {
  /// State for a version that already matches the on-disk filesystem.
  pub fn committed() -> Self {
    let state = VersionState::default();
    state.committed.set(true);
    state
  }

  pub fn creator(&self) -> Option<CommandId> {
    self.creator.get()
  }

  pub fn created_by(&self, command: CommandId) {
    self.creator.set(Some(command));
  }

  pub fn is_committed(&self) -> bool {
    self.committed.get()
  }

  pub fn set_committed(&self, committed: bool) {
    self.committed.set(committed);
  }

  pub fn is_accessed(&self) -> bool {
    self.accessed.get()
  }

  pub fn mark_accessed(&self) {
    self.accessed.set(true);
  }
}

/// A content-facet version of any artifact kind.
#[derive(Debug, Clone)]
pub enum ContentVersion {
  File(Rc<FileVersion>),
  Symlink(Rc<SymlinkVersion>),
  DirList(Rc<DirListVersion>),
  DirEntry(Rc<DirEntryVersion>),
  PipeWrite(Rc<PipeWriteVersion>),
  PipeClose(Rc<PipeCloseVersion>),
  PipeRead(Rc<PipeReadVersion>),
}

impl ContentVersion {
  pub fn state(&self) -> &VersionState {
    match self {
      ContentVersion::File(v) => &v.state,
      ContentVersion::Symlink(v) => &v.state,
      ContentVersion::DirList(v) => &v.state,
      ContentVersion::DirEntry(v) => &v.state,
      ContentVersion::PipeWrite(v) => &v.state,
      ContentVersion::PipeClose(v) => &v.state,
      ContentVersion::PipeRead(v) => &v.state,
    }
  }

  pub fn kind_name(&self) -> &'static str {
    match self {
      ContentVersion::File(_) => "file content",
      ContentVersion::Symlink(_) => "symlink target",
      ContentVersion::DirList(_) => "directory listing",
      ContentVersion::DirEntry(_) => "directory entry",
      ContentVersion::PipeWrite(_) => "pipe write",
      ContentVersion::PipeClose(_) => "pipe close",
      ContentVersion::PipeRead(_) => "pipe read",
    }
  }

  /// Compare this version to an expected one, in the fields that identify
  /// each kind. Pipe versions carry no persistent state and always match.
  pub fn matches(&self, expected: &ContentVersion) -> bool {
    match (self, expected) {
      (ContentVersion::File(a), ContentVersion::File(b)) => a.matches(b),
      (ContentVersion::Symlink(a), ContentVersion::Symlink(b)) => a.matches(b),
      (ContentVersion::DirList(a), ContentVersion::DirList(b)) => a.matches(b),
      (ContentVersion::DirEntry(a), ContentVersion::DirEntry(b)) => {
        a.name == b.name && a.action == b.action && a.target == b.target
      }
      (ContentVersion::PipeWrite(_), ContentVersion::PipeWrite(_))
      | (ContentVersion::PipeClose(_), ContentVersion::PipeClose(_))
      | (ContentVersion::PipeRead(_), ContentVersion::PipeRead(_)) => true,
      _ => false,
    }
  }

  pub fn is_pipe(&self) -> bool {
    matches!(
      self,
      ContentVersion::PipeWrite(_) | ContentVersion::PipeClose(_) | ContentVersion::PipeRead(_)
    )
  }
}

/// Either facet, as stored in an artifact's version history.
#[derive(Debug, Clone)]
pub enum Version {
  Metadata(Rc<MetadataVersion>),
  Content(ContentVersion),
}

impl Version {
  pub fn state(&self) -> &VersionState {
    match self {
      Version::Metadata(v) => &v.state,
      Version::Content(v) => v.state(),
    }
  }

  pub fn creator(&self) -> Option<CommandId> {
    self.state().creator()
  }

  pub fn is_committed(&self) -> bool {
    self.state().is_committed()
  }

  pub fn is_accessed(&self) -> bool {
    self.state().is_accessed()
  }

  pub fn kind_name(&self) -> &'static str {
    match self {
      Version::Metadata(_) => "metadata",
      Version::Content(v) => v.kind_name(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn state_defaults_uncommitted() {
    let state = VersionState::default();
    assert!(!state.is_committed());
    assert!(!state.is_accessed());
    assert_eq!(state.creator(), None);
  }

  #[test]
  fn committed_state() {
    let state = VersionState::committed();
    assert!(state.is_committed());
  }

  #[test]
  fn pipe_versions_always_match() {
    let a = ContentVersion::PipeWrite(Rc::new(PipeWriteVersion::new(3, None)));
    let b = ContentVersion::PipeWrite(Rc::new(PipeWriteVersion::new(9, None)));
    assert!(a.matches(&b));
  }

  #[test]
  fn cross_kind_never_matches() {
    let file = ContentVersion::File(Rc::new(FileVersion::empty()));
    let link = ContentVersion::Symlink(Rc::new(SymlinkVersion::new("target".into())));
    assert!(!file.matches(&link));
  }
}
