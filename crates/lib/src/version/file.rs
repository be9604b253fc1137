//! File content versions.

use std::cell::Cell;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CommitError, VersionState};
use crate::fingerprint::{self, Fingerprint};

/// Modification time at nanosecond resolution.
///
/// Equal mtimes short-circuit content comparison; when they differ the
/// BLAKE3 hashes decide, so a `touch` without a content change still matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mtime {
  pub secs: i64,
  pub nanos: u32,
}

#[derive(Debug)]
pub struct FileVersion {
  pub state: VersionState,
  empty: bool,
  cached: Cell<bool>,
  mtime: Cell<Option<Mtime>>,
  hash: Cell<Option<Fingerprint>>,
}

impl FileVersion {
  /// A zero-length file, as produced by O_TRUNC or creation.
  pub fn empty() -> Self {
    FileVersion {
      state: VersionState::default(),
      empty: true,
      cached: Cell::new(false),
      mtime: Cell::new(None),
      hash: Cell::new(None),
    }
  }

  /// An opaque write; fingerprinted later if another command depends on it.
  pub fn written() -> Self {
    FileVersion {
      state: VersionState::default(),
      empty: false,
      cached: Cell::new(false),
      mtime: Cell::new(None),
      hash: Cell::new(None),
    }
  }

  /// The file as found on disk; starts out committed with its stat mtime.
  pub fn from_disk(meta: &std::fs::Metadata) -> Self {
    FileVersion {
      state: VersionState::committed(),
      empty: meta.len() == 0,
      cached: Cell::new(false),
      mtime: Cell::new(Some(Mtime {
        secs: meta.mtime(),
        nanos: meta.mtime_nsec() as u32,
      })),
      hash: Cell::new(None),
    }
  }

  /// Rebuild a version from its persisted fields.
  pub fn from_parts(empty: bool, cached: bool, mtime: Option<Mtime>, hash: Option<Fingerprint>) -> Self {
    FileVersion {
      state: VersionState::default(),
      empty,
      cached: Cell::new(cached),
      mtime: Cell::new(mtime),
      hash: Cell::new(hash),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.empty
  }

  pub fn is_cached(&self) -> bool {
    self.cached.get()
  }

  pub fn set_cached(&self) {
    self.cached.set(true);
  }

  pub fn mtime(&self) -> Option<Mtime> {
    self.mtime.get()
  }

  pub fn hash(&self) -> Option<Fingerprint> {
    self.hash.get()
  }

  pub fn has_fingerprint(&self) -> bool {
    self.hash.get().is_some() || self.empty
  }

  /// Save this version's identifying data from the file at `path`.
  pub fn fingerprint(&self, path: &Path) -> io::Result<()> {
    let meta = std::fs::metadata(path)?;
    self.mtime.set(Some(Mtime {
      secs: meta.mtime(),
      nanos: meta.mtime_nsec() as u32,
    }));
    self.hash.set(Some(fingerprint::hash_file(path)?));
    Ok(())
  }

  /// Compare in identifying fields: equal mtimes match without hashing,
  /// otherwise both hashes must be present and equal.
  pub fn matches(&self, other: &FileVersion) -> bool {
    if self.empty && other.empty {
      return true;
    }

    if let (Some(a), Some(b)) = (self.mtime.get(), other.mtime.get()) {
      if a == b {
        return true;
      }
    }

    match (self.hash.get(), other.hash.get()) {
      (Some(a), Some(b)) => a == b,
      _ => false,
    }
  }

  /// Can this version be reified on disk?
  pub fn can_commit(&self) -> bool {
    self.state.is_committed() || self.empty || (self.is_cached() && self.hash().is_some())
  }

  /// Reify this version at `path`: a no-op if already on disk, an empty file
  /// for empty versions, a copy out of the content cache otherwise.
  pub fn commit(&self, path: &Path) -> Result<(), CommitError> {
    if self.state.is_committed() {
      return Ok(());
    }

    if self.empty {
      OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
      self.state.set_committed(true);
      return Ok(());
    }

    if let Some(hash) = self.hash() {
      if self.is_cached() && crate::cache::stage(&hash, path)? {
        debug!(path = %path.display(), hash = %hash, "staged file from cache");
        self.state.set_committed(true);
        return Ok(());
      }
    }

    Err(CommitError::Uncommittable)
  }

  /// Store a copy of the file at `path` in the staging cache.
  pub fn cache(&self, path: &Path) -> io::Result<()> {
    if self.hash().is_none() {
      self.fingerprint(path)?;
    }
    if let Some(hash) = self.hash() {
      crate::cache::save(path, &hash)?;
      self.cached.set(true);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn empty_versions_match() {
    assert!(FileVersion::empty().matches(&FileVersion::empty()));
  }

  #[test]
  fn equal_mtimes_match_without_hashes() {
    let mtime = Some(Mtime { secs: 10, nanos: 5 });
    let a = FileVersion::from_parts(false, false, mtime, None);
    let b = FileVersion::from_parts(false, false, mtime, None);
    assert!(a.matches(&b));
  }

  #[test]
  fn differing_mtimes_fall_back_to_hashes() {
    let hash = Some(crate::fingerprint::hash_bytes(b"same"));
    let a = FileVersion::from_parts(false, false, Some(Mtime { secs: 1, nanos: 0 }), hash);
    let b = FileVersion::from_parts(false, false, Some(Mtime { secs: 2, nanos: 0 }), hash);
    assert!(a.matches(&b));

    let c = FileVersion::from_parts(
      false,
      false,
      Some(Mtime { secs: 2, nanos: 0 }),
      Some(crate::fingerprint::hash_bytes(b"other")),
    );
    assert!(!a.matches(&c));
  }

  #[test]
  fn opaque_versions_do_not_match() {
    let a = FileVersion::written();
    let b = FileVersion::written();
    assert!(!a.matches(&b));
  }

  #[test]
  fn fingerprint_reads_disk_state() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("f");
    std::fs::write(&path, b"content").unwrap();

    let v = FileVersion::written();
    v.fingerprint(&path).unwrap();
    assert_eq!(v.hash(), Some(crate::fingerprint::hash_bytes(b"content")));
    assert!(v.mtime().is_some());
  }

  #[test]
  fn empty_version_commits_as_empty_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("out");

    let v = FileVersion::empty();
    v.commit(&path).unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    assert!(v.state.is_committed());
  }

  #[test]
  fn opaque_version_is_uncommittable() {
    let temp = TempDir::new().unwrap();
    let v = FileVersion::written();
    assert!(!v.can_commit());
    assert!(matches!(
      v.commit(&temp.path().join("out")),
      Err(CommitError::Uncommittable)
    ));
  }
}
