//! Symlink target versions.

use std::io;
use std::path::{Path, PathBuf};

use super::{CommitError, VersionState};

#[derive(Debug)]
pub struct SymlinkVersion {
  pub state: VersionState,
  target: PathBuf,
}

impl SymlinkVersion {
  pub fn new(target: PathBuf) -> Self {
    SymlinkVersion {
      state: VersionState::default(),
      target,
    }
  }

  /// The link as found on disk; starts out committed.
  pub fn from_disk(target: PathBuf) -> Self {
    SymlinkVersion {
      state: VersionState::committed(),
      target,
    }
  }

  pub fn target(&self) -> &Path {
    &self.target
  }

  pub fn matches(&self, other: &SymlinkVersion) -> bool {
    self.target == other.target
  }

  /// Read the current on-disk target, for final-state checking.
  pub fn read_disk(path: &Path) -> io::Result<PathBuf> {
    std::fs::read_link(path)
  }

  /// Create the symlink at `path`, replacing whatever is there.
  pub fn commit(&self, path: &Path) -> Result<(), CommitError> {
    if self.state.is_committed() {
      return Ok(());
    }

    if path.symlink_metadata().is_ok() {
      std::fs::remove_file(path)?;
    }
    std::os::unix::fs::symlink(&self.target, path)?;
    self.state.set_committed(true);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn matches_compares_targets() {
    let a = SymlinkVersion::new("x".into());
    let b = SymlinkVersion::new("x".into());
    let c = SymlinkVersion::new("y".into());
    assert!(a.matches(&b));
    assert!(!a.matches(&c));
  }

  #[test]
  fn commit_creates_link() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("link");

    let v = SymlinkVersion::new("destination".into());
    v.commit(&path).unwrap();
    assert_eq!(SymlinkVersion::read_disk(&path).unwrap(), PathBuf::from("destination"));
    assert!(v.state.is_committed());
  }

  #[test]
  fn commit_replaces_existing_link() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("link");
    std::os::unix::fs::symlink("old", &path).unwrap();

    let v = SymlinkVersion::new("new".into());
    v.commit(&path).unwrap();
    assert_eq!(SymlinkVersion::read_disk(&path).unwrap(), PathBuf::from("new"));
  }
}
