//! Directory versions: full listings and single-entry patches.

use std::collections::BTreeSet;
use std::path::Path;

use super::{CommitError, VersionState};
use crate::artifact::ArtifactId;

/// A complete directory listing.
///
/// A `baseline` listing models a directory that already existed when the
/// build started; it is a terminal state that can never be re-committed
/// (the directory's true prior contents are unknown to the model). A
/// non-baseline empty listing models a directory the build created, and
/// commits via `mkdir`.
#[derive(Debug)]
pub struct DirListVersion {
  pub state: VersionState,
  entries: BTreeSet<String>,
  baseline: bool,
}

impl DirListVersion {
  pub fn created() -> Self {
    DirListVersion {
      state: VersionState::default(),
      entries: BTreeSet::new(),
      baseline: false,
    }
  }

  pub fn baseline(entries: BTreeSet<String>) -> Self {
    DirListVersion {
      state: VersionState::committed(),
      entries,
      baseline: true,
    }
  }

  pub fn listing(entries: BTreeSet<String>) -> Self {
    DirListVersion {
      state: VersionState::default(),
      entries,
      baseline: false,
    }
  }

  pub fn entries(&self) -> &BTreeSet<String> {
    &self.entries
  }

  pub fn is_baseline(&self) -> bool {
    self.baseline
  }

  pub fn contains(&self, name: &str) -> bool {
    self.entries.contains(name)
  }

  pub fn matches(&self, other: &DirListVersion) -> bool {
    self.entries == other.entries
  }

  pub fn can_commit(&self) -> bool {
    self.state.is_committed() || (!self.baseline && self.entries.is_empty())
  }

  pub fn commit(&self, path: &Path) -> Result<(), CommitError> {
    if self.state.is_committed() {
      return Ok(());
    }

    // A baseline is the pre-existing state of the filesystem; nothing can
    // recreate it. A non-empty created listing is reified entry by entry,
    // never wholesale.
    if self.baseline || !self.entries.is_empty() {
      return Err(CommitError::Uncommittable);
    }

    std::fs::create_dir(path)?;
    self.state.set_committed(true);
    Ok(())
  }
}

/// Whether a directory entry patch links or unlinks a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryAction {
  Link,
  Unlink,
}

/// A single `{name -> artifact}` patch applied to a directory.
#[derive(Debug)]
pub struct DirEntryVersion {
  pub state: VersionState,
  pub name: String,
  pub target: ArtifactId,
  pub action: EntryAction,
}

impl DirEntryVersion {
  pub fn link(name: String, target: ArtifactId) -> Self {
    DirEntryVersion {
      state: VersionState::default(),
      name,
      target,
      action: EntryAction::Link,
    }
  }

  pub fn unlink(name: String, target: ArtifactId) -> Self {
    DirEntryVersion {
      state: VersionState::default(),
      name,
      target,
      action: EntryAction::Unlink,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn created_dir_commits_via_mkdir() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("subdir");

    let v = DirListVersion::created();
    v.commit(&path).unwrap();
    assert!(path.is_dir());
  }

  #[test]
  fn baseline_is_uncommittable() {
    let temp = TempDir::new().unwrap();
    let v = DirListVersion::baseline(BTreeSet::new());
    // A baseline starts committed, so commit is a no-op; strip the flag to
    // model an attempted re-commit.
    v.state.set_committed(false);
    assert!(matches!(
      v.commit(&temp.path().join("d")),
      Err(CommitError::Uncommittable)
    ));
  }

  #[test]
  fn listings_match_on_entries() {
    let mut names = BTreeSet::new();
    names.insert("a".to_string());

    let a = DirListVersion::listing(names.clone());
    let b = DirListVersion::listing(names);
    let c = DirListVersion::listing(BTreeSet::new());
    assert!(a.matches(&b));
    assert!(!a.matches(&c));
  }
}
