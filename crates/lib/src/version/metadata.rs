//! Artifact metadata versions: owner, group, and mode.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use rustix::fs::Mode;

use super::{CommitError, VersionState};
use crate::flags::AccessFlags;
use crate::platform::TraceeIdentity;

#[derive(Debug)]
pub struct MetadataVersion {
  pub state: VersionState,
  uid: u32,
  gid: u32,
  mode: u32,
}

impl MetadataVersion {
  pub fn new(uid: u32, gid: u32, mode: u32) -> Self {
    MetadataVersion {
      state: VersionState::default(),
      uid,
      gid,
      mode,
    }
  }

  /// Metadata as found on disk; starts out committed.
  pub fn from_disk(meta: &std::fs::Metadata) -> Self {
    MetadataVersion {
      state: VersionState::committed(),
      uid: meta.uid(),
      gid: meta.gid(),
      mode: meta.mode(),
    }
  }

  pub fn uid(&self) -> u32 {
    self.uid
  }

  pub fn gid(&self) -> u32 {
    self.gid
  }

  pub fn mode(&self) -> u32 {
    self.mode
  }

  /// A copy of this version with different permission bits, preserving the
  /// file type bits.
  pub fn chmod(&self, mode: u32) -> Self {
    MetadataVersion::new(self.uid, self.gid, (self.mode & !0o7777) | (mode & 0o7777))
  }

  /// A copy of this version with a different owner and group.
  pub fn chown(&self, uid: u32, gid: u32) -> Self {
    MetadataVersion::new(uid, gid, self.mode)
  }

  /// Comparison over uid, gid, and mode, which covers type and permissions.
  pub fn matches(&self, other: &MetadataVersion) -> bool {
    self.uid == other.uid && self.gid == other.gid && self.mode == other.mode
  }

  /// POSIX owner/group/other permission check against the tracee identity.
  pub fn check_access(&self, flags: &AccessFlags, identity: &TraceeIdentity) -> bool {
    if identity.euid == 0 {
      return true;
    }

    let bits = if identity.euid == self.uid {
      (self.mode >> 6) & 0o7
    } else if identity.egid == self.gid {
      (self.mode >> 3) & 0o7
    } else {
      self.mode & 0o7
    };

    if flags.read && bits & 0o4 == 0 {
      return false;
    }
    if flags.write && bits & 0o2 == 0 {
      return false;
    }
    if flags.exec && bits & 0o1 == 0 {
      return false;
    }

    true
  }

  /// Apply the permission bits to the file at `path`. Ownership changes are
  /// not attempted: an unprivileged tracer cannot chown.
  pub fn commit(&self, path: &Path) -> Result<(), CommitError> {
    if self.state.is_committed() {
      return Ok(());
    }

    let mode = Mode::from_bits_truncate(self.mode & 0o7777);
    rustix::fs::chmod(path, mode).map_err(|e| CommitError::Io(e.into()))?;
    self.state.set_committed(true);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn identity(euid: u32, egid: u32) -> TraceeIdentity {
    TraceeIdentity {
      euid,
      egid,
      umask: 0o022,
    }
  }

  #[test]
  fn matches_compares_all_fields() {
    let a = MetadataVersion::new(1000, 1000, 0o100644);
    let b = MetadataVersion::new(1000, 1000, 0o100644);
    let c = MetadataVersion::new(1000, 1000, 0o100600);
    assert!(a.matches(&b));
    assert!(!a.matches(&c));
  }

  #[test]
  fn owner_bits_apply_to_owner() {
    let v = MetadataVersion::new(1000, 2000, 0o100600);
    assert!(v.check_access(&AccessFlags::read_only(), &identity(1000, 3000)));
    assert!(!v.check_access(&AccessFlags::read_only(), &identity(1001, 3000)));
  }

  #[test]
  fn group_bits_apply_to_group() {
    let v = MetadataVersion::new(1000, 2000, 0o100640);
    assert!(v.check_access(&AccessFlags::read_only(), &identity(1001, 2000)));
    assert!(!v.check_access(&AccessFlags::write_only(), &identity(1001, 2000)));
  }

  #[test]
  fn root_bypasses_checks() {
    let v = MetadataVersion::new(1000, 1000, 0o100000);
    assert!(v.check_access(&AccessFlags::read_write(), &identity(0, 0)));
  }

  #[test]
  fn chmod_preserves_type_bits() {
    let v = MetadataVersion::new(1000, 1000, 0o100644);
    let changed = v.chmod(0o755);
    assert_eq!(changed.mode(), 0o100755);
  }
}
