//! Access flags attached to references.
//!
//! Mirrors the subset of `open(2)` flags the resolver interprets, plus the
//! creation mode. Recorded in the trace so a later build resolves each
//! reference exactly the way the original syscall did.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessFlags {
  pub read: bool,
  pub write: bool,
  pub exec: bool,

  /// O_CREAT: create the final component if it does not exist.
  pub create: bool,

  /// O_EXCL: with `create`, fail if the final component exists.
  pub exclusive: bool,

  /// O_TRUNC: truncate an existing file on open for writing.
  pub truncate: bool,

  /// O_NOFOLLOW: do not follow a symlink at the final component.
  pub nofollow: bool,

  /// O_DIRECTORY: require the final component to be a directory.
  pub directory: bool,

  /// Creation mode bits, before the process umask is applied.
  pub mode: u32,
}

impl AccessFlags {
  pub fn read_only() -> Self {
    AccessFlags {
      read: true,
      ..Default::default()
    }
  }

  pub fn write_only() -> Self {
    AccessFlags {
      write: true,
      ..Default::default()
    }
  }

  pub fn read_write() -> Self {
    AccessFlags {
      read: true,
      write: true,
      ..Default::default()
    }
  }

  pub fn read_exec() -> Self {
    AccessFlags {
      read: true,
      exec: true,
      ..Default::default()
    }
  }

  /// Decode a raw `open(2)` flag word as delivered by a tracing backend.
  pub fn from_open_flags(flags: i32, mode: u32) -> Self {
    const O_WRONLY: i32 = 0o1;
    const O_RDWR: i32 = 0o2;
    const O_CREAT: i32 = 0o100;
    const O_EXCL: i32 = 0o200;
    const O_TRUNC: i32 = 0o1000;
    const O_NOFOLLOW: i32 = 0o400000;
    const O_DIRECTORY: i32 = 0o200000;

    let writable = flags & O_WRONLY != 0 || flags & O_RDWR != 0;
    let readable = flags & O_WRONLY == 0;

    AccessFlags {
      read: readable,
      write: writable,
      exec: false,
      create: flags & O_CREAT != 0,
      exclusive: flags & O_EXCL != 0,
      truncate: flags & O_TRUNC != 0,
      nofollow: flags & O_NOFOLLOW != 0,
      directory: flags & O_DIRECTORY != 0,
      mode,
    }
  }
}
