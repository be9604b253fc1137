//! Build directory locking.
//!
//! `build` and `gc` take an exclusive flock on `.retrace/lock` so two
//! retrace processes cannot interleave trace and cache writes; `check` takes
//! a shared lock.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rustix::fs::{flock, FlockOperation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::platform::paths::{build_dir, lock_path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
  pub pid: u32,
  pub started_at_unix: u64,
  pub command: String,
}

#[derive(Debug, Error)]
pub enum StoreLockError {
  #[error(
    "build directory is locked by another retrace process: {command} (PID {pid})\n\
     If no retrace process is running, remove the lock file: {lock_path}"
  )]
  Contention {
    command: String,
    pid: u32,
    lock_path: PathBuf,
  },

  #[error(
    "build directory is locked (could not read lock metadata)\n\
     If no retrace process is running, remove the lock file: {lock_path}"
  )]
  ContentionUnknown { lock_path: PathBuf },

  #[error("failed to create build directory: {0}")]
  CreateDir(#[source] io::Error),

  #[error("failed to open lock file: {0}")]
  OpenFile(#[source] io::Error),

  #[error("failed to write lock metadata: {0}")]
  WriteMetadata(#[source] io::Error),

  #[error("failed to acquire lock: {0}")]
  LockFailed(#[source] io::Error),
}

pub struct StoreLock {
  _file: File,
  lock_path: PathBuf,
}

impl StoreLock {
  pub fn acquire(mode: LockMode, command: &str) -> Result<Self, StoreLockError> {
    let dir = build_dir();
    let lock_path = lock_path();

    if !dir.exists() {
      std::fs::create_dir_all(&dir).map_err(StoreLockError::CreateDir)?;
    }

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(StoreLockError::OpenFile)?;

    if let Err(err) = try_lock(&file, mode) {
      if err.kind() == io::ErrorKind::WouldBlock {
        return Err(Self::read_contention_error(&lock_path));
      }
      return Err(StoreLockError::LockFailed(err));
    }

    if mode == LockMode::Exclusive {
      Self::write_metadata(&file, command)?;
    }

    Ok(StoreLock { _file: file, lock_path })
  }

  fn write_metadata(file: &File, command: &str) -> Result<(), StoreLockError> {
    let metadata = LockMetadata {
      pid: std::process::id(),
      started_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
      command: command.to_string(),
    };

    file.set_len(0).map_err(StoreLockError::WriteMetadata)?;
    let mut writer = io::BufWriter::new(file);
    serde_json::to_writer(&mut writer, &metadata)
      .map_err(|e| StoreLockError::WriteMetadata(io::Error::other(e)))?;
    writer.flush().map_err(StoreLockError::WriteMetadata)?;

    Ok(())
  }

  fn read_contention_error(lock_path: &Path) -> StoreLockError {
    if let Ok(mut file) = File::open(lock_path) {
      let mut contents = String::new();
      if file.read_to_string(&mut contents).is_ok() {
        if let Ok(metadata) = serde_json::from_str::<LockMetadata>(&contents) {
          return StoreLockError::Contention {
            command: metadata.command,
            pid: metadata.pid,
            lock_path: lock_path.to_path_buf(),
          };
        }
      }
    }

    StoreLockError::ContentionUnknown {
      lock_path: lock_path.to_path_buf(),
    }
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }
}

fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use std::os::unix::io::AsFd;

  let operation = match mode {
    LockMode::Shared => FlockOperation::NonBlockingLockShared,
    LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
  };

  flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;
  use tempfile::TempDir;

  fn with_temp_build_dir<F: FnOnce()>(f: F) {
    let temp = TempDir::new().unwrap();
    temp_env::with_var("RETRACE_DIR", Some(temp.path().to_str().unwrap()), f);
  }

  #[test]
  #[serial]
  fn acquire_exclusive_lock() {
    with_temp_build_dir(|| {
      let lock = StoreLock::acquire(LockMode::Exclusive, "build").unwrap();
      assert!(lock.lock_path().exists());
    });
  }

  #[test]
  #[serial]
  fn shared_locks_coexist() {
    with_temp_build_dir(|| {
      let _a = StoreLock::acquire(LockMode::Shared, "check").unwrap();
      let _b = StoreLock::acquire(LockMode::Shared, "check").unwrap();
    });
  }

  #[test]
  #[serial]
  fn lock_released_on_drop() {
    with_temp_build_dir(|| {
      {
        let _lock = StoreLock::acquire(LockMode::Exclusive, "build").unwrap();
      }
      let again = StoreLock::acquire(LockMode::Exclusive, "build").unwrap();
      assert!(again.lock_path().exists());
    });
  }
}
