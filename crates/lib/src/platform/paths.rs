//! Build directory layout.
//!
//! Everything retrace persists lives under `.retrace/` next to the build.
//! `RETRACE_DIR` overrides the location, which tests rely on.

use std::path::PathBuf;

use crate::consts::{
  BUILD_DIR, CACHE_DIR, LOCK_FILENAME, NEW_CACHE_DIR, TRACE_FILENAME, TRACE_TEMP_FILENAME,
};

/// The build state directory.
pub fn build_dir() -> PathBuf {
  std::env::var("RETRACE_DIR")
    .map(PathBuf::from)
    .unwrap_or_else(|_| PathBuf::from(BUILD_DIR))
}

/// The persisted trace.
pub fn trace_path() -> PathBuf {
  build_dir().join(TRACE_FILENAME)
}

/// The in-progress trace, renamed over [`trace_path`] on a successful finish.
pub fn trace_temp_path() -> PathBuf {
  build_dir().join(TRACE_TEMP_FILENAME)
}

/// The committed content cache.
pub fn cache_dir() -> PathBuf {
  build_dir().join(CACHE_DIR)
}

/// The staging cache for the build in progress.
pub fn new_cache_dir() -> PathBuf {
  build_dir().join(NEW_CACHE_DIR)
}

/// The lock file guarding the build directory.
pub fn lock_path() -> PathBuf {
  build_dir().join(LOCK_FILENAME)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  #[serial]
  fn env_override_takes_precedence() {
    temp_env::with_var("RETRACE_DIR", Some("/tmp/custom"), || {
      assert_eq!(build_dir(), PathBuf::from("/tmp/custom"));
      assert_eq!(trace_path(), PathBuf::from("/tmp/custom/trace"));
    });
  }

  #[test]
  #[serial]
  fn defaults_to_local_dir() {
    temp_env::with_var("RETRACE_DIR", None::<&str>, || {
      assert_eq!(build_dir(), PathBuf::from(".retrace"));
      assert_eq!(cache_dir(), PathBuf::from(".retrace/cache"));
    });
  }
}
