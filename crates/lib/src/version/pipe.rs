//! Pipe traffic versions.
//!
//! Pipes have no persistent state; these versions exist so the trace records
//! the order and volume of pipe traffic, which ties reader and writer
//! commands together in the dependency graph.

use super::VersionState;
use crate::fingerprint::Fingerprint;

/// One write to a pipe.
#[derive(Debug)]
pub struct PipeWriteVersion {
  pub state: VersionState,
  pub len: u64,
  pub hash: Option<Fingerprint>,
}

impl PipeWriteVersion {
  pub fn new(len: u64, hash: Option<Fingerprint>) -> Self {
    PipeWriteVersion {
      state: VersionState::default(),
      len,
      hash,
    }
  }
}

/// The write end of a pipe was closed.
#[derive(Debug, Default)]
pub struct PipeCloseVersion {
  pub state: VersionState,
}

/// A read observed some prefix of the pipe's writes.
#[derive(Debug)]
pub struct PipeReadVersion {
  pub state: VersionState,
  /// Number of writes consumed so far.
  pub writes: u64,
}

impl PipeReadVersion {
  pub fn new(writes: u64) -> Self {
    PipeReadVersion {
      state: VersionState::default(),
      writes,
    }
  }
}
