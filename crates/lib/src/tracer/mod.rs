//! The boundary to the OS process-tracing mechanism.
//!
//! The engine only knows the [`Tracer`] trait: start a command, wait for it.
//! A syscall-interception backend (ptrace/seccomp) lives behind this trait
//! and feeds its observations through the engine's `trace_*` family between
//! waits. [`ProcessTracer`] is the shipped shim: it launches commands with
//! the prescribed stdio and working directory and reports their exits.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TracerError {
  #[error("failed to launch {exe}: {source}")]
  Spawn {
    exe: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("no executable path for the launched command")]
  MissingExecutable,

  #[error("unknown tracee handle {0:?}")]
  UnknownTracee(TraceeId),

  #[error("failed waiting for a tracee: {0}")]
  Wait(#[source] std::io::Error),

  #[error("emulation-only build tried to launch a process")]
  LaunchUnsupported,
}

/// Handle for one traced process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceeId(pub u32);

/// Everything needed to start a command: derived from the command's
/// executable, argument vector, and working-directory references.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
  pub exe: PathBuf,
  pub args: Vec<String>,
  pub cwd: PathBuf,
}

pub trait Tracer {
  /// Launch a command under tracing.
  fn start(&mut self, spec: LaunchSpec) -> Result<TraceeId, TracerError>;

  /// Block until the given tracee exits; returns its exit status.
  fn wait(&mut self, id: TraceeId) -> Result<i32, TracerError>;

  /// Block until every remaining tracee exits.
  fn wait_all(&mut self) -> Result<Vec<(TraceeId, i32)>, TracerError>;
}

/// A tracer for emulation-only passes; nothing may launch.
#[derive(Debug, Default)]
pub struct NullTracer;

impl Tracer for NullTracer {
  fn start(&mut self, _spec: LaunchSpec) -> Result<TraceeId, TracerError> {
    Err(TracerError::LaunchUnsupported)
  }

  fn wait(&mut self, id: TraceeId) -> Result<i32, TracerError> {
    Err(TracerError::UnknownTracee(id))
  }

  fn wait_all(&mut self) -> Result<Vec<(TraceeId, i32)>, TracerError> {
    Ok(Vec::new())
  }
}

/// Launches commands as ordinary child processes.
#[derive(Debug, Default)]
pub struct ProcessTracer {
  children: HashMap<TraceeId, Child>,
  next: u32,
}

impl ProcessTracer {
  pub fn new() -> Self {
    ProcessTracer::default()
  }

  fn exit_status(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
      .code()
      .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
  }
}

impl Tracer for ProcessTracer {
  fn start(&mut self, spec: LaunchSpec) -> Result<TraceeId, TracerError> {
    debug!(exe = %spec.exe.display(), args = ?spec.args, "starting tracee");

    let child = Command::new(&spec.exe)
      .args(spec.args.iter().skip(1))
      .current_dir(&spec.cwd)
      .stdin(Stdio::inherit())
      .stdout(Stdio::inherit())
      .stderr(Stdio::inherit())
      .spawn()
      .map_err(|source| TracerError::Spawn {
        exe: spec.exe.clone(),
        source,
      })?;

    let id = TraceeId(self.next);
    self.next += 1;
    self.children.insert(id, child);
    Ok(id)
  }

  fn wait(&mut self, id: TraceeId) -> Result<i32, TracerError> {
    let mut child = self.children.remove(&id).ok_or(TracerError::UnknownTracee(id))?;
    let status = child.wait().map_err(TracerError::Wait)?;
    let code = Self::exit_status(status);
    debug!(tracee = ?id, code, "tracee exited");
    Ok(code)
  }

  fn wait_all(&mut self) -> Result<Vec<(TraceeId, i32)>, TracerError> {
    let mut exits = Vec::new();
    for (id, mut child) in self.children.drain() {
      match child.wait() {
        Ok(status) => exits.push((id, Self::exit_status(status))),
        Err(e) => warn!(tracee = ?id, error = %e, "failed to collect tracee"),
      }
    }
    Ok(exits)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn runs_a_true_command() {
    let mut tracer = ProcessTracer::new();
    let id = tracer
      .start(LaunchSpec {
        exe: PathBuf::from("/bin/sh"),
        args: vec!["sh".into(), "-c".into(), "exit 0".into()],
        cwd: std::env::temp_dir(),
      })
      .unwrap();
    assert_eq!(tracer.wait(id).unwrap(), 0);
  }

  #[test]
  fn reports_nonzero_exits() {
    let mut tracer = ProcessTracer::new();
    let id = tracer
      .start(LaunchSpec {
        exe: PathBuf::from("/bin/sh"),
        args: vec!["sh".into(), "-c".into(), "exit 3".into()],
        cwd: std::env::temp_dir(),
      })
      .unwrap();
    assert_eq!(tracer.wait(id).unwrap(), 3);
  }

  #[test]
  fn spawn_failure_is_reported() {
    let mut tracer = ProcessTracer::new();
    let result = tracer.start(LaunchSpec {
      exe: PathBuf::from("/nonexistent/program"),
      args: vec!["program".into()],
      cwd: std::env::temp_dir(),
    });
    assert!(matches!(result, Err(TracerError::Spawn { .. })));
  }

  #[test]
  fn wait_all_drains_everything() {
    let mut tracer = ProcessTracer::new();
    for _ in 0..3 {
      tracer
        .start(LaunchSpec {
          exe: PathBuf::from("/bin/sh"),
          args: vec!["sh".into(), "-c".into(), "exit 0".into()],
          cwd: std::env::temp_dir(),
        })
        .unwrap();
    }

    let exits = tracer.wait_all().unwrap();
    assert_eq!(exits.len(), 3);
    assert!(exits.iter().all(|(_, code)| *code == 0));
  }
}
