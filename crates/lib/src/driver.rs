//! High-level build orchestration.
//!
//! `build` runs three passes over the trace:
//!
//! 1. Plan: emulate the prior trace with a [`RebuildPlanner`] observing;
//!    nothing launches, nothing commits.
//! 2. Execute: a fresh engine replays the trace under the computed plan;
//!    must-rerun commands launch under the tracer, everything else
//!    emulates, and final state is committed to disk.
//! 3. Persist: the collected steps replay through the [`PostBuildChecker`]
//!    into the on-disk trace, and the content cache rotates.
//!
//! `check` runs pass 1 only and reports what would rerun.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::artifact::ArtifactId;
use crate::cache::{self, CacheError, GcResult};
use crate::command::CommandId;
use crate::engine::{Build, EngineError};
use crate::options::Options;
use crate::plan::{NoopObserver, RebuildPlan, RebuildPlanner, RerunReason};
use crate::platform::paths;
use crate::store_lock::{LockMode, StoreLock, StoreLockError};
use crate::trace::{InputTrace, OutputTrace, PostBuildChecker};
use crate::tracer::ProcessTracer;

#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  Engine(#[from] EngineError),

  #[error(transparent)]
  Lock(#[from] StoreLockError),

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

/// One command the plan wants to rerun, rendered for people.
#[derive(Debug, Clone, Serialize)]
pub struct RerunEntry {
  pub command: String,
  pub reason: String,
}

/// What `check` (and `build --dry-run`) reports.
#[derive(Debug, Serialize)]
pub struct CheckReport {
  pub would_rerun: Vec<RerunEntry>,
}

impl CheckReport {
  pub fn is_up_to_date(&self) -> bool {
    self.would_rerun.is_empty()
  }
}

/// The outcome of a full build.
#[derive(Debug, Serialize)]
pub struct BuildSummary {
  pub planned: Vec<RerunEntry>,
  pub executed: bool,
  pub succeeded: bool,
  pub emulated_commands: usize,
  pub traced_commands: usize,
  pub emulated_steps: usize,
  pub traced_steps: usize,
}

/// Evaluate the rebuild plan without executing anything.
pub fn check(options: &Options) -> Result<CheckReport, BuildError> {
  let _lock = StoreLock::acquire(LockMode::Shared, "check")?;

  let input = InputTrace::load_or_default(&paths::trace_path());
  let (_, entries) = plan_rebuild(&input, options)?;

  Ok(CheckReport { would_rerun: entries })
}

/// Load the prior trace, compute the rebuild plan, and execute it.
pub fn build(options: &Options) -> Result<BuildSummary, BuildError> {
  let _lock = StoreLock::acquire(LockMode::Exclusive, "build")?;
  std::fs::create_dir_all(paths::build_dir())?;

  let input = InputTrace::load_or_default(&paths::trace_path());

  // Pass 1: plan.
  let (plan, planned) = plan_rebuild(&input, options)?;
  info!(commands = plan.len(), "rebuild plan computed");

  if options.dry_run {
    return Ok(BuildSummary {
      planned,
      executed: false,
      succeeded: true,
      emulated_commands: 0,
      traced_commands: 0,
      emulated_steps: 0,
      traced_steps: 0,
    });
  }

  // Pass 2: execute. Replay drives emulation, launches what must rerun, and
  // finishes by committing final state.
  let mut observer = NoopObserver;
  let mut engine = Build::rebuilder(plan, Box::new(ProcessTracer::new()), &mut observer, options.clone());
  input.replay(&mut engine)?;

  let buffer = engine.take_output();
  debug!(steps = buffer.len(), "collected output trace");

  // Pass 3: persist through the post-build pass, then rotate the cache.
  let out = OutputTrace::create(paths::trace_temp_path(), paths::trace_path())?;
  let referenced = {
    let mut checker = PostBuildChecker::new(&mut engine, out);
    crate::trace::replay(buffer.records(), &mut checker)?;
    checker.into_inner().referenced().clone()
  };
  cache::rotate(&referenced)?;

  Ok(BuildSummary {
    planned,
    executed: true,
    succeeded: !engine.commands_failed(),
    emulated_commands: engine.emulated_command_count(),
    traced_commands: engine.traced_command_count(),
    emulated_steps: engine.emulated_step_count(),
    traced_steps: engine.traced_step_count(),
  })
}

/// Remove cache files the current trace no longer references.
pub fn gc(dry_run: bool) -> Result<GcResult, BuildError> {
  let _lock = StoreLock::acquire(LockMode::Exclusive, "gc")?;

  let input = InputTrace::load_or_default(&paths::trace_path());
  Ok(cache::collect_garbage(&input, dry_run)?)
}

/// Pass 1: emulate the trace with a planner observing, then close the
/// changed set over dependency edges and render the reasons.
fn plan_rebuild(input: &InputTrace, options: &Options) -> Result<(RebuildPlan, Vec<RerunEntry>), BuildError> {
  let mut planner = RebuildPlanner::default();

  let (command_names, artifact_names) = {
    let mut engine = Build::emulator(&mut planner, options.clone());
    input.replay(&mut engine)?;

    let command_names: Vec<String> = engine
      .command_ids()
      .map(|c| {
        engine
          .command(c)
          .map(|cmd| cmd.short_name(options.command_length))
          .unwrap_or_else(|_| format!("{}", c))
      })
      .collect();

    let artifact_names: HashMap<ArtifactId, String> = engine
      .env()
      .artifact_ids()
      .map(|a| (a, engine.artifact_label(a)))
      .collect();

    (command_names, artifact_names)
  };

  let plan = planner.plan();

  let name_command = |c: CommandId| {
    command_names
      .get(c.index())
      .cloned()
      .unwrap_or_else(|| format!("{}", c))
  };
  let name_artifact =
    |a: ArtifactId| artifact_names.get(&a).cloned().unwrap_or_else(|| format!("{}", a));

  let entries = plan
    .iter()
    .map(|(c, reason)| {
      let reason = match reason {
        RerunReason::InputChanged { producer } => {
          format!("depends on output of {}", name_command(*producer))
        }
        other => other.describe(&name_artifact),
      };
      RerunEntry {
        command: name_command(*c),
        reason,
      }
    })
    .collect();

  Ok((plan, entries))
}
