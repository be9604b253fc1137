//! Rebuild planning.
//!
//! [`BuildObserver`] receives every signal the engine emits while replaying
//! a trace. [`RebuildPlanner`] consumes them to derive the must-rerun set:
//! commands that have never run or whose recorded predicates failed seed the
//! set, and dependency edges (a command reading a version another command
//! created) propagate it to closure.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use crate::artifact::ArtifactId;
use crate::command::{CommandId, RefId, RefOutcome};
use crate::version::{ContentVersion, Scenario, Version};

/// How a command came to depend on a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
  /// Explicitly accessed (read, stat, resolution).
  Accessed,

  /// Inherited through launch (initial fds, cwd, executable).
  Inherited,

  /// The command only requires that the artifact exists.
  Exists,
}

/// Dependency and change information emitted during a build.
///
/// All methods default to no-ops so observers implement only what they need.
#[allow(unused_variables)]
pub trait BuildObserver {
  /// Command `c` modified artifact `a`, creating version `v`.
  fn observe_output(&mut self, c: CommandId, a: ArtifactId, v: &Version) {}

  /// Command `c` depends on version `v` of artifact `a`.
  fn observe_input(&mut self, c: CommandId, a: ArtifactId, v: &Version, t: InputType) {}

  /// Command `c` did not find the expected version of artifact `a`.
  fn observe_mismatch(
    &mut self,
    c: CommandId,
    scenario: Scenario,
    a: ArtifactId,
    observed: Option<&Version>,
    expected: &Version,
  ) {
  }

  /// The on-disk state of `a` at the end of the build does not match the
  /// version the build produced.
  fn observe_final_mismatch(&mut self, a: ArtifactId, produced: &Version, ondisk: Option<&Version>) {}

  /// A command is being launched; `parent` is None for the trace root.
  fn observe_launch(&mut self, parent: Option<CommandId>, child: CommandId) {}

  /// A command has never been run.
  fn observe_command_never_run(&mut self, c: CommandId) {}

  /// A reference did not resolve with the recorded result.
  fn observe_resolution_change(
    &mut self,
    c: CommandId,
    scenario: Scenario,
    r: RefId,
    expected: i32,
    observed: i32,
  ) {
  }

  /// Two references did not compare as recorded.
  fn observe_ref_mismatch(&mut self, c: CommandId, r1: RefId, r2: RefId, expected: RefOutcome) {}

  /// A child exited with a different status than its parent recorded.
  fn observe_exit_code_change(&mut self, parent: CommandId, child: CommandId, expected: i32, observed: i32) {
  }
}

/// An observer that ignores everything.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl BuildObserver for NoopObserver {}

/// Why a command is in the must-rerun set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RerunReason {
  NeverRun,
  ChangedMetadata(ArtifactId),
  ChangedContent(ArtifactId),
  ResolutionChange { r: RefId, expected: i32, observed: i32 },
  RefMismatch,
  ExitCodeChange { child: CommandId, expected: i32, observed: i32 },
  FinalStateChanged(ArtifactId),
  InputChanged { producer: CommandId },
}

impl RerunReason {
  /// Render with a callback that names artifacts.
  pub fn describe(&self, name_of: impl Fn(ArtifactId) -> String) -> String {
    match self {
      RerunReason::NeverRun => "never run".to_string(),
      RerunReason::ChangedMetadata(a) => format!("metadata of {} changed", name_of(*a)),
      RerunReason::ChangedContent(a) => format!("content of {} changed", name_of(*a)),
      RerunReason::ResolutionChange { expected, observed, .. } => {
        format!("path resolved to {} instead of {}", observed, expected)
      }
      RerunReason::RefMismatch => "reference comparison changed".to_string(),
      RerunReason::ExitCodeChange { expected, observed, .. } => {
        format!("child exited {} instead of {}", observed, expected)
      }
      RerunReason::FinalStateChanged(a) => format!("{} no longer matches the build output", name_of(*a)),
      RerunReason::InputChanged { producer } => format!("depends on output of rerunning {}", producer),
    }
  }
}

/// The computed must-rerun set.
#[derive(Debug, Clone, Default)]
pub struct RebuildPlan {
  rerun: BTreeMap<CommandId, RerunReason>,
}

impl RebuildPlan {
  pub fn must_rerun(&self, c: CommandId) -> bool {
    self.rerun.contains_key(&c)
  }

  pub fn can_emulate(&self, c: CommandId) -> bool {
    !self.must_rerun(c)
  }

  pub fn is_empty(&self) -> bool {
    self.rerun.is_empty()
  }

  pub fn len(&self) -> usize {
    self.rerun.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&CommandId, &RerunReason)> {
    self.rerun.iter()
  }
}

/// Builds a [`RebuildPlan`] from observed signals.
#[derive(Debug, Default)]
pub struct RebuildPlanner {
  /// Commands with directly observed changes, with the first reason seen.
  changed: BTreeMap<CommandId, RerunReason>,

  /// Dependency edges: creator command -> commands that read its outputs.
  readers: HashMap<CommandId, BTreeSet<CommandId>>,
}

impl RebuildPlanner {
  fn mark(&mut self, c: CommandId, reason: RerunReason) {
    self.changed.entry(c).or_insert(reason);
  }

  /// Close the changed set over dependency edges.
  pub fn plan(&self) -> RebuildPlan {
    let mut rerun = self.changed.clone();
    let mut worklist: Vec<CommandId> = rerun.keys().copied().collect();

    while let Some(producer) = worklist.pop() {
      let Some(readers) = self.readers.get(&producer) else {
        continue;
      };
      for reader in readers {
        if !rerun.contains_key(reader) {
          rerun.insert(*reader, RerunReason::InputChanged { producer });
          worklist.push(*reader);
        }
      }
    }

    debug!(directly_changed = self.changed.len(), total = rerun.len(), "rebuild plan computed");
    RebuildPlan { rerun }
  }
}

impl BuildObserver for RebuildPlanner {
  fn observe_input(&mut self, c: CommandId, _a: ArtifactId, v: &Version, _t: InputType) {
    if let Some(creator) = v.creator() {
      if creator != c {
        self.readers.entry(creator).or_default().insert(c);
      }
    }
  }

  fn observe_mismatch(
    &mut self,
    c: CommandId,
    scenario: Scenario,
    a: ArtifactId,
    _observed: Option<&Version>,
    expected: &Version,
  ) {
    // A post-build mismatch on a cached file is repairable: the next apply
    // pass stages the bytes back from the cache instead of rerunning.
    if scenario == Scenario::PostBuild {
      if let Version::Content(ContentVersion::File(f)) = expected {
        if f.can_commit() {
          return;
        }
      }
    }

    let reason = match expected {
      Version::Metadata(_) => RerunReason::ChangedMetadata(a),
      Version::Content(_) => RerunReason::ChangedContent(a),
    };
    self.mark(c, reason);
  }

  fn observe_final_mismatch(&mut self, a: ArtifactId, produced: &Version, _ondisk: Option<&Version>) {
    // Repairable versions are restored by the next build's apply pass; only
    // an unreproducible output forces its producer to rerun.
    let repairable = match produced {
      Version::Content(ContentVersion::File(f)) => f.can_commit(),
      Version::Content(ContentVersion::DirList(d)) => d.can_commit(),
      _ => true,
    };

    if !repairable {
      if let Some(creator) = produced.creator() {
        self.mark(creator, RerunReason::FinalStateChanged(a));
      }
    }
  }

  fn observe_command_never_run(&mut self, c: CommandId) {
    self.mark(c, RerunReason::NeverRun);
  }

  fn observe_resolution_change(&mut self, c: CommandId, _scenario: Scenario, r: RefId, expected: i32, observed: i32) {
    self.mark(c, RerunReason::ResolutionChange { r, expected, observed });
  }

  fn observe_ref_mismatch(&mut self, c: CommandId, _r1: RefId, _r2: RefId, _expected: RefOutcome) {
    self.mark(c, RerunReason::RefMismatch);
  }

  fn observe_exit_code_change(&mut self, parent: CommandId, child: CommandId, expected: i32, observed: i32) {
    // The parent consumed the exit status, so the parent's view changed.
    self.mark(parent, RerunReason::ExitCodeChange { child, expected, observed });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::version::FileVersion;
  use std::rc::Rc;

  fn version_by(creator: CommandId) -> Version {
    let v = FileVersion::written();
    v.state.created_by(creator);
    Version::Content(ContentVersion::File(Rc::new(v)))
  }

  #[test]
  fn never_run_is_marked() {
    let mut planner = RebuildPlanner::default();
    planner.observe_command_never_run(CommandId(1));

    let plan = planner.plan();
    assert!(plan.must_rerun(CommandId(1)));
    assert!(!plan.can_emulate(CommandId(1)));
  }

  #[test]
  fn mismatch_propagates_to_readers() {
    let mut planner = RebuildPlanner::default();

    // c2 reads a version produced by c1; c3 reads a version from c2.
    planner.observe_input(CommandId(2), ArtifactId(0), &version_by(CommandId(1)), InputType::Accessed);
    planner.observe_input(CommandId(3), ArtifactId(1), &version_by(CommandId(2)), InputType::Accessed);

    // c1's own input changed.
    planner.observe_mismatch(
      CommandId(1),
      Scenario::Build,
      ArtifactId(2),
      None,
      &version_by(CommandId(9)),
    );

    let plan = planner.plan();
    assert!(plan.must_rerun(CommandId(1)));
    assert!(plan.must_rerun(CommandId(2)));
    assert!(plan.must_rerun(CommandId(3)));
    assert_eq!(plan.len(), 3);
  }

  #[test]
  fn self_reads_create_no_edges() {
    let mut planner = RebuildPlanner::default();
    planner.observe_input(CommandId(1), ArtifactId(0), &version_by(CommandId(1)), InputType::Accessed);
    planner.observe_command_never_run(CommandId(2));

    let plan = planner.plan();
    assert!(!plan.must_rerun(CommandId(1)));
  }

  #[test]
  fn ref_mismatch_marks_the_command() {
    let mut planner = RebuildPlanner::default();
    planner.observe_ref_mismatch(CommandId(3), RefId(0), RefId(1), RefOutcome::SameInstance);

    let plan = planner.plan();
    assert!(plan.must_rerun(CommandId(3)));
  }

  #[test]
  fn exit_code_change_marks_the_parent() {
    let mut planner = RebuildPlanner::default();
    planner.observe_exit_code_change(CommandId(1), CommandId(2), 0, 1);

    let plan = planner.plan();
    assert!(plan.must_rerun(CommandId(1)));
    assert!(!plan.must_rerun(CommandId(2)));
  }

  #[test]
  fn repairable_post_build_mismatch_is_skipped() {
    let mut planner = RebuildPlanner::default();

    let cached = FileVersion::from_parts(false, true, None, Some(crate::fingerprint::hash_bytes(b"x")));
    let cached = Version::Content(ContentVersion::File(Rc::new(cached)));
    planner.observe_mismatch(CommandId(1), Scenario::PostBuild, ArtifactId(0), None, &cached);
    assert!(planner.plan().is_empty());

    // The same mismatch in the build scenario still marks the command.
    planner.observe_mismatch(CommandId(1), Scenario::Build, ArtifactId(0), None, &cached);
    assert!(planner.plan().must_rerun(CommandId(1)));
  }

  #[test]
  fn unrepairable_final_mismatch_marks_creator() {
    let mut planner = RebuildPlanner::default();
    let produced = version_by(CommandId(4));
    planner.observe_final_mismatch(ArtifactId(0), &produced, None);

    let plan = planner.plan();
    assert!(plan.must_rerun(CommandId(4)));
  }

  #[test]
  fn empty_plan_emulates_everything() {
    let plan = RebuildPlan::default();
    assert!(plan.is_empty());
    assert!(plan.can_emulate(CommandId(0)));
  }
}
