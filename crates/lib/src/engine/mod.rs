//! The build engine.
//!
//! `Build` consumes IR steps from two directions: the emulate path (steps
//! replayed from a loaded trace, via its [`TraceSink`] impl in `emulate`)
//! and the trace path (freshly observed operations admitted through the
//! `trace_*` family in `trace`). Both update the same in-memory model; they
//! differ in who created the step and whether the resulting versions count
//! as committed to disk.

mod emulate;
mod trace;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::artifact::ArtifactId;
use crate::command::{Command, CommandDef, CommandId, Ref, RefId};
use crate::env::{Env, ResolveEffect};
use crate::options::Options;
use crate::plan::{BuildObserver, InputType, RebuildPlan};
use crate::platform::TraceeIdentity;
use crate::trace::{ContentData, MetadataData, TraceBuffer, TraceSink};
use crate::tracer::{LaunchSpec, NullTracer, Tracer, TraceeId, TracerError};
use crate::version::{CommitError, ContentVersion, EntryAction, FileVersion, SymlinkVersion, Version};

#[derive(Debug, Error)]
pub enum EngineError {
  /// A running command needs a version that cannot be reified on disk.
  #[error("running command {command} depends on an uncommittable version of {artifact}")]
  Uncommittable { command: String, artifact: String },

  /// A step named a command the trace never defined.
  #[error("step refers to unknown command c{0}")]
  UnknownCommand(u32),

  /// A step used a reference that was never resolved.
  #[error("{command} used unresolved reference {r}")]
  UnresolvedRef { command: String, r: RefId },

  #[error("tracer failure: {0}")]
  Tracer(#[from] TracerError),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

pub struct Build<'obs> {
  commands: Vec<Command>,
  env: Env,
  plan: RebuildPlan,
  options: Options,
  observer: &'obs mut dyn BuildObserver,
  output: TraceBuffer,
  tracer: Box<dyn Tracer>,
  commit: bool,
  running: HashMap<CommandId, TraceeId>,
  exited: HashSet<CommandId>,
  emulated_steps: usize,
  traced_steps: usize,
  emulated_commands: usize,
  traced_commands: usize,
}

impl<'obs> Build<'obs> {
  /// An engine that exclusively emulates: nothing launches, nothing commits.
  /// Used by the planning pass.
  pub fn emulator(observer: &'obs mut dyn BuildObserver, options: Options) -> Self {
    Build::new(
      RebuildPlan::default(),
      Box::new(NullTracer),
      observer,
      options,
      false,
    )
  }

  /// An engine that executes a rebuild plan and commits final state.
  pub fn rebuilder(
    plan: RebuildPlan,
    tracer: Box<dyn Tracer>,
    observer: &'obs mut dyn BuildObserver,
    options: Options,
  ) -> Self {
    Build::new(plan, tracer, observer, options, true)
  }

  fn new(
    plan: RebuildPlan,
    tracer: Box<dyn Tracer>,
    observer: &'obs mut dyn BuildObserver,
    options: Options,
    commit: bool,
  ) -> Self {
    Build {
      commands: Vec::new(),
      env: Env::new(TraceeIdentity::current()),
      plan,
      options,
      observer,
      output: TraceBuffer::default(),
      tracer,
      commit,
      running: HashMap::new(),
      exited: HashSet::new(),
      emulated_steps: 0,
      traced_steps: 0,
      emulated_commands: 0,
      traced_commands: 0,
    }
  }

  pub fn env(&self) -> &Env {
    &self.env
  }

  pub fn env_mut(&mut self) -> &mut Env {
    &mut self.env
  }

  pub fn plan(&self) -> &RebuildPlan {
    &self.plan
  }

  pub fn options(&self) -> &Options {
    &self.options
  }

  pub fn emulated_step_count(&self) -> usize {
    self.emulated_steps
  }

  pub fn traced_step_count(&self) -> usize {
    self.traced_steps
  }

  pub fn emulated_command_count(&self) -> usize {
    self.emulated_commands
  }

  pub fn traced_command_count(&self) -> usize {
    self.traced_commands
  }

  /// Take the collected output trace; the engine keeps an empty buffer.
  pub fn take_output(&mut self) -> TraceBuffer {
    std::mem::take(&mut self.output)
  }

  pub fn command(&self, c: CommandId) -> Result<&Command, EngineError> {
    self.commands.get(c.index()).ok_or(EngineError::UnknownCommand(c.0))
  }

  pub fn command_mut(&mut self, c: CommandId) -> Result<&mut Command, EngineError> {
    self.commands.get_mut(c.index()).ok_or(EngineError::UnknownCommand(c.0))
  }

  pub fn command_count(&self) -> usize {
    self.commands.len()
  }

  pub fn command_ids(&self) -> impl Iterator<Item = CommandId> {
    (0..self.commands.len() as u32).map(CommandId)
  }

  pub fn exit_status_of(&self, c: CommandId) -> Option<i32> {
    self.commands.get(c.index()).and_then(|cmd| cmd.exit_status)
  }

  /// Did any executed command exit nonzero?
  pub fn commands_failed(&self) -> bool {
    self
      .commands
      .iter()
      .any(|c| matches!(c.exit_status, Some(status) if status != 0))
  }

  /// A printable identity for an artifact: its path if known, else its name.
  pub fn artifact_label(&self, a: ArtifactId) -> String {
    match self.env.path_of(a) {
      Some(path) => path.display().to_string(),
      None => self.env.artifact(a).display_name(),
    }
  }

  fn command_label(&self, c: CommandId) -> String {
    self
      .commands
      .get(c.index())
      .map(|cmd| cmd.short_name(self.options.command_length))
      .unwrap_or_else(|| format!("{}", c))
  }

  pub(crate) fn next_command_id(&self) -> CommandId {
    CommandId(self.commands.len() as u32)
  }

  pub(crate) fn insert_command(&mut self, id: CommandId, def: &CommandDef) {
    while self.commands.len() < id.index() {
      let filler = CommandId(self.commands.len() as u32);
      self.commands.push(Command::new(filler, &CommandDef {
        args: Vec::new(),
        exe: RefId(0),
        cwd: RefId(0),
        root: RefId(0),
        initial_fds: Default::default(),
        executed: false,
      }));
    }
    if self.commands.len() == id.index() {
      self.commands.push(Command::new(id, def));
    }
  }

  pub(crate) fn ref_of(&self, c: CommandId, r: RefId) -> Result<Ref, EngineError> {
    let command = self.command(c)?;
    command
      .ref_at(r)
      .cloned()
      .ok_or_else(|| EngineError::UnresolvedRef {
        command: self.command_label(c),
        r,
      })
  }

  /// The artifact behind a resolved ref, or None when resolution failed
  /// (a change was already reported through the resolution predicate).
  pub(crate) fn ref_artifact(&self, c: CommandId, r: RefId) -> Option<ArtifactId> {
    self
      .commands
      .get(c.index())
      .and_then(|cmd| cmd.ref_at(r))
      .and_then(|reference| reference.artifact())
  }

  /********** Observer plumbing **********/

  /// Forward an input to observers, committing the version on demand first:
  /// by the time a running command observes an artifact, its on-disk content
  /// must match the model.
  pub(crate) fn signal_input(
    &mut self,
    c: CommandId,
    a: ArtifactId,
    v: &Version,
    t: InputType,
  ) -> Result<(), EngineError> {
    if self.plan.must_rerun(c) && !v.is_committed() && v.creator() != Some(c) {
      debug!(artifact = %a, command = %c, "committing version on demand");
      self.commit_for_reader(c, a, v)?;
    }

    self.observer.observe_input(c, a, v, t);
    Ok(())
  }

  pub(crate) fn signal_output(&mut self, c: CommandId, a: ArtifactId, v: &Version) {
    self.observer.observe_output(c, a, v);
  }

  fn commit_for_reader(&mut self, c: CommandId, a: ArtifactId, v: &Version) -> Result<(), EngineError> {
    if let Version::Content(content) = v {
      if content.is_pipe() {
        return Ok(());
      }
    }

    let Some(path) = self.env.path_of(a).cloned() else {
      return Err(EngineError::Uncommittable {
        command: self.command_label(c),
        artifact: self.artifact_label(a),
      });
    };

    self.commit_one(&path, v).map_err(|error| match error {
      CommitError::Io(e) => EngineError::Io(e),
      CommitError::Uncommittable => EngineError::Uncommittable {
        command: self.command_label(c),
        artifact: self.artifact_label(a),
      },
    })
  }

  /********** Committing model state to disk **********/

  fn commit_one(&mut self, path: &PathBuf, v: &Version) -> Result<(), CommitError> {
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() && !parent.exists() {
        std::fs::create_dir_all(parent)?;
      }
    }

    match v {
      Version::Metadata(m) => m.commit(path),
      Version::Content(ContentVersion::File(f)) => f.commit(path),
      Version::Content(ContentVersion::Symlink(s)) => s.commit(path),
      Version::Content(ContentVersion::DirList(d)) => d.commit(path),
      Version::Content(ContentVersion::DirEntry(entry)) => {
        let entry_path = path.join(&entry.name);
        match entry.action {
          EntryAction::Link => {
            self.commit_artifact_all(entry.target)?;
            entry.state.set_committed(true);
            Ok(())
          }
          EntryAction::Unlink => {
            match std::fs::remove_file(&entry_path) {
              Ok(()) => {}
              Err(e) if e.kind() == std::io::ErrorKind::IsADirectory => {
                std::fs::remove_dir_all(&entry_path)?;
              }
              Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
              Err(e) => return Err(CommitError::Io(e)),
            }
            entry.state.set_committed(true);
            Ok(())
          }
        }
      }
      Version::Content(_) => Ok(()),
    }
  }

  /// Commit an artifact's current metadata and content.
  pub(crate) fn commit_artifact_all(&mut self, a: ArtifactId) -> Result<(), CommitError> {
    if self.env.artifact(a).is_pipe() {
      return Ok(());
    }

    let Some(path) = self.env.path_of(a).cloned() else {
      return Err(CommitError::Uncommittable);
    };

    if let Some(content) = self.env.artifact(a).current_content() {
      if !content.state().is_committed() {
        self.commit_one(&path, &Version::Content(content))?;
      }
    }

    let metadata = self.env.artifact(a).current_metadata();
    if !metadata.state.is_committed() {
      metadata.commit(&path)?;
    }

    Ok(())
  }

  /********** Launch plumbing **********/

  pub(crate) fn launch_spec(&self, child: CommandId) -> Result<LaunchSpec, EngineError> {
    let command = self.command(child)?;

    let exe = command
      .ref_at(command.exe)
      .and_then(|r| r.artifact())
      .and_then(|a| self.env.path_of(a).cloned())
      .ok_or(EngineError::Tracer(TracerError::MissingExecutable))?;

    let cwd = command
      .ref_at(command.cwd)
      .and_then(|r| r.artifact())
      .and_then(|a| self.env.path_of(a).cloned())
      .map_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")), |p| p);

    Ok(LaunchSpec {
      exe,
      args: command.args.clone(),
      cwd,
    })
  }

  /// Before a child runs for real, its working directory must exist, its
  /// executable must be on disk, and the artifacts behind its initial fds
  /// should be committed where possible.
  pub(crate) fn commit_launch_deps(&mut self, child: CommandId) -> Result<(), EngineError> {
    let command = self.command(child)?;
    let cwd = command.ref_at(command.cwd).and_then(|r| r.artifact());
    let exe = command.ref_at(command.exe).and_then(|r| r.artifact());
    let fd_artifacts: Vec<ArtifactId> = command
      .initial_fds
      .values()
      .filter_map(|r| command.ref_at(*r))
      .filter_map(|r| r.artifact())
      .collect();

    if let Some(cwd) = cwd {
      if let Err(e) = self.commit_artifact_all(cwd) {
        warn!(artifact = %self.artifact_label(cwd), error = %e, "could not commit working directory");
      }
    }

    if let Some(exe) = exe {
      self.commit_artifact_all(exe).map_err(|_| EngineError::Uncommittable {
        command: self.command_label(child),
        artifact: self.artifact_label(exe),
      })?;
    }

    for a in fd_artifacts {
      if self.env.artifact(a).is_pipe() {
        continue;
      }
      if let Err(e) = self.commit_artifact_all(a) {
        warn!(artifact = %self.artifact_label(a), error = %e, "launching without committing fd artifact");
      }
    }

    Ok(())
  }

  pub(crate) fn start_tracee(&mut self, child: CommandId) -> Result<(), EngineError> {
    let spec = self.launch_spec(child)?;
    let handle = self.tracer.start(spec)?;
    self.running.insert(child, handle);
    Ok(())
  }

  /// A tracee exited: record the Exit step on its behalf.
  pub(crate) fn handle_tracee_exit(&mut self, child: CommandId, status: i32) -> Result<(), EngineError> {
    self.traced_steps += 1;
    self.output.exit(child, status)?;
    self.command_mut(child)?.exit_status = Some(status);
    self.exited.insert(child);
    debug!(command = %child, status, "traced command exited");
    Ok(())
  }

  pub(crate) fn wait_for(&mut self, child: CommandId) -> Result<(), EngineError> {
    if let Some(handle) = self.running.remove(&child) {
      let status = self.tracer.wait(handle)?;
      self.handle_tracee_exit(child, status)?;
    }
    Ok(())
  }

  fn wait_for_all(&mut self) -> Result<(), EngineError> {
    let exits = self.tracer.wait_all()?;
    let by_handle: HashMap<TraceeId, CommandId> =
      self.running.drain().map(|(c, h)| (h, c)).collect();

    for (handle, status) in exits {
      if let Some(child) = by_handle.get(&handle) {
        self.handle_tracee_exit(*child, status)?;
      }
    }
    Ok(())
  }

  /********** Resolution effects **********/

  pub(crate) fn apply_effects(&mut self, c: CommandId, effects: Vec<ResolveEffect>) -> Result<(), EngineError> {
    for effect in effects {
      match effect {
        ResolveEffect::Input { artifact, version } => {
          version.state().mark_accessed();
          self.signal_input(c, artifact, &version, InputType::Accessed)?;
        }
        ResolveEffect::Created { artifact, dir, entry } => {
          self.signal_output(c, dir, &Version::Content(entry));

          let metadata = self.env.artifact(artifact).current_metadata();
          self.signal_output(c, artifact, &Version::Metadata(metadata));
          if let Some(content) = self.env.artifact(artifact).current_content() {
            self.signal_output(c, artifact, &Version::Content(content));
          }
        }
        ResolveEffect::Truncated { artifact, version } => {
          self.env.artifact_mut(artifact).apply_content(version.clone());
          self.signal_output(c, artifact, &Version::Content(version));
        }
      }
    }
    Ok(())
  }

  /********** Final state **********/

  /// Compare every modeled artifact against the filesystem, reporting
  /// divergence to observers.
  fn check_final_state(&mut self) {
    for a in self.env.artifact_ids().collect::<Vec<_>>() {
      let Some(path) = self.env.path_of(a).cloned() else {
        continue;
      };

      let Some(content) = self.env.artifact(a).current_content() else {
        continue;
      };

      match &content {
        ContentVersion::File(v) => {
          if v.state.is_committed() {
            continue;
          }
          match std::fs::metadata(&path) {
            Ok(meta) => {
              let disk = FileVersion::from_disk(&meta);
              if v.hash().is_some() {
                if let Err(e) = disk.fingerprint(&path) {
                  warn!(path = %path.display(), error = %e, "could not fingerprint final state");
                }
              }
              if disk.matches(v) {
                v.state.set_committed(true);
              } else {
                let disk = Version::Content(ContentVersion::File(Rc::new(disk)));
                self
                  .observer
                  .observe_final_mismatch(a, &Version::Content(content.clone()), Some(&disk));
              }
            }
            Err(_) => {
              self
                .observer
                .observe_final_mismatch(a, &Version::Content(content.clone()), None);
            }
          }
        }
        ContentVersion::Symlink(v) => {
          if v.state.is_committed() {
            continue;
          }
          match SymlinkVersion::read_disk(&path) {
            Ok(target) if target == v.target() => v.state.set_committed(true),
            Ok(target) => {
              let disk = Version::Content(ContentVersion::Symlink(Rc::new(SymlinkVersion::from_disk(target))));
              self
                .observer
                .observe_final_mismatch(a, &Version::Content(content.clone()), Some(&disk));
            }
            Err(_) => {
              self
                .observer
                .observe_final_mismatch(a, &Version::Content(content.clone()), None);
            }
          }
        }
        ContentVersion::DirList(v) => {
          if v.state.is_committed() {
            continue;
          }
          if path.is_dir() {
            v.state.set_committed(true);
          } else {
            self
              .observer
              .observe_final_mismatch(a, &Version::Content(content.clone()), None);
          }
        }
        _ => {}
      }
    }
  }

  /// Commit pending final state to the filesystem and stash file content in
  /// the cache. Uncommittable versions are warned about and left for the
  /// next build; only on-demand commits are fatal.
  fn apply_final_state(&mut self) {
    for a in self.env.artifact_ids().collect::<Vec<_>>() {
      let Some(path) = self.env.path_of(a).cloned() else {
        continue;
      };

      if self.env.artifact(a).is_pipe() {
        continue;
      }

      if let Some(content) = self.env.artifact(a).current_content() {
        if !content.state().is_committed() {
          match self.commit_one(&path, &Version::Content(content.clone())) {
            Ok(()) => {}
            Err(CommitError::Uncommittable) => {
              warn!(
                artifact = %self.artifact_label(a),
                "final state is uncommittable; it will be restored on the next build"
              );
            }
            Err(CommitError::Io(e)) => {
              warn!(artifact = %self.artifact_label(a), error = %e, "failed to commit final state");
            }
          }
        }

        // Preserve file bytes so a future build can restore them without
        // rerunning the producer.
        if let ContentVersion::File(v) = &content {
          let worth_caching = v.hash().is_some() || v.state.creator().is_some();
          if v.state.is_committed() && worth_caching && !v.is_empty() {
            if let Err(e) = v.cache(&path) {
              warn!(path = %path.display(), error = %e, "failed to cache file content");
            }
          }
        }
      }

      // Pending directory entry patches (links and unlinks) reify here.
      let pending_entries: Vec<Version> = self
        .env
        .artifact(a)
        .dir_entries()
        .map(|entries| {
          entries
            .values()
            .filter_map(|slot| slot.version.clone())
            .filter(|v| !v.state().is_committed())
            .map(Version::Content)
            .collect()
        })
        .unwrap_or_default();
      for entry in pending_entries {
        if let Err(e) = self.commit_one(&path, &entry) {
          warn!(artifact = %self.artifact_label(a), error = %e, "failed to commit directory entry");
        }
      }

      let metadata = self.env.artifact(a).current_metadata();
      if !metadata.state.is_committed() {
        if let Err(e) = metadata.commit(&path) {
          warn!(artifact = %self.artifact_label(a), error = %e, "failed to commit metadata");
        }
      }
    }
  }

  /// Finish the build: collect remaining tracees, verify final state, and
  /// commit it when this engine commits.
  pub(crate) fn finish_build(&mut self) -> Result<(), EngineError> {
    self.wait_for_all()?;
    self.check_final_state();
    if self.commit {
      self.apply_final_state();
    }
    self.output.finish()?;

    debug!(
      emulated_steps = self.emulated_steps,
      traced_steps = self.traced_steps,
      emulated_commands = self.emulated_commands,
      traced_commands = self.traced_commands,
      exited = self.exited.len(),
      "build finished"
    );
    Ok(())
  }

  /********** Peeking for the post-build pass **********/

  pub(crate) fn peek_ref_result(&self, c: CommandId, r: RefId) -> Option<i32> {
    self
      .commands
      .get(c.index())
      .and_then(|cmd| cmd.ref_at(r))
      .map(|reference| reference.result_code())
  }

  pub(crate) fn peek_ref_metadata(&self, c: CommandId, r: RefId) -> Option<MetadataData> {
    let a = self.ref_artifact(c, r)?;
    Some(MetadataData::from_version(&self.env.artifact(a).current_metadata()))
  }

  pub(crate) fn peek_ref_content(&mut self, c: CommandId, r: RefId) -> Option<ContentData> {
    let a = self.ref_artifact(c, r)?;
    if self.env.artifact(a).is_pipe() {
      return None;
    }
    let content = self.env.content_of(a)?;
    ContentData::from_version(&content)
  }

  /********** Shared step accounting **********/

  /// Returns false when the step's command cannot be emulated (its steps
  /// will be re-observed from the tracer instead).
  pub(crate) fn emulating(&mut self, c: CommandId) -> bool {
    if !self.plan.can_emulate(c) {
      return false;
    }
    self.emulated_steps += 1;
    true
  }

  pub(crate) fn count_traced_step(&mut self) {
    self.traced_steps += 1;
  }

  pub(crate) fn count_emulated_command(&mut self) {
    self.emulated_commands += 1;
  }

  pub(crate) fn count_traced_command(&mut self) {
    self.traced_commands += 1;
  }
}
