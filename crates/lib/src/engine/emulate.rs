//! The emulate path: replaying a loaded trace against the model.
//!
//! Every handler follows the same sequence: skip the step if its command
//! cannot be emulated, mirror it to the output trace, then evaluate it
//! (model mutation plus predicate checks, signalling observers on
//! divergence). Mutations on this path leave versions uncommitted; the
//! filesystem only changes through on-demand commits and the final apply.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, warn};

use super::{Build, EngineError};
use crate::artifact::SpecialEntity;
use crate::command::{CommandDef, CommandId, Ref, RefId, RefOutcome};
use crate::consts::BUILD_SHELL;
use crate::flags::AccessFlags;
use crate::plan::InputType;
use crate::trace::{ContentData, MetadataData, TraceSink};
use crate::version::{ContentVersion, DirEntryVersion, Scenario, Version};

impl Build<'_> {
  /// Does the current model state diverge from an expected content version?
  /// Committed file versions without a fingerprint are fingerprinted from
  /// disk before the comparison is final.
  fn content_mismatch(
    &self,
    current: &ContentVersion,
    expected: &ContentVersion,
    path: Option<&PathBuf>,
  ) -> bool {
    if current.matches(expected) {
      return false;
    }

    if let ContentVersion::File(cur) = current {
      if cur.state.is_committed() && cur.hash().is_none() {
        if let Some(p) = path {
          if let Err(e) = cur.fingerprint(p) {
            debug!(path = %p.display(), error = %e, "could not fingerprint for comparison");
            return true;
          }
          return !current.matches(expected);
        }
      }
    }

    true
  }

  fn resolve_special(&mut self, c: CommandId, entity: SpecialEntity) -> Result<Ref, EngineError> {
    let reference = match entity {
      SpecialEntity::Stdin => Ref::resolved(AccessFlags::read_only(), self.env.stdin()),
      SpecialEntity::Stdout => Ref::resolved(AccessFlags::write_only(), self.env.stdout()),
      SpecialEntity::Stderr => Ref::resolved(AccessFlags::write_only(), self.env.stderr()),
      SpecialEntity::Root => Ref::resolved(AccessFlags::read_exec(), self.env.root()),
      SpecialEntity::Cwd => {
        let cwd = std::env::current_dir()?;
        let root = self.env.root();
        let outcome = self.env.resolve(root, &cwd, &AccessFlags::read_exec(), true, None);
        self.apply_effects(c, outcome.effects)?;
        match outcome.result {
          Ok((a, granted)) => {
            self.env.artifact_mut(a).set_name(".");
            Ref::resolved(granted, a)
          }
          Err(errno) => {
            warn!(errno, "failed to resolve the working directory");
            Ref::failed(AccessFlags::read_exec(), errno)
          }
        }
      }
      SpecialEntity::LaunchExe => {
        let root = self.env.root();
        let outcome = self
          .env
          .resolve(root, Path::new(BUILD_SHELL), &AccessFlags::read_exec(), true, None);
        self.apply_effects(c, outcome.effects)?;
        match outcome.result {
          Ok((a, granted)) => Ref::resolved(granted, a),
          Err(errno) => {
            warn!(errno, shell = BUILD_SHELL, "failed to resolve the launch shell");
            Ref::failed(AccessFlags::read_exec(), errno)
          }
        }
      }
    };
    Ok(reference)
  }
}

impl TraceSink for Build<'_> {
  fn define_command(&mut self, id: CommandId, def: &CommandDef) -> Result<(), EngineError> {
    // Definitions are unconditional: even a must-rerun command keeps its
    // identity so the tracer can re-attach to it.
    self.insert_command(id, def);

    // The trace root has no launch step to carry its identity into the
    // output; mirror its definition directly.
    if id.index() == 0 {
      self.output.define_command(id, def)?;
    }
    Ok(())
  }

  fn special_ref(&mut self, c: CommandId, entity: SpecialEntity, output: RefId) -> Result<(), EngineError> {
    if !self.emulating(c) {
      return Ok(());
    }
    self.output.special_ref(c, entity, output)?;

    let reference = self.resolve_special(c, entity)?;
    self.command_mut(c)?.set_ref(output, reference);
    Ok(())
  }

  fn pipe_ref(&mut self, c: CommandId, read_end: RefId, write_end: RefId) -> Result<(), EngineError> {
    if !self.emulating(c) {
      return Ok(());
    }
    self.output.pipe_ref(c, read_end, write_end)?;

    let pipe = self.env.create_pipe(Some(c));
    let command = self.command_mut(c)?;
    command.set_ref(read_end, Ref::resolved(AccessFlags::read_only(), pipe));
    command.set_ref(write_end, Ref::resolved(AccessFlags::write_only(), pipe));
    Ok(())
  }

  fn file_ref(&mut self, c: CommandId, mode: u32, output: RefId) -> Result<(), EngineError> {
    if !self.emulating(c) {
      return Ok(());
    }
    self.output.file_ref(c, mode, output)?;

    let file = self.env.create_file(Some(c), mode, false);
    self.command_mut(c)?.set_ref(output, Ref::resolved(AccessFlags::read_write(), file));
    Ok(())
  }

  fn symlink_ref(&mut self, c: CommandId, target: &Path, output: RefId) -> Result<(), EngineError> {
    if !self.emulating(c) {
      return Ok(());
    }
    self.output.symlink_ref(c, target, output)?;

    let link = self.env.create_symlink(Some(c), target.to_path_buf(), false);
    let flags = AccessFlags {
      read: true,
      write: true,
      exec: true,
      ..Default::default()
    };
    self.command_mut(c)?.set_ref(output, Ref::resolved(flags, link));
    Ok(())
  }

  fn dir_ref(&mut self, c: CommandId, mode: u32, output: RefId) -> Result<(), EngineError> {
    if !self.emulating(c) {
      return Ok(());
    }
    self.output.dir_ref(c, mode, output)?;

    let dir = self.env.create_dir(Some(c), mode, false);
    let flags = AccessFlags {
      read: true,
      write: true,
      exec: true,
      ..Default::default()
    };
    self.command_mut(c)?.set_ref(output, Ref::resolved(flags, dir));
    Ok(())
  }

  fn path_ref(
    &mut self,
    c: CommandId,
    base: RefId,
    path: &Path,
    flags: AccessFlags,
    output: RefId,
  ) -> Result<(), EngineError> {
    if !self.emulating(c) {
      return Ok(());
    }
    self.output.path_ref(c, base, path, flags, output)?;

    self.command_mut(c)?.ensure_ref(base);
    let base_ref = self.ref_of(c, base)?;
    let Some(base_artifact) = base_ref.artifact() else {
      // The base never resolved; this resolution inherits its failure. The
      // recorded ExpectResult will report any change.
      let errno = base_ref.result_code();
      self.command_mut(c)?.set_ref(output, Ref::failed(flags, errno));
      return Ok(());
    };

    let outcome = self.env.resolve(base_artifact, path, &flags, false, Some(c));
    self.apply_effects(c, outcome.effects)?;

    let reference = match outcome.result {
      Ok((artifact, granted)) => Ref::resolved(granted, artifact),
      Err(errno) => Ref::failed(flags, errno),
    };
    self.command_mut(c)?.set_ref(output, reference);
    Ok(())
  }

  fn using_ref(&mut self, c: CommandId, r: RefId) -> Result<(), EngineError> {
    if !self.emulating(c) {
      return Ok(());
    }
    self.output.using_ref(c, r)?;

    self.command_mut(c)?.ensure_ref(r);
    if let Some(reference) = self.command_mut(c)?.ref_at_mut(r) {
      reference.add_user();
    }
    Ok(())
  }

  fn done_with_ref(&mut self, c: CommandId, r: RefId) -> Result<(), EngineError> {
    if !self.emulating(c) {
      return Ok(());
    }
    self.output.done_with_ref(c, r)?;

    if let Some(reference) = self.command_mut(c)?.ref_at_mut(r) {
      reference.remove_user();
    }
    Ok(())
  }

  fn compare_refs(&mut self, c: CommandId, r1: RefId, r2: RefId, outcome: RefOutcome) -> Result<(), EngineError> {
    if !self.emulating(c) {
      return Ok(());
    }
    self.output.compare_refs(c, r1, r2, outcome)?;

    let a1 = self.ref_artifact(c, r1);
    let a2 = self.ref_artifact(c, r2);

    let matched = match outcome {
      RefOutcome::SameInstance => a1 == a2,
      RefOutcome::DifferentInstances => a1 != a2,
    };
    if !matched {
      self.observer.observe_ref_mismatch(c, r1, r2, outcome);
    }
    Ok(())
  }

  fn expect_result(
    &mut self,
    c: CommandId,
    scenario: Scenario,
    r: RefId,
    expected: i32,
  ) -> Result<(), EngineError> {
    if !self.emulating(c) {
      return Ok(());
    }
    self.output.expect_result(c, scenario, r, expected)?;

    self.command_mut(c)?.ensure_ref(r);
    let observed = self
      .command(c)?
      .ref_at(r)
      .map(|reference| reference.result_code())
      .unwrap_or_default();
    if observed != expected {
      self.observer.observe_resolution_change(c, scenario, r, expected, observed);
    }
    Ok(())
  }

  fn match_metadata(
    &mut self,
    c: CommandId,
    scenario: Scenario,
    r: RefId,
    version: &MetadataData,
  ) -> Result<(), EngineError> {
    if !self.emulating(c) {
      return Ok(());
    }
    self.output.match_metadata(c, scenario, r, version)?;

    // An unresolved reference already reported a change.
    let Some(a) = self.ref_artifact(c, r) else {
      return Ok(());
    };
    let expected = version.materialize();

    match scenario {
      Scenario::Build => {
        let current = self.env.artifact(a).current_metadata();
        current.state.mark_accessed();
        self.signal_input(c, a, &Version::Metadata(current.clone()), InputType::Accessed)?;

        if !current.matches(&expected) {
          self.observer.observe_mismatch(
            c,
            scenario,
            a,
            Some(&Version::Metadata(current)),
            &Version::Metadata(expected),
          );
        }
      }
      Scenario::PostBuild => {
        // Post-build predicates compare against the state found on disk
        // when this build admitted the artifact.
        let initial = self.env.artifact(a).initial_metadata();
        match initial {
          Some(init) if init.matches(&expected) => {}
          observed => {
            let observed = observed.map(Version::Metadata);
            self
              .observer
              .observe_mismatch(c, scenario, a, observed.as_ref(), &Version::Metadata(expected));
          }
        }
      }
    }
    Ok(())
  }

  fn match_content(
    &mut self,
    c: CommandId,
    scenario: Scenario,
    r: RefId,
    version: &ContentData,
  ) -> Result<(), EngineError> {
    if !self.emulating(c) {
      return Ok(());
    }
    self.output.match_content(c, scenario, r, version)?;

    let Some(a) = self.ref_artifact(c, r) else {
      return Ok(());
    };

    // Pipes have no persistent state to mismatch; record the dependency and
    // move on.
    if self.env.artifact(a).is_pipe() {
      if let Some(current) = self.env.artifact(a).current_content() {
        current.state().mark_accessed();
        self.signal_input(c, a, &Version::Content(current), InputType::Accessed)?;
      }
      return Ok(());
    }

    let expected = version.materialize();
    let path = self.env.path_of(a).cloned();

    match scenario {
      Scenario::Build => {
        let Some(current) = self.env.content_of(a) else {
          return Ok(());
        };
        current.state().mark_accessed();
        self.signal_input(c, a, &Version::Content(current.clone()), InputType::Accessed)?;

        if self.content_mismatch(&current, &expected, path.as_ref()) {
          self.observer.observe_mismatch(
            c,
            scenario,
            a,
            Some(&Version::Content(current)),
            &Version::Content(expected),
          );
        }
      }
      Scenario::PostBuild => {
        let initial = self.env.artifact(a).initial_content();
        match initial {
          Some(init) if !self.content_mismatch(&init, &expected, path.as_ref()) => {}
          observed => {
            let observed = observed.map(Version::Content);
            self
              .observer
              .observe_mismatch(c, scenario, a, observed.as_ref(), &Version::Content(expected));
          }
        }
      }
    }
    Ok(())
  }

  fn update_metadata(&mut self, c: CommandId, r: RefId, version: &MetadataData) -> Result<(), EngineError> {
    if !self.emulating(c) {
      return Ok(());
    }
    self.output.update_metadata(c, r, version)?;

    let Some(a) = self.ref_artifact(c, r) else {
      return Ok(());
    };

    let written = version.materialize();
    written.state.created_by(c);
    self.env.artifact_mut(a).apply_metadata(written.clone());
    self.signal_output(c, a, &Version::Metadata(written));
    Ok(())
  }

  fn update_content(&mut self, c: CommandId, r: RefId, version: &ContentData) -> Result<(), EngineError> {
    if !self.emulating(c) {
      return Ok(());
    }
    self.output.update_content(c, r, version)?;

    let Some(a) = self.ref_artifact(c, r) else {
      return Ok(());
    };

    let written = version.materialize();
    written.state().created_by(c);
    self.env.artifact_mut(a).apply_content(written.clone());
    self.signal_output(c, a, &Version::Content(written));
    Ok(())
  }

  fn add_entry(&mut self, c: CommandId, dir: RefId, name: &str, target: RefId) -> Result<(), EngineError> {
    if !self.emulating(c) {
      return Ok(());
    }
    self.output.add_entry(c, dir, name, target)?;

    let (Some(dir_a), Some(target_a)) = (self.ref_artifact(c, dir), self.ref_artifact(c, target)) else {
      return Ok(());
    };

    let entry = Rc::new(DirEntryVersion::link(name.to_string(), target_a));
    entry.state.created_by(c);
    let entry = ContentVersion::DirEntry(entry);

    self.env.artifact_mut(dir_a).apply_content(entry.clone());
    if let Some(dir_path) = self.env.path_of(dir_a).cloned() {
      self.env.set_path(target_a, dir_path.join(name));
      self.env.artifact_mut(target_a).set_name(name);
    }
    self.signal_output(c, dir_a, &Version::Content(entry));
    Ok(())
  }

  fn remove_entry(&mut self, c: CommandId, dir: RefId, name: &str, target: RefId) -> Result<(), EngineError> {
    if !self.emulating(c) {
      return Ok(());
    }
    self.output.remove_entry(c, dir, name, target)?;

    let (Some(dir_a), Some(target_a)) = (self.ref_artifact(c, dir), self.ref_artifact(c, target)) else {
      return Ok(());
    };

    let entry = Rc::new(DirEntryVersion::unlink(name.to_string(), target_a));
    entry.state.created_by(c);
    let entry = ContentVersion::DirEntry(entry);

    self.env.artifact_mut(dir_a).apply_content(entry.clone());
    if let Some(dir_path) = self.env.path_of(dir_a).cloned() {
      if self.env.path_of(target_a) == Some(&dir_path.join(name)) {
        self.env.clear_path(target_a);
      }
    }
    self.signal_output(c, dir_a, &Version::Content(entry));
    Ok(())
  }

  fn launch(
    &mut self,
    c: CommandId,
    child: CommandId,
    refs: &[(RefId, RefId)],
    def: &CommandDef,
  ) -> Result<(), EngineError> {
    if !self.emulating(c) {
      return Ok(());
    }

    self.insert_command(child, def);

    if !self.command(child)?.executed {
      self.observer.observe_command_never_run(child);
    }
    self.observer.observe_launch(Some(c), child);
    self.command_mut(c)?.children.push(child);

    // Hand the child its initial refs from the parent's table.
    for (parent_ref, child_ref) in refs {
      self.command_mut(c)?.ensure_ref(*parent_ref);
      let copied = self.ref_of(c, *parent_ref)?.duplicate();
      self.command_mut(child)?.set_ref(*child_ref, copied);
    }

    let must_rerun = self.plan.must_rerun(child);
    let print = must_rerun && (self.options.print_on_run || self.options.dry_run);
    let run = must_rerun && !self.options.dry_run;

    if print {
      println!("{}", self.command(child)?.short_name(self.options.command_length));
    }

    // The executed flag must be updated before the launch is mirrored so the
    // output trace records the child as run.
    if run {
      self.command_mut(child)?.executed = true;
    }
    let def_now = self.command(child)?.def();
    self.output.define_command(child, &def_now)?;
    self.output.launch(c, child, refs, &def_now)?;

    if run {
      debug!(command = %child, "launching command");
      self.count_traced_command();
      self.commit_launch_deps(child)?;
      self.start_tracee(child)?;
    } else {
      self.count_emulated_command();
    }
    Ok(())
  }

  fn join(&mut self, c: CommandId, child: CommandId, exit_status: i32) -> Result<(), EngineError> {
    if !self.emulating(c) {
      return Ok(());
    }

    // A running child must finish before the join can compare; its Exit
    // step enters the output ahead of this Join, matching traced order.
    self.wait_for(child)?;
    self.output.join(c, child, exit_status)?;

    match self.exit_status_of(child) {
      Some(observed) if observed != exit_status => {
        self.observer.observe_exit_code_change(c, child, exit_status, observed);
      }
      None => {
        // The trace recorded a join but never the child's exit; treat the
        // child as never having completed a run.
        self.observer.observe_command_never_run(child);
      }
      _ => {}
    }
    Ok(())
  }

  fn exit(&mut self, c: CommandId, exit_status: i32) -> Result<(), EngineError> {
    if !self.emulating(c) {
      return Ok(());
    }
    self.output.exit(c, exit_status)?;

    self.exited.insert(c);
    self.command_mut(c)?.exit_status = Some(exit_status);
    Ok(())
  }

  fn finish(&mut self) -> Result<(), EngineError> {
    self.finish_build()
  }
}
