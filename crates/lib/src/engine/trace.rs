//! The trace path: admitting freshly observed operations.
//!
//! A tracing backend calls these as it decodes syscalls from running
//! commands. The filesystem is the source of truth here, so versions enter
//! the model committed. Reads and writes pass through the artifact access
//! filters, which elide redundant adjacent accesses from the trace.

use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;

use tracing::{debug, warn};

use super::{Build, EngineError};
use crate::artifact::ArtifactId;
use crate::command::{CommandDef, CommandId, Ref, RefId, RefOutcome};
use crate::flags::AccessFlags;
use crate::plan::InputType;
use crate::trace::{ContentData, MetadataData, TraceSink};
use crate::version::{ContentVersion, DirEntryVersion, Scenario, Version};

impl Build<'_> {
  /// A traced command referenced a new anonymous pipe.
  pub fn trace_pipe_ref(&mut self, c: CommandId) -> Result<(RefId, RefId), EngineError> {
    self.count_traced_step();

    let read_end = self.command_mut(c)?.alloc_ref();
    let write_end = self.command_mut(c)?.alloc_ref();
    self.output.pipe_ref(c, read_end, write_end)?;

    let pipe = self.env.create_pipe(Some(c));
    let command = self.command_mut(c)?;
    command.set_ref(read_end, Ref::resolved(AccessFlags::read_only(), pipe));
    command.set_ref(write_end, Ref::resolved(AccessFlags::write_only(), pipe));

    Ok((read_end, write_end))
  }

  /// A traced command referenced a new anonymous file.
  pub fn trace_file_ref(&mut self, c: CommandId, mode: u32) -> Result<RefId, EngineError> {
    self.count_traced_step();

    let output = self.command_mut(c)?.alloc_ref();
    self.output.file_ref(c, mode, output)?;

    let file = self.env.create_file(Some(c), mode, true);
    self.command_mut(c)?.set_ref(output, Ref::resolved(AccessFlags::read_write(), file));

    Ok(output)
  }

  /// A traced command referenced a new anonymous symlink.
  pub fn trace_symlink_ref(&mut self, c: CommandId, target: &Path) -> Result<RefId, EngineError> {
    self.count_traced_step();

    let output = self.command_mut(c)?.alloc_ref();
    self.output.symlink_ref(c, target, output)?;

    let link = self.env.create_symlink(Some(c), target.to_path_buf(), true);
    let flags = AccessFlags {
      read: true,
      write: true,
      exec: true,
      ..Default::default()
    };
    self.command_mut(c)?.set_ref(output, Ref::resolved(flags, link));

    Ok(output)
  }

  /// A traced command referenced a new anonymous directory.
  pub fn trace_dir_ref(&mut self, c: CommandId, mode: u32) -> Result<RefId, EngineError> {
    self.count_traced_step();

    let output = self.command_mut(c)?.alloc_ref();
    self.output.dir_ref(c, mode, output)?;

    let dir = self.env.create_dir(Some(c), mode, true);
    let flags = AccessFlags {
      read: true,
      write: true,
      exec: true,
      ..Default::default()
    };
    self.command_mut(c)?.set_ref(output, Ref::resolved(flags, dir));

    Ok(output)
  }

  /// A traced command made a reference with a path.
  pub fn trace_path_ref(
    &mut self,
    c: CommandId,
    base: RefId,
    path: &Path,
    flags: AccessFlags,
  ) -> Result<RefId, EngineError> {
    self.count_traced_step();

    let output = self.command_mut(c)?.alloc_ref();
    self.output.path_ref(c, base, path, flags, output)?;

    let base_ref = self.ref_of(c, base)?;
    let Some(base_artifact) = base_ref.artifact() else {
      let errno = base_ref.result_code();
      self.command_mut(c)?.set_ref(output, Ref::failed(flags, errno));
      return Ok(output);
    };

    // The tracee already performed this access, so anything the resolution
    // creates is on disk.
    let outcome = self.env.resolve(base_artifact, path, &flags, true, Some(c));
    self.apply_effects(c, outcome.effects)?;

    let reference = match outcome.result {
      Ok((artifact, granted)) => Ref::resolved(granted, artifact),
      Err(errno) => Ref::failed(flags, errno),
    };
    self.command_mut(c)?.set_ref(output, reference);

    Ok(output)
  }

  /// A traced command retained a handle to a ref. Only the first open of a
  /// given ref enters the trace.
  pub fn trace_using_ref(&mut self, c: CommandId, r: RefId) -> Result<(), EngineError> {
    self.command_mut(c)?.ensure_ref(r);
    let first = self
      .command_mut(c)?
      .ref_at_mut(r)
      .map(|reference| reference.add_user())
      .unwrap_or(false);

    if first {
      self.count_traced_step();
      self.output.using_ref(c, r)?;
    }
    Ok(())
  }

  /// A traced command closed a handle to a ref. Only the last close enters
  /// the trace.
  pub fn trace_done_with_ref(&mut self, c: CommandId, r: RefId) -> Result<(), EngineError> {
    let last = self
      .command_mut(c)?
      .ref_at_mut(r)
      .map(|reference| reference.remove_user())
      .unwrap_or(false);

    if last {
      self.count_traced_step();
      self.output.done_with_ref(c, r)?;
    }
    Ok(())
  }

  /// A traced command compared two references.
  pub fn trace_compare_refs(
    &mut self,
    c: CommandId,
    r1: RefId,
    r2: RefId,
    outcome: RefOutcome,
  ) -> Result<(), EngineError> {
    self.count_traced_step();
    self.output.compare_refs(c, r1, r2, outcome)
  }

  /// A traced command observed a reference resolve with a result. With no
  /// explicit result, the model's resolution is recorded.
  pub fn trace_expect_result(&mut self, c: CommandId, r: RefId, expected: Option<i32>) -> Result<(), EngineError> {
    self.count_traced_step();

    let modeled = self.ref_of(c, r)?.result_code();
    let expected = expected.unwrap_or(modeled);

    if modeled != expected {
      warn!(
        command = %c,
        r = %r,
        modeled,
        observed = expected,
        "model resolution disagrees with traced syscall result"
      );
    }

    self.output.expect_result(c, Scenario::Build, r, expected)
  }

  /// A traced command read an artifact's metadata.
  pub fn trace_match_metadata(&mut self, c: CommandId, r: RefId) -> Result<(), EngineError> {
    let a = self.require_artifact(c, r)?;

    if !self.env.artifact(a).metadata_filter.read_required(&self.options, c, r) {
      return Ok(());
    }
    self.count_traced_step();

    let expected = self.env.artifact(a).current_metadata();
    expected.state.mark_accessed();
    self.signal_input(c, a, &Version::Metadata(expected.clone()), InputType::Accessed)?;

    self.output.match_metadata(c, Scenario::Build, r, &MetadataData::from_version(&expected))?;
    self.env.artifact_mut(a).metadata_filter.read(c, r);
    Ok(())
  }

  /// A traced command read an artifact's content.
  pub fn trace_match_content(&mut self, c: CommandId, r: RefId) -> Result<(), EngineError> {
    let a = self.require_artifact(c, r)?;

    if !self.env.artifact(a).content_filter.read_required(&self.options, c, r) {
      return Ok(());
    }

    let Some(expected) = self.env.content_of(a) else {
      return Ok(());
    };
    self.count_traced_step();

    expected.state().mark_accessed();
    self.signal_input(c, a, &Version::Content(expected.clone()), InputType::Accessed)?;

    // A version written by another command needs a fingerprint so the next
    // build can compare against it.
    if let ContentVersion::File(v) = &expected {
      if v.state.creator() != Some(c) && !v.has_fingerprint() {
        if let Some(path) = self.env.path_of(a).cloned() {
          if let Err(e) = v.fingerprint(&path) {
            warn!(path = %path.display(), error = %e, "could not fingerprint accessed content");
          }
        }
      }
    }

    if let Some(data) = ContentData::from_version(&expected) {
      self.output.match_content(c, Scenario::Build, r, &data)?;
    }
    self.env.artifact_mut(a).content_filter.read(c, r);
    Ok(())
  }

  /// A traced command modified an artifact's metadata.
  pub fn trace_update_metadata(&mut self, c: CommandId, r: RefId, version: MetadataData) -> Result<(), EngineError> {
    let a = self.require_artifact(c, r)?;

    if !self.env.artifact(a).metadata_filter.write_required(&self.options, c, r) {
      return Ok(());
    }
    self.count_traced_step();

    let written = version.materialize();
    written.state.created_by(c);
    written.state.set_committed(true);

    self.output.update_metadata(c, r, &version)?;
    self.env.artifact_mut(a).apply_metadata(written.clone());

    let options = self.options.clone();
    self
      .env
      .artifact_mut(a)
      .metadata_filter
      .write(&options, c, r, Version::Metadata(written.clone()));

    self.signal_output(c, a, &Version::Metadata(written));
    Ok(())
  }

  /// A traced command wrote a new content version to an artifact.
  pub fn trace_update_content(&mut self, c: CommandId, r: RefId, version: ContentData) -> Result<(), EngineError> {
    let a = self.require_artifact(c, r)?;

    if !self.env.artifact(a).content_filter.write_required(&self.options, c, r) {
      return Ok(());
    }
    self.count_traced_step();

    let written = version.materialize();
    written.state().created_by(c);
    written.state().set_committed(true);

    self.output.update_content(c, r, &version)?;
    self.env.artifact_mut(a).apply_content(written.clone());

    let options = self.options.clone();
    self
      .env
      .artifact_mut(a)
      .content_filter
      .write(&options, c, r, Version::Content(written.clone()));

    self.signal_output(c, a, &Version::Content(written));
    Ok(())
  }

  /// A traced command linked an entry into a directory.
  pub fn trace_add_entry(&mut self, c: CommandId, dir: RefId, name: &str, target: RefId) -> Result<(), EngineError> {
    let dir_a = self.require_artifact(c, dir)?;
    let target_a = self.require_artifact(c, target)?;
    self.count_traced_step();

    self.output.add_entry(c, dir, name, target)?;

    let entry = Rc::new(DirEntryVersion::link(name.to_string(), target_a));
    entry.state.created_by(c);
    entry.state.set_committed(true);
    let entry = ContentVersion::DirEntry(entry);

    self.env.artifact_mut(dir_a).apply_content(entry.clone());
    if let Some(dir_path) = self.env.path_of(dir_a).cloned() {
      self.env.set_path(target_a, dir_path.join(name));
      self.env.artifact_mut(target_a).set_name(name);
    }
    self.signal_output(c, dir_a, &Version::Content(entry));
    Ok(())
  }

  /// A traced command unlinked an entry from a directory.
  pub fn trace_remove_entry(&mut self, c: CommandId, dir: RefId, name: &str, target: RefId) -> Result<(), EngineError> {
    let dir_a = self.require_artifact(c, dir)?;
    let target_a = self.require_artifact(c, target)?;
    self.count_traced_step();

    self.output.remove_entry(c, dir, name, target)?;

    let entry = Rc::new(DirEntryVersion::unlink(name.to_string(), target_a));
    entry.state.created_by(c);
    entry.state.set_committed(true);
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

  /// A traced command launched a child. Matches the child against the
  /// parent's recorded children so a rerunning process re-attaches to its
  /// prior identity; unmatched launches get fresh commands.
  pub fn trace_launch(
    &mut self,
    c: CommandId,
    exe_ref: RefId,
    args: Vec<String>,
    fds: BTreeMap<i32, RefId>,
    cwd_ref: RefId,
    root_ref: RefId,
  ) -> Result<CommandId, EngineError> {
    self.count_traced_step();
    self.count_traced_command();

    let exe_a = self.ref_artifact(c, exe_ref);
    let cwd_a = self.ref_artifact(c, cwd_ref);
    let root_a = self.ref_artifact(c, root_ref);

    let matched = self
      .command(c)?
      .children
      .iter()
      .copied()
      .find(|&child| self.command_matches(child, &args, &fds, exe_a, cwd_a, root_a));

    let child = match matched {
      Some(child) => {
        debug!(command = %child, "matched a previously recorded command");
        child
      }
      None => {
        let id = self.next_command_id();
        let mut child_fds = BTreeMap::new();
        for (index, fd) in fds.keys().enumerate() {
          child_fds.insert(*fd, RefId(3 + index as u32));
        }
        let def = CommandDef {
          args: args.clone(),
          exe: RefId(0),
          cwd: RefId(1),
          root: RefId(2),
          initial_fds: child_fds,
          executed: false,
        };
        self.insert_command(id, &def);
        debug!(command = %id, args = ?args, "admitted a new command");
        id
      }
    };

    // Hand the child its refs from the parent's current resolutions.
    let (child_exe, child_cwd, child_root, child_fds) = {
      let cmd = self.command(child)?;
      (cmd.exe, cmd.cwd, cmd.root, cmd.initial_fds.clone())
    };

    let mut mapping: Vec<(RefId, RefId)> = vec![
      (exe_ref, child_exe),
      (cwd_ref, child_cwd),
      (root_ref, child_root),
    ];
    for (fd, parent_ref) in &fds {
      if let Some(child_ref) = child_fds.get(fd) {
        mapping.push((*parent_ref, *child_ref));
      }
    }

    for (parent_ref, child_ref) in &mapping {
      let copied = self.ref_of(c, *parent_ref)?.duplicate();
      self.command_mut(child)?.set_ref(*child_ref, copied);
    }

    self.command_mut(child)?.executed = true;
    if !self.command(c)?.children.contains(&child) {
      self.command_mut(c)?.children.push(child);
    }

    let def_now = self.command(child)?.def();
    self.output.define_command(child, &def_now)?;
    self.output.launch(c, child, &mapping, &def_now)?;
    self.observer.observe_launch(Some(c), child);

    if self.options.print_on_run {
      println!("{}", self.command(child)?.short_name(self.options.command_length));
    }

    self.commit_launch_deps(child)?;
    Ok(child)
  }

  /// A traced command joined with a child.
  pub fn trace_join(&mut self, c: CommandId, child: CommandId, exit_status: i32) -> Result<(), EngineError> {
    self.count_traced_step();
    self.output.join(c, child, exit_status)?;
    self.command_mut(child)?.exit_status = Some(exit_status);
    Ok(())
  }

  /// A traced command exited.
  pub fn trace_exit(&mut self, c: CommandId, exit_status: i32) -> Result<(), EngineError> {
    self.count_traced_step();
    self.output.exit(c, exit_status)?;
    self.command_mut(c)?.exit_status = Some(exit_status);
    self.exited.insert(c);
    Ok(())
  }

  /// Trace-path steps come from live syscalls; a reference that never
  /// resolved here is an invariant violation, not a recorded change.
  fn require_artifact(&self, c: CommandId, r: RefId) -> Result<ArtifactId, EngineError> {
    self.ref_artifact(c, r).ok_or_else(|| EngineError::UnresolvedRef {
      command: self
        .commands
        .get(c.index())
        .map(|cmd| cmd.short_name(self.options.command_length))
        .unwrap_or_else(|| format!("{}", c)),
      r,
    })
  }

  fn command_matches(
    &self,
    child: CommandId,
    args: &[String],
    fds: &BTreeMap<i32, RefId>,
    exe_a: Option<ArtifactId>,
    cwd_a: Option<ArtifactId>,
    root_a: Option<ArtifactId>,
  ) -> bool {
    let Ok(command) = self.command(child) else {
      return false;
    };

    if command.args != args {
      return false;
    }
    if command.initial_fds.len() != fds.len()
      || !command.initial_fds.keys().eq(fds.keys())
    {
      return false;
    }

    let child_artifact = |r: RefId| command.ref_at(r).and_then(|reference| reference.artifact());

    child_artifact(command.exe) == exe_a
      && child_artifact(command.cwd) == cwd_a
      && child_artifact(command.root) == root_a
  }
}
