//! Commands and their reference tables.
//!
//! A command is the recorded unit of execution: an executable reference, an
//! argument vector, an initial file-descriptor table, and working/root
//! directory references, plus the children it launched and its exit status.
//! References are addressed by small per-command integers so the trace can
//! name them compactly.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactId;
use crate::flags::AccessFlags;

/// Index into the engine's command arena. Ids are stable across a build and
/// reassigned canonically when a trace is written out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandId(pub u32);

impl CommandId {
  pub fn index(self) -> usize {
    self.0 as usize
  }
}

impl fmt::Display for CommandId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "c{}", self.0)
  }
}

/// Index into a command's ref table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RefId(pub u32);

impl RefId {
  pub fn index(self) -> usize {
    self.0 as usize
  }
}

impl fmt::Display for RefId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "r{}", self.0)
  }
}

/// The recorded outcome of comparing two references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefOutcome {
  SameInstance,
  DifferentInstances,
}

/// The outcome of resolving a reference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Resolution {
  #[default]
  Unresolved,
  Artifact(ArtifactId),
  Errno(i32),
}

/// A per-command handle to a resolved (or errno-failed) reference.
#[derive(Debug, Clone, Default)]
pub struct Ref {
  /// Access granted when the reference resolved.
  pub flags: AccessFlags,
  resolution: Resolution,
  users: u32,
}

impl Ref {
  pub fn resolved(flags: AccessFlags, artifact: ArtifactId) -> Self {
    Ref {
      flags,
      resolution: Resolution::Artifact(artifact),
      users: 0,
    }
  }

  pub fn failed(flags: AccessFlags, errno: i32) -> Self {
    Ref {
      flags,
      resolution: Resolution::Errno(errno),
      users: 0,
    }
  }

  pub fn resolution(&self) -> Resolution {
    self.resolution
  }

  pub fn artifact(&self) -> Option<ArtifactId> {
    match self.resolution {
      Resolution::Artifact(a) => Some(a),
      _ => None,
    }
  }

  pub fn is_resolved(&self) -> bool {
    matches!(self.resolution, Resolution::Artifact(_))
  }

  /// 0 on success, the errno otherwise. Unresolved refs read as EINVAL so a
  /// malformed trace fails predicates instead of matching them.
  pub fn result_code(&self) -> i32 {
    match self.resolution {
      Resolution::Artifact(_) => 0,
      Resolution::Errno(errno) => errno,
      Resolution::Unresolved => rustix::io::Errno::INVAL.raw_os_error(),
    }
  }

  /// Add a user; true if this is the first handle.
  pub fn add_user(&mut self) -> bool {
    self.users += 1;
    self.users == 1
  }

  /// Drop a user; true if this was the last handle.
  pub fn remove_user(&mut self) -> bool {
    if self.users > 0 {
      self.users -= 1;
    }
    self.users == 0
  }

  pub fn users(&self) -> u32 {
    self.users
  }

  /// A copy of this ref's resolution for handing to another command; the
  /// user count starts fresh.
  pub fn duplicate(&self) -> Ref {
    Ref {
      flags: self.flags,
      resolution: self.resolution,
      users: 0,
    }
  }
}

/// The serializable identity of a command, as stored in its trace record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDef {
  pub args: Vec<String>,
  pub exe: RefId,
  pub cwd: RefId,
  pub root: RefId,
  pub initial_fds: BTreeMap<i32, RefId>,
  pub executed: bool,
}

#[derive(Debug)]
pub struct Command {
  pub id: CommandId,
  pub args: Vec<String>,
  pub exe: RefId,
  pub cwd: RefId,
  pub root: RefId,
  pub initial_fds: BTreeMap<i32, RefId>,
  refs: Vec<Ref>,
  pub children: Vec<CommandId>,
  pub executed: bool,
  pub exit_status: Option<i32>,
}

impl Command {
  pub fn new(id: CommandId, def: &CommandDef) -> Self {
    let mut command = Command {
      id,
      args: def.args.clone(),
      exe: def.exe,
      cwd: def.cwd,
      root: def.root,
      initial_fds: def.initial_fds.clone(),
      refs: Vec::new(),
      children: Vec::new(),
      executed: def.executed,
      exit_status: None,
    };

    command.ensure_ref(def.exe);
    command.ensure_ref(def.cwd);
    command.ensure_ref(def.root);
    for ref_id in def.initial_fds.values() {
      command.ensure_ref(*ref_id);
    }

    command
  }

  pub fn def(&self) -> CommandDef {
    CommandDef {
      args: self.args.clone(),
      exe: self.exe,
      cwd: self.cwd,
      root: self.root,
      initial_fds: self.initial_fds.clone(),
      executed: self.executed,
    }
  }

  /// Allocate the next ref id.
  pub fn alloc_ref(&mut self) -> RefId {
    let id = RefId(self.refs.len() as u32);
    self.refs.push(Ref::default());
    id
  }

  /// Grow the ref table to cover an id named by a trace record.
  pub fn ensure_ref(&mut self, ref_id: RefId) {
    while self.refs.len() <= ref_id.index() {
      self.refs.push(Ref::default());
    }
  }

  pub fn ref_at(&self, ref_id: RefId) -> Option<&Ref> {
    self.refs.get(ref_id.index())
  }

  pub fn ref_at_mut(&mut self, ref_id: RefId) -> Option<&mut Ref> {
    self.refs.get_mut(ref_id.index())
  }

  pub fn set_ref(&mut self, ref_id: RefId, r: Ref) {
    self.ensure_ref(ref_id);
    self.refs[ref_id.index()] = r;
  }

  pub fn ref_count(&self) -> usize {
    self.refs.len()
  }

  /// The trace's virtual root: the container for the launch of the real
  /// build command, never itself executed.
  pub fn is_virtual_root(&self) -> bool {
    self.args.is_empty()
  }

  /// A short rendering for `--print-on-run` and check reports: argv[0]
  /// basename plus arguments, truncated to the column budget.
  pub fn short_name(&self, budget: usize) -> String {
    let mut result = match self.args.first() {
      Some(first) => first.rsplit('/').next().unwrap_or(first).to_string(),
      None => "<root>".to_string(),
    };

    for arg in self.args.iter().skip(1) {
      if result.len() >= budget {
        break;
      }
      result.push(' ');
      result.push_str(arg);
    }

    if result.len() > budget && budget > 3 {
      result.truncate(budget - 3);
      result.push_str("...");
    }

    result
  }

  pub fn full_name(&self) -> String {
    self.args.join(" ")
  }
}
