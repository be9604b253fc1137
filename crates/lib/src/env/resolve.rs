//! Path resolution against the modeled filesystem.
//!
//! Resolution walks the model, consulting the real filesystem only when a
//! name falls outside what has been modeled so far. It returns the final
//! artifact (or errno) plus the list of effects the walk had: traversal
//! inputs, creations, and truncations. The engine turns effects into
//! observer signals and trace bookkeeping, which keeps this module free of
//! engine callbacks.

use std::path::{Component, Path};
use std::rc::Rc;

use rustix::io::Errno;
use tracing::trace;

use super::Env;
use crate::artifact::ArtifactId;
use crate::command::CommandId;
use crate::consts::SYMLINK_FOLLOW_LIMIT;
use crate::flags::AccessFlags;
use crate::version::{ContentVersion, DirEntryVersion, FileVersion, Version};

/// One observable side effect of a resolution.
#[derive(Debug, Clone)]
pub enum ResolveEffect {
  /// The walk depended on a version of an artifact (a directory entry, a
  /// followed symlink target, or the final metadata check).
  Input { artifact: ArtifactId, version: Version },

  /// O_CREAT created `artifact` and linked it into `dir`.
  Created {
    artifact: ArtifactId,
    dir: ArtifactId,
    entry: ContentVersion,
  },

  /// O_TRUNC produced a fresh empty content version for `artifact`.
  Truncated {
    artifact: ArtifactId,
    version: ContentVersion,
  },
}

/// The result of a resolution: final artifact with granted access, or errno.
#[derive(Debug)]
pub struct ResolveOutcome {
  pub result: Result<(ArtifactId, AccessFlags), i32>,
  pub effects: Vec<ResolveEffect>,
}

/// Modeled outcome of looking one name up in one directory.
enum Lookup {
  Found { target: ArtifactId, via: Version },
  Absent { via: Version },
}

impl Env {
  /// Resolve `path` relative to `base`, applying open-style `flags`.
  ///
  /// `committed` marks resolutions observed from a live tracee: anything the
  /// walk creates already exists on disk. Emulated resolutions pass false
  /// and leave creations pending commit.
  pub fn resolve(
    &mut self,
    base: ArtifactId,
    path: &Path,
    flags: &AccessFlags,
    committed: bool,
    creator: Option<CommandId>,
  ) -> ResolveOutcome {
    let mut effects = Vec::new();
    let result = self.resolve_inner(base, path, flags, committed, creator, &mut effects, 0);
    trace!(base = %base, path = %path.display(), ok = result.is_ok(), "resolved path");
    ResolveOutcome { result, effects }
  }

  fn resolve_inner(
    &mut self,
    base: ArtifactId,
    path: &Path,
    flags: &AccessFlags,
    committed: bool,
    creator: Option<CommandId>,
    effects: &mut Vec<ResolveEffect>,
    depth: u32,
  ) -> Result<(ArtifactId, AccessFlags), i32> {
    if depth > SYMLINK_FOLLOW_LIMIT {
      return Err(Errno::LOOP.raw_os_error());
    }

    // Rebase onto the root when the base has a known path, so that `..`
    // traverses the physical chain built during this walk.
    let (start, walk_path) = if path.is_absolute() {
      (self.root(), path.to_path_buf())
    } else if base == self.root() {
      (self.root(), path.to_path_buf())
    } else if let Some(base_path) = self.path_of(base) {
      (self.root(), base_path.join(path))
    } else {
      (base, path.to_path_buf())
    };

    let components: Vec<Component> = walk_path
      .components()
      .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
      .collect();

    // An empty path resolves to the base itself.
    if components.is_empty() {
      return self.finish(start, flags, committed, creator, effects);
    }

    let mut stack: Vec<ArtifactId> = vec![start];

    for (index, component) in components.iter().enumerate() {
      let is_last = index == components.len() - 1;
      let current = *stack.last().unwrap_or(&start);

      match component {
        Component::CurDir => {
          if is_last {
            return self.finish(current, flags, committed, creator, effects);
          }
          continue;
        }
        Component::ParentDir => {
          if stack.len() > 1 {
            stack.pop();
          }
          if is_last {
            let top = *stack.last().unwrap_or(&start);
            return self.finish(top, flags, committed, creator, effects);
          }
          continue;
        }
        Component::Normal(name) => {
          let name = name.to_string_lossy().into_owned();

          if !self.artifact(current).is_dir() {
            return Err(Errno::NOTDIR.raw_os_error());
          }

          match self.dir_lookup(current, &name) {
            Lookup::Found { target, via } => {
              effects.push(ResolveEffect::Input {
                artifact: current,
                version: via,
              });

              if self.artifact(target).is_symlink() {
                // With O_EXCL a pre-existing name fails before any follow.
                if is_last && flags.create && flags.exclusive {
                  return Err(Errno::EXIST.raw_os_error());
                }

                if is_last && flags.nofollow {
                  return self.finish(target, flags, committed, creator, effects);
                }

                let followed =
                  self.follow_symlink(current, target, flags, committed, creator, effects, depth, is_last)?;
                if is_last {
                  return Ok(followed);
                }
                stack.push(followed.0);
                continue;
              }

              if is_last {
                if flags.create && flags.exclusive {
                  return Err(Errno::EXIST.raw_os_error());
                }
                return self.finish(target, flags, committed, creator, effects);
              }

              stack.push(target);
            }
            Lookup::Absent { via } => {
              effects.push(ResolveEffect::Input {
                artifact: current,
                version: via,
              });

              if is_last && flags.create {
                return Ok(self.create_at(current, &name, flags, committed, creator, effects));
              }

              return Err(Errno::NOENT.raw_os_error());
            }
          }
        }
        Component::RootDir | Component::Prefix(_) => continue,
      }
    }

    Err(Errno::NOENT.raw_os_error())
  }

  /// Follow a symlink found at `name` in `dir`.
  #[allow(clippy::too_many_arguments)]
  fn follow_symlink(
    &mut self,
    dir: ArtifactId,
    link: ArtifactId,
    flags: &AccessFlags,
    committed: bool,
    creator: Option<CommandId>,
    effects: &mut Vec<ResolveEffect>,
    depth: u32,
    is_last: bool,
  ) -> Result<(ArtifactId, AccessFlags), i32> {
    let Some(ContentVersion::Symlink(content)) = self.artifact(link).current_content() else {
      return Err(Errno::INVAL.raw_os_error());
    };

    effects.push(ResolveEffect::Input {
      artifact: link,
      version: Version::Content(ContentVersion::Symlink(content.clone())),
    });

    let target = content.target().to_path_buf();
    let follow_flags = if is_last { *flags } else { AccessFlags::read_exec() };

    self.resolve_inner(dir, &target, &follow_flags, committed, creator, effects, depth + 1)
  }

  /// Final-component checks: type constraints, permissions, truncation.
  fn finish(
    &mut self,
    target: ArtifactId,
    flags: &AccessFlags,
    committed: bool,
    creator: Option<CommandId>,
    effects: &mut Vec<ResolveEffect>,
  ) -> Result<(ArtifactId, AccessFlags), i32> {
    let artifact = self.artifact(target);

    if flags.directory && !artifact.is_dir() {
      return Err(Errno::NOTDIR.raw_os_error());
    }

    let metadata = artifact.current_metadata();
    effects.push(ResolveEffect::Input {
      artifact: target,
      version: Version::Metadata(metadata.clone()),
    });

    if !metadata.check_access(flags, self.identity()) {
      return Err(Errno::ACCESS.raw_os_error());
    }

    if flags.truncate && flags.write && artifact.is_file() {
      let truncated = Rc::new(FileVersion::empty());
      truncated.state.set_committed(committed);
      if let Some(c) = creator {
        truncated.state.created_by(c);
      }
      effects.push(ResolveEffect::Truncated {
        artifact: target,
        version: ContentVersion::File(truncated),
      });
    }

    Ok((target, *flags))
  }

  /// O_CREAT at a missing final component.
  fn create_at(
    &mut self,
    dir: ArtifactId,
    name: &str,
    flags: &AccessFlags,
    committed: bool,
    creator: Option<CommandId>,
    effects: &mut Vec<ResolveEffect>,
  ) -> (ArtifactId, AccessFlags) {
    let created = self.create_file(creator, flags.mode, committed);

    let entry = Rc::new(DirEntryVersion::link(name.to_string(), created));
    entry.state.set_committed(committed);
    if let Some(c) = creator {
      entry.state.created_by(c);
    }
    let entry = ContentVersion::DirEntry(entry);

    self.artifact_mut(dir).apply_content(entry.clone());

    if let Some(dir_path) = self.path_of(dir).cloned() {
      self.set_path(created, dir_path.join(name));
    }
    self.artifact_mut(created).set_name(name);

    effects.push(ResolveEffect::Created {
      artifact: created,
      dir,
      entry,
    });

    (created, *flags)
  }

  /// Look `name` up in `dir`, consulting the filesystem for names under an
  /// existing-directory baseline that have not been modeled yet.
  fn dir_lookup(&mut self, dir: ArtifactId, name: &str) -> Lookup {
    if let Some(slot) = self.artifact(dir).dir_entry(name) {
      let via = slot
        .version
        .clone()
        .map(Version::Content)
        .unwrap_or_else(|| {
          Version::Content(ContentVersion::DirList(
            self
              .artifact(dir)
              .dir_base()
              .unwrap_or_else(|| Rc::new(crate::version::DirListVersion::created())),
          ))
        });

      return match slot.target {
        Some(target) => Lookup::Found { target, via },
        None => Lookup::Absent { via },
      };
    }

    let base = self
      .artifact(dir)
      .dir_base()
      .unwrap_or_else(|| Rc::new(crate::version::DirListVersion::created()));
    let via = Version::Content(ContentVersion::DirList(base.clone()));

    if base.is_baseline() {
      if let Some(dir_path) = self.path_of(dir).cloned() {
        let child_path = dir_path.join(name);
        if let Some(found) = self.admit_from_disk(&child_path) {
          self.artifact_mut(dir).model_dir_entry(name.to_string(), Some(found));
          return Lookup::Found { target: found, via };
        }
      }
    }

    self.artifact_mut(dir).model_dir_entry(name.to_string(), None);
    Lookup::Absent { via }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::platform::TraceeIdentity;
  use tempfile::TempDir;

  fn env() -> Env {
    Env::new(TraceeIdentity {
      euid: rustix::process::geteuid().as_raw(),
      egid: rustix::process::getegid().as_raw(),
      umask: 0o022,
    })
  }

  fn resolve_ok(env: &mut Env, base: ArtifactId, path: &Path, flags: AccessFlags) -> ArtifactId {
    let outcome = env.resolve(base, path, &flags, false, Some(CommandId(1)));
    outcome.result.expect("resolution should succeed").0
  }

  #[test]
  fn resolves_existing_file() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("input"), b"x").unwrap();

    let mut env = env();
    let root = env.root();
    let id = resolve_ok(&mut env, root, &temp.path().join("input"), AccessFlags::read_only());
    assert!(env.artifact(id).is_file());
    assert_eq!(env.path_of(id), Some(&temp.path().join("input")));
  }

  #[test]
  fn missing_file_reports_enoent() {
    let temp = TempDir::new().unwrap();
    let mut env = env();
    let root = env.root();

    let outcome = env.resolve(
      root,
      &temp.path().join("missing"),
      &AccessFlags::read_only(),
      false,
      None,
    );
    assert_eq!(outcome.result.unwrap_err(), Errno::NOENT.raw_os_error());
  }

  #[test]
  fn create_flag_creates_and_links() {
    let temp = TempDir::new().unwrap();
    let mut env = env();
    let root = env.root();

    let flags = AccessFlags {
      write: true,
      create: true,
      mode: 0o644,
      ..Default::default()
    };
    let outcome = env.resolve(root, &temp.path().join("out"), &flags, false, Some(CommandId(3)));
    let (id, _) = outcome.result.expect("creation should succeed");

    assert!(env.artifact(id).is_file());
    assert_eq!(env.path_of(id), Some(&temp.path().join("out")));
    assert!(outcome
      .effects
      .iter()
      .any(|e| matches!(e, ResolveEffect::Created { artifact, .. } if *artifact == id)));

    // Creation is modeled, not yet committed.
    assert!(!temp.path().join("out").exists());

    // A second resolution finds the modeled file.
    let again = resolve_ok(&mut env, root, &temp.path().join("out"), AccessFlags::read_only());
    assert_eq!(again, id);
  }

  #[test]
  fn exclusive_create_on_existing_reports_eexist() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("present"), b"x").unwrap();

    let mut env = env();
    let root = env.root();
    let flags = AccessFlags {
      write: true,
      create: true,
      exclusive: true,
      mode: 0o644,
      ..Default::default()
    };
    let outcome = env.resolve(root, &temp.path().join("present"), &flags, false, None);
    assert_eq!(outcome.result.unwrap_err(), Errno::EXIST.raw_os_error());
  }

  #[test]
  fn directory_flag_rejects_files() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("plain"), b"x").unwrap();

    let mut env = env();
    let root = env.root();
    let flags = AccessFlags {
      read: true,
      directory: true,
      ..Default::default()
    };
    let outcome = env.resolve(root, &temp.path().join("plain"), &flags, false, None);
    assert_eq!(outcome.result.unwrap_err(), Errno::NOTDIR.raw_os_error());
  }

  #[test]
  fn intermediate_file_reports_enotdir() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("plain"), b"x").unwrap();

    let mut env = env();
    let root = env.root();
    let outcome = env.resolve(
      root,
      &temp.path().join("plain/child"),
      &AccessFlags::read_only(),
      false,
      None,
    );
    assert_eq!(outcome.result.unwrap_err(), Errno::NOTDIR.raw_os_error());
  }

  #[test]
  fn follows_symlinks() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("real"), b"x").unwrap();
    std::os::unix::fs::symlink(temp.path().join("real"), temp.path().join("link")).unwrap();

    let mut env = env();
    let root = env.root();
    let through_link = resolve_ok(&mut env, root, &temp.path().join("link"), AccessFlags::read_only());
    let direct = resolve_ok(&mut env, root, &temp.path().join("real"), AccessFlags::read_only());
    assert_eq!(through_link, direct);
  }

  #[test]
  fn nofollow_returns_the_symlink() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("real"), b"x").unwrap();
    std::os::unix::fs::symlink("real", temp.path().join("link")).unwrap();

    let mut env = env();
    let root = env.root();
    let flags = AccessFlags {
      read: true,
      nofollow: true,
      ..Default::default()
    };
    let outcome = env.resolve(root, &temp.path().join("link"), &flags, false, None);
    let (id, _) = outcome.result.unwrap();
    assert!(env.artifact(id).is_symlink());
  }

  #[test]
  fn symlink_loops_report_eloop() {
    let temp = TempDir::new().unwrap();
    std::os::unix::fs::symlink(temp.path().join("b"), temp.path().join("a")).unwrap();
    std::os::unix::fs::symlink(temp.path().join("a"), temp.path().join("b")).unwrap();

    let mut env = env();
    let root = env.root();
    let outcome = env.resolve(root, &temp.path().join("a"), &AccessFlags::read_only(), false, None);
    assert_eq!(outcome.result.unwrap_err(), Errno::LOOP.raw_os_error());
  }

  #[test]
  fn truncate_produces_effect() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("log"), b"old contents").unwrap();

    let mut env = env();
    let root = env.root();
    let flags = AccessFlags {
      write: true,
      truncate: true,
      ..Default::default()
    };
    let outcome = env.resolve(root, &temp.path().join("log"), &flags, false, Some(CommandId(2)));
    assert!(outcome.result.is_ok());
    assert!(outcome
      .effects
      .iter()
      .any(|e| matches!(e, ResolveEffect::Truncated { .. })));
  }

  #[test]
  fn dotdot_walks_up() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir(temp.path().join("sub")).unwrap();
    std::fs::write(temp.path().join("file"), b"x").unwrap();

    let mut env = env();
    let root = env.root();
    let via_dotdot = resolve_ok(
      &mut env,
      root,
      &temp.path().join("sub/../file"),
      AccessFlags::read_only(),
    );
    let direct = resolve_ok(&mut env, root, &temp.path().join("file"), AccessFlags::read_only());
    assert_eq!(via_dotdot, direct);
  }

  #[test]
  fn relative_paths_resolve_from_base() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir(temp.path().join("sub")).unwrap();
    std::fs::write(temp.path().join("sub/file"), b"x").unwrap();

    let mut env = env();
    let root = env.root();
    let sub = resolve_ok(&mut env, root, &temp.path().join("sub"), AccessFlags::read_exec());
    let file = resolve_ok(&mut env, sub, Path::new("file"), AccessFlags::read_only());
    assert!(env.artifact(file).is_file());
  }
}
