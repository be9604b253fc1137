//! The modeled build environment.
//!
//! `Env` owns every artifact and produces them on demand: well-known
//! streams, anonymous files/symlinks/dirs/pipes created by commands, and
//! filesystem entities admitted lazily as paths resolve to them. It also
//! reconstructs paths on demand; artifacts never back-reference the
//! directories that contain them.

mod resolve;

pub use resolve::{ResolveEffect, ResolveOutcome};

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::debug;

use crate::artifact::{Artifact, ArtifactId, SpecialEntity};
use crate::command::CommandId;
use crate::platform::TraceeIdentity;
use crate::version::{
  ContentVersion, DirListVersion, FileVersion, MetadataVersion, SymlinkVersion, VersionState,
};

pub struct Env {
  artifacts: Vec<Artifact>,
  root: ArtifactId,
  stdin: ArtifactId,
  stdout: ArtifactId,
  stderr: ArtifactId,
  paths: HashMap<ArtifactId, PathBuf>,
  identity: TraceeIdentity,
}

impl Env {
  pub fn new(identity: TraceeIdentity) -> Self {
    let mut env = Env {
      artifacts: Vec::new(),
      root: ArtifactId(0),
      stdin: ArtifactId(0),
      stdout: ArtifactId(0),
      stderr: ArtifactId(0),
      paths: HashMap::new(),
      identity,
    };

    env.root = env
      .admit_from_disk(Path::new("/"))
      .unwrap_or_else(|| env.synthetic_root());
    env.set_name(env.root, "/");

    env.stdin = env.special_pipe(SpecialEntity::Stdin);
    env.stdout = env.special_pipe(SpecialEntity::Stdout);
    env.stderr = env.special_pipe(SpecialEntity::Stderr);

    env
  }

  /// A stand-in root for environments where `/` cannot be read.
  fn synthetic_root(&mut self) -> ArtifactId {
    let metadata = Rc::new(MetadataVersion::new(0, 0, 0o40755));
    metadata.state.set_committed(true);
    let base = Rc::new(DirListVersion::baseline(BTreeSet::new()));
    let id = self.push(|id| Artifact::dir(id, metadata, base));
    self.paths.insert(id, PathBuf::from("/"));
    id
  }

  fn special_pipe(&mut self, entity: SpecialEntity) -> ArtifactId {
    let metadata = Rc::new(MetadataVersion::new(
      self.identity.euid,
      self.identity.egid,
      0o10600,
    ));
    metadata.state.set_committed(true);
    self.push(|id| Artifact::pipe(id, metadata, Some(entity)))
  }

  fn push(&mut self, build: impl FnOnce(ArtifactId) -> Artifact) -> ArtifactId {
    let id = ArtifactId(self.artifacts.len() as u32);
    self.artifacts.push(build(id));
    id
  }

  pub fn identity(&self) -> &TraceeIdentity {
    &self.identity
  }

  pub fn root(&self) -> ArtifactId {
    self.root
  }

  pub fn stdin(&self) -> ArtifactId {
    self.stdin
  }

  pub fn stdout(&self) -> ArtifactId {
    self.stdout
  }

  pub fn stderr(&self) -> ArtifactId {
    self.stderr
  }

  pub fn artifact(&self, id: ArtifactId) -> &Artifact {
    &self.artifacts[id.index()]
  }

  pub fn artifact_mut(&mut self, id: ArtifactId) -> &mut Artifact {
    &mut self.artifacts[id.index()]
  }

  pub fn artifact_count(&self) -> usize {
    self.artifacts.len()
  }

  pub fn artifact_ids(&self) -> impl Iterator<Item = ArtifactId> {
    (0..self.artifacts.len() as u32).map(ArtifactId)
  }

  /// The committed path of an artifact, if one is known.
  pub fn path_of(&self, id: ArtifactId) -> Option<&PathBuf> {
    self.paths.get(&id)
  }

  pub fn set_path(&mut self, id: ArtifactId, path: PathBuf) {
    self.paths.insert(id, path);
  }

  pub fn clear_path(&mut self, id: ArtifactId) {
    self.paths.remove(&id);
  }

  fn set_name(&mut self, id: ArtifactId, name: &str) {
    self.artifact_mut(id).set_name(name);
  }

  /// Stat a path and admit whatever is there as a committed artifact.
  pub fn admit_from_disk(&mut self, path: &Path) -> Option<ArtifactId> {
    let meta = std::fs::symlink_metadata(path).ok()?;
    let metadata = Rc::new(MetadataVersion::from_disk(&meta));

    let id = if meta.file_type().is_symlink() {
      let target = std::fs::read_link(path).ok()?;
      let content = Rc::new(SymlinkVersion::from_disk(target));
      self.push(|id| Artifact::symlink(id, metadata, content))
    } else if meta.is_dir() {
      let names = std::fs::read_dir(path)
        .map(|entries| {
          entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect::<BTreeSet<String>>()
        })
        .unwrap_or_default();
      let base = Rc::new(DirListVersion::baseline(names));
      self.push(|id| Artifact::dir(id, metadata, base))
    } else if meta.is_file() {
      let content = Rc::new(FileVersion::from_disk(&meta));
      self.push(|id| Artifact::file(id, metadata, content))
    } else {
      // Device nodes and sockets are modeled as opaque pipes.
      self.push(|id| Artifact::pipe(id, metadata, None))
    };

    self.paths.insert(id, path.to_path_buf());
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
      self.set_name(id, name);
    }

    debug!(artifact = %id, path = %path.display(), "admitted artifact from disk");
    Some(id)
  }

  fn anonymous_metadata(&self, creator: Option<CommandId>, mode: u32, committed: bool) -> Rc<MetadataVersion> {
    let metadata = Rc::new(MetadataVersion::new(self.identity.euid, self.identity.egid, mode));
    metadata.state.set_committed(committed);
    if let Some(c) = creator {
      metadata.state.created_by(c);
    }
    metadata
  }

  fn stamp(state: &VersionState, creator: Option<CommandId>, committed: bool) {
    state.set_committed(committed);
    if let Some(c) = creator {
      state.created_by(c);
    }
  }

  /// A fresh anonymous file, empty, mode-masked by the tracee umask.
  pub fn create_file(&mut self, creator: Option<CommandId>, mode: u32, committed: bool) -> ArtifactId {
    let masked = self.identity.mask_mode(mode);
    let metadata = self.anonymous_metadata(creator, 0o100000 | masked, committed);
    let content = Rc::new(FileVersion::empty());
    Self::stamp(&content.state, creator, committed);
    self.push(|id| Artifact::file(id, metadata, content))
  }

  /// A fresh anonymous symlink with the given target.
  pub fn create_symlink(&mut self, creator: Option<CommandId>, target: PathBuf, committed: bool) -> ArtifactId {
    let metadata = self.anonymous_metadata(creator, 0o120777, committed);
    let content = Rc::new(SymlinkVersion::new(target));
    Self::stamp(&content.state, creator, committed);
    self.push(|id| Artifact::symlink(id, metadata, content))
  }

  /// A fresh anonymous directory.
  pub fn create_dir(&mut self, creator: Option<CommandId>, mode: u32, committed: bool) -> ArtifactId {
    let masked = self.identity.mask_mode(mode);
    let metadata = self.anonymous_metadata(creator, 0o40000 | masked, committed);
    let base = Rc::new(DirListVersion::created());
    Self::stamp(&base.state, creator, committed);
    self.push(|id| Artifact::dir(id, metadata, base))
  }

  /// A fresh anonymous pipe.
  pub fn create_pipe(&mut self, creator: Option<CommandId>) -> ArtifactId {
    let metadata = self.anonymous_metadata(creator, 0o10600, true);
    self.push(|id| Artifact::pipe(id, metadata, None))
  }

  /// The current content version of an artifact. Directory listings are
  /// assembled from the baseline plus modeled entry patches.
  pub fn content_of(&mut self, id: ArtifactId) -> Option<ContentVersion> {
    if self.artifact(id).is_dir() {
      return Some(ContentVersion::DirList(self.dir_list(id)));
    }
    self.artifact(id).current_content()
  }

  /// The directory's current full listing.
  pub fn dir_list(&mut self, id: ArtifactId) -> Rc<DirListVersion> {
    let artifact = self.artifact(id);
    let Some(base) = artifact.dir_base() else {
      return Rc::new(DirListVersion::created());
    };

    let Some(entries) = artifact.dir_entries() else {
      return base;
    };

    if entries.is_empty() {
      return base;
    }

    let mut names: BTreeSet<String> = base.entries().clone();
    for (name, slot) in entries {
      if slot.target.is_some() {
        names.insert(name.clone());
      } else {
        names.remove(name);
      }
    }

    Rc::new(DirListVersion::listing(names))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn identity() -> TraceeIdentity {
    TraceeIdentity {
      euid: 1000,
      egid: 1000,
      umask: 0o022,
    }
  }

  #[test]
  fn env_starts_with_root_and_streams() {
    let env = Env::new(identity());
    assert!(env.artifact(env.root()).is_dir());
    assert!(env.artifact(env.stdin()).is_pipe());
    assert_eq!(env.artifact(env.stdout()).special(), Some(SpecialEntity::Stdout));
    assert_eq!(env.path_of(env.root()), Some(&PathBuf::from("/")));
  }

  #[test]
  fn admits_a_file_from_disk() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("input.txt");
    std::fs::write(&path, b"data").unwrap();

    let mut env = Env::new(identity());
    let id = env.admit_from_disk(&path).unwrap();

    let artifact = env.artifact(id);
    assert!(artifact.is_file());
    assert!(artifact.current_metadata().state.is_committed());
    assert!(artifact.initial_content().is_some());
  }

  #[test]
  fn anonymous_file_mode_is_masked() {
    let mut env = Env::new(identity());
    let id = env.create_file(Some(CommandId(1)), 0o666, false);

    let metadata = env.artifact(id).current_metadata();
    assert_eq!(metadata.mode() & 0o7777, 0o644);
    assert_eq!(metadata.state.creator(), Some(CommandId(1)));
    assert!(!metadata.state.is_committed());
  }

  #[test]
  fn dir_list_merges_overlay() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("kept"), b"").unwrap();
    std::fs::write(temp.path().join("gone"), b"").unwrap();

    let mut env = Env::new(identity());
    let dir = env.admit_from_disk(temp.path()).unwrap();
    let file = env.create_file(None, 0o644, false);

    env
      .artifact_mut(dir)
      .apply_content(ContentVersion::DirEntry(Rc::new(
        crate::version::DirEntryVersion::link("new".to_string(), file),
      )));
    env
      .artifact_mut(dir)
      .apply_content(ContentVersion::DirEntry(Rc::new(
        crate::version::DirEntryVersion::unlink("gone".to_string(), file),
      )));

    let listing = env.dir_list(dir);
    assert!(listing.contains("kept"));
    assert!(listing.contains("new"));
    assert!(!listing.contains("gone"));
  }
}
