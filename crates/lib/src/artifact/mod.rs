//! Artifacts: ongoing identities for filesystem objects.
//!
//! An artifact tracks one file, directory, symlink, or pipe across a build.
//! It accumulates an append-only version history and keeps the current
//! version of each facet (metadata and content) together with whether that
//! version is reified on disk. The *initial* facets capture the state found
//! on disk when the artifact was first admitted; post-build predicates
//! compare against them.

mod filter;

pub use filter::AccessFilter;

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::version::{
  ContentVersion, DirListVersion, EntryAction, FileVersion, MetadataVersion, SymlinkVersion, Version,
};

/// Index into the environment's artifact arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactId(pub u32);

impl ArtifactId {
  pub fn index(self) -> usize {
    self.0 as usize
  }
}

impl fmt::Display for ArtifactId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "a{}", self.0)
  }
}

/// The well-known artifacts every command starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpecialEntity {
  Stdin,
  Stdout,
  Stderr,
  Root,
  Cwd,
  LaunchExe,
}

/// One modeled directory entry: linked to an artifact, or known absent.
#[derive(Debug, Clone)]
pub struct EntrySlot {
  pub target: Option<ArtifactId>,

  /// The entry version that last touched this slot; None for entries
  /// discovered on disk.
  pub version: Option<ContentVersion>,
}

#[derive(Debug)]
pub enum ArtifactKind {
  File {
    content: Rc<FileVersion>,
  },
  Symlink {
    content: Rc<SymlinkVersion>,
  },
  Dir {
    base: Rc<DirListVersion>,
    entries: BTreeMap<String, EntrySlot>,
  },
  Pipe {
    writes: u64,
    closed: bool,
    special: Option<SpecialEntity>,
  },
}

#[derive(Debug)]
pub struct Artifact {
  pub id: ArtifactId,
  name: Option<String>,
  versions: Vec<Version>,
  metadata: Rc<MetadataVersion>,
  kind: ArtifactKind,
  metadata_initial: Option<Rc<MetadataVersion>>,
  content_initial: Option<ContentVersion>,
  pub(crate) metadata_filter: AccessFilter,
  pub(crate) content_filter: AccessFilter,
}

impl Artifact {
  fn new(id: ArtifactId, metadata: Rc<MetadataVersion>, kind: ArtifactKind) -> Self {
    let committed = metadata.state.is_committed();
    let mut artifact = Artifact {
      id,
      name: None,
      versions: vec![Version::Metadata(metadata.clone())],
      metadata_initial: committed.then(|| metadata.clone()),
      metadata,
      kind,
      content_initial: None,
      metadata_filter: AccessFilter::default(),
      content_filter: AccessFilter::default(),
    };

    if let Some(content) = artifact.current_content() {
      if content.state().is_committed() {
        artifact.content_initial = Some(content.clone());
      }
      artifact.versions.push(Version::Content(content));
    }

    artifact
  }

  pub fn file(id: ArtifactId, metadata: Rc<MetadataVersion>, content: Rc<FileVersion>) -> Self {
    Artifact::new(id, metadata, ArtifactKind::File { content })
  }

  pub fn symlink(id: ArtifactId, metadata: Rc<MetadataVersion>, content: Rc<SymlinkVersion>) -> Self {
    Artifact::new(id, metadata, ArtifactKind::Symlink { content })
  }

  pub fn dir(id: ArtifactId, metadata: Rc<MetadataVersion>, base: Rc<DirListVersion>) -> Self {
    Artifact::new(
      id,
      metadata,
      ArtifactKind::Dir {
        base,
        entries: BTreeMap::new(),
      },
    )
  }

  pub fn pipe(id: ArtifactId, metadata: Rc<MetadataVersion>, special: Option<SpecialEntity>) -> Self {
    Artifact::new(
      id,
      metadata,
      ArtifactKind::Pipe {
        writes: 0,
        closed: false,
        special,
      },
    )
  }

  pub fn name(&self) -> Option<&str> {
    self.name.as_deref()
  }

  pub fn set_name(&mut self, name: impl Into<String>) {
    self.name = Some(name.into());
  }

  /// A printable identity for logs and rerun reasons.
  pub fn display_name(&self) -> String {
    match (&self.kind, &self.name) {
      (_, Some(name)) => name.clone(),
      (ArtifactKind::Pipe { special: Some(s), .. }, None) => format!("{:?}", s).to_lowercase(),
      (ArtifactKind::Pipe { .. }, None) => format!("pipe {}", self.id),
      _ => format!("{}", self.id),
    }
  }

  pub fn kind(&self) -> &ArtifactKind {
    &self.kind
  }

  pub fn is_dir(&self) -> bool {
    matches!(self.kind, ArtifactKind::Dir { .. })
  }

  pub fn is_pipe(&self) -> bool {
    matches!(self.kind, ArtifactKind::Pipe { .. })
  }

  pub fn is_symlink(&self) -> bool {
    matches!(self.kind, ArtifactKind::Symlink { .. })
  }

  pub fn is_file(&self) -> bool {
    matches!(self.kind, ArtifactKind::File { .. })
  }

  pub fn versions(&self) -> &[Version] {
    &self.versions
  }

  pub fn current_metadata(&self) -> Rc<MetadataVersion> {
    self.metadata.clone()
  }

  pub fn initial_metadata(&self) -> Option<Rc<MetadataVersion>> {
    self.metadata_initial.clone()
  }

  pub fn initial_content(&self) -> Option<ContentVersion> {
    self.content_initial.clone()
  }

  /// The current content version for file, symlink, and pipe artifacts.
  /// Directory listings are assembled by the environment, which can consult
  /// the underlying filesystem.
  pub fn current_content(&self) -> Option<ContentVersion> {
    match &self.kind {
      ArtifactKind::File { content } => Some(ContentVersion::File(content.clone())),
      ArtifactKind::Symlink { content } => Some(ContentVersion::Symlink(content.clone())),
      ArtifactKind::Dir { base, .. } => Some(ContentVersion::DirList(base.clone())),
      ArtifactKind::Pipe { .. } => self.versions.iter().rev().find_map(|v| match v {
        Version::Content(c) if c.is_pipe() => Some(c.clone()),
        _ => None,
      }),
    }
  }

  /// Append a metadata version and make it current.
  pub fn apply_metadata(&mut self, version: Rc<MetadataVersion>) {
    self.versions.push(Version::Metadata(version.clone()));
    self.metadata = version;
  }

  /// Append a content version and make it current for its facet.
  pub fn apply_content(&mut self, version: ContentVersion) {
    match (&mut self.kind, &version) {
      (ArtifactKind::File { content }, ContentVersion::File(v)) => {
        *content = v.clone();
      }
      (ArtifactKind::Symlink { content }, ContentVersion::Symlink(v)) => {
        *content = v.clone();
      }
      (ArtifactKind::Dir { base, entries }, ContentVersion::DirList(v)) => {
        *base = v.clone();
        entries.clear();
      }
      (ArtifactKind::Dir { entries, .. }, ContentVersion::DirEntry(v)) => {
        let target = match v.action {
          EntryAction::Link => Some(v.target),
          EntryAction::Unlink => None,
        };
        entries.insert(
          v.name.clone(),
          EntrySlot {
            target,
            version: Some(version.clone()),
          },
        );
      }
      (ArtifactKind::Pipe { writes, closed, .. }, _) => match &version {
        ContentVersion::PipeWrite(_) => *writes += 1,
        ContentVersion::PipeClose(_) => *closed = true,
        ContentVersion::PipeRead(_) => {}
        other => {
          warn!(artifact = %self.id, kind = other.kind_name(), "ignoring non-pipe version on pipe");
          return;
        }
      },
      (_, other) => {
        warn!(artifact = %self.id, kind = other.kind_name(), "version kind does not fit artifact");
        return;
      }
    }

    self.versions.push(Version::Content(version));
  }

  /// Look up a modeled directory entry. `None` means the name has not been
  /// modeled yet; `Some(slot)` carries the link state.
  pub fn dir_entry(&self, name: &str) -> Option<&EntrySlot> {
    match &self.kind {
      ArtifactKind::Dir { entries, .. } => entries.get(name),
      _ => None,
    }
  }

  /// Record a directory entry discovered on the underlying filesystem.
  pub fn model_dir_entry(&mut self, name: String, target: Option<ArtifactId>) {
    if let ArtifactKind::Dir { entries, .. } = &mut self.kind {
      entries.insert(name, EntrySlot { target, version: None });
    }
  }

  pub fn dir_base(&self) -> Option<Rc<DirListVersion>> {
    match &self.kind {
      ArtifactKind::Dir { base, .. } => Some(base.clone()),
      _ => None,
    }
  }

  pub fn dir_entries(&self) -> Option<&BTreeMap<String, EntrySlot>> {
    match &self.kind {
      ArtifactKind::Dir { entries, .. } => Some(entries),
      _ => None,
    }
  }

  pub fn pipe_writes(&self) -> u64 {
    match &self.kind {
      ArtifactKind::Pipe { writes, .. } => *writes,
      _ => 0,
    }
  }

  pub fn special(&self) -> Option<SpecialEntity> {
    match &self.kind {
      ArtifactKind::Pipe { special, .. } => *special,
      _ => None,
    }
  }
}
