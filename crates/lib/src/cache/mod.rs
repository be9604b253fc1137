//! The content-addressed cache.
//!
//! Layout: `.retrace/cache/<hh>/<rest>` where `<hh>` is the first two hex
//! characters of the BLAKE3 hash. Cache files are immutable once written.
//! During a build new content lands in `newcache/`; on a successful finish
//! the staging cache is rotated over the committed one, carrying forward the
//! files the new trace still references.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::fingerprint::Fingerprint;
use crate::platform::paths::{cache_dir, new_cache_dir};
use crate::trace::{InputTrace, Record};

#[derive(Debug, Error)]
pub enum CacheError {
  #[error(transparent)]
  Io(#[from] io::Error),
}

/// Path of a fingerprint inside the committed cache.
pub fn file_path(fp: &Fingerprint) -> PathBuf {
  cache_dir().join(fp.cache_rel_path())
}

/// Path of a fingerprint inside the staging cache.
pub fn staging_path(fp: &Fingerprint) -> PathBuf {
  new_cache_dir().join(fp.cache_rel_path())
}

/// Copy the file at `src` into the staging cache under its fingerprint.
pub fn save(src: &Path, fp: &Fingerprint) -> io::Result<()> {
  let dest = staging_path(fp);
  if dest.exists() {
    return Ok(());
  }

  if let Some(parent) = dest.parent() {
    std::fs::create_dir_all(parent)?;
  }
  std::fs::copy(src, &dest)?;
  debug!(hash = %fp, "cached file content");
  Ok(())
}

/// Copy cached content for `fp` out to `dest`. Returns false if the cache
/// has no copy (neither committed nor staging).
pub fn stage(fp: &Fingerprint, dest: &Path) -> io::Result<bool> {
  for source in [file_path(fp), staging_path(fp)] {
    if source.exists() {
      if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
      }
      std::fs::copy(&source, dest)?;
      return Ok(true);
    }
  }
  Ok(false)
}

/// Rotate the staging cache over the committed one. Files in the old cache
/// still referenced by the new trace are carried forward first.
pub fn rotate(referenced: &HashSet<Fingerprint>) -> io::Result<()> {
  let committed = cache_dir();
  let staging = new_cache_dir();

  std::fs::create_dir_all(&staging)?;

  if committed.exists() {
    for fp in referenced {
      let old = committed.join(fp.cache_rel_path());
      let new = staging.join(fp.cache_rel_path());
      if old.exists() && !new.exists() {
        if let Some(parent) = new.parent() {
          std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&old, &new)?;
      }
    }
    std::fs::remove_dir_all(&committed)?;
  }

  std::fs::rename(&staging, &committed)?;
  debug!(kept = referenced.len(), "cache rotated");
  Ok(())
}

#[derive(Debug, Default, Serialize)]
pub struct GcStats {
  pub files_scanned: usize,
  pub files_deleted: usize,
  pub bytes_freed: u64,
}

#[derive(Debug, Serialize)]
pub struct GcResult {
  pub stats: GcStats,
  pub deleted_paths: Vec<PathBuf>,
}

/// Remove cache files no FileVersion in the trace references.
pub fn collect_garbage(trace: &InputTrace, dry_run: bool) -> Result<GcResult, CacheError> {
  let live = referenced_hashes(trace);
  let committed = cache_dir();

  let mut stats = GcStats::default();
  let mut deleted_paths = Vec::new();

  if !committed.exists() {
    return Ok(GcResult { stats, deleted_paths });
  }

  let live_paths: HashSet<PathBuf> = live.iter().map(|fp| fp.cache_rel_path()).collect();

  for entry in WalkDir::new(&committed).into_iter().filter_map(|e| e.ok()) {
    if !entry.file_type().is_file() {
      continue;
    }

    stats.files_scanned += 1;

    let rel = match entry.path().strip_prefix(&committed) {
      Ok(rel) => rel.to_path_buf(),
      Err(_) => continue,
    };

    if live_paths.contains(&rel) {
      continue;
    }

    let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
    debug!(path = %entry.path().display(), "removing unreferenced cache file");

    if dry_run {
      stats.files_deleted += 1;
      stats.bytes_freed += size;
      deleted_paths.push(entry.path().to_path_buf());
    } else {
      match std::fs::remove_file(entry.path()) {
        Ok(()) => {
          stats.files_deleted += 1;
          stats.bytes_freed += size;
          deleted_paths.push(entry.path().to_path_buf());
        }
        Err(e) => {
          warn!(path = %entry.path().display(), error = %e, "failed to delete cache file");
        }
      }
    }
  }

  info!(
    scanned = stats.files_scanned,
    deleted = stats.files_deleted,
    bytes_freed = stats.bytes_freed,
    dry_run,
    "cache garbage collection complete"
  );

  Ok(GcResult { stats, deleted_paths })
}

/// Every file hash the trace's content versions mention.
pub fn referenced_hashes(trace: &InputTrace) -> HashSet<Fingerprint> {
  let mut live = HashSet::new();

  for record in trace.records() {
    let data = match record {
      Record::MatchContent { version, .. } => Some(version),
      Record::UpdateContent { version, .. } => Some(version),
      _ => None,
    };
    if let Some(hash) = data.and_then(|d| d.cache_reference()) {
      live.insert(hash);
    }
  }

  live
}
