//! BLAKE3 content fingerprints.
//!
//! A [`Fingerprint`] identifies file content for version comparison and
//! addresses the content cache (the first two hex characters name the cache
//! subdirectory, the remainder the cache file).

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::consts::HASH_BUF_SIZE;

/// A 32-byte BLAKE3 hash of some content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
  pub fn from_bytes(bytes: [u8; 32]) -> Self {
    Fingerprint(bytes)
  }

  pub fn as_bytes(&self) -> &[u8; 32] {
    &self.0
  }

  /// Lowercase hex rendering of the full hash.
  pub fn to_hex(&self) -> String {
    let mut out = String::with_capacity(64);
    for byte in &self.0 {
      out.push_str(&format!("{:02x}", byte));
    }
    out
  }

  /// Relative path of this fingerprint within a cache directory.
  pub fn cache_rel_path(&self) -> PathBuf {
    let hex = self.to_hex();
    PathBuf::from(&hex[..2]).join(&hex[2..])
  }
}

impl fmt::Debug for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.to_hex())
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", &self.to_hex()[..12])
  }
}

/// Hash the contents of a file.
pub fn hash_file(path: &Path) -> io::Result<Fingerprint> {
  let mut file = File::open(path)?;
  let mut hasher = blake3::Hasher::new();
  let mut buf = vec![0u8; HASH_BUF_SIZE];

  loop {
    let n = file.read(&mut buf)?;
    if n == 0 {
      break;
    }
    hasher.update(&buf[..n]);
  }

  Ok(Fingerprint(*hasher.finalize().as_bytes()))
}

/// Hash a byte slice.
pub fn hash_bytes(data: &[u8]) -> Fingerprint {
  Fingerprint(*blake3::hash(data).as_bytes())
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn file_and_bytes_hashes_agree() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("data");
    std::fs::write(&path, b"hello retrace").unwrap();

    let from_file = hash_file(&path).unwrap();
    let from_bytes = hash_bytes(b"hello retrace");
    assert_eq!(from_file, from_bytes);
  }

  #[test]
  fn hex_is_64_chars() {
    let fp = hash_bytes(b"");
    assert_eq!(fp.to_hex().len(), 64);
  }

  #[test]
  fn cache_path_splits_first_byte() {
    let fp = hash_bytes(b"x");
    let rel = fp.cache_rel_path();
    let hex = fp.to_hex();
    assert_eq!(rel, PathBuf::from(&hex[..2]).join(&hex[2..]));
  }

  #[test]
  fn distinct_content_distinct_hash() {
    assert_ne!(hash_bytes(b"a"), hash_bytes(b"b"));
  }
}
