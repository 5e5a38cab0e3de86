use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::io::Read;
use std::path::Path;

/// Content hash algorithm, selectable per metadata field so repositories can
/// migrate to a stronger hash without a format break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HashKind {
    #[default]
    #[serde(rename = "sha1")]
    Sha1,
    #[serde(rename = "sha256")]
    Sha256,
    #[serde(rename = "blake3")]
    Blake3,
}

/// Incremental hasher over the selected algorithm. Digests are lowercase hex.
pub enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    pub fn new(kind: HashKind) -> Self {
        match kind {
            HashKind::Sha1 => Hasher::Sha1(Sha1::new()),
            HashKind::Sha256 => Hasher::Sha256(Sha256::new()),
            HashKind::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Blake3(h) => {
                h.update(data);
            }
        }
    }

    pub fn finalize_hex(self) -> String {
        match self {
            Hasher::Sha1(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Blake3(h) => h.finalize().to_hex().to_string(),
        }
    }
}

/// Hash a byte slice to a hex digest.
pub fn hash_bytes(kind: HashKind, data: &[u8]) -> String {
    let mut hasher = Hasher::new(kind);
    hasher.update(data);
    hasher.finalize_hex()
}

/// Stream-hash a file to a hex digest.
/// Uses a 256 KB BufReader to reduce syscall overhead vs the default 8 KB.
pub fn hash_file(kind: HashKind, path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = std::io::BufReader::with_capacity(256 * 1024, file);
    let mut hasher = Hasher::new(kind);
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("Failed to hash file: {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize_hex())
}

/// Check a file against an expected size and hex digest.
///
/// A size mismatch short-circuits: the file is never read when its length
/// already rules out a match. A missing file is simply "no match".
pub fn file_matches(path: &Path, size: u64, hash: &str, kind: HashKind) -> bool {
    let meta = match std::fs::metadata(path) {
        Ok(m) if m.is_file() => m,
        _ => return false,
    };
    if meta.len() != size {
        return false;
    }
    match hash_file(kind, path) {
        Ok(actual) => actual == hash,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_digest() {
        // Known vector: sha1("abc")
        assert_eq!(
            hash_bytes(HashKind::Sha1, b"abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_sha256_digest() {
        assert_eq!(
            hash_bytes(HashKind::Sha256, b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_streaming_matches_oneshot() {
        let data = vec![0x5Au8; 300 * 1024];
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, &data).unwrap();
        assert_eq!(
            hash_file(HashKind::Blake3, &path).unwrap(),
            hash_bytes(HashKind::Blake3, &data)
        );
    }

    #[test]
    fn test_file_matches_size_shortcircuit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();
        let hash = hash_bytes(HashKind::Sha1, b"hello");
        assert!(file_matches(&path, 5, &hash, HashKind::Sha1));
        // Wrong size: must fail without the hash ever matching.
        assert!(!file_matches(&path, 4, &hash, HashKind::Sha1));
        // Missing file.
        assert!(!file_matches(&dir.path().join("absent"), 5, &hash, HashKind::Sha1));
    }
}
