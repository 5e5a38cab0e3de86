use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

use crate::delta::{apply_delta, compute_delta, DeltaChunk};
use crate::hash::{HashKind, Hasher};

/// Codec tuning, passed in at construction. Nothing in the transform layer
/// reads process-global state.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// zstd compression level used when building package data regions.
    pub zstd_level: i32,
    /// Block size for the block-matching delta.
    pub delta_block_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            zstd_level: 3,
            delta_block_size: 4096,
        }
    }
}

/// Compression applied to a package data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Compression {
    #[serde(rename = "none")]
    None,
    #[default]
    #[serde(rename = "zstd")]
    Zstd,
}

/// Delta encoding of a patch data region (applied after decompression).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PatchKind {
    #[default]
    #[serde(rename = "block")]
    Block,
}

/// Wraps the compression and binary-delta transforms behind one seam so the
/// pipeline and the producer treat them as opaque byte-stream codecs.
#[derive(Debug, Clone, Default)]
pub struct Codec {
    config: CodecConfig,
}

struct HashingWriter<W: Write> {
    inner: W,
    hasher: Hasher,
    written: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl Codec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    /// Compress raw content into a package data region.
    pub fn encode(&self, compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
        match compression {
            Compression::None => Ok(data.to_vec()),
            Compression::Zstd => zstd::bulk::compress(data, self.config.zstd_level)
                .context("Failed to compress data region"),
        }
    }

    /// Build a patch data region: delta between `old` and `new`, serialized
    /// and compressed.
    pub fn encode_delta(
        &self,
        kind: PatchKind,
        compression: Compression,
        old: &[u8],
        new: &[u8],
    ) -> Result<Vec<u8>> {
        let chunks = match kind {
            PatchKind::Block => compute_delta(old, new, self.config.delta_block_size),
        };
        let encoded = bincode::serialize(&chunks).context("Failed to serialize delta")?;
        self.encode(compression, &encoded)
    }

    /// Stream-decode a staged data region into `dst`, hashing the decoded
    /// content on the way through. Returns (decoded size, hex digest).
    pub fn decode_to_file(
        &self,
        compression: Compression,
        src: &Path,
        dst: &Path,
        hash_kind: HashKind,
    ) -> Result<(u64, String)> {
        let input = std::fs::File::open(src)
            .with_context(|| format!("Failed to open staged data: {}", src.display()))?;
        let output = std::fs::File::create(dst)
            .with_context(|| format!("Failed to create output file: {}", dst.display()))?;
        let mut writer = HashingWriter {
            inner: std::io::BufWriter::new(output),
            hasher: Hasher::new(hash_kind),
            written: 0,
        };

        match compression {
            Compression::None => {
                let mut reader = std::io::BufReader::new(input);
                std::io::copy(&mut reader, &mut writer)
                    .with_context(|| format!("Failed to copy data region: {}", src.display()))?;
            }
            Compression::Zstd => {
                let mut decoder = zstd::Decoder::new(input)
                    .context("Failed to create zstd decoder")?;
                std::io::copy(&mut decoder, &mut writer)
                    .with_context(|| format!("Failed to decompress data region: {}", src.display()))?;
            }
        }
        writer.flush()?;

        Ok((writer.written, writer.hasher.finalize_hex()))
    }

    /// Reconstruct patched content from a staged delta region and the current
    /// local file content.
    pub fn decode_delta(
        &self,
        kind: PatchKind,
        compression: Compression,
        region: &[u8],
        old: &[u8],
    ) -> Result<Vec<u8>> {
        let encoded = match compression {
            Compression::None => region.to_vec(),
            Compression::Zstd => zstd::stream::decode_all(region)
                .context("Failed to decompress delta region")?,
        };
        let chunks: Vec<DeltaChunk> =
            bincode::deserialize(&encoded).context("Failed to deserialize delta")?;
        match kind {
            PatchKind::Block => {}
        }
        for chunk in &chunks {
            if let DeltaChunk::Copy { offset, length } = chunk {
                if offset + length > old.len() as u64 {
                    bail!("Delta copy range {}..{} outside local file ({} bytes)",
                        offset, offset + length, old.len());
                }
            }
        }
        Ok(apply_delta(old, &chunks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_roundtrip_through_files() {
        let codec = Codec::default();
        let content = vec![7u8; 100_000];
        let region = codec.encode(Compression::Zstd, &content).unwrap();
        assert!(region.len() < content.len());

        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("staged");
        let out = dir.path().join("out");
        std::fs::write(&staged, &region).unwrap();

        let (size, hash) = codec
            .decode_to_file(Compression::Zstd, &staged, &out, HashKind::Sha1)
            .unwrap();
        assert_eq!(size, content.len() as u64);
        assert_eq!(hash, crate::hash::hash_bytes(HashKind::Sha1, &content));
        assert_eq!(std::fs::read(&out).unwrap(), content);
    }

    #[test]
    fn test_delta_region_roundtrip() {
        let codec = Codec::default();
        let old = vec![1u8; 20_000];
        let mut new = old.clone();
        new[10_000] = 9;
        new.extend_from_slice(&[2u8; 500]);

        let region = codec
            .encode_delta(PatchKind::Block, Compression::Zstd, &old, &new)
            .unwrap();
        let rebuilt = codec
            .decode_delta(PatchKind::Block, Compression::Zstd, &region, &old)
            .unwrap();
        assert_eq!(rebuilt, new);
    }

    #[test]
    fn test_delta_rejects_out_of_range_copy() {
        let codec = Codec::default();
        let chunks = vec![DeltaChunk::Copy { offset: 10, length: 100 }];
        let encoded = bincode::serialize(&chunks).unwrap();
        let err = codec
            .decode_delta(PatchKind::Block, Compression::None, &encoded, b"short")
            .unwrap_err();
        assert!(err.to_string().contains("outside local file"));
    }
}
