use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One piece of a block-matching delta: either copy a range from the old
/// file or insert literal bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeltaChunk {
    Copy { offset: u64, length: u64 },
    Insert { data: Vec<u8> },
}

/// Adler32-style rolling hash for block matching.
///
/// Uses two 16-bit sums (a, b) combined into a 32-bit hash.
/// Supports O(1) sliding window updates: remove oldest byte, add new byte.
const MOD_ADLER: u32 = 65521;

struct RollingHash {
    a: u32,
    b: u32,
    window_size: u32,
}

impl RollingHash {
    fn new() -> Self {
        Self {
            a: 1,
            b: 0,
            window_size: 0,
        }
    }

    /// Compute hash over an initial block of data.
    fn init(&mut self, data: &[u8]) {
        self.window_size = data.len() as u32;
        // Accumulate in u64 to defer all modular reductions to a single pair
        // of operations at the end, rather than reducing on every byte.
        let mut a: u64 = 1;
        let mut b: u64 = 0;
        for &byte in data {
            a += byte as u64;
            b += a;
        }
        self.a = (a % MOD_ADLER as u64) as u32;
        self.b = (b % MOD_ADLER as u64) as u32;
    }

    /// Slide the window: remove `old_byte` from front, add `new_byte` at back.
    fn rotate(&mut self, old_byte: u8, new_byte: u8) {
        let old = old_byte as u32;
        let new = new_byte as u32;

        self.a = (self.a + MOD_ADLER - old + new) % MOD_ADLER;
        self.b = (self.b + MOD_ADLER - 1 + self.a
            - (old * self.window_size) % MOD_ADLER)
            % MOD_ADLER;
    }

    fn digest(&self) -> u32 {
        (self.b << 16) | self.a
    }
}

struct BlockSignature {
    rolling_hash: u32,
    strong_hash: blake3::Hash,
    offset: u64,
}

/// Compute a binary delta between `old` and `new` data.
///
/// Uses a block-matching algorithm (rsync-like):
/// 1. Split old data into fixed-size blocks
/// 2. Build a hash table from rolling hash -> block signatures
/// 3. Scan new data with a rolling hash, matching against old blocks
/// 4. Emit Copy chunks for matches, Insert chunks for non-matching regions
pub fn compute_delta(old: &[u8], new: &[u8], block_size: usize) -> Vec<DeltaChunk> {
    if old.is_empty() {
        if new.is_empty() {
            return vec![];
        }
        return vec![DeltaChunk::Insert {
            data: new.to_vec(),
        }];
    }

    let signatures = build_signatures(old, block_size);
    let hash_table = build_hash_table(&signatures);

    match_blocks(old, new, block_size, &hash_table, &signatures)
}

/// Reconstruct the new file content from the old file data and a delta.
pub fn apply_delta(old: &[u8], chunks: &[DeltaChunk]) -> Vec<u8> {
    let estimated_size: u64 = chunks
        .iter()
        .map(|c| match c {
            DeltaChunk::Copy { length, .. } => *length,
            DeltaChunk::Insert { data } => data.len() as u64,
        })
        .sum();

    let mut result = Vec::with_capacity(estimated_size as usize);

    for chunk in chunks {
        match chunk {
            DeltaChunk::Copy { offset, length } => {
                let start = *offset as usize;
                let end = start + *length as usize;
                result.extend_from_slice(&old[start..end]);
            }
            DeltaChunk::Insert { data } => {
                result.extend_from_slice(data);
            }
        }
    }

    result
}

fn build_signatures(data: &[u8], block_size: usize) -> Vec<BlockSignature> {
    let num_blocks = data.len().div_ceil(block_size);
    let mut sigs = Vec::with_capacity(num_blocks);

    for i in 0..num_blocks {
        let start = i * block_size;
        let end = (start + block_size).min(data.len());
        let block = &data[start..end];

        let mut rolling = RollingHash::new();
        rolling.init(block);

        sigs.push(BlockSignature {
            rolling_hash: rolling.digest(),
            strong_hash: blake3::hash(block),
            offset: start as u64,
        });
    }

    sigs
}

fn build_hash_table(signatures: &[BlockSignature]) -> HashMap<u32, Vec<usize>> {
    let mut table: HashMap<u32, Vec<usize>> = HashMap::with_capacity(signatures.len());
    for (idx, sig) in signatures.iter().enumerate() {
        table.entry(sig.rolling_hash).or_default().push(idx);
    }
    table
}

fn match_blocks(
    old: &[u8],
    new: &[u8],
    block_size: usize,
    hash_table: &HashMap<u32, Vec<usize>>,
    signatures: &[BlockSignature],
) -> Vec<DeltaChunk> {
    let mut chunks: Vec<DeltaChunk> = Vec::new();
    let mut insert_buf: Vec<u8> = Vec::new();

    if new.len() < block_size {
        return vec![DeltaChunk::Insert {
            data: new.to_vec(),
        }];
    }

    let mut rolling = RollingHash::new();
    rolling.init(&new[..block_size]);

    let mut pos: usize = 0;

    loop {
        let window_end = pos + block_size;
        if window_end > new.len() {
            break;
        }

        let digest = rolling.digest();

        if let Some((match_offset, match_len)) = find_match(
            digest,
            &new[pos..window_end],
            old,
            block_size,
            hash_table,
            signatures,
        ) {
            if !insert_buf.is_empty() {
                chunks.push(DeltaChunk::Insert {
                    data: std::mem::take(&mut insert_buf),
                });
            }

            chunks.push(DeltaChunk::Copy {
                offset: match_offset,
                length: match_len,
            });

            pos += match_len as usize;

            if pos + block_size <= new.len() {
                rolling = RollingHash::new();
                rolling.init(&new[pos..pos + block_size]);
            }
        } else {
            insert_buf.push(new[pos]);
            pos += 1;

            if pos + block_size <= new.len() {
                rolling.rotate(new[pos - 1], new[pos + block_size - 1]);
            }
        }
    }

    // Remaining bytes that don't fill a complete block window
    if pos < new.len() {
        insert_buf.extend_from_slice(&new[pos..]);
    }

    if !insert_buf.is_empty() {
        chunks.push(DeltaChunk::Insert { data: insert_buf });
    }

    chunks
}

/// Try to find a matching old block for the current new window.
/// Returns (old_offset, length) on match.
fn find_match(
    rolling_digest: u32,
    new_block: &[u8],
    old: &[u8],
    block_size: usize,
    hash_table: &HashMap<u32, Vec<usize>>,
    signatures: &[BlockSignature],
) -> Option<(u64, u64)> {
    let candidates = hash_table.get(&rolling_digest)?;

    let new_strong = blake3::hash(new_block);

    for &sig_idx in candidates {
        let sig = &signatures[sig_idx];
        if sig.strong_hash == new_strong {
            let block_end = (sig.offset as usize + block_size).min(old.len());
            let block_len = block_end - sig.offset as usize;
            return Some((sig.offset, block_len as u64));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK_SIZE: usize = 4096;

    #[test]
    fn test_rolling_init_deterministic() {
        let data = b"Hello, World!";
        let mut h1 = RollingHash::new();
        h1.init(data);
        let mut h2 = RollingHash::new();
        h2.init(data);
        assert_eq!(h1.digest(), h2.digest());
    }

    #[test]
    fn test_rolling_rotate_equals_fresh_init() {
        let data = b"ABCDE";
        let mut rolling = RollingHash::new();
        rolling.init(&data[0..4]);
        rolling.rotate(data[0], data[4]);

        let mut fresh = RollingHash::new();
        fresh.init(&data[1..5]);

        assert_eq!(rolling.digest(), fresh.digest());
    }

    #[test]
    fn test_identical_data() {
        let data = vec![42u8; BLOCK_SIZE * 3];
        let chunks = compute_delta(&data, &data, BLOCK_SIZE);
        let result = apply_delta(&data, &chunks);
        assert_eq!(result, data);
    }

    #[test]
    fn test_completely_different() {
        let old = vec![0u8; BLOCK_SIZE * 2];
        let new = vec![1u8; BLOCK_SIZE * 2];
        let chunks = compute_delta(&old, &new, BLOCK_SIZE);
        let result = apply_delta(&old, &chunks);
        assert_eq!(result, new);
    }

    #[test]
    fn test_prefix_changed() {
        let old = vec![0u8; BLOCK_SIZE * 4];
        let mut new = old.clone();
        // Change only the first block
        for b in new[..BLOCK_SIZE].iter_mut() {
            *b = 0xFF;
        }

        let chunks = compute_delta(&old, &new, BLOCK_SIZE);
        let result = apply_delta(&old, &chunks);
        assert_eq!(result, new);

        // Should have Copy chunks for unchanged blocks
        let copy_count = chunks
            .iter()
            .filter(|c| matches!(c, DeltaChunk::Copy { .. }))
            .count();
        assert!(copy_count >= 3, "Expected at least 3 Copy chunks for unchanged blocks");
    }

    #[test]
    fn test_empty_old() {
        let old = vec![];
        let new = vec![1u8; 100];
        let chunks = compute_delta(&old, &new, BLOCK_SIZE);
        let result = apply_delta(&old, &chunks);
        assert_eq!(result, new);
    }

    #[test]
    fn test_empty_new() {
        let old = vec![1u8; 100];
        let new = vec![];
        let chunks = compute_delta(&old, &new, BLOCK_SIZE);
        let result = apply_delta(&old, &chunks);
        assert_eq!(result, new);
    }

    #[test]
    fn test_small_files() {
        let old = b"Hello, World!".to_vec();
        let new = b"Hello, Rust!".to_vec();
        let chunks = compute_delta(&old, &new, BLOCK_SIZE);
        let result = apply_delta(&old, &chunks);
        assert_eq!(result, new);
    }

    #[test]
    fn test_insertion_in_middle() {
        let mut old = vec![0u8; BLOCK_SIZE * 4];
        for (i, b) in old.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        let mut new = old.clone();
        // Insert some bytes in the middle (between block 1 and block 2)
        let insert_pos = BLOCK_SIZE * 2;
        let insertion = vec![0xAA; 100];
        new.splice(insert_pos..insert_pos, insertion);

        let chunks = compute_delta(&old, &new, BLOCK_SIZE);
        let result = apply_delta(&old, &chunks);
        assert_eq!(result, new);
    }
}
