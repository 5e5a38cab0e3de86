use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::codec::{Codec, Compression, PatchKind};
use crate::fsutil;
use crate::hash::{self, HashKind};

/// Byte range of an operation inside the package data blob, plus what is
/// needed to verify and decode it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRegion {
    #[serde(rename = "dataOffset")]
    pub offset: u64,
    #[serde(rename = "dataLength")]
    pub size: u64,
    #[serde(rename = "dataHash", default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(rename = "dataHashType", default)]
    pub hash_kind: HashKind,
    #[serde(rename = "dataCompression", default)]
    pub compression: Compression,
}

/// Expected content of the file once the operation has been applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalContent {
    #[serde(rename = "finalSize")]
    pub size: u64,
    #[serde(rename = "finalHash")]
    pub hash: String,
    #[serde(rename = "finalHashType", default)]
    pub hash_kind: HashKind,
}

/// A single file/directory reconciliation action within a package,
/// dispatched by the `action` tag on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Operation {
    #[serde(rename = "mkdir")]
    MkDir { path: String },

    #[serde(rename = "add")]
    Add {
        path: String,
        #[serde(flatten)]
        data: DataRegion,
        #[serde(flatten)]
        target: FinalContent,
    },

    #[serde(rename = "patch")]
    Patch {
        path: String,
        #[serde(flatten)]
        data: DataRegion,
        #[serde(flatten)]
        target: FinalContent,
        #[serde(rename = "localSize")]
        local_size: u64,
        /// Pre-patch content hash; the wire field is SHA-1 by definition.
        #[serde(rename = "localSha1")]
        local_sha1: String,
        #[serde(rename = "patchType")]
        patch_kind: PatchKind,
    },

    #[serde(rename = "rm")]
    Rm {
        path: String,
        #[serde(rename = "localSize")]
        local_size: u64,
        #[serde(rename = "localSha1")]
        local_sha1: String,
    },

    #[serde(rename = "rmdir")]
    RmDir { path: String },
}

impl Operation {
    pub fn path(&self) -> &str {
        match self {
            Operation::MkDir { path }
            | Operation::Add { path, .. }
            | Operation::Patch { path, .. }
            | Operation::Rm { path, .. }
            | Operation::RmDir { path } => path,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Operation::MkDir { .. } => "mkdir",
            Operation::Add { .. } => "add",
            Operation::Patch { .. } => "patch",
            Operation::Rm { .. } => "rm",
            Operation::RmDir { .. } => "rmdir",
        }
    }

    pub fn data_region(&self) -> Option<&DataRegion> {
        match self {
            Operation::Add { data, .. } | Operation::Patch { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Size of this operation's region in the package blob. Always 0 for
    /// rm/rmdir/mkdir.
    pub fn data_size(&self) -> u64 {
        self.data_region().map(|d| d.size).unwrap_or(0)
    }

    pub fn data_offset(&self) -> Option<u64> {
        self.data_region().map(|d| d.offset)
    }
}

/// Local status of an operation, assigned by the prepare stage and advanced
/// exactly once more by apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Unknown,
    /// Data region must be fetched before this operation can be applied.
    DownloadRequired,
    /// Everything needed is already local; apply can run directly.
    ApplyRequired,
    /// The target already matches the expected final content.
    Valid,
    /// The local file matches neither the pre- nor the post-state; only a
    /// full replacement (repair pass) can fix it.
    LocalFileInvalid,
    ApplyFailed,
}

impl OpStatus {
    pub fn needs_download(self) -> bool {
        self == OpStatus::DownloadRequired
    }

    pub fn is_failure(self) -> bool {
        matches!(self, OpStatus::LocalFileInvalid | OpStatus::ApplyFailed)
    }
}

/// Result of the prepare stage: the status plus an optional advisory message
/// (e.g. an rm target whose content is not what the package expected).
#[derive(Debug, Clone)]
pub struct PrepareOutcome {
    pub status: OpStatus,
    pub warning: Option<String>,
}

impl PrepareOutcome {
    fn status(status: OpStatus) -> Self {
        Self {
            status,
            warning: None,
        }
    }
}

/// Result of the apply stage; errors are reported as values, never thrown
/// past the worker boundary.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub status: OpStatus,
    pub error: Option<String>,
}

/// An operation bound to concrete filesystem locations by
/// `PackageMetadata::bind`: the live target path inside the managed tree and
/// the staging slot for its downloaded data region.
#[derive(Debug, Clone)]
pub struct BoundOperation {
    pub index: usize,
    pub op: Operation,
    pub target: PathBuf,
    pub staging: PathBuf,
}

impl BoundOperation {
    /// Inspect the live filesystem and decide what this operation still
    /// needs. Read-only and idempotent: it never mutates anything, so two
    /// calls without intervening filesystem changes agree.
    pub fn prepare(&self) -> PrepareOutcome {
        match &self.op {
            Operation::MkDir { .. } => {
                if self.target.is_dir() {
                    PrepareOutcome::status(OpStatus::Valid)
                } else {
                    PrepareOutcome::status(OpStatus::ApplyRequired)
                }
            }
            Operation::Add { data, target, .. } => {
                if hash::file_matches(&self.target, target.size, &target.hash, target.hash_kind) {
                    PrepareOutcome::status(OpStatus::Valid)
                } else if self.staged_region_valid(data) {
                    PrepareOutcome::status(OpStatus::ApplyRequired)
                } else if data.size > 0 {
                    PrepareOutcome::status(OpStatus::DownloadRequired)
                } else {
                    // Zero-length region: the package carries no bytes for
                    // this file, so a mismatched target cannot be rebuilt
                    // from here.
                    PrepareOutcome::status(OpStatus::LocalFileInvalid)
                }
            }
            Operation::Patch {
                data,
                target,
                local_size,
                local_sha1,
                ..
            } => {
                if hash::file_matches(&self.target, target.size, &target.hash, target.hash_kind) {
                    PrepareOutcome::status(OpStatus::Valid)
                } else if hash::file_matches(&self.target, *local_size, local_sha1, HashKind::Sha1) {
                    if self.staged_region_valid(data) {
                        PrepareOutcome::status(OpStatus::ApplyRequired)
                    } else {
                        PrepareOutcome::status(OpStatus::DownloadRequired)
                    }
                } else {
                    PrepareOutcome::status(OpStatus::LocalFileInvalid)
                }
            }
            Operation::Rm {
                local_size,
                local_sha1,
                ..
            } => {
                if !self.target.exists() {
                    PrepareOutcome::status(OpStatus::Valid)
                } else {
                    let warning = if hash::file_matches(
                        &self.target,
                        *local_size,
                        local_sha1,
                        HashKind::Sha1,
                    ) {
                        None
                    } else {
                        Some("content to remove differs from the expected revision".to_string())
                    };
                    PrepareOutcome {
                        status: OpStatus::ApplyRequired,
                        warning,
                    }
                }
            }
            Operation::RmDir { .. } => {
                if self.target.exists() {
                    PrepareOutcome::status(OpStatus::ApplyRequired)
                } else {
                    PrepareOutcome::status(OpStatus::Valid)
                }
            }
        }
    }

    /// Perform the filesystem mutation. Success leaves the target matching
    /// the expected final content and removes the staged data region.
    pub fn apply(&self, codec: &Codec) -> ApplyOutcome {
        match self.try_apply(codec) {
            Ok(()) => ApplyOutcome {
                status: OpStatus::Valid,
                error: None,
            },
            Err(e) => ApplyOutcome {
                status: OpStatus::ApplyFailed,
                error: Some(format!("{e:#}")),
            },
        }
    }

    fn try_apply(&self, codec: &Codec) -> anyhow::Result<()> {
        match &self.op {
            Operation::MkDir { .. } => {
                std::fs::create_dir_all(&self.target).with_context(|| {
                    format!("Failed to create directory: {}", self.target.display())
                })?;
            }
            Operation::Add { data, target, .. } => {
                self.verify_staged(data)?;

                let decoded = self.staging_output();
                let (size, digest) = codec.decode_to_file(
                    data.compression,
                    &self.staging,
                    &decoded,
                    target.hash_kind,
                )?;
                if size != target.size || digest != target.hash {
                    let _ = std::fs::remove_file(&decoded);
                    bail!(
                        "Decoded content mismatch for {}: {} bytes / {}",
                        self.op.path(),
                        size,
                        digest
                    );
                }
                self.move_into_place(&decoded)?;
                let _ = std::fs::remove_file(&self.staging);
            }
            Operation::Patch {
                data,
                target,
                patch_kind,
                ..
            } => {
                self.verify_staged(data)?;

                // Scope the mmap so it is dropped before the target is
                // replaced. On Windows, renaming over a file with an open
                // mapping is an error.
                let patched = {
                    let old = fsutil::mmap_file(&self.target)?;
                    let region = std::fs::read(&self.staging).with_context(|| {
                        format!("Failed to read staged delta: {}", self.staging.display())
                    })?;
                    codec.decode_delta(*patch_kind, data.compression, &region, &old)?
                };

                if patched.len() as u64 != target.size
                    || hash::hash_bytes(target.hash_kind, &patched) != target.hash
                {
                    bail!("Patched content mismatch for {}", self.op.path());
                }

                let decoded = self.staging_output();
                std::fs::write(&decoded, &patched).with_context(|| {
                    format!("Failed to write patched file: {}", decoded.display())
                })?;
                self.move_into_place(&decoded)?;
                let _ = std::fs::remove_file(&self.staging);
            }
            Operation::Rm { .. } => match std::fs::remove_file(&self.target) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(anyhow::Error::from(e)).with_context(|| {
                        format!("Failed to delete file: {}", self.target.display())
                    });
                }
            },
            // remove_dir, never remove_dir_all: a directory that still has
            // content is a producer-ordering violation and must fail.
            Operation::RmDir { .. } => match std::fs::remove_dir(&self.target) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(anyhow::Error::from(e)).with_context(|| {
                        format!("Failed to remove directory: {}", self.target.display())
                    });
                }
            },
        }
        Ok(())
    }

    /// True when the staging slot already holds this operation's data
    /// region, verified by size and region hash.
    fn staged_region_valid(&self, data: &DataRegion) -> bool {
        if data.size == 0 {
            return false;
        }
        match &data.hash {
            Some(hash) => hash::file_matches(&self.staging, data.size, hash, data.hash_kind),
            None => self
                .staging
                .metadata()
                .map(|m| m.is_file() && m.len() == data.size)
                .unwrap_or(false),
        }
    }

    fn verify_staged(&self, data: &DataRegion) -> anyhow::Result<()> {
        if !self.staged_region_valid(data) {
            bail!(
                "Staged data region for {} is missing or corrupt: {}",
                self.op.path(),
                self.staging.display()
            );
        }
        Ok(())
    }

    fn staging_output(&self) -> PathBuf {
        let mut name = self.staging.as_os_str().to_os_string();
        name.push(".out");
        PathBuf::from(name)
    }

    fn move_into_place(&self, decoded: &Path) -> anyhow::Result<()> {
        if let Some(parent) = self.target.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create directory: {}", parent.display())
            })?;
        }
        std::fs::rename(decoded, &self.target).with_context(|| {
            format!(
                "Failed to move {} into place at {}",
                decoded.display(),
                self.target.display()
            )
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecConfig;
    use crate::hash::hash_bytes;
    use std::fs;

    fn bind(op: Operation, root: &Path, index: usize) -> BoundOperation {
        let target = root.join("tree").join(op.path());
        let staging = root.join("tmp").join(format!("Operation{index}"));
        fs::create_dir_all(root.join("tree")).unwrap();
        fs::create_dir_all(root.join("tmp")).unwrap();
        BoundOperation {
            index,
            op,
            target,
            staging,
        }
    }

    fn add_op(path: &str, content: &[u8], codec: &Codec) -> (Operation, Vec<u8>) {
        let region = codec.encode(Compression::Zstd, content).unwrap();
        let op = Operation::Add {
            path: path.into(),
            data: DataRegion {
                offset: 0,
                size: region.len() as u64,
                hash: Some(hash_bytes(HashKind::Sha1, &region)),
                hash_kind: HashKind::Sha1,
                compression: Compression::Zstd,
            },
            target: FinalContent {
                size: content.len() as u64,
                hash: hash_bytes(HashKind::Sha1, content),
                hash_kind: HashKind::Sha1,
            },
        };
        (op, region)
    }

    fn patch_op(path: &str, old: &[u8], new: &[u8], codec: &Codec) -> (Operation, Vec<u8>) {
        let region = codec
            .encode_delta(PatchKind::Block, Compression::Zstd, old, new)
            .unwrap();
        let op = Operation::Patch {
            path: path.into(),
            data: DataRegion {
                offset: 0,
                size: region.len() as u64,
                hash: Some(hash_bytes(HashKind::Sha1, &region)),
                hash_kind: HashKind::Sha1,
                compression: Compression::Zstd,
            },
            target: FinalContent {
                size: new.len() as u64,
                hash: hash_bytes(HashKind::Sha1, new),
                hash_kind: HashKind::Sha1,
            },
            local_size: old.len() as u64,
            local_sha1: hash_bytes(HashKind::Sha1, old),
            patch_kind: PatchKind::Block,
        };
        (op, region)
    }

    #[test]
    fn test_wire_roundtrip_internally_tagged() {
        let codec = Codec::default();
        let (op, _) = add_op("bin/app", b"payload", &codec);
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains(r#""action":"add""#));
        assert!(json.contains(r#""dataOffset":0"#));
        assert!(json.contains(r#""finalHash""#));
        let back: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let json = r#"{"action":"chmod","path":"x"}"#;
        assert!(serde_json::from_str::<Operation>(json).is_err());
    }

    #[test]
    fn test_add_prepare_states() {
        let codec = Codec::default();
        let dir = tempfile::tempdir().unwrap();
        let (op, region) = add_op("file.txt", b"hello world", &codec);
        let bound = bind(op, dir.path(), 0);

        // Nothing local yet: data must be fetched.
        assert_eq!(bound.prepare().status, OpStatus::DownloadRequired);

        // Region staged: apply can run without a download.
        fs::write(&bound.staging, &region).unwrap();
        assert_eq!(bound.prepare().status, OpStatus::ApplyRequired);

        // Target already final: valid, staged or not.
        fs::write(&bound.target, b"hello world").unwrap();
        assert_eq!(bound.prepare().status, OpStatus::Valid);
    }

    #[test]
    fn test_prepare_is_idempotent() {
        let codec = Codec::default();
        let dir = tempfile::tempdir().unwrap();
        let (op, _) = add_op("file.txt", b"data", &codec);
        let bound = bind(op, dir.path(), 0);
        let first = bound.prepare().status;
        let second = bound.prepare().status;
        assert_eq!(first, second);
    }

    #[test]
    fn test_add_apply_then_prepare_is_valid() {
        let codec = Codec::new(CodecConfig::default());
        let dir = tempfile::tempdir().unwrap();
        let (op, region) = add_op("sub/file.bin", &[0xAB; 5000], &codec);
        let bound = bind(op, dir.path(), 3);
        fs::write(&bound.staging, &region).unwrap();

        let outcome = bound.apply(&codec);
        assert_eq!(outcome.status, OpStatus::Valid, "{:?}", outcome.error);
        assert_eq!(bound.prepare().status, OpStatus::Valid);
        // Staged region consumed.
        assert!(!bound.staging.exists());
    }

    #[test]
    fn test_patch_apply_and_local_file_invalid() {
        let codec = Codec::default();
        let dir = tempfile::tempdir().unwrap();
        let old = vec![3u8; 9000];
        let mut new = old.clone();
        new[100] = 7;
        let (op, region) = patch_op("file.bin", &old, &new, &codec);
        let bound = bind(op, dir.path(), 0);

        // Local file at the pre-patch state.
        fs::write(&bound.target, &old).unwrap();
        assert_eq!(bound.prepare().status, OpStatus::DownloadRequired);

        fs::write(&bound.staging, &region).unwrap();
        assert_eq!(bound.prepare().status, OpStatus::ApplyRequired);

        let outcome = bound.apply(&codec);
        assert_eq!(outcome.status, OpStatus::Valid, "{:?}", outcome.error);
        assert_eq!(fs::read(&bound.target).unwrap(), new);
        assert_eq!(bound.prepare().status, OpStatus::Valid);

        // Corrupt the result: matches neither pre- nor post-hash.
        fs::write(&bound.target, b"corrupted beyond recognition").unwrap();
        assert_eq!(bound.prepare().status, OpStatus::LocalFileInvalid);
    }

    #[test]
    fn test_patch_missing_local_file_is_invalid() {
        let codec = Codec::default();
        let dir = tempfile::tempdir().unwrap();
        let (op, _) = patch_op("gone.bin", b"old content", b"new content", &codec);
        let bound = bind(op, dir.path(), 0);
        assert_eq!(bound.prepare().status, OpStatus::LocalFileInvalid);
    }

    #[test]
    fn test_add_corrupt_staging_fails_apply() {
        let codec = Codec::default();
        let dir = tempfile::tempdir().unwrap();
        let (op, region) = add_op("file.txt", b"expected", &codec);
        let bound = bind(op, dir.path(), 0);
        let mut bad = region.clone();
        bad[0] ^= 0xFF;
        fs::write(&bound.staging, &bad).unwrap();

        let outcome = bound.apply(&codec);
        assert_eq!(outcome.status, OpStatus::ApplyFailed);
        assert!(outcome.error.unwrap().contains("missing or corrupt"));
        assert!(!bound.target.exists());
    }

    #[test]
    fn test_rm_and_rmdir() {
        let codec = Codec::default();
        let dir = tempfile::tempdir().unwrap();
        let rm = bind(
            Operation::Rm {
                path: "old.txt".into(),
                local_size: 3,
                local_sha1: hash_bytes(HashKind::Sha1, b"old"),
            },
            dir.path(),
            0,
        );
        // Absent: nothing to do.
        assert_eq!(rm.prepare().status, OpStatus::Valid);

        fs::write(&rm.target, b"old").unwrap();
        let outcome = rm.prepare();
        assert_eq!(outcome.status, OpStatus::ApplyRequired);
        assert!(outcome.warning.is_none());
        assert_eq!(rm.apply(&codec).status, OpStatus::Valid);
        assert!(!rm.target.exists());

        // Unexpected content still removes, but warns.
        fs::write(&rm.target, b"something else").unwrap();
        let outcome = rm.prepare();
        assert_eq!(outcome.status, OpStatus::ApplyRequired);
        assert!(outcome.warning.is_some());

        let rmdir = bind(Operation::RmDir { path: "sub".into() }, dir.path(), 1);
        fs::create_dir_all(&rmdir.target).unwrap();
        assert_eq!(rmdir.prepare().status, OpStatus::ApplyRequired);
        assert_eq!(rmdir.apply(&codec).status, OpStatus::Valid);
        assert_eq!(rmdir.prepare().status, OpStatus::Valid);
    }

    #[test]
    fn test_rmdir_refuses_non_empty_directory() {
        let codec = Codec::default();
        let dir = tempfile::tempdir().unwrap();
        let rmdir = bind(Operation::RmDir { path: "keep".into() }, dir.path(), 0);
        fs::create_dir_all(rmdir.target.join("child")).unwrap();

        let outcome = rmdir.apply(&codec);
        assert_eq!(outcome.status, OpStatus::ApplyFailed);
        // The directory and its contents survive.
        assert!(rmdir.target.join("child").exists());
    }

    #[test]
    fn test_mkdir() {
        let codec = Codec::default();
        let dir = tempfile::tempdir().unwrap();
        let mkdir = bind(Operation::MkDir { path: "a/b".into() }, dir.path(), 0);
        assert_eq!(mkdir.prepare().status, OpStatus::ApplyRequired);
        assert_eq!(mkdir.apply(&codec).status, OpStatus::Valid);
        assert_eq!(mkdir.prepare().status, OpStatus::Valid);
    }
}
