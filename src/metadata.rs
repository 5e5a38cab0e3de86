use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::operation::{BoundOperation, Operation};
use crate::revision::{Package, DOC_VERSION};

/// The `<packagename>.metadata` document.
#[derive(Debug, Serialize, Deserialize)]
struct MetadataFile {
    version: String,
    operations: Vec<Operation>,
    package: Package,
}

/// Parsed package metadata: the package identity plus its operations in
/// blob-offset order. Pure data; no network or filesystem access happens
/// here.
#[derive(Debug, Clone)]
pub struct PackageMetadata {
    pub package: Package,
    operations: Vec<Operation>,
}

impl PackageMetadata {
    pub fn new(package: Package, operations: Vec<Operation>) -> Self {
        Self {
            package,
            operations,
        }
    }

    /// Parse and validate a metadata document: format version, safe relative
    /// paths, and contiguous monotonically non-decreasing data offsets.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let doc: MetadataFile = serde_json::from_slice(bytes).map_err(|source| Error::Json {
            resource: "package metadata".to_string(),
            source,
        })?;
        if doc.version != DOC_VERSION {
            return Err(Error::UnsupportedVersion {
                resource: doc.package.metadata_resource(),
                found: doc.version,
                expected: DOC_VERSION.to_string(),
            });
        }

        let mut cursor = 0u64;
        for op in &doc.operations {
            let path = op.path();
            if path.is_empty()
                || path.starts_with('/')
                || path.split('/').any(|part| part.is_empty() || part == "..")
            {
                return Err(Error::Metadata(format!(
                    "unsafe operation path {path:?} in {}",
                    doc.package.name()
                )));
            }
            if let Some(region) = op.data_region() {
                if region.offset != cursor {
                    return Err(Error::Metadata(format!(
                        "data region for {path:?} at offset {} (expected {cursor}) in {}",
                        region.offset,
                        doc.package.name()
                    )));
                }
                cursor += region.size;
            }
        }
        if cursor != doc.package.size {
            return Err(Error::Metadata(format!(
                "operations cover {cursor} bytes but package {} declares {}",
                doc.package.name(),
                doc.package.size
            )));
        }

        Ok(Self {
            package: doc.package,
            operations: doc.operations,
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        let doc = MetadataFile {
            version: DOC_VERSION.to_string(),
            operations: self.operations.clone(),
            package: self.package.clone(),
        };
        serde_json::to_vec_pretty(&doc).map_err(|source| Error::Json {
            resource: self.package.metadata_resource(),
            source,
        })
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    pub fn operation(&self, index: usize) -> Option<&Operation> {
        self.operations.get(index)
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn data_resource(&self) -> String {
        self.package.data_resource()
    }

    pub fn metadata_resource(&self) -> String {
        self.package.metadata_resource()
    }

    /// Total bytes of blob data across all operations.
    pub fn total_data_size(&self) -> u64 {
        self.operations.iter().map(|op| op.data_size()).sum()
    }

    /// Last operation touching `path`, used by the repair pass to rebuild a
    /// single file from a complete-install package.
    pub fn find_operation_for(&self, path: &str) -> Option<(usize, &Operation)> {
        self.operations
            .iter()
            .enumerate()
            .rev()
            .find(|(_, op)| op.path() == path)
    }

    /// Bind every operation to its target path under `update_dir` and its
    /// staging slot `Operation<i>` under `tmp_dir`.
    pub fn bind(&self, update_dir: &Path, tmp_dir: &Path) -> Vec<BoundOperation> {
        self.operations
            .iter()
            .enumerate()
            .map(|(index, op)| BoundOperation {
                index,
                op: op.clone(),
                target: update_dir.join(op.path()),
                staging: tmp_dir.join(format!("Operation{index}")),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Compression;
    use crate::hash::HashKind;
    use crate::operation::{DataRegion, FinalContent};

    fn add(path: &str, offset: u64, size: u64) -> Operation {
        Operation::Add {
            path: path.into(),
            data: DataRegion {
                offset,
                size,
                hash: Some("00".into()),
                hash_kind: HashKind::Sha1,
                compression: Compression::Zstd,
            },
            target: FinalContent {
                size,
                hash: "00".into(),
                hash_kind: HashKind::Sha1,
            },
        }
    }

    fn doc(package_size: u64, operations: Vec<Operation>) -> Vec<u8> {
        let meta = PackageMetadata::new(
            Package {
                from: "1".into(),
                to: "2".into(),
                size: package_size,
            },
            operations,
        );
        meta.to_json().unwrap()
    }

    #[test]
    fn test_roundtrip_and_accessors() {
        let ops = vec![
            Operation::MkDir { path: "d".into() },
            add("d/a", 0, 10),
            add("d/b", 10, 5),
            Operation::Rm {
                path: "old".into(),
                local_size: 1,
                local_sha1: "00".into(),
            },
        ];
        let bytes = doc(15, ops);
        let meta = PackageMetadata::from_json(&bytes).unwrap();
        assert_eq!(meta.operation_count(), 4);
        assert_eq!(meta.total_data_size(), 15);
        assert_eq!(meta.operation(1).unwrap().path(), "d/a");
        assert_eq!(meta.data_resource(), "patch1_2");
        assert_eq!(meta.metadata_resource(), "patch1_2.metadata");
        assert_eq!(meta.find_operation_for("d/b").unwrap().0, 2);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let bytes = doc(10, vec![add("a", 0, 10)]);
        let mut doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        doc["version"] = "2".into();
        let bytes = serde_json::to_vec(&doc).unwrap();
        assert!(matches!(
            PackageMetadata::from_json(&bytes),
            Err(Error::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn test_rejects_non_contiguous_offsets() {
        let bytes = doc(20, vec![add("a", 0, 10), add("b", 15, 5)]);
        assert!(matches!(
            PackageMetadata::from_json(&bytes),
            Err(Error::Metadata(_))
        ));
    }

    #[test]
    fn test_rejects_size_mismatch_with_package() {
        let bytes = doc(99, vec![add("a", 0, 10)]);
        assert!(matches!(
            PackageMetadata::from_json(&bytes),
            Err(Error::Metadata(_))
        ));
    }

    #[test]
    fn test_rejects_path_traversal() {
        let bytes = doc(10, vec![add("../escape", 0, 10)]);
        assert!(matches!(
            PackageMetadata::from_json(&bytes),
            Err(Error::Metadata(_))
        ));
        let bytes = doc(10, vec![add("/abs", 0, 10)]);
        assert!(PackageMetadata::from_json(&bytes).is_err());
    }

    #[test]
    fn test_bind_assigns_staging_slots() {
        let bytes = doc(10, vec![add("x/y", 0, 10)]);
        let meta = PackageMetadata::from_json(&bytes).unwrap();
        let bound = meta.bind(Path::new("/install"), Path::new("/tmpdir"));
        assert_eq!(bound[0].target, Path::new("/install/x/y"));
        assert_eq!(bound[0].staging, Path::new("/tmpdir/Operation0"));
    }
}
