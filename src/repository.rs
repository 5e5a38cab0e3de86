use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::codec::{Codec, Compression, PatchKind};
use crate::fsutil::{self, EntryKind};
use crate::graph;
use crate::hash::{self, HashKind};
use crate::metadata::PackageMetadata;
use crate::operation::{DataRegion, FinalContent, Operation};
use crate::revision::{
    self, CurrentFile, Package, PackagesFile, Revision, VersionsFile, CURRENT_RESOURCE,
    DOC_VERSION, PACKAGES_RESOURCE, VERSIONS_RESOURCE,
};

/// Returns true for file types that are already compressed or otherwise
/// incompressible, where a binary delta or another compression pass would
/// yield no meaningful savings. Such files ship as raw `add` regions.
fn is_incompressible(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    matches!(
        ext.as_deref(),
        Some(
            // Images
            "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" | "ico" | "tiff" | "tif" | "avif"
            // Video
            | "mp4" | "mkv" | "avi" | "mov" | "wmv" | "flv" | "webm" | "m4v"
            // Audio
            | "mp3" | "aac" | "ogg" | "flac" | "opus" | "m4a" | "wma"
            // Archives
            | "zip" | "gz" | "bz2" | "xz" | "zst" | "7z" | "rar"
            // Office (zip-based containers)
            | "docx" | "xlsx" | "pptx" | "odt" | "ods" | "odp"
            // Fonts
            | "woff" | "woff2"
            // Other
            | "pdf"
        )
    )
}

/// A server-side repository directory: the three index documents plus the
/// package blobs and metadata files.
pub struct Repository {
    root: PathBuf,
    packages: Vec<Package>,
    versions: Vec<Revision>,
    current: Option<Revision>,
}

impl Repository {
    /// Open a repository directory, creating the in-memory view from
    /// whatever index files exist.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create repository: {}", root.display()))?;

        let packages = match std::fs::read(root.join(PACKAGES_RESOURCE)) {
            Ok(bytes) => revision::parse_packages(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e).context("Failed to read packages index"),
        };
        let versions = match std::fs::read(root.join(VERSIONS_RESOURCE)) {
            Ok(bytes) => revision::parse_versions(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e).context("Failed to read versions index"),
        };
        let current = match std::fs::read(root.join(CURRENT_RESOURCE)) {
            Ok(bytes) => Some(revision::parse_current(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e).context("Failed to read current pointer"),
        };

        Ok(Self {
            root,
            packages,
            versions,
            current,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn packages(&self) -> &[Package] {
        &self.packages
    }

    pub fn versions(&self) -> &[Revision] {
        &self.versions
    }

    pub fn current(&self) -> Option<&Revision> {
        self.current.as_ref()
    }

    /// Write the three index documents back. Revisions referenced by any
    /// package endpoint but missing from the versions list are inserted
    /// with an empty description.
    pub fn save(&mut self) -> Result<()> {
        for package in &self.packages {
            for rev in [&package.from, &package.to] {
                if !rev.is_empty() && !self.versions.iter().any(|v| &v.id == rev) {
                    self.versions.push(Revision::new(rev.clone(), ""));
                }
            }
        }
        self.packages = revision::dedup_packages(std::mem::take(&mut self.packages));

        let doc = PackagesFile {
            version: DOC_VERSION.to_string(),
            packages: self.packages.clone(),
        };
        std::fs::write(
            self.root.join(PACKAGES_RESOURCE),
            serde_json::to_vec_pretty(&doc)?,
        )?;

        let doc = VersionsFile {
            version: DOC_VERSION.to_string(),
            versions: self.versions.clone(),
        };
        std::fs::write(
            self.root.join(VERSIONS_RESOURCE),
            serde_json::to_vec_pretty(&doc)?,
        )?;

        if let Some(current) = &self.current {
            let doc = CurrentFile {
                version: DOC_VERSION.to_string(),
                current: current.clone(),
            };
            std::fs::write(
                self.root.join(CURRENT_RESOURCE),
                serde_json::to_vec_pretty(&doc)?,
            )?;
        }
        Ok(())
    }

    /// Point `current` at a revision, inserting it if unknown.
    pub fn set_current(&mut self, rev: &str) -> Result<()> {
        let revision = match self.versions.iter().find(|v| v.id == rev) {
            Some(revision) => revision.clone(),
            None => {
                let revision = Revision::new(rev, "");
                self.versions.push(revision.clone());
                revision
            }
        };
        self.current = Some(revision);
        self.save()
    }

    fn insert_package(&mut self, package: Package) {
        self.packages
            .retain(|p| !(p.from == package.from && p.to == package.to));
        self.packages.push(package);
    }

    /// Register an externally built package. `source` points at the blob
    /// file; `<source>.metadata` must sit next to it. Both are copied into
    /// the repository under the canonical name.
    pub fn add_package(&mut self, source: &Path) -> Result<Package> {
        let metadata_path = {
            let mut name = source.as_os_str().to_os_string();
            name.push(".metadata");
            PathBuf::from(name)
        };
        let bytes = std::fs::read(&metadata_path)
            .with_context(|| format!("Failed to read {}", metadata_path.display()))?;
        let meta = PackageMetadata::from_json(&bytes)?;
        let package = meta.package.clone();

        let blob_dest = self.root.join(package.data_resource());
        let meta_dest = self.root.join(package.metadata_resource());
        if source != blob_dest {
            std::fs::copy(source, &blob_dest)
                .with_context(|| format!("Failed to copy blob into {}", blob_dest.display()))?;
            std::fs::copy(&metadata_path, &meta_dest)
                .with_context(|| format!("Failed to copy metadata into {}", meta_dest.display()))?;
        }

        self.insert_package(package.clone());
        self.save()?;
        Ok(package)
    }

    /// Drop a package from the index and delete its files.
    pub fn remove_package(&mut self, name: &str) -> Result<Package> {
        let (from, to) = Package::parse_name(name)?;
        let index = self
            .packages
            .iter()
            .position(|p| p.from == from && p.to == to);
        let Some(index) = index else {
            bail!("Package {name} is not in the repository");
        };
        let package = self.packages.remove(index);
        let _ = std::fs::remove_file(self.root.join(package.data_resource()));
        let _ = std::fs::remove_file(self.root.join(package.metadata_resource()));
        self.save()?;
        Ok(package)
    }

    /// Keep only packages lying on some cheapest chain to the current
    /// revision, from any known starting point (including the synthetic
    /// complete-install origin). Everything else is dropped and deleted.
    pub fn simplify(&mut self) -> Result<Vec<String>> {
        let Some(current) = self.current.clone() else {
            bail!("Repository has no current revision; nothing to simplify against");
        };

        let mut origins: Vec<String> = vec![String::new()];
        for package in &self.packages {
            if !package.from.is_empty() {
                origins.push(package.from.clone());
            }
            origins.push(package.to.clone());
        }
        origins.sort();
        origins.dedup();

        let mut useful: HashSet<String> = HashSet::new();
        for origin in &origins {
            for package in graph::find_path(&self.packages, origin, &current.id) {
                useful.insert(package.name());
            }
        }

        let (kept, dropped): (Vec<Package>, Vec<Package>) = std::mem::take(&mut self.packages)
            .into_iter()
            .partition(|p| useful.contains(&p.name()));
        self.packages = kept;

        let mut removed = Vec::new();
        for package in dropped {
            let name = package.name();
            let _ = std::fs::remove_file(self.root.join(package.data_resource()));
            let _ = std::fs::remove_file(self.root.join(package.metadata_resource()));
            info!(package = %name, "dropped from repository");
            removed.push(name);
        }
        self.save()?;
        Ok(removed)
    }
}

/// Counters reported after building a package.
#[derive(Debug, Default)]
pub struct PackageSummary {
    pub package: Option<Package>,
    pub dirs: usize,
    pub files_added: usize,
    pub files_patched: usize,
    pub files_unchanged: usize,
    pub files_deleted: usize,
    pub dirs_deleted: usize,
}

/// One file's contribution to the package, before blob offsets exist.
enum FilePlan {
    Add {
        path: String,
        region: Vec<u8>,
        compression: Compression,
        final_size: u64,
        final_hash: String,
    },
    Patch {
        path: String,
        region: Vec<u8>,
        compression: Compression,
        final_size: u64,
        final_hash: String,
        local_size: u64,
        local_sha1: String,
    },
    Unchanged {
        path: String,
        final_size: u64,
        final_hash: String,
    },
}

impl FilePlan {
    fn path(&self) -> &str {
        match self {
            FilePlan::Add { path, .. }
            | FilePlan::Patch { path, .. }
            | FilePlan::Unchanged { path, .. } => path,
        }
    }
}

/// Build a package transforming `old` into `new_dir` (a complete install
/// when `old` is `None`), write its blob and metadata into the repository,
/// and register it.
///
/// The metadata enumerates the complete target tree: every directory gets a
/// `mkdir`, every file an `add` or `patch`, with unchanged files carried as
/// zero-length `add` regions so a chain's final package always describes the
/// whole managed tree.
pub async fn make_package(
    repo: &mut Repository,
    new_dir: &Path,
    new_rev: &str,
    old: Option<(PathBuf, String)>,
    codec: &Codec,
) -> Result<PackageSummary> {
    let (old_dir, old_rev) = match old {
        Some((dir, rev)) => (Some(dir), rev),
        None => (None, String::new()),
    };
    if new_rev.is_empty() {
        bail!("Target revision must not be empty");
    }
    if new_rev == old_rev {
        bail!("Package endpoints must differ: {new_rev:?}");
    }

    // Stage 1: walk both trees concurrently.
    let new_dir_owned = new_dir.to_path_buf();
    let (new_entries, old_entries) = tokio::try_join!(
        tokio::task::spawn_blocking(move || fsutil::walk_directory(&new_dir_owned)),
        tokio::task::spawn_blocking({
            let old_dir = old_dir.clone();
            move || match old_dir {
                Some(dir) => fsutil::walk_directory(&dir),
                None => Ok(Vec::new()),
            }
        }),
    )?;
    let new_entries = new_entries?;
    let old_entries = old_entries?;

    // Stage 2: classify by path.
    let old_map: HashMap<String, usize> = old_entries
        .iter()
        .enumerate()
        .map(|(i, e)| (e.relative_path.clone(), i))
        .collect();
    let new_map: HashMap<String, usize> = new_entries
        .iter()
        .enumerate()
        .map(|(i, e)| (e.relative_path.clone(), i))
        .collect();
    let old_paths = fsutil::path_set(&old_entries);
    let new_paths = fsutil::path_set(&new_entries);

    let mut dirs: Vec<String> = Vec::new();
    let mut files_new: Vec<usize> = Vec::new(); // indices into new_entries
    let mut files_common: Vec<(usize, usize)> = Vec::new(); // (old_idx, new_idx)
    let mut files_deleted: Vec<String> = Vec::new();
    let mut dirs_deleted: Vec<String> = Vec::new();

    for path in &new_paths {
        let idx = new_map[path];
        match new_entries[idx].kind {
            EntryKind::Dir => dirs.push(path.clone()),
            EntryKind::File => match old_map.get(path) {
                Some(&old_idx) if old_entries[old_idx].kind == EntryKind::File => {
                    files_common.push((old_idx, idx));
                }
                _ => files_new.push(idx),
            },
        }
    }
    for path in old_paths.difference(&new_paths) {
        let idx = old_map[path];
        match old_entries[idx].kind {
            EntryKind::Dir => dirs_deleted.push(path.clone()),
            EntryKind::File => files_deleted.push(path.clone()),
        }
    }

    // Stage 3: hash, compress and diff in parallel. If sizes differ the
    // file is definitely changed: skip hashing the old copy for the
    // equality check (its hash is still needed as the pre-patch anchor).
    struct CommonInput {
        rel_path: String,
        old_path: PathBuf,
        new_path: PathBuf,
    }
    let common_inputs: Vec<CommonInput> = files_common
        .iter()
        .map(|&(oi, ni)| CommonInput {
            rel_path: new_entries[ni].relative_path.clone(),
            old_path: old_entries[oi].full_path.clone(),
            new_path: new_entries[ni].full_path.clone(),
        })
        .collect();
    let add_inputs: Vec<(String, PathBuf)> = files_new
        .iter()
        .map(|&ni| {
            (
                new_entries[ni].relative_path.clone(),
                new_entries[ni].full_path.clone(),
            )
        })
        .collect();

    let codec_for_common = codec.clone();
    let codec_for_add = codec.clone();
    let (common_plans, add_plans) = tokio::try_join!(
        tokio::task::spawn_blocking(move || -> Result<Vec<FilePlan>> {
            common_inputs
                .par_iter()
                .map(|input| -> Result<FilePlan> {
                    let new_hash = hash::hash_file(HashKind::Sha1, &input.new_path)?;
                    let old_hash = hash::hash_file(HashKind::Sha1, &input.old_path)?;
                    let new_size = std::fs::metadata(&input.new_path)?.len();
                    if old_hash == new_hash {
                        return Ok(FilePlan::Unchanged {
                            path: input.rel_path.clone(),
                            final_size: new_size,
                            final_hash: new_hash,
                        });
                    }

                    let old_size = std::fs::metadata(&input.old_path)?.len();
                    if is_incompressible(&input.new_path) {
                        // No savings to be had: ship the raw content.
                        let new_data = fsutil::mmap_file(&input.new_path)?;
                        return Ok(FilePlan::Add {
                            path: input.rel_path.clone(),
                            region: new_data.to_vec(),
                            compression: Compression::None,
                            final_size: new_size,
                            final_hash: new_hash,
                        });
                    }

                    let old_data = fsutil::mmap_file(&input.old_path)?;
                    let new_data = fsutil::mmap_file(&input.new_path)?;
                    let region = codec_for_common.encode_delta(
                        PatchKind::Block,
                        Compression::Zstd,
                        &old_data,
                        &new_data,
                    )?;
                    Ok(FilePlan::Patch {
                        path: input.rel_path.clone(),
                        region,
                        compression: Compression::Zstd,
                        final_size: new_size,
                        final_hash: new_hash,
                        local_size: old_size,
                        local_sha1: old_hash,
                    })
                })
                .collect()
        }),
        tokio::task::spawn_blocking(move || -> Result<Vec<FilePlan>> {
            add_inputs
                .par_iter()
                .map(|(rel_path, full_path)| -> Result<FilePlan> {
                    let data = fsutil::mmap_file(full_path)?;
                    let compression = if is_incompressible(full_path) {
                        Compression::None
                    } else {
                        Compression::Zstd
                    };
                    let region = codec_for_add.encode(compression, &data)?;
                    Ok(FilePlan::Add {
                        path: rel_path.clone(),
                        region,
                        compression,
                        final_size: data.len() as u64,
                        final_hash: hash::hash_bytes(HashKind::Sha1, &data),
                    })
                })
                .collect()
        }),
    )?;
    let mut plans = common_plans?;
    plans.extend(add_plans?);
    plans.sort_by(|a, b| a.path().cmp(b.path()));

    // Stage 4: assemble operations in blob-offset order and concatenate the
    // data blob.
    let mut summary = PackageSummary::default();
    let mut operations: Vec<Operation> = Vec::new();
    let mut blob: Vec<u8> = Vec::new();

    fsutil::sort_dirs_parent_first(&mut dirs);
    for path in &dirs {
        operations.push(Operation::MkDir { path: path.clone() });
    }
    summary.dirs = dirs.len();

    for plan in plans {
        let offset = blob.len() as u64;
        match plan {
            FilePlan::Add {
                path,
                region,
                compression,
                final_size,
                final_hash,
            } => {
                summary.files_added += 1;
                operations.push(Operation::Add {
                    path,
                    data: DataRegion {
                        offset,
                        size: region.len() as u64,
                        hash: Some(hash::hash_bytes(HashKind::Sha1, &region)),
                        hash_kind: HashKind::Sha1,
                        compression,
                    },
                    target: FinalContent {
                        size: final_size,
                        hash: final_hash,
                        hash_kind: HashKind::Sha1,
                    },
                });
                blob.extend_from_slice(&region);
            }
            FilePlan::Patch {
                path,
                region,
                compression,
                final_size,
                final_hash,
                local_size,
                local_sha1,
            } => {
                summary.files_patched += 1;
                operations.push(Operation::Patch {
                    path,
                    data: DataRegion {
                        offset,
                        size: region.len() as u64,
                        hash: Some(hash::hash_bytes(HashKind::Sha1, &region)),
                        hash_kind: HashKind::Sha1,
                        compression,
                    },
                    target: FinalContent {
                        size: final_size,
                        hash: final_hash,
                        hash_kind: HashKind::Sha1,
                    },
                    local_size,
                    local_sha1,
                    patch_kind: PatchKind::Block,
                });
                blob.extend_from_slice(&region);
            }
            FilePlan::Unchanged {
                path,
                final_size,
                final_hash,
            } => {
                summary.files_unchanged += 1;
                operations.push(Operation::Add {
                    path,
                    data: DataRegion {
                        offset,
                        size: 0,
                        hash: None,
                        hash_kind: HashKind::Sha1,
                        compression: Compression::None,
                    },
                    target: FinalContent {
                        size: final_size,
                        hash: final_hash,
                        hash_kind: HashKind::Sha1,
                    },
                });
            }
        }
    }

    files_deleted.sort();
    for path in &files_deleted {
        let old_path = &old_entries[old_map[path]].full_path;
        operations.push(Operation::Rm {
            path: path.clone(),
            local_size: std::fs::metadata(old_path)?.len(),
            local_sha1: hash::hash_file(HashKind::Sha1, old_path)?,
        });
    }
    summary.files_deleted = files_deleted.len();

    fsutil::sort_dirs_deepest_first(&mut dirs_deleted);
    for path in &dirs_deleted {
        operations.push(Operation::RmDir { path: path.clone() });
    }
    summary.dirs_deleted = dirs_deleted.len();

    let package = Package {
        from: old_rev.clone(),
        to: new_rev.to_string(),
        size: blob.len() as u64,
    };
    let meta = PackageMetadata::new(package.clone(), operations);

    // Stage 5: write blob + metadata, register the package.
    std::fs::write(repo.root().join(package.data_resource()), &blob)
        .with_context(|| format!("Failed to write package blob {}", package.name()))?;
    std::fs::write(
        repo.root().join(package.metadata_resource()),
        meta.to_json()?,
    )
    .with_context(|| format!("Failed to write metadata for {}", package.name()))?;

    repo.insert_package(package.clone());
    repo.save()?;

    if package.is_complete() {
        info!(package = %package.name(), bytes = package.size, "complete package built");
    } else {
        info!(package = %package.name(), bytes = package.size, "patch package built");
    }
    summary.package = Some(package);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
        for (rel, content) in files {
            let full = root.join(rel);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&full, content).unwrap();
        }
    }

    #[tokio::test]
    async fn test_complete_package_enumerates_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let tree = tmp.path().join("v1");
        write_tree(
            &tree,
            &[
                ("app.bin", &[0x42; 5000]),
                ("data/strings.txt", b"hello"),
            ],
        );

        let mut repo = Repository::open(tmp.path().join("repo")).unwrap();
        let codec = Codec::default();
        let summary = make_package(&mut repo, &tree, "1", None, &codec)
            .await
            .unwrap();

        assert_eq!(summary.files_added, 2);
        assert_eq!(summary.dirs, 1);
        assert_eq!(summary.files_unchanged, 0);
        let package = summary.package.unwrap();
        assert_eq!(package.name(), "complete_1");
        assert!(repo.root().join("complete_1").exists());
        assert!(repo.root().join("complete_1.metadata").exists());

        // The blob parses back against its own metadata.
        let bytes = std::fs::read(repo.root().join("complete_1.metadata")).unwrap();
        let meta = PackageMetadata::from_json(&bytes).unwrap();
        assert_eq!(meta.operation_count(), 3);
        assert_eq!(
            std::fs::metadata(repo.root().join("complete_1")).unwrap().len(),
            meta.package.size
        );
    }

    #[tokio::test]
    async fn test_patch_package_classifies_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let v1 = tmp.path().join("v1");
        let v2 = tmp.path().join("v2");
        write_tree(
            &v1,
            &[
                ("same.txt", b"unchanged content"),
                ("changed.bin", &[0xAA; 9000]),
                ("doomed.txt", b"will be deleted"),
                ("gone/inner.txt", b"dir disappears"),
            ],
        );
        let mut changed = vec![0xAA; 4500];
        changed.extend_from_slice(&[0xBB; 4500]);
        write_tree(
            &v2,
            &[
                ("same.txt", b"unchanged content"),
                ("changed.bin", &changed),
                ("fresh.txt", b"brand new"),
            ],
        );

        let mut repo = Repository::open(tmp.path().join("repo")).unwrap();
        let codec = Codec::default();
        let summary = make_package(&mut repo, &v2, "2", Some((v1, "1".into())), &codec)
            .await
            .unwrap();

        assert_eq!(summary.files_unchanged, 1);
        assert_eq!(summary.files_patched, 1);
        assert_eq!(summary.files_added, 1);
        assert_eq!(summary.files_deleted, 2);
        assert_eq!(summary.dirs_deleted, 1);
        assert_eq!(summary.package.unwrap().name(), "patch1_2");

        // Registering auto-inserts both revisions.
        assert!(repo.versions().iter().any(|v| v.id == "1"));
        assert!(repo.versions().iter().any(|v| v.id == "2"));
    }

    /// Incompressible content (xorshift stream) so patch regions stay much
    /// smaller than complete blobs; toy payloads would invert the economics.
    fn noise(len: usize, seed: u64) -> Vec<u8> {
        let mut x = seed | 1;
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                x as u8
            })
            .collect()
    }

    #[tokio::test]
    async fn test_simplify_drops_useless_packages() {
        let tmp = tempfile::tempdir().unwrap();
        let v1 = tmp.path().join("v1");
        let v2 = tmp.path().join("v2");
        let v3 = tmp.path().join("v3");
        let base = noise(64 * 1024, 1);
        let mut second = base.clone();
        second[100] ^= 0xFF;
        let mut third = second.clone();
        third[50_000] ^= 0xFF;
        write_tree(&v1, &[("f", &base)]);
        write_tree(&v2, &[("f", &second)]);
        write_tree(&v3, &[("f", &third)]);

        let mut repo = Repository::open(tmp.path().join("repo")).unwrap();
        let codec = Codec::default();
        make_package(&mut repo, &v1, "1", None, &codec).await.unwrap();
        make_package(&mut repo, &v2, "2", Some((v1.clone(), "1".into())), &codec)
            .await
            .unwrap();
        make_package(&mut repo, &v3, "3", Some((v2.clone(), "2".into())), &codec)
            .await
            .unwrap();
        make_package(&mut repo, &v3, "3", None, &codec).await.unwrap();
        repo.set_current("3").unwrap();

        // From scratch, complete_3 beats complete_1 + both patches; the
        // patches stay useful for clients sitting at revisions 1 and 2.
        let removed = repo.simplify().unwrap();
        assert_eq!(removed, vec!["complete_1".to_string()]);
        assert!(!repo.root().join("complete_1").exists());
        assert!(repo.root().join("patch1_2").exists());

        // Retargeting at revision 2 strands everything leading to 3.
        repo.set_current("2").unwrap();
        let removed = repo.simplify().unwrap();
        assert!(removed.contains(&"patch2_3".to_string()));
        assert!(removed.contains(&"complete_3".to_string()));
        assert!(!repo.root().join("patch2_3").exists());
        assert!(repo.root().join("patch1_2").exists());
    }

    #[tokio::test]
    async fn test_add_package_registers_external_build() {
        let tmp = tempfile::tempdir().unwrap();
        let v1 = tmp.path().join("v1");
        write_tree(&v1, &[("f", b"payload")]);

        // Build in a scratch repository, register the artifacts elsewhere.
        let mut scratch = Repository::open(tmp.path().join("scratch")).unwrap();
        make_package(&mut scratch, &v1, "1", None, &Codec::default())
            .await
            .unwrap();

        let mut repo = Repository::open(tmp.path().join("repo")).unwrap();
        let package = repo
            .add_package(&scratch.root().join("complete_1"))
            .unwrap();
        assert_eq!(package.name(), "complete_1");
        assert!(repo.root().join("complete_1").exists());
        assert!(repo.root().join("complete_1.metadata").exists());
        assert_eq!(repo.packages().len(), 1);
        // Registering again replaces, not duplicates.
        repo.add_package(&scratch.root().join("complete_1")).unwrap();
        assert_eq!(repo.packages().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_package() {
        let tmp = tempfile::tempdir().unwrap();
        let v1 = tmp.path().join("v1");
        write_tree(&v1, &[("f", b"one")]);
        let mut repo = Repository::open(tmp.path().join("repo")).unwrap();
        make_package(&mut repo, &v1, "1", None, &Codec::default())
            .await
            .unwrap();

        repo.remove_package("complete_1").unwrap();
        assert!(repo.packages().is_empty());
        assert!(!repo.root().join("complete_1").exists());
        assert!(repo.remove_package("complete_1").is_err());
    }
}
