use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::codec::{Codec, CodecConfig};
use crate::error::{Error, Result};
use crate::events::{CancelToken, EventKind, EventSink, ProgressCounters, UpdateEvent};
use crate::graph::{self, chain_size};
use crate::metadata::PackageMetadata;
use crate::operation::{BoundOperation, OpStatus, Operation};
use crate::pipeline::{self, FailedOperation, PipelineCtx, DEFAULT_SKIP_THRESHOLD};
use crate::revision::{
    self, Package, Revision, CURRENT_RESOURCE, PACKAGES_RESOURCE, VERSIONS_RESOURCE,
};
use crate::source::{ByteRange, Source};
use crate::state::{LocalState, STATUS_FILE};

/// Scheduler lifecycle. `update` is only accepted from `UpdateRequired`
/// (or `Idle`, which first runs the check); anything else is a logged no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdaterState {
    Idle,
    DownloadingInformations,
    UpdateRequired,
    AlreadyUptodate,
    Updating,
    Uptodate,
}

impl std::fmt::Display for UpdaterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UpdaterState::Idle => "Idle",
            UpdaterState::DownloadingInformations => "DownloadingInformations",
            UpdaterState::UpdateRequired => "UpdateRequired",
            UpdaterState::AlreadyUptodate => "AlreadyUptodate",
            UpdaterState::Updating => "Updating",
            UpdaterState::Uptodate => "Uptodate",
        };
        f.write_str(name)
    }
}

/// How the repair pass resolved one failed path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    Fixed,
    NonRecoverable,
}

/// Configuration for one update client. Everything is explicit; nothing is
/// read from process-global state.
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// Repository location: `http(s)://` URL or a local directory path.
    pub repository: String,
    /// The managed install directory.
    pub local_dir: PathBuf,
    /// Staging directory for downloaded data regions. Must live on the same
    /// filesystem as `local_dir` for atomic renames; defaults to
    /// `<local_dir>/update_tmp`.
    pub tmp_dir: Option<PathBuf>,
    pub skip_threshold: u64,
    pub codec: CodecConfig,
}

impl UpdaterConfig {
    pub fn new(repository: impl Into<String>, local_dir: impl Into<PathBuf>) -> Self {
        Self {
            repository: repository.into(),
            local_dir: local_dir.into(),
            tmp_dir: None,
            skip_threshold: DEFAULT_SKIP_THRESHOLD,
            codec: CodecConfig::default(),
        }
    }
}

/// The client-side update engine: resolves the cheapest package chain to
/// the repository's current revision, drives it through the download/apply
/// pipeline, then repairs whatever failed from a complete install.
pub struct Updater {
    source: Source,
    local_dir: PathBuf,
    tmp_dir: PathBuf,
    codec: Codec,
    skip_threshold: u64,
    state: UpdaterState,
    cancel: CancelToken,
    events: EventSink,

    local_state: LocalState,
    packages: Vec<Package>,
    versions: Vec<Revision>,
    target: Option<Revision>,
    metadata_cache: HashMap<String, Arc<PackageMetadata>>,
}

impl Updater {
    pub fn new(config: UpdaterConfig) -> Result<Self> {
        let source = Source::from_location(&config.repository)?;
        let tmp_dir = config
            .tmp_dir
            .unwrap_or_else(|| config.local_dir.join("update_tmp"));
        Ok(Self {
            source,
            local_dir: config.local_dir,
            tmp_dir,
            codec: Codec::new(config.codec),
            skip_threshold: config.skip_threshold,
            state: UpdaterState::Idle,
            cancel: CancelToken::new(),
            events: EventSink::default(),
            local_state: LocalState::default(),
            packages: Vec::new(),
            versions: Vec::new(),
            target: None,
            metadata_cache: HashMap::new(),
        })
    }

    pub fn state(&self) -> UpdaterState {
        self.state
    }

    pub fn local_revision(&self) -> &str {
        &self.local_state.revision
    }

    pub fn target_revision(&self) -> Option<&Revision> {
        self.target.as_ref()
    }

    /// Revisions the repository knows about, in index order.
    pub fn available_versions(&self) -> &[Revision] {
        &self.versions
    }

    /// Token for cancelling this updater from another task. Checked at
    /// package boundaries and before network requests.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Attach an event receiver. Progress and per-operation events flow
    /// through the returned channel for the lifetime of this updater.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<UpdateEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = EventSink::new(tx);
        rx
    }

    /// Fetch the repository indices and decide whether the local tree is
    /// behind the repository's current revision.
    pub async fn check_for_updates(&mut self) -> Result<UpdaterState> {
        if matches!(
            self.state,
            UpdaterState::Updating | UpdaterState::DownloadingInformations
        ) {
            warn!(state = %self.state, "check_for_updates rejected, updater busy");
            return Ok(self.state);
        }
        self.state = UpdaterState::DownloadingInformations;

        let result = self.fetch_informations().await;
        match result {
            Ok(state) => {
                self.state = state;
                Ok(state)
            }
            Err(e) => {
                self.state = UpdaterState::Idle;
                Err(e)
            }
        }
    }

    async fn fetch_informations(&mut self) -> Result<UpdaterState> {
        self.local_state = LocalState::load(&self.local_dir)?;
        if self.local_state.update_in_progress {
            warn!("previous update was interrupted; resuming from partial state");
        }

        let current = self.source.fetch(CURRENT_RESOURCE, None).await?;
        let mut current = revision::parse_current(&current)?;
        let packages = self.source.fetch(PACKAGES_RESOURCE, None).await?;
        self.packages = revision::parse_packages(&packages)?;
        let versions = self.source.fetch(VERSIONS_RESOURCE, None).await?;
        self.versions = revision::parse_versions(&versions)?;

        if current.description.is_empty() {
            if let Some(known) = self.versions.iter().find(|v| v.id == current.id) {
                current.description = known.description.clone();
            }
        }

        info!(
            local = %self.local_state.revision,
            current = %current.id,
            packages = self.packages.len(),
            "repository informations loaded"
        );

        let state = if self.local_state.revision == current.id {
            UpdaterState::AlreadyUptodate
        } else {
            UpdaterState::UpdateRequired
        };
        self.target = Some(current);
        Ok(state)
    }

    /// Run the update to the repository's current revision. Terminal result
    /// is `Uptodate`, or an error carrying the unresolved paths.
    pub async fn update(&mut self) -> Result<UpdaterState> {
        match self.state {
            UpdaterState::Idle => {
                if self.check_for_updates().await? != UpdaterState::UpdateRequired {
                    return Ok(self.state);
                }
            }
            UpdaterState::UpdateRequired => {}
            UpdaterState::AlreadyUptodate | UpdaterState::Uptodate => {
                info!(state = %self.state, "nothing to update");
                return Ok(self.state);
            }
            UpdaterState::Updating | UpdaterState::DownloadingInformations => {
                warn!(state = %self.state, "update rejected, updater busy");
                return Ok(self.state);
            }
        }

        self.state = UpdaterState::Updating;
        match self.run_update().await {
            Ok(()) => {
                self.state = UpdaterState::Uptodate;
                Ok(self.state)
            }
            Err(e) => {
                self.state = UpdaterState::Idle;
                Err(e)
            }
        }
    }

    async fn run_update(&mut self) -> Result<()> {
        let target = self
            .target
            .clone()
            .expect("target revision set by check_for_updates");

        let chain = graph::find_path(&self.packages, &self.local_state.revision, &target.id);
        if chain.is_empty() {
            return Err(Error::NoPath {
                from: self.local_state.revision.clone(),
                to: target.id.clone(),
            });
        }
        info!(
            target = %target.id,
            hops = chain.len(),
            bytes = chain_size(&chain),
            "package chain resolved"
        );

        std::fs::create_dir_all(&self.local_dir)
            .map_err(|e| Error::io(self.local_dir.display().to_string(), e))?;
        std::fs::create_dir_all(&self.tmp_dir)
            .map_err(|e| Error::io(self.tmp_dir.display().to_string(), e))?;

        // From here on the tree may be mutated; make the crash window
        // externally detectable.
        self.local_state.update_in_progress = true;
        self.local_state.save(&self.local_dir)?;

        let mut counters = ProgressCounters::new(chain_size(&chain));
        let mut ledger: Vec<FailedOperation> = Vec::new();

        for package in &chain {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let meta = self.metadata(package).await?;
            let ops = meta.bind(&self.local_dir, &self.tmp_dir);
            let ctx = PipelineCtx {
                source: &self.source,
                codec: &self.codec,
                events: &self.events,
                cancel: &self.cancel,
                skip_threshold: self.skip_threshold,
            };
            pipeline::run_package(
                &ctx,
                meta.data_resource(),
                meta.package.name(),
                ops,
                &mut counters,
                &mut ledger,
            )
            .await?;
        }

        if !ledger.is_empty() {
            warn!(failures = ledger.len(), "entering repair pass");
            let unresolved = self.repair(&ledger, &target.id).await?;
            if !unresolved.is_empty() {
                return Err(Error::UpdateFailed { paths: unresolved });
            }
        }

        self.finalize(&chain, &target)?;
        Ok(())
    }

    /// Load package metadata, going through the per-run cache. A missing
    /// `patch*` metadata resource falls back to the corresponding complete
    /// install.
    async fn metadata(&mut self, package: &Package) -> Result<Arc<PackageMetadata>> {
        let name = package.name();
        if let Some(meta) = self.metadata_cache.get(&name) {
            debug!(package = %name, "metadata cache hit");
            return Ok(meta.clone());
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let meta = match self.source.fetch(&package.metadata_resource(), None).await {
            Ok(bytes) => PackageMetadata::from_json(&bytes)?,
            Err(e) if e.is_not_found() && !package.is_complete() => {
                let fallback = format!("complete_{}.metadata", package.to);
                warn!(missing = %package.metadata_resource(), fallback = %fallback, "patch metadata missing, falling back to complete install");
                let bytes = self.source.fetch(&fallback, None).await?;
                PackageMetadata::from_json(&bytes)?
            }
            Err(e) => return Err(e),
        };

        let meta = Arc::new(meta);
        self.metadata_cache.insert(name, meta.clone());
        Ok(meta)
    }

    /// Second-chance pass: rebuild each failed path in isolation from a
    /// complete-install chain to the target revision.
    async fn repair(&mut self, ledger: &[FailedOperation], target: &str) -> Result<Vec<String>> {
        let chain = graph::find_path(&self.packages, "", target);
        if chain.is_empty() {
            warn!("no complete-install chain available for repair");
            return Ok(dedup_paths(ledger));
        }

        let mut metas = Vec::with_capacity(chain.len());
        for package in &chain {
            metas.push(self.metadata(package).await?);
        }

        let mut unresolved = Vec::new();
        for path in dedup_paths(ledger) {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let outcome = self.repair_path(&metas, &path).await?;
            match outcome {
                RepairOutcome::Fixed => {
                    info!(path = %path, "repaired from complete install");
                    self.events.operation(&path, EventKind::Fixed, "rebuilt from complete install");
                }
                RepairOutcome::NonRecoverable => {
                    warn!(path = %path, "repair failed");
                    self.events
                        .operation(&path, EventKind::NonRecoverable, "could not be rebuilt");
                    unresolved.push(path);
                }
            }
        }
        Ok(unresolved)
    }

    /// Repair one path: walk its operations through the complete chain in
    /// order (a rebuild from `complete_*` plus any patches layered on top),
    /// fetching each needed byte range in isolation.
    async fn repair_path(
        &self,
        metas: &[Arc<PackageMetadata>],
        path: &str,
    ) -> Result<RepairOutcome> {
        let mut found = false;
        for meta in metas {
            let Some((index, op)) = meta.find_operation_for(path) else {
                continue;
            };
            found = true;

            let bound = BoundOperation {
                index,
                op: op.clone(),
                target: self.local_dir.join(path),
                staging: self.tmp_dir.join(format!("Repair{index}")),
            };

            match bound.prepare().status {
                OpStatus::Valid => continue,
                OpStatus::LocalFileInvalid => return Ok(RepairOutcome::NonRecoverable),
                OpStatus::DownloadRequired => {
                    let region = bound.op.data_region().expect("download implies data");
                    let bytes = self
                        .source
                        .fetch(
                            &meta.data_resource(),
                            Some(ByteRange::exact(region.offset, region.size)),
                        )
                        .await?;
                    if let Err(e) = std::fs::write(&bound.staging, bytes) {
                        warn!(path = %path, error = %e, "failed to stage repair data");
                        return Ok(RepairOutcome::NonRecoverable);
                    }
                }
                OpStatus::ApplyRequired | OpStatus::Unknown | OpStatus::ApplyFailed => {}
            }

            let codec = self.codec.clone();
            let outcome = tokio::task::spawn_blocking(move || bound.apply(&codec))
                .await
                .map_err(|e| Error::Worker(e.to_string()))?;
            if outcome.status != OpStatus::Valid {
                warn!(path = %path, error = ?outcome.error, "repair apply failed");
                return Ok(RepairOutcome::NonRecoverable);
            }
        }

        if !found {
            // Not part of the complete tree: the path should not exist at
            // all. Removing it is the repair.
            let target = self.local_dir.join(path);
            return match std::fs::remove_file(&target) {
                Ok(()) => Ok(RepairOutcome::Fixed),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RepairOutcome::Fixed),
                Err(_) => Ok(RepairOutcome::NonRecoverable),
            };
        }
        Ok(RepairOutcome::Fixed)
    }

    /// Rewrite the durable state for the new revision and drop everything
    /// the new manifest no longer contains.
    fn finalize(&mut self, chain: &[Package], target: &Revision) -> Result<()> {
        // The final package enumerates the whole target tree; intermediate
        // packages' effects are superseded by it.
        let last = chain.last().expect("chain is non-empty");
        let meta = self
            .metadata_cache
            .get(&last.name())
            .expect("metadata cached during chain traversal")
            .clone();

        let mut file_list = BTreeSet::new();
        let mut dir_list = BTreeSet::new();
        for op in meta.operations() {
            match op {
                Operation::Add { path, .. } | Operation::Patch { path, .. } => {
                    file_list.insert(path.clone());
                }
                Operation::MkDir { path } => {
                    dir_list.insert(path.clone());
                }
                Operation::Rm { path, .. } => {
                    file_list.remove(path);
                }
                Operation::RmDir { path } => {
                    dir_list.remove(path);
                }
            }
        }

        self.remove_unmanaged(&file_list, &dir_list);

        let _ = std::fs::remove_dir_all(&self.tmp_dir);

        self.local_state = LocalState {
            revision: target.id.clone(),
            update_in_progress: false,
            file_list,
            dir_list,
        };
        self.local_state.save(&self.local_dir)?;
        info!(revision = %target.id, "local repository up to date");
        Ok(())
    }

    /// Delete local files and directories absent from the new manifest.
    /// Directories are best-effort; a non-empty directory is left alone.
    fn remove_unmanaged(&self, file_list: &BTreeSet<String>, dir_list: &BTreeSet<String>) {
        let entries = match crate::fsutil::walk_directory(&self.local_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "could not scan local tree for unmanaged entries");
                return;
            }
        };

        let tmp_prefix = self
            .tmp_dir
            .strip_prefix(&self.local_dir)
            .ok()
            .and_then(|p| p.to_str())
            .map(|p| p.replace('\\', "/"));

        let mut stale_dirs = Vec::new();
        for entry in entries {
            let rel = &entry.relative_path;
            if rel == STATUS_FILE {
                continue;
            }
            if let Some(tmp) = &tmp_prefix {
                if rel == tmp || rel.starts_with(&format!("{tmp}/")) {
                    continue;
                }
            }
            match entry.kind {
                crate::fsutil::EntryKind::File => {
                    if !file_list.contains(rel) {
                        debug!(path = %rel, "removing unmanaged file");
                        let _ = std::fs::remove_file(&entry.full_path);
                    }
                }
                crate::fsutil::EntryKind::Dir => {
                    if !dir_list.contains(rel) {
                        stale_dirs.push(entry.full_path.clone());
                    }
                }
            }
        }
        // Children before parents; non-empty failures are ignored.
        stale_dirs.sort();
        for dir in stale_dirs.into_iter().rev() {
            let _ = std::fs::remove_dir(&dir);
        }
    }
}

fn dedup_paths(ledger: &[FailedOperation]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    ledger
        .iter()
        .filter(|f| seen.insert(f.path.clone()))
        .map(|f| f.path.clone())
        .collect()
}
