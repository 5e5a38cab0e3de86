use bytes::Bytes;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::events::{CancelToken, EventKind, EventSink, ProgressCounters};
use crate::operation::{ApplyOutcome, BoundOperation, OpStatus, PrepareOutcome};
use crate::source::{ByteRange, DataStream, Source};

/// Skippable spans larger than this abort the in-flight range request and
/// issue a new one at the next needed offset; smaller spans are read and
/// discarded on the open connection.
pub const DEFAULT_SKIP_THRESHOLD: u64 = 1024 * 1024;

/// One entry of the failure ledger. Collected across the whole chain and
/// handed to the repair pass; never thrown.
#[derive(Debug, Clone)]
pub struct FailedOperation {
    pub package: String,
    pub path: String,
    pub status: OpStatus,
    pub error: Option<String>,
}

/// Everything the per-package pipeline needs from the scheduler.
pub(crate) struct PipelineCtx<'a> {
    pub source: &'a Source,
    pub codec: &'a Codec,
    pub events: &'a EventSink,
    pub cancel: &'a CancelToken,
    pub skip_threshold: u64,
}

/// Routing decision for the download stage, made from the prepare status.
#[derive(Debug, Clone, Copy)]
enum Route {
    /// Stream this operation's region from the blob, then apply.
    Fetch,
    /// Data already staged; forward to apply in order, moving no bytes.
    Forward,
}

struct DownloadItem {
    index: usize,
    route: Route,
}

/// Messages delivered back to the scheduler's control loop. Workers never
/// mutate shared state; these are the only way results travel.
enum WorkerMsg {
    Prepared(usize, PrepareOutcome),
    /// Region staged successfully (bytes moved into the staging slot).
    Downloaded(usize, u64),
    /// Local staging failure (write/rename); the operation is dead for this
    /// pass but siblings continue.
    StagingFailed(usize, String),
    Applied(usize, ApplyOutcome),
    /// Transport-level failure: fatal for the whole attempt.
    Transport(Error),
}

/// Drive one package through prepare, download and apply.
///
/// The three stages run as independent workers over ordered channels:
/// prepare walks operations in index order and reports statuses; the
/// scheduler routes data-bearing operations to the download task, which
/// walks the blob monotonically (skipping or aborting over unneeded spans)
/// and feeds the single apply worker in index order. No operation reaches
/// apply before prepare assigned it a status.
pub(crate) async fn run_package(
    ctx: &PipelineCtx<'_>,
    data_resource: String,
    package_name: String,
    ops: Vec<BoundOperation>,
    counters: &mut ProgressCounters,
    ledger: &mut Vec<FailedOperation>,
) -> Result<()> {
    if ops.is_empty() {
        return Ok(());
    }
    let ops = Arc::new(ops);
    let total = ops.len();

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<WorkerMsg>();
    let (dl_tx, dl_rx) = mpsc::channel::<DownloadItem>(total);
    let (apply_tx, apply_rx) = mpsc::channel::<usize>(total);

    let prepare_handle = spawn_prepare(ops.clone(), msg_tx.clone());
    let download_handle = tokio::spawn(download_worker(
        ctx.source.clone(),
        data_resource,
        ctx.cancel.clone(),
        ctx.skip_threshold,
        ops.clone(),
        dl_rx,
        apply_tx,
        msg_tx.clone(),
    ));
    let apply_handle = spawn_apply(ops.clone(), ctx.codec.clone(), apply_rx, msg_tx.clone());
    drop(msg_tx);

    let mut remaining = total;
    let mut fatal: Option<Error> = None;

    while remaining > 0 {
        let Some(msg) = msg_rx.recv().await else {
            fatal.get_or_insert(Error::Worker(
                "pipeline worker terminated unexpectedly".to_string(),
            ));
            break;
        };
        match msg {
            WorkerMsg::Prepared(index, outcome) => {
                let op = &ops[index];
                let size = op.op.data_size();
                counters.checked += size;
                if let Some(warning) = outcome.warning {
                    ctx.events
                        .operation(op.op.path(), EventKind::Warning, warning);
                }
                match outcome.status {
                    OpStatus::DownloadRequired => {
                        let _ = dl_tx
                            .send(DownloadItem {
                                index,
                                route: Route::Fetch,
                            })
                            .await;
                    }
                    OpStatus::ApplyRequired => {
                        counters.downloaded += size;
                        let _ = dl_tx
                            .send(DownloadItem {
                                index,
                                route: Route::Forward,
                            })
                            .await;
                    }
                    OpStatus::Valid => {
                        counters.downloaded += size;
                        counters.applied += size;
                        remaining -= 1;
                    }
                    OpStatus::LocalFileInvalid => {
                        counters.downloaded += size;
                        counters.applied += size;
                        ctx.events.operation(
                            op.op.path(),
                            EventKind::Failed,
                            "local content matches neither the expected source nor the target",
                        );
                        ledger.push(FailedOperation {
                            package: package_name.clone(),
                            path: op.op.path().to_string(),
                            status: OpStatus::LocalFileInvalid,
                            error: None,
                        });
                        remaining -= 1;
                    }
                    OpStatus::Unknown | OpStatus::ApplyFailed => {
                        // prepare never yields these
                        remaining -= 1;
                    }
                }
                counters.emit(ctx.events);
            }
            WorkerMsg::Downloaded(index, bytes) => {
                debug!(index, bytes, "region staged");
                counters.downloaded += bytes;
                counters.emit(ctx.events);
            }
            WorkerMsg::StagingFailed(index, error) => {
                let op = &ops[index];
                let size = op.op.data_size();
                counters.downloaded += size;
                counters.applied += size;
                ctx.events
                    .operation(op.op.path(), EventKind::Failed, error.clone());
                ledger.push(FailedOperation {
                    package: package_name.clone(),
                    path: op.op.path().to_string(),
                    status: OpStatus::ApplyFailed,
                    error: Some(error),
                });
                remaining -= 1;
                counters.emit(ctx.events);
            }
            WorkerMsg::Applied(index, outcome) => {
                let op = &ops[index];
                counters.applied += op.op.data_size();
                if outcome.status.is_failure() {
                    let error = outcome
                        .error
                        .unwrap_or_else(|| "apply failed".to_string());
                    ctx.events
                        .operation(op.op.path(), EventKind::Failed, error.clone());
                    ledger.push(FailedOperation {
                        package: package_name.clone(),
                        path: op.op.path().to_string(),
                        status: OpStatus::ApplyFailed,
                        error: Some(error),
                    });
                } else {
                    debug!(index, path = op.op.path(), "applied");
                }
                remaining -= 1;
                counters.emit(ctx.events);
            }
            WorkerMsg::Transport(error) => {
                fatal.get_or_insert(error);
                break;
            }
        }
    }

    // Closing the routing channel unwinds the workers: the download task
    // drains out, dropping its apply sender, and the apply worker follows.
    drop(dl_tx);
    let _ = tokio::join!(prepare_handle, download_handle, apply_handle);

    match fatal {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

fn spawn_prepare(
    ops: Arc<Vec<BoundOperation>>,
    msg_tx: mpsc::UnboundedSender<WorkerMsg>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        for op in ops.iter() {
            let outcome = op.prepare();
            if msg_tx.send(WorkerMsg::Prepared(op.index, outcome)).is_err() {
                break;
            }
        }
    })
}

fn spawn_apply(
    ops: Arc<Vec<BoundOperation>>,
    codec: Codec,
    mut apply_rx: mpsc::Receiver<usize>,
    msg_tx: mpsc::UnboundedSender<WorkerMsg>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while let Some(index) = apply_rx.blocking_recv() {
            let outcome = ops[index].apply(&codec);
            if msg_tx.send(WorkerMsg::Applied(index, outcome)).is_err() {
                break;
            }
        }
    })
}

/// The download stage: walks the package blob monotonically, streaming the
/// regions of operations that need data and skipping over everything else.
#[allow(clippy::too_many_arguments)]
async fn download_worker(
    source: Source,
    data_resource: String,
    cancel: CancelToken,
    skip_threshold: u64,
    ops: Arc<Vec<BoundOperation>>,
    mut dl_rx: mpsc::Receiver<DownloadItem>,
    apply_tx: mpsc::Sender<usize>,
    msg_tx: mpsc::UnboundedSender<WorkerMsg>,
) {
    let mut cursor: Option<BlobCursor> = None;
    let mut pos: u64 = 0;

    while let Some(item) = dl_rx.recv().await {
        let op = &ops[item.index];
        match item.route {
            Route::Forward => {
                if apply_tx.send(item.index).await.is_err() {
                    return;
                }
            }
            Route::Fetch => {
                let Some(region) = op.op.data_region() else {
                    continue;
                };

                // Skip decision: the span between the stream position and
                // the next needed offset is every unneeded region since the
                // last fetch. Large spans cost less as a fresh connection;
                // small ones as discarded bytes on the open one.
                if cursor.is_some() && pos > region.offset {
                    // offsets are validated monotonic; treat regression as a
                    // forced restart
                    cursor = None;
                }
                if cursor.is_some() {
                    let gap = region.offset - pos;
                    if gap > skip_threshold {
                        debug!(gap, "aborting range request, span exceeds skip threshold");
                        cursor = None;
                    } else if gap > 0 {
                        debug!(gap, "discarding skippable span inline");
                        if let Err(e) = cursor.as_mut().unwrap().discard(gap).await {
                            let _ = msg_tx.send(WorkerMsg::Transport(e));
                            return;
                        }
                        pos = region.offset;
                    }
                }

                if cursor.is_none() {
                    if cancel.is_cancelled() {
                        let _ = msg_tx.send(WorkerMsg::Transport(Error::Cancelled));
                        return;
                    }
                    match source
                        .open(&data_resource, Some(ByteRange::from(region.offset)))
                        .await
                    {
                        Ok(stream) => {
                            cursor = Some(BlobCursor::new(stream));
                            pos = region.offset;
                        }
                        Err(e) => {
                            let _ = msg_tx.send(WorkerMsg::Transport(e));
                            return;
                        }
                    }
                }

                match stage_region(
                    cursor.as_mut().unwrap(),
                    &data_resource,
                    op,
                    region.size,
                )
                .await
                {
                    Ok(()) => {
                        pos += region.size;
                        let _ = msg_tx.send(WorkerMsg::Downloaded(item.index, region.size));
                        if apply_tx.send(item.index).await.is_err() {
                            return;
                        }
                    }
                    Err(StageError::Transport(e)) => {
                        let _ = msg_tx.send(WorkerMsg::Transport(e));
                        return;
                    }
                    Err(StageError::Local(detail)) => {
                        // The stream may have stopped mid-region; force the
                        // next fetch onto a fresh range request.
                        cursor = None;
                        warn!(path = op.op.path(), %detail, "staging failed");
                        let _ = msg_tx.send(WorkerMsg::StagingFailed(item.index, detail));
                    }
                }
            }
        }
    }
}

enum StageError {
    /// Network/short-read problems: fatal for the attempt.
    Transport(Error),
    /// Write/rename problems on the staging slot: per-operation failure.
    Local(String),
}

/// Stream exactly `size` bytes from the cursor into the operation's staging
/// slot (`<slot>.part`, then rename).
async fn stage_region(
    cursor: &mut BlobCursor,
    resource: &str,
    op: &BoundOperation,
    size: u64,
) -> std::result::Result<(), StageError> {
    let part = {
        let mut name = op.staging.as_os_str().to_os_string();
        name.push(".part");
        std::path::PathBuf::from(name)
    };

    let mut file = tokio::fs::File::create(&part)
        .await
        .map_err(|e| StageError::Local(format!("create {}: {e}", part.display())))?;

    let mut left = size;
    while left > 0 {
        let chunk = match cursor.take(left).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                return Err(StageError::Transport(Error::ShortRead {
                    resource: resource.to_string(),
                    expected: size,
                    actual: size - left,
                }));
            }
            Err(e) => return Err(StageError::Transport(e)),
        };
        left -= chunk.len() as u64;
        file.write_all(&chunk)
            .await
            .map_err(|e| StageError::Local(format!("write {}: {e}", part.display())))?;
    }
    file.flush()
        .await
        .map_err(|e| StageError::Local(format!("flush {}: {e}", part.display())))?;
    drop(file);

    tokio::fs::rename(&part, &op.staging)
        .await
        .map_err(|e| StageError::Local(format!("rename into {}: {e}", op.staging.display())))?;
    Ok(())
}

/// Chunked reader over a `DataStream` that can hand out exact byte counts
/// across chunk boundaries.
struct BlobCursor {
    stream: DataStream,
    pending: Bytes,
}

impl BlobCursor {
    fn new(stream: DataStream) -> Self {
        Self {
            stream,
            pending: Bytes::new(),
        }
    }

    /// Up to `max` bytes from the stream; `None` at end of stream.
    async fn take(&mut self, max: u64) -> Result<Option<Bytes>> {
        if self.pending.is_empty() {
            match self.stream.chunk().await? {
                Some(chunk) => self.pending = chunk,
                None => return Ok(None),
            }
        }
        let n = (max.min(self.pending.len() as u64)) as usize;
        Ok(Some(self.pending.split_to(n)))
    }

    /// Read and throw away exactly `n` bytes.
    async fn discard(&mut self, mut n: u64) -> Result<()> {
        while n > 0 {
            match self.take(n).await? {
                Some(chunk) => n -= chunk.len() as u64,
                None => {
                    return Err(Error::ShortRead {
                        resource: "blob".to_string(),
                        expected: n,
                        actual: 0,
                    });
                }
            }
        }
        Ok(())
    }
}
