use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the repository and updater APIs.
///
/// Per-operation failures (hash mismatches, rename failures) are *not*
/// represented here: they are collected in the update ledger and only become
/// an `UpdateFailed` once the repair pass has been exhausted.
#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected HTTP status {status} for {resource}")]
    UnexpectedStatus { resource: String, status: u16 },

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("malformed range response for {resource}: expected {expected} bytes, got {actual}")]
    ShortRead {
        resource: String,
        expected: u64,
        actual: u64,
    },

    #[error("invalid JSON in {resource}: {source}")]
    Json {
        resource: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported format version {found:?} in {resource} (expected {expected:?})")]
    UnsupportedVersion {
        resource: String,
        found: String,
        expected: String,
    },

    #[error("invalid package metadata: {0}")]
    Metadata(String),

    #[error("invalid package name: {0}")]
    PackageName(String),

    #[error("no package path from revision {from:?} to revision {to:?}")]
    NoPath { from: String, to: String },

    #[error("update already running (state {0})")]
    NotIdle(String),

    #[error("update cancelled")]
    Cancelled,

    #[error("worker failed: {0}")]
    Worker(String),

    #[error("update failed; unresolved paths: {}", paths.join(", "))]
    UpdateFailed { paths: Vec<String> },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// True for errors produced by a missing remote resource, used to drive
    /// the patch-metadata -> complete-metadata fallback.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::UnexpectedStatus { status: 404..=410, .. }
        )
    }
}
