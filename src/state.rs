use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::warn;

use crate::error::{Error, Result};
use crate::revision::DOC_VERSION;

pub const STATUS_FILE: &str = "status.json";

#[derive(Debug, Serialize, Deserialize)]
struct StatusFile {
    version: String,
    #[serde(rename = "Revision")]
    revision: String,
    #[serde(rename = "UpdateInProgress")]
    update_in_progress: bool,
    #[serde(rename = "FileList")]
    file_list: Vec<String>,
    #[serde(rename = "DirList")]
    dir_list: Vec<String>,
}

/// Durable record of a client tree: its revision, the managed file and
/// directory lists, and whether an update was mid-flight when the process
/// last stopped. `update_in_progress` is set and saved before the first
/// filesystem mutation of a run and cleared with the final save, so a crash
/// mid-update is externally detectable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalState {
    pub revision: String,
    pub update_in_progress: bool,
    pub file_list: BTreeSet<String>,
    pub dir_list: BTreeSet<String>,
}

impl LocalState {
    /// Load `status.json` from a client directory. A directory that has
    /// never been updated yields the default state (empty revision, empty
    /// manifest).
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(STATUS_FILE);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(Error::io(path.display().to_string(), e)),
        };
        let doc: StatusFile = serde_json::from_slice(&bytes).map_err(|source| Error::Json {
            resource: STATUS_FILE.to_string(),
            source,
        })?;
        if doc.version != DOC_VERSION {
            return Err(Error::UnsupportedVersion {
                resource: STATUS_FILE.to_string(),
                found: doc.version,
                expected: DOC_VERSION.to_string(),
            });
        }

        let dir_list: BTreeSet<String> = doc.dir_list.into_iter().collect();
        let mut file_list: BTreeSet<String> = doc.file_list.into_iter().collect();
        // The two lists are disjoint by construction; a hand-edited status
        // file loses the file entry.
        for overlap in file_list.intersection(&dir_list).cloned().collect::<Vec<_>>() {
            warn!(path = %overlap, "path listed as both file and directory, keeping directory");
            file_list.remove(&overlap);
        }

        Ok(Self {
            revision: doc.revision,
            update_in_progress: doc.update_in_progress,
            file_list,
            dir_list,
        })
    }

    /// Write `status.json` atomically (temp file + rename).
    pub fn save(&self, dir: &Path) -> Result<()> {
        let doc = StatusFile {
            version: DOC_VERSION.to_string(),
            revision: self.revision.clone(),
            update_in_progress: self.update_in_progress,
            file_list: self.file_list.iter().cloned().collect(),
            dir_list: self.dir_list.iter().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&doc).map_err(|source| Error::Json {
            resource: STATUS_FILE.to_string(),
            source,
        })?;

        let path = dir.join(STATUS_FILE);
        let tmp = dir.join(format!("{STATUS_FILE}.part"));
        std::fs::write(&tmp, bytes).map_err(|e| Error::io(tmp.display().to_string(), e))?;
        std::fs::rename(&tmp, &path).map_err(|e| Error::io(path.display().to_string(), e))?;
        Ok(())
    }
}
