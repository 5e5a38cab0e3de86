use bytes::Bytes;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use crate::error::{Error, Result};

/// Connect timeout for HTTP requests (30 seconds). Transfers themselves are
/// not bounded; large packages stream for as long as they need.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Read size for directory-backed sources.
const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Byte range of a resource: `start..start+length`, or everything from
/// `start` when `length` is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub length: Option<u64>,
}

impl ByteRange {
    pub fn from(start: u64) -> Self {
        Self {
            start,
            length: None,
        }
    }

    pub fn exact(start: u64, length: u64) -> Self {
        Self {
            start,
            length: Some(length),
        }
    }

    /// `Range` header value: `bytes=<start>-[<end>]`, end inclusive.
    fn header_value(&self) -> String {
        match self.length {
            Some(len) => format!("bytes={}-{}", self.start, self.start + len - 1),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// Where package data and repository documents come from. HTTP(S) is the
/// wire protocol; a plain directory serves the same layout for local
/// repositories and tests.
#[derive(Debug, Clone)]
pub enum Source {
    Http(HttpSource),
    Dir(DirSource),
}

#[derive(Debug, Clone)]
pub struct HttpSource {
    base: String,
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct DirSource {
    root: PathBuf,
}

impl Source {
    /// `http(s)://...` becomes an HTTP source, anything else a directory.
    pub fn from_location(location: &str) -> Result<Self> {
        if location.starts_with("http://") || location.starts_with("https://") {
            let client = reqwest::Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .build()?;
            Ok(Source::Http(HttpSource {
                base: location.trim_end_matches('/').to_string(),
                client,
            }))
        } else {
            Ok(Source::Dir(DirSource {
                root: PathBuf::from(location),
            }))
        }
    }

    pub fn dir(root: impl Into<PathBuf>) -> Self {
        Source::Dir(DirSource { root: root.into() })
    }

    /// Open a (possibly ranged) stream over a resource.
    pub async fn open(&self, resource: &str, range: Option<ByteRange>) -> Result<DataStream> {
        match self {
            Source::Http(http) => http.open(resource, range).await,
            Source::Dir(dir) => dir.open(resource, range).await,
        }
    }

    /// Fetch an entire resource (or range) into memory. Meant for index
    /// documents, metadata, and isolated repair-pass regions.
    pub async fn fetch(&self, resource: &str, range: Option<ByteRange>) -> Result<Vec<u8>> {
        let mut stream = self.open(resource, range).await?;
        let mut out = match range.and_then(|r| r.length) {
            Some(len) => Vec::with_capacity(len as usize),
            None => Vec::new(),
        };
        while let Some(chunk) = stream.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        if let Some(expected) = range.and_then(|r| r.length) {
            if out.len() as u64 != expected {
                return Err(Error::ShortRead {
                    resource: resource.to_string(),
                    expected,
                    actual: out.len() as u64,
                });
            }
        }
        Ok(out)
    }
}

impl HttpSource {
    async fn open(&self, resource: &str, range: Option<ByteRange>) -> Result<DataStream> {
        let url = format!("{}/{}", self.base, resource);
        debug!(url = %url, ?range, "GET");

        let mut request = self.client.get(&url);
        if let Some(range) = range {
            request = request.header(reqwest::header::RANGE, range.header_value());
        }
        let response = request.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(resource.to_string()));
        }
        // A ranged request must be answered with 206; a server that replies
        // 200 is streaming from offset zero and would corrupt the blob walk.
        let expected = if range.is_some() {
            reqwest::StatusCode::PARTIAL_CONTENT
        } else {
            reqwest::StatusCode::OK
        };
        if status != expected {
            return Err(Error::UnexpectedStatus {
                resource: resource.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(DataStream::Http(Box::new(response)))
    }
}

impl DirSource {
    async fn open(&self, resource: &str, range: Option<ByteRange>) -> Result<DataStream> {
        let path = self.root.join(resource);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(resource.to_string()));
            }
            Err(e) => return Err(Error::io(path.display().to_string(), e)),
        };

        let mut remaining = None;
        if let Some(range) = range {
            file.seek(SeekFrom::Start(range.start))
                .await
                .map_err(|e| Error::io(path.display().to_string(), e))?;
            remaining = range.length;
        }

        Ok(DataStream::File {
            path: path.display().to_string(),
            file,
            remaining,
        })
    }
}

/// An open byte stream over one resource. Aborting a transfer is dropping
/// the stream; restarting is opening a new one at the next needed offset.
pub enum DataStream {
    Http(Box<reqwest::Response>),
    File {
        path: String,
        file: tokio::fs::File,
        remaining: Option<u64>,
    },
}

impl DataStream {
    /// Next chunk of the stream, `None` at the end.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        match self {
            DataStream::Http(response) => Ok(response.chunk().await?),
            DataStream::File {
                path,
                file,
                remaining,
            } => {
                let want = match remaining {
                    Some(0) => return Ok(None),
                    Some(n) => (*n).min(FILE_CHUNK_SIZE as u64) as usize,
                    None => FILE_CHUNK_SIZE,
                };
                let mut buf = vec![0u8; want];
                let n = file
                    .read(&mut buf)
                    .await
                    .map_err(|e| Error::io(path.clone(), e))?;
                if n == 0 {
                    return Ok(None);
                }
                buf.truncate(n);
                if let Some(left) = remaining {
                    *left -= n as u64;
                }
                Ok(Some(Bytes::from(buf)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_header_values() {
        assert_eq!(ByteRange::from(100).header_value(), "bytes=100-");
        assert_eq!(ByteRange::exact(100, 50).header_value(), "bytes=100-149");
    }

    #[tokio::test]
    async fn test_dir_source_full_and_ranged_reads() {
        let dir = tempfile::tempdir().unwrap();
        let blob: Vec<u8> = (0u8..=255).cycle().take(200_000).collect();
        std::fs::write(dir.path().join("complete_1"), &blob).unwrap();

        let source = Source::dir(dir.path());
        let all = source.fetch("complete_1", None).await.unwrap();
        assert_eq!(all, blob);

        let mid = source
            .fetch("complete_1", Some(ByteRange::exact(1000, 5000)))
            .await
            .unwrap();
        assert_eq!(mid, &blob[1000..6000]);

        let tail = source
            .fetch("complete_1", Some(ByteRange::from(199_990)))
            .await
            .unwrap();
        assert_eq!(tail, &blob[199_990..]);
    }

    #[tokio::test]
    async fn test_dir_source_missing_resource() {
        let dir = tempfile::tempdir().unwrap();
        let source = Source::dir(dir.path());
        let err = source.fetch("patch1_2.metadata", None).await.unwrap_err();
        assert!(err.is_not_found(), "{err}");
    }

    #[tokio::test]
    async fn test_dir_source_short_range_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blob"), b"tiny").unwrap();
        let source = Source::dir(dir.path());
        let err = source
            .fetch("blob", Some(ByteRange::exact(0, 100)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShortRead { .. }));
    }
}
