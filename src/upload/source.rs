//! Re-openable upload sources.
//!
//! The object-storage SDK gives no seekable-body guarantee, and both the
//! sign-challenge and retry-with-rewind need to re-read arbitrary ranges of
//! the source. [`SourceFactory`] is the capability that makes that
//! possible; [`BufferedSource`] adapts a one-shot stream by teeing it into
//! memory, spilling to a temp file past the configured threshold.

use std::io::SeekFrom;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use super::UploadError;

/// A source the upload machine can open any number of times, at any
/// offset.
#[async_trait]
pub trait SourceFactory: Send + Sync {
    /// Content size in bytes; `-1` when unknown.
    fn size(&self) -> i64;

    /// Opens a reader positioned at `offset`.
    async fn open(
        &self,
        offset: u64,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, UploadError>;
}

enum Backing {
    Memory(Bytes),
    Spilled(Arc<tempfile::NamedTempFile>),
}

/// A fully buffered source: a one-shot stream drained into memory or a
/// temp file, after which it is freely re-openable.
pub struct BufferedSource {
    backing: Backing,
    len: u64,
}

impl std::fmt::Debug for BufferedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.backing {
            Backing::Memory(_) => "memory",
            Backing::Spilled(_) => "spilled",
        };
        f.debug_struct("BufferedSource")
            .field("backing", &kind)
            .field("len", &self.len)
            .finish()
    }
}

impl BufferedSource {
    /// Drains `reader` completely. Content up to `memory_threshold` bytes
    /// stays in memory; anything larger spills to a temp file that lives
    /// as long as the source.
    ///
    /// # Errors
    ///
    /// [`UploadError::Io`] on read or spill failures.
    pub async fn buffer<R>(mut reader: R, memory_threshold: u64) -> Result<Self, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut memory: Vec<u8> = Vec::new();
        let mut spill: Option<(Arc<tempfile::NamedTempFile>, tokio::fs::File)> = None;
        let mut total = 0u64;
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let n = reader.read(&mut buf).await.map_err(UploadError::io)?;
            if n == 0 {
                break;
            }
            total += n as u64;

            if let Some((_, file)) = spill.as_mut() {
                file.write_all(&buf[..n]).await.map_err(UploadError::io)?;
                continue;
            }

            memory.extend_from_slice(&buf[..n]);
            if total > memory_threshold {
                // Threshold crossed: move what we have to disk and keep
                // streaming there.
                let named = tempfile::NamedTempFile::new().map_err(UploadError::io)?;
                let mut file = tokio::fs::File::create(named.path())
                    .await
                    .map_err(UploadError::io)?;
                file.write_all(&memory).await.map_err(UploadError::io)?;
                memory = Vec::new();
                debug!(total, "upload buffer spilled to temp file");
                spill = Some((Arc::new(named), file));
            }
        }

        let backing = match spill {
            Some((named, mut file)) => {
                file.flush().await.map_err(UploadError::io)?;
                drop(file);
                Backing::Spilled(named)
            }
            None => Backing::Memory(Bytes::from(memory)),
        };
        Ok(Self {
            backing,
            len: total,
        })
    }

    /// Wraps already-materialized bytes.
    #[must_use]
    pub fn from_bytes(bytes: Bytes) -> Self {
        let len = bytes.len() as u64;
        Self {
            backing: Backing::Memory(bytes),
            len,
        }
    }

    /// Buffered length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the buffered content is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[async_trait]
impl SourceFactory for BufferedSource {
    fn size(&self) -> i64 {
        self.len as i64
    }

    async fn open(
        &self,
        offset: u64,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, UploadError> {
        match &self.backing {
            Backing::Memory(bytes) => {
                let start = (offset as usize).min(bytes.len());
                Ok(Box::new(std::io::Cursor::new(bytes.slice(start..))))
            }
            Backing::Spilled(named) => {
                let mut file = tokio::fs::File::open(named.path())
                    .await
                    .map_err(UploadError::io)?;
                file.seek(SeekFrom::Start(offset))
                    .await
                    .map_err(UploadError::io)?;
                Ok(Box::new(file))
            }
        }
    }
}

/// Reads exactly `len` bytes from `offset` of `source`.
///
/// # Errors
///
/// [`UploadError::Protocol`] when the source ends early, plus open/read
/// failures.
pub async fn read_range(
    source: &dyn SourceFactory,
    offset: u64,
    len: u64,
) -> Result<Vec<u8>, UploadError> {
    let mut reader = source.open(offset).await?;
    let mut out = vec![0u8; len as usize];
    let mut filled = 0usize;
    while filled < out.len() {
        let n = reader
            .read(&mut out[filled..])
            .await
            .map_err(UploadError::io)?;
        if n == 0 {
            return Err(UploadError::Protocol {
                message: format!(
                    "source ended at {} bytes while reading [{offset}, {})",
                    filled as u64 + offset,
                    offset + len
                ),
            });
        }
        filled += n;
    }
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn small_source_stays_in_memory() {
        let source = BufferedSource::buffer(&b"hello world"[..], 1024).await.unwrap();
        assert_eq!(source.size(), 11);
        assert!(matches!(source.backing, Backing::Memory(_)));

        let mut reader = source.open(6).await.unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "world");
    }

    #[tokio::test]
    async fn large_source_spills_to_disk() {
        let content = vec![7u8; 10_000];
        let source = BufferedSource::buffer(content.as_slice(), 1024).await.unwrap();
        assert_eq!(source.size(), 10_000);
        assert!(matches!(source.backing, Backing::Spilled(_)));

        let mut reader = source.open(9_990).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, vec![7u8; 10]);
    }

    #[tokio::test]
    async fn reopen_is_repeatable() {
        let source = BufferedSource::buffer(&b"0123456789"[..], 4).await.unwrap();
        for _ in 0..3 {
            let bytes = read_range(&source, 2, 5).await.unwrap();
            assert_eq!(&bytes, b"23456");
        }
    }

    #[tokio::test]
    async fn read_range_rejects_short_sources() {
        let source = BufferedSource::from_bytes(Bytes::from_static(b"abc"));
        let err = read_range(&source, 1, 10).await.unwrap_err();
        assert!(matches!(err, UploadError::Protocol { .. }));
    }

    #[tokio::test]
    async fn empty_source() {
        let source = BufferedSource::buffer(&b""[..], 1024).await.unwrap();
        assert!(source.is_empty());
        assert_eq!(source.size(), 0);
    }
}
