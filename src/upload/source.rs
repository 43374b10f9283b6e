//! Readable byte sources for chunked uploads.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;

use crate::config::DEFAULT_BLOCK_SIZE;
use crate::error::{Error, Result};

/// Random-access content of one file being uploaded
///
/// Concurrent block workers read disjoint ranges of the same source, so
/// implementations must support reads through `&self`.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Total length in bytes
    fn len(&self) -> u64;

    /// Whether the source holds no bytes
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read exactly `len` bytes starting at `offset`
    async fn read_range(&self, offset: u64, len: u64) -> Result<Bytes>;
}

/// A file on disk, read with positional reads on one shared handle
#[derive(Clone, Debug)]
pub struct FileBlockSource {
    file: Arc<std::fs::File>,
    len: u64,
}

impl FileBlockSource {
    /// Open a file and capture its current length
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<Self> {
            let file = std::fs::File::open(&path)?;
            let len = file.metadata()?.len();
            Ok(Self {
                file: Arc::new(file),
                len,
            })
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }
}

/// Cross-platform positional file read.
///
/// Fills `buf` from `file` at the given byte `offset`, equivalent to Unix `pread`.
#[cfg(unix)]
fn read_exact_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut read = 0;
    while read < buf.len() {
        let n = file.seek_read(&mut buf[read..], offset + read as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "failed to fill whole buffer",
            ));
        }
        read += n;
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn read_exact_at(_file: &std::fs::File, _buf: &mut [u8], _offset: u64) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "positional reads are not supported on this platform",
    ))
}

#[async_trait]
impl BlockSource for FileBlockSource {
    fn len(&self) -> u64 {
        self.len
    }

    async fn read_range(&self, offset: u64, len: u64) -> Result<Bytes> {
        let file = Arc::clone(&self.file);
        let size = usize::try_from(len).map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("range of {len} bytes does not fit in memory"),
            ))
        })?;
        tokio::task::spawn_blocking(move || -> Result<Bytes> {
            let mut buf = vec![0u8; size];
            read_exact_at(&file, &mut buf, offset)?;
            Ok(Bytes::from(buf))
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }
}

/// Content already held in memory
#[derive(Clone, Debug)]
pub struct MemoryBlockSource {
    content: Bytes,
}

impl MemoryBlockSource {
    /// Wrap in-memory content
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

#[async_trait]
impl BlockSource for MemoryBlockSource {
    fn len(&self) -> u64 {
        self.content.len() as u64
    }

    async fn read_range(&self, offset: u64, len: u64) -> Result<Bytes> {
        let end = offset.checked_add(len).filter(|end| *end <= self.len());
        match end {
            Some(end) => Ok(self.content.slice(offset as usize..end as usize)),
            None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "range {offset}+{len} exceeds source of {} bytes",
                    self.len()
                ),
            ))),
        }
    }
}

/// Base64-encoded MD5 digest, the form expected in `Content-MD5` and commit hashes
pub fn md5_base64(data: &[u8]) -> String {
    STANDARD.encode(md5::compute(data).0)
}

/// Base64 MD5 of a whole source, read sequentially in 1 MiB steps
pub async fn content_hash(source: &dyn BlockSource) -> Result<String> {
    let len = source.len();
    let mut context = md5::Context::new();
    let mut offset = 0;
    while offset < len {
        let step = DEFAULT_BLOCK_SIZE.min(len - offset);
        let chunk = source.read_range(offset, step).await?;
        context.consume(&chunk);
        offset += step;
    }
    Ok(STANDARD.encode(context.compute().0))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_matches_known_digest() {
        assert_eq!(md5_base64(b"hello world"), "XrY7u+Ae7tCTyyK7j1rNww==");
        assert_eq!(md5_base64(b""), "1B2M2Y8AsgTpgAmY7PhCfg==");
    }

    #[tokio::test]
    async fn content_hash_spans_multiple_steps() {
        let data: Vec<u8> = (0..(DEFAULT_BLOCK_SIZE as usize * 2 + 17))
            .map(|i| (i % 251) as u8)
            .collect();
        let source = MemoryBlockSource::new(data.clone());

        assert_eq!(content_hash(&source).await.unwrap(), md5_base64(&data));
    }

    #[tokio::test]
    async fn memory_source_rejects_reads_past_the_end() {
        let source = MemoryBlockSource::new(&b"abcdef"[..]);
        assert_eq!(source.read_range(2, 3).await.unwrap(), Bytes::from_static(b"cde"));
        assert!(matches!(
            source.read_range(4, 3).await.unwrap_err(),
            Error::Io(_)
        ));
    }

    #[tokio::test]
    async fn file_source_reads_disjoint_ranges_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 97) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let source = FileBlockSource::open(&path).await.unwrap();
        assert_eq!(source.len(), 10_000);

        let (a, b) = tokio::join!(source.read_range(0, 5_000), source.read_range(5_000, 5_000));
        let mut joined = a.unwrap().to_vec();
        joined.extend_from_slice(&b.unwrap());
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileBlockSource::open(dir.path().join("absent.bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
