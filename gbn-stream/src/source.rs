//! Where streamed bytes come from.
//!
//! The transport treats content as an opaque byte stream.  A [`ByteSource`]
//! resolves a name to a [`ChunkStream`]; the session pulls chunks of at most
//! `chunk_size` bytes from it and hands them to the sender.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no such stream: {0}")]
    NotFound(String),
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
    #[error("chunks must hold at least one byte")]
    ZeroChunk,
}

/// An open stream of bytes.
pub trait ChunkStream: Send {
    /// Up to `max` bytes, or `None` at the end.  Only the final chunk may be
    /// shorter than `max`.  A `max` of 0 is [`SourceError::ZeroChunk`].
    fn next_chunk(
        &mut self,
        max: usize,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, SourceError>> + Send;
}

/// Resolves stream names.
pub trait ByteSource: Send + Sync {
    type Stream: ChunkStream + 'static;

    fn open(&self, name: &str) -> impl Future<Output = Result<Self::Stream, SourceError>> + Send;
}

impl<S: ByteSource> ByteSource for Arc<S> {
    type Stream = S::Stream;

    fn open(&self, name: &str) -> impl Future<Output = Result<Self::Stream, SourceError>> + Send {
        (**self).open(name)
    }
}

// ---------------------------------------------------------------------------
// DirSource
// ---------------------------------------------------------------------------

/// Serves the regular files directly inside one directory.
#[derive(Debug, Clone)]
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }
}

/// A name that stays inside the root directory.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && !name.contains("..")
}

impl ByteSource for DirSource {
    type Stream = FileStream;

    async fn open(&self, name: &str) -> Result<FileStream, SourceError> {
        if !is_plain_name(name) {
            // Never resolves outside `root`.
            return Err(SourceError::NotFound(name.to_owned()));
        }
        let path = self.root.join(name);
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SourceError::NotFound(name.to_owned()));
            }
            Err(e) => return Err(e.into()),
        };
        if !file.metadata().await?.is_file() {
            return Err(SourceError::NotFound(name.to_owned()));
        }
        Ok(FileStream { file })
    }
}

#[derive(Debug)]
pub struct FileStream {
    file: File,
}

impl ChunkStream for FileStream {
    async fn next_chunk(&mut self, max: usize) -> Result<Option<Vec<u8>>, SourceError> {
        if max == 0 {
            return Err(SourceError::ZeroChunk);
        }
        let mut buf = vec![0u8; max];
        let mut filled = 0;
        // `read` may return short; keep going until the chunk is full or the
        // file ends.
        while filled < max {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(buf))
    }
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

/// Named byte buffers held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    streams: HashMap<String, Arc<Vec<u8>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.streams.insert(name.into(), Arc::new(bytes.into()));
    }

    pub fn with(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(name, bytes);
        self
    }
}

impl ByteSource for MemorySource {
    type Stream = MemoryStream;

    async fn open(&self, name: &str) -> Result<MemoryStream, SourceError> {
        match self.streams.get(name) {
            Some(bytes) => Ok(MemoryStream {
                bytes: Arc::clone(bytes),
                offset: 0,
            }),
            None => Err(SourceError::NotFound(name.to_owned())),
        }
    }
}

#[derive(Debug)]
pub struct MemoryStream {
    bytes: Arc<Vec<u8>>,
    offset: usize,
}

impl ChunkStream for MemoryStream {
    async fn next_chunk(&mut self, max: usize) -> Result<Option<Vec<u8>>, SourceError> {
        if max == 0 {
            return Err(SourceError::ZeroChunk);
        }
        if self.offset >= self.bytes.len() {
            return Ok(None);
        }
        let end = self.bytes.len().min(self.offset + max);
        let chunk = self.bytes[self.offset..end].to_vec();
        self.offset = end;
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect<S: ChunkStream>(mut stream: S, max: usize) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next_chunk(max).await.unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn memory_source_chunks_in_order() {
        let source = MemorySource::new().with("clip.mp4", b"abcdefghij".to_vec());
        let chunks = collect(source.open("clip.mp4").await.unwrap(), 4).await;
        assert_eq!(chunks, vec![b"abcd".to_vec(), b"efgh".to_vec(), b"ij".to_vec()]);
    }

    #[tokio::test]
    async fn memory_source_missing_name() {
        let source = MemorySource::new();
        assert!(matches!(
            source.open("missing.mp4").await,
            Err(SourceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn dir_source_reads_full_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(dir.path().join("movie.bin"), &body).unwrap();

        let source = DirSource::new(dir.path());
        let chunks = collect(source.open("movie.bin").await.unwrap(), 1392).await;
        assert_eq!(chunks.len(), 8);
        assert!(chunks[..7].iter().all(|c| c.len() == 1392));
        assert_eq!(chunks.concat(), body);
    }

    #[tokio::test]
    async fn zero_sized_chunk_is_an_error_not_end_of_stream() {
        let source = MemorySource::new().with("clip.mp4", vec![1u8; 100]);
        let mut stream = source.open("clip.mp4").await.unwrap();
        assert!(matches!(stream.next_chunk(0).await, Err(SourceError::ZeroChunk)));
        // The stream is still positioned at the start.
        assert_eq!(stream.next_chunk(100).await.unwrap().unwrap().len(), 100);

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.mp4"), vec![1u8; 100]).unwrap();
        let mut stream = DirSource::new(dir.path()).open("clip.mp4").await.unwrap();
        assert!(matches!(stream.next_chunk(0).await, Err(SourceError::ZeroChunk)));
    }

    #[tokio::test]
    async fn dir_source_empty_file_has_no_chunks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("empty"), b"").unwrap();
        let source = DirSource::new(dir.path());
        assert!(collect(source.open("empty").await.unwrap(), 64).await.is_empty());
    }

    #[tokio::test]
    async fn dir_source_rejects_escapes_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("inner"), b"x").unwrap();
        let source = DirSource::new(dir.path());

        for name in ["", "missing.mp4", "../etc/passwd", "sub/inner", "sub", "a\\b", ".."] {
            assert!(
                matches!(source.open(name).await, Err(SourceError::NotFound(_))),
                "{name:?} should not resolve"
            );
        }
    }
}
