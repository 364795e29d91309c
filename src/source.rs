// The image being flashed, as handed to the engine by a source adapter

use crate::models::ImageSize;
use crate::pipeline::Stage;
use crate::pipeline::block_map::BlockMap;
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use std::io;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

pub struct SourceImage {
    pub stream: ByteStream,
    /// Applied to the raw stream before anything else, e.g. decompression
    pub transform: Option<Box<dyn Stage>>,
    pub size: ImageSize,
    pub block_map: Option<BlockMap>,
}

impl SourceImage {
    pub fn new(stream: ByteStream, size: ImageSize) -> Self {
        Self {
            stream,
            transform: None,
            size,
            block_map: None,
        }
    }

    /// A raw image file, written as-is
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open image file: {}", path.display()))?;
        let len = file
            .metadata()
            .await
            .with_context(|| format!("Failed to stat image file: {}", path.display()))?
            .len();
        debug!("Opened image {} ({} bytes)", path.display(), len);
        Ok(Self::new(Box::new(file), ImageSize::exact(len)))
    }

    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data: Bytes = data.into();
        let size = ImageSize::exact(data.len() as u64);
        Self::new(Box::new(io::Cursor::new(data)), size)
    }

    pub fn with_transform(mut self, stage: impl Stage + 'static) -> Self {
        self.transform = Some(Box::new(stage));
        self
    }

    pub fn with_block_map(mut self, map: BlockMap) -> Self {
        self.block_map = Some(map);
        self
    }
}

/// Reads a byte stream in chunks of at most `chunk_size`
pub struct ChunkReader {
    stream: ByteStream,
    chunk_size: usize,
    bytes_read: u64,
}

impl ChunkReader {
    pub fn new(stream: ByteStream, chunk_size: usize) -> Self {
        Self {
            stream,
            chunk_size: chunk_size.max(1),
            bytes_read: 0,
        }
    }

    /// The next chunk, or `None` at end of stream
    pub async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        let mut buf = BytesMut::with_capacity(self.chunk_size);
        while buf.len() < self.chunk_size {
            if self.stream.read_buf(&mut buf).await? == 0 {
                break;
            }
        }
        if buf.is_empty() {
            return Ok(None);
        }
        self.bytes_read += buf.len() as u64;
        Ok(Some(buf.freeze()))
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}
