// Re-chunks an arbitrary byte stream into block-aligned writes

use super::{Chunk, Stage};
use crate::error::FlashError;
use bytes::BytesMut;

pub struct BlockAligner {
    block_size: usize,
    chunk_size: usize,
    buffer: BytesMut,
    // Destination offset of the next emitted chunk
    position: u64,
}

impl BlockAligner {
    /// `chunk_size` is the amount of buffered data that triggers a flush
    pub fn new(block_size: usize, chunk_size: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            chunk_size: chunk_size.max(block_size),
            buffer: BytesMut::with_capacity(chunk_size.max(block_size)),
            position: 0,
        }
    }

    fn emit(&mut self, data: bytes::Bytes, out: &mut Vec<Chunk>) {
        let len = data.len() as u64;
        out.push(Chunk::at(data, self.position));
        self.position += len;
    }
}

impl Stage for BlockAligner {
    fn name(&self) -> &'static str {
        "block-aligner"
    }

    fn transform(&mut self, chunk: Chunk, out: &mut Vec<Chunk>) -> Result<(), FlashError> {
        if chunk.is_empty() {
            return Ok(());
        }

        // Already aligned and large enough, forward as-is
        if self.buffer.is_empty()
            && chunk.len() >= self.chunk_size
            && chunk.len() % self.block_size == 0
        {
            self.emit(chunk.data, out);
            return Ok(());
        }

        self.buffer.extend_from_slice(&chunk.data);
        if self.buffer.len() >= self.chunk_size {
            let aligned = self.buffer.len() - self.buffer.len() % self.block_size;
            let data = self.buffer.split_to(aligned).freeze();
            self.emit(data, out);
        }
        Ok(())
    }

    fn flush(&mut self, out: &mut Vec<Chunk>) -> Result<(), FlashError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let padded = self.buffer.len().div_ceil(self.block_size) * self.block_size;
        self.buffer.resize(padded, 0);
        let data = self.buffer.split().freeze();
        self.emit(data, out);
        Ok(())
    }
}
