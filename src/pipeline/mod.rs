// Byte pipeline: an ordered list of stages that chunks flow through.
//
// Stages are synchronous transforms. The orchestrator pushes each source chunk
// through the whole list and hands the output to the fan-out, so an error in
// any stage surfaces at the pipeline level as the `Err` of `push` or `finish`.

pub mod block_aligner;
pub mod block_map;
pub mod checksum;
pub mod fanout;
pub mod progress;
pub mod sparse;

use crate::error::FlashError;
use bytes::Bytes;
use checksum::ChecksumSet;
use tokio::sync::mpsc;

/// A piece of the byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Bytes,
    /// Absolute destination offset, once a positioning stage has assigned one
    pub position: Option<u64>,
}

impl Chunk {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            position: None,
        }
    }

    pub fn at(data: Bytes, position: u64) -> Self {
        Self {
            data,
            position: Some(position),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

pub trait Stage: Send {
    fn name(&self) -> &'static str;

    /// Consume one chunk, appending zero or more chunks to `out`
    fn transform(&mut self, chunk: Chunk, out: &mut Vec<Chunk>) -> Result<(), FlashError>;

    /// Called once at end of stream
    fn flush(&mut self, _out: &mut Vec<Chunk>) -> Result<(), FlashError> {
        Ok(())
    }

    /// Digests produced by this stage, available after `flush`
    fn take_checksum(&mut self) -> Option<ChecksumSet> {
        None
    }
}

/// What is left once the pipeline has been flushed
#[derive(Debug, Default)]
pub struct PipelineOutput {
    pub chunks: Vec<Chunk>,
    /// Merged digests of every checksum-producing stage, if any were bound
    pub checksum: Option<ChecksumSet>,
}

#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, stage: impl Stage + 'static) -> &mut Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn append_boxed(&mut self, stage: Box<dyn Stage>) -> &mut Self {
        self.stages.push(stage);
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run one chunk through every stage
    pub fn push(&mut self, chunk: Chunk) -> Result<Vec<Chunk>, FlashError> {
        let mut chunks = vec![chunk];
        for stage in &mut self.stages {
            let mut out = Vec::with_capacity(chunks.len());
            for chunk in chunks {
                stage.transform(chunk, &mut out)?;
            }
            chunks = out;
        }
        Ok(chunks)
    }

    /// Flush the stages front to back, feeding each flush through the rest
    pub fn finish(&mut self) -> Result<PipelineOutput, FlashError> {
        let mut pending: Vec<Chunk> = Vec::new();
        for stage in &mut self.stages {
            let mut out = Vec::with_capacity(pending.len());
            for chunk in pending {
                stage.transform(chunk, &mut out)?;
            }
            stage.flush(&mut out)?;
            pending = out;
        }

        let mut checksum: Option<ChecksumSet> = None;
        for stage in &mut self.stages {
            if let Some(set) = stage.take_checksum() {
                checksum.get_or_insert_with(ChecksumSet::default).merge(set);
            }
        }

        Ok(PipelineOutput {
            chunks: pending,
            checksum,
        })
    }
}

/// Pass-through stage reporting how many bytes went by
pub struct ProgressStage {
    tx: mpsc::UnboundedSender<u64>,
}

impl ProgressStage {
    pub fn new(tx: mpsc::UnboundedSender<u64>) -> Self {
        Self { tx }
    }
}

impl Stage for ProgressStage {
    fn name(&self) -> &'static str {
        "progress"
    }

    fn transform(&mut self, chunk: Chunk, out: &mut Vec<Chunk>) -> Result<(), FlashError> {
        if !chunk.is_empty() {
            // The receiver may already be gone while the run is winding down
            self.tx.send(chunk.len() as u64).ok();
        }
        out.push(chunk);
        Ok(())
    }
}
