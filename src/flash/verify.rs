// Reads a destination back through a verify pipeline on a blocking thread

use crate::disk::writer::IoProgress;
use crate::disk::{BoxedDevice, DestinationReader};
use crate::error::FlashError;
use crate::models::{CancelToken, DestinationId};
use crate::pipeline::Pipeline;
use crate::pipeline::checksum::ChecksumSet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct VerifyJob {
    pub id: DestinationId,
    pub reader: DestinationReader,
    pub pipeline: Pipeline,
    /// `(offset, length)` spans to read, in ascending order
    pub extents: Vec<(u64, u64)>,
}

pub struct VerifyOutcome {
    pub id: DestinationId,
    pub device: BoxedDevice,
    pub result: Result<ChecksumSet, FlashError>,
}

impl VerifyJob {
    fn run(
        &mut self,
        io_tx: &mpsc::UnboundedSender<IoProgress>,
        halt: &CancelToken,
    ) -> Result<ChecksumSet, FlashError> {
        let id = self.id;
        for &(offset, length) in &self.extents {
            let pipeline = &mut self.pipeline;
            self.reader.read_range(offset, length, |chunk| {
                if halt.is_cancelled() {
                    return Err(FlashError::Cancelled);
                }
                io_tx
                    .send(IoProgress {
                        id,
                        bytes: chunk.len() as u64,
                    })
                    .ok();
                pipeline.push(chunk).map(|_| ())
            })?;
        }
        let output = self.pipeline.finish()?;
        Ok(output.checksum.unwrap_or_default())
    }
}

/// Run a verify job; it stops at the next chunk once `halt` is cancelled
pub fn spawn_verify(
    mut job: VerifyJob,
    io_tx: mpsc::UnboundedSender<IoProgress>,
    halt: CancelToken,
) -> JoinHandle<VerifyOutcome> {
    tokio::task::spawn_blocking(move || {
        debug!("Verifying destination {} over {} extents", job.id, job.extents.len());
        let result = job.run(&io_tx, &halt);
        VerifyOutcome {
            id: job.id,
            device: job.reader.into_device(),
            result,
        }
    })
}
