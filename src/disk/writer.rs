// Per-destination writer with deferred writes to the start of the device.
//
// Writes landing in the first `deferred_region` bytes are held back and only
// issued, newest first, once everything else has been written. A destination
// that dies mid-write therefore never carries a valid partition table in front
// of an incomplete body.

use super::{BoxedDevice, RetryPolicy};
use crate::error::FlashError;
use crate::models::{CancelToken, DestinationId};
use crate::pipeline::Chunk;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Bytes that reached a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoProgress {
    pub id: DestinationId,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub bytes_written: u64,
    pub deferred_bytes: u64,
}

pub struct DestinationWriter {
    device_path: String,
    device: BoxedDevice,
    retry: RetryPolicy,
    deferred_region: u64,
    first_blocks: Vec<(u64, Bytes)>,
    // Offset of the next unpositioned chunk
    position: u64,
    stats: WriteStats,
}

impl DestinationWriter {
    pub fn new(
        device_path: impl Into<String>,
        device: BoxedDevice,
        retry: RetryPolicy,
        deferred_region: u64,
    ) -> Self {
        Self {
            device_path: device_path.into(),
            device,
            retry,
            deferred_region,
            first_blocks: Vec::new(),
            position: 0,
            stats: WriteStats::default(),
        }
    }

    /// Write a chunk, or hold it back if it starts inside the deferred region
    ///
    /// Returns the number of bytes that actually reached the device.
    pub fn write(&mut self, chunk: Chunk) -> Result<u64, FlashError> {
        let offset = chunk.position.unwrap_or(self.position);
        let len = chunk.data.len() as u64;
        self.position = offset + len;

        if offset < self.deferred_region {
            debug!("Deferring {} bytes at {} on {}", len, offset, self.device_path);
            self.stats.deferred_bytes += len;
            self.first_blocks.push((offset, chunk.data));
            return Ok(0);
        }

        self.write_now(&chunk.data, offset)?;
        Ok(len)
    }

    fn write_now(&mut self, data: &[u8], offset: u64) -> Result<(), FlashError> {
        let device = &mut self.device;
        self.retry
            .run(&self.device_path, || device.write_at(data, offset))?;
        self.stats.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Issue the deferred writes and sync
    ///
    /// Returns the number of bytes written by the deferred flush.
    pub fn finish(&mut self) -> Result<u64, FlashError> {
        let mut flushed = 0;
        while let Some((offset, data)) = self.first_blocks.pop() {
            self.write_now(&data, offset)?;
            flushed += data.len() as u64;
        }
        self.sync()?;
        info!(
            "Finished writing {} bytes to {}",
            self.stats.bytes_written, self.device_path
        );
        Ok(flushed)
    }

    /// Drop the deferred writes without issuing them
    pub fn abort(&mut self) {
        if !self.first_blocks.is_empty() {
            info!(
                "Discarding {} deferred writes on {}",
                self.first_blocks.len(),
                self.device_path
            );
            self.first_blocks.clear();
        }
        if let Err(e) = self.sync() {
            warn!("Sync after abort failed on {}: {}", self.device_path, e);
        }
    }

    fn sync(&mut self) -> Result<(), FlashError> {
        let device = &mut self.device;
        self.retry.run(&self.device_path, || device.sync())
    }

    pub fn stats(&self) -> WriteStats {
        self.stats
    }

    pub fn into_device(self) -> BoxedDevice {
        self.device
    }
}

/// What a writer task hands back when its queue closes
pub struct WriterOutcome {
    pub id: DestinationId,
    pub device: BoxedDevice,
    pub result: Result<WriteStats, FlashError>,
}

/// Run a writer on a blocking thread, fed through a bounded queue
///
/// Dropping the returned sender ends the stream. If `halt` has been cancelled
/// by then, the chunk in progress completes, anything still queued is
/// discarded and the deferred writes are never issued.
pub fn spawn_writer(
    id: DestinationId,
    mut writer: DestinationWriter,
    io_tx: mpsc::UnboundedSender<IoProgress>,
    halt: CancelToken,
    depth: usize,
) -> (mpsc::Sender<Chunk>, JoinHandle<WriterOutcome>) {
    let (tx, mut rx) = mpsc::channel::<Chunk>(depth.max(1));

    let handle = tokio::task::spawn_blocking(move || {
        let streamed = loop {
            let Some(chunk) = rx.blocking_recv() else {
                break Ok(());
            };
            if halt.is_cancelled() {
                break Err(FlashError::Cancelled);
            }
            match writer.write(chunk) {
                Ok(0) => {}
                Ok(bytes) => {
                    io_tx.send(IoProgress { id, bytes }).ok();
                }
                Err(e) => break Err(e),
            }
        };
        // Release the fan-out before the slow part
        drop(rx);

        let result = match streamed {
            Ok(()) if !halt.is_cancelled() => writer.finish().map(|flushed| {
                if flushed > 0 {
                    io_tx.send(IoProgress { id, bytes: flushed }).ok();
                }
                writer.stats()
            }),
            Ok(()) | Err(FlashError::Cancelled) => {
                writer.abort();
                Err(FlashError::Cancelled)
            }
            Err(e) => {
                writer.abort();
                Err(e)
            }
        };

        WriterOutcome {
            id,
            device: writer.into_device(),
            result,
        }
    });

    (tx, handle)
}
