// Flashing orchestrator
//
// A run goes through resolve -> prepare -> write -> verify -> cleanup. The
// orchestrator owns the destination set and is the only place that mutates it;
// writer and verify tasks run on blocking threads and report back through
// channels that the select loops below drain.

pub mod destination;
pub mod state;
pub mod verify;

use crate::config::EngineConfig;
use crate::disk::writer::{IoProgress, WriterOutcome, spawn_writer};
use crate::disk::{DestinationReader, DestinationWriter, DeviceHost};
use crate::error::{FlashError, PrepareStep};
use crate::models::{CancelToken, DestinationId, DeviceDescriptor, ImageSize};
use crate::pipeline::block_aligner::BlockAligner;
use crate::pipeline::block_map::BlockMap;
use crate::pipeline::checksum::{ChecksumSet, ChecksumStage};
use crate::pipeline::fanout::Fanout;
use crate::pipeline::progress::{ProgressMeter, ProgressState};
use crate::pipeline::sparse::SparseFilter;
use crate::pipeline::{Chunk, Pipeline, ProgressStage};
use crate::source::{ChunkReader, SourceImage};
use chrono::Utc;
use destination::DestinationSet;
use futures_util::StreamExt;
use futures_util::future::join_all;
use futures_util::stream::FuturesUnordered;
use state::{AggregateState, DestinationStatus, DeviceCounts, FlashEvent, FlashPhase, FlashResults};
use std::future::Future;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};
use verify::{VerifyJob, VerifyOutcome, spawn_verify};

/// What the write phase leaves behind for verification and the final report
#[derive(Debug, Default)]
struct WriteSummary {
    bytes_read: u64,
    checksum: Option<ChecksumSet>,
}

pub struct Flasher<H: DeviceHost> {
    host: H,
    config: EngineConfig,
    events: mpsc::UnboundedSender<FlashEvent>,
    cancel: CancelToken,
}

impl<H: DeviceHost> Flasher<H> {
    pub fn new(host: H, config: EngineConfig, events: mpsc::UnboundedSender<FlashEvent>) -> Self {
        Self {
            host,
            config,
            events,
            cancel: CancelToken::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Token that aborts the current run when cancelled
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn abort(&self) {
        info!("Abort requested");
        self.cancel.cancel();
    }

    fn emit(&self, event: FlashEvent) {
        // The controller may have gone away; the run still completes
        self.events.send(event).ok();
    }

    fn fail(&self, set: &mut DestinationSet, id: DestinationId, err: FlashError) {
        let device = set.device_path(id);
        warn!("Destination {} failed: {}", device, err);
        if let Some(report) = set.fail(id, err) {
            self.emit(FlashEvent::Fail {
                device,
                error: report,
            });
        }
    }

    /// Flash `source` onto every device in `paths`
    ///
    /// Per-destination failures are reported through `fail` events and in the
    /// results. An `Err` means the run as a whole failed, was aborted, or that
    /// no destination survived.
    ///
    /// An abort requested before the call is honoured before any device is
    /// touched. The token is reset once the run ends, so the next call starts
    /// fresh.
    pub async fn flash(
        &self,
        source: SourceImage,
        paths: &[String],
    ) -> Result<FlashResults, FlashError> {
        let result = self.flash_once(source, paths).await;
        self.cancel.reset();
        result
    }

    async fn flash_once(
        &self,
        source: SourceImage,
        paths: &[String],
    ) -> Result<FlashResults, FlashError> {
        let started_at = Utc::now().to_rfc3339();

        let descriptors = match self.resolve(paths).await {
            Ok(descriptors) => descriptors,
            Err(e) => {
                error!("Aborting before touching any device: {}", e);
                self.emit(FlashEvent::Error(e.report(None)));
                return Err(e);
            }
        };

        let mut set = DestinationSet::new(descriptors);
        let outcome = self.run(&mut set, source).await;

        debug!("state:{}", FlashPhase::Finished);
        self.cleanup(&mut set, outcome.is_ok()).await;

        let summary = match outcome {
            Ok(summary) => summary,
            Err(FlashError::Cancelled) => {
                info!("Flashing aborted");
                self.emit(FlashEvent::Abort);
                return Err(FlashError::Cancelled);
            }
            Err(e) => {
                error!("Flashing failed: {}", e);
                self.emit(FlashEvent::Error(e.report(None)));
                return Err(e);
            }
        };

        if set.all_failed() {
            let e = FlashError::AllDestinationsFailed;
            error!("{}", e);
            self.emit(FlashEvent::Error(e.report(None)));
            return Err(e);
        }

        let destinations = set.results();
        let results = FlashResults {
            bytes_read: summary.bytes_read,
            bytes_written: destinations.iter().map(|d| d.bytes_written).max().unwrap_or(0),
            checksum: summary.checksum,
            devices: DeviceCounts {
                successful: set.count(DestinationStatus::Succeeded),
                failed: set.count(DestinationStatus::Failed),
            },
            errors: destinations.iter().filter_map(|d| d.error.clone()).collect(),
            destinations,
            started_at,
            finished_at: Utc::now().to_rfc3339(),
        };
        info!(
            "Flashing done: {} succeeded, {} failed",
            results.devices.successful, results.devices.failed
        );
        self.emit(FlashEvent::Done(results.clone()));
        Ok(results)
    }

    async fn run(
        &self,
        set: &mut DestinationSet,
        source: SourceImage,
    ) -> Result<WriteSummary, FlashError> {
        self.ensure_running()?;
        debug!("state:{}", FlashPhase::Preparing);
        self.prepare(set, source.size).await;
        self.ensure_running()?;
        if set.all_failed() {
            return Ok(WriteSummary::default());
        }

        let size = source.size;
        let block_map = source.block_map.clone();

        debug!("state:{}", FlashPhase::Writing);
        let summary = self.write(set, source).await?;

        let eligible: Vec<DestinationId> = set
            .active_ids()
            .into_iter()
            .filter(|&id| set.get(id).is_some_and(|d| d.is_finished()))
            .collect();

        if self.config.verify && !eligible.is_empty() {
            debug!("state:{}", FlashPhase::Verifying);
            let expected = summary.checksum.clone().unwrap_or_default();
            self.verify(set, &eligible, &expected, size, block_map.as_ref())
                .await?;
        } else {
            for id in eligible {
                set.succeed(id);
            }
        }

        Ok(summary)
    }

    async fn resolve(&self, paths: &[String]) -> Result<Vec<DeviceDescriptor>, FlashError> {
        let first = paths.first().cloned().unwrap_or_default();
        if paths.is_empty() {
            return Err(FlashError::Unresolved { device: first });
        }

        let available = self.host.list().await.map_err(|e| {
            error!("Failed to list devices: {:#}", e);
            FlashError::Unresolved {
                device: first.clone(),
            }
        })?;

        let mut resolved: Vec<DeviceDescriptor> = Vec::with_capacity(paths.len());
        for path in paths {
            let descriptor = available
                .iter()
                .find(|d| d.device == *path || d.raw == *path)
                .ok_or_else(|| FlashError::Unresolved {
                    device: path.clone(),
                })?;
            if resolved.iter().any(|d| d.device == descriptor.device) {
                debug!("Ignoring duplicate destination {}", path);
                continue;
            }
            resolved.push(descriptor.clone());
        }
        Ok(resolved)
    }

    /// Prepare every destination concurrently; a failure only drops that destination
    async fn prepare(&self, set: &mut DestinationSet, size: ImageSize) {
        // An estimated size may overshoot, so only the raw size is a hard bound
        let required = required_size(size);

        let jobs: Vec<_> = set
            .iter()
            .map(|dest| {
                let id = dest.id;
                let descriptor = dest.descriptor.clone();
                async move { (id, self.prepare_one(&descriptor, required).await) }
            })
            .collect();

        for (id, result) in join_all(jobs).await {
            match result {
                Ok(device) => set.attach_device(id, device),
                // Left pending; the run returns as aborted
                Err(FlashError::Cancelled) => debug!("Stopped preparing {}", set.device_path(id)),
                Err(e) => self.fail(set, id, e),
            }
        }
    }

    fn ensure_running(&self) -> Result<(), FlashError> {
        if self.cancel.is_cancelled() {
            return Err(FlashError::Cancelled);
        }
        Ok(())
    }

    async fn prepare_one(
        &self,
        descriptor: &DeviceDescriptor,
        required: u64,
    ) -> Result<crate::disk::BoxedDevice, FlashError> {
        if descriptor.size < required {
            return Err(FlashError::Capacity {
                device: descriptor.device.clone(),
                image_size: required,
                device_size: descriptor.size,
            });
        }

        let step_error = |step: PrepareStep| {
            move |e: anyhow::Error| FlashError::Preparation {
                device: descriptor.device.clone(),
                step,
                reason: format!("{e:#}"),
            }
        };

        // Every step changes the device, so an abort stops before the next one
        self.ensure_running()?;
        self.host
            .unmount(descriptor)
            .await
            .map_err(step_error(PrepareStep::Unmount))?;
        self.ensure_running()?;
        self.host
            .clean_partition_table(descriptor)
            .await
            .map_err(step_error(PrepareStep::CleanPartitionTable))?;
        self.ensure_running()?;
        let device = self
            .host
            .open(descriptor)
            .await
            .map_err(step_error(PrepareStep::Open))?;

        debug!("Prepared {}", descriptor.device);
        Ok(device)
    }

    fn build_write_pipeline(
        &self,
        source: &mut SourceImage,
        meter_tx: mpsc::UnboundedSender<u64>,
    ) -> (Pipeline, u64) {
        let size = source.size;
        let mut pipeline = Pipeline::new();

        // An estimated final size is useless for progress, so meter the raw stream
        let length = if size.final_size.estimation {
            pipeline.append(ProgressStage::new(meter_tx.clone()));
            size.original
        } else {
            size.final_size.value
        };

        if let Some(transform) = source.transform.take() {
            pipeline.append_boxed(transform);
        }

        if !size.final_size.estimation {
            pipeline.append(ProgressStage::new(meter_tx));
        }

        let algorithms = &self.config.checksum_algorithms;
        match &source.block_map {
            Some(map) => {
                pipeline.append(SparseFilter::new(map, algorithms));
            }
            None => {
                pipeline
                    .append(BlockAligner::new(
                        self.config.block_size,
                        self.config.chunk_size,
                    ))
                    .append(ChecksumStage::new(algorithms));
            }
        }

        debug!("Write pipeline: {:?}", pipeline.stage_names());
        (pipeline, length)
    }

    async fn write(
        &self,
        set: &mut DestinationSet,
        mut source: SourceImage,
    ) -> Result<WriteSummary, FlashError> {
        let (meter_tx, mut meter_rx) = mpsc::unbounded_channel::<u64>();
        let (pipeline, length) = self.build_write_pipeline(&mut source, meter_tx);
        let destination_length = source
            .block_map
            .as_ref()
            .map_or(required_size(source.size), BlockMap::mapped_bytes);

        // Set once the stream ends abnormally, so writers skip the deferred flush
        let halt = CancelToken::new();
        let (io_tx, mut io_rx) = mpsc::unbounded_channel::<IoProgress>();
        let mut fanout = Fanout::new();
        let mut writers = FuturesUnordered::new();
        let now = Instant::now();

        for id in set.active_ids() {
            let Some(device) = set.take_device(id) else {
                continue;
            };
            let writer = DestinationWriter::new(
                set.device_path(id),
                device,
                self.config.retry_policy(),
                self.config.deferred_region,
            );
            let (tx, handle) = spawn_writer(
                id,
                writer,
                io_tx.clone(),
                halt.clone(),
                self.config.writer_queue_depth,
            );
            fanout.attach(id, tx);
            writers.push(async move { (id, handle.await) });
            set.start_writing(id, destination_length, now);
        }
        drop(io_tx);
        info!("Writing to {} destinations", fanout.len());

        let reader = ChunkReader::new(source.stream, self.config.chunk_size);
        let mut pump = Some(Box::pin(pump_source(reader, pipeline, fanout, halt.clone())));
        let mut source_meter = ProgressMeter::new(length, now);
        let mut ticker = tokio::time::interval(self.config.progress_interval());

        let mut summary = WriteSummary::default();
        let mut fatal: Option<FlashError> = None;
        let mut cancelled = false;

        while pump.is_some() || !writers.is_empty() {
            tokio::select! {
                result = poll_option(&mut pump), if pump.is_some() => {
                    pump = None;
                    match result {
                        Ok(done) => summary = done,
                        Err(e) => {
                            error!("Write pipeline failed: {}", e);
                            fatal = Some(e);
                        }
                    }
                }
                Some(bytes) = meter_rx.recv() => source_meter.record(bytes),
                Some(progress) = io_rx.recv() => set.record_io(progress.id, progress.bytes),
                Some((id, joined)) = writers.next() => {
                    self.writer_exited(set, id, joined);
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let overall = source_meter.tick(now);
                    self.emit_state(set, FlashPhase::Writing, Some(&overall), now);
                }
                _ = self.cancel.cancelled(), if !cancelled => {
                    info!("Cancelling write");
                    cancelled = true;
                    halt.cancel();
                    // Dropping the pump destroys the source and closes every writer queue
                    pump = None;
                }
            }
        }

        if cancelled {
            return Err(FlashError::Cancelled);
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        // The pipeline is gone, so every byte it metered is already queued
        while let Ok(bytes) = meter_rx.try_recv() {
            source_meter.record(bytes);
        }
        while let Ok(progress) = io_rx.try_recv() {
            set.record_io(progress.id, progress.bytes);
        }
        let now = Instant::now();
        let overall = source_meter.tick(now);
        self.emit_state(set, FlashPhase::Writing, Some(&overall), now);
        debug!(
            "Write phase done: {} bytes read, {:.1}%",
            summary.bytes_read, overall.percentage
        );
        Ok(summary)
    }

    fn writer_exited(
        &self,
        set: &mut DestinationSet,
        id: DestinationId,
        joined: Result<WriterOutcome, JoinError>,
    ) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                let device = set.device_path(id);
                self.fail(
                    set,
                    id,
                    FlashError::Io {
                        device,
                        source: std::io::Error::other(format!("writer task failed: {e}")),
                    },
                );
                return;
            }
        };

        set.attach_device(id, outcome.device);
        match outcome.result {
            Ok(stats) => {
                debug!(
                    "Destination {} finished writing {} bytes ({} deferred)",
                    id, stats.bytes_written, stats.deferred_bytes
                );
                set.finish_write(id, stats);
            }
            // The run is winding down; the abort path reports it
            Err(FlashError::Cancelled) => {}
            Err(e) => self.fail(set, id, e),
        }
    }

    async fn verify(
        &self,
        set: &mut DestinationSet,
        eligible: &[DestinationId],
        expected: &ChecksumSet,
        size: ImageSize,
        block_map: Option<&BlockMap>,
    ) -> Result<(), FlashError> {
        let halt = CancelToken::new();
        let (io_tx, mut io_rx) = mpsc::unbounded_channel::<IoProgress>();
        let mut jobs = FuturesUnordered::new();
        let now = Instant::now();

        for &id in eligible {
            let Some(device) = set.take_device(id) else {
                continue;
            };
            let bytes_written = set.get(id).map_or(0, |d| d.bytes_written());

            let mut pipeline = Pipeline::new();
            let extents: Vec<(u64, u64)> = match block_map {
                Some(map) => {
                    pipeline.append(SparseFilter::new(map, &self.config.checksum_algorithms));
                    map.ranges().iter().map(|r| (r.offset, r.length)).collect()
                }
                None => {
                    pipeline.append(ChecksumStage::new(&self.config.checksum_algorithms));
                    let verify_length = if size.final_size.estimation {
                        bytes_written
                    } else {
                        bytes_written.max(size.final_size.value)
                    };
                    vec![(0, verify_length)]
                }
            };
            let length = extents.iter().map(|(_, len)| len).sum();

            let job = VerifyJob {
                id,
                reader: DestinationReader::new(
                    set.device_path(id),
                    device,
                    self.config.retry_policy(),
                    self.config.chunk_size,
                ),
                pipeline,
                extents,
            };
            set.start_verifying(id, length, now);
            let handle = spawn_verify(job, io_tx.clone(), halt.clone());
            jobs.push(async move { (id, handle.await) });
        }
        drop(io_tx);

        let mut ticker = tokio::time::interval(self.config.progress_interval());
        let mut cancelled = false;

        // Verify jobs cannot be dropped mid-read, so wait for all of them
        while !jobs.is_empty() {
            tokio::select! {
                Some((id, joined)) = jobs.next() => {
                    self.verify_exited(set, id, joined, expected);
                }
                Some(progress) = io_rx.recv() => set.record_io(progress.id, progress.bytes),
                _ = ticker.tick() => {
                    self.emit_state(set, FlashPhase::Verifying, None, Instant::now());
                }
                _ = self.cancel.cancelled(), if !cancelled => {
                    info!("Cancelling verification");
                    cancelled = true;
                    halt.cancel();
                }
            }
        }

        if cancelled {
            return Err(FlashError::Cancelled);
        }
        self.emit_state(set, FlashPhase::Verifying, None, Instant::now());
        Ok(())
    }

    fn verify_exited(
        &self,
        set: &mut DestinationSet,
        id: DestinationId,
        joined: Result<VerifyOutcome, JoinError>,
        expected: &ChecksumSet,
    ) {
        let device = set.device_path(id);
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail(
                    set,
                    id,
                    FlashError::Io {
                        device,
                        source: std::io::Error::other(format!("verify task failed: {e}")),
                    },
                );
                return;
            }
        };

        set.attach_device(id, outcome.device);
        match outcome.result {
            Ok(actual) if actual == *expected => {
                debug!("Destination {} verified: {}", device, actual);
                set.finish_verify(id, actual);
            }
            Ok(actual) => self.fail(
                set,
                id,
                FlashError::Validation {
                    device,
                    expected: expected.clone(),
                    actual,
                },
            ),
            Err(FlashError::Cancelled) => {}
            Err(e) => self.fail(set, id, e),
        }
    }

    fn emit_state(
        &self,
        set: &mut DestinationSet,
        phase: FlashPhase,
        overall: Option<&ProgressState>,
        now: Instant,
    ) {
        set.tick(now);

        let running: Vec<&ProgressState> = set
            .iter()
            .filter(|d| {
                matches!(
                    d.status(),
                    DestinationStatus::Flashing | DestinationStatus::Verifying
                ) && !(phase == FlashPhase::Writing && d.is_finished())
            })
            .map(|d| d.progress())
            .collect();

        let active_count = running.len();
        // An empty f64 sum is -0.0, which the controller would display
        let total_speed = running.iter().fold(0.0, |total, p| total + p.speed);
        let (percentage, eta) = match overall {
            Some(state) => (state.percentage, state.eta),
            None if active_count > 0 => (
                running.iter().map(|p| p.percentage).sum::<f64>() / active_count as f64,
                running.iter().map(|p| p.eta).fold(0.0, f64::max),
            ),
            None => (100.0, 0.0),
        };

        let state = AggregateState {
            phase,
            flashing: set.count(DestinationStatus::Flashing),
            verifying: set.count(DestinationStatus::Verifying),
            failed: set.count(DestinationStatus::Failed),
            succeeded: set.count(DestinationStatus::Succeeded),
            active_count,
            total_speed,
            speed: AggregateState::mean_speed(total_speed, active_count),
            percentage,
            eta,
        };
        self.emit(FlashEvent::State(state));
    }

    /// Close every handle, then unmount the destinations that succeeded
    async fn cleanup(&self, set: &mut DestinationSet, completed: bool) {
        let succeeded = set.release_handles();
        if !completed || !self.config.unmount_on_success || succeeded.is_empty() {
            return;
        }

        // Give the OS time to settle so a just-closed device is not remounted under us
        tokio::time::sleep(self.config.unmount_delay()).await;
        let results = join_all(succeeded.iter().map(|d| self.host.unmount(d))).await;
        for (descriptor, result) in succeeded.iter().zip(results) {
            if let Err(e) = result {
                warn!("Failed to unmount {} after flashing: {:#}", descriptor.device, e);
            }
        }
    }
}

fn required_size(size: ImageSize) -> u64 {
    if size.final_size.estimation {
        size.original
    } else {
        size.final_size.value
    }
}

/// Await an optional future, pending forever when there is none
async fn poll_option<F: Future + Unpin>(future: &mut Option<F>) -> F::Output {
    match future {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

/// Read the source through the pipeline into the fan-out
///
/// The fan-out is dropped on return, which ends every writer's stream. On
/// error `halt` is cancelled first so the writers abort instead of finishing.
async fn pump_source(
    mut reader: ChunkReader,
    mut pipeline: Pipeline,
    mut fanout: Fanout,
    halt: CancelToken,
) -> Result<WriteSummary, FlashError> {
    let result = pump_chunks(&mut reader, &mut pipeline, &mut fanout).await;
    if result.is_err() {
        halt.cancel();
    }
    drop(fanout);
    result
}

async fn pump_chunks(
    reader: &mut ChunkReader,
    pipeline: &mut Pipeline,
    fanout: &mut Fanout,
) -> Result<WriteSummary, FlashError> {
    while let Some(data) = reader.next_chunk().await.map_err(FlashError::Source)? {
        for chunk in pipeline.push(Chunk::new(data))? {
            fanout.broadcast(chunk).await;
        }
        if fanout.is_empty() {
            warn!("Every destination left the write pipeline");
            return Ok(WriteSummary {
                bytes_read: reader.bytes_read(),
                checksum: None,
            });
        }
    }

    let output = pipeline.finish()?;
    for chunk in output.chunks {
        fanout.broadcast(chunk).await;
    }
    Ok(WriteSummary {
        bytes_read: reader.bytes_read(),
        checksum: output.checksum,
    })
}
