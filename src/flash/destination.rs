// The destinations of one run, owned by the orchestrator.
//
// All mutation goes through the transition methods on `DestinationSet`, which
// keep the per-destination invariants: once a destination has an error it is
// finished, excluded from further work, and keeps only its first error.

use super::state::{DestinationResult, DestinationStatus};
use crate::disk::{BoxedDevice, WriteStats};
use crate::error::{ErrorReport, FlashError};
use crate::models::{DestinationId, DeviceDescriptor};
use crate::pipeline::checksum::ChecksumSet;
use crate::pipeline::progress::{ProgressMeter, ProgressState};
use std::time::Instant;
use tracing::debug;

pub struct Destination {
    pub id: DestinationId,
    pub descriptor: DeviceDescriptor,
    device: Option<BoxedDevice>,
    status: DestinationStatus,
    error: Option<FlashError>,
    finished: bool,
    verified: bool,
    checksum: Option<ChecksumSet>,
    bytes_written: u64,
    meter: Option<ProgressMeter>,
    last_progress: ProgressState,
}

impl Destination {
    pub fn status(&self) -> DestinationStatus {
        self.status
    }

    pub fn error(&self) -> Option<&FlashError> {
        self.error.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn checksum(&self) -> Option<&ChecksumSet> {
        self.checksum.as_ref()
    }

    /// Still eligible for pipeline work
    pub fn is_active(&self) -> bool {
        self.error.is_none()
    }

    pub fn progress(&self) -> &ProgressState {
        &self.last_progress
    }
}

pub struct DestinationSet {
    items: Vec<Destination>,
}

impl DestinationSet {
    pub fn new(descriptors: Vec<DeviceDescriptor>) -> Self {
        Self {
            items: descriptors
                .into_iter()
                .enumerate()
                .map(|(index, descriptor)| Destination {
                    id: DestinationId(index),
                    descriptor,
                    device: None,
                    status: DestinationStatus::Pending,
                    error: None,
                    finished: false,
                    verified: false,
                    checksum: None,
                    bytes_written: 0,
                    meter: None,
                    last_progress: ProgressState::default(),
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: DestinationId) -> Option<&Destination> {
        self.items.get(id.0)
    }

    fn get_mut(&mut self, id: DestinationId) -> Option<&mut Destination> {
        self.items.get_mut(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Destination> {
        self.items.iter()
    }

    pub fn active_ids(&self) -> Vec<DestinationId> {
        self.items
            .iter()
            .filter(|d| d.is_active())
            .map(|d| d.id)
            .collect()
    }

    pub fn all_failed(&self) -> bool {
        self.items.iter().all(|d| !d.is_active())
    }

    pub fn device_path(&self, id: DestinationId) -> String {
        self.get(id)
            .map(|d| d.descriptor.device.clone())
            .unwrap_or_default()
    }

    /// Record a destination's error
    ///
    /// Returns the report to publish, or `None` if the destination had
    /// already failed.
    pub fn fail(&mut self, id: DestinationId, error: FlashError) -> Option<ErrorReport> {
        let dest = self.get_mut(id)?;
        if dest.error.is_some() {
            debug!("Ignoring further error on {}: {}", dest.descriptor.device, error);
            return None;
        }
        let report = error.report(Some(dest.descriptor.device.as_str()));
        dest.error = Some(error);
        dest.status = DestinationStatus::Failed;
        dest.finished = true;
        dest.meter = None;
        Some(report)
    }

    pub fn attach_device(&mut self, id: DestinationId, device: BoxedDevice) {
        if let Some(dest) = self.get_mut(id) {
            dest.device = Some(device);
        }
    }

    pub fn take_device(&mut self, id: DestinationId) -> Option<BoxedDevice> {
        self.get_mut(id)?.device.take()
    }

    pub fn start_writing(&mut self, id: DestinationId, length: u64, now: Instant) {
        if let Some(dest) = self.get_mut(id) {
            dest.status = DestinationStatus::Flashing;
            dest.finished = false;
            dest.meter = Some(ProgressMeter::new(length, now));
        }
    }

    pub fn finish_write(&mut self, id: DestinationId, stats: WriteStats) {
        if let Some(dest) = self.get_mut(id) {
            dest.bytes_written = stats.bytes_written;
            dest.finished = true;
            dest.meter = None;
        }
    }

    pub fn start_verifying(&mut self, id: DestinationId, length: u64, now: Instant) {
        if let Some(dest) = self.get_mut(id) {
            dest.status = DestinationStatus::Verifying;
            dest.meter = Some(ProgressMeter::new(length, now));
        }
    }

    pub fn record_io(&mut self, id: DestinationId, bytes: u64) {
        if let Some(meter) = self.get_mut(id).and_then(|d| d.meter.as_mut()) {
            meter.record(bytes);
        }
    }

    pub fn finish_verify(&mut self, id: DestinationId, checksum: ChecksumSet) {
        if let Some(dest) = self.get_mut(id) {
            dest.verified = true;
            dest.checksum = Some(checksum);
            dest.meter = None;
        }
        self.succeed(id);
    }

    pub fn succeed(&mut self, id: DestinationId) {
        if let Some(dest) = self.get_mut(id) {
            if dest.error.is_none() {
                dest.status = DestinationStatus::Succeeded;
                dest.finished = true;
                dest.meter = None;
            }
        }
    }

    /// Snapshot every running meter
    pub fn tick(&mut self, now: Instant) {
        for dest in &mut self.items {
            if let Some(meter) = dest.meter.as_mut() {
                dest.last_progress = meter.tick(now);
            }
        }
    }

    pub fn count(&self, status: DestinationStatus) -> usize {
        self.items.iter().filter(|d| d.status == status).count()
    }

    /// Close every handle, returning the destinations that succeeded
    pub fn release_handles(&mut self) -> Vec<DeviceDescriptor> {
        for dest in &mut self.items {
            dest.device = None;
        }
        self.items
            .iter()
            .filter(|d| d.status == DestinationStatus::Succeeded)
            .map(|d| d.descriptor.clone())
            .collect()
    }

    pub fn results(&self) -> Vec<DestinationResult> {
        self.items
            .iter()
            .map(|d| DestinationResult {
                device: d.descriptor.device.clone(),
                status: d.status,
                bytes_written: d.bytes_written,
                verified: d.verified,
                checksum: d.checksum.clone(),
                error: d.error.as_ref().map(|e| e.report(Some(d.descriptor.device.as_str()))),
            })
            .collect()
    }
}
