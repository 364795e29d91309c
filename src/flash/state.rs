// Phases, aggregate progress and the events a run reports

use crate::error::ErrorReport;
use crate::pipeline::checksum::ChecksumSet;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashPhase {
    #[default]
    Idle,
    Preparing,
    Writing,
    Verifying,
    Finished,
}

impl fmt::Display for FlashPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlashPhase::Idle => "idle",
            FlashPhase::Preparing => "preparing",
            FlashPhase::Writing => "writing",
            FlashPhase::Verifying => "verifying",
            FlashPhase::Finished => "finished",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationStatus {
    #[default]
    Pending,
    Flashing,
    Verifying,
    Succeeded,
    Failed,
}

/// Progress across all destinations, computed once per tick
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateState {
    pub phase: FlashPhase,
    pub flashing: usize,
    pub verifying: usize,
    pub failed: usize,
    pub succeeded: usize,
    pub active_count: usize,
    /// Sum of the speeds of every active destination, bytes per second
    pub total_speed: f64,
    /// Mean speed of the active destinations
    pub speed: f64,
    pub percentage: f64,
    pub eta: f64,
}

impl AggregateState {
    pub fn mean_speed(total_speed: f64, active_count: usize) -> f64 {
        if active_count > 0 {
            total_speed / active_count as f64
        } else {
            total_speed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationResult {
    pub device: String,
    pub status: DestinationStatus,
    pub bytes_written: u64,
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<ChecksumSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceCounts {
    pub successful: usize,
    pub failed: usize,
}

/// Final report of a run that got past resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlashResults {
    pub bytes_read: u64,
    pub bytes_written: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<ChecksumSet>,
    pub devices: DeviceCounts,
    /// First error of every failed destination
    pub errors: Vec<ErrorReport>,
    pub destinations: Vec<DestinationResult>,
    pub started_at: String,
    pub finished_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlashEvent {
    State(AggregateState),
    /// A single destination failed; the run goes on
    Fail { device: String, error: ErrorReport },
    /// The run failed as a whole
    Error(ErrorReport),
    Done(FlashResults),
    Abort,
}
