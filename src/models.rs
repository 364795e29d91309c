// Shared data types used across the engine: device descriptors, image size
// metadata and the cancellation token handed to long-running work.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Index of a destination inside a single flashing run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationId(pub usize);

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A block device as reported by the enumeration service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    /// The path the user selected (e.g., "/dev/sdb")
    pub device: String,
    /// The path used for raw access, which may differ from `device`
    pub raw: String,
    /// The device capacity in bytes
    pub size: u64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub mountpoints: Vec<String>,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub is_removable: bool,
    #[serde(default)]
    pub is_read_only: bool,
}

impl DeviceDescriptor {
    pub fn new(device: impl Into<String>, size: u64) -> Self {
        let device = device.into();
        Self {
            raw: device.clone(),
            device,
            size,
            description: String::new(),
            mountpoints: Vec::new(),
            is_system: false,
            is_removable: true,
            is_read_only: false,
        }
    }
}

/// Size of the stream after the source transform has been applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalSize {
    pub value: u64,
    /// Whether `value` is only an estimate (e.g., a compressed image without a size header)
    pub estimation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    /// Size of the raw source stream
    pub original: u64,
    #[serde(rename = "final")]
    pub final_size: FinalSize,
}

impl ImageSize {
    /// An image that is written as-is, so both sizes are known precisely
    pub fn exact(len: u64) -> Self {
        Self {
            original: len,
            final_size: FinalSize {
                value: len,
                estimation: false,
            },
        }
    }
}

// A simple cancel token for aborting operations
#[derive(Debug, Clone)]
pub struct CancelToken {
    // Whether the operation should be cancelled
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        loop {
            // Register before checking the flag so a concurrent cancel is not missed
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancelled_resolves_after_cancel() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("already cancelled");
    }

    #[test]
    fn reset_clears_the_flag_for_every_clone() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());

        clone.reset();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn image_size_deserializes_final_field() {
        let size: ImageSize =
            serde_json::from_str(r#"{"original":10,"final":{"value":20,"estimation":true}}"#)
                .unwrap();
        assert_eq!(size.original, 10);
        assert_eq!(size.final_size.value, 20);
        assert!(size.final_size.estimation);
    }
}
