// Bounded retries for raw device I/O

use crate::error::{FlashError, is_transient_error};
use std::io;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Run a blocking I/O operation, retrying transient failures
    ///
    /// Attempt `n` waits `base_delay * n` before running again. Once the
    /// budget is spent the device is considered gone. Must be called from a
    /// blocking context since it sleeps the current thread.
    pub fn run<T>(
        &self,
        device: &str,
        mut op: impl FnMut() -> io::Result<T>,
    ) -> Result<T, FlashError> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if is_transient_error(&e) => {
                    if attempt >= self.max_retries {
                        warn!(
                            "Giving up on {} after {} retries: {}",
                            device, self.max_retries, e
                        );
                        return Err(FlashError::DeviceRemoved {
                            device: device.to_string(),
                            source: e,
                        });
                    }
                    attempt += 1;
                    let delay = self.base_delay * attempt;
                    warn!(
                        "Transient error on {} ({}), retry {}/{} in {:?}",
                        device, e, attempt, self.max_retries, delay
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => {
                    return Err(FlashError::Io {
                        device: device.to_string(),
                        source: e,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busy() -> io::Error {
        io::Error::from(io::ErrorKind::WouldBlock)
    }

    #[test]
    fn recovers_within_budget() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let mut failures = 3;
        let value = policy
            .run("/dev/test", || {
                if failures > 0 {
                    failures -= 1;
                    Err(busy())
                } else {
                    Ok(42)
                }
            })
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn exhausted_budget_means_device_removed() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let mut calls = 0;
        let err = policy
            .run("/dev/test", || -> io::Result<()> {
                calls += 1;
                Err(busy())
            })
            .unwrap_err();
        assert_eq!(calls, 3);
        assert!(matches!(err, FlashError::DeviceRemoved { .. }));
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let mut calls = 0;
        let err = policy
            .run("/dev/test", || -> io::Result<()> {
                calls += 1;
                Err(io::Error::from(io::ErrorKind::PermissionDenied))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, FlashError::Io { .. }));
    }
}
