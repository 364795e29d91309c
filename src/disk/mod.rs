// Disk access with a platform abstraction
//
// `RawDevice` is a positioned, blocking handle to an opened destination. The
// writer and reader tasks drive it from blocking threads. `DeviceHost` covers
// everything that happens around the handle (enumeration, unmounting, wiping
// the partition table, opening) and is implemented per platform.

use crate::models::DeviceDescriptor;
use anyhow::Result;
use std::future::Future;
use std::io;

// Platform-specific modules
#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::LinuxDeviceHost;

#[cfg(test)]
pub(crate) mod memory;

pub mod reader;
pub mod retry;
pub mod writer;

pub use reader::DestinationReader;
pub use retry::RetryPolicy;
pub use writer::{DestinationWriter, WriteStats};

/// Positioned I/O on an opened destination
pub trait RawDevice: Send + 'static {
    /// Write the whole buffer at `offset`
    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Read into `buf` from `offset`, returning the number of bytes read
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Flush everything written so far to the device
    fn sync(&mut self) -> io::Result<()>;
}

pub type BoxedDevice = Box<dyn RawDevice>;

/// Platform services around a destination
pub trait DeviceHost: Send + Sync + 'static {
    /// Enumerate the block devices currently attached
    fn list(&self) -> impl Future<Output = Result<Vec<DeviceDescriptor>>> + Send;

    /// Unmount every filesystem mounted from the device
    fn unmount(&self, device: &DeviceDescriptor) -> impl Future<Output = Result<()>> + Send;

    /// Destroy the existing partition table so stale partitions are not auto-mounted
    fn clean_partition_table(
        &self,
        device: &DeviceDescriptor,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Open an exclusive raw handle
    fn open(&self, device: &DeviceDescriptor) -> impl Future<Output = Result<BoxedDevice>> + Send;
}

/// A raw device backed by a file descriptor
#[cfg(unix)]
#[derive(Debug)]
pub struct FileDevice {
    file: std::fs::File,
}

#[cfg(unix)]
impl FileDevice {
    pub fn from_file(file: std::fs::File) -> Self {
        Self { file }
    }

    /// Open a device for exclusive, synchronous read-write access
    ///
    /// # Arguments
    /// * `path` - The raw device path (e.g., "/dev/sdb")
    pub fn open_exclusive(path: &str) -> io::Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;

        // O_EXCL for exclusive access, O_SYNC for sync I/O, O_CLOEXEC to close on exec
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_EXCL | libc::O_SYNC | libc::O_CLOEXEC)
            .open(path)?;
        Ok(Self { file })
    }
}

#[cfg(unix)]
impl RawDevice for FileDevice {
    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::write_all_at(&self.file, buf, offset)
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(&self.file, buf, offset)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn file_device_positions_writes() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut device = FileDevice::from_file(tmp.reopen().unwrap());

        device.write_at(b"world", 6).unwrap();
        device.write_at(b"hello ", 0).unwrap();
        device.sync().unwrap();

        let mut buf = [0u8; 11];
        assert_eq!(device.read_at(&mut buf, 0).unwrap(), 11);
        assert_eq!(&buf, b"hello world");
        assert_eq!(std::fs::read(tmp.path()).unwrap(), b"hello world");

        // Reading past the end is a short read, not an error
        assert_eq!(device.read_at(&mut buf, 20).unwrap(), 0);
    }
}
