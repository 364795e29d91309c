// In-memory devices and host used by the tests, with fault injection

use super::{BoxedDevice, DeviceHost, RawDevice};
use crate::models::{CancelToken, DeviceDescriptor};
use anyhow::{Result, anyhow};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct DeviceState {
    data: Vec<u8>,
    transient_write_failures: u32,
    transient_read_failures: u32,
    // Fail every write at or after this offset with a permanent error
    broken_from: Option<u64>,
    corrupt_reads: bool,
    writes: Vec<(u64, usize)>,
    reads: Vec<(u64, usize)>,
    syncs: usize,
}

#[derive(Clone)]
pub struct MemoryDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MemoryDevice {
    pub fn new(size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                data: vec![0; size],
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail_writes_transiently(&self, count: u32) {
        self.lock().transient_write_failures = count;
    }

    pub fn fail_reads_transiently(&self, count: u32) {
        self.lock().transient_read_failures = count;
    }

    pub fn break_writes_from(&self, offset: u64) {
        self.lock().broken_from = Some(offset);
    }

    pub fn corrupt_reads(&self) {
        self.lock().corrupt_reads = true;
    }

    pub fn contents(&self) -> Vec<u8> {
        self.lock().data.clone()
    }

    pub fn write_offsets(&self) -> Vec<u64> {
        self.lock().writes.iter().map(|(offset, _)| *offset).collect()
    }

    pub fn writes(&self) -> Vec<(u64, usize)> {
        self.lock().writes.clone()
    }

    pub fn reads(&self) -> Vec<(u64, usize)> {
        self.lock().reads.clone()
    }

    pub fn bytes_written(&self) -> usize {
        self.lock().writes.iter().map(|(_, len)| *len).sum()
    }

    pub fn sync_count(&self) -> usize {
        self.lock().syncs
    }
}

impl RawDevice for MemoryDevice {
    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut state = self.lock();
        if state.transient_write_failures > 0 {
            state.transient_write_failures -= 1;
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        if state.broken_from.is_some_and(|from| offset >= from) {
            return Err(io::Error::other("medium error"));
        }
        let start = offset as usize;
        let end = start + buf.len();
        if end > state.data.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "no space left"));
        }
        state.data[start..end].copy_from_slice(buf);
        state.writes.push((offset, buf.len()));
        Ok(())
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut state = self.lock();
        if state.transient_read_failures > 0 {
            state.transient_read_failures -= 1;
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let start = (offset as usize).min(state.data.len());
        let end = (start + buf.len()).min(state.data.len());
        let n = end - start;
        buf[..n].copy_from_slice(&state.data[start..end]);
        if state.corrupt_reads && n > 0 {
            buf[0] ^= 0xff;
        }
        state.reads.push((offset, n));
        Ok(n)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.lock().syncs += 1;
        Ok(())
    }
}

/// A device host over a fixed set of in-memory devices
#[derive(Clone, Default)]
pub struct MemoryHost {
    devices: Arc<Mutex<HashMap<String, (DeviceDescriptor, MemoryDevice)>>>,
    failing_unmounts: Arc<Mutex<HashSet<String>>>,
    unmounted: Arc<Mutex<Vec<String>>>,
    // Cancelled by the next unmount
    cancel_on_unmount: Arc<Mutex<Option<CancelToken>>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device and return a handle to inspect it later
    pub fn add(&self, path: &str, size: usize) -> MemoryDevice {
        let device = MemoryDevice::new(size);
        let descriptor = DeviceDescriptor::new(path, size as u64);
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), (descriptor, device.clone()));
        device
    }

    pub fn fail_unmount(&self, path: &str) {
        self.failing_unmounts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string());
    }

    pub fn cancel_on_unmount(&self, token: CancelToken) {
        *self.cancel_on_unmount.lock().unwrap_or_else(|e| e.into_inner()) = Some(token);
    }

    pub fn unmounted(&self) -> Vec<String> {
        self.unmounted.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn device(&self, path: &str) -> Result<MemoryDevice> {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .map(|(_, device)| device.clone())
            .ok_or_else(|| anyhow!("No device found for path: {}", path))
    }
}

impl DeviceHost for MemoryHost {
    async fn list(&self) -> Result<Vec<DeviceDescriptor>> {
        let devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<DeviceDescriptor> =
            devices.values().map(|(descriptor, _)| descriptor.clone()).collect();
        list.sort_by(|a, b| a.device.cmp(&b.device));
        Ok(list)
    }

    async fn unmount(&self, device: &DeviceDescriptor) -> Result<()> {
        if self
            .failing_unmounts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&device.device)
        {
            return Err(anyhow!("target is busy"));
        }
        self.unmounted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(device.device.clone());
        if let Some(token) = self
            .cancel_on_unmount
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            token.cancel();
        }
        Ok(())
    }

    async fn clean_partition_table(&self, device: &DeviceDescriptor) -> Result<()> {
        self.device(&device.raw)?;
        Ok(())
    }

    async fn open(&self, device: &DeviceDescriptor) -> Result<BoxedDevice> {
        Ok(Box::new(self.device(&device.raw)?))
    }
}
