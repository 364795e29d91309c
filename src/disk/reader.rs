// Retrying ranged reads of a destination, used for verification

use super::{BoxedDevice, RetryPolicy};
use crate::error::FlashError;
use crate::pipeline::Chunk;
use bytes::Bytes;
use std::io;

pub struct DestinationReader {
    device_path: String,
    device: BoxedDevice,
    retry: RetryPolicy,
    chunk_size: usize,
}

impl DestinationReader {
    pub fn new(
        device_path: impl Into<String>,
        device: BoxedDevice,
        retry: RetryPolicy,
        chunk_size: usize,
    ) -> Self {
        Self {
            device_path: device_path.into(),
            device,
            retry,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Read exactly `len` bytes at `offset`
    ///
    /// Each underlying read is retried on its own. Hitting the end of the
    /// device early is an error.
    pub fn read_exact_at(&mut self, offset: u64, len: usize) -> Result<Bytes, FlashError> {
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let device = &mut self.device;
            let at = offset + filled as u64;
            let target = &mut buf[filled..];
            let n = self.retry.run(&self.device_path, || device.read_at(target, at))?;
            if n == 0 {
                return Err(FlashError::Io {
                    device: self.device_path.clone(),
                    source: io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("short read at offset {at}"),
                    ),
                });
            }
            filled += n;
        }
        Ok(Bytes::from(buf))
    }

    /// Read `[offset, offset + length)` in chunk-sized pieces
    pub fn read_range(
        &mut self,
        offset: u64,
        length: u64,
        mut sink: impl FnMut(Chunk) -> Result<(), FlashError>,
    ) -> Result<(), FlashError> {
        let end = offset + length;
        let mut cursor = offset;
        while cursor < end {
            let len = (end - cursor).min(self.chunk_size as u64) as usize;
            let data = self.read_exact_at(cursor, len)?;
            sink(Chunk::at(data, cursor))?;
            cursor += len as u64;
        }
        Ok(())
    }

    pub fn into_device(self) -> BoxedDevice {
        self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::RawDevice;
    use crate::disk::memory::MemoryDevice;
    use std::time::Duration;

    fn reader(device: &MemoryDevice, chunk_size: usize) -> DestinationReader {
        DestinationReader::new(
            "/dev/mem",
            Box::new(device.clone()),
            RetryPolicy::new(3, Duration::from_millis(1)),
            chunk_size,
        )
    }

    #[test]
    fn reads_ranges_in_chunks() {
        let mut device = MemoryDevice::new(4096);
        device.write_at(&[7u8; 1000], 100).unwrap();

        let mut reader = reader(&device, 256);
        let mut chunks = Vec::new();
        reader
            .read_range(100, 1000, |chunk| {
                chunks.push(chunk);
                Ok(())
            })
            .unwrap();

        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].position, Some(100));
        assert_eq!(chunks[3].position, Some(868));
        assert_eq!(chunks[3].len(), 232);
        assert!(chunks.iter().all(|c| c.data.iter().all(|&b| b == 7)));
        assert_eq!(device.reads().iter().map(|(_, n)| n).sum::<usize>(), 1000);
    }

    #[test]
    fn transient_read_errors_are_retried() {
        let device = MemoryDevice::new(1024);
        device.fail_reads_transiently(2);
        let mut reader = reader(&device, 512);
        assert_eq!(reader.read_exact_at(0, 512).unwrap().len(), 512);
    }

    #[test]
    fn reading_past_the_end_is_an_error() {
        let device = MemoryDevice::new(1024);
        let mut reader = reader(&device, 512);
        let err = reader.read_exact_at(768, 512).unwrap_err();
        assert!(matches!(err, FlashError::Io { .. }));
    }
}
