// Linux-specific disk operations

use super::{BoxedDevice, DeviceHost, FileDevice};
use crate::models::DeviceDescriptor;
use anyhow::{Context, Result, anyhow};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use tracing::{debug, info, warn};

// Linux-specific imports
use libc::{O_CLOEXEC, O_EXCL, O_SYNC};
use udisks2::zbus::zvariant::{ObjectPath, OwnedObjectPath};
use udisks2::{Client, zbus};

// Amount zeroed at each end of the device; covers MBR, GPT and its backup
const PARTITION_TABLE_WIPE: u64 = 1024 * 1024;

/// Device host backed by rs-drivelist and UDisks2
#[derive(Debug, Clone, Default)]
pub struct LinuxDeviceHost;

impl LinuxDeviceHost {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a device path to a UDisks2 object path
    async fn resolve_device(client: &Client, path: &str) -> Result<OwnedObjectPath> {
        debug!("Resolving Linux device path: {}", path);

        let mut spec = HashMap::new();
        spec.insert("path", path.into());

        let mut obj = client
            .manager()
            .resolve_device(spec, HashMap::default())
            .await?;

        obj.pop()
            .ok_or_else(|| anyhow!("No device found for path: {}", path))
    }

    /// Unmount all mounted filesystems on or below the given object path
    async fn umount_all(client: &Client, path: ObjectPath<'_>) -> Result<()> {
        debug!("Unmounting all filesystems on Linux device: {:?}", path);

        let block_devices = client
            .manager()
            .get_block_devices(HashMap::default())
            .await?;

        for dev_path in block_devices {
            // Partitions share the disk's object path as a prefix
            if !dev_path.as_str().starts_with(path.as_str()) {
                continue;
            }
            let dev_path_clone = dev_path.clone();
            if let Ok(fs) = client.object(dev_path)?.filesystem().await {
                if !fs.mount_points().await?.is_empty() {
                    info!("Unmounting filesystem on device: {:?}", dev_path_clone);
                    fs.unmount(HashMap::new()).await?;
                }
            }
        }

        Ok(())
    }

    /// Ask UDisks2 for an exclusive handle, which works without running as root
    async fn open_via_udisks(path: &str) -> Result<BoxedDevice> {
        let client = Client::new().await?;
        let object_path = Self::resolve_device(&client, path).await?;
        let block = client.object(object_path)?.block().await?;

        let flags = O_EXCL | O_SYNC | O_CLOEXEC;
        let fd = block
            .open_device(
                "rw",
                [("flags", zbus::zvariant::Value::from(flags))]
                    .into_iter()
                    .collect(),
            )
            .await?;

        if let zbus::zvariant::Fd::Owned(owned_fd) = fd.into() {
            Ok(Box::new(FileDevice::from_file(std::fs::File::from(owned_fd))))
        } else {
            Err(anyhow!(
                "UDisks2 did not provide an owned file descriptor for {}",
                path
            ))
        }
    }
}

impl DeviceHost for LinuxDeviceHost {
    async fn list(&self) -> Result<Vec<DeviceDescriptor>> {
        let drives = tokio::task::spawn_blocking(|| match rs_drivelist::drive_list() {
            Ok(drives) => Ok(drives),
            Err(_) => Err(anyhow!("Failed to enumerate drives")),
        })
        .await
        .context("Drive enumeration task failed")??;

        debug!("Found {} drives with rs-drivelist", drives.len());
        Ok(drives
            .into_iter()
            .map(|drive| DeviceDescriptor {
                raw: drive
                    .devicePath
                    .clone()
                    .unwrap_or_else(|| drive.device.clone()),
                device: drive.device,
                size: drive.size,
                description: drive.description,
                mountpoints: drive.mountpoints.into_iter().map(|m| m.path).collect(),
                is_system: drive.isSystem,
                is_removable: drive.isRemovable,
                is_read_only: drive.isReadOnly,
            })
            .collect())
    }

    async fn unmount(&self, device: &DeviceDescriptor) -> Result<()> {
        let client = Client::new()
            .await
            .context("Failed to connect to UDisks2")?;
        let object_path = Self::resolve_device(&client, &device.device).await?;
        Self::umount_all(&client, object_path.as_ref())
            .await
            .context("Failed to unmount partitions")
    }

    async fn clean_partition_table(&self, device: &DeviceDescriptor) -> Result<()> {
        let path = device.raw.clone();
        let size = device.size;
        tokio::task::spawn_blocking(move || -> Result<()> {
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .with_context(|| format!("Failed to open {} for wiping", path))?;

            let head = PARTITION_TABLE_WIPE.min(size);
            let zeros = vec![0u8; head as usize];
            file.write_all_at(&zeros, 0)
                .with_context(|| format!("Failed to clear the start of {}", path))?;

            if size > 2 * PARTITION_TABLE_WIPE {
                file.write_all_at(&zeros, size - PARTITION_TABLE_WIPE)
                    .with_context(|| format!("Failed to clear the end of {}", path))?;
            }
            file.sync_all()?;
            debug!("Cleared partition table on {}", path);
            Ok(())
        })
        .await
        .context("Partition table task failed")?
    }

    async fn open(&self, device: &DeviceDescriptor) -> Result<BoxedDevice> {
        match Self::open_via_udisks(&device.raw).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                warn!(
                    "UDisks2 could not open {} ({:#}), opening directly",
                    device.raw, e
                );
                let path = device.raw.clone();
                let handle = tokio::task::spawn_blocking(move || FileDevice::open_exclusive(&path))
                    .await
                    .context("Open task failed")?
                    .with_context(|| format!("Failed to open {} exclusively", device.raw))?;
                Ok(Box::new(handle))
            }
        }
    }
}
