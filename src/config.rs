// Engine configuration, persisted as TOML in the per-user config directory

use crate::disk::RetryPolicy;
use crate::pipeline::checksum::ChecksumAlgorithm;
use anyhow::{Context, Result, anyhow, ensure};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const CONFIG_FILE: &str = "engine.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Read every destination back after writing
    pub verify: bool,
    /// Unmount destinations that were flashed successfully
    pub unmount_on_success: bool,
    pub checksum_algorithms: Vec<ChecksumAlgorithm>,
    pub block_size: usize,
    /// Read size and aligner flush threshold
    pub chunk_size: usize,
    /// Writes starting below this offset are issued last
    pub deferred_region: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub progress_interval_ms: u64,
    /// Delay between closing a handle and unmounting, so the OS does not remount it
    pub unmount_delay_ms: u64,
    /// Chunks buffered per destination
    pub writer_queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            verify: true,
            unmount_on_success: true,
            checksum_algorithms: vec![ChecksumAlgorithm::Sha256],
            block_size: 512,
            chunk_size: 64 * 1024,
            deferred_region: 64 * 1024,
            max_retries: 5,
            retry_base_delay_ms: 100,
            progress_interval_ms: 500,
            unmount_delay_ms: 2000,
            writer_queue_depth: 1,
        }
    }
}

impl EngineConfig {
    /// Default location of the config file
    pub fn default_path() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("io", "imager", "imager-engine")
            .ok_or_else(|| anyhow!("Failed to determine project directories"))?;
        Ok(project_dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load from the default location, falling back to defaults
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;

        info!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {}", parent.display()))?;
        }
        let text = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, text)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.block_size > 0, "block_size must be positive");
        ensure!(
            self.chunk_size >= self.block_size && self.chunk_size % self.block_size == 0,
            "chunk_size ({}) must be a multiple of block_size ({})",
            self.chunk_size,
            self.block_size
        );
        ensure!(self.writer_queue_depth > 0, "writer_queue_depth must be positive");
        ensure!(self.progress_interval_ms > 0, "progress_interval_ms must be positive");
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn unmount_delay(&self) -> Duration {
        Duration::from_millis(self.unmount_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::load_from(&dir.path().join("engine.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("engine.toml");

        let config = EngineConfig {
            verify: false,
            checksum_algorithms: vec![ChecksumAlgorithm::Crc32, ChecksumAlgorithm::Sha512],
            max_retries: 2,
            ..Default::default()
        };
        config.save_to(&path).unwrap();

        assert_eq!(EngineConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.toml");
        fs::write(&path, "unmount_delay_ms = 10\nchecksum_algorithms = [\"crc32\"]\n").unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.unmount_delay(), Duration::from_millis(10));
        assert_eq!(config.checksum_algorithms, vec![ChecksumAlgorithm::Crc32]);
        assert_eq!(config.block_size, 512);
    }

    #[test]
    fn rejects_misaligned_chunk_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.toml");
        fs::write(&path, "block_size = 512\nchunk_size = 1000\n").unwrap();
        assert!(EngineConfig::load_from(&path).is_err());
    }
}
