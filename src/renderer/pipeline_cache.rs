use std::path::{Path, PathBuf};
use std::sync::Arc;

use ash::vk;

use crate::vulkan::GpuDevice;
use crate::{AshError, Result};

/// The `vk::PipelineCache` every hot-reload pipeline builds through.
///
/// Rebuilding a pipeline whose stages did not change is then a cache hit. With a backing
/// file the driver blob survives restarts; it is rewritten only when it changed.
pub struct PipelineCache {
    device: Arc<dyn GpuDevice>,
    cache: vk::PipelineCache,
    file: Option<PathBuf>,
    /// Blob as it was last read from or written to `file`.
    persisted: Vec<u8>,
}

fn read_seed(path: &Path) -> Vec<u8> {
    match std::fs::read(path) {
        Ok(data) => {
            log::info!(
                "Seeding pipeline cache from {} ({} bytes)",
                path.display(),
                data.len()
            );
            data
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::debug!("No pipeline cache at {}", path.display());
            Vec::new()
        }
        Err(e) => {
            log::warn!("Ignoring unreadable pipeline cache {}: {e}", path.display());
            Vec::new()
        }
    }
}

impl PipelineCache {
    pub fn in_memory(device: Arc<dyn GpuDevice>) -> Result<Self> {
        Self::open(device, None)
    }

    /// Opens the cache, seeding it from `file` when that exists. A blob the driver refuses
    /// (another GPU or driver version) is dropped and the cache starts empty.
    pub fn open(device: Arc<dyn GpuDevice>, file: Option<PathBuf>) -> Result<Self> {
        let seed = file.as_deref().map(read_seed).unwrap_or_default();

        let (cache, persisted) = match device.create_pipeline_cache(&seed) {
            Ok(cache) => (cache, seed),
            Err(e) if !seed.is_empty() => {
                log::warn!("Driver rejected stored pipeline cache ({e}), starting empty");
                (device.create_pipeline_cache(&[])?, Vec::new())
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            device,
            cache,
            file,
            persisted,
        })
    }

    pub fn handle(&self) -> vk::PipelineCache {
        self.cache
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Writes the driver blob to the backing file if it differs from what is stored there.
    ///
    /// Returns whether a write happened. The file is replaced through a sibling temporary
    /// so a crash never leaves a truncated blob behind.
    pub fn persist(&mut self) -> Result<bool> {
        let Some(path) = self.file.clone() else {
            return Ok(false);
        };
        let data = self.device.pipeline_cache_data(self.cache)?;
        if data == self.persisted {
            log::trace!("Pipeline cache unchanged, not writing {}", path.display());
            return Ok(false);
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let staged = path.with_extension("tmp");
        std::fs::write(&staged, &data)?;
        std::fs::rename(&staged, &path).map_err(|e| {
            AshError::VulkanError(format!(
                "Failed to move pipeline cache into {}: {e}",
                path.display()
            ))
        })?;

        log::info!(
            "Pipeline cache written to {} ({} bytes)",
            path.display(),
            data.len()
        );
        self.persisted = data;
        Ok(true)
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        if let Err(e) = self.persist() {
            log::warn!("Pipeline cache not saved: {e}");
        }
        self.device.destroy_pipeline_cache(self.cache);
    }
}
