use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;

use super::device::GpuDevice;
use crate::Result;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct TargetKey {
    views: Vec<vk::ImageView>,
    pass: vk::RenderPass,
}

struct CachedFrameBuffer {
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
}

/// Framebuffers keyed by (ordered attachment views, render pass, size).
///
/// At most one framebuffer is kept per (views, pass); asking for a different size replaces
/// the old object. A replaced framebuffer may still be referenced by a frame in flight, so the
/// device is drained before it is destroyed. Callers of the eviction methods must have
/// drained it themselves.
pub struct FrameBufferCache {
    device: Arc<dyn GpuDevice>,
    entries: HashMap<TargetKey, CachedFrameBuffer>,
}

impl FrameBufferCache {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            entries: HashMap::new(),
        }
    }

    pub fn get(
        &mut self,
        views: &[vk::ImageView],
        pass: vk::RenderPass,
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        let key = TargetKey {
            views: views.to_vec(),
            pass,
        };
        if let Some(entry) = self.entries.get(&key) {
            if entry.extent == extent {
                return Ok(entry.framebuffer);
            }
        }

        let framebuffer = self.device.create_framebuffer(pass, views, extent)?;
        if let Some(stale) = self.entries.insert(
            key,
            CachedFrameBuffer {
                framebuffer,
                extent,
            },
        ) {
            self.device.wait_idle()?;
            self.device.destroy_framebuffer(stale.framebuffer);
        }
        log::trace!(
            "Framebuffer created for {} attachments at {}x{}",
            views.len(),
            extent.width,
            extent.height
        );
        Ok(framebuffer)
    }

    /// Destroys every framebuffer that references one of `views`.
    pub fn invalidate_views(&mut self, views: &[vk::ImageView]) {
        self.evict(|key, _| key.views.iter().any(|v| views.contains(v)));
    }

    /// Destroys every framebuffer whose size differs from `extent`.
    pub fn retain_extent(&mut self, extent: vk::Extent2D) {
        self.evict(|_, entry| entry.extent != extent);
    }

    pub fn clear(&mut self) {
        self.evict(|_, _| true);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&mut self, mut stale: impl FnMut(&TargetKey, &CachedFrameBuffer) -> bool) {
        let device = &self.device;
        self.entries.retain(|key, entry| {
            if stale(key, entry) {
                device.destroy_framebuffer(entry.framebuffer);
                false
            } else {
                true
            }
        });
    }
}

impl Drop for FrameBufferCache {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;
    use crate::vulkan::{ObjectKind, RecordingDevice};

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn views(raw: &[u64]) -> Vec<vk::ImageView> {
        raw.iter().map(|&r| vk::ImageView::from_raw(r)).collect()
    }

    #[test]
    fn identical_key_returns_same_framebuffer() {
        let device = Arc::new(RecordingDevice::new());
        let mut cache = FrameBufferCache::new(device.clone());
        let pass = vk::RenderPass::from_raw(7);

        let a = cache.get(&views(&[1, 2]), pass, extent(640, 480)).unwrap();
        let b = cache.get(&views(&[1, 2]), pass, extent(640, 480)).unwrap();
        assert_eq!(a, b);
        assert_eq!(device.created(ObjectKind::Framebuffer), 1);

        // Attachment order is part of the key.
        let c = cache.get(&views(&[2, 1]), pass, extent(640, 480)).unwrap();
        assert_ne!(a, c);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn new_size_replaces_old_framebuffer() {
        let device = Arc::new(RecordingDevice::new());
        let mut cache = FrameBufferCache::new(device.clone());
        let pass = vk::RenderPass::from_raw(7);

        let small = cache.get(&views(&[1]), pass, extent(320, 240)).unwrap();
        let large = cache.get(&views(&[1]), pass, extent(1280, 720)).unwrap();
        assert_ne!(small, large);
        assert_eq!(cache.len(), 1);
        assert_eq!(device.live(ObjectKind::Framebuffer), 1);
        assert_eq!(device.wait_idle_calls(), 1);
        assert_eq!(device.framebuffer_extent(small), None);

        // Same size again is a plain lookup.
        cache.get(&views(&[1]), pass, extent(1280, 720)).unwrap();
        assert_eq!(device.wait_idle_calls(), 1);
    }

    #[test]
    fn invalidation_and_drop_release_everything() {
        let device = Arc::new(RecordingDevice::new());
        let pass = vk::RenderPass::from_raw(7);
        {
            let mut cache = FrameBufferCache::new(device.clone());
            cache.get(&views(&[1, 2]), pass, extent(64, 64)).unwrap();
            cache.get(&views(&[3]), pass, extent(64, 64)).unwrap();
            cache.get(&views(&[4]), pass, extent(32, 32)).unwrap();

            cache.invalidate_views(&views(&[2]));
            assert_eq!(cache.len(), 2);

            cache.retain_extent(extent(64, 64));
            assert_eq!(cache.len(), 1);
        }
        assert_eq!(device.live(ObjectKind::Framebuffer), 0);
    }
}
