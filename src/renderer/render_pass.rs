use std::sync::Arc;

use ash::vk;
use glam::Vec4;

use crate::vulkan::{FrameBufferCache, GpuDevice, GpuImage, RenderPassDesc};
use crate::{AshError, Result};

/// An attachment as seen by a pass: the image (for clears) and the view (for framebuffers).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderTarget {
    pub image: vk::Image,
    pub view: vk::ImageView,
}

impl From<&GpuImage> for RenderTarget {
    fn from(image: &GpuImage) -> Self {
        Self {
            image: image.image,
            view: image.view,
        }
    }
}

/// Begin/end wrapper around a Vulkan render pass.
///
/// Clears are issued as image clears before the pass begins, and only when enabled: passes
/// that share targets within a frame leave them alone by default.
///
/// The framebuffer is looked up in the cache on every `begin`, never held across frames,
/// since the cache may destroy it on resize or view release.
pub struct RenderPass {
    device: Arc<dyn GpuDevice>,
    pass: vk::RenderPass,
    color_targets: Vec<RenderTarget>,
    depth_target: Option<RenderTarget>,
    clear_colors: Option<Vec<Vec4>>,
    clear_depth: Option<f32>,
}

impl RenderPass {
    /// Takes ownership of `pass`.
    pub fn new(device: Arc<dyn GpuDevice>, pass: vk::RenderPass) -> Self {
        Self {
            device,
            pass,
            color_targets: Vec::new(),
            depth_target: None,
            clear_colors: None,
            clear_depth: None,
        }
    }

    pub fn create(device: Arc<dyn GpuDevice>, desc: &RenderPassDesc) -> Result<Self> {
        let pass = device.create_render_pass(desc)?;
        Ok(Self::new(device, pass))
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.pass
    }

    pub fn set_color_target(&mut self, target: RenderTarget) {
        self.set_color_targets(&[target]);
    }

    pub fn set_color_targets(&mut self, targets: &[RenderTarget]) {
        self.color_targets = targets.to_vec();
    }

    pub fn set_depth_target(&mut self, target: Option<RenderTarget>) {
        self.depth_target = target;
    }

    pub fn color_targets(&self) -> &[RenderTarget] {
        &self.color_targets
    }

    /// Enables clearing; colour `i` clears colour target `i`.
    pub fn set_clear_color(&mut self, colors: &[Vec4]) {
        self.clear_colors = Some(colors.to_vec());
    }

    pub fn set_clear_depth(&mut self, depth: f32) {
        self.clear_depth = Some(depth);
    }

    pub fn reset_clear_color(&mut self) {
        self.clear_colors = None;
    }

    pub fn reset_clear_depth(&mut self) {
        self.clear_depth = None;
    }

    fn views(&self) -> Vec<vk::ImageView> {
        self.color_targets
            .iter()
            .chain(self.depth_target.iter())
            .map(|t| t.view)
            .collect()
    }

    pub fn begin(
        &self,
        cache: &mut FrameBufferCache,
        cmd: vk::CommandBuffer,
        size: vk::Extent2D,
    ) -> Result<()> {
        if let Some(colors) = &self.clear_colors {
            if colors.len() < self.color_targets.len() {
                return Err(AshError::ClearColorMismatch {
                    colors: colors.len(),
                    targets: self.color_targets.len(),
                });
            }
        }
        if self.clear_depth.is_some() && self.depth_target.is_none() {
            return Err(AshError::MissingDepthTarget);
        }

        let framebuffer = cache.get(&self.views(), self.pass, size)?;

        if let Some(colors) = &self.clear_colors {
            for (target, color) in self.color_targets.iter().zip(colors) {
                self.device
                    .cmd_clear_color_image(cmd, target.image, color.to_array());
            }
        }
        if let (Some(depth), Some(target)) = (self.clear_depth, self.depth_target) {
            self.device.cmd_clear_depth_image(cmd, target.image, depth);
        }

        self.device
            .cmd_begin_render_pass(cmd, self.pass, framebuffer, size);
        self.device.cmd_set_viewport(cmd, size);
        self.device.cmd_set_scissor(cmd, size);
        Ok(())
    }

    pub fn end(&self, cmd: vk::CommandBuffer) {
        self.device.cmd_end_render_pass(cmd);
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        self.device.destroy_render_pass(self.pass);
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;
    use crate::vulkan::{ObjectKind, RecordedCommand, RecordingDevice};

    fn target(raw: u64) -> RenderTarget {
        RenderTarget {
            image: vk::Image::from_raw(raw),
            view: vk::ImageView::from_raw(raw + 1),
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn setup() -> (Arc<RecordingDevice>, FrameBufferCache, RenderPass) {
        let device = Arc::new(RecordingDevice::new());
        let cache = FrameBufferCache::new(device.clone());
        let pass = RenderPass::create(device.clone(), &RenderPassDesc::default()).unwrap();
        (device, cache, pass)
    }

    #[test]
    fn more_clear_colors_than_targets_is_fine() {
        let (_device, mut cache, mut pass) = setup();
        pass.set_color_target(target(100));
        pass.set_clear_color(&[Vec4::ZERO, Vec4::ONE]);
        pass.begin(&mut cache, vk::CommandBuffer::null(), extent(64, 64))
            .unwrap();
    }

    #[test]
    fn fewer_clear_colors_than_targets_fails() {
        let (device, mut cache, mut pass) = setup();
        pass.set_color_targets(&[target(100), target(200)]);
        pass.set_clear_color(&[Vec4::ZERO]);

        let result = pass.begin(&mut cache, vk::CommandBuffer::null(), extent(64, 64));
        assert!(matches!(
            result,
            Err(AshError::ClearColorMismatch { colors: 1, targets: 2 })
        ));
        assert!(device.commands().is_empty());

        // Without clearing the colour count is irrelevant.
        pass.reset_clear_color();
        pass.begin(&mut cache, vk::CommandBuffer::null(), extent(64, 64))
            .unwrap();
    }

    #[test]
    fn depth_clear_needs_depth_target() {
        let (_device, mut cache, mut pass) = setup();
        pass.set_color_target(target(100));
        pass.set_clear_depth(0.0);
        assert!(matches!(
            pass.begin(&mut cache, vk::CommandBuffer::null(), extent(8, 8)),
            Err(AshError::MissingDepthTarget)
        ));
        pass.set_depth_target(Some(target(300)));
        pass.begin(&mut cache, vk::CommandBuffer::null(), extent(8, 8))
            .unwrap();
    }

    #[test]
    fn begin_clears_then_sets_viewport() {
        let (device, mut cache, mut pass) = setup();
        pass.set_color_targets(&[target(100), target(200)]);
        pass.set_depth_target(Some(target(300)));
        pass.set_clear_color(&[Vec4::X, Vec4::Y]);
        pass.set_clear_depth(0.0);
        let size = extent(320, 200);

        pass.begin(&mut cache, vk::CommandBuffer::null(), size).unwrap();
        pass.end(vk::CommandBuffer::null());

        let commands = device.take_commands();
        assert_eq!(commands.len(), 7);
        assert_eq!(
            commands[0],
            RecordedCommand::ClearColorImage {
                image: vk::Image::from_raw(100),
                color: [1.0, 0.0, 0.0, 0.0],
            }
        );
        assert!(matches!(commands[2], RecordedCommand::ClearDepthImage { depth, .. } if depth == 0.0));
        assert!(matches!(commands[3], RecordedCommand::BeginRenderPass { extent: e, .. } if e == size));
        assert_eq!(commands[4], RecordedCommand::SetViewport(size));
        assert_eq!(commands[5], RecordedCommand::SetScissor(size));
        assert_eq!(commands[6], RecordedCommand::EndRenderPass);
    }

    #[test]
    fn framebuffer_is_reused_until_targets_change() {
        let (device, mut cache, mut pass) = setup();
        pass.set_color_target(target(100));
        for _ in 0..3 {
            pass.begin(&mut cache, vk::CommandBuffer::null(), extent(64, 64))
                .unwrap();
        }
        assert_eq!(device.created(ObjectKind::Framebuffer), 1);

        // Setting identical targets does not invalidate.
        pass.set_color_target(target(100));
        pass.begin(&mut cache, vk::CommandBuffer::null(), extent(64, 64))
            .unwrap();
        assert_eq!(device.created(ObjectKind::Framebuffer), 1);

        pass.set_color_target(target(500));
        pass.begin(&mut cache, vk::CommandBuffer::null(), extent(64, 64))
            .unwrap();
        assert_eq!(device.created(ObjectKind::Framebuffer), 2);
    }

    #[test]
    fn resize_recreates_exactly_one_framebuffer() {
        let (device, mut cache, mut pass) = setup();
        let old = [target(100), target(200)];
        pass.set_color_targets(&old);
        pass.begin(&mut cache, vk::CommandBuffer::null(), extent(640, 480))
            .unwrap();

        // Render targets are recreated at the new size.
        cache.invalidate_views(&old.iter().map(|t| t.view).collect::<Vec<_>>());
        cache.retain_extent(extent(1024, 768));
        assert_eq!(device.live(ObjectKind::Framebuffer), 0);
        pass.set_color_targets(&[target(600), target(700)]);

        let before = device.created(ObjectKind::Framebuffer);
        pass.begin(&mut cache, vk::CommandBuffer::null(), extent(1024, 768))
            .unwrap();
        assert_eq!(device.created(ObjectKind::Framebuffer), before + 1);
        assert_eq!(device.live(ObjectKind::Framebuffer), 1);

        let begun = last_begun_framebuffer(&device);
        assert_eq!(device.framebuffer_extent(begun), Some(extent(1024, 768)));
    }

    fn last_begun_framebuffer(device: &RecordingDevice) -> vk::Framebuffer {
        device
            .commands()
            .into_iter()
            .filter_map(|c| match c {
                RecordedCommand::BeginRenderPass { framebuffer, .. } => Some(framebuffer),
                _ => None,
            })
            .last()
            .unwrap()
    }

    #[test]
    fn begin_after_view_release_uses_live_framebuffer() {
        let (device, mut cache, mut pass) = setup();
        let swapchain = target(100);
        pass.set_color_target(swapchain);
        pass.begin(&mut cache, vk::CommandBuffer::null(), extent(64, 64))
            .unwrap();

        cache.invalidate_views(&[swapchain.view]);
        assert_eq!(device.live(ObjectKind::Framebuffer), 0);

        pass.begin(&mut cache, vk::CommandBuffer::null(), extent(64, 64))
            .unwrap();
        let begun = last_begun_framebuffer(&device);
        assert_eq!(device.framebuffer_extent(begun), Some(extent(64, 64)));
    }

    #[test]
    fn begin_after_extent_eviction_uses_live_framebuffer() {
        let (device, mut cache, mut pass) = setup();
        pass.set_color_target(target(100));
        pass.begin(&mut cache, vk::CommandBuffer::null(), extent(640, 480))
            .unwrap();

        // The window grew but this target is still at the old size.
        cache.retain_extent(extent(1024, 768));
        pass.begin(&mut cache, vk::CommandBuffer::null(), extent(640, 480))
            .unwrap();
        let begun = last_begun_framebuffer(&device);
        assert_eq!(device.framebuffer_extent(begun), Some(extent(640, 480)));
        assert_eq!(device.live(ObjectKind::Framebuffer), 1);
    }

    #[test]
    fn drop_destroys_render_pass() {
        let (device, _cache, pass) = setup();
        assert_eq!(device.live(ObjectKind::RenderPass), 1);
        drop(pass);
        assert_eq!(device.live(ObjectKind::RenderPass), 0);
    }
}
