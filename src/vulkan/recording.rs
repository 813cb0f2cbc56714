//! In-memory [`GpuDevice`] used to drive the core without a Vulkan driver.

use std::collections::HashMap;

use ash::vk::{self, Handle};
use parking_lot::Mutex;

use super::device::{
    BufferDesc, BufferWrite, DescriptorWrite, GpuBuffer, GpuDevice, GpuImage,
    GraphicsPipelineDesc, ImageDesc, LayoutBinding, LoadToken, RenderPassDesc,
};
use crate::{AshError, Result};

/// Object categories tracked by [`RecordingDevice`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Buffer,
    Image,
    Sampler,
    RenderPass,
    Framebuffer,
    DescriptorSetLayout,
    DescriptorPool,
    ShaderModule,
    PipelineLayout,
    Pipeline,
    PipelineCache,
}

/// A command captured by [`RecordingDevice`].
#[derive(Clone, Debug, PartialEq)]
pub enum RecordedCommand {
    BindPipeline(vk::Pipeline),
    BindVertexBuffers {
        first_binding: u32,
        buffers: Vec<(vk::Buffer, vk::DeviceSize)>,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        index_type: vk::IndexType,
    },
    BindDescriptorSets {
        layout: vk::PipelineLayout,
        sets: Vec<vk::DescriptorSet>,
    },
    PushConstants {
        layout: vk::PipelineLayout,
        offset: u32,
        data: Vec<u8>,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    BeginRenderPass {
        pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
    },
    EndRenderPass,
    SetViewport(vk::Extent2D),
    SetScissor(vk::Extent2D),
    ClearColorImage {
        image: vk::Image,
        color: [f32; 4],
    },
    ClearDepthImage {
        image: vk::Image,
        depth: f32,
    },
    MemoryBarrier,
}

#[derive(Default)]
struct RecordingState {
    next_handle: u64,
    created: HashMap<ObjectKind, usize>,
    destroyed: HashMap<ObjectKind, usize>,
    buffer_contents: HashMap<vk::Buffer, Vec<u8>>,
    commands: Vec<RecordedCommand>,
    descriptor_writes: Vec<DescriptorWrite>,
    descriptor_update_calls: usize,
    framebuffer_extents: HashMap<vk::Framebuffer, vk::Extent2D>,
    uploads: usize,
    submitted_frames: usize,
    wait_idle_calls: usize,
    fail_pipelines: bool,
    frame_slots: Option<usize>,
}

impl RecordingState {
    fn next_raw(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn create<H: Handle>(&mut self, kind: ObjectKind) -> H {
        *self.created.entry(kind).or_default() += 1;
        H::from_raw(self.next_raw())
    }

    fn destroy(&mut self, kind: ObjectKind) {
        *self.destroyed.entry(kind).or_default() += 1;
    }
}

/// Records every call it receives and fabricates unique handles.
///
/// Uploads and host writes are mirrored into per-buffer byte vectors that tests can inspect
/// through [`RecordingDevice::buffer_contents`].
#[derive(Default)]
pub struct RecordingDevice {
    state: Mutex<RecordingState>,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame slots reported to the renderer; two unless overridden.
    pub fn with_frame_slots(slots: usize) -> Self {
        let device = Self::default();
        device.state.lock().frame_slots = Some(slots);
        device
    }

    /// Makes every subsequent `create_graphics_pipeline` call fail (or succeed again).
    pub fn set_fail_pipelines(&self, fail: bool) {
        self.state.lock().fail_pipelines = fail;
    }

    pub fn created(&self, kind: ObjectKind) -> usize {
        self.state.lock().created.get(&kind).copied().unwrap_or(0)
    }

    pub fn destroyed(&self, kind: ObjectKind) -> usize {
        self.state.lock().destroyed.get(&kind).copied().unwrap_or(0)
    }

    pub fn live(&self, kind: ObjectKind) -> usize {
        self.created(kind).saturating_sub(self.destroyed(kind))
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.state.lock().commands.clone()
    }

    /// Returns and clears the recorded command stream.
    pub fn take_commands(&self) -> Vec<RecordedCommand> {
        std::mem::take(&mut self.state.lock().commands)
    }

    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state.lock().buffer_contents.get(&buffer).cloned()
    }

    pub fn descriptor_writes(&self) -> Vec<DescriptorWrite> {
        self.state.lock().descriptor_writes.clone()
    }

    pub fn descriptor_update_calls(&self) -> usize {
        self.state.lock().descriptor_update_calls
    }

    pub fn framebuffer_extent(&self, framebuffer: vk::Framebuffer) -> Option<vk::Extent2D> {
        self.state.lock().framebuffer_extents.get(&framebuffer).copied()
    }

    pub fn uploads(&self) -> usize {
        self.state.lock().uploads
    }

    pub fn submitted_frames(&self) -> usize {
        self.state.lock().submitted_frames
    }

    pub fn wait_idle_calls(&self) -> usize {
        self.state.lock().wait_idle_calls
    }

    fn record(&self, command: RecordedCommand) {
        self.state.lock().commands.push(command);
    }
}

fn write_bytes(target: &mut Vec<u8>, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
    let start = offset as usize;
    let end = start + data.len();
    if end > target.len() {
        return Err(AshError::VulkanError(format!(
            "write of {} bytes at offset {start} overflows buffer of {} bytes",
            data.len(),
            target.len()
        )));
    }
    target[start..end].copy_from_slice(data);
    Ok(())
}

impl GpuDevice for RecordingDevice {
    fn create_buffer(&self, desc: &BufferDesc) -> Result<GpuBuffer> {
        let mut state = self.state.lock();
        let handle: vk::Buffer = state.create(ObjectKind::Buffer);
        state
            .buffer_contents
            .insert(handle, vec![0; desc.size as usize]);
        Ok(GpuBuffer {
            handle,
            size: desc.size,
        })
    }

    fn destroy_buffer(&self, buffer: GpuBuffer) {
        let mut state = self.state.lock();
        state.buffer_contents.remove(&buffer.handle);
        state.destroy(ObjectKind::Buffer);
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let target = state
            .buffer_contents
            .get_mut(&buffer.handle)
            .ok_or_else(|| AshError::VulkanError("write to unknown buffer".to_string()))?;
        write_bytes(target, offset, data)
    }

    fn upload(&self, writes: &[BufferWrite<'_>]) -> Result<LoadToken> {
        let mut state = self.state.lock();
        for write in writes {
            let target = state
                .buffer_contents
                .get_mut(&write.buffer.handle)
                .ok_or_else(|| AshError::VulkanError("upload to unknown buffer".to_string()))?;
            write_bytes(target, write.offset, write.data)?;
        }
        state.uploads += 1;
        Ok(LoadToken(state.uploads as u64))
    }

    fn is_load_complete(&self, _token: LoadToken) -> Result<bool> {
        Ok(true)
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<GpuImage> {
        let mut state = self.state.lock();
        let image = state.create(ObjectKind::Image);
        let view = vk::ImageView::from_raw(state.next_raw());
        Ok(GpuImage {
            image,
            view,
            format: desc.format,
            extent: desc.extent,
        })
    }

    fn destroy_image(&self, _image: &GpuImage) {
        self.state.lock().destroy(ObjectKind::Image);
    }

    fn create_sampler(&self) -> Result<vk::Sampler> {
        Ok(self.state.lock().create(ObjectKind::Sampler))
    }

    fn destroy_sampler(&self, _sampler: vk::Sampler) {
        self.state.lock().destroy(ObjectKind::Sampler);
    }

    fn create_render_pass(&self, _desc: &RenderPassDesc) -> Result<vk::RenderPass> {
        Ok(self.state.lock().create(ObjectKind::RenderPass))
    }

    fn destroy_render_pass(&self, _pass: vk::RenderPass) {
        self.state.lock().destroy(ObjectKind::RenderPass);
    }

    fn create_framebuffer(
        &self,
        _pass: vk::RenderPass,
        _attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        let mut state = self.state.lock();
        let framebuffer = state.create(ObjectKind::Framebuffer);
        state.framebuffer_extents.insert(framebuffer, extent);
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut state = self.state.lock();
        state.framebuffer_extents.remove(&framebuffer);
        state.destroy(ObjectKind::Framebuffer);
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[LayoutBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        Ok(self.state.lock().create(ObjectKind::DescriptorSetLayout))
    }

    fn destroy_descriptor_set_layout(&self, _layout: vk::DescriptorSetLayout) {
        self.state.lock().destroy(ObjectKind::DescriptorSetLayout);
    }

    fn create_descriptor_pool(
        &self,
        _max_sets: u32,
        _sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        Ok(self.state.lock().create(ObjectKind::DescriptorPool))
    }

    fn destroy_descriptor_pool(&self, _pool: vk::DescriptorPool) {
        self.state.lock().destroy(ObjectKind::DescriptorPool);
    }

    fn allocate_descriptor_sets(
        &self,
        _pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let mut state = self.state.lock();
        Ok(layouts
            .iter()
            .map(|_| vk::DescriptorSet::from_raw(state.next_raw()))
            .collect())
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let mut state = self.state.lock();
        state.descriptor_update_calls += 1;
        state.descriptor_writes.extend_from_slice(writes);
    }

    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule> {
        if code.is_empty() {
            return Err(AshError::VulkanError("empty SPIR-V module".to_string()));
        }
        Ok(self.state.lock().create(ObjectKind::ShaderModule))
    }

    fn destroy_shader_module(&self, _module: vk::ShaderModule) {
        self.state.lock().destroy(ObjectKind::ShaderModule);
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constants: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        Ok(self.state.lock().create(ObjectKind::PipelineLayout))
    }

    fn destroy_pipeline_layout(&self, _layout: vk::PipelineLayout) {
        self.state.lock().destroy(ObjectKind::PipelineLayout);
    }

    fn create_graphics_pipeline(
        &self,
        _cache: vk::PipelineCache,
        _desc: &GraphicsPipelineDesc,
        _vertex: vk::ShaderModule,
        _fragment: vk::ShaderModule,
    ) -> Result<vk::Pipeline> {
        let mut state = self.state.lock();
        if state.fail_pipelines {
            return Err(AshError::PipelineCreation(
                "pipeline creation disabled on recording device".to_string(),
            ));
        }
        Ok(state.create(ObjectKind::Pipeline))
    }

    fn destroy_pipeline(&self, _pipeline: vk::Pipeline) {
        self.state.lock().destroy(ObjectKind::Pipeline);
    }

    fn create_pipeline_cache(&self, _initial_data: &[u8]) -> Result<vk::PipelineCache> {
        Ok(self.state.lock().create(ObjectKind::PipelineCache))
    }

    fn pipeline_cache_data(&self, _cache: vk::PipelineCache) -> Result<Vec<u8>> {
        Ok(b"recorded-cache".to_vec())
    }

    fn destroy_pipeline_cache(&self, _cache: vk::PipelineCache) {
        self.state.lock().destroy(ObjectKind::PipelineCache);
    }

    fn frame_slots(&self) -> usize {
        self.state.lock().frame_slots.unwrap_or(2)
    }

    fn begin_frame(&self, frame_index: usize) -> Result<vk::CommandBuffer> {
        let slots = self.frame_slots();
        if frame_index >= slots {
            return Err(AshError::VulkanError(format!(
                "No frame slot {frame_index} ({slots} configured)"
            )));
        }
        Ok(vk::CommandBuffer::from_raw(0x1000 + frame_index as u64))
    }

    fn submit_frame(
        &self,
        _frame_index: usize,
        _cmd: vk::CommandBuffer,
        _wait: Option<vk::Semaphore>,
        _signal: Option<vk::Semaphore>,
    ) -> Result<()> {
        self.state.lock().submitted_frames += 1;
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        self.state.lock().wait_idle_calls += 1;
        Ok(())
    }

    fn cmd_bind_pipeline(&self, _cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.record(RecordedCommand::BindPipeline(pipeline));
    }

    fn cmd_bind_vertex_buffers(
        &self,
        _cmd: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[(vk::Buffer, vk::DeviceSize)],
    ) {
        self.record(RecordedCommand::BindVertexBuffers {
            first_binding,
            buffers: buffers.to_vec(),
        });
    }

    fn cmd_bind_index_buffer(
        &self,
        _cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        _offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        self.record(RecordedCommand::BindIndexBuffer { buffer, index_type });
    }

    fn cmd_bind_descriptor_sets(
        &self,
        _cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        _first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.record(RecordedCommand::BindDescriptorSets {
            layout,
            sets: sets.to_vec(),
        });
    }

    fn cmd_push_constants(
        &self,
        _cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        _stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        self.record(RecordedCommand::PushConstants {
            layout,
            offset,
            data: data.to_vec(),
        });
    }

    fn cmd_draw_indexed(
        &self,
        _cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.record(RecordedCommand::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
    }

    fn cmd_draw(
        &self,
        _cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.record(RecordedCommand::Draw {
            vertex_count,
            instance_count,
        });
    }

    fn cmd_begin_render_pass(
        &self,
        _cmd: vk::CommandBuffer,
        pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
    ) {
        self.record(RecordedCommand::BeginRenderPass {
            pass,
            framebuffer,
            extent,
        });
    }

    fn cmd_end_render_pass(&self, _cmd: vk::CommandBuffer) {
        self.record(RecordedCommand::EndRenderPass);
    }

    fn cmd_set_viewport(&self, _cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        self.record(RecordedCommand::SetViewport(extent));
    }

    fn cmd_set_scissor(&self, _cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        self.record(RecordedCommand::SetScissor(extent));
    }

    fn cmd_clear_color_image(&self, _cmd: vk::CommandBuffer, image: vk::Image, color: [f32; 4]) {
        self.record(RecordedCommand::ClearColorImage { image, color });
    }

    fn cmd_clear_depth_image(&self, _cmd: vk::CommandBuffer, image: vk::Image, depth: f32) {
        self.record(RecordedCommand::ClearDepthImage { image, depth });
    }

    fn cmd_memory_barrier(
        &self,
        _cmd: vk::CommandBuffer,
        _src_stage: vk::PipelineStageFlags,
        _dst_stage: vk::PipelineStageFlags,
        _src_access: vk::AccessFlags,
        _dst_access: vk::AccessFlags,
    ) {
        self.record(RecordedCommand::MemoryBarrier);
    }
}
