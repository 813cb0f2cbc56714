//! Device context seam between the rendering core and the graphics API.
//!
//! Every component of the core receives an `Arc<dyn GpuDevice>` instead of reaching for a
//! global device. [`super::AshDevice`] drives a real Vulkan device through ash and vk-mem,
//! [`super::RecordingDevice`] records everything in memory so the core can be exercised
//! without a driver.

use ash::vk;

use crate::Result;

/// A buffer allocated through a [`GpuDevice`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GpuBuffer {
    pub handle: vk::Buffer,
    pub size: vk::DeviceSize,
}

/// Where a buffer lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryLocation {
    /// Device-local, filled through [`GpuDevice::upload`].
    GpuOnly,
    /// Host-visible, written directly with [`GpuDevice::write_buffer`].
    CpuToGpu,
}

#[derive(Clone, Copy, Debug)]
pub struct BufferDesc {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

/// One region of a batched upload.
#[derive(Clone, Copy, Debug)]
pub struct BufferWrite<'a> {
    pub buffer: GpuBuffer,
    pub offset: vk::DeviceSize,
    pub data: &'a [u8],
}

/// Identifies an in-flight upload. Poll it with [`GpuDevice::is_load_complete`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LoadToken(pub u64);

#[derive(Clone, Copy, Debug)]
pub struct ImageDesc {
    pub name: &'static str,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

/// An image plus its default view. Images are handed out in `GENERAL` layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

#[derive(Clone, Copy, Debug)]
pub struct ColorAttachmentDesc {
    pub format: vk::Format,
    pub load_op: vk::AttachmentLoadOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

impl ColorAttachmentDesc {
    /// Attachment that keeps its contents and stays in `GENERAL` layout, so passes can clear
    /// it through image clears and later passes can sample it.
    pub fn general(format: vk::Format) -> Self {
        Self {
            format,
            load_op: vk::AttachmentLoadOp::LOAD,
            initial_layout: vk::ImageLayout::GENERAL,
            final_layout: vk::ImageLayout::GENERAL,
        }
    }

    /// Attachment fully overwritten by the pass and handed to presentation afterwards.
    pub fn present(format: vk::Format) -> Self {
        Self {
            format,
            load_op: vk::AttachmentLoadOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RenderPassDesc {
    pub color: Vec<ColorAttachmentDesc>,
    pub depth: Option<vk::Format>,
}

/// One declared slot of a descriptor set layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutBinding {
    pub slot: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampledImage {
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
    pub layout: vk::ImageLayout,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DescriptorResource {
    StorageBuffer(GpuBuffer),
    CombinedImageSamplers(Vec<SampledImage>),
    StorageImage(vk::ImageView),
}

impl DescriptorResource {
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            DescriptorResource::StorageBuffer(_) => vk::DescriptorType::STORAGE_BUFFER,
            DescriptorResource::CombinedImageSamplers(_) => {
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            }
            DescriptorResource::StorageImage(_) => vk::DescriptorType::STORAGE_IMAGE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub array_element: u32,
    pub resource: DescriptorResource,
}

/// Per-vertex attribute stream. Each attribute reads from its own binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: vk::Format,
    pub stride: u32,
}

#[derive(Clone, Debug)]
pub struct GraphicsPipelineDesc {
    pub layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
    pub vertex_attributes: Vec<VertexAttribute>,
    pub depth_test: bool,
    pub blend: bool,
    pub color_attachment_count: u32,
}

/// Resource creation and command recording required by the rendering core.
///
/// Handles are plain `ash::vk` handles; ownership rules are the caller's, exactly as with
/// a raw `ash::Device`. Recording calls take the command buffer returned by
/// [`GpuDevice::begin_frame`].
pub trait GpuDevice {
    // Buffers and uploads
    fn create_buffer(&self, desc: &BufferDesc) -> Result<GpuBuffer>;
    fn destroy_buffer(&self, buffer: GpuBuffer);
    /// Writes into a [`MemoryLocation::CpuToGpu`] buffer.
    fn write_buffer(&self, buffer: &GpuBuffer, offset: vk::DeviceSize, data: &[u8]) -> Result<()>;
    /// Streams all regions to device-local memory in a single submission.
    fn upload(&self, writes: &[BufferWrite<'_>]) -> Result<LoadToken>;
    fn is_load_complete(&self, token: LoadToken) -> Result<bool>;

    // Images
    fn create_image(&self, desc: &ImageDesc) -> Result<GpuImage>;
    fn destroy_image(&self, image: &GpuImage);
    fn create_sampler(&self) -> Result<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    // Passes and framebuffers
    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<vk::RenderPass>;
    fn destroy_render_pass(&self, pass: vk::RenderPass);
    fn create_framebuffer(
        &self,
        pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    // Descriptors
    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> Result<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>>;
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);

    // Pipelines
    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_graphics_pipeline(
        &self,
        cache: vk::PipelineCache,
        desc: &GraphicsPipelineDesc,
        vertex: vk::ShaderModule,
        fragment: vk::ShaderModule,
    ) -> Result<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);
    fn create_pipeline_cache(&self, initial_data: &[u8]) -> Result<vk::PipelineCache>;
    fn pipeline_cache_data(&self, cache: vk::PipelineCache) -> Result<Vec<u8>>;
    fn destroy_pipeline_cache(&self, cache: vk::PipelineCache);

    // Frames
    /// Number of frame slots `begin_frame` / `submit_frame` accept, i.e. frames in flight.
    fn frame_slots(&self) -> usize;
    /// Waits until the frame slot's previous submission retired, then opens its command
    /// buffer for recording.
    fn begin_frame(&self, frame_index: usize) -> Result<vk::CommandBuffer>;
    fn submit_frame(
        &self,
        frame_index: usize,
        cmd: vk::CommandBuffer,
        wait: Option<vk::Semaphore>,
        signal: Option<vk::Semaphore>,
    ) -> Result<()>;
    fn wait_idle(&self) -> Result<()>;

    // Recording
    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline);
    fn cmd_bind_vertex_buffers(
        &self,
        cmd: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[(vk::Buffer, vk::DeviceSize)],
    );
    fn cmd_bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    );
    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );
    fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );
    fn cmd_draw_indexed(
        &self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
    );
    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer);
    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, extent: vk::Extent2D);
    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, extent: vk::Extent2D);
    fn cmd_clear_color_image(&self, cmd: vk::CommandBuffer, image: vk::Image, color: [f32; 4]);
    fn cmd_clear_depth_image(&self, cmd: vk::CommandBuffer, image: vk::Image, depth: f32);
    fn cmd_memory_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    );
}
