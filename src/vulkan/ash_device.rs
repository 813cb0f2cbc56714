use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use vk_mem::Alloc;

use super::device::{
    BufferDesc, BufferWrite, DescriptorResource, DescriptorWrite, GpuBuffer, GpuDevice, GpuImage,
    GraphicsPipelineDesc, ImageDesc, LayoutBinding, LoadToken, MemoryLocation, RenderPassDesc,
};
use crate::{AshError, Result};

const SHADER_ENTRY: &std::ffi::CStr = c"main";

struct FrameSlot {
    command_buffer: vk::CommandBuffer,
    in_flight: vk::Fence,
}

struct PendingTransfer {
    token: u64,
    fence: vk::Fence,
    command_buffer: vk::CommandBuffer,
    staging: vk::Buffer,
}

#[derive(Default)]
struct TransferState {
    next_token: u64,
    pending: Vec<PendingTransfer>,
}

/// [`GpuDevice`] backed by a host-created `ash::Device`, `vk_mem::Allocator` and queue.
///
/// The host keeps ownership of instance, device and allocator creation; this type owns the
/// command pool, per-frame command buffers and fences, and every allocation it hands out.
pub struct AshDevice {
    device: Arc<ash::Device>,
    allocator: Arc<vk_mem::Allocator>,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    frames: Vec<FrameSlot>,
    buffer_allocations: Mutex<HashMap<vk::Buffer, vk_mem::Allocation>>,
    image_allocations: Mutex<HashMap<vk::Image, vk_mem::Allocation>>,
    transfers: Mutex<TransferState>,
}

impl AshDevice {
    pub fn new(
        device: Arc<ash::Device>,
        allocator: Arc<vk_mem::Allocator>,
        queue: vk::Queue,
        queue_family_index: u32,
        frames_in_flight: usize,
    ) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .map_err(|e| AshError::VulkanError(format!("Failed to create command pool: {e}")))?
        };

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(frames_in_flight.max(1) as u32);
        let command_buffers = unsafe {
            device.allocate_command_buffers(&alloc_info).map_err(|e| {
                AshError::VulkanError(format!("Failed to allocate frame command buffers: {e}"))
            })?
        };

        let mut frames = Vec::with_capacity(command_buffers.len());
        for command_buffer in command_buffers {
            let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
            let in_flight = unsafe { device.create_fence(&fence_info, None)? };
            frames.push(FrameSlot {
                command_buffer,
                in_flight,
            });
        }

        log::info!(
            "Device context ready ({} frame slots)",
            frames.len()
        );

        Ok(Self {
            device,
            allocator,
            queue,
            command_pool,
            frames,
            buffer_allocations: Mutex::new(HashMap::new()),
            image_allocations: Mutex::new(HashMap::new()),
            transfers: Mutex::new(TransferState::default()),
        })
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    fn frame(&self, frame_index: usize) -> Result<&FrameSlot> {
        self.frames.get(frame_index).ok_or_else(|| {
            AshError::VulkanError(format!(
                "No frame slot {frame_index} ({} configured)",
                self.frames.len()
            ))
        })
    }

    fn allocate_one_shot(&self) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info)? }
            .into_iter()
            .next()
            .ok_or_else(|| AshError::VulkanError("No command buffer allocated".to_string()))?;
        let begin = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd, &begin)? };
        Ok(cmd)
    }

    fn submit_one_shot(&self, cmd: vk::CommandBuffer) -> Result<vk::Fence> {
        unsafe {
            self.device.end_command_buffer(cmd)?;
            let fence = self
                .device
                .create_fence(&vk::FenceCreateInfo::default(), None)?;
            let cmds = [cmd];
            let submit = vk::SubmitInfo::default().command_buffers(&cmds);
            self.device.queue_submit(self.queue, &[submit], fence)?;
            Ok(fence)
        }
    }

    /// Records `record` into a one-shot command buffer and blocks until it has executed.
    fn immediate_submit(&self, record: impl FnOnce(vk::CommandBuffer)) -> Result<()> {
        let cmd = self.allocate_one_shot()?;
        record(cmd);
        let fence = self.submit_one_shot(cmd)?;
        unsafe {
            let waited = self.device.wait_for_fences(&[fence], true, u64::MAX);
            self.device.destroy_fence(fence, None);
            self.device.free_command_buffers(self.command_pool, &[cmd]);
            waited?;
        }
        Ok(())
    }

    fn retire_transfer(&self, transfer: PendingTransfer) {
        unsafe {
            self.device.destroy_fence(transfer.fence, None);
            self.device
                .free_command_buffers(self.command_pool, &[transfer.command_buffer]);
        }
        if let Some(mut allocation) = self.buffer_allocations.lock().remove(&transfer.staging) {
            unsafe {
                self.allocator
                    .destroy_buffer(transfer.staging, &mut allocation)
            };
        }
    }

    fn allocate_buffer(&self, desc: &BufferDesc) -> Result<GpuBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size.max(1))
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let create_info = match desc.location {
            MemoryLocation::GpuOnly => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                ..Default::default()
            },
            MemoryLocation::CpuToGpu => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::Auto,
                flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                ..Default::default()
            },
        };
        let (handle, allocation) = unsafe {
            self.allocator
                .create_buffer(&buffer_info, &create_info)
                .map_err(|e| AshError::VulkanError(format!("Failed to create buffer: {e}")))?
        };
        self.buffer_allocations.lock().insert(handle, allocation);
        Ok(GpuBuffer {
            handle,
            size: desc.size,
        })
    }
}

impl GpuDevice for AshDevice {
    fn create_buffer(&self, desc: &BufferDesc) -> Result<GpuBuffer> {
        let usage = match desc.location {
            MemoryLocation::GpuOnly => desc.usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::CpuToGpu => desc.usage,
        };
        self.allocate_buffer(&BufferDesc { usage, ..*desc })
    }

    fn destroy_buffer(&self, buffer: GpuBuffer) {
        if let Some(mut allocation) = self.buffer_allocations.lock().remove(&buffer.handle) {
            unsafe { self.allocator.destroy_buffer(buffer.handle, &mut allocation) };
        }
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        if offset + data.len() as vk::DeviceSize > buffer.size {
            return Err(AshError::VulkanError(format!(
                "Write of {} bytes at offset {offset} overflows buffer of {} bytes",
                data.len(),
                buffer.size
            )));
        }
        let mut allocations = self.buffer_allocations.lock();
        let allocation = allocations
            .get_mut(&buffer.handle)
            .ok_or_else(|| AshError::VulkanError("Write to unknown buffer".to_string()))?;
        unsafe {
            let mapped = self.allocator.map_memory(allocation)?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.add(offset as usize), data.len());
            self.allocator.unmap_memory(allocation);
        }
        // No-op on HOST_COHERENT memory; required for the GPU to see the write otherwise.
        self.allocator
            .flush_allocation(allocation, offset, data.len() as vk::DeviceSize)?;
        Ok(())
    }

    fn upload(&self, writes: &[BufferWrite<'_>]) -> Result<LoadToken> {
        let total: vk::DeviceSize = writes.iter().map(|w| w.data.len() as vk::DeviceSize).sum();
        let staging = self.allocate_buffer(&BufferDesc {
            size: total,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            location: MemoryLocation::CpuToGpu,
        })?;

        let mut regions = Vec::with_capacity(writes.len());
        let mut cursor = 0;
        for write in writes {
            self.write_buffer(&staging, cursor, write.data)?;
            regions.push((
                write.buffer.handle,
                vk::BufferCopy {
                    src_offset: cursor,
                    dst_offset: write.offset,
                    size: write.data.len() as vk::DeviceSize,
                },
            ));
            cursor += write.data.len() as vk::DeviceSize;
        }

        let cmd = self.allocate_one_shot()?;
        for (dst, region) in regions.iter().filter(|(_, r)| r.size > 0) {
            unsafe {
                self.device
                    .cmd_copy_buffer(cmd, staging.handle, *dst, std::slice::from_ref(region))
            };
        }
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(
                vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                    | vk::AccessFlags::INDEX_READ
                    | vk::AccessFlags::SHADER_READ,
            );
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::VERTEX_INPUT | vk::PipelineStageFlags::VERTEX_SHADER,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
        let fence = self.submit_one_shot(cmd)?;

        let mut transfers = self.transfers.lock();
        transfers.next_token += 1;
        let token = transfers.next_token;
        transfers.pending.push(PendingTransfer {
            token,
            fence,
            command_buffer: cmd,
            staging: staging.handle,
        });
        log::debug!("Submitted upload #{token} ({total} bytes, {} regions)", writes.len());
        Ok(LoadToken(token))
    }

    fn is_load_complete(&self, token: LoadToken) -> Result<bool> {
        let mut transfers = self.transfers.lock();
        let Some(position) = transfers.pending.iter().position(|t| t.token == token.0) else {
            return Ok(true);
        };
        let signalled = unsafe {
            self.device
                .get_fence_status(transfers.pending[position].fence)?
        };
        if signalled {
            let transfer = transfers.pending.swap_remove(position);
            drop(transfers);
            self.retire_transfer(transfer);
        }
        Ok(signalled)
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<GpuImage> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage | vk::ImageUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let create_info = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };
        let (image, mut allocation) = unsafe {
            self.allocator
                .create_image(&image_info, &create_info)
                .map_err(|e| {
                    AshError::VulkanError(format!("Failed to create image '{}': {e}", desc.name))
                })?
        };

        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(desc.aspect)
            .level_count(1)
            .layer_count(1);
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(range);
        let view = match unsafe { self.device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                unsafe { self.allocator.destroy_image(image, &mut allocation) };
                return Err(AshError::VulkanError(format!(
                    "Failed to create view for '{}': {e}",
                    desc.name
                )));
            }
        };
        self.image_allocations.lock().insert(image, allocation);

        self.immediate_submit(|cmd| {
            let barrier = vk::ImageMemoryBarrier::default()
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::GENERAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(range)
                .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE);
            unsafe {
                self.device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                );
            }
        })?;

        log::debug!(
            "Created image '{}' {}x{} {:?}",
            desc.name,
            desc.extent.width,
            desc.extent.height,
            desc.format
        );
        Ok(GpuImage {
            image,
            view,
            format: desc.format,
            extent: desc.extent,
        })
    }

    fn destroy_image(&self, image: &GpuImage) {
        unsafe { self.device.destroy_image_view(image.view, None) };
        if let Some(mut allocation) = self.image_allocations.lock().remove(&image.image) {
            unsafe { self.allocator.destroy_image(image.image, &mut allocation) };
        }
    }

    fn create_sampler(&self) -> Result<vk::Sampler> {
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .max_lod(vk::LOD_CLAMP_NONE);
        unsafe {
            self.device
                .create_sampler(&info, None)
                .map_err(|e| AshError::VulkanError(format!("Failed to create sampler: {e}")))
        }
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<vk::RenderPass> {
        let mut attachments = Vec::with_capacity(desc.color.len() + 1);
        let mut color_refs = Vec::with_capacity(desc.color.len());
        for (i, color) in desc.color.iter().enumerate() {
            attachments.push(
                vk::AttachmentDescription::default()
                    .format(color.format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(color.load_op)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(color.initial_layout)
                    .final_layout(color.final_layout),
            );
            color_refs.push(vk::AttachmentReference {
                attachment: i as u32,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            });
        }

        let depth_ref = desc.depth.map(|format| {
            attachments.push(
                vk::AttachmentDescription::default()
                    .format(format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::LOAD)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::GENERAL)
                    .final_layout(vk::ImageLayout::GENERAL),
            );
            vk::AttachmentReference {
                attachment: desc.color.len() as u32,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            }
        });

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(depth_ref) = depth_ref.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }

        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(
                vk::PipelineStageFlags::TRANSFER
                    | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::FRAGMENT_SHADER,
            )
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .src_access_mask(
                vk::AccessFlags::TRANSFER_WRITE
                    | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_READ
                    | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );

        let subpasses = [subpass];
        let dependencies = [dependency];
        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        unsafe {
            self.device
                .create_render_pass(&info, None)
                .map_err(|e| AshError::VulkanError(format!("Failed to create render pass: {e}")))
        }
    }

    fn destroy_render_pass(&self, pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(pass, None) };
    }

    fn create_framebuffer(
        &self,
        pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        unsafe {
            self.device
                .create_framebuffer(&info, None)
                .map_err(|e| AshError::VulkanError(format!("Failed to create framebuffer: {e}")))
        }
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.slot)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.count)
                    .stage_flags(b.stages)
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        unsafe {
            self.device
                .create_descriptor_set_layout(&info, None)
                .map_err(|e| {
                    AshError::VulkanError(format!("Failed to create descriptor set layout: {e}"))
                })
        }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(sizes);
        unsafe {
            self.device
                .create_descriptor_pool(&info, None)
                .map_err(|e| {
                    AshError::VulkanError(format!("Failed to create descriptor pool: {e}"))
                })
        }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(layouts);
        unsafe {
            self.device.allocate_descriptor_sets(&info).map_err(|e| {
                AshError::VulkanError(format!("Failed to allocate descriptor sets: {e}"))
            })
        }
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        enum Info {
            Buffer([vk::DescriptorBufferInfo; 1]),
            Images(Vec<vk::DescriptorImageInfo>),
        }

        let infos: Vec<Info> = writes
            .iter()
            .map(|write| match &write.resource {
                DescriptorResource::StorageBuffer(buffer) => Info::Buffer([vk::DescriptorBufferInfo {
                    buffer: buffer.handle,
                    offset: 0,
                    range: vk::WHOLE_SIZE,
                }]),
                DescriptorResource::CombinedImageSamplers(images) => Info::Images(
                    images
                        .iter()
                        .map(|image| vk::DescriptorImageInfo {
                            sampler: image.sampler,
                            image_view: image.view,
                            image_layout: image.layout,
                        })
                        .collect(),
                ),
                DescriptorResource::StorageImage(view) => {
                    Info::Images(vec![vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: *view,
                        image_layout: vk::ImageLayout::GENERAL,
                    }])
                }
            })
            .collect();

        let vk_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .zip(&infos)
            .map(|(write, info)| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(write.set)
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element)
                    .descriptor_type(write.resource.descriptor_type());
                match info {
                    Info::Buffer(buffer) => base.buffer_info(buffer),
                    Info::Images(images) => base.image_info(images),
                }
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }

    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe {
            self.device
                .create_shader_module(&info, None)
                .map_err(|e| AshError::VulkanError(format!("Failed to create shader module: {e}")))
        }
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constants);
        unsafe {
            self.device
                .create_pipeline_layout(&info, None)
                .map_err(|e| {
                    AshError::VulkanError(format!("Failed to create pipeline layout: {e}"))
                })
        }
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_graphics_pipeline(
        &self,
        cache: vk::PipelineCache,
        desc: &GraphicsPipelineDesc,
        vertex: vk::ShaderModule,
        fragment: vk::ShaderModule,
    ) -> Result<vk::Pipeline> {
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex)
                .name(SHADER_ENTRY),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment)
                .name(SHADER_ENTRY),
        ];

        let bindings: Vec<vk::VertexInputBindingDescription> = desc
            .vertex_attributes
            .iter()
            .map(|a| vk::VertexInputBindingDescription {
                binding: a.binding,
                stride: a.stride,
                input_rate: vk::VertexInputRate::VERTEX,
            })
            .collect();
        let attributes: Vec<vk::VertexInputAttributeDescription> = desc
            .vertex_attributes
            .iter()
            .map(|a| vk::VertexInputAttributeDescription {
                location: a.location,
                binding: a.binding,
                format: a.format,
                offset: 0,
            })
            .collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        // Reverse-Z: depth is cleared to 0 and nearer fragments have larger depth.
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_test)
            .depth_compare_op(vk::CompareOp::GREATER);

        let blend_attachment = if desc.blend {
            vk::PipelineColorBlendAttachmentState::default()
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::ONE)
                .dst_color_blend_factor(vk::BlendFactor::ONE)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE)
                .alpha_blend_op(vk::BlendOp::ADD)
                .color_write_mask(vk::ColorComponentFlags::RGBA)
        } else {
            vk::PipelineColorBlendAttachmentState::default()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
        };
        let blend_attachments = vec![blend_attachment; desc.color_attachment_count as usize];
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(desc.layout)
            .render_pass(desc.render_pass)
            .subpass(0);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(cache, &[info], None)
                .map_err(|(_, e)| AshError::PipelineCreation(e.to_string()))?
        };
        pipelines
            .into_iter()
            .next()
            .ok_or_else(|| AshError::PipelineCreation("driver returned no pipeline".to_string()))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn create_pipeline_cache(&self, initial_data: &[u8]) -> Result<vk::PipelineCache> {
        let info = if initial_data.is_empty() {
            vk::PipelineCacheCreateInfo::default()
        } else {
            vk::PipelineCacheCreateInfo::default().initial_data(initial_data)
        };
        unsafe {
            self.device
                .create_pipeline_cache(&info, None)
                .map_err(|e| AshError::VulkanError(format!("Failed to create pipeline cache: {e}")))
        }
    }

    fn pipeline_cache_data(&self, cache: vk::PipelineCache) -> Result<Vec<u8>> {
        unsafe {
            self.device.get_pipeline_cache_data(cache).map_err(|e| {
                AshError::VulkanError(format!("Failed to read pipeline cache data: {e}"))
            })
        }
    }

    fn destroy_pipeline_cache(&self, cache: vk::PipelineCache) {
        unsafe { self.device.destroy_pipeline_cache(cache, None) };
    }

    fn frame_slots(&self) -> usize {
        self.frames.len()
    }

    fn begin_frame(&self, frame_index: usize) -> Result<vk::CommandBuffer> {
        let frame = self.frame(frame_index)?;
        // The fence stays signalled until `submit_frame` is about to hand it to the queue,
        // so a frame abandoned between the two never blocks its slot.
        unsafe {
            self.device
                .wait_for_fences(&[frame.in_flight], true, u64::MAX)?;
            self.device.reset_command_buffer(
                frame.command_buffer,
                vk::CommandBufferResetFlags::empty(),
            )?;
            let begin = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(frame.command_buffer, &begin)?;
        }
        Ok(frame.command_buffer)
    }

    fn submit_frame(
        &self,
        frame_index: usize,
        cmd: vk::CommandBuffer,
        wait: Option<vk::Semaphore>,
        signal: Option<vk::Semaphore>,
    ) -> Result<()> {
        let frame = self.frame(frame_index)?;
        let wait_semaphores: Vec<vk::Semaphore> = wait.into_iter().collect();
        let wait_stages = vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT; wait_semaphores.len()];
        let signal_semaphores: Vec<vk::Semaphore> = signal.into_iter().collect();
        let cmds = [cmd];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&cmds)
            .signal_semaphores(&signal_semaphores);
        unsafe {
            self.device.end_command_buffer(cmd)?;
            self.device.reset_fences(&[frame.in_flight])?;
            if let Err(e) = self
                .device
                .queue_submit(self.queue, &[submit], frame.in_flight)
            {
                // An empty submission still signals the fence once the queue drains.
                if let Err(signal_error) =
                    self.device.queue_submit(self.queue, &[], frame.in_flight)
                {
                    log::error!(
                        "Frame slot {frame_index} fence left unsignalled: {signal_error}"
                    );
                }
                return Err(AshError::VulkanError(format!("Failed to submit frame: {e}")));
            }
        }
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline)
        };
    }

    fn cmd_bind_vertex_buffers(
        &self,
        cmd: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[(vk::Buffer, vk::DeviceSize)],
    ) {
        let (handles, offsets): (Vec<vk::Buffer>, Vec<vk::DeviceSize>) =
            buffers.iter().copied().unzip();
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(cmd, first_binding, &handles, &offsets)
        };
    }

    fn cmd_bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(cmd, buffer, offset, index_type)
        };
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                first_set,
                sets,
                &[],
            )
        };
    }

    fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            self.device
                .cmd_push_constants(cmd, layout, stages, offset, data)
        };
    }

    fn cmd_draw_indexed(
        &self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                cmd,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
    }

    fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device
                .cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance)
        };
    }

    fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
    ) {
        let begin = vk::RenderPassBeginInfo::default()
            .render_pass(pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            });
        unsafe {
            self.device
                .cmd_begin_render_pass(cmd, &begin, vk::SubpassContents::INLINE)
        };
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(cmd) };
    }

    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe { self.device.cmd_set_viewport(cmd, 0, &[viewport]) };
    }

    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        unsafe { self.device.cmd_set_scissor(cmd, 0, &[scissor]) };
    }

    fn cmd_clear_color_image(&self, cmd: vk::CommandBuffer, image: vk::Image, color: [f32; 4]) {
        let value = vk::ClearColorValue { float32: color };
        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .level_count(1)
            .layer_count(1);
        unsafe {
            self.device
                .cmd_clear_color_image(cmd, image, vk::ImageLayout::GENERAL, &value, &[range])
        };
    }

    fn cmd_clear_depth_image(&self, cmd: vk::CommandBuffer, image: vk::Image, depth: f32) {
        let value = vk::ClearDepthStencilValue {
            depth,
            stencil: 0,
        };
        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::DEPTH)
            .level_count(1)
            .layer_count(1);
        unsafe {
            self.device.cmd_clear_depth_stencil_image(
                cmd,
                image,
                vk::ImageLayout::GENERAL,
                &value,
                &[range],
            )
        };
    }

    fn cmd_memory_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) {
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            )
        };
    }
}

impl Drop for AshDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::warn!("device_wait_idle failed during shutdown: {e}");
            }
        }

        let pending = std::mem::take(&mut self.transfers.lock().pending);
        for transfer in pending {
            self.retire_transfer(transfer);
        }

        let leaked_buffers = self.buffer_allocations.lock().len();
        let leaked_images = self.image_allocations.lock().len();
        if leaked_buffers + leaked_images > 0 {
            log::warn!(
                "Releasing {leaked_buffers} buffers and {leaked_images} images still alive at shutdown"
            );
        }
        for (buffer, mut allocation) in self.buffer_allocations.lock().drain() {
            unsafe { self.allocator.destroy_buffer(buffer, &mut allocation) };
        }
        for (image, mut allocation) in self.image_allocations.lock().drain() {
            unsafe { self.allocator.destroy_image(image, &mut allocation) };
        }

        unsafe {
            for frame in &self.frames {
                self.device.destroy_fence(frame.in_flight, None);
            }
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}
