pub mod ash_device;
pub mod descriptor_layout;
pub mod descriptor_pool;
pub mod device;
pub mod framebuffer_cache;
pub mod recording;

pub use ash_device::AshDevice;
pub use descriptor_layout::{BindingKind, DescriptorSetLayoutBuilder, NamedBinding};
pub use descriptor_pool::{DescriptorSetPool, DescriptorSetUpdate};
pub use device::{
    BufferDesc, BufferWrite, ColorAttachmentDesc, DescriptorResource, DescriptorWrite, GpuBuffer,
    GpuDevice, GpuImage, GraphicsPipelineDesc, ImageDesc, LayoutBinding, LoadToken,
    MemoryLocation, RenderPassDesc, SampledImage, VertexAttribute,
};
pub use framebuffer_cache::FrameBufferCache;
pub use recording::{ObjectKind, RecordedCommand, RecordingDevice};
