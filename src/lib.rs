//! Deferred Vulkan frame-rendering core built on ash.
//!
//! The core is split into a handful of pieces that the [`renderer::DeferredRenderer`] ties
//! together every frame:
//!
//! * [`renderer::GeometryHeap`] packs mesh data into shared vertex/index buffers.
//! * [`renderer::DrawBatchBuilder`] turns instances into indexed draws and batches.
//! * [`vulkan::FrameBufferCache`] and [`renderer::RenderPass`] manage render targets.
//! * [`vulkan::DescriptorSetLayoutBuilder`] declares named bindings and seals them into a
//!   pool of per-frame descriptor sets.
//! * [`renderer::HotReloadPipeline`] rebuilds pipelines when shader files change.
//!
//! Everything talks to the GPU through an explicit `Arc<dyn GpuDevice>`:
//! [`vulkan::AshDevice`] for a real device, [`vulkan::RecordingDevice`] to run the core
//! without one.

pub mod error;
pub mod renderer;
pub mod vulkan;

pub use error::{AshError, Result};

pub mod prelude {
    pub use crate::error::{AshError, Result};
    pub use crate::renderer::{
        DeferredRenderer, DrawBatchBuilder, FolderWatcher, FrameTarget, GeometryHeap,
        HotReloadPipeline, HotReloadPipelineDesc, Instance, MaterialOverride, PbrMaterial,
        PipelineStatus, PrimitiveData, RenderFlags, RenderPass, RendererConfig, SceneDesc,
    };
    pub use crate::vulkan::{
        AshDevice, DescriptorSetLayoutBuilder, DescriptorSetUpdate, FrameBufferCache, GpuDevice,
        RecordingDevice,
    };
}
