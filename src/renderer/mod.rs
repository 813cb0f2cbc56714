pub mod draw_batch;
pub mod folder_watcher;
pub mod geometry_heap;
pub mod hot_reload;
pub mod pipeline_cache;
pub mod render_pass;
pub mod render_targets;
#[allow(clippy::module_inception)]
pub mod renderer;
pub mod shader;

pub use draw_batch::{
    coalesce_runs, Draw, DrawBatch, DrawBatchBuilder, DrawList, Instance, MaterialPush,
    WorldMatrix,
};
pub use folder_watcher::FolderWatcher;
pub use geometry_heap::{
    generate_tangents, GeometryHeap, Mesh, MeshId, PbrMaterial, Primitive, PrimitiveData,
    PrimitiveId, VertexBindings,
};
pub use hot_reload::{HotReloadPipeline, HotReloadPipelineDesc, PipelineStatus};
pub use pipeline_cache::PipelineCache;
pub use render_pass::{RenderPass, RenderTarget};
pub use render_targets::RenderTargets;
pub use renderer::{
    DeferredRenderer, FramePushConstants, FrameTarget, LightingPushConstants, MaterialOverride,
    PostProcessConfig, PostPushConstants, RenderFlags, RendererConfig, SceneDesc,
    MATERIAL_PUSH_OFFSET,
};
pub use shader::{load_spirv, FsShaderSource, ShaderSource, ShaderStage};
