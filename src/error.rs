use std::path::PathBuf;

use ash::vk;
use thiserror::Error;

/// Errors produced by the rendering core.
///
/// Contract violations by the caller (adding geometry to a closed heap, naming a binding
/// that was never declared, referencing a mesh the heap does not hold) are reported as
/// values of this type rather than asserted on.
#[derive(Debug, Error)]
pub enum AshError {
    #[error("Vulkan error: {0}")]
    VulkanError(String),

    #[error("Vulkan call failed: {0}")]
    Vk(#[from] vk::Result),

    #[error("geometry heap is closed; no more primitives, meshes or materials can be added")]
    HeapClosed,

    #[error("geometry heap has not been submitted to the GPU yet")]
    HeapNotClosed,

    #[error("{what} count {count} exceeds 32-bit addressing")]
    GeometryOverflow { what: &'static str, count: u64 },

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("instance references mesh {mesh_id} but the heap only holds {mesh_count} meshes")]
    InvalidMeshReference { mesh_id: u32, mesh_count: usize },

    #[error("primitive {id} does not exist (heap holds {count} primitives)")]
    InvalidPrimitiveReference { id: usize, count: usize },

    #[error("no {kind} binding named '{name}' in descriptor set layout")]
    UnknownBinding { name: String, kind: &'static str },

    #[error("invalid descriptor binding: {0}")]
    InvalidBinding(String),

    #[error("descriptor set index {index} out of range for pool of {pool_size}")]
    DescriptorIndexOutOfRange { index: usize, pool_size: usize },

    #[error("render pass has {targets} color targets but only {colors} clear colors")]
    ClearColorMismatch { colors: usize, targets: usize },

    #[error("depth clear requested on a render pass without a depth target")]
    MissingDepthTarget,

    #[error("failed to load shader {}: {reason}", path.display())]
    ShaderLoad { path: PathBuf, reason: String },

    #[error("failed to compile shader {}: {reason}", path.display())]
    ShaderCompile { path: PathBuf, reason: String },

    #[error("pipeline creation failed: {0}")]
    PipelineCreation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AshError>;
