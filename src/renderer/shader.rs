use std::io::Cursor;
use std::path::{Path, PathBuf};

use crate::{AshError, Result};

const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

/// Supplies shader bytes by file name. File names are the join key with folder-watch
/// notifications.
pub trait ShaderSource {
    fn load(&self, file_name: &str) -> Result<Vec<u8>>;

    /// Path used in diagnostics.
    fn path_of(&self, file_name: &str) -> PathBuf {
        PathBuf::from(file_name)
    }
}

/// Reads shaders from a folder on disk.
#[derive(Clone, Debug)]
pub struct FsShaderSource {
    root: PathBuf,
}

impl FsShaderSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ShaderSource for FsShaderSource {
    fn load(&self, file_name: &str) -> Result<Vec<u8>> {
        let path = self.path_of(file_name);
        std::fs::read(&path).map_err(|e| AshError::ShaderLoad {
            path,
            reason: e.to_string(),
        })
    }

    fn path_of(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }
}

fn is_spirv(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == SPIRV_MAGIC
}

/// Turns shader file contents into SPIR-V words.
///
/// SPIR-V binaries are recognised by their magic number; anything else is treated as GLSL and
/// needs the `shader_compilation` feature.
pub fn load_spirv(path: &Path, bytes: &[u8], stage: ShaderStage) -> Result<Vec<u32>> {
    if is_spirv(bytes) {
        return ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|e| AshError::ShaderLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        });
    }
    if path.extension().is_some_and(|ext| ext == "spv") {
        return Err(AshError::ShaderLoad {
            path: path.to_path_buf(),
            reason: "not a SPIR-V binary".to_string(),
        });
    }
    let source = std::str::from_utf8(bytes).map_err(|e| AshError::ShaderLoad {
        path: path.to_path_buf(),
        reason: format!("shader source is not UTF-8: {e}"),
    })?;
    compile_glsl(path, source, stage)
}

#[cfg(feature = "shader_compilation")]
fn compile_glsl(path: &Path, source: &str, stage: ShaderStage) -> Result<Vec<u32>> {
    let compile_error = |reason: String| AshError::ShaderCompile {
        path: path.to_path_buf(),
        reason,
    };
    let compiler = shaderc::Compiler::new()
        .ok_or_else(|| compile_error("shaderc compiler unavailable".to_string()))?;
    let mut options = shaderc::CompileOptions::new()
        .ok_or_else(|| compile_error("shaderc options unavailable".to_string()))?;
    options.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_2 as u32,
    );
    options.set_optimization_level(shaderc::OptimizationLevel::Performance);

    let kind = match stage {
        ShaderStage::Vertex => shaderc::ShaderKind::Vertex,
        ShaderStage::Fragment => shaderc::ShaderKind::Fragment,
    };
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("shader.glsl");
    let artifact = compiler
        .compile_into_spirv(source, kind, name, "main", Some(&options))
        .map_err(|e| compile_error(e.to_string()))?;
    if artifact.get_num_warnings() > 0 {
        log::warn!(
            "{}: {}",
            path.display(),
            artifact.get_warning_messages()
        );
    }
    Ok(artifact.as_binary().to_vec())
}

#[cfg(not(feature = "shader_compilation"))]
fn compile_glsl(path: &Path, _source: &str, _stage: ShaderStage) -> Result<Vec<u32>> {
    Err(AshError::ShaderCompile {
        path: path.to_path_buf(),
        reason: "GLSL sources need the `shader_compilation` feature; provide .spv instead"
            .to_string(),
    })
}
