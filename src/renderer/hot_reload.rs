//! Graphics pipelines that rebuild themselves when their shader files change.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ash::vk;
use crossbeam_channel::Receiver;

use super::shader::{load_spirv, ShaderSource, ShaderStage};
use crate::vulkan::{GpuDevice, GraphicsPipelineDesc};
use crate::{AshError, Result};

#[derive(Clone, Debug)]
pub struct HotReloadPipelineDesc {
    /// Used in log messages only.
    pub name: String,
    pub vertex_shader: String,
    pub fragment_shader: String,
    pub graphics: GraphicsPipelineDesc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStatus {
    Uninitialized,
    Valid,
    Invalidated,
    Reloading,
}

/// Each state owns the pipeline that is live in it, so the only place a pipeline can be
/// destroyed is the `Reloading -> Valid` transition.
#[derive(Debug)]
enum PipelineState {
    Uninitialized,
    Valid(vk::Pipeline),
    /// A reload was requested. `None` when no build has ever succeeded.
    Invalidated(Option<vk::Pipeline>),
    Reloading { previous: Option<vk::Pipeline> },
}

pub struct HotReloadPipeline {
    device: Arc<dyn GpuDevice>,
    desc: HotReloadPipelineDesc,
    source: Arc<dyn ShaderSource>,
    cache: vk::PipelineCache,
    state: PipelineState,
    watches: Vec<Receiver<Vec<PathBuf>>>,
    /// Last reload failure, so a pipeline retried every frame logs each distinct error once.
    last_error: Option<String>,
}

fn file_name_of(path: &Path) -> Option<&std::ffi::OsStr> {
    path.file_name()
}

impl HotReloadPipeline {
    /// Builds the pipeline right away. A failed first build is logged and leaves the pipeline
    /// `Uninitialized`; every later `bind` retries until a build succeeds.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        desc: HotReloadPipelineDesc,
        source: Arc<dyn ShaderSource>,
        cache: vk::PipelineCache,
    ) -> Self {
        let mut pipeline = Self {
            device,
            desc,
            source,
            cache,
            state: PipelineState::Uninitialized,
            watches: Vec::new(),
            last_error: None,
        };
        if let Err(e) = pipeline.reload() {
            pipeline.report_failure(&e);
        }
        pipeline
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.desc.graphics.layout
    }

    pub fn status(&self) -> PipelineStatus {
        match self.state {
            PipelineState::Uninitialized => PipelineStatus::Uninitialized,
            PipelineState::Valid(_) => PipelineStatus::Valid,
            PipelineState::Invalidated(_) => PipelineStatus::Invalidated,
            PipelineState::Reloading { .. } => PipelineStatus::Reloading,
        }
    }

    /// The pipeline `bind` would currently use.
    pub fn pipeline(&self) -> Option<vk::Pipeline> {
        match self.state {
            PipelineState::Uninitialized => None,
            PipelineState::Valid(p) => Some(p),
            PipelineState::Invalidated(p) | PipelineState::Reloading { previous: p } => p,
        }
    }

    pub fn invalidate(&mut self) {
        self.state = match std::mem::replace(&mut self.state, PipelineState::Uninitialized) {
            PipelineState::Uninitialized => PipelineState::Invalidated(None),
            PipelineState::Valid(p) => PipelineState::Invalidated(Some(p)),
            other => other,
        };
    }

    /// Invalidates the pipeline when any of `paths` names one of its shader files.
    pub fn notify_changed(&mut self, paths: &[PathBuf]) -> bool {
        let watched = [
            file_name_of(Path::new(&self.desc.vertex_shader)),
            file_name_of(Path::new(&self.desc.fragment_shader)),
        ];
        let hit = paths
            .iter()
            .any(|path| path.file_name().is_some() && watched.contains(&path.file_name()));
        if hit {
            log::info!("Shader change detected for pipeline '{}'", self.desc.name);
            self.invalidate();
        }
        hit
    }

    /// Subscribes to change lists coming from a [`super::FolderWatcher`].
    pub fn watch(&mut self, changes: Receiver<Vec<PathBuf>>) {
        self.watches.push(changes);
    }

    fn drain_notifications(&mut self) {
        let pending: Vec<Vec<PathBuf>> = self
            .watches
            .iter()
            .flat_map(|changes| changes.try_iter())
            .collect();
        for paths in pending {
            self.notify_changed(&paths);
        }
    }

    fn report_failure(&mut self, error: &AshError) {
        let message = error.to_string();
        if self.last_error.as_deref() == Some(message.as_str()) {
            log::debug!("Pipeline '{}' still failing: {message}", self.desc.name);
            return;
        }
        match self.state {
            PipelineState::Valid(_) => log::error!(
                "Pipeline '{}' reload failed, keeping previous pipeline: {message}",
                self.desc.name
            ),
            _ => log::error!("Pipeline '{}' failed to load: {message}", self.desc.name),
        }
        self.last_error = Some(message);
    }

    /// Reloads if needed, then binds the live pipeline.
    ///
    /// A pipeline is rebuilt when invalidated, and on every call while it has never been
    /// built. Returns `false` only when no pipeline has ever been built; reload failures are
    /// logged and the previous pipeline keeps being used.
    pub fn bind(&mut self, cmd: vk::CommandBuffer) -> bool {
        self.drain_notifications();
        if matches!(
            self.state,
            PipelineState::Invalidated(_) | PipelineState::Uninitialized
        ) {
            if let Err(e) = self.reload() {
                self.report_failure(&e);
            }
        }
        match self.pipeline() {
            Some(pipeline) => {
                self.device.cmd_bind_pipeline(cmd, pipeline);
                true
            }
            None => false,
        }
    }

    /// Rebuilds the pipeline from current shader files and swaps it in on success.
    pub fn reload(&mut self) -> Result<()> {
        let previous = match std::mem::replace(&mut self.state, PipelineState::Uninitialized) {
            PipelineState::Uninitialized => None,
            PipelineState::Valid(p) => Some(p),
            PipelineState::Invalidated(p) => p,
            PipelineState::Reloading { previous } => previous,
        };
        self.state = PipelineState::Reloading { previous };

        let built = self.build();
        let built = match (built, previous) {
            (Ok(pipeline), Some(old)) => match self.device.wait_idle() {
                Ok(()) => {
                    self.device.destroy_pipeline(old);
                    Ok(pipeline)
                }
                Err(e) => {
                    self.device.destroy_pipeline(pipeline);
                    Err(e)
                }
            },
            (result, _) => result,
        };

        match built {
            Ok(pipeline) => {
                self.state = PipelineState::Valid(pipeline);
                self.last_error = None;
                log::info!("Pipeline '{}' built", self.desc.name);
                Ok(())
            }
            Err(e) => {
                self.state = match previous {
                    Some(p) => PipelineState::Valid(p),
                    None => PipelineState::Uninitialized,
                };
                Err(e)
            }
        }
    }

    fn load_stage(&self, file_name: &str, stage: ShaderStage) -> Result<Vec<u32>> {
        let bytes = self.source.load(file_name)?;
        load_spirv(&self.source.path_of(file_name), &bytes, stage)
    }

    fn build(&self) -> Result<vk::Pipeline> {
        let vertex_code = self.load_stage(&self.desc.vertex_shader, ShaderStage::Vertex)?;
        let fragment_code = self.load_stage(&self.desc.fragment_shader, ShaderStage::Fragment)?;

        let vertex = self.device.create_shader_module(&vertex_code)?;
        let fragment = match self.device.create_shader_module(&fragment_code) {
            Ok(module) => module,
            Err(e) => {
                self.device.destroy_shader_module(vertex);
                return Err(e);
            }
        };

        let pipeline =
            self.device
                .create_graphics_pipeline(self.cache, &self.desc.graphics, vertex, fragment);
        self.device.destroy_shader_module(vertex);
        self.device.destroy_shader_module(fragment);
        pipeline
    }
}

impl Drop for HotReloadPipeline {
    fn drop(&mut self) {
        if let Some(pipeline) = self.pipeline() {
            self.device.destroy_pipeline(pipeline);
        }
    }
}
