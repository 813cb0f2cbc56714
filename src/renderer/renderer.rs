use std::ops::BitOr;
use std::path::PathBuf;
use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};

use super::draw_batch::{DrawBatchBuilder, DrawList, Instance, MaterialPush};
use super::folder_watcher::FolderWatcher;
use super::geometry_heap::GeometryHeap;
use super::hot_reload::{HotReloadPipeline, HotReloadPipelineDesc, PipelineStatus};
use super::pipeline_cache::PipelineCache;
use super::render_pass::{RenderPass, RenderTarget};
use super::render_targets::{
    RenderTargets, BASE_COLOR_FORMAT, DEPTH_FORMAT, EMISSIVE_FORMAT, HDR_FORMAT, NORMAL_PBR_FORMAT,
};
use super::shader::{FsShaderSource, ShaderSource};
use crate::vulkan::{
    ColorAttachmentDesc, DescriptorSetLayoutBuilder, DescriptorSetPool, DescriptorSetUpdate,
    FrameBufferCache, GpuBuffer, GpuDevice, GpuImage, GraphicsPipelineDesc, ImageDesc,
    RenderPassDesc, SampledImage, VertexAttribute,
};
use crate::{AshError, Result};

/// Debug switches shared by every pass through push constants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RenderFlags(u32);

impl RenderFlags {
    pub const NONE: Self = Self(0);
    /// Shade every surface with [`MaterialOverride`] instead of its own material.
    pub const OVERRIDE_MATERIAL: Self = Self(1);
    pub const SHOW_NORMALS: Self = Self(1 << 1);
    pub const SHOW_BASE_COLOR: Self = Self(1 << 2);
    pub const NO_BLOOM: Self = Self(1 << 3);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for RenderFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Material used for every surface while [`RenderFlags::OVERRIDE_MATERIAL`] is set.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MaterialOverride {
    pub base_color: Vec3,
    pub metallic: f32,
    pub roughness: f32,
    pub clear_coat: f32,
}

impl Default for MaterialOverride {
    fn default() -> Self {
        Self {
            base_color: Vec3::splat(0.7),
            metallic: 0.0,
            roughness: 0.75,
            clear_coat: 0.0,
        }
    }
}

impl MaterialOverride {
    fn clamped(self) -> Self {
        Self {
            base_color: self.base_color.clamp(Vec3::ZERO, Vec3::ONE),
            metallic: self.metallic.clamp(0.0, 1.0),
            roughness: self.roughness.clamp(0.0, 1.0),
            clear_coat: self.clear_coat.clamp(0.0, 1.0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PostProcessConfig {
    pub exposure: f32,
    pub bloom_intensity: f32,
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            exposure: 1.0,
            bloom_intensity: 0.2,
        }
    }
}

impl PostProcessConfig {
    pub fn set_exposure(&mut self, exposure: f32) {
        self.exposure = exposure.max(0.0);
    }

    pub fn set_bloom_intensity(&mut self, intensity: f32) {
        self.bloom_intensity = intensity.clamp(0.0, 2.0);
    }
}

#[derive(Clone, Debug)]
pub struct RendererConfig {
    pub frames_in_flight: usize,
    pub shaders_folder: PathBuf,
    /// Poll `shaders_folder` every frame and hot-reload pipelines whose shaders changed.
    pub watch_shaders: bool,
    /// Load `<name>.spv` binaries instead of GLSL sources.
    pub precompiled_shaders: bool,
    pub pipeline_cache_file: Option<PathBuf>,
    /// Format of the images handed to [`DeferredRenderer::render`].
    pub present_format: vk::Format,
    /// Size of the material texture array.
    pub max_textures: u32,
    pub post: PostProcessConfig,
    pub material_override: MaterialOverride,
    pub render_flags: RenderFlags,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            shaders_folder: PathBuf::from("shaders"),
            watch_shaders: false,
            precompiled_shaders: !cfg!(feature = "shader_compilation"),
            pipeline_cache_file: None,
            present_format: vk::Format::B8G8R8A8_SRGB,
            max_textures: 64,
            post: PostProcessConfig::default(),
            material_override: MaterialOverride::default(),
            render_flags: RenderFlags::NONE,
        }
    }
}

/// Geometry-pass constants. The per-draw material index follows at [`MATERIAL_PUSH_OFFSET`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct FramePushConstants {
    pub proj: Mat4,
    pub view: Mat4,
    pub light_dir: Vec4,
    pub ambient_color: Vec4,
    pub light_color: Vec4,
    /// xyz: base colour, w: metallic.
    pub override_base_color_metallic: Vec4,
    pub override_roughness: f32,
    pub override_clear_coat: f32,
    pub render_flags: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct LightingPushConstants {
    pub light_dir: Vec4,
    pub light_color: Vec4,
    pub ambient_color: Vec4,
    pub window_size: Vec2,
    pub render_flags: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct PostPushConstants {
    pub ambient_color: Vec4,
    pub window_size: Vec2,
    pub exposure: f32,
    pub bloom: f32,
    pub render_flags: u32,
    pub _pad: [u32; 3],
}

pub const MATERIAL_PUSH_OFFSET: u32 = std::mem::size_of::<FramePushConstants>() as u32;
const GBUFFER_PUSH_SIZE: u32 = MATERIAL_PUSH_OFFSET + std::mem::size_of::<u32>() as u32;
const GBUFFER_PUSH_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::VERTEX.as_raw() | vk::ShaderStageFlags::FRAGMENT.as_raw(),
);

/// Everything the renderer needs to know about the scene for one frame.
#[derive(Clone, Copy, Debug)]
pub struct SceneDesc<'a> {
    pub geometry: &'a GeometryHeap,
    pub instances: &'a [Instance],
    pub proj: Mat4,
    pub view: Mat4,
    pub light_dir: Vec3,
    pub light_color: Vec3,
    pub ambient_color: Vec3,
}

/// The image the post pass writes, usually an acquired swapchain image.
#[derive(Clone, Copy, Debug)]
pub struct FrameTarget {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub wait_semaphore: Option<vk::Semaphore>,
    pub signal_semaphore: Option<vk::Semaphore>,
}

struct PipelineLayouts {
    device: Arc<dyn GpuDevice>,
    gbuffer: vk::PipelineLayout,
    lighting: vk::PipelineLayout,
    post: vk::PipelineLayout,
}

fn push_range(stages: vk::ShaderStageFlags, size: u32) -> vk::PushConstantRange {
    vk::PushConstantRange::default()
        .stage_flags(stages)
        .offset(0)
        .size(size)
}

impl PipelineLayouts {
    fn create(
        device: Arc<dyn GpuDevice>,
        frame: vk::DescriptorSetLayout,
        lighting: vk::DescriptorSetLayout,
        post: vk::DescriptorSetLayout,
    ) -> Result<Self> {
        let mut layouts = Self {
            device: device.clone(),
            gbuffer: vk::PipelineLayout::null(),
            lighting: vk::PipelineLayout::null(),
            post: vk::PipelineLayout::null(),
        };
        layouts.gbuffer = device
            .create_pipeline_layout(&[frame], &[push_range(GBUFFER_PUSH_STAGES, GBUFFER_PUSH_SIZE)])?;
        layouts.lighting = device.create_pipeline_layout(
            &[lighting],
            &[push_range(
                vk::ShaderStageFlags::FRAGMENT,
                std::mem::size_of::<LightingPushConstants>() as u32,
            )],
        )?;
        layouts.post = device.create_pipeline_layout(
            &[post],
            &[push_range(
                vk::ShaderStageFlags::FRAGMENT,
                std::mem::size_of::<PostPushConstants>() as u32,
            )],
        )?;
        Ok(layouts)
    }
}

impl Drop for PipelineLayouts {
    fn drop(&mut self) {
        for layout in [self.gbuffer, self.lighting, self.post] {
            if layout != vk::PipelineLayout::null() {
                self.device.destroy_pipeline_layout(layout);
            }
        }
    }
}

/// Sampler shared by every sampled image, and the white texture filling unused array slots.
struct SharedTextures {
    device: Arc<dyn GpuDevice>,
    sampler: vk::Sampler,
    fallback: GpuImage,
    fallback_cleared: bool,
}

impl SharedTextures {
    fn create(device: Arc<dyn GpuDevice>) -> Result<Self> {
        let sampler = device.create_sampler()?;
        let fallback = device
            .create_image(&ImageDesc {
                name: "fallbackTexture",
                extent: vk::Extent2D {
                    width: 1,
                    height: 1,
                },
                format: vk::Format::R8G8B8A8_UNORM,
                usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
                aspect: vk::ImageAspectFlags::COLOR,
            })
            .inspect_err(|_| device.destroy_sampler(sampler))?;
        Ok(Self {
            device,
            sampler,
            fallback,
            fallback_cleared: false,
        })
    }

    fn sampled(&self, image: &GpuImage) -> SampledImage {
        SampledImage {
            view: image.view,
            sampler: self.sampler,
            layout: vk::ImageLayout::GENERAL,
        }
    }

    /// Fills the fallback texture on the first recorded frame.
    fn prepare(&mut self, cmd: vk::CommandBuffer) {
        if self.fallback_cleared {
            return;
        }
        self.device
            .cmd_clear_color_image(cmd, self.fallback.image, [1.0; 4]);
        self.device.cmd_memory_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
        );
        self.fallback_cleared = true;
    }
}

impl Drop for SharedTextures {
    fn drop(&mut self) {
        self.device.destroy_image(&self.fallback);
        self.device.destroy_sampler(self.sampler);
    }
}

fn gbuffer_vertex_attributes() -> Vec<VertexAttribute> {
    let stream = |location: u32, format: vk::Format, stride: usize| VertexAttribute {
        location,
        binding: location,
        format,
        stride: stride as u32,
    };
    vec![
        stream(0, vk::Format::R32G32B32_SFLOAT, std::mem::size_of::<Vec3>()),
        stream(1, vk::Format::R32G32B32_SFLOAT, std::mem::size_of::<Vec3>()),
        stream(2, vk::Format::R32G32B32A32_SFLOAT, std::mem::size_of::<Vec4>()),
        stream(3, vk::Format::R32G32_SFLOAT, std::mem::size_of::<Vec2>()),
    ]
}

/// Two-pass deferred renderer.
///
/// Pass 1 rasterizes the scene into the G-buffer. Pass 2 resolves lighting into an HDR
/// buffer, then tonemaps it into the presented image. Pipelines hot-reload when their
/// shaders change; a pipeline that never loaded simply skips its draws.
pub struct DeferredRenderer {
    // Field order is drop order.
    gbuffer_pipeline: HotReloadPipeline,
    lighting_pipeline: HotReloadPipeline,
    post_pipeline: HotReloadPipeline,
    pipeline_cache: PipelineCache,
    shader_watcher: Option<FolderWatcher>,
    batch_builder: DrawBatchBuilder,
    framebuffers: FrameBufferCache,
    gbuffer_pass: RenderPass,
    lighting_pass: RenderPass,
    post_pass: RenderPass,
    layouts: PipelineLayouts,
    frame_sets: DescriptorSetPool,
    lighting_sets: DescriptorSetPool,
    post_sets: DescriptorSetPool,
    targets: RenderTargets,
    textures: SharedTextures,
    /// Buffers last written into each frame slot's descriptor set.
    frame_set_sources: Vec<Option<(GpuBuffer, GpuBuffer)>>,
    config: RendererConfig,
    window_size: vk::Extent2D,
    frame_index: usize,
    device: Arc<dyn GpuDevice>,
}

impl DeferredRenderer {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        mut config: RendererConfig,
        window_size: vk::Extent2D,
    ) -> Result<Self> {
        let slots = device.frame_slots().max(1);
        if config.frames_in_flight > slots {
            log::warn!(
                "{} frames in flight requested but the device has {slots} frame slots, using {slots}",
                config.frames_in_flight
            );
        }
        config.frames_in_flight = config.frames_in_flight.clamp(1, slots);
        config.material_override = config.material_override.clamped();
        config.post.set_exposure(config.post.exposure);
        config.post.set_bloom_intensity(config.post.bloom_intensity);
        let frames = config.frames_in_flight;
        let window_size = vk::Extent2D {
            width: window_size.width.max(1),
            height: window_size.height.max(1),
        };

        let targets = RenderTargets::create(device.clone(), window_size)?;
        let textures = SharedTextures::create(device.clone())?;

        let frame_sets = DescriptorSetLayoutBuilder::new()
            .add_storage_buffer("worldMtx", 0, vk::ShaderStageFlags::VERTEX)
            .add_storage_buffer("materials", 1, vk::ShaderStageFlags::FRAGMENT)
            .add_texture_array(
                "textures",
                2,
                vk::ShaderStageFlags::FRAGMENT,
                config.max_textures,
            )
            .close(device.clone(), frames)?;
        let lighting_sets = DescriptorSetLayoutBuilder::new()
            .add_texture("baseColorMetalness", 0, vk::ShaderStageFlags::FRAGMENT)
            .add_texture("normalPBR", 1, vk::ShaderStageFlags::FRAGMENT)
            .add_texture("emissive", 2, vk::ShaderStageFlags::FRAGMENT)
            .add_texture("depth", 3, vk::ShaderStageFlags::FRAGMENT)
            .close(device.clone(), frames)?;
        let post_sets = DescriptorSetLayoutBuilder::new()
            .add_texture("hdrLight", 0, vk::ShaderStageFlags::FRAGMENT)
            .add_texture("emissive", 1, vk::ShaderStageFlags::FRAGMENT)
            .close(device.clone(), frames)?;
        let layouts = PipelineLayouts::create(
            device.clone(),
            frame_sets.layout(),
            lighting_sets.layout(),
            post_sets.layout(),
        )?;

        let mut gbuffer_pass = RenderPass::create(
            device.clone(),
            &RenderPassDesc {
                color: vec![
                    ColorAttachmentDesc::general(BASE_COLOR_FORMAT),
                    ColorAttachmentDesc::general(NORMAL_PBR_FORMAT),
                    ColorAttachmentDesc::general(EMISSIVE_FORMAT),
                ],
                depth: Some(DEPTH_FORMAT),
            },
        )?;
        gbuffer_pass.set_clear_color(&[Vec4::ZERO; 3]);
        // Reverse-Z: far plane at 0.
        gbuffer_pass.set_clear_depth(0.0);
        let lighting_pass = RenderPass::create(
            device.clone(),
            &RenderPassDesc {
                color: vec![ColorAttachmentDesc::general(HDR_FORMAT)],
                depth: None,
            },
        )?;
        let post_pass = RenderPass::create(
            device.clone(),
            &RenderPassDesc {
                color: vec![ColorAttachmentDesc::present(config.present_format)],
                depth: None,
            },
        )?;

        let pipeline_cache =
            PipelineCache::open(device.clone(), config.pipeline_cache_file.clone())?;
        let source: Arc<dyn ShaderSource> =
            Arc::new(FsShaderSource::new(config.shaders_folder.clone()));
        let shader_file = |name: &str| {
            if config.precompiled_shaders {
                format!("{name}.spv")
            } else {
                name.to_string()
            }
        };
        let fullscreen = |name: &str, fragment: &str, layout, render_pass| HotReloadPipelineDesc {
            name: name.to_string(),
            vertex_shader: shader_file("fullscreen.vert"),
            fragment_shader: shader_file(fragment),
            graphics: GraphicsPipelineDesc {
                layout,
                render_pass,
                vertex_attributes: Vec::new(),
                depth_test: false,
                blend: false,
                color_attachment_count: 1,
            },
        };

        let mut gbuffer_pipeline = HotReloadPipeline::new(
            device.clone(),
            HotReloadPipelineDesc {
                name: "gbuffer".to_string(),
                vertex_shader: shader_file("gbuffer.vert"),
                fragment_shader: shader_file("gbuffer.frag"),
                graphics: GraphicsPipelineDesc {
                    layout: layouts.gbuffer,
                    render_pass: gbuffer_pass.handle(),
                    vertex_attributes: gbuffer_vertex_attributes(),
                    depth_test: true,
                    blend: false,
                    color_attachment_count: 3,
                },
            },
            source.clone(),
            pipeline_cache.handle(),
        );
        let mut lighting_pipeline = HotReloadPipeline::new(
            device.clone(),
            fullscreen(
                "lighting",
                "lighting.frag",
                layouts.lighting,
                lighting_pass.handle(),
            ),
            source.clone(),
            pipeline_cache.handle(),
        );
        let mut post_pipeline = HotReloadPipeline::new(
            device.clone(),
            fullscreen("post", "post.frag", layouts.post, post_pass.handle()),
            source,
            pipeline_cache.handle(),
        );

        let shader_watcher = config.watch_shaders.then(|| {
            let mut watcher = FolderWatcher::new(config.shaders_folder.clone());
            gbuffer_pipeline.watch(watcher.subscribe());
            lighting_pipeline.watch(watcher.subscribe());
            post_pipeline.watch(watcher.subscribe());
            watcher
        });

        let mut renderer = Self {
            gbuffer_pipeline,
            lighting_pipeline,
            post_pipeline,
            pipeline_cache,
            shader_watcher,
            batch_builder: DrawBatchBuilder::new(device.clone(), frames),
            framebuffers: FrameBufferCache::new(device.clone()),
            gbuffer_pass,
            lighting_pass,
            post_pass,
            layouts,
            frame_sets,
            lighting_sets,
            post_sets,
            targets,
            textures,
            frame_set_sources: vec![None; frames],
            config,
            window_size,
            frame_index: 0,
            device,
        };
        renderer.bind_targets()?;
        renderer.write_textures(&[])?;

        log::info!(
            "Deferred renderer initialized ({}x{}, {} frames in flight)",
            window_size.width,
            window_size.height,
            frames
        );
        Ok(renderer)
    }

    /// Points the passes and the lighting/post descriptor sets at the current render targets.
    fn bind_targets(&mut self) -> Result<()> {
        self.gbuffer_pass
            .set_color_targets(&self.targets.gbuffer());
        self.gbuffer_pass
            .set_depth_target(Some(RenderTarget::from(&self.targets.depth)));
        self.lighting_pass
            .set_color_target(RenderTarget::from(&self.targets.hdr_light));

        let targets = &self.targets;
        let textures = &self.textures;
        for index in 0..self.lighting_sets.pool_size() {
            let mut update = DescriptorSetUpdate::new(&self.lighting_sets, index)?;
            update
                .set_texture(
                    "baseColorMetalness",
                    textures.sampled(&targets.base_color_metalness),
                )?
                .set_texture("normalPBR", textures.sampled(&targets.normal_pbr))?
                .set_texture("emissive", textures.sampled(&targets.emissive))?
                .set_texture("depth", textures.sampled(&targets.depth))?;
            update.send();
        }
        for index in 0..self.post_sets.pool_size() {
            let mut update = DescriptorSetUpdate::new(&self.post_sets, index)?;
            update
                .set_texture("hdrLight", textures.sampled(&targets.hdr_light))?
                .set_texture("emissive", textures.sampled(&targets.emissive))?;
            update.send();
        }
        Ok(())
    }

    fn write_textures(&self, textures: &[SampledImage]) -> Result<()> {
        let capacity = self.config.max_textures as usize;
        if textures.len() > capacity {
            return Err(AshError::InvalidBinding(format!(
                "{} textures exceed the texture array size of {capacity}",
                textures.len()
            )));
        }
        let mut array = textures.to_vec();
        array.resize(capacity, self.textures.sampled(&self.textures.fallback));
        for index in 0..self.frame_sets.pool_size() {
            self.frame_sets
                .write_texture_array(index, "textures", &array)?;
        }
        Ok(())
    }

    /// Replaces the material texture array. Unused slots sample a white texture.
    ///
    /// Waits for the device to go idle since every frame slot's set is rewritten.
    pub fn set_textures(&mut self, textures: &[SampledImage]) -> Result<()> {
        self.device.wait_idle()?;
        self.write_textures(textures)
    }

    /// Records and submits one frame.
    ///
    /// A frame that fails while recording is still submitted, without any open render pass,
    /// so the frame slot and the target's semaphores keep cycling. The error is returned
    /// afterwards and the frame index does not advance.
    pub fn render(&mut self, scene: &SceneDesc<'_>, target: &FrameTarget) -> Result<()> {
        if let Some(watcher) = &mut self.shader_watcher {
            watcher.poll();
        }

        let frame = self.frame_index;
        let cmd = self.device.begin_frame(frame)?;
        let recorded = match self.prepare_geometry(frame, scene) {
            Ok(draws) => self.record_frame(cmd, frame, scene, target, draws.as_ref()),
            Err(e) => Err(e),
        };
        self.device.submit_frame(
            frame,
            cmd,
            target.wait_semaphore,
            target.signal_semaphore,
        )?;
        recorded?;

        self.frame_index = (frame + 1) % self.config.frames_in_flight;
        Ok(())
    }

    /// Builds the frame's draw list and points the frame slot's set at its buffers.
    /// `None` while the geometry upload is still in flight.
    fn prepare_geometry(
        &mut self,
        frame: usize,
        scene: &SceneDesc<'_>,
    ) -> Result<Option<DrawList>> {
        if !scene.geometry.is_ready()? {
            log::trace!("Geometry not ready, skipping geometry draws");
            return Ok(None);
        }
        let list = self
            .batch_builder
            .get_draw_batches(frame, scene.instances, scene.geometry)?;
        if let Some(batch) = list.batches.first() {
            self.update_frame_set(frame, batch.world_matrices, batch.materials)?;
        }
        Ok(Some(list))
    }

    fn update_frame_set(
        &mut self,
        frame: usize,
        world_matrices: GpuBuffer,
        materials: GpuBuffer,
    ) -> Result<()> {
        let sources = Some((world_matrices, materials));
        if self.frame_set_sources[frame] == sources {
            return Ok(());
        }
        let mut update = DescriptorSetUpdate::new(&self.frame_sets, frame)?;
        update
            .add_storage_buffer("worldMtx", world_matrices)?
            .add_storage_buffer("materials", materials)?;
        update.send();
        self.frame_set_sources[frame] = sources;
        Ok(())
    }

    fn frame_constants(&self, scene: &SceneDesc<'_>) -> FramePushConstants {
        let material = self.config.material_override;
        FramePushConstants {
            proj: scene.proj,
            view: scene.view,
            light_dir: scene.light_dir.normalize_or_zero().extend(0.0),
            ambient_color: scene.ambient_color.extend(1.0),
            light_color: scene.light_color.extend(1.0),
            override_base_color_metallic: material.base_color.extend(material.metallic),
            override_roughness: material.roughness,
            override_clear_coat: material.clear_coat,
            render_flags: self.config.render_flags.bits(),
            _pad: 0,
        }
    }

    fn record_frame(
        &mut self,
        cmd: vk::CommandBuffer,
        frame: usize,
        scene: &SceneDesc<'_>,
        target: &FrameTarget,
        draws: Option<&DrawList>,
    ) -> Result<()> {
        let frame_set = self.frame_sets.descriptor(frame)?;
        let lighting_set = self.lighting_sets.descriptor(frame)?;
        let post_set = self.post_sets.descriptor(frame)?;
        let extent = self.window_size;
        let window_size = Vec2::new(extent.width as f32, extent.height as f32);
        let flags = self.config.render_flags.bits();

        self.textures.prepare(cmd);

        // The G-buffer and depth are shared by every frame slot; the previous frame's lighting
        // reads and attachment writes must finish before this frame clears them.
        self.device.cmd_memory_barrier(
            cmd,
            vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::SHADER_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::AccessFlags::TRANSFER_WRITE,
        );

        // Pass 1: geometry into the G-buffer.
        self.gbuffer_pass
            .begin(&mut self.framebuffers, cmd, extent)?;
        if let Some(list) = draws.filter(|list| !list.batches.is_empty()) {
            if self.gbuffer_pipeline.bind(cmd) {
                let layout = self.layouts.gbuffer;
                self.device
                    .cmd_bind_descriptor_sets(cmd, layout, 0, &[frame_set]);
                let constants = self.frame_constants(scene);
                self.device.cmd_push_constants(
                    cmd,
                    layout,
                    GBUFFER_PUSH_STAGES,
                    0,
                    bytemuck::bytes_of(&constants),
                );
                self.batch_builder.record(
                    cmd,
                    list,
                    Some(&MaterialPush {
                        layout,
                        stages: GBUFFER_PUSH_STAGES,
                        offset: MATERIAL_PUSH_OFFSET,
                    }),
                );
            }
        }
        self.gbuffer_pass.end(cmd);

        self.device.cmd_memory_barrier(
            cmd,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::AccessFlags::SHADER_READ,
        );

        // Pass 2a: lighting into the HDR buffer.
        self.lighting_pass
            .begin(&mut self.framebuffers, cmd, extent)?;
        if self.lighting_pipeline.bind(cmd) {
            let layout = self.layouts.lighting;
            self.device
                .cmd_bind_descriptor_sets(cmd, layout, 0, &[lighting_set]);
            let constants = LightingPushConstants {
                light_dir: scene.light_dir.normalize_or_zero().extend(0.0),
                light_color: scene.light_color.extend(1.0),
                ambient_color: scene.ambient_color.extend(1.0),
                window_size,
                render_flags: flags,
                _pad: 0,
            };
            self.device.cmd_push_constants(
                cmd,
                layout,
                vk::ShaderStageFlags::FRAGMENT,
                0,
                bytemuck::bytes_of(&constants),
            );
            self.device.cmd_draw(cmd, 3, 1, 0, 0);
        }
        self.lighting_pass.end(cmd);

        self.device.cmd_memory_barrier(
            cmd,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::AccessFlags::SHADER_READ,
        );

        // Pass 2b: exposure and bloom into the presented image.
        self.post_pass.set_color_target(RenderTarget {
            image: target.image,
            view: target.view,
        });
        self.post_pass
            .begin(&mut self.framebuffers, cmd, target.extent)?;
        if self.post_pipeline.bind(cmd) {
            let layout = self.layouts.post;
            self.device
                .cmd_bind_descriptor_sets(cmd, layout, 0, &[post_set]);
            let constants = PostPushConstants {
                ambient_color: scene.ambient_color.extend(1.0),
                window_size,
                exposure: self.config.post.exposure,
                bloom: self.config.post.bloom_intensity,
                render_flags: flags,
                _pad: [0; 3],
            };
            self.device.cmd_push_constants(
                cmd,
                layout,
                vk::ShaderStageFlags::FRAGMENT,
                0,
                bytemuck::bytes_of(&constants),
            );
            self.device.cmd_draw(cmd, 3, 1, 0, 0);
        }
        self.post_pass.end(cmd);
        Ok(())
    }

    /// Recreates the window-sized targets. Zero-sized windows (minimized) are ignored.
    pub fn on_resize(&mut self, size: vk::Extent2D) -> Result<()> {
        if size.width == 0 || size.height == 0 {
            log::debug!("Ignoring resize to {}x{}", size.width, size.height);
            return Ok(());
        }

        self.device.wait_idle()?;
        let targets = RenderTargets::create(self.device.clone(), size)?;
        self.framebuffers.invalidate_views(&self.targets.views());
        self.framebuffers.retain_extent(size);
        self.targets = targets;
        self.window_size = size;
        self.bind_targets()?;

        log::info!("Render targets resized to {}x{}", size.width, size.height);
        Ok(())
    }

    /// Drops cached framebuffers built on `views`, e.g. swapchain views about to be destroyed.
    ///
    /// Waits for the device to go idle first, since frames in flight may still use them.
    pub fn release_target_views(&mut self, views: &[vk::ImageView]) -> Result<()> {
        self.device.wait_idle()?;
        self.framebuffers.invalidate_views(views);
        Ok(())
    }

    /// Writes the pipeline cache to `RendererConfig::pipeline_cache_file` if it changed.
    ///
    /// Also happens on drop; call it after a batch of reloads to keep the stored blob fresh.
    pub fn save_pipeline_cache(&mut self) -> Result<bool> {
        self.pipeline_cache.persist()
    }

    /// Forces every pipeline to rebuild from its shader files on its next bind.
    pub fn reload_shaders(&mut self) {
        self.gbuffer_pipeline.invalidate();
        self.lighting_pipeline.invalidate();
        self.post_pipeline.invalidate();
    }

    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn frames_in_flight(&self) -> usize {
        self.config.frames_in_flight
    }

    pub fn window_size(&self) -> vk::Extent2D {
        self.window_size
    }

    pub fn pipeline_status(&self) -> [(&str, PipelineStatus); 3] {
        [
            &self.gbuffer_pipeline,
            &self.lighting_pipeline,
            &self.post_pipeline,
        ]
        .map(|pipeline| (pipeline.name(), pipeline.status()))
    }

    // ──────────────────────────────────────────────────────────
    // Post-Processing API
    // ──────────────────────────────────────────────────────────

    /// Sets the exposure multiplier applied before tonemapping
    pub fn set_exposure(&mut self, exposure: f32) {
        self.config.post.set_exposure(exposure);
    }

    pub fn exposure(&self) -> f32 {
        self.config.post.exposure
    }

    /// Sets the bloom intensity, clamped to [0, 2]
    pub fn set_bloom_intensity(&mut self, intensity: f32) {
        self.config.post.set_bloom_intensity(intensity);
    }

    pub fn bloom_intensity(&self) -> f32 {
        self.config.post.bloom_intensity
    }

    pub fn set_material_override(&mut self, material: MaterialOverride) {
        self.config.material_override = material.clamped();
    }

    pub fn material_override(&self) -> MaterialOverride {
        self.config.material_override
    }

    pub fn set_render_flags(&mut self, flags: RenderFlags) {
        self.config.render_flags = flags;
    }

    pub fn render_flags(&self) -> RenderFlags {
        self.config.render_flags
    }
}

impl Drop for DeferredRenderer {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            log::warn!("wait_idle failed while dropping renderer: {e}");
        }
        log::info!("Deferred renderer destroyed");
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use ash::vk::Handle;
    use glam::Affine3A;

    use super::*;
    use crate::renderer::geometry_heap::PrimitiveData;
    use crate::renderer::shader::tests::fake_spirv;
    use crate::vulkan::{DescriptorResource, ObjectKind, RecordedCommand, RecordingDevice};

    const SHADERS: [&str; 5] = [
        "gbuffer.vert",
        "gbuffer.frag",
        "fullscreen.vert",
        "lighting.frag",
        "post.frag",
    ];

    fn write_shaders(dir: &Path) {
        for name in SHADERS {
            std::fs::write(dir.join(format!("{name}.spv")), fake_spirv()).unwrap();
        }
    }

    fn config(dir: &Path) -> RendererConfig {
        RendererConfig {
            shaders_folder: dir.to_path_buf(),
            precompiled_shaders: true,
            max_textures: 4,
            ..Default::default()
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn triangle_heap(device: Arc<RecordingDevice>) -> GeometryHeap {
        let mut heap = GeometryHeap::new(device);
        heap.add_mesh_data(&[PrimitiveData {
            positions: &[Vec3::ZERO, Vec3::X, Vec3::Y],
            normals: &[Vec3::Z; 3],
            uvs: &[Vec2::ZERO, Vec2::X, Vec2::Y],
            tangents: None,
            indices: &[0, 1, 2],
            material_index: 0,
        }])
        .unwrap();
        heap
    }

    fn target(size: vk::Extent2D) -> FrameTarget {
        FrameTarget {
            image: vk::Image::from_raw(0xA000),
            view: vk::ImageView::from_raw(0xA001),
            extent: size,
            wait_semaphore: None,
            signal_semaphore: None,
        }
    }

    fn scene<'a>(heap: &'a GeometryHeap, instances: &'a [Instance]) -> SceneDesc<'a> {
        SceneDesc {
            geometry: heap,
            instances,
            proj: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            light_dir: Vec3::new(0.0, -2.0, 0.0),
            light_color: Vec3::ONE,
            ambient_color: Vec3::splat(0.1),
        }
    }

    fn instances(mesh_id: u32, count: usize) -> Vec<Instance> {
        (0..count)
            .map(|i| Instance {
                transform: Affine3A::from_translation(Vec3::X * i as f32),
                mesh_id,
            })
            .collect()
    }

    fn count(commands: &[RecordedCommand], pred: impl Fn(&RecordedCommand) -> bool) -> usize {
        commands.iter().filter(|c| pred(c)).count()
    }

    #[test]
    fn push_constant_blocks_match_shader_layout() {
        assert_eq!(std::mem::size_of::<FramePushConstants>(), 208);
        assert_eq!(MATERIAL_PUSH_OFFSET, 208);
        assert_eq!(std::mem::size_of::<LightingPushConstants>(), 64);
        assert_eq!(std::mem::size_of::<PostPushConstants>(), 48);
    }

    #[test]
    fn frame_records_geometry_lighting_and_post() {
        let dir = tempfile::tempdir().unwrap();
        write_shaders(dir.path());
        let device = Arc::new(RecordingDevice::new());
        let mut renderer =
            DeferredRenderer::new(device.clone(), config(dir.path()), extent(640, 480)).unwrap();
        assert!(renderer
            .pipeline_status()
            .iter()
            .all(|(_, status)| *status == PipelineStatus::Valid));

        let mut heap = triangle_heap(device.clone());
        heap.close_and_submit().unwrap();
        let instances = instances(0, 2);

        renderer
            .render(&scene(&heap, &instances), &target(extent(640, 480)))
            .unwrap();

        let commands = device.take_commands();
        assert_eq!(
            count(&commands, |c| matches!(c, RecordedCommand::BeginRenderPass { .. })),
            3
        );
        assert_eq!(
            count(&commands, |c| matches!(c, RecordedCommand::DrawIndexed { .. })),
            2
        );
        assert_eq!(
            count(&commands, |c| matches!(c, RecordedCommand::Draw { vertex_count: 3, .. })),
            2
        );
        // Both draws share material 0, so it is pushed once.
        assert_eq!(
            count(&commands, |c| matches!(
                c,
                RecordedCommand::PushConstants { offset, .. } if *offset == MATERIAL_PUSH_OFFSET
            )),
            1
        );
        assert_eq!(
            count(&commands, |c| matches!(c, RecordedCommand::MemoryBarrier)),
            4
        );
        assert_eq!(device.submitted_frames(), 1);
        assert_eq!(renderer.frame_index(), 1);

        // The fallback texture is only filled once.
        renderer
            .render(&scene(&heap, &instances), &target(extent(640, 480)))
            .unwrap();
        let commands = device.take_commands();
        assert_eq!(
            count(&commands, |c| matches!(c, RecordedCommand::MemoryBarrier)),
            3
        );
        // Nothing touches the shared G-buffer before the previous frame's reads are done.
        let first_clear = commands
            .iter()
            .position(|c| matches!(c, RecordedCommand::ClearColorImage { .. }))
            .unwrap();
        assert!(matches!(commands[first_clear - 1], RecordedCommand::MemoryBarrier));
        assert_eq!(renderer.frame_index(), 0);
    }

    #[test]
    fn geometry_draws_wait_for_the_heap() {
        let dir = tempfile::tempdir().unwrap();
        write_shaders(dir.path());
        let device = Arc::new(RecordingDevice::new());
        let mut renderer =
            DeferredRenderer::new(device.clone(), config(dir.path()), extent(64, 64)).unwrap();
        let heap = triangle_heap(device.clone());
        let instances = instances(0, 1);

        renderer
            .render(&scene(&heap, &instances), &target(extent(64, 64)))
            .unwrap();

        let commands = device.take_commands();
        assert_eq!(
            count(&commands, |c| matches!(c, RecordedCommand::DrawIndexed { .. })),
            0
        );
        assert_eq!(
            count(&commands, |c| matches!(c, RecordedCommand::BeginRenderPass { .. })),
            3
        );
        assert_eq!(
            count(&commands, |c| matches!(c, RecordedCommand::Draw { .. })),
            2
        );
    }

    #[test]
    fn unknown_mesh_submits_an_empty_frame() {
        let dir = tempfile::tempdir().unwrap();
        write_shaders(dir.path());
        let device = Arc::new(RecordingDevice::new());
        let mut renderer =
            DeferredRenderer::new(device.clone(), config(dir.path()), extent(64, 64)).unwrap();
        let mut heap = triangle_heap(device.clone());
        heap.close_and_submit().unwrap();
        let instances = instances(5, 1);

        let result = renderer.render(&scene(&heap, &instances), &target(extent(64, 64)));
        assert!(matches!(
            result,
            Err(AshError::InvalidMeshReference { mesh_id: 5, .. })
        ));
        assert!(device.take_commands().is_empty());
        assert_eq!(device.submitted_frames(), 1);
        assert_eq!(renderer.frame_index(), 0);
    }

    #[test]
    fn resize_recreates_targets_and_framebuffers() {
        let dir = tempfile::tempdir().unwrap();
        write_shaders(dir.path());
        let device = Arc::new(RecordingDevice::new());
        let mut renderer =
            DeferredRenderer::new(device.clone(), config(dir.path()), extent(640, 480)).unwrap();
        let mut heap = triangle_heap(device.clone());
        heap.close_and_submit().unwrap();
        let instances = instances(0, 1);

        renderer
            .render(&scene(&heap, &instances), &target(extent(640, 480)))
            .unwrap();
        assert_eq!(device.live(ObjectKind::Framebuffer), 3);
        let images = device.live(ObjectKind::Image);

        renderer.on_resize(extent(0, 480)).unwrap();
        assert_eq!(device.wait_idle_calls(), 0);
        assert_eq!(renderer.window_size(), extent(640, 480));

        let updates = device.descriptor_update_calls();
        renderer.on_resize(extent(1024, 768)).unwrap();
        assert_eq!(device.wait_idle_calls(), 1);
        assert_eq!(device.live(ObjectKind::Framebuffer), 0);
        assert_eq!(device.live(ObjectKind::Image), images);
        // Lighting and post sets of both frame slots point at the new targets.
        assert_eq!(device.descriptor_update_calls(), updates + 4);

        let created = device.created(ObjectKind::Framebuffer);
        device.take_commands();
        renderer
            .render(&scene(&heap, &instances), &target(extent(1024, 768)))
            .unwrap();
        assert_eq!(device.created(ObjectKind::Framebuffer), created + 3);
        let extents: Vec<_> = device
            .take_commands()
            .into_iter()
            .filter_map(|c| match c {
                RecordedCommand::BeginRenderPass { framebuffer, .. } => {
                    device.framebuffer_extent(framebuffer)
                }
                _ => None,
            })
            .collect();
        assert_eq!(extents, vec![extent(1024, 768); 3]);
    }

    fn begun_framebuffers(commands: &[RecordedCommand]) -> Vec<vk::Framebuffer> {
        commands
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::BeginRenderPass { framebuffer, .. } => Some(*framebuffer),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn released_view_gets_a_fresh_framebuffer() {
        let dir = tempfile::tempdir().unwrap();
        write_shaders(dir.path());
        let device = Arc::new(RecordingDevice::new());
        let mut renderer =
            DeferredRenderer::new(device.clone(), config(dir.path()), extent(64, 64)).unwrap();
        let mut heap = triangle_heap(device.clone());
        heap.close_and_submit().unwrap();
        let instances = instances(0, 1);
        let swapchain = target(extent(64, 64));

        renderer
            .render(&scene(&heap, &instances), &swapchain)
            .unwrap();
        device.take_commands();

        renderer.release_target_views(&[swapchain.view]).unwrap();
        assert_eq!(device.wait_idle_calls(), 1);
        assert_eq!(device.live(ObjectKind::Framebuffer), 2);

        renderer
            .render(&scene(&heap, &instances), &swapchain)
            .unwrap();
        let begun = begun_framebuffers(&device.take_commands());
        assert_eq!(begun.len(), 3);
        for framebuffer in begun {
            assert_eq!(device.framebuffer_extent(framebuffer), Some(extent(64, 64)));
        }
    }

    #[test]
    fn target_lagging_behind_resize_gets_a_live_framebuffer() {
        let dir = tempfile::tempdir().unwrap();
        write_shaders(dir.path());
        let device = Arc::new(RecordingDevice::new());
        let mut renderer =
            DeferredRenderer::new(device.clone(), config(dir.path()), extent(640, 480)).unwrap();
        let mut heap = triangle_heap(device.clone());
        heap.close_and_submit().unwrap();
        let instances = instances(0, 1);

        renderer
            .render(&scene(&heap, &instances), &target(extent(640, 480)))
            .unwrap();
        renderer.on_resize(extent(1024, 768)).unwrap();
        device.take_commands();

        // The swapchain has not been recreated yet.
        renderer
            .render(&scene(&heap, &instances), &target(extent(640, 480)))
            .unwrap();
        let begun = begun_framebuffers(&device.take_commands());
        let extents: Vec<_> = begun
            .iter()
            .map(|&framebuffer| device.framebuffer_extent(framebuffer))
            .collect();
        assert_eq!(
            extents,
            vec![
                Some(extent(1024, 768)),
                Some(extent(1024, 768)),
                Some(extent(640, 480)),
            ]
        );
    }

    #[test]
    fn frames_in_flight_never_exceed_device_slots() {
        let dir = tempfile::tempdir().unwrap();
        write_shaders(dir.path());
        let device = Arc::new(RecordingDevice::with_frame_slots(1));
        let config = RendererConfig {
            frames_in_flight: 3,
            ..config(dir.path())
        };
        let mut renderer = DeferredRenderer::new(device.clone(), config, extent(64, 64)).unwrap();
        assert_eq!(renderer.frames_in_flight(), 1);

        let mut heap = triangle_heap(device.clone());
        heap.close_and_submit().unwrap();
        let instances = instances(0, 1);
        for _ in 0..3 {
            renderer
                .render(&scene(&heap, &instances), &target(extent(64, 64)))
                .unwrap();
            assert_eq!(renderer.frame_index(), 0);
        }
        assert_eq!(device.submitted_frames(), 3);
    }

    #[test]
    fn pipeline_cache_is_saved_to_the_configured_file() {
        let dir = tempfile::tempdir().unwrap();
        write_shaders(dir.path());
        let file = dir.path().join("pipelines.bin");
        let device = Arc::new(RecordingDevice::new());
        let config = RendererConfig {
            pipeline_cache_file: Some(file.clone()),
            ..config(dir.path())
        };
        let mut renderer = DeferredRenderer::new(device, config, extent(64, 64)).unwrap();

        assert!(renderer.save_pipeline_cache().unwrap());
        assert!(file.exists());
        assert!(!renderer.save_pipeline_cache().unwrap());
    }

    #[test]
    fn shaders_appearing_later_are_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(RecordingDevice::new());
        let config = RendererConfig {
            watch_shaders: true,
            ..config(dir.path())
        };
        let mut renderer = DeferredRenderer::new(device.clone(), config, extent(64, 64)).unwrap();
        assert!(renderer
            .pipeline_status()
            .iter()
            .all(|(_, status)| *status == PipelineStatus::Uninitialized));

        let mut heap = triangle_heap(device.clone());
        heap.close_and_submit().unwrap();
        let instances = instances(0, 1);
        renderer
            .render(&scene(&heap, &instances), &target(extent(64, 64)))
            .unwrap();
        let commands = device.take_commands();
        assert_eq!(
            count(&commands, |c| matches!(c, RecordedCommand::BindPipeline(_))),
            0
        );

        write_shaders(dir.path());
        renderer
            .render(&scene(&heap, &instances), &target(extent(64, 64)))
            .unwrap();
        let commands = device.take_commands();
        assert_eq!(
            count(&commands, |c| matches!(c, RecordedCommand::BindPipeline(_))),
            3
        );
        assert_eq!(
            count(&commands, |c| matches!(c, RecordedCommand::DrawIndexed { .. })),
            1
        );
        assert!(renderer
            .pipeline_status()
            .iter()
            .all(|(_, status)| *status == PipelineStatus::Valid));
    }

    #[test]
    fn textures_are_padded_with_the_fallback() {
        let dir = tempfile::tempdir().unwrap();
        write_shaders(dir.path());
        let device = Arc::new(RecordingDevice::new());
        let mut renderer =
            DeferredRenderer::new(device.clone(), config(dir.path()), extent(64, 64)).unwrap();

        let texture = SampledImage {
            view: vk::ImageView::from_raw(0xB000),
            sampler: vk::Sampler::from_raw(0xB001),
            layout: vk::ImageLayout::GENERAL,
        };
        renderer.set_textures(&[texture]).unwrap();
        assert_eq!(device.wait_idle_calls(), 1);

        let writes = device.descriptor_writes();
        let last = writes.last().unwrap();
        match &last.resource {
            DescriptorResource::CombinedImageSamplers(images) => {
                assert_eq!(images.len(), 4);
                assert_eq!(images[0], texture);
                assert_ne!(images[1].view, texture.view);
            }
            other => panic!("unexpected write: {other:?}"),
        }

        assert!(matches!(
            renderer.set_textures(&[texture; 5]),
            Err(AshError::InvalidBinding(_))
        ));
    }

    #[test]
    fn settings_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        write_shaders(dir.path());
        let device = Arc::new(RecordingDevice::new());
        let mut renderer =
            DeferredRenderer::new(device, config(dir.path()), extent(64, 64)).unwrap();

        renderer.set_exposure(-1.0);
        assert_eq!(renderer.exposure(), 0.0);
        renderer.set_bloom_intensity(5.0);
        assert_eq!(renderer.bloom_intensity(), 2.0);
        renderer.set_material_override(MaterialOverride {
            roughness: 1.5,
            ..Default::default()
        });
        assert_eq!(renderer.material_override().roughness, 1.0);

        let flags = RenderFlags::OVERRIDE_MATERIAL | RenderFlags::NO_BLOOM;
        renderer.set_render_flags(flags);
        assert!(renderer.render_flags().contains(RenderFlags::NO_BLOOM));
        assert!(!renderer.render_flags().contains(RenderFlags::SHOW_NORMALS));
    }

    #[test]
    fn drop_releases_every_object() {
        let dir = tempfile::tempdir().unwrap();
        write_shaders(dir.path());
        let device = Arc::new(RecordingDevice::new());
        {
            let mut renderer =
                DeferredRenderer::new(device.clone(), config(dir.path()), extent(64, 64))
                    .unwrap();
            let mut heap = triangle_heap(device.clone());
            heap.close_and_submit().unwrap();
            let instances = instances(0, 3);
            renderer
                .render(&scene(&heap, &instances), &target(extent(64, 64)))
                .unwrap();
            renderer.reload_shaders();
            renderer
                .render(&scene(&heap, &instances), &target(extent(64, 64)))
                .unwrap();
        }

        for kind in [
            ObjectKind::Buffer,
            ObjectKind::Image,
            ObjectKind::Sampler,
            ObjectKind::RenderPass,
            ObjectKind::Framebuffer,
            ObjectKind::DescriptorSetLayout,
            ObjectKind::DescriptorPool,
            ObjectKind::ShaderModule,
            ObjectKind::PipelineLayout,
            ObjectKind::Pipeline,
            ObjectKind::PipelineCache,
        ] {
            assert_eq!(device.live(kind), 0, "{kind:?} leaked");
        }
    }
}
