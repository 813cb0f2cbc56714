use std::sync::Arc;

use ash::vk;

use super::render_pass::RenderTarget;
use crate::vulkan::{GpuDevice, GpuImage, ImageDesc};
use crate::{AshError, Result};

pub const BASE_COLOR_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
pub const NORMAL_PBR_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
pub const EMISSIVE_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
pub const HDR_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Window-sized images written by the geometry and lighting passes.
pub struct RenderTargets {
    device: Arc<dyn GpuDevice>,
    pub base_color_metalness: GpuImage,
    pub normal_pbr: GpuImage,
    pub emissive: GpuImage,
    pub depth: GpuImage,
    pub hdr_light: GpuImage,
}

impl RenderTargets {
    pub fn create(device: Arc<dyn GpuDevice>, extent: vk::Extent2D) -> Result<Self> {
        let color_usage = vk::ImageUsageFlags::COLOR_ATTACHMENT
            | vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::TRANSFER_DST;
        let color = |name, format| ImageDesc {
            name,
            extent,
            format,
            usage: color_usage,
            aspect: vk::ImageAspectFlags::COLOR,
        };
        let descs = [
            color("baseColorMetalness", BASE_COLOR_FORMAT),
            color("normalPBR", NORMAL_PBR_FORMAT),
            color("emissive", EMISSIVE_FORMAT),
            ImageDesc {
                name: "depth",
                extent,
                format: DEPTH_FORMAT,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_DST,
                aspect: vk::ImageAspectFlags::DEPTH,
            },
            color("hdrLight", HDR_FORMAT),
        ];

        let mut images = Vec::with_capacity(descs.len());
        for desc in &descs {
            match device.create_image(desc) {
                Ok(image) => images.push(image),
                Err(e) => {
                    for image in &images {
                        device.destroy_image(image);
                    }
                    return Err(e);
                }
            }
        }
        log::debug!("Render targets created at {}x{}", extent.width, extent.height);

        let [base_color_metalness, normal_pbr, emissive, depth, hdr_light]: [GpuImage; 5] =
            images.try_into().map_err(|images: Vec<GpuImage>| {
                AshError::VulkanError(format!("expected 5 render targets, got {}", images.len()))
            })?;
        Ok(Self {
            device,
            base_color_metalness,
            normal_pbr,
            emissive,
            depth,
            hdr_light,
        })
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.depth.extent
    }

    fn images(&self) -> [&GpuImage; 5] {
        [
            &self.base_color_metalness,
            &self.normal_pbr,
            &self.emissive,
            &self.depth,
            &self.hdr_light,
        ]
    }

    pub fn views(&self) -> Vec<vk::ImageView> {
        self.images().iter().map(|image| image.view).collect()
    }

    /// Colour attachments of the geometry pass, in shader output order.
    pub fn gbuffer(&self) -> [RenderTarget; 3] {
        [
            RenderTarget::from(&self.base_color_metalness),
            RenderTarget::from(&self.normal_pbr),
            RenderTarget::from(&self.emissive),
        ]
    }
}

impl Drop for RenderTargets {
    fn drop(&mut self) {
        for image in self.images() {
            self.device.destroy_image(image);
        }
    }
}
