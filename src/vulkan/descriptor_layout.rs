use std::collections::HashSet;
use std::sync::Arc;

use ash::vk;

use super::descriptor_pool::DescriptorSetPool;
use super::device::{GpuDevice, LayoutBinding};
use crate::{AshError, Result};

/// Resource kind of a declared binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingKind {
    StorageBuffer,
    Texture,
    TextureArray,
    StorageImage,
}

impl BindingKind {
    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            BindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            BindingKind::Texture | BindingKind::TextureArray => {
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            }
            BindingKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        }
    }

    pub(crate) fn label(self) -> &'static str {
        match self {
            BindingKind::StorageBuffer => "storage buffer",
            BindingKind::Texture => "texture",
            BindingKind::TextureArray => "texture array",
            BindingKind::StorageImage => "storage image",
        }
    }
}

/// A named, shader-visible slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedBinding {
    pub name: String,
    pub slot: u32,
    pub kind: BindingKind,
    pub stages: vk::ShaderStageFlags,
    pub count: u32,
}

impl NamedBinding {
    fn layout_binding(&self) -> LayoutBinding {
        LayoutBinding {
            slot: self.slot,
            descriptor_type: self.kind.descriptor_type(),
            count: self.count,
            stages: self.stages,
        }
    }
}

/// Declares the bindings of a descriptor set, then seals them into a [`DescriptorSetPool`].
///
/// Slot assignment is the caller's responsibility; the builder records what was declared.
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<NamedBinding>,
}

impl DescriptorSetLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(
        mut self,
        name: &str,
        slot: u32,
        kind: BindingKind,
        stages: vk::ShaderStageFlags,
        count: u32,
    ) -> Self {
        self.bindings.push(NamedBinding {
            name: name.to_string(),
            slot,
            kind,
            stages,
            count,
        });
        self
    }

    pub fn add_storage_buffer(self, name: &str, slot: u32, stages: vk::ShaderStageFlags) -> Self {
        self.add(name, slot, BindingKind::StorageBuffer, stages, 1)
    }

    pub fn add_texture(self, name: &str, slot: u32, stages: vk::ShaderStageFlags) -> Self {
        self.add(name, slot, BindingKind::Texture, stages, 1)
    }

    pub fn add_texture_array(
        self,
        name: &str,
        slot: u32,
        stages: vk::ShaderStageFlags,
        count: u32,
    ) -> Self {
        self.add(name, slot, BindingKind::TextureArray, stages, count)
    }

    pub fn add_image(self, name: &str, slot: u32, stages: vk::ShaderStageFlags) -> Self {
        self.add(name, slot, BindingKind::StorageImage, stages, 1)
    }

    pub fn bindings(&self) -> &[NamedBinding] {
        &self.bindings
    }

    /// Seals the layout and pre-allocates `pool_size` descriptor sets.
    pub fn close(self, device: Arc<dyn GpuDevice>, pool_size: usize) -> Result<DescriptorSetPool> {
        if pool_size == 0 {
            return Err(AshError::InvalidBinding(
                "descriptor pool needs at least one set".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for binding in &self.bindings {
            if binding.name.is_empty() {
                return Err(AshError::InvalidBinding(format!(
                    "binding at slot {} has an empty name",
                    binding.slot
                )));
            }
            if !names.insert(binding.name.as_str()) {
                return Err(AshError::InvalidBinding(format!(
                    "binding name '{}' declared twice",
                    binding.name
                )));
            }
            if binding.count == 0 {
                return Err(AshError::InvalidBinding(format!(
                    "binding '{}' has zero descriptors",
                    binding.name
                )));
            }
        }

        let layout_bindings: Vec<LayoutBinding> =
            self.bindings.iter().map(NamedBinding::layout_binding).collect();
        let layout = device.create_descriptor_set_layout(&layout_bindings)?;

        DescriptorSetPool::allocate(device, layout, self.bindings, pool_size)
    }
}

/// Per-type descriptor counts for a pool holding `pool_size` copies of `bindings`.
pub(crate) fn pool_sizes(bindings: &[NamedBinding], pool_size: usize) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for binding in bindings {
        let ty = binding.kind.descriptor_type();
        let count = binding.count * pool_size as u32;
        match sizes.iter_mut().find(|s| s.ty == ty) {
            Some(size) => size.descriptor_count += count,
            None => sizes.push(vk::DescriptorPoolSize {
                ty,
                descriptor_count: count,
            }),
        }
    }
    sizes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vulkan::{ObjectKind, RecordingDevice};

    fn frame_layout() -> DescriptorSetLayoutBuilder {
        DescriptorSetLayoutBuilder::new()
            .add_storage_buffer("worldMtx", 0, vk::ShaderStageFlags::VERTEX)
            .add_storage_buffer("materials", 1, vk::ShaderStageFlags::FRAGMENT)
            .add_texture_array("textures", 2, vk::ShaderStageFlags::FRAGMENT, 16)
    }

    #[test]
    fn pool_sizes_sum_per_descriptor_type() {
        let builder = frame_layout();
        let sizes = pool_sizes(builder.bindings(), 3);

        let storage = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::STORAGE_BUFFER)
            .unwrap();
        let samplers = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .unwrap();
        assert_eq!(storage.descriptor_count, 6);
        assert_eq!(samplers.descriptor_count, 48);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let device = Arc::new(RecordingDevice::new());
        let result = DescriptorSetLayoutBuilder::new()
            .add_texture("albedo", 0, vk::ShaderStageFlags::FRAGMENT)
            .add_texture("albedo", 1, vk::ShaderStageFlags::FRAGMENT)
            .close(device.clone(), 2);

        assert!(matches!(result, Err(AshError::InvalidBinding(_))));
        assert_eq!(device.created(ObjectKind::DescriptorSetLayout), 0);
    }

    #[test]
    fn empty_pool_is_rejected() {
        let device = Arc::new(RecordingDevice::new());
        assert!(frame_layout().close(device, 0).is_err());
    }
}
