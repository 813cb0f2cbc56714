use std::sync::Arc;

use ash::vk;

use super::descriptor_layout::{pool_sizes, BindingKind, NamedBinding};
use super::device::{DescriptorResource, DescriptorWrite, GpuBuffer, GpuDevice, SampledImage};
use crate::{AshError, Result};

/// A sealed descriptor set layout together with its pre-allocated set instances.
///
/// The sets are allocated once in [`super::DescriptorSetLayoutBuilder::close`] and never
/// reallocated; instance `i` is meant to be written only while no in-flight command buffer
/// references it.
pub struct DescriptorSetPool {
    device: Arc<dyn GpuDevice>,
    layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    bindings: Vec<NamedBinding>,
}

impl DescriptorSetPool {
    pub(crate) fn allocate(
        device: Arc<dyn GpuDevice>,
        layout: vk::DescriptorSetLayout,
        bindings: Vec<NamedBinding>,
        pool_size: usize,
    ) -> Result<Self> {
        let sizes = pool_sizes(&bindings, pool_size);
        let pool = match device.create_descriptor_pool(pool_size as u32, &sizes) {
            Ok(pool) => pool,
            Err(e) => {
                device.destroy_descriptor_set_layout(layout);
                return Err(e);
            }
        };

        let layouts = vec![layout; pool_size];
        let sets = match device.allocate_descriptor_sets(pool, &layouts) {
            Ok(sets) => sets,
            Err(e) => {
                device.destroy_descriptor_pool(pool);
                device.destroy_descriptor_set_layout(layout);
                return Err(e);
            }
        };

        log::debug!(
            "Descriptor pool sealed: {} bindings x {} sets",
            bindings.len(),
            sets.len()
        );

        Ok(Self {
            device,
            layout,
            pool,
            sets,
            bindings,
        })
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub fn pool_size(&self) -> usize {
        self.sets.len()
    }

    pub fn descriptor(&self, index: usize) -> Result<vk::DescriptorSet> {
        self.sets
            .get(index)
            .copied()
            .ok_or(AshError::DescriptorIndexOutOfRange {
                index,
                pool_size: self.sets.len(),
            })
    }

    pub fn binding(&self, name: &str) -> Option<&NamedBinding> {
        self.bindings.iter().find(|b| b.name == name)
    }

    fn lookup(&self, name: &str, kind: BindingKind) -> Result<&NamedBinding> {
        self.bindings
            .iter()
            .find(|b| b.name == name && b.kind == kind)
            .ok_or_else(|| AshError::UnknownBinding {
                name: name.to_string(),
                kind: kind.label(),
            })
    }

    /// Writes a whole texture array into set `index` right away.
    pub fn write_texture_array(
        &self,
        index: usize,
        name: &str,
        textures: &[SampledImage],
    ) -> Result<()> {
        let set = self.descriptor(index)?;
        let binding = self.lookup(name, BindingKind::TextureArray)?;
        if textures.len() > binding.count as usize {
            return Err(AshError::InvalidBinding(format!(
                "texture array '{name}' holds {} textures, got {}",
                binding.count,
                textures.len()
            )));
        }
        if textures.is_empty() {
            return Ok(());
        }
        self.device.update_descriptor_sets(&[DescriptorWrite {
            set,
            binding: binding.slot,
            array_element: 0,
            resource: DescriptorResource::CombinedImageSamplers(textures.to_vec()),
        }]);
        Ok(())
    }
}

impl Drop for DescriptorSetPool {
    fn drop(&mut self) {
        self.device.destroy_descriptor_pool(self.pool);
        self.device.destroy_descriptor_set_layout(self.layout);
    }
}

/// Accumulates writes into one set instance and submits them with a single update call.
pub struct DescriptorSetUpdate<'a> {
    pool: &'a DescriptorSetPool,
    set: vk::DescriptorSet,
    writes: Vec<DescriptorWrite>,
}

impl<'a> DescriptorSetUpdate<'a> {
    pub fn new(pool: &'a DescriptorSetPool, index: usize) -> Result<Self> {
        Ok(Self {
            pool,
            set: pool.descriptor(index)?,
            writes: Vec::new(),
        })
    }

    pub fn add_storage_buffer(&mut self, name: &str, buffer: GpuBuffer) -> Result<&mut Self> {
        let slot = self.pool.lookup(name, BindingKind::StorageBuffer)?.slot;
        self.push(slot, 0, DescriptorResource::StorageBuffer(buffer));
        Ok(self)
    }

    /// Binds a single texture. Names declared as texture arrays receive it in element 0.
    pub fn set_texture(&mut self, name: &str, texture: SampledImage) -> Result<&mut Self> {
        let slot = match self.pool.lookup(name, BindingKind::Texture) {
            Ok(binding) => binding.slot,
            Err(err) => match self.pool.lookup(name, BindingKind::TextureArray) {
                Ok(binding) => binding.slot,
                Err(_) => return Err(err),
            },
        };
        self.push(
            slot,
            0,
            DescriptorResource::CombinedImageSamplers(vec![texture]),
        );
        Ok(self)
    }

    pub fn set_image(&mut self, name: &str, view: vk::ImageView) -> Result<&mut Self> {
        let slot = self.pool.lookup(name, BindingKind::StorageImage)?.slot;
        self.push(slot, 0, DescriptorResource::StorageImage(view));
        Ok(self)
    }

    fn push(&mut self, binding: u32, array_element: u32, resource: DescriptorResource) {
        self.writes.push(DescriptorWrite {
            set: self.set,
            binding,
            array_element,
            resource,
        });
    }

    pub fn pending(&self) -> usize {
        self.writes.len()
    }

    /// Issues all accumulated writes as one batched update.
    pub fn send(self) {
        if self.writes.is_empty() {
            return;
        }
        self.pool.device.update_descriptor_sets(&self.writes);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use ash::vk::Handle;

    use super::*;
    use crate::vulkan::{DescriptorSetLayoutBuilder, ObjectKind, RecordingDevice};

    fn sealed(device: &Arc<RecordingDevice>, pool_size: usize) -> DescriptorSetPool {
        DescriptorSetLayoutBuilder::new()
            .add_storage_buffer("worldMtx", 0, vk::ShaderStageFlags::VERTEX)
            .add_storage_buffer("materials", 1, vk::ShaderStageFlags::FRAGMENT)
            .add_texture("hdr", 2, vk::ShaderStageFlags::FRAGMENT)
            .add_texture_array("textures", 3, vk::ShaderStageFlags::FRAGMENT, 8)
            .add_image("bloom", 4, vk::ShaderStageFlags::FRAGMENT)
            .close(device.clone(), pool_size)
            .unwrap()
    }

    fn buffer(raw: u64) -> GpuBuffer {
        GpuBuffer {
            handle: vk::Buffer::from_raw(raw),
            size: 64,
        }
    }

    fn texture(raw: u64) -> SampledImage {
        SampledImage {
            view: vk::ImageView::from_raw(raw),
            sampler: vk::Sampler::from_raw(raw + 1),
            layout: vk::ImageLayout::GENERAL,
        }
    }

    #[test]
    fn pool_hands_out_stable_distinct_sets() {
        let device = Arc::new(RecordingDevice::new());
        let pool = sealed(&device, 3);

        let first: Vec<_> = (0..3).map(|i| pool.descriptor(i).unwrap()).collect();
        let unique: HashSet<_> = first.iter().copied().collect();
        assert_eq!(unique.len(), 3);

        let again: Vec<_> = (0..3).map(|i| pool.descriptor(i).unwrap()).collect();
        assert_eq!(first, again);
        assert!(matches!(
            pool.descriptor(3),
            Err(AshError::DescriptorIndexOutOfRange { index: 3, pool_size: 3 })
        ));
    }

    #[test]
    fn update_sends_one_batched_call() {
        let device = Arc::new(RecordingDevice::new());
        let pool = sealed(&device, 2);

        let mut update = DescriptorSetUpdate::new(&pool, 1).unwrap();
        update
            .add_storage_buffer("worldMtx", buffer(100))
            .unwrap()
            .add_storage_buffer("materials", buffer(200))
            .unwrap()
            .set_texture("hdr", texture(300))
            .unwrap();
        assert_eq!(update.pending(), 3);
        update.send();

        assert_eq!(device.descriptor_update_calls(), 1);
        let writes = device.descriptor_writes();
        assert_eq!(writes.len(), 3);
        assert!(writes.iter().all(|w| w.set == pool.descriptor(1).unwrap()));
        assert_eq!(
            writes.iter().map(|w| w.binding).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn undeclared_names_fail_uniformly() {
        let device = Arc::new(RecordingDevice::new());
        let pool = sealed(&device, 1);
        let mut update = DescriptorSetUpdate::new(&pool, 0).unwrap();

        assert!(matches!(
            update.add_storage_buffer("lights", buffer(1)),
            Err(AshError::UnknownBinding { .. })
        ));
        // Declared, but as a texture rather than a storage buffer.
        assert!(matches!(
            update.add_storage_buffer("hdr", buffer(1)),
            Err(AshError::UnknownBinding { .. })
        ));
        assert!(update.set_texture("missing", texture(5)).is_err());
        assert!(update.set_image("hdr", vk::ImageView::from_raw(9)).is_err());
        assert!(pool.write_texture_array(0, "hdr", &[texture(5)]).is_err());

        update.send();
        assert_eq!(device.descriptor_update_calls(), 0);
    }

    #[test]
    fn texture_array_writes_respect_capacity() {
        let device = Arc::new(RecordingDevice::new());
        let pool = sealed(&device, 1);

        let textures: Vec<_> = (0..4).map(|i| texture(1000 + i * 2)).collect();
        pool.write_texture_array(0, "textures", &textures).unwrap();
        assert_eq!(device.descriptor_update_calls(), 1);

        let too_many: Vec<_> = (0..9).map(|i| texture(2000 + i * 2)).collect();
        assert!(matches!(
            pool.write_texture_array(0, "textures", &too_many),
            Err(AshError::InvalidBinding(_))
        ));
    }

    #[test]
    fn drop_releases_pool_and_layout() {
        let device = Arc::new(RecordingDevice::new());
        {
            let _pool = sealed(&device, 2);
            assert_eq!(device.live(ObjectKind::DescriptorPool), 1);
            assert_eq!(device.live(ObjectKind::DescriptorSetLayout), 1);
        }
        assert_eq!(device.live(ObjectKind::DescriptorPool), 0);
        assert_eq!(device.live(ObjectKind::DescriptorSetLayout), 0);
    }
}
