use std::ops::Range;
use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Affine3A, Mat4, Vec4};

use super::geometry_heap::{GeometryHeap, MeshId, VertexBindings};
use crate::vulkan::{BufferDesc, GpuBuffer, GpuDevice, MemoryLocation};
use crate::{AshError, Result};

/// One renderable placement of a heap mesh, resubmitted every frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Instance {
    pub transform: Affine3A,
    pub mesh_id: MeshId,
}

/// Row-major 3x4 world matrix as stored in the `worldMtx` buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct WorldMatrix {
    pub rows: [Vec4; 3],
}

impl From<&Affine3A> for WorldMatrix {
    fn from(transform: &Affine3A) -> Self {
        let m = Mat4::from(*transform).transpose();
        Self {
            rows: [m.x_axis, m.y_axis, m.z_axis],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Draw {
    pub num_indices: u32,
    pub index_offset: u32,
    pub vtx_offset: u32,
    pub num_instances: u32,
    pub instance_offset: u32,
    pub material_index: u32,
}

/// Contiguous draws sharing vertex bindings and index type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawBatch {
    pub first_draw: usize,
    pub end_draw: usize,
    pub index_type: vk::IndexType,
    pub index_buffer: vk::Buffer,
    pub vertex_bindings: VertexBindings,
    pub world_matrices: GpuBuffer,
    pub materials: GpuBuffer,
}

impl DrawBatch {
    pub fn draws(&self) -> Range<usize> {
        self.first_draw..self.end_draw
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrawList {
    pub draws: Vec<Draw>,
    pub batches: Vec<DrawBatch>,
}

impl DrawList {
    pub fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }
}

/// Where `record` pushes the per-draw material index.
#[derive(Clone, Copy, Debug)]
pub struct MaterialPush {
    pub layout: vk::PipelineLayout,
    pub stages: vk::ShaderStageFlags,
    pub offset: u32,
}

#[derive(Default)]
struct MatrixSlot {
    buffer: Option<GpuBuffer>,
    instance_count: usize,
}

/// Turns instance lists into draws and batches, keeping one world-matrix buffer per frame slot.
pub struct DrawBatchBuilder {
    device: Arc<dyn GpuDevice>,
    slots: Vec<MatrixSlot>,
    instances: Vec<Instance>,
}

/// Splits `keys` into maximal runs of equal consecutive keys.
pub fn coalesce_runs<K: PartialEq>(keys: impl IntoIterator<Item = K>) -> Vec<Range<usize>> {
    let mut runs: Vec<Range<usize>> = Vec::new();
    let mut current: Option<K> = None;
    for (i, key) in keys.into_iter().enumerate() {
        match (&current, runs.last_mut()) {
            (Some(prev), Some(run)) if *prev == key => run.end = i + 1,
            _ => runs.push(i..i + 1),
        }
        current = Some(key);
    }
    runs
}

impl DrawBatchBuilder {
    pub fn new(device: Arc<dyn GpuDevice>, frames_in_flight: usize) -> Self {
        let slots = (0..frames_in_flight.max(1))
            .map(|_| MatrixSlot::default())
            .collect();
        Self {
            device,
            slots,
            instances: Vec::new(),
        }
    }

    pub fn clear_instances(&mut self) {
        self.instances.clear();
    }

    pub fn add_instance(&mut self, transform: Affine3A, mesh_id: MeshId) {
        self.instances.push(Instance { transform, mesh_id });
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn matrix_buffer(&self, frame_index: usize) -> Option<GpuBuffer> {
        self.slots[frame_index % self.slots.len()].buffer
    }

    /// Returns the frame slot's matrix buffer, reallocating only when the instance count
    /// changed since the slot was last used.
    pub fn refresh_matrix_buffer(
        &mut self,
        frame_index: usize,
        instance_count: usize,
    ) -> Result<GpuBuffer> {
        let slot_index = frame_index % self.slots.len();
        let slot = &mut self.slots[slot_index];
        if let Some(buffer) = slot.buffer {
            if slot.instance_count == instance_count {
                return Ok(buffer);
            }
        }

        let size = (instance_count.max(1) * std::mem::size_of::<WorldMatrix>()) as vk::DeviceSize;
        let buffer = self.device.create_buffer(&BufferDesc {
            size,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER,
            location: MemoryLocation::CpuToGpu,
        })?;
        if let Some(old) = slot.buffer.replace(buffer) {
            self.device.destroy_buffer(old);
        }
        slot.instance_count = instance_count;
        log::debug!(
            "Matrix buffer for frame slot {slot_index} resized to {instance_count} instances"
        );
        Ok(buffer)
    }

    /// Builds the draw list for `instances`.
    ///
    /// Every mesh id is checked before anything is written, so a bad instance leaves the frame
    /// slot untouched.
    pub fn get_draw_batches(
        &mut self,
        frame_index: usize,
        instances: &[Instance],
        heap: &GeometryHeap,
    ) -> Result<DrawList> {
        let meshes = instances
            .iter()
            .map(|instance| heap.mesh(instance.mesh_id).copied())
            .collect::<Result<Vec<_>>>()?;
        let vertex_bindings = heap.vertex_bindings()?;
        let index_buffer = heap.index_buffer()?;
        let materials = heap.materials_buffer()?;

        let mut draws = Vec::new();
        for (instance_index, mesh) in meshes.iter().enumerate() {
            let instance_offset = u32::try_from(instance_index).map_err(|_| {
                AshError::GeometryOverflow {
                    what: "instance",
                    count: instance_index as u64,
                }
            })?;
            for primitive_id in mesh.primitives() {
                let primitive = heap.get_primitive_by_id(primitive_id)?;
                if i32::try_from(primitive.vtx_offset).is_err() {
                    return Err(AshError::GeometryOverflow {
                        what: "vertex offset",
                        count: primitive.vtx_offset as u64,
                    });
                }
                draws.push(Draw {
                    num_indices: primitive.num_indices,
                    index_offset: primitive.index_offset,
                    vtx_offset: primitive.vtx_offset,
                    num_instances: 1,
                    instance_offset,
                    material_index: primitive.material_index,
                });
            }
        }

        let world_matrices = self.refresh_matrix_buffer(frame_index, instances.len())?;
        if !instances.is_empty() {
            let matrices: Vec<WorldMatrix> = instances
                .iter()
                .map(|instance| WorldMatrix::from(&instance.transform))
                .collect();
            self.device
                .write_buffer(&world_matrices, 0, bytemuck::cast_slice(&matrices))?;
        }

        let index_type = heap.index_type();
        let batches = coalesce_runs(draws.iter().map(|_| (vertex_bindings, index_type)))
            .into_iter()
            .map(|run| DrawBatch {
                first_draw: run.start,
                end_draw: run.end,
                index_type,
                index_buffer: index_buffer.handle,
                vertex_bindings,
                world_matrices,
                materials,
            })
            .collect();

        Ok(DrawList { draws, batches })
    }

    /// Same as [`Self::get_draw_batches`] for the instances queued with `add_instance`.
    pub fn build_queued(&mut self, frame_index: usize, heap: &GeometryHeap) -> Result<DrawList> {
        let instances = std::mem::take(&mut self.instances);
        let result = self.get_draw_batches(frame_index, &instances, heap);
        self.instances = instances;
        result
    }

    /// Binds each batch's buffers and issues its indexed draws.
    pub fn record(&self, cmd: vk::CommandBuffer, list: &DrawList, material_push: Option<&MaterialPush>) {
        let mut bound_material = None;
        for batch in &list.batches {
            self.device
                .cmd_bind_vertex_buffers(cmd, 0, &batch.vertex_bindings.streams());
            self.device
                .cmd_bind_index_buffer(cmd, batch.index_buffer, 0, batch.index_type);

            for draw in &list.draws[batch.draws()] {
                if let Some(push) = material_push {
                    if bound_material != Some(draw.material_index) {
                        self.device.cmd_push_constants(
                            cmd,
                            push.layout,
                            push.stages,
                            push.offset,
                            bytemuck::bytes_of(&draw.material_index),
                        );
                        bound_material = Some(draw.material_index);
                    }
                }
                self.device.cmd_draw_indexed(
                    cmd,
                    draw.num_indices,
                    draw.num_instances,
                    draw.index_offset,
                    draw.vtx_offset as i32,
                    draw.instance_offset,
                );
            }
        }
    }
}

impl Drop for DrawBatchBuilder {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if let Some(buffer) = slot.buffer.take() {
                self.device.destroy_buffer(buffer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::{Vec2, Vec3};

    use super::*;
    use crate::renderer::geometry_heap::PrimitiveData;
    use crate::vulkan::{ObjectKind, RecordedCommand, RecordingDevice};

    /// Heap with mesh 0 = one triangle, mesh 1 = two quads using materials 0 and 1.
    fn closed_heap(device: &Arc<RecordingDevice>) -> GeometryHeap {
        let mut heap = GeometryHeap::new(device.clone());
        let positions = [Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::ONE];
        let normals = [Vec3::Z; 4];
        let uvs = [Vec2::ZERO, Vec2::X, Vec2::Y, Vec2::ONE];
        let tri = PrimitiveData {
            positions: &positions[..3],
            normals: &normals[..3],
            uvs: &uvs[..3],
            tangents: None,
            indices: &[0, 1, 2],
            material_index: 0,
        };
        let quad = PrimitiveData {
            positions: &positions,
            normals: &normals,
            uvs: &uvs,
            tangents: None,
            indices: &[0, 1, 2, 2, 1, 3],
            material_index: 0,
        };
        heap.add_material(Default::default()).unwrap();
        heap.add_material(Default::default()).unwrap();
        heap.add_mesh_data(&[tri]).unwrap();
        heap.add_mesh_data(&[quad, PrimitiveData { material_index: 1, ..quad }])
            .unwrap();
        heap.close_and_submit().unwrap();
        heap
    }

    fn instance(x: f32, mesh_id: MeshId) -> Instance {
        Instance {
            transform: Affine3A::from_translation(Vec3::new(x, 0.0, 0.0)),
            mesh_id,
        }
    }

    #[test]
    fn one_draw_per_instance_primitive() {
        let device = Arc::new(RecordingDevice::new());
        let heap = closed_heap(&device);
        let mut builder = DrawBatchBuilder::new(device.clone(), 2);

        let list = builder
            .get_draw_batches(0, &[instance(0.0, 1), instance(1.0, 0)], &heap)
            .unwrap();

        assert_eq!(list.draws.len(), 3);
        assert_eq!(
            list.draws[1],
            Draw {
                num_indices: 6,
                index_offset: 9,
                vtx_offset: 7,
                num_instances: 1,
                instance_offset: 0,
                material_index: 1,
            }
        );
        assert_eq!(list.draws[2].instance_offset, 1);
        assert_eq!(list.draws[2].vtx_offset, 0);

        assert_eq!(list.batches.len(), 1);
        assert_eq!(list.batches[0].draws(), 0..3);
        assert_eq!(list.batches[0].index_type, vk::IndexType::UINT32);
    }

    #[test]
    fn unchanged_instance_count_reuses_matrix_buffer() {
        let device = Arc::new(RecordingDevice::new());
        let heap = closed_heap(&device);
        let mut builder = DrawBatchBuilder::new(device.clone(), 2);
        let scene = [instance(0.0, 0), instance(2.0, 1)];

        let first = builder.get_draw_batches(0, &scene, &heap).unwrap();
        let second = builder.get_draw_batches(0, &scene, &heap).unwrap();
        assert_eq!(
            first.batches[0].world_matrices,
            second.batches[0].world_matrices
        );

        let buffers_before = device.created(ObjectKind::Buffer);
        builder.get_draw_batches(1, &scene, &heap).unwrap();
        builder.get_draw_batches(0, &scene, &heap).unwrap();
        builder.get_draw_batches(1, &scene, &heap).unwrap();
        // Only the first use of slot 1 allocates.
        assert_eq!(device.created(ObjectKind::Buffer), buffers_before + 1);

        builder
            .get_draw_batches(0, &[instance(0.0, 0)], &heap)
            .unwrap();
        assert_eq!(device.created(ObjectKind::Buffer), buffers_before + 2);
        assert_ne!(
            builder.matrix_buffer(0),
            Some(first.batches[0].world_matrices)
        );
    }

    #[test]
    fn matrices_are_written_row_major() {
        let device = Arc::new(RecordingDevice::new());
        let heap = closed_heap(&device);
        let mut builder = DrawBatchBuilder::new(device.clone(), 1);
        builder.add_instance(Affine3A::from_translation(Vec3::new(5.0, 6.0, 7.0)), 0);

        let list = builder.build_queued(0, &heap).unwrap();
        let bytes = device
            .buffer_contents(list.batches[0].world_matrices.handle)
            .unwrap();
        let floats: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(&floats[0..4], &[1.0, 0.0, 0.0, 5.0]);
        assert_eq!(&floats[4..8], &[0.0, 1.0, 0.0, 6.0]);
        assert_eq!(&floats[8..12], &[0.0, 0.0, 1.0, 7.0]);
        assert_eq!(builder.instances().len(), 1);
    }

    #[test]
    fn unknown_mesh_is_a_checked_error() {
        let device = Arc::new(RecordingDevice::new());
        let heap = closed_heap(&device);
        let mut builder = DrawBatchBuilder::new(device.clone(), 2);

        let result = builder.get_draw_batches(0, &[instance(0.0, 0), instance(0.0, 9)], &heap);
        assert!(matches!(
            result,
            Err(AshError::InvalidMeshReference { mesh_id: 9, mesh_count: 2 })
        ));
        assert!(builder.matrix_buffer(0).is_none());
    }

    #[test]
    fn open_heap_and_empty_scene() {
        let device = Arc::new(RecordingDevice::new());
        let open = GeometryHeap::new(device.clone());
        let mut builder = DrawBatchBuilder::new(device.clone(), 2);
        assert!(matches!(
            builder.get_draw_batches(0, &[], &open),
            Err(AshError::HeapNotClosed)
        ));

        let heap = closed_heap(&device);
        let list = builder.get_draw_batches(0, &[], &heap).unwrap();
        assert!(list.is_empty());
        assert!(list.batches.is_empty());
    }

    #[test]
    fn record_pushes_material_only_on_change() {
        let device = Arc::new(RecordingDevice::new());
        let heap = closed_heap(&device);
        let mut builder = DrawBatchBuilder::new(device.clone(), 1);
        let list = builder
            .get_draw_batches(0, &[instance(0.0, 0), instance(0.0, 0), instance(0.0, 1)], &heap)
            .unwrap();
        device.take_commands();

        let push = MaterialPush {
            layout: vk::PipelineLayout::null(),
            stages: vk::ShaderStageFlags::FRAGMENT,
            offset: 208,
        };
        builder.record(vk::CommandBuffer::null(), &list, Some(&push));

        let commands = device.take_commands();
        let draws = commands
            .iter()
            .filter(|c| matches!(c, RecordedCommand::DrawIndexed { .. }))
            .count();
        let pushes = commands
            .iter()
            .filter(|c| matches!(c, RecordedCommand::PushConstants { offset: 208, .. }))
            .count();
        assert_eq!(draws, 4);
        // Materials 0, 0, 0, 1.
        assert_eq!(pushes, 2);
    }

    #[test]
    fn runs_split_on_key_change() {
        assert_eq!(coalesce_runs([1, 1, 2, 2, 2, 1]), vec![0..2, 2..5, 5..6]);
        assert!(coalesce_runs(Vec::<u8>::new()).is_empty());
    }

    #[test]
    fn builder_releases_matrix_buffers() {
        let device = Arc::new(RecordingDevice::new());
        let heap = closed_heap(&device);
        let live_with_heap = {
            let mut builder = DrawBatchBuilder::new(device.clone(), 2);
            builder.get_draw_batches(0, &[instance(0.0, 0)], &heap).unwrap();
            builder.get_draw_batches(1, &[instance(0.0, 0)], &heap).unwrap();
            device.live(ObjectKind::Buffer)
        };
        assert_eq!(device.live(ObjectKind::Buffer), live_with_heap - 2);
    }
}
