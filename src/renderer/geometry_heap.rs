//! Shared geometry storage.
//!
//! Primitives are appended to CPU staging arrays while the heap is open. `close_and_submit`
//! packs everything into one vertex buffer (position | normal | tangent | uv streams), one
//! 32-bit index buffer and one material storage buffer, uploads them in a single transfer and
//! drops the staging copies. Indices are stored as given, relative to their primitive; draws
//! add the primitive's `vtx_offset`.

use std::ops::Range;
use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};

use crate::vulkan::{BufferDesc, BufferWrite, GpuBuffer, GpuDevice, LoadToken, MemoryLocation};
use crate::{AshError, Result};

pub type PrimitiveId = usize;
pub type MeshId = u32;

/// A drawable range inside the heap. Immutable once created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Primitive {
    pub vtx_offset: u32,
    pub index_offset: u32,
    pub num_indices: u32,
    pub material_index: u32,
}

/// A contiguous run of primitives drawn together for one instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mesh {
    pub first_primitive: PrimitiveId,
    pub end_primitive: PrimitiveId,
}

impl Mesh {
    pub fn primitives(&self) -> Range<PrimitiveId> {
        self.first_primitive..self.end_primitive
    }
}

/// Vertex and index data of one primitive. Vertex count is the length of the attribute
/// slices, index count the length of `indices`.
#[derive(Clone, Copy, Debug)]
pub struct PrimitiveData<'a> {
    pub positions: &'a [Vec3],
    pub normals: &'a [Vec3],
    pub uvs: &'a [Vec2],
    /// Generated from positions, normals and uvs when absent.
    pub tangents: Option<&'a [Vec4]>,
    pub indices: &'a [u32],
    pub material_index: u32,
}

/// GPU material record, read by the geometry pass through the `materials` storage buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct PbrMaterial {
    pub base_color: Vec4,
    pub emissive: Vec4,
    pub metallic: f32,
    pub roughness: f32,
    pub clear_coat: f32,
    /// Index into the texture array, negative for none.
    pub base_color_texture: i32,
}

impl Default for PbrMaterial {
    fn default() -> Self {
        Self {
            base_color: Vec4::ONE,
            emissive: Vec4::ZERO,
            metallic: 0.0,
            roughness: 0.75,
            clear_coat: 0.0,
            base_color_texture: -1,
        }
    }
}

/// Attribute stream bindings, in shader binding order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexBindings {
    pub buffer: vk::Buffer,
    pub position_offset: vk::DeviceSize,
    pub normal_offset: vk::DeviceSize,
    pub tangent_offset: vk::DeviceSize,
    pub uv_offset: vk::DeviceSize,
}

impl VertexBindings {
    pub fn streams(&self) -> [(vk::Buffer, vk::DeviceSize); 4] {
        [
            (self.buffer, self.position_offset),
            (self.buffer, self.normal_offset),
            (self.buffer, self.tangent_offset),
            (self.buffer, self.uv_offset),
        ]
    }
}

#[derive(Default)]
struct Staging {
    positions: Vec<Vec3>,
    normals: Vec<Vec3>,
    tangents: Vec<Vec4>,
    uvs: Vec<Vec2>,
    indices: Vec<u32>,
    materials: Vec<PbrMaterial>,
}

struct GpuGeometry {
    vertex_buffer: GpuBuffer,
    index_buffer: GpuBuffer,
    materials_buffer: GpuBuffer,
    bindings: VertexBindings,
    token: LoadToken,
}

enum HeapState {
    Open(Staging),
    Closed(GpuGeometry),
}

pub struct GeometryHeap {
    device: Arc<dyn GpuDevice>,
    state: HeapState,
    primitives: Vec<Primitive>,
    meshes: Vec<Mesh>,
    vertex_count: u32,
    index_count: u32,
    material_count: u32,
}

impl std::fmt::Debug for GeometryHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeometryHeap")
            .field("closed", &self.is_closed())
            .field("primitives", &self.primitives.len())
            .field("meshes", &self.meshes.len())
            .field("vertices", &self.vertex_count)
            .field("indices", &self.index_count)
            .finish()
    }
}

/// Adds `added` to `current`, failing when the total no longer fits 32-bit addressing.
pub(crate) fn checked_total(what: &'static str, current: u32, added: usize) -> Result<u32> {
    let total = current as u64 + added as u64;
    u32::try_from(total).map_err(|_| AshError::GeometryOverflow { what, count: total })
}

impl GeometryHeap {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            state: HeapState::Open(Staging::default()),
            primitives: Vec::new(),
            meshes: Vec::new(),
            vertex_count: 0,
            index_count: 0,
            material_count: 0,
        }
    }

    fn staging(&mut self) -> Result<&mut Staging> {
        match &mut self.state {
            HeapState::Open(staging) => Ok(staging),
            HeapState::Closed(_) => Err(AshError::HeapClosed),
        }
    }

    fn gpu(&self) -> Result<&GpuGeometry> {
        match &self.state {
            HeapState::Closed(gpu) => Ok(gpu),
            HeapState::Open(_) => Err(AshError::HeapNotClosed),
        }
    }

    pub fn add_primitive_data(&mut self, data: &PrimitiveData<'_>) -> Result<PrimitiveId> {
        let vertex_count = data.positions.len();
        validate(data)?;
        let new_vertex_count = checked_total("vertex", self.vertex_count, vertex_count)?;
        let new_index_count = checked_total("index", self.index_count, data.indices.len())?;

        let primitive = Primitive {
            vtx_offset: self.vertex_count,
            index_offset: self.index_count,
            num_indices: data.indices.len() as u32,
            material_index: data.material_index,
        };

        let staging = self.staging()?;
        staging.positions.extend_from_slice(data.positions);
        staging.normals.extend_from_slice(data.normals);
        staging.uvs.extend_from_slice(data.uvs);
        match data.tangents {
            Some(tangents) => staging.tangents.extend_from_slice(tangents),
            None => staging.tangents.extend(generate_tangents(
                data.positions,
                data.normals,
                data.uvs,
                data.indices,
            )),
        }
        staging.indices.extend_from_slice(data.indices);

        self.vertex_count = new_vertex_count;
        self.index_count = new_index_count;
        self.primitives.push(primitive);
        Ok(self.primitives.len() - 1)
    }

    /// Registers the primitives in `primitives` as one mesh.
    pub fn add_mesh(&mut self, primitives: Range<PrimitiveId>) -> Result<MeshId> {
        self.staging()?;
        if primitives.start > primitives.end || primitives.end > self.primitives.len() {
            return Err(AshError::InvalidPrimitiveReference {
                id: primitives.end.max(primitives.start),
                count: self.primitives.len(),
            });
        }
        let id = u32::try_from(self.meshes.len()).map_err(|_| AshError::GeometryOverflow {
            what: "mesh",
            count: self.meshes.len() as u64,
        })?;
        self.meshes.push(Mesh {
            first_primitive: primitives.start,
            end_primitive: primitives.end,
        });
        Ok(id)
    }

    /// Adds every primitive and registers them together as one mesh.
    pub fn add_mesh_data(&mut self, primitives: &[PrimitiveData<'_>]) -> Result<MeshId> {
        let first = self.primitives.len();
        for data in primitives {
            self.add_primitive_data(data)?;
        }
        self.add_mesh(first..self.primitives.len())
    }

    pub fn add_material(&mut self, material: PbrMaterial) -> Result<u32> {
        let id = self.material_count;
        let new_count = checked_total("material", id, 1)?;
        self.staging()?.materials.push(material);
        self.material_count = new_count;
        Ok(id)
    }

    pub fn get_primitive_by_id(&self, id: PrimitiveId) -> Result<&Primitive> {
        self.primitives
            .get(id)
            .ok_or(AshError::InvalidPrimitiveReference {
                id,
                count: self.primitives.len(),
            })
    }

    pub fn mesh(&self, id: MeshId) -> Result<&Mesh> {
        self.meshes
            .get(id as usize)
            .ok_or(AshError::InvalidMeshReference {
                mesh_id: id,
                mesh_count: self.meshes.len(),
            })
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    pub fn primitive_count(&self) -> usize {
        self.primitives.len()
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, HeapState::Closed(_))
    }

    /// Uploads all staged data and seals the heap.
    pub fn close_and_submit(&mut self) -> Result<LoadToken> {
        let staging = match &mut self.state {
            HeapState::Open(staging) => staging,
            HeapState::Closed(_) => return Err(AshError::HeapClosed),
        };

        let default_material = [PbrMaterial::default()];
        let material_list: &[PbrMaterial] = if staging.materials.is_empty() {
            &default_material
        } else {
            &staging.materials
        };
        let material_count = material_list.len();
        if let Some((id, primitive)) = self
            .primitives
            .iter()
            .enumerate()
            .find(|(_, p)| p.material_index as usize >= material_count)
        {
            return Err(AshError::InvalidGeometry(format!(
                "primitive {id} uses material {} but the heap holds {material_count}",
                primitive.material_index
            )));
        }

        let positions: &[u8] = bytemuck::cast_slice(&staging.positions);
        let normals: &[u8] = bytemuck::cast_slice(&staging.normals);
        let tangents: &[u8] = bytemuck::cast_slice(&staging.tangents);
        let uvs: &[u8] = bytemuck::cast_slice(&staging.uvs);
        let indices: &[u8] = bytemuck::cast_slice(&staging.indices);
        let materials: &[u8] = bytemuck::cast_slice(material_list);

        let normal_offset = positions.len() as vk::DeviceSize;
        let tangent_offset = normal_offset + normals.len() as vk::DeviceSize;
        let uv_offset = tangent_offset + tangents.len() as vk::DeviceSize;
        let vertex_bytes = uv_offset + uvs.len() as vk::DeviceSize;

        let mut created = Vec::with_capacity(3);
        let result = (|| -> Result<GpuGeometry> {
            let vertex_buffer = self.device.create_buffer(&BufferDesc {
                size: vertex_bytes,
                usage: vk::BufferUsageFlags::VERTEX_BUFFER,
                location: MemoryLocation::GpuOnly,
            })?;
            created.push(vertex_buffer);
            let index_buffer = self.device.create_buffer(&BufferDesc {
                size: indices.len() as vk::DeviceSize,
                usage: vk::BufferUsageFlags::INDEX_BUFFER,
                location: MemoryLocation::GpuOnly,
            })?;
            created.push(index_buffer);
            let materials_buffer = self.device.create_buffer(&BufferDesc {
                size: materials.len() as vk::DeviceSize,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                location: MemoryLocation::GpuOnly,
            })?;
            created.push(materials_buffer);

            let token = self.device.upload(&[
                BufferWrite {
                    buffer: vertex_buffer,
                    offset: 0,
                    data: positions,
                },
                BufferWrite {
                    buffer: vertex_buffer,
                    offset: normal_offset,
                    data: normals,
                },
                BufferWrite {
                    buffer: vertex_buffer,
                    offset: tangent_offset,
                    data: tangents,
                },
                BufferWrite {
                    buffer: vertex_buffer,
                    offset: uv_offset,
                    data: uvs,
                },
                BufferWrite {
                    buffer: index_buffer,
                    offset: 0,
                    data: indices,
                },
                BufferWrite {
                    buffer: materials_buffer,
                    offset: 0,
                    data: materials,
                },
            ])?;

            Ok(GpuGeometry {
                vertex_buffer,
                index_buffer,
                materials_buffer,
                bindings: VertexBindings {
                    buffer: vertex_buffer.handle,
                    position_offset: 0,
                    normal_offset,
                    tangent_offset,
                    uv_offset,
                },
                token,
            })
        })();

        let gpu = match result {
            Ok(gpu) => gpu,
            Err(e) => {
                for buffer in created {
                    self.device.destroy_buffer(buffer);
                }
                return Err(e);
            }
        };

        log::info!(
            "Geometry heap submitted: {} primitives, {} meshes, {} vertices, {} indices, {} materials ({} bytes)",
            self.primitives.len(),
            self.meshes.len(),
            self.vertex_count,
            self.index_count,
            material_count,
            vertex_bytes + indices.len() as u64 + materials.len() as u64
        );

        let token = gpu.token;
        self.material_count = material_count as u32;
        self.state = HeapState::Closed(gpu);
        Ok(token)
    }

    /// True once the upload issued by `close_and_submit` has completed.
    pub fn is_ready(&self) -> Result<bool> {
        match &self.state {
            HeapState::Open(_) => Ok(false),
            HeapState::Closed(gpu) => self.device.is_load_complete(gpu.token),
        }
    }

    pub fn load_token(&self) -> Option<LoadToken> {
        self.gpu().ok().map(|gpu| gpu.token)
    }

    /// Binds the four attribute streams to bindings 0..4 and the 32-bit index buffer.
    pub fn bind_buffers(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let gpu = self.gpu()?;
        self.device
            .cmd_bind_vertex_buffers(cmd, 0, &gpu.bindings.streams());
        self.device
            .cmd_bind_index_buffer(cmd, gpu.index_buffer.handle, 0, vk::IndexType::UINT32);
        Ok(())
    }

    pub fn vertex_bindings(&self) -> Result<VertexBindings> {
        Ok(self.gpu()?.bindings)
    }

    pub fn index_buffer(&self) -> Result<GpuBuffer> {
        Ok(self.gpu()?.index_buffer)
    }

    pub fn materials_buffer(&self) -> Result<GpuBuffer> {
        Ok(self.gpu()?.materials_buffer)
    }

    pub fn index_type(&self) -> vk::IndexType {
        vk::IndexType::UINT32
    }
}

impl Drop for GeometryHeap {
    fn drop(&mut self) {
        if let HeapState::Closed(gpu) = &self.state {
            self.device.destroy_buffer(gpu.vertex_buffer);
            self.device.destroy_buffer(gpu.index_buffer);
            self.device.destroy_buffer(gpu.materials_buffer);
        }
    }
}

fn validate(data: &PrimitiveData<'_>) -> Result<()> {
    let vertex_count = data.positions.len();
    if data.normals.len() != vertex_count || data.uvs.len() != vertex_count {
        return Err(AshError::InvalidGeometry(format!(
            "attribute lengths differ: {} positions, {} normals, {} uvs",
            vertex_count,
            data.normals.len(),
            data.uvs.len()
        )));
    }
    if let Some(tangents) = data.tangents {
        if tangents.len() != vertex_count {
            return Err(AshError::InvalidGeometry(format!(
                "{} tangents for {vertex_count} vertices",
                tangents.len()
            )));
        }
    }
    if data.indices.len() % 3 != 0 {
        return Err(AshError::InvalidGeometry(format!(
            "index count {} is not a multiple of 3",
            data.indices.len()
        )));
    }
    if let Some(&index) = data.indices.iter().find(|&&i| i as usize >= vertex_count) {
        return Err(AshError::InvalidGeometry(format!(
            "index {index} out of range for {vertex_count} vertices"
        )));
    }
    Ok(())
}

/// Per-vertex tangents with handedness in `w`.
///
/// Triangle tangents are accumulated per vertex, then orthogonalised against the normal.
pub fn generate_tangents(
    positions: &[Vec3],
    normals: &[Vec3],
    uvs: &[Vec2],
    indices: &[u32],
) -> Vec<Vec4> {
    let mut tan_u = vec![Vec3::ZERO; positions.len()];
    let mut tan_v = vec![Vec3::ZERO; positions.len()];

    for triangle in indices.chunks_exact(3) {
        let [i0, i1, i2] = [
            triangle[0] as usize,
            triangle[1] as usize,
            triangle[2] as usize,
        ];
        let e1 = positions[i1] - positions[i0];
        let e2 = positions[i2] - positions[i0];
        let d1 = uvs[i1] - uvs[i0];
        let d2 = uvs[i2] - uvs[i0];

        let det = d1.x * d2.y - d2.x * d1.y;
        if det.abs() <= f32::EPSILON {
            continue;
        }
        let r = 1.0 / det;
        let sdir = (e1 * d2.y - e2 * d1.y) * r;
        let tdir = (e2 * d1.x - e1 * d2.x) * r;
        for i in [i0, i1, i2] {
            tan_u[i] += sdir;
            tan_v[i] += tdir;
        }
    }

    normals
        .iter()
        .zip(tan_u.iter().zip(&tan_v))
        .map(|(&n, (&t, &b))| {
            let n = n.normalize_or_zero();
            let tangent = (t - n * n.dot(t)).normalize_or_zero();
            if tangent == Vec3::ZERO {
                let fallback = if n == Vec3::ZERO {
                    Vec3::X
                } else {
                    n.any_orthonormal_vector()
                };
                return fallback.extend(1.0);
            }
            let handedness = if n.cross(t).dot(b) < 0.0 { -1.0 } else { 1.0 };
            tangent.extend(handedness)
        })
        .collect()
}
