// SPDX-License-Identifier: CEPL-1.0
use crate::device::{BufferUsage, CommandBuffer, Device, GpuBuffer};
use crate::pipeline::{VertexAttribute, VertexBinding, VertexFormat, VertexInputDescription};
use bismuth_core::{EngineError, Result};
use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use std::mem::{offset_of, size_of};
use std::sync::Arc;
use tracing::debug;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub color: Vec3,
}

impl Vertex {
    pub const fn new(position: Vec3, color: Vec3) -> Self {
        Self { position, color }
    }

    /// One interleaved binding; location 0 = position, 1 = color.
    pub fn input_description() -> VertexInputDescription {
        VertexInputDescription {
            bindings: vec![VertexBinding {
                binding: 0,
                stride: size_of::<Vertex>() as u32,
            }],
            attributes: vec![
                VertexAttribute {
                    location: 0,
                    binding: 0,
                    format: VertexFormat::Float32x3,
                    offset: offset_of!(Vertex, position) as u32,
                },
                VertexAttribute {
                    location: 1,
                    binding: 0,
                    format: VertexFormat::Float32x3,
                    offset: offset_of!(Vertex, color) as u32,
                },
            ],
        }
    }
}

/// Decoded geometry. An empty `indices` list draws the vertices in order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

/// Immutable GPU copy of a [`MeshData`].
pub struct Mesh<D: Device> {
    device: Arc<D>,
    vertex_buffer: GpuBuffer,
    vertex_count: u32,
    index_buffer: Option<GpuBuffer>,
    index_count: u32,
}

impl<D: Device> Mesh<D> {
    pub fn new(device: Arc<D>, data: &MeshData) -> Result<Self> {
        if data.vertices.len() < 3 {
            return Err(EngineError::precondition(format!(
                "a mesh needs at least 3 vertices (got {})",
                data.vertices.len()
            )));
        }
        let vertex_count = data.vertices.len() as u32;
        if let Some(bad) = data.indices.iter().find(|&&i| i >= vertex_count) {
            return Err(EngineError::precondition(format!(
                "index {bad} is out of range for {vertex_count} vertices"
            )));
        }

        let vertex_buffer =
            device.create_buffer(BufferUsage::Vertex, bytemuck::cast_slice(&data.vertices))?;
        let mut mesh = Self {
            device,
            vertex_buffer,
            vertex_count,
            index_buffer: None,
            index_count: 0,
        };
        if !data.indices.is_empty() {
            mesh.index_buffer = Some(
                mesh.device
                    .create_buffer(BufferUsage::Index, bytemuck::cast_slice(&data.indices))?,
            );
            mesh.index_count = data.indices.len() as u32;
        }

        debug!(
            "mesh uploaded: {} vertices, {} indices",
            mesh.vertex_count, mesh.index_count
        );
        Ok(mesh)
    }

    pub fn bind(&self, cmd: CommandBuffer) {
        self.device
            .cmd_bind_vertex_buffer(cmd, self.vertex_buffer.buffer);
        if let Some(index_buffer) = &self.index_buffer {
            self.device.cmd_bind_index_buffer(cmd, index_buffer.buffer);
        }
    }

    pub fn draw(&self, cmd: CommandBuffer) {
        if self.index_buffer.is_some() {
            self.device.cmd_draw_indexed(cmd, self.index_count);
        } else {
            self.device.cmd_draw(cmd, self.vertex_count);
        }
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn is_indexed(&self) -> bool {
        self.index_buffer.is_some()
    }
}

impl<D: Device> Drop for Mesh<D> {
    fn drop(&mut self) {
        if let Some(index_buffer) = self.index_buffer.take() {
            self.device.destroy_buffer(index_buffer);
        }
        self.device.destroy_buffer(self.vertex_buffer);
    }
}

/// Stable reference to a mesh in a [`MeshArena`]. A handle whose mesh has
/// been released never resolves again, even if its slot is reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MeshHandle {
    index: u32,
    generation: u32,
}

struct Entry<D: Device> {
    mesh: Mesh<D>,
    refs: usize,
}

struct Slot<D: Device> {
    generation: u32,
    entry: Option<Entry<D>>,
}

/// Reference-counted mesh storage shared by scene objects.
pub struct MeshArena<D: Device> {
    slots: Vec<Slot<D>>,
    free: Vec<u32>,
}

impl<D: Device> Default for MeshArena<D> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<D: Device> MeshArena<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `mesh` with a reference count of one, owned by the caller.
    pub fn insert(&mut self, mesh: Mesh<D>) -> MeshHandle {
        let entry = Some(Entry { mesh, refs: 1 });
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = entry;
            MeshHandle {
                index,
                generation: slot.generation,
            }
        } else {
            self.slots.push(Slot {
                generation: 0,
                entry,
            });
            MeshHandle {
                index: self.slots.len() as u32 - 1,
                generation: 0,
            }
        }
    }

    pub fn get(&self, handle: MeshHandle) -> Option<&Mesh<D>> {
        self.slot(handle)
            .and_then(|s| s.entry.as_ref())
            .map(|e| &e.mesh)
    }

    pub fn ref_count(&self, handle: MeshHandle) -> Option<usize> {
        self.slot(handle).and_then(|s| s.entry.as_ref()).map(|e| e.refs)
    }

    /// Adds a reference to a live mesh.
    pub fn retain(&mut self, handle: MeshHandle) -> Result<MeshHandle> {
        let entry = self
            .entry_mut(handle)
            .ok_or_else(|| stale_handle("retain", handle))?;
        entry.refs += 1;
        Ok(handle)
    }

    /// Drops a reference; the mesh is destroyed with the last one. Returns
    /// whether that happened.
    pub fn release(&mut self, handle: MeshHandle) -> Result<bool> {
        let entry = self
            .entry_mut(handle)
            .ok_or_else(|| stale_handle("release", handle))?;
        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(false);
        }

        let slot = &mut self.slots[handle.index as usize];
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, handle: MeshHandle) -> Option<&Slot<D>> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
    }

    fn entry_mut(&mut self, handle: MeshHandle) -> Option<&mut Entry<D>> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.entry.as_mut())
    }
}

fn stale_handle(op: &str, handle: MeshHandle) -> EngineError {
    EngineError::precondition(format!("{op} on a released mesh handle {handle:?}"))
}

/// Shape helpers used by the demo scenes and tests.
pub mod shapes {
    use super::{MeshData, Vertex};
    use glam::Vec3;

    pub fn triangle() -> MeshData {
        MeshData {
            vertices: vec![
                Vertex::new(Vec3::new(0.0, -0.5, 0.0), Vec3::new(1.0, 0.0, 0.0)),
                Vertex::new(Vec3::new(0.5, 0.5, 0.0), Vec3::new(0.0, 1.0, 0.0)),
                Vertex::new(Vec3::new(-0.5, 0.5, 0.0), Vec3::new(0.0, 0.0, 1.0)),
            ],
            indices: Vec::new(),
        }
    }

    /// Unit cube centred on the origin, one color per face, indexed.
    pub fn cube() -> MeshData {
        let faces: [(Vec3, Vec3, Vec3, Vec3); 6] = [
            // normal, u, v, color
            (Vec3::NEG_X, Vec3::Y, Vec3::Z, Vec3::new(0.9, 0.9, 0.9)),
            (Vec3::X, Vec3::Z, Vec3::Y, Vec3::new(0.8, 0.8, 0.1)),
            (Vec3::NEG_Y, Vec3::Z, Vec3::X, Vec3::new(0.9, 0.6, 0.1)),
            (Vec3::Y, Vec3::X, Vec3::Z, Vec3::new(0.8, 0.1, 0.1)),
            (Vec3::Z, Vec3::X, Vec3::Y, Vec3::new(0.1, 0.1, 0.8)),
            (Vec3::NEG_Z, Vec3::Y, Vec3::X, Vec3::new(0.1, 0.8, 0.1)),
        ];

        let mut data = MeshData::default();
        for (normal, u, v, color) in faces {
            let base = data.vertices.len() as u32;
            let centre = normal * 0.5;
            for (su, sv) in [(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5)] {
                data.vertices.push(Vertex::new(centre + u * su + v * sv, color));
            }
            data.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Command, MockDevice};

    fn upload(device: &Arc<MockDevice>, data: &MeshData) -> Mesh<MockDevice> {
        Mesh::new(device.clone(), data).unwrap()
    }

    #[test]
    fn vertex_layout_matches_the_shader_inputs() {
        let desc = Vertex::input_description();
        assert_eq!(desc.bindings[0].stride, 24);
        assert_eq!(desc.attributes[0].offset, 0);
        assert_eq!(desc.attributes[1].offset, 12);
        assert_eq!(desc.attributes[1].location, 1);
    }

    #[test]
    fn fewer_than_three_vertices_is_rejected() {
        let device = Arc::new(MockDevice::new());
        let mut data = shapes::triangle();
        data.vertices.pop();
        let err = Mesh::new(device.clone(), &data).err().unwrap();
        assert!(err.is_precondition());
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let device = Arc::new(MockDevice::new());
        let mut data = shapes::triangle();
        data.indices = vec![0, 1, 3];
        assert!(Mesh::new(device, &data).err().unwrap().is_precondition());
    }

    #[test]
    fn non_indexed_mesh_draws_its_vertices() {
        let device = Arc::new(MockDevice::new());
        let mesh = upload(&device, &shapes::triangle());
        assert_eq!(device.live_buffers(), 1);

        let cmd = device.allocate_command_buffers(1).unwrap()[0];
        device.begin_command_buffer(cmd).unwrap();
        mesh.bind(cmd);
        mesh.draw(cmd);
        let recorded = device.commands(cmd);
        assert!(matches!(recorded[0], Command::BindVertexBuffer(_)));
        assert_eq!(recorded[1], Command::Draw(3));
    }

    #[test]
    fn indexed_mesh_binds_both_buffers() {
        let device = Arc::new(MockDevice::new());
        let mesh = upload(&device, &shapes::cube());
        assert!(mesh.is_indexed());
        assert_eq!(mesh.vertex_count(), 24);
        assert_eq!(device.live_buffers(), 2);

        let cmd = device.allocate_command_buffers(1).unwrap()[0];
        device.begin_command_buffer(cmd).unwrap();
        mesh.bind(cmd);
        mesh.draw(cmd);
        let recorded = device.commands(cmd);
        assert!(matches!(recorded[1], Command::BindIndexBuffer(_)));
        assert_eq!(recorded[2], Command::DrawIndexed(36));

        drop(mesh);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn arena_destroys_a_mesh_with_its_last_reference() {
        let device = Arc::new(MockDevice::new());
        let mut arena = MeshArena::new();
        let handle = arena.insert(upload(&device, &shapes::triangle()));
        arena.retain(handle).unwrap();
        assert_eq!(arena.ref_count(handle), Some(2));

        assert!(!arena.release(handle).unwrap());
        assert!(arena.get(handle).is_some());
        assert!(arena.release(handle).unwrap());
        assert!(arena.get(handle).is_none());
        assert_eq!(device.live_buffers(), 0);
        assert!(arena.is_empty());
    }

    #[test]
    fn released_handles_stay_dead_after_slot_reuse() {
        let device = Arc::new(MockDevice::new());
        let mut arena = MeshArena::new();
        let first = arena.insert(upload(&device, &shapes::triangle()));
        arena.release(first).unwrap();

        let second = arena.insert(upload(&device, &shapes::cube()));
        assert_ne!(first, second);
        assert!(arena.get(first).is_none());
        assert!(arena.retain(first).unwrap_err().is_precondition());
        assert_eq!(arena.get(second).map(|m| m.vertex_count()), Some(24));
    }

    #[test]
    fn dropping_the_arena_releases_all_meshes() {
        let device = Arc::new(MockDevice::new());
        let mut arena = MeshArena::new();
        arena.insert(upload(&device, &shapes::triangle()));
        arena.insert(upload(&device, &shapes::cube()));
        assert_eq!(arena.len(), 2);
        drop(arena);
        assert_eq!(device.live_buffers(), 0);
    }
}
