// SPDX-License-Identifier: CEPL-1.0
use crate::device::Device;
use crate::mesh::{Mesh, MeshArena, MeshHandle};
use bismuth_core::{EngineError, Result};
use bismuth_math::Transform;
use glam::Vec3;
use portable_atomic::{AtomicU64, Ordering};
use std::fmt;

/// Identifier of a scene object. Never reused by the allocator that issued it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u64);

impl ObjectId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic id source. Shareable by reference; ids stay unique across
/// threads.
#[derive(Debug, Default)]
pub struct ObjectIdAllocator {
    next: AtomicU64,
}

impl ObjectIdAllocator {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> ObjectId {
        ObjectId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Not `Clone`: an object owns one arena reference to its mesh, and a copy
/// would hand the same reference out twice.
#[derive(Debug, PartialEq)]
pub struct SceneObject {
    id: ObjectId,
    mesh: Option<MeshHandle>,
    pub color: Vec3,
    pub transform: Transform,
    /// Angular velocity in radians per second, applied by [`Scene::advance`].
    pub spin: Vec3,
}

impl SceneObject {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn mesh(&self) -> Option<MeshHandle> {
        self.mesh
    }
}

/// Ordered object collection plus the meshes they share.
///
/// Every object holding a mesh owns one reference in the arena; the scene
/// takes and drops those references as objects are spawned, re-meshed and
/// removed.
pub struct Scene<D: Device> {
    ids: ObjectIdAllocator,
    objects: Vec<SceneObject>,
    meshes: MeshArena<D>,
}

impl<D: Device> Default for Scene<D> {
    fn default() -> Self {
        Self {
            ids: ObjectIdAllocator::new(),
            objects: Vec::new(),
            meshes: MeshArena::new(),
        }
    }
}

impl<D: Device> Scene<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a mesh. The returned handle carries one reference owned by the
    /// caller; hand it back with [`Scene::release_mesh`] once no more objects
    /// will be spawned with it.
    pub fn add_mesh(&mut self, mesh: Mesh<D>) -> MeshHandle {
        self.meshes.insert(mesh)
    }

    pub fn release_mesh(&mut self, handle: MeshHandle) -> Result<()> {
        self.meshes.release(handle).map(drop)
    }

    pub fn meshes(&self) -> &MeshArena<D> {
        &self.meshes
    }

    /// Appends a white object with an identity transform.
    pub fn spawn(&mut self, mesh: Option<MeshHandle>) -> Result<ObjectId> {
        if let Some(handle) = mesh {
            self.meshes.retain(handle)?;
        }
        let id = self.ids.next_id();
        self.objects.push(SceneObject {
            id,
            mesh,
            color: Vec3::ONE,
            transform: Transform::default(),
            spin: Vec3::ZERO,
        });
        Ok(id)
    }

    pub fn set_mesh(&mut self, id: ObjectId, mesh: Option<MeshHandle>) -> Result<()> {
        let index = self.position(id).ok_or_else(|| unknown_object(id))?;
        if let Some(handle) = mesh {
            self.meshes.retain(handle)?;
        }
        if let Some(old) = std::mem::replace(&mut self.objects[index].mesh, mesh) {
            self.meshes.release(old)?;
        }
        Ok(())
    }

    /// Removes an object, keeping the order of the rest.
    pub fn remove(&mut self, id: ObjectId) -> Result<SceneObject> {
        let index = self.position(id).ok_or_else(|| unknown_object(id))?;
        let object = self.objects.remove(index);
        if let Some(handle) = object.mesh {
            self.meshes.release(handle)?;
        }
        Ok(object)
    }

    pub fn get(&self, id: ObjectId) -> Option<&SceneObject> {
        self.objects.iter().find(|o| o.id == id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut SceneObject> {
        self.objects.iter_mut().find(|o| o.id == id)
    }

    /// Objects in spawn order.
    pub fn iter(&self) -> impl Iterator<Item = &SceneObject> {
        self.objects.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SceneObject> {
        self.objects.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Steps every object's rotation by `spin * dt`.
    pub fn advance(&mut self, dt: f32) {
        for object in &mut self.objects {
            if object.spin != Vec3::ZERO {
                object.transform.rotate_by(object.spin * dt);
            }
        }
    }

    fn position(&self, id: ObjectId) -> Option<usize> {
        self.objects.iter().position(|o| o.id == id)
    }
}

fn unknown_object(id: ObjectId) -> EngineError {
    EngineError::precondition(format!("no scene object {id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::shapes;
    use crate::testing::MockDevice;
    use std::sync::Arc;

    fn scene_with_mesh() -> (Arc<MockDevice>, Scene<MockDevice>, MeshHandle) {
        let device = Arc::new(MockDevice::new());
        let mut scene = Scene::new();
        let mesh = scene.add_mesh(Mesh::new(device.clone(), &shapes::triangle()).unwrap());
        (device, scene, mesh)
    }

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let (_device, mut scene, mesh) = scene_with_mesh();
        let a = scene.spawn(Some(mesh)).unwrap();
        let b = scene.spawn(None).unwrap();
        scene.remove(a).unwrap();
        let c = scene.spawn(None).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn shared_allocator_hands_out_distinct_ids() {
        let ids = ObjectIdAllocator::new();
        let first: Vec<ObjectId> = (0..4).map(|_| ids.next_id()).collect();
        assert_eq!(first.iter().map(|id| id.get()).collect::<Vec<_>>(), [0, 1, 2, 3]);
    }

    #[test]
    fn iteration_keeps_spawn_order_after_removal() {
        let (_device, mut scene, _mesh) = scene_with_mesh();
        let ids: Vec<ObjectId> = (0..4).map(|_| scene.spawn(None).unwrap()).collect();
        scene.remove(ids[1]).unwrap();
        let order: Vec<ObjectId> = scene.iter().map(|o| o.id()).collect();
        assert_eq!(order, vec![ids[0], ids[2], ids[3]]);
    }

    #[test]
    fn mesh_lives_while_any_object_uses_it() {
        let (device, mut scene, mesh) = scene_with_mesh();
        let a = scene.spawn(Some(mesh)).unwrap();
        let b = scene.spawn(Some(mesh)).unwrap();
        scene.release_mesh(mesh).unwrap();
        assert_eq!(scene.meshes().ref_count(mesh), Some(2));

        scene.remove(a).unwrap();
        assert_eq!(device.live_buffers(), 1);
        scene.set_mesh(b, None).unwrap();
        assert_eq!(device.live_buffers(), 0);
        assert!(scene.meshes().get(mesh).is_none());
    }

    #[test]
    fn removal_gives_back_exactly_one_mesh_reference() {
        let (_device, mut scene, mesh) = scene_with_mesh();
        let a = scene.spawn(Some(mesh)).unwrap();
        let _b = scene.spawn(Some(mesh)).unwrap();
        scene.release_mesh(mesh).unwrap();

        let removed = scene.remove(a).unwrap();
        assert_eq!(removed.mesh(), Some(mesh));
        assert_eq!(scene.meshes().ref_count(mesh), Some(1));

        assert!(scene.remove(a).unwrap_err().is_precondition());
        drop(removed);
        assert_eq!(scene.meshes().ref_count(mesh), Some(1));
    }

    #[test]
    fn spawning_with_a_released_mesh_fails() {
        let (_device, mut scene, mesh) = scene_with_mesh();
        scene.release_mesh(mesh).unwrap();
        assert!(scene.spawn(Some(mesh)).unwrap_err().is_precondition());
        assert!(scene.is_empty());
    }

    #[test]
    fn removing_an_unknown_object_is_an_error() {
        let (_device, mut scene, _mesh) = scene_with_mesh();
        let id = scene.spawn(None).unwrap();
        scene.remove(id).unwrap();
        assert!(scene.remove(id).unwrap_err().is_precondition());
    }

    #[test]
    fn advance_applies_spin_and_wraps() {
        let (_device, mut scene, _mesh) = scene_with_mesh();
        let id = scene.spawn(None).unwrap();
        scene.get_mut(id).unwrap().spin = Vec3::new(0.0, 0.0, 1.0);
        scene.advance(0.25);
        scene.advance(0.25);
        let z = scene.get(id).unwrap().transform.rotation.z;
        assert!((z - 0.5).abs() < 1e-6);

        scene.get_mut(id).unwrap().spin = Vec3::new(0.0, 0.0, -1.0);
        scene.advance(1.0);
        let z = scene.get(id).unwrap().transform.rotation.z;
        assert!((z - (std::f32::consts::TAU - 0.5)).abs() < 1e-5);
    }
}
