//! Built acceleration structure contents and ray traversal.

use crate::bvh::{intersect_triangle, Aabb, Bvh};
use crate::resource::StructureInner;
use crate::sizing;
use bitflags::bitflags;
use glam::{Affine3A, Vec2, Vec3};
use std::sync::Arc;
use tessera_core::{Error, GeometryDesc, IndexType, InstanceFlags, InstanceRecord, Result};

/// What an acceleration structure currently holds.
pub(crate) enum Contents {
    Empty,
    Bottom(Arc<BottomLevel>),
    Top(TopLevelData),
}

impl Contents {
    pub fn node_count(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Bottom(bottom) => bottom.bvh.node_count(),
            Self::Top(top) => top.bvh.node_count(),
        }
    }
}

/// Positions and optional indices of one geometry, decoded from buffers.
pub(crate) struct GeometryData {
    pub desc: GeometryDesc,
    pub positions: Vec<Vec3>,
    pub indices: Option<Vec<u32>>,
}

impl GeometryData {
    pub fn decode(desc: GeometryDesc, vertices: &[u8], indices: Option<&[u8]>) -> Result<Self> {
        let positions = decode_positions(&desc, vertices)?;
        let indices = match (desc.indices, indices) {
            (Some((index_type, count)), Some(bytes)) => {
                Some(decode_indices(index_type, count, bytes)?)
            }
            (None, None) => None,
            _ => {
                return Err(Error::InvalidState(
                    "index type and index buffer must be given together".to_string(),
                ))
            }
        };
        Ok(Self {
            desc,
            positions,
            indices,
        })
    }
}

fn decode_positions(desc: &GeometryDesc, bytes: &[u8]) -> Result<Vec<Vec3>> {
    let stride = desc.vertex_stride as usize;
    let size = desc.vertex_format.size() as usize;
    (0..desc.vertex_count as usize)
        .map(|vertex| {
            let offset = vertex * stride;
            let raw = bytes.get(offset..offset + size).ok_or_else(|| {
                Error::InvalidState(format!("vertex {vertex} lies outside the vertex buffer"))
            })?;
            Ok(Vec3::from_array(bytemuck::pod_read_unaligned::<[f32; 3]>(raw)))
        })
        .collect()
}

fn decode_indices(index_type: IndexType, count: u32, bytes: &[u8]) -> Result<Vec<u32>> {
    let size = index_type.size() as usize;
    let needed = count as usize * size;
    let raw = bytes
        .get(..needed)
        .ok_or_else(|| Error::InvalidState(format!("{count} indices exceed the index buffer")))?;
    Ok(match index_type {
        IndexType::U16 => raw
            .chunks_exact(2)
            .map(|c| u32::from(u16::from_le_bytes([c[0], c[1]])))
            .collect(),
        IndexType::U32 => raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    })
}

#[derive(Debug, Clone)]
struct GeometryLayout {
    desc: GeometryDesc,
    opaque: bool,
    vertex_count: u32,
    indices: Option<Vec<u32>>,
    first_triangle: usize,
    triangle_count: usize,
}

/// A built bottom-level structure.
#[derive(Debug, Clone)]
pub(crate) struct BottomLevel {
    geometries: Vec<GeometryLayout>,
    triangles: Vec<[Vec3; 3]>,
    /// Geometry and primitive index of each triangle.
    owners: Vec<(u32, u32)>,
    bvh: Bvh,
}

fn assemble(positions: &[Vec3], indices: Option<&[u32]>) -> Result<Vec<[Vec3; 3]>> {
    let vertex = |index: u32| {
        positions.get(index as usize).copied().ok_or_else(|| {
            Error::InvalidState(format!(
                "index {index} out of range for {} vertices",
                positions.len()
            ))
        })
    };
    match indices {
        Some(indices) => indices
            .chunks_exact(3)
            .map(|t| Ok([vertex(t[0])?, vertex(t[1])?, vertex(t[2])?]))
            .collect(),
        None => Ok(positions
            .chunks_exact(3)
            .map(|t| [t[0], t[1], t[2]])
            .collect()),
    }
}

fn triangle_bounds(triangles: &[[Vec3; 3]]) -> Vec<Aabb> {
    triangles.iter().map(|t| Aabb::from_points(t)).collect()
}

/// Geometry-level result of a bottom-level traversal.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BottomHit {
    pub geometry_index: u32,
    pub primitive_index: u32,
    pub barycentrics: Vec2,
    pub front_face: bool,
    pub opaque: bool,
}

impl BottomLevel {
    pub fn build(geometries: Vec<GeometryData>) -> Result<Self> {
        let mut layouts = Vec::with_capacity(geometries.len());
        let mut triangles = Vec::new();
        let mut owners = Vec::new();
        for (geometry_index, geometry) in (0u32..).zip(geometries) {
            let assembled = assemble(&geometry.positions, geometry.indices.as_deref())?;
            layouts.push(GeometryLayout {
                desc: geometry.desc,
                opaque: geometry.desc.force_closest_hit,
                vertex_count: geometry.desc.vertex_count,
                indices: geometry.indices,
                first_triangle: triangles.len(),
                triangle_count: assembled.len(),
            });
            owners.extend((0u32..).take(assembled.len()).map(|p| (geometry_index, p)));
            triangles.extend(assembled);
        }
        let bvh = Bvh::build(&triangle_bounds(&triangles));
        Ok(Self {
            geometries: layouts,
            triangles,
            owners,
            bvh,
        })
    }

    /// Refit from new positions of every geometry, keeping topology.
    pub fn update(&mut self, positions: &[Vec<Vec3>]) -> Result<()> {
        if positions.len() != self.geometries.len() {
            return Err(Error::InvalidState(format!(
                "update supplied {} geometries, built with {}",
                positions.len(),
                self.geometries.len()
            )));
        }
        for (layout, positions) in self.geometries.iter().zip(positions) {
            if positions.len() != layout.vertex_count as usize {
                return Err(Error::InvalidState(format!(
                    "update changed the vertex count from {} to {}",
                    layout.vertex_count,
                    positions.len()
                )));
            }
            let assembled = assemble(positions, layout.indices.as_deref())?;
            debug_assert_eq!(assembled.len(), layout.triangle_count);
            self.triangles[layout.first_triangle..layout.first_triangle + layout.triangle_count]
                .copy_from_slice(&assembled);
        }
        self.bvh.refit(&triangle_bounds(&self.triangles));
        Ok(())
    }

    /// Decode refit positions, one vertex buffer per geometry.
    pub fn decode_update(&self, vertex_buffers: &[&[u8]]) -> Result<Vec<Vec<Vec3>>> {
        if vertex_buffers.len() != self.geometries.len() {
            return Err(Error::InvalidState(format!(
                "update supplied {} vertex buffers, built with {} geometries",
                vertex_buffers.len(),
                self.geometries.len()
            )));
        }
        self.geometries
            .iter()
            .zip(vertex_buffers)
            .map(|(layout, bytes)| decode_positions(&layout.desc, bytes))
            .collect()
    }

    pub fn bounds(&self) -> Aabb {
        self.bvh.bounds()
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    /// Storage needed by a compacted copy.
    pub fn compacted_size(&self) -> u64 {
        sizing::compacted_blas(self.bvh.node_count() as u64, self.triangles.len() as u64)
    }

    /// Closest triangle accepted by `accept`, which maps the geometry's
    /// opacity and the triangle winding to facing and final opacity.
    pub fn closest(
        &self,
        origin: Vec3,
        direction: Vec3,
        t_min: f32,
        t_max: f32,
        accept: impl Fn(bool, bool) -> Option<(bool, bool)>,
    ) -> Option<(f32, BottomHit)> {
        self.bvh.closest(origin, direction, t_min, t_max, |triangle, t_closest| {
            let hit = intersect_triangle(
                origin,
                direction,
                &self.triangles[triangle as usize],
                t_min,
                t_closest,
            )?;
            let (geometry_index, primitive_index) = self.owners[triangle as usize];
            let geometry_opaque = self.geometries[geometry_index as usize].opaque;
            let (front_face, opaque) = accept(geometry_opaque, hit.counter_clockwise)?;
            Some((
                hit.t,
                BottomHit {
                    geometry_index,
                    primitive_index,
                    barycentrics: Vec2::new(hit.u, hit.v),
                    front_face,
                    opaque,
                },
            ))
        })
    }
}

bitflags! {
    /// Flags of a traced ray. Bit values follow the native ray flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RayFlags: u8 {
        /// Treat every hit as opaque.
        const OPAQUE = 0x01;
        /// Treat every hit as non-opaque.
        const NO_OPAQUE = 0x02;
        const CULL_BACK_FACING = 0x10;
        const CULL_FRONT_FACING = 0x20;
        const CULL_OPAQUE = 0x40;
        const CULL_NO_OPAQUE = 0x80;
    }
}

/// A ray traced against a TLAS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    pub t_min: f32,
    pub direction: Vec3,
    pub t_max: f32,
    /// Instances whose mask shares no bit with this are skipped.
    pub cull_mask: u8,
    pub flags: RayFlags,
}

impl Ray {
    pub const fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            t_min: 0.0,
            direction,
            t_max: f32::MAX,
            cull_mask: 0xFF,
            flags: RayFlags::empty(),
        }
    }

    #[must_use]
    pub const fn with_interval(mut self, t_min: f32, t_max: f32) -> Self {
        self.t_min = t_min;
        self.t_max = t_max;
        self
    }

    #[must_use]
    pub const fn with_cull_mask(mut self, cull_mask: u8) -> Self {
        self.cull_mask = cull_mask;
        self
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: RayFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Closest committed intersection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    /// Slot of the instance in the instance buffer.
    pub instance_index: u32,
    /// Custom id written into the instance record.
    pub instance_id: u32,
    pub geometry_index: u32,
    pub primitive_index: u32,
    pub t: f32,
    pub barycentrics: Vec2,
    pub front_face: bool,
    pub opaque: bool,
}

struct PlacedInstance {
    slot: u32,
    instance_id: u32,
    mask: u8,
    flags: InstanceFlags,
    world_to_object: Affine3A,
    blas: Arc<StructureInner>,
}

/// A built top-level structure.
pub(crate) struct TopLevelData {
    instance_count: u32,
    instances: Vec<PlacedInstance>,
    bvh: Bvh,
}

impl TopLevelData {
    /// Build over `records`. Records with a null BLAS address are inactive.
    pub fn build(
        records: &[InstanceRecord],
        resolve: impl Fn(u64) -> Option<Arc<StructureInner>>,
    ) -> Result<Self> {
        let (instances, bounds) = place(records, resolve)?;
        Ok(Self {
            instance_count: records.len() as u32,
            bvh: Bvh::build(&bounds),
            instances,
        })
    }

    /// Refit from rewritten records with the instance count of the build.
    pub fn update(
        &mut self,
        records: &[InstanceRecord],
        resolve: impl Fn(u64) -> Option<Arc<StructureInner>>,
    ) -> Result<()> {
        let (instances, bounds) = place(records, resolve)?;
        if instances.len() != self.instances.len() {
            return Err(Error::InvalidState(format!(
                "TLAS update changed the active instance count from {} to {}",
                self.instances.len(),
                instances.len()
            )));
        }
        self.instances = instances;
        self.bvh.refit(&bounds);
        Ok(())
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// BLAS referenced by active instances.
    pub fn referenced(&self) -> impl Iterator<Item = &Arc<StructureInner>> {
        self.instances.iter().map(|i| &i.blas)
    }

    pub fn trace(&self, ray: &Ray) -> Option<Hit> {
        let flags = ray.flags;
        self.bvh
            .closest(ray.origin, ray.direction, ray.t_min, ray.t_max, |index, t_closest| {
                let instance = &self.instances[index as usize];
                if instance.mask & ray.cull_mask == 0 {
                    return None;
                }
                let origin = instance.world_to_object.transform_point3(ray.origin);
                let direction = instance.world_to_object.transform_vector3(ray.direction);
                let contents = instance.blas.contents.read();
                let Contents::Bottom(bottom) = &*contents else {
                    return None;
                };
                let accept = |geometry_opaque: bool, counter_clockwise: bool| {
                    resolve_hit(flags, instance.flags, geometry_opaque, counter_clockwise)
                };
                let (t, hit) = bottom.closest(origin, direction, ray.t_min, t_closest, accept)?;
                Some((
                    t,
                    Hit {
                        instance_index: instance.slot,
                        instance_id: instance.instance_id,
                        geometry_index: hit.geometry_index,
                        primitive_index: hit.primitive_index,
                        t,
                        barycentrics: hit.barycentrics,
                        front_face: hit.front_face,
                        opaque: hit.opaque,
                    },
                ))
            })
            .map(|(_, hit)| hit)
    }
}

type Placement = (Vec<PlacedInstance>, Vec<Aabb>);

fn place(
    records: &[InstanceRecord],
    resolve: impl Fn(u64) -> Option<Arc<StructureInner>>,
) -> Result<Placement> {
    let mut instances = Vec::with_capacity(records.len());
    let mut bounds = Vec::with_capacity(records.len());
    for (slot, record) in (0u32..).zip(records) {
        if record.blas_address == 0 {
            continue;
        }
        let blas = resolve(record.blas_address).ok_or_else(|| {
            Error::InvalidState(format!(
                "instance {slot} references unknown BLAS address {:#x}",
                record.blas_address
            ))
        })?;
        let object_bounds = match &*blas.contents.read() {
            Contents::Bottom(bottom) => bottom.bounds(),
            _ => {
                return Err(Error::InvalidState(format!(
                    "instance {slot} references a BLAS that has not been built"
                )))
            }
        };
        let instance = record.to_instance();
        let object_to_world = instance.affine();
        bounds.push(object_bounds.transformed(&object_to_world));
        instances.push(PlacedInstance {
            slot,
            instance_id: instance.instance_id,
            mask: instance.mask,
            flags: instance.flags,
            world_to_object: object_to_world.inverse(),
            blas,
        });
    }
    Ok((instances, bounds))
}

/// Facing and opacity of a candidate, or `None` when it is culled.
fn resolve_hit(
    ray: RayFlags,
    instance: InstanceFlags,
    geometry_opaque: bool,
    counter_clockwise: bool,
) -> Option<(bool, bool)> {
    let front_face = if instance.contains(InstanceFlags::FRONT_COUNTER_CLOCKWISE) {
        counter_clockwise
    } else {
        !counter_clockwise
    };
    if !instance.contains(InstanceFlags::DISABLE_BACK_FACE_CULL) {
        if ray.contains(RayFlags::CULL_BACK_FACING) && !front_face {
            return None;
        }
        if ray.contains(RayFlags::CULL_FRONT_FACING) && front_face {
            return None;
        }
    }

    let mut opaque = geometry_opaque;
    if instance.contains(InstanceFlags::FORCE_CLOSEST_HIT) {
        opaque = true;
    } else if instance.contains(InstanceFlags::FORCE_ANY_HIT) {
        opaque = false;
    }
    if ray.contains(RayFlags::OPAQUE) {
        opaque = true;
    } else if ray.contains(RayFlags::NO_OPAQUE) {
        opaque = false;
    }
    if (opaque && ray.contains(RayFlags::CULL_OPAQUE))
        || (!opaque && ray.contains(RayFlags::CULL_NO_OPAQUE))
    {
        return None;
    }
    Some((front_face, opaque))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn quad() -> GeometryData {
        GeometryData {
            desc: GeometryDesc::indexed(4, IndexType::U16, 6),
            positions: vec![
                Vec3::new(-1.0, -1.0, 0.0),
                Vec3::new(1.0, -1.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(-1.0, 1.0, 0.0),
            ],
            indices: Some(vec![0, 1, 2, 0, 2, 3]),
        }
    }

    #[test]
    fn decode_reads_strided_positions_and_indices() {
        let mut bytes = Vec::new();
        for v in [[0.0f32, 1.0, 2.0], [3.0, 4.0, 5.0]] {
            bytes.extend_from_slice(bytemuck::bytes_of(&v));
            bytes.extend_from_slice(&[0; 4]);
        }
        let desc = GeometryDesc {
            vertex_stride: 16,
            ..GeometryDesc::indexed(2, IndexType::U16, 3)
        };
        let indices: Vec<u8> = [1u16, 0, 1].iter().flat_map(|i| i.to_le_bytes()).collect();
        let data = GeometryData::decode(desc, &bytes, Some(&indices)).unwrap();
        assert_eq!(data.positions[1], Vec3::new(3.0, 4.0, 5.0));
        assert_eq!(data.indices, Some(vec![1, 0, 1]));
    }

    #[test]
    fn decode_rejects_short_buffers() {
        let desc = GeometryDesc::triangles(3);
        assert!(GeometryData::decode(desc, &[0; 24], None).is_err());
        assert!(GeometryData::decode(desc, &[0; 36], Some(&[0; 6])).is_err());
    }

    #[test]
    fn out_of_range_index_fails_the_build() {
        let mut geometry = quad();
        geometry.indices = Some(vec![0, 1, 7]);
        assert!(BottomLevel::build(vec![geometry]).is_err());
    }

    #[test]
    fn bottom_level_reports_primitive_and_barycentrics() {
        let bottom = BottomLevel::build(vec![quad()]).unwrap();
        assert_eq!(bottom.triangle_count(), 2);
        let (t, hit) = bottom
            .closest(
                Vec3::new(-0.5, 0.5, 3.0),
                Vec3::NEG_Z,
                0.0,
                f32::MAX,
                |opaque, ccw| Some((ccw, opaque)),
            )
            .unwrap();
        assert_relative_eq!(t, 3.0);
        assert_eq!(hit.primitive_index, 1);
        assert!(hit.front_face);
        assert!(hit.opaque);
    }

    #[test]
    fn update_moves_triangles_without_rebuilding() {
        let mut bottom = BottomLevel::build(vec![quad()]).unwrap();
        let nodes = bottom.bvh.node_count();
        let lifted: Vec<Vec3> = quad()
            .positions
            .iter()
            .map(|p| *p + Vec3::Z * 2.0)
            .collect();
        bottom.update(&[lifted.clone()]).unwrap();
        assert_eq!(bottom.bvh.node_count(), nodes);
        assert_relative_eq!(bottom.bounds().min.z, 2.0);
        let once = bottom.clone();
        bottom.update(&[lifted]).unwrap();
        assert_eq!(bottom.triangles, once.triangles);
        assert_eq!(bottom.bounds(), once.bounds());
    }

    #[test]
    fn update_rejects_changed_vertex_count() {
        let mut bottom = BottomLevel::build(vec![quad()]).unwrap();
        assert!(bottom.update(&[vec![Vec3::ZERO; 3]]).is_err());
        assert!(bottom.update(&[]).is_err());
    }

    #[test]
    fn compacted_size_fits_the_non_compacted_reservation() {
        let bottom = BottomLevel::build(vec![quad()]).unwrap();
        let reserved = sizing::non_compacted_blas(&[quad().desc]).structure_size;
        assert!(bottom.compacted_size() > 0);
        assert!(bottom.compacted_size() <= reserved);
    }

    #[test]
    fn default_winding_treats_clockwise_as_front() {
        assert_eq!(
            resolve_hit(RayFlags::empty(), InstanceFlags::empty(), true, false),
            Some((true, true))
        );
        assert_eq!(
            resolve_hit(
                RayFlags::empty(),
                InstanceFlags::FRONT_COUNTER_CLOCKWISE,
                true,
                true
            ),
            Some((true, true))
        );
    }

    #[test]
    fn culling_and_opacity_overrides() {
        let back = (true, true);
        assert_eq!(
            resolve_hit(RayFlags::CULL_BACK_FACING, InstanceFlags::empty(), back.0, back.1),
            None
        );
        assert!(resolve_hit(
            RayFlags::CULL_BACK_FACING,
            InstanceFlags::DISABLE_BACK_FACE_CULL,
            back.0,
            back.1
        )
        .is_some());
        assert_eq!(
            resolve_hit(RayFlags::empty(), InstanceFlags::FORCE_ANY_HIT, true, false),
            Some((true, false))
        );
        assert_eq!(
            resolve_hit(RayFlags::CULL_NO_OPAQUE, InstanceFlags::FORCE_ANY_HIT, true, false),
            None
        );
        assert_eq!(
            resolve_hit(RayFlags::OPAQUE, InstanceFlags::FORCE_ANY_HIT, false, false),
            Some((true, true))
        );
    }
}
