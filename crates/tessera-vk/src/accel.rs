//! Acceleration structure geometry, build flags and sizing.

use crate::format::{index_type, vertex_format};
use ash::vk;
use tessera_core::{
    AccelerationStructureKind, AccelerationStructureSizes, BlasKind, GeometryDesc,
};

/// Native structure type of `kind`.
pub const fn structure_type(kind: AccelerationStructureKind) -> vk::AccelerationStructureTypeKHR {
    match kind {
        AccelerationStructureKind::Bottom(_) => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelerationStructureKind::Top => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

/// Build flags of `kind`.
///
/// Intermediate structures are rebuilt often and refit every frame, so they
/// favour build speed. Non-compacted structures are built once and compacted.
pub fn build_flags(kind: AccelerationStructureKind) -> vk::BuildAccelerationStructureFlagsKHR {
    match kind {
        AccelerationStructureKind::Bottom(BlasKind::Intermediate) => {
            vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
                | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD
        }
        AccelerationStructureKind::Bottom(BlasKind::NonCompacted | BlasKind::Compacted) => {
            vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION
                | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
        }
        AccelerationStructureKind::Top => vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE,
    }
}

/// Triangle geometry reading positions at `vertex_address` and, when indexed,
/// indices at `index_address`.
pub fn triangle_geometry(
    desc: &GeometryDesc,
    vertex_address: u64,
    index_address: u64,
) -> vk::AccelerationStructureGeometryKHR<'static> {
    let (ty, index_address) = match desc.indices {
        Some((ty, _)) => (index_type(ty), index_address),
        None => (vk::IndexType::NONE_KHR, 0),
    };
    let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
        .vertex_format(vertex_format(desc.vertex_format))
        .vertex_data(vk::DeviceOrHostAddressConstKHR {
            device_address: vertex_address,
        })
        .vertex_stride(u64::from(desc.vertex_stride))
        .max_vertex(desc.vertex_count.saturating_sub(1))
        .index_type(ty)
        .index_data(vk::DeviceOrHostAddressConstKHR {
            device_address: index_address,
        });
    let flags = if desc.force_closest_hit {
        vk::GeometryFlagsKHR::OPAQUE
    } else {
        vk::GeometryFlagsKHR::empty()
    };
    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .flags(flags)
        .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
}

/// Instance geometry reading tightly packed records at `instances_address`.
pub fn instance_geometry(instances_address: u64) -> vk::AccelerationStructureGeometryKHR<'static> {
    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: instances_address,
                }),
        })
}

/// Geometries of one build with their primitive ranges.
#[derive(Default)]
pub struct GeometryList {
    pub geometries: Vec<vk::AccelerationStructureGeometryKHR<'static>>,
    pub ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
}

impl GeometryList {
    /// Bottom-level geometries; `addresses` holds vertex and index addresses
    /// per geometry. Sizing queries may pass zero addresses.
    pub fn bottom(descs: &[GeometryDesc], addresses: &[(u64, u64)]) -> Self {
        let mut list = Self::default();
        for (desc, &(vertex, index)) in descs.iter().zip(addresses) {
            list.geometries.push(triangle_geometry(desc, vertex, index));
            list.ranges.push(
                vk::AccelerationStructureBuildRangeInfoKHR::default()
                    .primitive_count(desc.primitive_count()),
            );
        }
        list
    }

    /// Sizing geometry list with no device addresses.
    pub fn bottom_for_sizing(descs: &[GeometryDesc]) -> Self {
        Self::bottom(descs, &vec![(0, 0); descs.len()])
    }

    pub fn top(instances_address: u64, instance_count: u32) -> Self {
        Self {
            geometries: vec![instance_geometry(instances_address)],
            ranges: vec![
                vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(instance_count),
            ],
        }
    }

    pub fn primitive_counts(&self) -> Vec<u32> {
        self.ranges.iter().map(|r| r.primitive_count).collect()
    }
}

/// Query the build sizes of a structure of `kind` over `list`.
///
/// # Safety
/// The loader must be valid.
pub unsafe fn build_sizes(
    loader: &ash::khr::acceleration_structure::Device,
    kind: AccelerationStructureKind,
    list: &GeometryList,
) -> AccelerationStructureSizes {
    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(structure_type(kind))
        .flags(build_flags(kind))
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(&list.geometries);

    let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
    loader.get_acceleration_structure_build_sizes(
        vk::AccelerationStructureBuildTypeKHR::DEVICE,
        &build_info,
        &list.primitive_counts(),
        &mut sizes,
    );

    AccelerationStructureSizes {
        structure_size: sizes.acceleration_structure_size,
        build_scratch_size: sizes.build_scratch_size,
        update_scratch_size: kind.allows_update().then_some(sizes.update_scratch_size),
    }
}

/// Record one build or update of `dst`.
///
/// Updates refit `dst` in place.
///
/// # Safety
/// The command buffer must be recording and every address must reference live memory.
pub unsafe fn record_build(
    loader: &ash::khr::acceleration_structure::Device,
    cmd: vk::CommandBuffer,
    kind: AccelerationStructureKind,
    dst: vk::AccelerationStructureKHR,
    update: bool,
    list: &GeometryList,
    scratch_address: u64,
) {
    let (mode, src) = if update {
        (vk::BuildAccelerationStructureModeKHR::UPDATE, dst)
    } else {
        (
            vk::BuildAccelerationStructureModeKHR::BUILD,
            vk::AccelerationStructureKHR::null(),
        )
    };
    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(structure_type(kind))
        .flags(build_flags(kind))
        .mode(mode)
        .src_acceleration_structure(src)
        .dst_acceleration_structure(dst)
        .geometries(&list.geometries)
        .scratch_data(vk::DeviceOrHostAddressKHR {
            device_address: scratch_address,
        });

    loader.cmd_build_acceleration_structures(cmd, &[build_info], &[list.ranges.as_slice()]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::IndexType;

    #[test]
    fn only_intermediate_and_top_allow_updates() {
        let intermediate = build_flags(AccelerationStructureKind::Bottom(BlasKind::Intermediate));
        assert!(intermediate.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE));
        let non_compacted = build_flags(AccelerationStructureKind::Bottom(BlasKind::NonCompacted));
        assert!(non_compacted.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION));
        assert!(!non_compacted.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE));
        assert!(build_flags(AccelerationStructureKind::Top)
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE));
    }

    #[test]
    fn bottom_geometry_ranges_count_triangles() {
        let descs = [
            GeometryDesc::triangles(9),
            GeometryDesc::indexed(4, IndexType::U16, 6),
        ];
        let list = GeometryList::bottom(&descs, &[(0x1000, 0), (0x2000, 0x3000)]);
        assert_eq!(list.primitive_counts(), vec![3, 2]);
        assert_eq!(list.geometries[0].flags, vk::GeometryFlagsKHR::OPAQUE);
        // SAFETY: both geometries were created as triangles.
        let (first, second) = unsafe {
            (
                list.geometries[0].geometry.triangles,
                list.geometries[1].geometry.triangles,
            )
        };
        assert_eq!(first.index_type, vk::IndexType::NONE_KHR);
        assert_eq!(first.max_vertex, 8);
        assert_eq!(second.index_type, vk::IndexType::UINT16);
        assert_eq!(second.vertex_stride, 12);
    }

    #[test]
    fn top_list_holds_one_instance_geometry() {
        let list = GeometryList::top(0x4000, 7);
        assert_eq!(list.geometries.len(), 1);
        assert_eq!(list.geometries[0].geometry_type, vk::GeometryTypeKHR::INSTANCES);
        assert_eq!(list.primitive_counts(), vec![7]);
    }
}
