//! Storage layout of emulated acceleration structures.
//!
//! The layout mirrors what the host representation holds: a header, BVH
//! nodes and per-primitive records. A non-compacted build reserves the worst
//! case node count and keeps its primitive references; compaction keeps only
//! the nodes actually produced.

use tessera_core::constants::{ACCELERATION_STRUCTURE_ALIGNMENT, INSTANCE_RECORD_SIZE};
use tessera_core::{align_up, AccelerationStructureSizes, GeometryDesc};

pub const HEADER_SIZE: u64 = 64;
pub const NODE_SIZE: u64 = 32;
/// Three positions plus geometry and primitive indices.
pub const TRIANGLE_SIZE: u64 = 44;
/// Build-time reference kept by non-compacted structures.
pub const PRIMITIVE_REFERENCE_SIZE: u64 = 8;
/// Per-primitive bounds and centroid used while building.
pub const BUILD_SCRATCH_PER_PRIMITIVE: u64 = 40;
/// Per-node bounds used while refitting.
pub const UPDATE_SCRATCH_PER_NODE: u64 = 24;

const fn worst_case_nodes(primitives: u64) -> u64 {
    if primitives == 0 {
        1
    } else {
        2 * primitives - 1
    }
}

fn primitive_count(geometries: &[GeometryDesc]) -> u64 {
    geometries
        .iter()
        .map(|g| u64::from(g.primitive_count()))
        .sum()
}

fn structure_size(body: u64) -> u64 {
    align_up(HEADER_SIZE + body, ACCELERATION_STRUCTURE_ALIGNMENT)
}

pub fn intermediate_blas(geometries: &[GeometryDesc]) -> AccelerationStructureSizes {
    let primitives = primitive_count(geometries);
    let nodes = worst_case_nodes(primitives);
    AccelerationStructureSizes {
        structure_size: structure_size(nodes * NODE_SIZE + primitives * TRIANGLE_SIZE),
        build_scratch_size: primitives.max(1) * BUILD_SCRATCH_PER_PRIMITIVE,
        update_scratch_size: Some(nodes * UPDATE_SCRATCH_PER_NODE),
    }
}

pub fn non_compacted_blas(geometries: &[GeometryDesc]) -> AccelerationStructureSizes {
    let primitives = primitive_count(geometries);
    AccelerationStructureSizes {
        structure_size: structure_size(
            worst_case_nodes(primitives) * NODE_SIZE
                + primitives * (TRIANGLE_SIZE + PRIMITIVE_REFERENCE_SIZE),
        ),
        build_scratch_size: primitives.max(1) * BUILD_SCRATCH_PER_PRIMITIVE,
        update_scratch_size: None,
    }
}

/// Size of a compacted copy of a structure with `nodes` BVH nodes.
pub fn compacted_blas(nodes: u64, primitives: u64) -> u64 {
    structure_size(nodes.max(1) * NODE_SIZE + primitives * TRIANGLE_SIZE)
}

pub fn tlas(instance_count: u32) -> AccelerationStructureSizes {
    let instances = u64::from(instance_count);
    let nodes = worst_case_nodes(instances);
    AccelerationStructureSizes {
        structure_size: structure_size(nodes * NODE_SIZE + instances * INSTANCE_RECORD_SIZE),
        build_scratch_size: instances.max(1) * BUILD_SCRATCH_PER_PRIMITIVE,
        update_scratch_size: Some(nodes * UPDATE_SCRATCH_PER_NODE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compacted_never_exceeds_non_compacted() {
        for triangles in [1u32, 2, 3, 17, 1000] {
            let desc = [GeometryDesc::triangles(triangles * 3)];
            let non_compacted = non_compacted_blas(&desc).structure_size;
            let best = compacted_blas(1, u64::from(triangles));
            let worst = compacted_blas(2 * u64::from(triangles) - 1, u64::from(triangles));
            assert!(best <= worst);
            assert!(worst <= non_compacted, "{triangles} triangles");
        }
    }

    #[test]
    fn sizes_are_aligned() {
        let sizes = intermediate_blas(&[GeometryDesc::triangles(3)]);
        assert_eq!(sizes.structure_size % ACCELERATION_STRUCTURE_ALIGNMENT, 0);
        assert!(sizes.update_scratch_size.is_some());
        assert_eq!(tlas(0).structure_size % ACCELERATION_STRUCTURE_ALIGNMENT, 0);
    }

    #[test]
    fn tlas_size_depends_only_on_count() {
        assert_eq!(tlas(4), tlas(4));
        assert!(tlas(8).structure_size > tlas(1).structure_size);
    }
}
