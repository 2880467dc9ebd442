//! Acceleration structure kinds, sizing and instance records.

use crate::constants::MAX_INSTANCE_ID;
use crate::format::{IndexType, VertexFormat};
use bitflags::bitflags;
use glam::{Affine3A, Mat3, Vec3};

/// Sizes reported by a backend before an acceleration structure is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccelerationStructureSizes {
    /// Size of the structure storage.
    pub structure_size: u64,
    /// Scratch required by a full build.
    pub build_scratch_size: u64,
    /// Scratch required by an in-place update. `None` when the structure
    /// cannot be updated.
    pub update_scratch_size: Option<u64>,
}

impl AccelerationStructureSizes {
    /// Scratch large enough for both building and updating.
    pub fn scratch_size(&self) -> u64 {
        self.build_scratch_size
            .max(self.update_scratch_size.unwrap_or(0))
    }
}

/// The three mutually exclusive BLAS representations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlasKind {
    /// Rebuildable and updatable, used for dynamic geometry.
    Intermediate,
    /// One-shot build output awaiting its compacted size.
    NonCompacted,
    /// Final size-optimized copy, immutable after compaction.
    Compacted,
}

/// Kind of an acceleration structure object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelerationStructureKind {
    Bottom(BlasKind),
    Top,
}

impl AccelerationStructureKind {
    /// Whether the structure moves between queues through release and acquire.
    pub const fn is_asset(self) -> bool {
        matches!(self, Self::Bottom(BlasKind::Compacted))
    }

    /// Whether the structure may be referenced by TLAS instances.
    pub const fn is_instanceable(self) -> bool {
        matches!(
            self,
            Self::Bottom(BlasKind::Intermediate | BlasKind::Compacted)
        )
    }

    /// Whether the structure supports in-place updates.
    pub const fn allows_update(self) -> bool {
        matches!(self, Self::Bottom(BlasKind::Intermediate) | Self::Top)
    }
}

/// Triangle geometry as seen by sizing queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryDesc {
    /// Marks every triangle opaque so any-hit processing is skipped.
    pub force_closest_hit: bool,
    pub vertex_format: VertexFormat,
    pub vertex_stride: u32,
    pub vertex_count: u32,
    /// Index type and index count, or `None` for non-indexed triangles.
    pub indices: Option<(IndexType, u32)>,
}

impl GeometryDesc {
    /// Non-indexed triangle list with tightly packed positions.
    pub const fn triangles(vertex_count: u32) -> Self {
        Self {
            force_closest_hit: true,
            vertex_format: VertexFormat::R32G32B32Sfloat,
            vertex_stride: VertexFormat::R32G32B32Sfloat.size(),
            vertex_count,
            indices: None,
        }
    }

    /// Indexed triangle list with tightly packed positions.
    pub const fn indexed(vertex_count: u32, index_type: IndexType, index_count: u32) -> Self {
        Self {
            indices: Some((index_type, index_count)),
            ..Self::triangles(vertex_count)
        }
    }

    /// Number of triangles described.
    pub const fn primitive_count(&self) -> u32 {
        match self.indices {
            Some((_, index_count)) => index_count / 3,
            None => self.vertex_count / 3,
        }
    }
}

bitflags! {
    /// Per-instance ray interaction flags.
    ///
    /// Bit values match the native encoding used by both explicit APIs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InstanceFlags: u8 {
        /// Disable back-face culling for this instance.
        const DISABLE_BACK_FACE_CULL = 0x1;
        /// Treat counter-clockwise triangles as front facing.
        const FRONT_COUNTER_CLOCKWISE = 0x2;
        /// Treat every geometry as opaque.
        const FORCE_CLOSEST_HIT = 0x4;
        /// Treat every geometry as non-opaque.
        const FORCE_ANY_HIT = 0x8;
    }
}

/// One TLAS instance as written by the host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TlasInstance {
    /// Row-major 3x4 object-to-world transform.
    pub transform: [[f32; 4]; 3],
    /// 24-bit custom id reported on hit.
    pub instance_id: u32,
    /// Visibility mask tested against the ray's cull mask.
    pub mask: u8,
    pub flags: InstanceFlags,
    /// Device address of an intermediate or compacted BLAS.
    pub blas_address: u64,
}

impl TlasInstance {
    pub const IDENTITY: [[f32; 4]; 3] = [
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
    ];

    /// Instance with identity transform, full mask and no flags.
    pub const fn new(blas_address: u64, instance_id: u32) -> Self {
        Self {
            transform: Self::IDENTITY,
            instance_id,
            mask: 0xFF,
            flags: InstanceFlags::empty(),
            blas_address,
        }
    }

    #[must_use]
    pub fn with_affine(mut self, affine: Affine3A) -> Self {
        self.transform = transform_rows(affine);
        self
    }

    #[must_use]
    pub const fn with_mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: InstanceFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Object-to-world transform as an affine matrix.
    pub fn affine(&self) -> Affine3A {
        let [r0, r1, r2] = self.transform;
        Affine3A::from_mat3_translation(
            Mat3::from_cols(
                Vec3::new(r0[0], r1[0], r2[0]),
                Vec3::new(r0[1], r1[1], r2[1]),
                Vec3::new(r0[2], r1[2], r2[2]),
            ),
            Vec3::new(r0[3], r1[3], r2[3]),
        )
    }

    /// Encode into the native instance record.
    pub fn to_record(&self) -> InstanceRecord {
        debug_assert!(
            self.instance_id <= MAX_INSTANCE_ID,
            "instance id {} does not fit in 24 bits",
            self.instance_id
        );
        let mut transform = [0.0; 12];
        for (row, values) in self.transform.iter().enumerate() {
            transform[row * 4..row * 4 + 4].copy_from_slice(values);
        }
        InstanceRecord {
            transform,
            id_and_mask: (self.instance_id & MAX_INSTANCE_ID) | (u32::from(self.mask) << 24),
            sbt_offset_and_flags: u32::from(self.flags.bits()) << 24,
            blas_address: self.blas_address,
        }
    }
}

/// Row-major 3x4 rows of an affine transform.
pub fn transform_rows(affine: Affine3A) -> [[f32; 4]; 3] {
    let m = affine.matrix3;
    let t = affine.translation;
    [
        [m.x_axis.x, m.y_axis.x, m.z_axis.x, t.x],
        [m.x_axis.y, m.y_axis.y, m.z_axis.y, t.y],
        [m.x_axis.z, m.y_axis.z, m.z_axis.z, t.z],
    ]
}

/// Native 64-byte instance record shared by both explicit APIs.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceRecord {
    pub transform: [f32; 12],
    /// Instance id in the low 24 bits, mask in the high 8.
    pub id_and_mask: u32,
    /// Hit group offset in the low 24 bits, flags in the high 8.
    pub sbt_offset_and_flags: u32,
    pub blas_address: u64,
}

impl InstanceRecord {
    pub const fn instance_id(&self) -> u32 {
        self.id_and_mask & MAX_INSTANCE_ID
    }

    pub const fn mask(&self) -> u8 {
        (self.id_and_mask >> 24) as u8
    }

    pub const fn flags(&self) -> InstanceFlags {
        InstanceFlags::from_bits_truncate((self.sbt_offset_and_flags >> 24) as u8)
    }

    /// Decode back into a host-side instance.
    pub fn to_instance(&self) -> TlasInstance {
        let t = &self.transform;
        TlasInstance {
            transform: [
                [t[0], t[1], t[2], t[3]],
                [t[4], t[5], t[6], t[7]],
                [t[8], t[9], t[10], t[11]],
            ],
            instance_id: self.instance_id(),
            mask: self.mask(),
            flags: self.flags(),
            blas_address: self.blas_address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::Quat;

    #[test]
    fn instance_record_layout() {
        assert_eq!(
            std::mem::size_of::<InstanceRecord>() as u64,
            crate::constants::INSTANCE_RECORD_SIZE
        );
        assert_eq!(std::mem::offset_of!(InstanceRecord, id_and_mask), 48);
        assert_eq!(std::mem::offset_of!(InstanceRecord, blas_address), 56);
    }

    #[test]
    fn instance_fields_pack_into_native_bits() {
        let instance = TlasInstance::new(0xDEAD_BEEF_0000, 0x00AB_CDEF)
            .with_mask(0x5A)
            .with_flags(InstanceFlags::DISABLE_BACK_FACE_CULL | InstanceFlags::FORCE_ANY_HIT);
        let record = instance.to_record();
        assert_eq!(record.id_and_mask, 0x5AAB_CDEF);
        assert_eq!(record.sbt_offset_and_flags, 0x0900_0000);
        assert_eq!(record.to_instance(), instance);
    }

    #[test]
    fn affine_transform_survives_encoding() {
        let affine = Affine3A::from_scale_rotation_translation(
            Vec3::new(2.0, 1.0, 0.5),
            Quat::from_rotation_y(0.7),
            Vec3::new(3.0, -4.0, 5.0),
        );
        let instance = TlasInstance::new(0, 7).with_affine(affine);
        let decoded = instance.to_record().to_instance().affine();
        let point = Vec3::new(1.0, 2.0, 3.0);
        let expected = affine.transform_point3(point);
        let actual = decoded.transform_point3(point);
        assert_relative_eq!(expected.x, actual.x, epsilon = 1e-5);
        assert_relative_eq!(expected.y, actual.y, epsilon = 1e-5);
        assert_relative_eq!(expected.z, actual.z, epsilon = 1e-5);
        assert_relative_eq!(instance.transform[0][3], 3.0);
    }

    #[test]
    fn primitive_count_uses_indices_when_present() {
        assert_eq!(GeometryDesc::triangles(9).primitive_count(), 3);
        assert_eq!(
            GeometryDesc::indexed(4, IndexType::U16, 6).primitive_count(),
            2
        );
    }

    #[test]
    fn scratch_covers_build_and_update() {
        let sizes = AccelerationStructureSizes {
            structure_size: 1024,
            build_scratch_size: 512,
            update_scratch_size: Some(768),
        };
        assert_eq!(sizes.scratch_size(), 768);
        let once = AccelerationStructureSizes {
            update_scratch_size: None,
            ..sizes
        };
        assert_eq!(once.scratch_size(), 512);
    }
}
