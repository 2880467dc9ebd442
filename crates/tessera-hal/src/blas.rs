//! Bottom-level acceleration structure lifecycles.
//!
//! Static geometry goes through the compaction pipeline, encoded as a chain of
//! states that each own exactly the objects still alive at that step:
//!
//! 1. [`StaticBlasBatch::record`] builds non-compacted structures on the
//!    upload command buffer, each writing its compacted size into a query slot.
//! 2. The caller submits with a fence and waits on it. This wait is mandatory.
//! 3. [`StaticBlasBatch::measure`] reads the compacted sizes.
//! 4. [`MeasuredBlasBatch::record_compaction`] creates compacted structures of
//!    exactly those sizes, records the compaction copies and releases the
//!    results to the graphics queue.
//! 5. After the fence covering the compaction retires,
//!    [`RetiringBlasBatch::retire`] frees the non-compacted structures, their
//!    scratch buffers and the query pool.
//!
//! Dynamic geometry uses [`DynamicBlas`], an intermediate structure that is
//! built and refit on the graphics queue without any host round trip.

use crate::command::{
    geometry_descs, GraphicsCommandBuffer, TransferAssets, TriangleGeometry, UploadCommandBuffer,
};
use crate::device::Device;
use crate::resource::{AccelerationStructure, BuildInputView};
use crate::Api;
use tessera_core::{
    AccelerationStructureKind, AccelerationStructureSizes, BlasKind, BufferKind, GeometryDesc,
    Result,
};
use tracing::debug;

struct PendingBlas<A: Api> {
    structure: A::AccelerationStructure,
    scratch: A::Buffer,
}

impl<A: Api> PendingBlas<A> {
    fn destroy(self, device: &A::Device) {
        device.destroy_acceleration_structure(self.structure);
        device.destroy_buffer(self.scratch);
    }
}

/// Non-compacted builds recorded, compacted sizes not yet read.
pub struct StaticBlasBatch<A: Api> {
    query_pool: A::QueryPool,
    pending: Vec<PendingBlas<A>>,
}

impl<A: Api> StaticBlasBatch<A> {
    /// Record one non-compacted build per mesh into `upload`.
    ///
    /// Every build input must already be uploaded earlier in `upload`.
    pub fn record(
        device: &A::Device,
        upload: &mut A::UploadCommandBuffer,
        meshes: &[&[TriangleGeometry<'_, A>]],
    ) -> Result<Self> {
        let query_count = u32::try_from(meshes.len()).map_err(|_| {
            tessera_core::Error::InvalidState(format!("too many meshes: {}", meshes.len()))
        })?;
        let query_pool = device.create_compacted_size_query_pool(query_count)?;
        let mut batch = Self {
            query_pool,
            pending: Vec::with_capacity(meshes.len()),
        };

        for mesh in meshes {
            let sizes = device.non_compacted_blas_sizes(&geometry_descs(mesh));
            match allocate::<A>(device, BlasKind::NonCompacted, &sizes) {
                Ok((structure, scratch)) => batch.pending.push(PendingBlas { structure, scratch }),
                Err(error) => {
                    batch.destroy(device);
                    return Err(error);
                }
            }
        }

        let inputs: Vec<BuildInputView<'_, A::Buffer>> = meshes
            .iter()
            .flat_map(|mesh| mesh.iter())
            .flat_map(|geometry| std::iter::once(geometry.vertex_buffer).chain(geometry.index_buffer))
            .collect();

        upload.build_non_compacted_blas_pass_load(&inputs);
        for (index, (mesh, pending)) in (0u32..).zip(meshes.iter().zip(&mut batch.pending)) {
            upload.build_non_compacted_blas(
                &mut pending.structure,
                mesh,
                &pending.scratch,
                &batch.query_pool,
                index,
            );
        }
        upload.build_non_compacted_blas_pass_store(&inputs);

        debug!(count = meshes.len(), "recorded non-compacted BLAS builds");
        Ok(batch)
    }

    /// Number of structures in the batch.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Read the measured compacted sizes.
    ///
    /// The caller must have waited on a fence covering the submission that
    /// contained [`StaticBlasBatch::record`].
    pub fn measure(self, device: &A::Device) -> Result<MeasuredBlasBatch<A>> {
        let measured: Result<Vec<u64>> = (0u32..)
            .take(self.pending.len())
            .map(|index| device.compacted_size(&self.query_pool, index))
            .collect();
        let compacted_sizes = match measured {
            Ok(sizes) => sizes,
            Err(error) => {
                self.destroy(device);
                return Err(error);
            }
        };

        for ((index, pending), &compacted) in (0u32..).zip(&self.pending).zip(&compacted_sizes) {
            debug_assert!(
                compacted > 0 && compacted <= pending.structure.size(),
                "compacted size {compacted} outside (0, {}]",
                pending.structure.size()
            );
            debug!(
                index,
                non_compacted = pending.structure.size(),
                compacted,
                "measured compacted BLAS size"
            );
        }
        Ok(MeasuredBlasBatch {
            query_pool: self.query_pool,
            pending: self.pending,
            compacted_sizes,
        })
    }

    /// Free everything without compacting.
    pub fn destroy(self, device: &A::Device) {
        destroy_pending(device, self.pending, self.query_pool);
    }
}

/// Compacted sizes known, compaction not yet recorded.
pub struct MeasuredBlasBatch<A: Api> {
    query_pool: A::QueryPool,
    pending: Vec<PendingBlas<A>>,
    compacted_sizes: Vec<u64>,
}

impl<A: Api> MeasuredBlasBatch<A> {
    /// Measured compacted size of each structure, in mesh order.
    pub fn compacted_sizes(&self) -> &[u64] {
        &self.compacted_sizes
    }

    /// Size of each non-compacted structure, in mesh order.
    pub fn non_compacted_sizes(&self) -> Vec<u64> {
        self.pending.iter().map(|p| p.structure.size()).collect()
    }

    /// The non-compacted structures, in mesh order.
    pub fn non_compacted(&self) -> impl Iterator<Item = &A::AccelerationStructure> {
        self.pending.iter().map(|p| &p.structure)
    }

    /// Create the compacted structures, record the compaction copies and
    /// release the results to the graphics queue.
    ///
    /// The returned structures must be acquired on the graphics queue before
    /// any TLAS references them.
    pub fn record_compaction(
        self,
        device: &A::Device,
        upload: &mut A::UploadCommandBuffer,
    ) -> Result<(Vec<A::AccelerationStructure>, RetiringBlasBatch<A>)> {
        let mut compacted = Vec::with_capacity(self.pending.len());
        for &size in &self.compacted_sizes {
            match device.create_acceleration_structure(
                AccelerationStructureKind::Bottom(BlasKind::Compacted),
                size,
            ) {
                Ok(structure) => compacted.push(structure),
                Err(error) => {
                    for structure in compacted {
                        device.destroy_acceleration_structure(structure);
                    }
                    destroy_pending(device, self.pending, self.query_pool);
                    return Err(error);
                }
            }
        }

        for (dst, src) in compacted.iter().zip(&self.pending) {
            upload.compact_blas(dst, &src.structure);
        }
        let released: Vec<&A::AccelerationStructure> = compacted.iter().collect();
        upload.release(&TransferAssets::acceleration_structures(&released));

        debug!(count = compacted.len(), "recorded BLAS compaction");
        Ok((
            compacted,
            RetiringBlasBatch {
                query_pool: self.query_pool,
                pending: self.pending,
            },
        ))
    }

    /// Free everything without compacting.
    pub fn destroy(self, device: &A::Device) {
        destroy_pending(device, self.pending, self.query_pool);
    }
}

/// Compaction recorded; the sources stay alive until its fence retires.
pub struct RetiringBlasBatch<A: Api> {
    query_pool: A::QueryPool,
    pending: Vec<PendingBlas<A>>,
}

impl<A: Api> RetiringBlasBatch<A> {
    /// Free the non-compacted structures, their scratch and the query pool.
    ///
    /// The caller must have waited on a fence covering the compaction copies.
    pub fn retire(self, device: &A::Device) {
        debug!(count = self.pending.len(), "retiring non-compacted BLAS");
        destroy_pending(device, self.pending, self.query_pool);
    }
}

fn destroy_pending<A: Api>(device: &A::Device, pending: Vec<PendingBlas<A>>, pool: A::QueryPool) {
    for blas in pending {
        blas.destroy(device);
    }
    device.destroy_query_pool(pool);
}

fn allocate<A: Api>(
    device: &A::Device,
    kind: BlasKind,
    sizes: &AccelerationStructureSizes,
) -> Result<(A::AccelerationStructure, A::Buffer)> {
    let structure = device.create_acceleration_structure(
        AccelerationStructureKind::Bottom(kind),
        sizes.structure_size,
    )?;
    match device.create_buffer(BufferKind::Scratch, sizes.scratch_size().max(1)) {
        Ok(scratch) => Ok((structure, scratch)),
        Err(error) => {
            device.destroy_acceleration_structure(structure);
            Err(error)
        }
    }
}

/// An intermediate BLAS for geometry that deforms every frame.
pub struct DynamicBlas<A: Api> {
    structure: A::AccelerationStructure,
    scratch: A::Buffer,
    sizes: AccelerationStructureSizes,
    built: bool,
}

impl<A: Api> DynamicBlas<A> {
    /// Allocate a structure and a scratch buffer covering both builds and updates.
    pub fn new(device: &A::Device, geometries: &[GeometryDesc]) -> Result<Self> {
        let sizes = device.intermediate_blas_sizes(geometries);
        debug_assert!(
            sizes.update_scratch_size.is_some(),
            "intermediate BLAS must report an update scratch size"
        );
        let (structure, scratch) = allocate::<A>(device, BlasKind::Intermediate, &sizes)?;
        Ok(Self {
            structure,
            scratch,
            sizes,
            built: false,
        })
    }

    pub fn structure(&self) -> &A::AccelerationStructure {
        &self.structure
    }

    pub fn sizes(&self) -> AccelerationStructureSizes {
        self.sizes
    }

    /// Record a full build followed by its store barrier.
    pub fn record_build(
        &mut self,
        graphics: &mut A::GraphicsCommandBuffer,
        geometries: &[TriangleGeometry<'_, A>],
    ) {
        graphics.build_intermediate_blas(&mut self.structure, geometries, &self.scratch);
        graphics.build_intermediate_blas_store(&[&self.structure]);
        self.built = true;
    }

    /// Record a refit from new vertex positions followed by its store barrier.
    pub fn record_update(
        &mut self,
        graphics: &mut A::GraphicsCommandBuffer,
        vertex_positions: &[BuildInputView<'_, A::Buffer>],
    ) {
        debug_assert!(self.built, "intermediate BLAS updated before its first build");
        graphics.update_intermediate_blas(&mut self.structure, vertex_positions, &self.scratch);
        graphics.update_intermediate_blas_store(&[&self.structure]);
    }

    pub fn destroy(self, device: &A::Device) {
        device.destroy_acceleration_structure(self.structure);
        device.destroy_buffer(self.scratch);
    }
}
