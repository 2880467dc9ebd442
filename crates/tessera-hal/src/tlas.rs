//! Top-level acceleration structures.

use crate::command::GraphicsCommandBuffer;
use crate::device::{create_instance_buffer, Device};
use crate::resource::{blas_reference, Buffer};
use crate::Api;
use tessera_core::constants::INSTANCE_RECORD_SIZE;
use tessera_core::{
    AccelerationStructureKind, AccelerationStructureSizes, BufferKind, InstanceRecord, Result,
    TlasInstance,
};
use tracing::debug;

/// A TLAS with its instance upload buffer and scratch.
///
/// Instances are written on the host into the upload buffer, then built on the
/// graphics queue. Once built, the structure may be refit as long as the
/// instance count stays the same; a changed count requires a full build.
pub struct TopLevel<A: Api> {
    structure: A::AccelerationStructure,
    instances: A::Buffer,
    scratch: A::Buffer,
    capacity: u32,
    built_count: Option<u32>,
}

impl<A: Api> TopLevel<A> {
    /// Allocate a TLAS able to hold `capacity` instances.
    pub fn new(device: &A::Device, capacity: u32) -> Result<Self> {
        let sizes: AccelerationStructureSizes = device.tlas_sizes(capacity);
        let structure =
            device.create_acceleration_structure(AccelerationStructureKind::Top, sizes.structure_size)?;
        let instances = match create_instance_buffer::<A>(device, capacity) {
            Ok(buffer) => buffer,
            Err(error) => {
                device.destroy_acceleration_structure(structure);
                return Err(error);
            }
        };
        let scratch = match device.create_buffer(BufferKind::Scratch, sizes.scratch_size().max(1)) {
            Ok(buffer) => buffer,
            Err(error) => {
                device.destroy_buffer(instances);
                device.destroy_acceleration_structure(structure);
                return Err(error);
            }
        };
        debug!(capacity, size = sizes.structure_size, "created TLAS");
        Ok(Self {
            structure,
            instances,
            scratch,
            capacity,
            built_count: None,
        })
    }

    pub fn structure(&self) -> &A::AccelerationStructure {
        &self.structure
    }

    pub fn instance_buffer(&self) -> &A::Buffer {
        &self.instances
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Instance count of the last recorded build.
    pub fn built_count(&self) -> Option<u32> {
        self.built_count
    }

    /// Write instance records starting at slot 0.
    ///
    /// The buffer must not be read by in-flight work.
    pub fn write_instances(&self, instances: &[TlasInstance]) -> Result<()> {
        debug_assert!(
            instances.len() <= self.capacity as usize,
            "{} instances exceed TLAS capacity {}",
            instances.len(),
            self.capacity
        );
        let records: Vec<InstanceRecord> = instances.iter().map(TlasInstance::to_record).collect();
        self.instances.write_bytes(0, bytemuck::cast_slice(&records))
    }

    /// Write one instance referencing `blas` into `slot`.
    pub fn write_instance_of(
        &self,
        slot: u32,
        blas: &A::AccelerationStructure,
        instance: TlasInstance,
    ) -> Result<()> {
        debug_assert!(slot < self.capacity, "slot {slot} out of TLAS capacity {}", self.capacity);
        let record = TlasInstance {
            blas_address: blas_reference(blas),
            ..instance
        }
        .to_record();
        self.instances
            .write_bytes(u64::from(slot) * INSTANCE_RECORD_SIZE, bytemuck::bytes_of(&record))
    }

    /// Record a full build over the first `instance_count` records.
    ///
    /// Every referenced BLAS must be built, and if it is an asset, acquired by
    /// this command buffer or an earlier one.
    pub fn record_build(&mut self, graphics: &mut A::GraphicsCommandBuffer, instance_count: u32) {
        debug_assert!(
            instance_count <= self.capacity,
            "{instance_count} instances exceed TLAS capacity {}",
            self.capacity
        );
        graphics.build_tlas(&mut self.structure, instance_count, &self.instances, &self.scratch);
        graphics.build_tlas_store(&self.structure);
        self.built_count = Some(instance_count);
    }

    /// Record a refit with the instance count of the last build.
    pub fn record_update(&mut self, graphics: &mut A::GraphicsCommandBuffer) {
        debug_assert!(self.built_count.is_some(), "TLAS updated before its first build");
        graphics.update_tlas(&mut self.structure, &self.instances, &self.scratch);
        graphics.update_tlas_store(&self.structure);
    }

    pub fn destroy(self, device: &A::Device) {
        device.destroy_buffer(self.scratch);
        device.destroy_buffer(self.instances);
        device.destroy_acceleration_structure(self.structure);
    }
}
