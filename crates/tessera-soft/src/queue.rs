//! Queues and the command executor.
//!
//! Submissions execute on the calling thread. Results that a real device
//! would only expose after a fence wait are parked on the fence as
//! retirements.

use crate::command::{Command, SoftGraphicsCommandBuffer, SoftUploadCommandBuffer};
use crate::descriptor::Dispatch;
use crate::device::DeviceShared;
use crate::resource::{byte_range, BufferInner, ImageInner, QuerySlot, StructureInner};
use crate::structure::{BottomLevel, Contents, GeometryData, TopLevelData};
use crate::sync::{Retirement, SoftFence};
use crate::SoftApi;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tessera_core::constants::INSTANCE_RECORD_SIZE;
use tessera_core::{AccelerationStructureKind, Error, InstanceRecord, Result};
use tessera_hal::{GraphicsCommandBuffer, GraphicsQueue, TransferLedger, UploadCommandBuffer, UploadQueue};
use tracing::{debug, trace};

fn copy_buffer(
    src: &BufferInner,
    src_offset: u64,
    dst: &BufferInner,
    dst_offset: u64,
    size: u64,
) -> Result<()> {
    let src_range = byte_range(src_offset, size, src.size)?;
    let dst_range = byte_range(dst_offset, size, dst.size)?;
    // Source and destination may be the same buffer.
    let bytes = src.data.read()[src_range].to_vec();
    dst.data.write()[dst_range].copy_from_slice(&bytes);
    Ok(())
}

fn copy_buffer_to_image(
    src: &BufferInner,
    src_offset: u64,
    row_pitch: u32,
    row_count: u32,
    dst: &ImageInner,
    mip: u32,
) -> Result<()> {
    let (row_bytes, rows) = dst.mip_layout(mip);
    if row_count as usize != rows || (row_pitch as usize) < row_bytes {
        return Err(Error::InvalidState(format!(
            "mip {mip} needs {rows} rows of {row_bytes} bytes, staged {row_count} rows at pitch {row_pitch}"
        )));
    }
    let level = dst
        .mips
        .get(mip as usize)
        .ok_or_else(|| Error::InvalidState(format!("image has no mip level {mip}")))?;
    let mut level = level.write();
    for (row, out) in level.chunks_exact_mut(row_bytes.max(1)).enumerate() {
        src.read(src_offset + row as u64 * u64::from(row_pitch), out)?;
    }
    Ok(())
}

fn read_all(buffer: &BufferInner) -> Vec<u8> {
    buffer.data.read().clone()
}

fn read_records(instances: &BufferInner, count: u32) -> Result<Vec<InstanceRecord>> {
    let mut bytes = vec![0; (u64::from(count) * INSTANCE_RECORD_SIZE) as usize];
    instances.read(0, &mut bytes)?;
    Ok(bytes
        .chunks_exact(INSTANCE_RECORD_SIZE as usize)
        .map(bytemuck::pod_read_unaligned)
        .collect())
}

/// Resolve an instance address to a built bottom-level structure.
fn bottom_resolver(shared: &DeviceShared) -> impl Fn(u64) -> Option<Arc<StructureInner>> + '_ {
    |address| {
        shared
            .resolve(address)
            .filter(|s| matches!(s.kind, AccelerationStructureKind::Bottom(_)))
    }
}

fn build_bottom(
    dst: &Arc<StructureInner>,
    geometries: &[crate::command::GeometryInput],
) -> Result<Arc<BottomLevel>> {
    let decoded = geometries
        .iter()
        .map(|g| {
            let vertices = read_all(&g.vertices);
            let indices = g.indices.as_deref().map(read_all);
            GeometryData::decode(g.desc, &vertices, indices.as_deref())
        })
        .collect::<Result<Vec<_>>>()?;
    let bottom = BottomLevel::build(decoded)?;
    debug!(
        kind = ?dst.kind,
        triangles = bottom.triangle_count(),
        "built bottom-level structure"
    );
    Ok(Arc::new(bottom))
}

/// Execute `commands` in order, returning what a fence covering them retires.
pub(crate) fn execute(shared: &DeviceShared, commands: &[Command]) -> Result<Vec<Retirement>> {
    let mut retirements = Vec::new();
    for command in commands {
        trace!(command = command.name(), "execute");
        match command {
            Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => copy_buffer(src, *src_offset, dst, *dst_offset, *size)?,
            Command::CopyBufferToImage {
                src,
                src_offset,
                row_pitch,
                row_count,
                dst,
                mip,
            } => copy_buffer_to_image(src, *src_offset, *row_pitch, *row_count, dst, *mip)?,
            Command::Barrier(label) => trace!(label, "barrier"),
            Command::Transfer(barriers) => trace!(count = barriers.len(), "ownership transfer"),
            Command::BuildBottom {
                dst,
                geometries,
                query,
            } => {
                let bottom = build_bottom(dst, geometries)?;
                dst.retired.store(false, Ordering::Release);
                if let Some((pool, index)) = query {
                    let size = bottom.compacted_size();
                    if let Some(slot) = pool.slots.lock().get_mut(*index as usize) {
                        *slot = QuerySlot::Pending(size);
                    }
                    retirements.push(Retirement::QuerySlot {
                        pool: Arc::clone(pool),
                        index: *index,
                    });
                    retirements.push(Retirement::Structure(Arc::clone(dst)));
                }
                *dst.contents.write() = Contents::Bottom(bottom);
            }
            Command::UpdateBottom {
                dst,
                vertex_buffers,
            } => {
                let buffers: Vec<Vec<u8>> = vertex_buffers.iter().map(|b| read_all(b)).collect();
                let slices: Vec<&[u8]> = buffers.iter().map(Vec::as_slice).collect();
                let mut contents = dst.contents.write();
                let Contents::Bottom(bottom) = &mut *contents else {
                    return Err(Error::InvalidState(
                        "bottom-level update of a structure that was never built".to_string(),
                    ));
                };
                let positions = bottom.decode_update(&slices)?;
                Arc::make_mut(bottom).update(&positions)?;
            }
            Command::Compact { dst, src } => {
                let Contents::Bottom(bottom) = &*src.contents.read() else {
                    return Err(Error::InvalidState(
                        "compaction source was never built".to_string(),
                    ));
                };
                let needed = bottom.compacted_size();
                if dst.size < needed {
                    return Err(Error::InvalidState(format!(
                        "compacted BLAS of {} bytes cannot hold {needed} bytes",
                        dst.size
                    )));
                }
                *dst.contents.write() = Contents::Bottom(Arc::clone(bottom));
            }
            Command::BuildTop {
                dst,
                instances,
                instance_count,
            } => {
                let records = read_records(instances, *instance_count)?;
                let top = TopLevelData::build(&records, bottom_resolver(shared))?;
                for blas in top.referenced() {
                    blas.ownership.assert_graphics_readable("BLAS");
                }
                debug!(instances = instance_count, "built top-level structure");
                *dst.contents.write() = Contents::Top(top);
            }
            Command::UpdateTop { dst, instances } => {
                let count = match &*dst.contents.read() {
                    Contents::Top(top) => top.instance_count(),
                    _ => {
                        return Err(Error::InvalidState(
                            "TLAS update of a structure that was never built".to_string(),
                        ))
                    }
                };
                let records = read_records(instances, count)?;
                let mut contents = dst.contents.write();
                if let Contents::Top(top) = &mut *contents {
                    top.update(&records, bottom_resolver(shared))?;
                }
            }
            Command::Dispatch {
                name,
                kernel,
                sets,
                group_count,
            } => {
                trace!(%name, ?group_count, "dispatch");
                kernel(&Dispatch {
                    sets,
                    group_count: *group_count,
                })?;
            }
            Command::BeginRenderPass {
                width,
                height,
                clears,
            } => {
                for clear in clears {
                    clear.image.fill(*width, *height, &clear.texel);
                    if let Some(stencil) = clear.stencil {
                        clear.image.fill_stencil(*width, *height, stencil);
                    }
                }
                trace!(width, height, clears = clears.len(), "begin render pass");
            }
            Command::Draw {
                pipeline,
                vertex_count,
                instance_count,
            } => trace!(%pipeline, vertex_count, instance_count, "draw"),
            Command::EndRenderPass => trace!("end render pass"),
            Command::BeginLabel(label) => trace!(%label, "begin label"),
            Command::EndLabel => trace!("end label"),
        }
    }
    Ok(retirements)
}

/// The emulated graphics queue.
pub struct SoftGraphicsQueue {
    shared: Arc<DeviceShared>,
}

impl SoftGraphicsQueue {
    pub(crate) fn new(shared: Arc<DeviceShared>) -> Self {
        Self { shared }
    }
}

impl fmt::Debug for SoftGraphicsQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftGraphicsQueue")
            .field("family", &self.shared.topology.graphics_family())
            .finish()
    }
}

impl GraphicsQueue<SoftApi> for SoftGraphicsQueue {
    fn wait_and_submit(
        &self,
        upload: Option<&SoftUploadCommandBuffer>,
        graphics: &SoftGraphicsCommandBuffer,
        fence: &SoftFence,
    ) -> Result<()> {
        match upload {
            Some(upload) => {
                debug_assert!(
                    upload.submission.lock().semaphore_signaled,
                    "graphics submission waits on an upload that was never submitted"
                );
                TransferLedger::assert_matches(upload.released(), graphics.acquired());
            }
            None => debug_assert!(
                graphics.acquired().is_empty(),
                "graphics command buffer acquires assets without an upload to wait on"
            ),
        }
        let executed = execute(&self.shared, graphics.commands())?;
        // The wait is consumed only by a submission that ran.
        let mut retirements = Vec::new();
        if let Some(upload) = upload {
            let mut submission = upload.submission.lock();
            submission.semaphore_signaled = false;
            retirements.append(&mut submission.retirements);
        }
        retirements.extend(executed);
        fence.signal(retirements);
        Ok(())
    }
}

/// The emulated upload queue.
pub struct SoftUploadQueue {
    shared: Arc<DeviceShared>,
}

impl SoftUploadQueue {
    pub(crate) fn new(shared: Arc<DeviceShared>) -> Self {
        Self { shared }
    }
}

impl fmt::Debug for SoftUploadQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftUploadQueue")
            .field("family", &self.shared.topology.upload_family())
            .finish()
    }
}

impl UploadQueue<SoftApi> for SoftUploadQueue {
    fn submit_and_signal(&self, upload: &SoftUploadCommandBuffer) -> Result<()> {
        let retirements = execute(&self.shared, upload.commands())?;
        let mut submission = upload.submission.lock();
        debug_assert!(
            !submission.semaphore_signaled,
            "upload submitted again before a graphics submission waited on it"
        );
        submission.semaphore_signaled = true;
        submission.retirements = retirements;
        Ok(())
    }

    fn submit_with_fence(&self, upload: &SoftUploadCommandBuffer, fence: &SoftFence) -> Result<()> {
        let retirements = execute(&self.shared, upload.commands())?;
        fence.signal(retirements);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::SoftBuffer;
    use tessera_core::BufferKind;

    #[test]
    fn out_of_range_copies_fail_without_touching_memory() {
        let src = SoftBuffer::new(BufferKind::StagingUpload, 64);
        let dst = SoftBuffer::new(BufferKind::StorageAsset, 64);
        src.0.write(0, &[9; 64]).unwrap();

        let err = copy_buffer(&src.0, 0, &dst.0, 0, u64::MAX / 2).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(copy_buffer(&src.0, 32, &dst.0, 0, 64).is_err());
        assert!(copy_buffer(&src.0, 0, &dst.0, 16, 64).is_err());
        assert!(dst.0.data.read().iter().all(|&b| b == 0));

        copy_buffer(&src.0, 16, &dst.0, 0, 48).unwrap();
        let data = dst.0.data.read();
        assert_eq!(&data[..48], &[9; 48]);
        assert_eq!(&data[48..], &[0; 16]);
    }

    #[test]
    fn copy_within_one_buffer() {
        let buffer = SoftBuffer::new(BufferKind::StorageAsset, 8);
        buffer.0.write(0, &[1, 2, 3, 4, 0, 0, 0, 0]).unwrap();
        copy_buffer(&buffer.0, 0, &buffer.0, 4, 4).unwrap();
        assert_eq!(*buffer.0.data.read(), vec![1, 2, 3, 4, 1, 2, 3, 4]);
    }
}
