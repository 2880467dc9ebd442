//! Emulated resources.
//!
//! Every resource is a cheap handle to shared storage so that recorded
//! commands can keep it alive until they execute.

use crate::structure::{Contents, Hit, Ray};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tessera_core::format::mip_extent;
use tessera_core::{
    AccelerationStructureKind, BufferKind, Capabilities, Error, MemoryUsage, ResourceId, Result,
    SampledAssetImageFormat, SamplerFilter, TargetImageKind, SAMPLED_ASSET_IMAGE_CAPABILITIES,
};
use tessera_hal::{AccelerationStructure, Buffer, Image, OwnershipCell, Resource, TargetImage};

pub(crate) struct BufferInner {
    pub id: ResourceId,
    pub kind: BufferKind,
    pub size: u64,
    pub data: RwLock<Vec<u8>>,
    pub ownership: OwnershipCell,
}

impl BufferInner {
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let range = byte_range(offset, out.len() as u64, self.size)?;
        out.copy_from_slice(&self.data.read()[range]);
        Ok(())
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let range = byte_range(offset, data.len() as u64, self.size)?;
        self.data.write()[range].copy_from_slice(data);
        Ok(())
    }
}

/// Host range of `len` bytes at `offset` in a buffer of `size` bytes.
pub(crate) fn byte_range(offset: u64, len: u64, size: u64) -> Result<std::ops::Range<usize>> {
    let end = offset
        .checked_add(len)
        .filter(|&end| end <= size)
        .ok_or_else(|| {
            Error::InvalidState(format!(
                "range {offset}..+{len} exceeds buffer size {size}"
            ))
        })?;
    Ok(offset as usize..end as usize)
}

/// An emulated buffer.
pub struct SoftBuffer(pub(crate) Arc<BufferInner>);

impl SoftBuffer {
    pub(crate) fn new(kind: BufferKind, size: u64) -> Self {
        Self(Arc::new(BufferInner {
            id: ResourceId::next(),
            kind,
            size,
            data: RwLock::new(vec![0; size as usize]),
            ownership: OwnershipCell::for_kind(kind.is_asset()),
        }))
    }

    fn memory_usage(&self) -> MemoryUsage {
        self.0.kind.pool_class().memory_usage()
    }
}

impl fmt::Debug for SoftBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftBuffer")
            .field("id", &self.0.id)
            .field("kind", &self.0.kind)
            .field("size", &self.0.size)
            .finish()
    }
}

impl Resource for SoftBuffer {
    fn id(&self) -> ResourceId {
        self.0.id
    }

    fn capabilities(&self) -> Capabilities {
        self.0.kind.capabilities()
    }

    fn ownership(&self) -> &OwnershipCell {
        &self.0.ownership
    }
}

impl Buffer for SoftBuffer {
    fn kind(&self) -> BufferKind {
        self.0.kind
    }

    fn size(&self) -> u64 {
        self.0.size
    }

    fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        if self.memory_usage() != MemoryUsage::HostUpload {
            return Err(Error::InvalidState(format!(
                "{:?} buffer is not host writable",
                self.0.kind
            )));
        }
        self.0.write(offset, data)
    }

    fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        if self.memory_usage() == MemoryUsage::DeviceLocal {
            return Err(Error::InvalidState(format!(
                "{:?} buffer is not host visible",
                self.0.kind
            )));
        }
        self.0.read(offset, out)
    }
}

pub(crate) struct ImageInner {
    pub id: ResourceId,
    pub format: SampledAssetImageFormat,
    pub width: u32,
    pub height: u32,
    pub mips: Vec<RwLock<Vec<u8>>>,
    pub ownership: OwnershipCell,
}

impl ImageInner {
    /// Tightly packed byte size of one row of blocks and the row count of `mip`.
    pub fn mip_layout(&self, mip: u32) -> (usize, usize) {
        let width = mip_extent(self.width, mip);
        let height = mip_extent(self.height, mip);
        (
            self.format.row_size(width) as usize,
            self.format.row_count(height) as usize,
        )
    }
}

/// An emulated sampled asset image. Mip levels are stored tightly packed.
pub struct SoftImage(pub(crate) Arc<ImageInner>);

impl SoftImage {
    pub(crate) fn new(
        format: SampledAssetImageFormat,
        width: u32,
        height: u32,
        mip_levels: u32,
    ) -> Self {
        let mut inner = ImageInner {
            id: ResourceId::next(),
            format,
            width,
            height,
            mips: Vec::new(),
            ownership: OwnershipCell::asset(),
        };
        inner.mips = (0..mip_levels)
            .map(|mip| {
                let (row, rows) = inner.mip_layout(mip);
                RwLock::new(vec![0; row * rows])
            })
            .collect();
        Self(Arc::new(inner))
    }

    /// Copy of the texel blocks of `mip`.
    pub fn mip_data(&self, mip: u32) -> Option<Vec<u8>> {
        self.0.mips.get(mip as usize).map(|data| data.read().clone())
    }
}

impl fmt::Debug for SoftImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftImage")
            .field("id", &self.0.id)
            .field("format", &self.0.format)
            .field("extent", &(self.0.width, self.0.height))
            .field("mip_levels", &self.0.mips.len())
            .finish()
    }
}

impl Resource for SoftImage {
    fn id(&self) -> ResourceId {
        self.0.id
    }

    fn capabilities(&self) -> Capabilities {
        SAMPLED_ASSET_IMAGE_CAPABILITIES
    }

    fn ownership(&self) -> &OwnershipCell {
        &self.0.ownership
    }
}

impl Image for SoftImage {
    fn format(&self) -> SampledAssetImageFormat {
        self.0.format
    }

    fn width(&self) -> u32 {
        self.0.width
    }

    fn height(&self) -> u32 {
        self.0.height
    }

    fn mip_levels(&self) -> u32 {
        self.0.mips.len() as u32
    }
}

pub(crate) struct TargetImageInner {
    pub id: ResourceId,
    pub kind: TargetImageKind,
    pub width: u32,
    pub height: u32,
    pub allow_sampled: bool,
    /// Row-major texels. Depth is stored as little-endian `f32`.
    pub texels: RwLock<Vec<u8>>,
    /// One byte per texel for depth-stencil formats with a stencil aspect.
    pub stencil: Option<RwLock<Vec<u8>>>,
    pub ownership: OwnershipCell,
}

impl TargetImageInner {
    pub fn texel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Fill the top-left `width` x `height` texels with `texel`.
    pub fn fill(&self, width: u32, height: u32, texel: &[u8]) {
        let size = texel.len();
        let mut texels = self.texels.write();
        for row in 0..height.min(self.height) as usize {
            let start = row * self.width as usize;
            for column in 0..width.min(self.width) as usize {
                let at = (start + column) * size;
                texels[at..at + size].copy_from_slice(texel);
            }
        }
    }

    pub fn fill_stencil(&self, width: u32, height: u32, value: u8) {
        let Some(stencil) = &self.stencil else {
            return;
        };
        let mut stencil = stencil.write();
        for row in 0..height.min(self.height) as usize {
            let start = row * self.width as usize;
            let end = start + width.min(self.width) as usize;
            stencil[start..end].fill(value);
        }
    }
}

/// An emulated color attachment, depth-stencil attachment or storage image.
pub struct SoftTargetImage(pub(crate) Arc<TargetImageInner>);

impl SoftTargetImage {
    pub(crate) fn new(kind: TargetImageKind, width: u32, height: u32, allow_sampled: bool) -> Self {
        let texel_count = width as usize * height as usize;
        let stencil = match kind {
            TargetImageKind::DepthStencilAttachment(format) if format.has_stencil() => {
                Some(RwLock::new(vec![0; texel_count]))
            }
            _ => None,
        };
        Self(Arc::new(TargetImageInner {
            id: ResourceId::next(),
            kind,
            width,
            height,
            allow_sampled,
            texels: RwLock::new(vec![0; texel_count * kind.texel_size() as usize]),
            stencil,
            ownership: OwnershipCell::untracked(),
        }))
    }

    /// Copy of the texel data.
    pub fn texels(&self) -> Vec<u8> {
        self.0.texels.read().clone()
    }

    /// Copy of the stencil aspect, if the format has one.
    pub fn stencil(&self) -> Option<Vec<u8>> {
        self.0.stencil.as_ref().map(|stencil| stencil.read().clone())
    }

    pub(crate) fn byte_size(&self) -> u64 {
        let stencil = self.0.stencil.as_ref().map_or(0, |_| self.0.texel_count());
        (self.0.texel_count() * self.0.kind.texel_size() as usize + stencil) as u64
    }
}

impl fmt::Debug for SoftTargetImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftTargetImage")
            .field("id", &self.0.id)
            .field("kind", &self.0.kind)
            .field("extent", &(self.0.width, self.0.height))
            .field("allow_sampled", &self.0.allow_sampled)
            .finish()
    }
}

impl Resource for SoftTargetImage {
    fn id(&self) -> ResourceId {
        self.0.id
    }

    fn capabilities(&self) -> Capabilities {
        self.0.kind.capabilities(self.0.allow_sampled)
    }

    fn ownership(&self) -> &OwnershipCell {
        &self.0.ownership
    }
}

impl TargetImage for SoftTargetImage {
    fn kind(&self) -> TargetImageKind {
        self.0.kind
    }

    fn width(&self) -> u32 {
        self.0.width
    }

    fn height(&self) -> u32 {
        self.0.height
    }
}

#[derive(Debug)]
pub struct SoftSampler {
    pub(crate) filter: SamplerFilter,
}

impl SoftSampler {
    pub fn filter(&self) -> SamplerFilter {
        self.filter
    }
}

pub(crate) struct StructureInner {
    pub id: ResourceId,
    pub kind: AccelerationStructureKind,
    pub size: u64,
    pub address: u64,
    pub contents: RwLock<Contents>,
    /// Set once a fence covering the last non-compacted build has been waited on.
    pub retired: AtomicBool,
    pub ownership: OwnershipCell,
}

impl StructureInner {
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

/// An emulated acceleration structure.
pub struct SoftAccelerationStructure(pub(crate) Arc<StructureInner>);

impl SoftAccelerationStructure {
    pub(crate) fn new(kind: AccelerationStructureKind, size: u64, address: u64) -> Self {
        Self(Arc::new(StructureInner {
            id: ResourceId::next(),
            kind,
            size,
            address,
            contents: RwLock::new(Contents::Empty),
            retired: AtomicBool::new(false),
            ownership: OwnershipCell::for_kind(kind.is_asset()),
        }))
    }

    /// Number of BVH nodes currently built, zero when empty.
    pub fn node_count(&self) -> usize {
        self.0.contents.read().node_count()
    }

    /// Closest hit of `ray` against a built TLAS, on the host.
    pub fn trace(&self, ray: &Ray) -> Option<Hit> {
        match &*self.0.contents.read() {
            Contents::Top(top) => top.trace(ray),
            _ => None,
        }
    }
}

impl fmt::Debug for SoftAccelerationStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftAccelerationStructure")
            .field("id", &self.0.id)
            .field("kind", &self.0.kind)
            .field("size", &self.0.size)
            .field("address", &format_args!("{:#x}", self.0.address))
            .finish()
    }
}

impl Resource for SoftAccelerationStructure {
    fn id(&self) -> ResourceId {
        self.0.id
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ACCELERATION_STRUCTURE
    }

    fn ownership(&self) -> &OwnershipCell {
        &self.0.ownership
    }
}

impl AccelerationStructure for SoftAccelerationStructure {
    fn kind(&self) -> AccelerationStructureKind {
        self.0.kind
    }

    fn size(&self) -> u64 {
        self.0.size
    }

    fn device_address(&self) -> u64 {
        self.0.address
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QuerySlot {
    Unwritten,
    /// Written by an executed build whose fence has not been waited on.
    Pending(u64),
    Available(u64),
}

pub(crate) struct QueryPoolInner {
    pub id: ResourceId,
    pub slots: Mutex<Vec<QuerySlot>>,
}

/// Compacted-size query slots.
pub struct SoftQueryPool(pub(crate) Arc<QueryPoolInner>);

impl SoftQueryPool {
    pub(crate) fn new(count: u32) -> Self {
        Self(Arc::new(QueryPoolInner {
            id: ResourceId::next(),
            slots: Mutex::new(vec![QuerySlot::Unwritten; count as usize]),
        }))
    }

    pub fn len(&self) -> usize {
        self.0.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for SoftQueryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftQueryPool")
            .field("id", &self.0.id)
            .field("slots", &*self.0.slots.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_access_follows_memory_usage() {
        let staging = SoftBuffer::new(BufferKind::StagingUpload, 16);
        staging.write_bytes(4, &[1, 2, 3, 4]).unwrap();
        let mut out = [0; 4];
        staging.read_bytes(4, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        let asset = SoftBuffer::new(BufferKind::StorageAsset, 16);
        assert!(asset.write_bytes(0, &[0]).is_err());
        assert!(asset.read_bytes(0, &mut out).is_err());

        let readback = SoftBuffer::new(BufferKind::Readback, 16);
        assert!(readback.write_bytes(0, &[0]).is_err());
        assert!(readback.read_bytes(0, &mut out).is_ok());
    }

    #[test]
    fn out_of_range_access_is_an_error() {
        let staging = SoftBuffer::new(BufferKind::StagingUpload, 8);
        assert!(staging.write_bytes(6, &[0; 4]).is_err());
        assert!(staging.write_bytes(u64::MAX, &[0]).is_err());
    }

    #[test]
    fn image_mips_are_tightly_packed() {
        let image = SoftImage::new(SampledAssetImageFormat::Bc7Unorm, 16, 8, 3);
        assert_eq!(image.mip_levels(), 3);
        // 4x2 blocks of 16 bytes, then 2x1, then 1x1.
        assert_eq!(image.mip_data(0).unwrap().len(), 128);
        assert_eq!(image.mip_data(1).unwrap().len(), 32);
        assert_eq!(image.mip_data(2).unwrap().len(), 16);
        assert!(image.mip_data(3).is_none());
    }

    #[test]
    fn target_fill_covers_the_render_area() {
        use tessera_core::{DepthStencilAttachmentImageFormat, StorageImageFormat};

        let depth = SoftTargetImage::new(
            TargetImageKind::DepthStencilAttachment(DepthStencilAttachmentImageFormat::D24UnormS8Uint),
            3,
            2,
            false,
        );
        assert_eq!(depth.byte_size(), 6 * 4 + 6);
        depth.0.fill(2, 5, &1.0f32.to_le_bytes());
        depth.0.fill_stencil(1, 1, 7);
        let texels = depth.texels();
        assert_eq!(&texels[0..4], &1.0f32.to_le_bytes());
        assert_eq!(&texels[8..12], &[0; 4]);
        assert_eq!(&texels[12..16], &1.0f32.to_le_bytes());
        assert_eq!(depth.stencil().unwrap(), [7, 0, 0, 0, 0, 0]);

        let storage = SoftTargetImage::new(TargetImageKind::Storage(StorageImageFormat::R32Uint), 2, 2, true);
        assert!(storage.stencil().is_none());
        assert!(storage.capabilities().contains(Capabilities::SAMPLED | Capabilities::STORAGE));
        assert!(!storage.capabilities().contains(Capabilities::ATTACHMENT));
    }

    #[cfg(debug_assertions)]
    #[test]
    fn only_assets_track_ownership() {
        assert!(SoftBuffer::new(BufferKind::StorageAsset, 4)
            .ownership()
            .is_tracked());
        assert!(!SoftBuffer::new(BufferKind::Scratch, 4).ownership().is_tracked());
    }
}
