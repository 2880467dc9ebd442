//! Cross-queue ownership transfer planning.
//!
//! Backends do not decide barrier content themselves. `release` and `acquire`
//! call [`plan_release`] and [`plan_acquire`] with the shape of the transferred
//! asset set and translate the resulting [`TransferBarrier`]s into native
//! barriers. Both halves are produced from the same table so they always
//! agree on access scopes, queue families and image layouts.

use bitflags::bitflags;
use tessera_core::ResourceId;

/// How the upload and graphics queues map onto hardware queue families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueTopology {
    /// Both logical queues share one family. Ownership never changes.
    Unified { family: u32 },
    /// Uploads run on their own family and ownership must be transferred.
    Dedicated { graphics_family: u32, upload_family: u32 },
}

impl QueueTopology {
    /// Whether release and acquire must issue queue family ownership transfers.
    pub const fn is_dedicated(self) -> bool {
        matches!(self, Self::Dedicated { .. })
    }

    pub const fn graphics_family(self) -> u32 {
        match self {
            Self::Unified { family } => family,
            Self::Dedicated {
                graphics_family, ..
            } => graphics_family,
        }
    }

    pub const fn upload_family(self) -> u32 {
        match self {
            Self::Unified { family } => family,
            Self::Dedicated { upload_family, .. } => upload_family,
        }
    }
}

bitflags! {
    /// Memory access scopes named by transfer barriers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u8 {
        const TRANSFER_WRITE = 1 << 0;
        const SHADER_READ = 1 << 1;
        const BUILD_INPUT_READ = 1 << 2;
        const ACCELERATION_STRUCTURE_WRITE = 1 << 3;
        const ACCELERATION_STRUCTURE_READ = 1 << 4;
    }
}

/// Image layouts involved in asset transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    TransferDestination,
    ShaderReadOnly,
}

/// Which half of an ownership transfer a barrier implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierHalf {
    /// Recorded on the upload queue; makes writes available and gives up ownership.
    Release,
    /// Recorded on the graphics queue; takes ownership and makes writes visible.
    Acquire,
    /// Same-queue barrier combining both halves.
    Full,
}

/// Resource a barrier applies to, indexing into the transferred asset set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferTarget {
    Buffer(usize),
    Image { index: usize, mip_levels: u32 },
    AccelerationStructure(usize),
}

/// One planned barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferBarrier {
    pub target: TransferTarget,
    pub half: BarrierHalf,
    /// Family giving up ownership, `None` when ownership does not change.
    pub src_family: Option<u32>,
    /// Family taking ownership, `None` when ownership does not change.
    pub dst_family: Option<u32>,
    /// Writes made available. Empty on acquire halves.
    pub src_access: Access,
    /// Reads made visible. Empty on release halves.
    pub dst_access: Access,
    /// Layout transition, images only.
    pub layouts: Option<(ImageLayout, ImageLayout)>,
}

/// Counts of each resource class in a transferred asset set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferShape {
    pub buffers: usize,
    /// Mip levels transferred per image.
    pub image_mip_levels: Vec<u32>,
    pub acceleration_structures: usize,
}

impl TransferShape {
    pub fn is_empty(&self) -> bool {
        self.buffers == 0 && self.image_mip_levels.is_empty() && self.acceleration_structures == 0
    }
}

/// Writes and destination reads of each asset class.
const fn scopes(target: TransferTarget) -> (Access, Access, Option<(ImageLayout, ImageLayout)>) {
    match target {
        TransferTarget::Buffer(_) => (
            Access::TRANSFER_WRITE,
            Access::SHADER_READ.union(Access::BUILD_INPUT_READ),
            None,
        ),
        TransferTarget::Image { .. } => (
            Access::TRANSFER_WRITE,
            Access::SHADER_READ,
            Some((ImageLayout::TransferDestination, ImageLayout::ShaderReadOnly)),
        ),
        TransferTarget::AccelerationStructure(_) => (
            Access::ACCELERATION_STRUCTURE_WRITE,
            Access::ACCELERATION_STRUCTURE_READ,
            None,
        ),
    }
}

fn targets(shape: &TransferShape) -> impl Iterator<Item = TransferTarget> + '_ {
    (0..shape.buffers)
        .map(TransferTarget::Buffer)
        .chain(
            shape
                .image_mip_levels
                .iter()
                .enumerate()
                .map(|(index, &mip_levels)| TransferTarget::Image { index, mip_levels }),
        )
        .chain((0..shape.acceleration_structures).map(TransferTarget::AccelerationStructure))
}

/// Barriers recorded by `release` on the upload command buffer.
///
/// On a unified topology nothing is recorded: the matching `acquire` issues a
/// full barrier on the shared queue.
pub fn plan_release(topology: QueueTopology, shape: &TransferShape) -> Vec<TransferBarrier> {
    let QueueTopology::Dedicated {
        graphics_family,
        upload_family,
    } = topology
    else {
        return Vec::new();
    };
    targets(shape)
        .map(|target| {
            let (src_access, _, layouts) = scopes(target);
            TransferBarrier {
                target,
                half: BarrierHalf::Release,
                src_family: Some(upload_family),
                dst_family: Some(graphics_family),
                src_access,
                dst_access: Access::empty(),
                layouts,
            }
        })
        .collect()
}

/// Barriers recorded by `acquire` on the graphics command buffer.
pub fn plan_acquire(topology: QueueTopology, shape: &TransferShape) -> Vec<TransferBarrier> {
    targets(shape)
        .map(|target| {
            let (src_access, dst_access, layouts) = scopes(target);
            match topology {
                QueueTopology::Dedicated {
                    graphics_family,
                    upload_family,
                } => TransferBarrier {
                    target,
                    half: BarrierHalf::Acquire,
                    src_family: Some(upload_family),
                    dst_family: Some(graphics_family),
                    src_access: Access::empty(),
                    dst_access,
                    layouts,
                },
                QueueTopology::Unified { .. } => TransferBarrier {
                    target,
                    half: BarrierHalf::Full,
                    src_family: None,
                    dst_family: None,
                    src_access,
                    dst_access,
                    layouts,
                },
            }
        })
        .collect()
}

/// Identity of every resource named by one `release` or `acquire` batch.
///
/// Populated only in debug builds. Graphics queue submission compares the
/// ledger of the upload command buffer it waits on with the ledger of the
/// graphics command buffer it submits.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransferLedger {
    #[cfg(debug_assertions)]
    ids: Vec<ResourceId>,
}

impl TransferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the resources of one batch.
    #[allow(unused_variables)]
    pub fn record(&mut self, ids: impl IntoIterator<Item = ResourceId>) {
        #[cfg(debug_assertions)]
        self.ids.extend(ids);
    }

    /// Forget all recorded resources.
    pub fn clear(&mut self) {
        #[cfg(debug_assertions)]
        self.ids.clear();
    }

    /// Number of recorded resources, zero when tracking is compiled out.
    pub fn len(&self) -> usize {
        #[cfg(debug_assertions)]
        {
            self.ids.len()
        }
        #[cfg(not(debug_assertions))]
        {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Assert that the acquired set equals the released set, ignoring order.
    #[allow(unused_variables)]
    pub fn assert_matches(released: &Self, acquired: &Self) {
        #[cfg(debug_assertions)]
        {
            let mut released_ids = released.ids.clone();
            let mut acquired_ids = acquired.ids.clone();
            released_ids.sort_unstable();
            acquired_ids.sort_unstable();
            debug_assert!(
                released_ids == acquired_ids,
                "acquire set does not match release set: released {released_ids:?}, acquired {acquired_ids:?}"
            );
        }
    }
}
