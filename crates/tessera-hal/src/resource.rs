//! Resource traits and capability-checked views.

use crate::ownership::OwnershipCell;
use std::fmt;
use tessera_core::{
    AccelerationStructureKind, BufferKind, Capabilities, Result, ResourceId,
    SampledAssetImageFormat, TargetImageKind,
};

/// Behaviour shared by buffers, images and acceleration structures.
pub trait Resource: fmt::Debug {
    /// Process-unique identity.
    fn id(&self) -> ResourceId;

    /// Roles granted at creation.
    fn capabilities(&self) -> Capabilities;

    /// Cross-queue ownership shadow state.
    fn ownership(&self) -> &OwnershipCell;
}

/// A buffer of one [`BufferKind`].
pub trait Buffer: Resource {
    fn kind(&self) -> BufferKind;

    fn size(&self) -> u64;

    /// Copy `data` into host-visible memory at `offset`.
    fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Copy host-visible memory at `offset` into `out`.
    fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<()>;

    /// View for binding as a read-only storage buffer.
    fn as_read_only_storage(&self) -> ReadOnlyStorageView<'_, Self>
    where
        Self: Sized,
    {
        ReadOnlyStorageView::new(self)
    }

    /// View for binding as a read-write storage buffer.
    fn as_storage(&self) -> StorageView<'_, Self>
    where
        Self: Sized,
    {
        StorageView::new(self)
    }

    /// View for reading as acceleration structure build input.
    fn as_build_input(&self) -> BuildInputView<'_, Self>
    where
        Self: Sized,
    {
        BuildInputView::new(self)
    }
}

/// A sampled asset image.
pub trait Image: Resource {
    fn format(&self) -> SampledAssetImageFormat;

    fn width(&self) -> u32;

    fn height(&self) -> u32;

    fn mip_levels(&self) -> u32;

    /// View for binding as a sampled image.
    fn as_sampled(&self) -> SampledImageView<'_, Self>
    where
        Self: Sized,
    {
        SampledImageView::new(self)
    }
}

/// A single-mip image written by render or compute passes on the graphics
/// queue. Never transferred between queues.
pub trait TargetImage: Resource {
    fn kind(&self) -> TargetImageKind;

    fn width(&self) -> u32;

    fn height(&self) -> u32;

    /// View for binding as a sampled image. Requires `allow_sampled` at creation.
    fn as_sampled(&self) -> SampledImageView<'_, Self>
    where
        Self: Sized,
    {
        SampledImageView::new(self)
    }

    /// View for binding as a storage image.
    fn as_storage_image(&self) -> StorageImageView<'_, Self>
    where
        Self: Sized,
    {
        StorageImageView::new(self)
    }
}

/// A bottom- or top-level acceleration structure.
pub trait AccelerationStructure: Resource {
    fn kind(&self) -> AccelerationStructureKind;

    /// Size of the backing storage.
    fn size(&self) -> u64;

    /// Address used to reference the structure from TLAS instances.
    fn device_address(&self) -> u64;
}

macro_rules! capability_view {
    ($(#[$meta:meta])* $name:ident, $bound:ident, $capability:ident, $role:literal) => {
        $(#[$meta])*
        pub struct $name<'a, R>(&'a R);

        impl<'a, R: $bound> $name<'a, R> {
            /// Wrap `resource`, asserting it was created with this role.
            pub fn new(resource: &'a R) -> Self {
                debug_assert!(
                    resource.capabilities().contains(Capabilities::$capability),
                    "{:?} was not created with the {} role",
                    resource,
                    $role
                );
                Self(resource)
            }

            /// The underlying resource.
            pub fn resource(&self) -> &'a R {
                self.0
            }
        }

        impl<R> Clone for $name<'_, R> {
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<R> Copy for $name<'_, R> {}

        impl<R: fmt::Debug> fmt::Debug for $name<'_, R> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name)).field(self.0).finish()
            }
        }
    };
}

capability_view!(
    /// A buffer used as a read-only storage buffer.
    ReadOnlyStorageView,
    Buffer,
    READ_ONLY_STORAGE,
    "read-only storage"
);
capability_view!(
    /// A buffer used as a read-write storage buffer.
    StorageView,
    Buffer,
    STORAGE,
    "storage"
);
capability_view!(
    /// A buffer read by an acceleration structure build.
    BuildInputView,
    Buffer,
    BUILD_INPUT,
    "build input"
);
capability_view!(
    /// An asset or target image bound for sampling.
    SampledImageView,
    Resource,
    SAMPLED,
    "sampled"
);
capability_view!(
    /// A storage image written by compute passes.
    StorageImageView,
    TargetImage,
    STORAGE,
    "storage image"
);

/// Address of `blas` for use in a TLAS instance record.
///
/// Only intermediate and compacted structures may be instanced.
pub fn blas_reference<S: AccelerationStructure>(blas: &S) -> u64 {
    debug_assert!(
        blas.kind().is_instanceable(),
        "{blas:?} cannot be referenced by a TLAS instance"
    );
    blas.device_address()
}
