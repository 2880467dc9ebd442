//! Debug-only shadow state for cross-queue asset ownership.
//!
//! Each asset resource carries an [`OwnershipCell`]. In debug builds it holds
//! one byte of state advanced by upload writes, `release` and `acquire`, and
//! asserts that every transition is legal. In release builds the cell is a
//! zero-sized type and every method compiles to nothing.

#[cfg(debug_assertions)]
use std::sync::atomic::{AtomicU8, Ordering};

/// Ownership state of an asset resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OwnershipState {
    /// Not an asset; ownership is not tracked.
    Untracked = 0,
    /// Created, never written.
    Uninitialized = 1,
    /// Written by the upload queue.
    UploadOwned = 2,
    /// Released by the upload queue, not yet acquired.
    InTransfer = 3,
    /// Acquired by the graphics queue.
    GraphicsOwned = 4,
}

impl OwnershipState {
    #[cfg(debug_assertions)]
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Uninitialized,
            2 => Self::UploadOwned,
            3 => Self::InTransfer,
            4 => Self::GraphicsOwned,
            _ => Self::Untracked,
        }
    }
}

/// Per-resource ownership shadow state.
#[derive(Debug)]
pub struct OwnershipCell {
    #[cfg(debug_assertions)]
    state: AtomicU8,
}

impl OwnershipCell {
    /// Cell for an asset resource, starting uninitialized.
    pub fn asset() -> Self {
        Self::with_state(OwnershipState::Uninitialized)
    }

    /// Cell for a resource that never changes queue ownership.
    pub fn untracked() -> Self {
        Self::with_state(OwnershipState::Untracked)
    }

    /// Cell for an asset when `is_asset` holds, untracked otherwise.
    pub fn for_kind(is_asset: bool) -> Self {
        if is_asset {
            Self::asset()
        } else {
            Self::untracked()
        }
    }

    #[allow(unused_variables)]
    fn with_state(state: OwnershipState) -> Self {
        Self {
            #[cfg(debug_assertions)]
            state: AtomicU8::new(state as u8),
        }
    }

    /// Current state, or `None` when tracking is compiled out.
    pub fn state(&self) -> Option<OwnershipState> {
        #[cfg(debug_assertions)]
        {
            Some(OwnershipState::from_u8(self.state.load(Ordering::Acquire)))
        }
        #[cfg(not(debug_assertions))]
        {
            None
        }
    }

    /// Whether ownership of this resource is tracked at all.
    pub fn is_tracked(&self) -> bool {
        self.state()
            .is_some_and(|state| state != OwnershipState::Untracked)
    }

    /// Record an upload-queue write.
    #[allow(unused_variables)]
    pub fn note_upload_write(&self, what: &str) {
        #[cfg(debug_assertions)]
        self.transition(
            what,
            "upload write",
            &[OwnershipState::Uninitialized, OwnershipState::UploadOwned],
            OwnershipState::UploadOwned,
        );
    }

    /// Record a release on the upload queue.
    #[allow(unused_variables)]
    pub fn note_release(&self, what: &str) {
        #[cfg(debug_assertions)]
        self.transition(
            what,
            "release",
            &[OwnershipState::UploadOwned],
            OwnershipState::InTransfer,
        );
    }

    /// Record an acquire on the graphics queue.
    #[allow(unused_variables)]
    pub fn note_acquire(&self, what: &str) {
        #[cfg(debug_assertions)]
        self.transition(
            what,
            "acquire",
            &[OwnershipState::InTransfer],
            OwnershipState::GraphicsOwned,
        );
    }

    /// Assert the graphics queue may read the resource.
    #[allow(unused_variables)]
    pub fn assert_graphics_readable(&self, what: &str) {
        #[cfg(debug_assertions)]
        {
            let state = OwnershipState::from_u8(self.state.load(Ordering::Acquire));
            debug_assert!(
                matches!(
                    state,
                    OwnershipState::Untracked | OwnershipState::GraphicsOwned
                ),
                "{what} read on the graphics queue while {state:?}; acquire it first"
            );
        }
    }

    #[cfg(debug_assertions)]
    fn transition(
        &self,
        what: &str,
        operation: &str,
        from: &[OwnershipState],
        to: OwnershipState,
    ) {
        let previous = OwnershipState::from_u8(self.state.load(Ordering::Acquire));
        if previous == OwnershipState::Untracked {
            return;
        }
        debug_assert!(
            from.contains(&previous),
            "{operation} of {what} while {previous:?}; expected one of {from:?}"
        );
        self.state.store(to as u8, Ordering::Release);
        tracing::trace!(what, operation, ?previous, ?to, "ownership transition");
    }
}

#[cfg(all(test, debug_assertions))]
mod tests {
    use super::*;

    #[test]
    fn asset_walks_through_protocol() {
        let cell = OwnershipCell::asset();
        assert_eq!(cell.state(), Some(OwnershipState::Uninitialized));
        cell.note_upload_write("buffer");
        cell.note_upload_write("buffer");
        assert_eq!(cell.state(), Some(OwnershipState::UploadOwned));
        cell.note_release("buffer");
        assert_eq!(cell.state(), Some(OwnershipState::InTransfer));
        cell.note_acquire("buffer");
        assert_eq!(cell.state(), Some(OwnershipState::GraphicsOwned));
        cell.assert_graphics_readable("buffer");
    }

    #[test]
    fn untracked_resources_ignore_transitions() {
        let cell = OwnershipCell::untracked();
        cell.note_acquire("scratch");
        cell.assert_graphics_readable("scratch");
        assert!(!cell.is_tracked());
    }

    #[test]
    #[should_panic(expected = "acquire of buffer while UploadOwned")]
    fn acquire_before_release_is_rejected() {
        let cell = OwnershipCell::asset();
        cell.note_upload_write("buffer");
        cell.note_acquire("buffer");
    }

    #[test]
    #[should_panic(expected = "read on the graphics queue while InTransfer")]
    fn read_before_acquire_is_rejected() {
        let cell = OwnershipCell::asset();
        cell.note_upload_write("buffer");
        cell.note_release("buffer");
        cell.assert_graphics_readable("buffer");
    }

    #[test]
    #[should_panic(expected = "release of image while Uninitialized")]
    fn release_without_upload_is_rejected() {
        OwnershipCell::asset().note_release("image");
    }
}
