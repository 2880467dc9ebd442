//! Fences and the work they retire.

use crate::resource::{QueryPoolInner, QuerySlot, StructureInner};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tessera_core::{Error, Result};

/// Results that become host visible once a covering fence is waited on.
pub(crate) enum Retirement {
    QuerySlot {
        pool: Arc<QueryPoolInner>,
        index: u32,
    },
    Structure(Arc<StructureInner>),
}

impl Retirement {
    fn apply(self) {
        match self {
            Self::QuerySlot { pool, index } => {
                let mut slots = pool.slots.lock();
                if let Some(slot) = slots.get_mut(index as usize) {
                    if let QuerySlot::Pending(size) = *slot {
                        *slot = QuerySlot::Available(size);
                    }
                }
            }
            Self::Structure(structure) => structure.retired.store(true, Ordering::Release),
        }
    }
}

#[derive(Default)]
struct FenceState {
    signaled: bool,
    retirements: Vec<Retirement>,
}

/// An emulated fence.
///
/// Submissions execute synchronously, so a fence is signaled as soon as the
/// submission naming it returns. Waiting makes the guarded results visible.
pub struct SoftFence {
    state: Mutex<FenceState>,
}

impl SoftFence {
    pub(crate) fn new(signaled: bool) -> Self {
        Self {
            state: Mutex::new(FenceState {
                signaled,
                retirements: Vec::new(),
            }),
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.state.lock().signaled
    }

    pub(crate) fn signal(&self, retirements: Vec<Retirement>) {
        let mut state = self.state.lock();
        debug_assert!(!state.signaled, "fence submitted while signaled; reset it first");
        state.signaled = true;
        state.retirements.extend(retirements);
    }

    pub(crate) fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.signaled {
            return Err(Error::InvalidState(
                "waited on a fence that no submission will signal".to_string(),
            ));
        }
        for retirement in state.retirements.drain(..) {
            retirement.apply();
        }
        Ok(())
    }

    pub(crate) fn reset(&self) {
        let mut state = self.state.lock();
        debug_assert!(
            state.retirements.is_empty(),
            "fence reset before its work was waited on"
        );
        state.signaled = false;
    }
}

impl fmt::Debug for SoftFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SoftFence")
            .field("signaled", &state.signaled)
            .field("pending_retirements", &state.retirements.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::SoftQueryPool;

    #[test]
    fn waiting_makes_query_results_available() {
        let pool = SoftQueryPool::new(2);
        pool.0.slots.lock()[1] = QuerySlot::Pending(512);
        let fence = SoftFence::new(false);
        fence.signal(vec![Retirement::QuerySlot {
            pool: Arc::clone(&pool.0),
            index: 1,
        }]);
        assert_eq!(pool.0.slots.lock()[1], QuerySlot::Pending(512));
        fence.wait().unwrap();
        assert_eq!(pool.0.slots.lock()[1], QuerySlot::Available(512));
        fence.reset();
        assert!(!fence.is_signaled());
    }

    #[test]
    fn waiting_on_an_unsubmitted_fence_fails() {
        let fence = SoftFence::new(false);
        assert!(fence.wait().is_err());
        let signaled = SoftFence::new(true);
        assert!(signaled.wait().is_ok());
    }
}
