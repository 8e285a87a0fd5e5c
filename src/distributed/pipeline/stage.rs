//! Pipeline stage trait and per-micro-batch saved state.
//!
//! - [`AuxRelayStage`]: autograd-tracked forward over one micro-batch that
//!   receives the carried state and returns a [`StageOutput`].
//! - [`RelayContext`]: what the schedule keeps between a micro-batch's
//!   forward and its backward.

use super::relay::{CarriedState, StageOutput};
use crate::error::Result;
use numr::autograd::Var;
use numr::runtime::Runtime;

/// Training stage with an aux-loss side channel.
///
/// Implementations run their layers with a fresh per-pass context, add the
/// upstream aux total from `carried` into it, and return either the final
/// logits or the activation to relay. Backward is driven by the schedule
/// through the returned graph, so stages keep no per-micro-batch state.
pub trait AuxRelayStage<R: Runtime>: Send {
    fn forward(
        &mut self,
        micro_batch_id: usize,
        input: Var<R>,
        carried: CarriedState<R>,
    ) -> Result<StageOutput<R>>;
}

/// Forward state needed to run one micro-batch backward.
pub struct SavedMicroBatch<R: Runtime> {
    /// Stage input; its gradient is sent upstream.
    pub input: Var<R>,
    /// Upstream aux total as received; its gradient is sent upstream.
    pub aux_in: Option<Var<R>>,
    pub output: StageOutput<R>,
}

/// Per-micro-batch slots between forward and backward.
pub struct RelayContext<R: Runtime> {
    slots: Vec<Option<SavedMicroBatch<R>>>,
}

impl<R: Runtime> RelayContext<R> {
    pub fn new(num_micro_batches: usize) -> Self {
        Self {
            slots: (0..num_micro_batches).map(|_| None).collect(),
        }
    }

    pub fn save(&mut self, micro_batch_id: usize, saved: SavedMicroBatch<R>) {
        if let Some(slot) = self.slots.get_mut(micro_batch_id) {
            *slot = Some(saved);
        }
    }

    /// Take the saved state for backward (removes it from storage).
    pub fn take(&mut self, micro_batch_id: usize) -> Option<SavedMicroBatch<R>> {
        self.slots.get_mut(micro_batch_id).and_then(Option::take)
    }

    /// Micro-batches forwarded but not yet backwarded.
    pub fn num_in_flight(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}
