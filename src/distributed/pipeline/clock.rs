//! Micro-batch ordering for one pipeline stage.
//!
//! [`PipelineClock`] produces the 1F1B sequence of [`PipelineAction`]s a rank
//! executes during a training iteration.

use crate::error::{Error, Result};

/// An action a pipeline stage performs at a given tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineAction {
    /// Forward micro-batch `id` and relay `(activation, aux)` downstream.
    Forward(usize),
    /// Backward micro-batch `id` and relay both gradients upstream.
    Backward(usize),
}

/// Computes the schedule of actions for a single pipeline stage.
#[derive(Debug, Clone, Copy)]
pub struct PipelineClock {
    num_stages: usize,
    num_micro_batches: usize,
    stage_id: usize,
}

impl PipelineClock {
    pub fn new(num_stages: usize, num_micro_batches: usize, stage_id: usize) -> Result<Self> {
        if num_stages == 0 || stage_id >= num_stages {
            return Err(Error::DistributedError {
                reason: format!("stage {stage_id} is outside a {num_stages}-stage pipeline"),
            });
        }
        if num_micro_batches == 0 {
            return Err(Error::DistributedError {
                reason: "num_micro_batches must be > 0".to_string(),
            });
        }
        Ok(Self {
            num_stages,
            num_micro_batches,
            stage_id,
        })
    }

    pub fn num_stages(&self) -> usize {
        self.num_stages
    }

    pub fn num_micro_batches(&self) -> usize {
        self.num_micro_batches
    }

    pub fn stage_id(&self) -> usize {
        self.stage_id
    }

    /// Forwards this stage runs before its first backward.
    pub fn warmup(&self) -> usize {
        (self.num_stages - self.stage_id - 1).min(self.num_micro_batches)
    }

    /// One-forward-one-backward order.
    ///
    /// ```text
    /// Stage 0: F0 F1 F2 F3 B0 B1 B2 B3
    /// Stage 1:    F0 F1 F2 B0 F3 B1 B2 B3
    /// Stage 3:          F0 B0 F1 B1 F2 B2 F3 B3
    /// ```
    ///
    /// Stage `k` runs `num_stages - k - 1` warmup forwards, then alternates
    /// forward and backward, then drains the remaining backwards.
    pub fn schedule_1f1b(&self) -> Vec<PipelineAction> {
        let m = self.num_micro_batches;
        let warmup = self.warmup();
        let mut actions = Vec::with_capacity(2 * m);

        actions.extend((0..warmup).map(PipelineAction::Forward));
        for (fwd, bwd) in (warmup..m).zip(0..) {
            actions.push(PipelineAction::Forward(fwd));
            actions.push(PipelineAction::Backward(bwd));
        }
        actions.extend((m - warmup..m).map(PipelineAction::Backward));

        actions
    }
}
