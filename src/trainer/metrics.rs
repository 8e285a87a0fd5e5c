//! Aux-loss metrics for pipelined runs
//!
//! Under pipeline parallelism the aux total never reaches the caller as part of
//! a loss dict, so the last stage sums it here between logging steps.

use std::collections::HashMap;

/// Running sum of aux-loss values since the last reset.
#[derive(Debug, Clone, Default)]
pub struct AuxLossTracker {
    total: f64,
    count: usize,
}

impl AuxLossTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one value. Zero totals (dense models) are skipped.
    pub fn record(&mut self, aux_loss: f64) {
        if aux_loss != 0.0 {
            self.total += aux_loss;
            self.count += 1;
        }
    }

    /// Record every per-micro-batch aux total of a pipeline iteration.
    pub fn record_all(&mut self, aux_losses: &[f64]) {
        aux_losses.iter().for_each(|&v| self.record(v));
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// `{"aux_loss": sum}` once anything was recorded, empty otherwise.
    pub fn extra_metrics(&self) -> HashMap<String, f64> {
        let mut metrics = HashMap::new();
        if self.count > 0 {
            metrics.insert("aux_loss".to_string(), self.total);
        }
        metrics
    }

    pub fn reset_extra_metrics(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sums_until_reset() {
        let mut tracker = AuxLossTracker::new();
        assert!(tracker.extra_metrics().is_empty());

        tracker.record_all(&[0.5, 0.0, 0.25]);
        assert_eq!(tracker.count(), 2);
        assert_eq!(tracker.extra_metrics()["aux_loss"], 0.75);

        tracker.reset_extra_metrics();
        assert!(tracker.extra_metrics().is_empty());
        assert_eq!(tracker.count(), 0);
    }
}
