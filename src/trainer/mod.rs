//! Pretraining wrapper: input preparation, loss and aux-loss metrics.

pub mod config;
pub mod metrics;
pub mod pretraining;

pub use config::{LmLossScaling, PretrainingConfig};
pub use metrics::AuxLossTracker;
pub use pretraining::{LmLoss, LossOutput, PretrainingModel, shift_tokens};
