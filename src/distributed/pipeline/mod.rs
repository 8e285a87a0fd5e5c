//! Pipeline parallelism with an aux-loss side channel.
//!
//! Stages exchange `(activation, aux_total)` pairs per micro-batch. The
//! carried-state slot a stage receives is fixed by its [`StageRole`].

pub mod clock;
pub mod comm;
pub mod relay;
pub mod schedule;
pub mod stage;

pub use clock::{PipelineAction, PipelineClock};
pub use comm::{RelayChannel, recv_relay, relay_tag, send_relay};
pub use relay::{CarriedState, StageOutput, StageRole};
pub use schedule::{LossFn, PipelineOutput, Schedule1F1B};
pub use stage::{AuxRelayStage, RelayContext, SavedMicroBatch};
