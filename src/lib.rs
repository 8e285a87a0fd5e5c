//! # sbmoe
//!
//! **Stick-breaking attention and distributed aux-loss plumbing for MoE language models, built on numr.**
//!
//! sbmoe adds a stick-breaking attention kernel to numr's clients and builds a
//! mixture-of-experts decoder around it, with the parallel plumbing needed to
//! train it: vocab-parallel embedding, LM head and cross entropy over a
//! tensor-parallel group, and a 1F1B pipeline whose stages relay the MoE
//! load-balancing loss alongside their activations.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ trainer      pretraining inputs, LM + aux loss, metrics  │
//! ├──────────────────────────────────────────────────────────┤
//! │ model        SbAttention, Block, CausalLm, KvCache        │
//! ├──────────────────────────────┬───────────────────────────┤
//! │ nn           layers, MoE,    │ distributed  DTensor, TP  │
//! │              aux-loss context│              loss, 1F1B   │
//! ├──────────────────────────────┴───────────────────────────┤
//! │ ops          StickBreakingOps + autograd wrappers        │
//! └──────────────────────────────────────────────────────────┘
//!                           numr
//! ```
//!
//! ## Design
//!
//! - **Extension traits**: `StickBreakingOps` is implemented on numr's CPU client
//! - **Per-pass aux context**: MoE losses go into a `ForwardContext` owned by one
//!   forward pass, never a global
//! - **Tagged carried state**: pipeline stages receive `None`, a KV cache or the
//!   upstream aux total, fixed by their position

pub mod distributed;
pub mod error;
pub(crate) mod host;
pub mod model;
pub mod nn;
pub mod ops;
pub mod trainer;

pub use error::{Error, Result};
pub use model::{CausalLm, CausalLmStage, ForwardArgs, KvCache, ModelConfig, PackedSequences, StageLayout};
pub use nn::{AuxLossAccumulator, ForwardContext};
pub use ops::{StickBreakingOps, StickBreakingParams, var_sb_attention, var_sb_attention_varlen};
pub use trainer::{LossOutput, PretrainingConfig, PretrainingModel};

// Re-export numr types that users will commonly need
pub use numr::dtype::DType;
pub use numr::error::{Error as NumrError, Result as NumrResult};
pub use numr::runtime::{Runtime, RuntimeClient};
pub use numr::tensor::Tensor;

#[cfg(test)]
pub(crate) mod test_utils {
    use numr::runtime::cpu::{CpuClient, CpuDevice};

    /// Create a CPU client and device for use in unit tests.
    pub(crate) fn cpu_setup() -> (CpuClient, CpuDevice) {
        let device = CpuDevice::new();
        let client = CpuClient::new(device.clone());
        (client, device)
    }
}
