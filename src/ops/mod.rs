pub mod autograd_stick_breaking;
pub mod cpu;
pub mod traits;

pub use autograd_stick_breaking::{SbAttentionOutput, var_sb_attention, var_sb_attention_varlen};
pub use traits::{StickBreakingGrads, StickBreakingOps, StickBreakingParams};
