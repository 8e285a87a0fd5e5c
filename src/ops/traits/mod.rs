pub mod stick_breaking;

pub use stick_breaking::{StickBreakingGrads, StickBreakingOps, StickBreakingParams};
