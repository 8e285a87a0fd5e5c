//! Stick-breaking MoE decoder.
//!
//! - [`config`]: serde model config and the pipeline stage layout
//! - [`attention`]: stick-breaking self-attention with group-normed heads
//! - [`block`]: pre-norm decoder block, dense or MoE feed-forward
//! - [`causal_lm`]: one pipeline stage of the language model
//! - [`cache`]: per-layer KV cache for generation
//! - [`inputs`]: padding-free segment layout

pub mod attention;
pub mod block;
pub mod cache;
pub mod causal_lm;
pub mod config;
pub mod inputs;
pub mod traits;

pub use attention::SbAttention;
pub use block::Block;
pub use cache::KvCache;
pub use causal_lm::{CausalLm, CausalLmStage, ForwardArgs};
pub use config::{ModelConfig, PositionEmbedding, StageLayout};
pub use inputs::{PackedSequences, default_position_ids};
pub use traits::ModelClient;
