//! Tensor- and pipeline-parallel plumbing.
//!
//! - [`dtensor`]: sharded/replicated views over the TP communicator
//! - [`loss_parallel`]: vocab-parallel cross entropy and the aux-loss combiner
//! - [`tensor_parallel`]: vocab-split embedding and LM head
//! - [`in_process`]: thread-per-rank communicator group for single-process runs
//! - [`pipeline`]: 1F1B schedule relaying `(activation, aux_total)` between stages

pub mod comm_utils;
pub mod dtensor;
pub mod in_process;
pub mod loss_parallel;
pub mod pipeline;
pub mod tensor_parallel;

pub use dtensor::{DTensor, Placement, var_all_gather, var_copy_to_tp_region, var_shard};
pub use in_process::{InProcessCommunicator, run_group};
pub use loss_parallel::{
    IGNORE_INDEX, VocabShard, combine_losses, combine_replicated_losses, vocab_parallel_cross_entropy,
};
pub use pipeline::{
    AuxRelayStage, CarriedState, LossFn, PipelineOutput, Schedule1F1B, StageOutput, StageRole,
};
pub use tensor_parallel::{VocabParallelEmbedding, VocabParallelLmHead, broadcast_tokens};
