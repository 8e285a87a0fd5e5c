//! Vocabulary-parallel layers for the tensor-parallel group
//!
//! Only the two vocabulary-sized layers are split across TP ranks. The
//! embedding table and the LM head each hold `vocab_size / world_size` rows;
//! everything between them is replicated. Token ids enter the group through
//! [`broadcast_tokens`] so every rank embeds the same batch.

use std::sync::Arc;

use crate::distributed::comm_utils::{all_reduce_tensor, broadcast_tensor};
use crate::distributed::dtensor::{DTensor, Placement, var_copy_to_tp_region};
use crate::distributed::loss_parallel::VocabShard;
use crate::error::{Error, Result};
use crate::host::{float_tensor, index_tensor, read_indices};
use crate::nn::Embedding;
use numr::autograd::{Var, var_matmul, var_mul, var_reshape, var_transpose};
use numr::dtype::DType;
use numr::ops::{IndexingOps, TensorOps};
use numr::runtime::{Communicator, ReduceOp, Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// Rows `[shard.start, shard.end())` of a `[vocab, dim]` table.
fn vocab_rows<R: Runtime>(full: &Tensor<R>, shard: VocabShard) -> Result<Tensor<R>> {
    Ok(full
        .narrow(0, shard.start, shard.size)
        .map_err(Error::Numr)?
        .contiguous())
}

fn shard_of<R: Runtime>(full: &Tensor<R>, comm: &dyn Communicator, what: &str) -> Result<VocabShard> {
    let shape = full.shape();
    if shape.len() != 2 {
        return Err(Error::DistributedError {
            reason: format!("{what} expects a 2D [vocab, dim] weight, got shape {shape:?}"),
        });
    }
    VocabShard::for_rank(shape[0], comm.rank(), comm.world_size())
}

/// Token embedding with the vocabulary split across ranks.
///
/// Each rank looks up the ids it owns, zeroes the rest, and the partial
/// embeddings are summed across the group.
pub struct VocabParallelEmbedding<R: Runtime> {
    local: Embedding<R>,
    comm: Arc<dyn Communicator>,
    shard: VocabShard,
}

impl<R: Runtime<DType = DType>> VocabParallelEmbedding<R> {
    /// Take this rank's rows of `full_weight` (`[vocab_size, embed_dim]`).
    pub fn new(full_weight: &Tensor<R>, comm: Arc<dyn Communicator>, trainable: bool) -> Result<Self> {
        let shard = shard_of(full_weight, comm.as_ref(), "VocabParallelEmbedding")?;
        Ok(Self {
            local: Embedding::new(vocab_rows(full_weight, shard)?, trainable),
            comm,
            shard,
        })
    }

    /// `indices`: `[...]` global ids, identical on every rank. Output `[..., embed_dim]`.
    pub fn forward<C>(&self, client: &C, indices: &Tensor<R>) -> Result<Var<R>>
    where
        C: RuntimeClient<R> + IndexingOps<R> + TensorOps<R>,
        R::Client: IndexingOps<R> + TensorOps<R>,
    {
        let weight = self.local.weight();
        let embed_dim = weight.shape()[1];
        let ids = read_indices(indices, "indices")?;

        let mut local_ids = Vec::with_capacity(ids.len());
        let mut mask = Vec::with_capacity(ids.len() * embed_dim);
        for &id in &ids {
            let owned = usize::try_from(id)
                .ok()
                .filter(|&i| i >= self.shard.start && i < self.shard.end());
            local_ids.push(owned.map_or(0, |i| (i - self.shard.start) as i64));
            let keep = if owned.is_some() { 1.0 } else { 0.0 };
            mask.extend(std::iter::repeat_n(keep, embed_dim));
        }

        let device = indices.device();
        let local_ids = index_tensor::<R>(&local_ids, &[ids.len()], device);
        let gathered = self.local.forward(client, &local_ids)?;
        let mask = float_tensor::<R>(&mask, &[ids.len(), embed_dim], weight.tensor().dtype(), device)?;
        let masked = var_mul(&gathered, &Var::new(mask, false), client).map_err(Error::Numr)?;

        if self.comm.world_size() > 1 {
            // Forward sum, identity backward
            all_reduce_tensor(self.comm.as_ref(), masked.tensor(), ReduceOp::Sum)?;
        }

        let mut out_shape = indices.shape().to_vec();
        out_shape.push(embed_dim);
        var_reshape(&masked, &out_shape).map_err(Error::Numr)
    }

    pub fn weight(&self) -> &Var<R> {
        self.local.weight()
    }

    pub fn shard(&self) -> VocabShard {
        self.shard
    }
}

/// Output projection with the vocabulary split across ranks.
///
/// Logits leave the layer as a `Shard(-1)` [`DTensor`]; no communication
/// happens in forward. In backward the hidden-state gradients of all vocab
/// shards are summed across the group.
pub struct VocabParallelLmHead<R: Runtime> {
    weight: Var<R>,
    comm: Arc<dyn Communicator>,
    shard: VocabShard,
}

impl<R: Runtime<DType = DType>> VocabParallelLmHead<R> {
    /// Take this rank's rows of `full_weight` (`[vocab_size, hidden_size]`).
    pub fn new(full_weight: &Tensor<R>, comm: Arc<dyn Communicator>, trainable: bool) -> Result<Self> {
        let shard = shard_of(full_weight, comm.as_ref(), "VocabParallelLmHead")?;
        Ok(Self {
            weight: Var::new(vocab_rows(full_weight, shard)?, trainable),
            comm,
            shard,
        })
    }

    /// Share the embedding's local rows as the output projection.
    pub fn tied(embedding: &VocabParallelEmbedding<R>) -> Self {
        Self {
            weight: embedding.weight().clone(),
            comm: embedding.comm.clone(),
            shard: embedding.shard,
        }
    }

    /// `hidden`: `[tokens, hidden_size]`. Returns `[tokens, vocab / world_size]`
    /// placed `Shard(-1)`.
    pub fn forward<C>(&self, client: &C, hidden: &Var<R>) -> Result<DTensor<R>>
    where
        C: RuntimeClient<R> + TensorOps<R>,
        R::Client: TensorOps<R>,
    {
        let hidden = var_copy_to_tp_region(hidden, self.comm.clone())?;
        let w_t = var_transpose(&self.weight).map_err(Error::Numr)?;
        let logits = var_matmul(&hidden, &w_t, client).map_err(Error::Numr)?;
        DTensor::from_local(logits, Placement::Shard(-1), self.comm.clone())
    }

    pub fn weight(&self) -> &Var<R> {
        &self.weight
    }

    pub fn shard(&self) -> VocabShard {
        self.shard
    }
}

/// Replace `tokens` on every TP rank with rank 0's copy.
pub fn broadcast_tokens<R: Runtime<DType = DType>>(comm: &dyn Communicator, tokens: &Tensor<R>) -> Result<()> {
    if comm.world_size() <= 1 {
        return Ok(());
    }
    tracing::trace!(rank = comm.rank(), shape = ?tokens.shape(), "broadcasting token ids");
    broadcast_tensor(comm, tokens, 0)
}
