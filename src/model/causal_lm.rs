//! Stick-breaking MoE causal language model, one pipeline stage at a time
//!
//! A [`CausalLm`] holds the blocks of its [`StageLayout`]: the first stage also
//! owns the token (and optional position) embeddings, the last stage the final
//! norm and the vocab-parallel LM head. Every block is initialized from its own
//! seed, so a model split into stages holds exactly the weights of the unsplit
//! model.

use std::sync::Arc;

use crate::distributed::dtensor::{DTensor, Placement};
use crate::distributed::loss_parallel::VocabShard;
use crate::distributed::pipeline::{AuxRelayStage, CarriedState, StageOutput};
use crate::distributed::tensor_parallel::{VocabParallelEmbedding, VocabParallelLmHead, broadcast_tokens};
use crate::error::{Error, Result};
use crate::host::index_tensor;
use crate::model::block::Block;
use crate::model::config::{ModelConfig, PositionEmbedding, StageLayout};
use crate::model::inputs::{PackedSequences, default_position_ids};
use crate::model::traits::ModelClient;
use crate::nn::{Embedding, ForwardContext, Init, Norm, ParamInit, with_prefix};
use numr::autograd::{Var, var_add, var_mul_scalar, var_reshape};
use numr::dtype::DType;
use numr::runtime::{Communicator, Runtime};
use numr::tensor::Tensor;

/// Per-call inputs besides the stage input and the carried state.
#[derive(Debug, Clone, Default)]
pub struct ForwardArgs {
    /// Padding-free layout; the stage input is then `[total_tokens]` ids or
    /// `[total_tokens, hidden]` activations.
    pub packed: Option<PackedSequences>,
    /// Overrides the default positions for learned position embeddings.
    pub position_ids: Option<Vec<i64>>,
    /// Return this rank's vocab shard of the logits instead of gathering them.
    pub output_parallel_lm_logits: bool,
    /// Token ids are already identical across the TP group; skip the broadcast.
    pub tokens_replicated: bool,
}

impl ForwardArgs {
    pub fn packed(packed: PackedSequences) -> Self {
        Self {
            packed: Some(packed),
            ..Self::default()
        }
    }

    pub fn with_position_ids(mut self, position_ids: Vec<i64>) -> Self {
        self.position_ids = Some(position_ids);
        self
    }

    pub fn with_parallel_logits(mut self, parallel: bool) -> Self {
        self.output_parallel_lm_logits = parallel;
        self
    }

    pub fn with_replicated_tokens(mut self, replicated: bool) -> Self {
        self.tokens_replicated = replicated;
        self
    }
}

pub struct CausalLm<R: Runtime> {
    config: ModelConfig,
    layout: StageLayout,
    tp_comm: Arc<dyn Communicator>,
    wte: Option<VocabParallelEmbedding<R>>,
    wpe: Option<Embedding<R>>,
    blocks: Vec<Block<R>>,
    ln_f: Option<Norm<R>>,
    lm_head: Option<VocabParallelLmHead<R>>,
    dtype: DType,
    device: R::Device,
}

impl<R: Runtime<DType = DType>> CausalLm<R> {
    /// Build this stage's share of the model.
    ///
    /// Fails with `IncompatibleConfig` when the layers do not split evenly
    /// over the stages, the vocabulary does not split over the TP group, or
    /// tied embeddings would live on different stages.
    pub fn new(
        config: &ModelConfig,
        layout: StageLayout,
        tp_comm: Arc<dyn Communicator>,
        dtype: DType,
        device: &R::Device,
    ) -> Result<Self> {
        config.validate()?;
        let layers = layout.layer_range(config.num_layers)?;
        VocabShard::for_rank(config.vocab_size, tp_comm.rank(), tp_comm.world_size())?;
        if config.tie_word_embeddings && layout.num_stages() > 1 {
            return Err(Error::incompatible(
                "tie_word_embeddings needs the embedding and LM head on one pipeline stage",
            ));
        }

        let role = layout.role();
        let hidden = config.hidden_size;
        let std = config.initializer_range;
        let seed = config.init_seed;

        let (wte, wpe) = if role.is_first() {
            let mut init = ParamInit::<R>::new(seed, dtype, device);
            let table = init.tensor(&[config.vocab_size, hidden], Init::Normal(std))?;
            let wte = VocabParallelEmbedding::new(&table, tp_comm.clone(), true)?;
            let wpe = match config.position_embedding {
                PositionEmbedding::LearnedAbsolute => {
                    Some(Embedding::init(&mut init, config.max_position_embeddings, hidden, std)?)
                }
                PositionEmbedding::None => None,
            };
            (Some(wte), wpe)
        } else {
            (None, None)
        };

        let blocks = layers
            .clone()
            .map(|layer_idx| {
                let mut init = ParamInit::<R>::new(seed.wrapping_add(layer_idx as u64 + 1), dtype, device);
                Block::init(&mut init, config, layer_idx)
            })
            .collect::<Result<Vec<_>>>()?;

        let (ln_f, lm_head) = if role.is_last() {
            let mut init = ParamInit::<R>::new(seed.wrapping_add(config.num_layers as u64 + 1), dtype, device);
            let ln_f = Norm::init(&mut init, config.normalization, hidden, config.layer_norm_epsilon)?;
            let head = match (&wte, config.tie_word_embeddings) {
                (Some(wte), true) => VocabParallelLmHead::tied(wte),
                _ => {
                    let table = init.tensor(&[config.vocab_size, hidden], Init::Normal(std))?;
                    VocabParallelLmHead::new(&table, tp_comm.clone(), true)?
                }
            };
            (Some(ln_f), Some(head))
        } else {
            (None, None)
        };

        tracing::debug!(
            stage = layout.stage_id(),
            num_stages = layout.num_stages(),
            layers = ?layers,
            tp_rank = tp_comm.rank(),
            tp_size = tp_comm.world_size(),
            "causal LM stage built"
        );

        Ok(Self {
            config: config.clone(),
            layout,
            tp_comm,
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
            dtype,
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn layout(&self) -> StageLayout {
        self.layout
    }

    pub fn tp_comm(&self) -> &Arc<dyn Communicator> {
        &self.tp_comm
    }

    pub fn blocks(&self) -> &[Block<R>] {
        &self.blocks
    }

    pub fn embedding(&self) -> Option<&VocabParallelEmbedding<R>> {
        self.wte.as_ref()
    }

    pub fn lm_head(&self) -> Option<&VocabParallelLmHead<R>> {
        self.lm_head.as_ref()
    }

    /// Trainable parameters of this stage, named by their place in the full
    /// model (`h.{layer}.…` uses the global layer index). Vocab-sized tables
    /// are this rank's shard; a tied LM head is listed once, as `wte.weight`.
    pub fn named_parameters(&self) -> Vec<(String, &Var<R>)> {
        let mut params = Vec::new();
        if let Some(wte) = &self.wte {
            params.push(("wte.weight".to_string(), wte.weight()));
        }
        if let Some(wpe) = &self.wpe {
            params.push(("wpe.weight".to_string(), wpe.weight()));
        }
        for block in &self.blocks {
            params.extend(with_prefix(&format!("h.{}", block.layer_idx()), block.named_parameters()));
        }
        if let Some(ln_f) = &self.ln_f {
            params.extend(with_prefix("ln_f", ln_f.named_parameters()));
        }
        if let Some(head) = &self.lm_head {
            if !self.config.tie_word_embeddings {
                params.push(("lm_head.weight".to_string(), head.weight()));
            }
        }
        params
    }

    /// Run this stage over one batch.
    ///
    /// * First stage: `input` holds token ids, `[batch, seq_len]` or
    ///   `[total_tokens]` with `args.packed`.
    /// * Other stages: `input` is the upstream activation and `carried` the
    ///   upstream aux total.
    ///
    /// The last stage returns logits `[..., vocab]` (or the local vocab shard),
    /// the aux total of every layer up to here and the updated cache.
    pub fn forward<C>(
        &self,
        client: &C,
        input: &Var<R>,
        carried: CarriedState<R>,
        args: &ForwardArgs,
    ) -> Result<StageOutput<R>>
    where
        C: ModelClient<R>,
        R::Client: ModelClient<R>,
    {
        self.layout.role().check_carried(&carried)?;
        let (mut cache, upstream_aux) = carried.into_parts();
        if args.packed.is_some() && cache.is_some() {
            return Err(Error::InvalidArgument {
                arg: "carried",
                reason: "padding-free inputs cannot use a KV cache".to_string(),
            });
        }

        let mut ctx = ForwardContext::with_dtype(&self.device, self.dtype);
        if let Some(aux) = &upstream_aux {
            ctx.add_aux_loss(client, aux)?;
        }

        let past_len = cache.as_ref().map_or(0, |c| c.seq_len());
        let mut hidden = match &self.wte {
            Some(wte) => self.embed(client, wte, input.tensor(), args, past_len)?,
            None => input.clone(),
        };

        let packed = args.packed.as_ref();
        for block in &self.blocks {
            hidden = block.forward(client, &hidden, packed, cache.as_mut(), &mut ctx)?;
        }

        let aux_loss = ctx.finish();
        match (&self.ln_f, &self.lm_head) {
            (Some(ln_f), Some(head)) => {
                let logits = self.logits(client, ln_f, head, &hidden, args.output_parallel_lm_logits)?;
                Ok(StageOutput::Final {
                    logits,
                    aux_loss,
                    cache,
                })
            }
            _ => Ok(StageOutput::Intermediate { hidden, aux_loss }),
        }
    }

    fn embed<C>(
        &self,
        client: &C,
        wte: &VocabParallelEmbedding<R>,
        tokens: &Tensor<R>,
        args: &ForwardArgs,
        past_len: usize,
    ) -> Result<Var<R>>
    where
        C: ModelClient<R>,
        R::Client: ModelClient<R>,
    {
        if !args.tokens_replicated {
            broadcast_tokens(self.tp_comm.as_ref(), tokens)?;
        }
        let tokens = match &args.packed {
            Some(packed) => {
                if tokens.numel() != packed.total_tokens() {
                    return Err(Error::shape(format!(
                        "{} token ids for {} packed positions",
                        tokens.numel(),
                        packed.total_tokens()
                    )));
                }
                tokens.reshape(&[packed.total_tokens()]).map_err(Error::Numr)?
            }
            None if tokens.shape().len() == 2 => tokens.clone(),
            None => {
                return Err(Error::shape(format!(
                    "token ids must be [batch, seq_len], got {:?}",
                    tokens.shape()
                )));
            }
        };

        let hidden = wte.forward(client, &tokens)?;
        let Some(wpe) = &self.wpe else {
            return Ok(hidden);
        };

        let positions = match (&args.position_ids, &args.packed) {
            (Some(ids), _) => ids.clone(),
            (None, Some(packed)) => packed.position_ids(),
            (None, None) => default_position_ids(tokens.shape()[0], tokens.shape()[1], past_len),
        };
        if positions.len() != tokens.numel() {
            return Err(Error::shape(format!(
                "{} position ids for {} tokens",
                positions.len(),
                tokens.numel()
            )));
        }
        let limit = wpe.num_embeddings();
        if let Some(&bad) = positions.iter().find(|&&p| p < 0 || p as usize >= limit) {
            return Err(Error::InvalidArgument {
                arg: "position_ids",
                reason: format!("position {bad} outside max_position_embeddings ({limit})"),
            });
        }
        let positions = index_tensor::<R>(&positions, tokens.shape(), tokens.device());
        let pos = wpe.forward(client, &positions)?;
        var_add(&hidden, &pos, client).map_err(Error::Numr)
    }

    fn logits<C>(
        &self,
        client: &C,
        ln_f: &Norm<R>,
        head: &VocabParallelLmHead<R>,
        hidden: &Var<R>,
        parallel: bool,
    ) -> Result<Var<R>>
    where
        C: ModelClient<R>,
        R::Client: ModelClient<R>,
    {
        let normed = ln_f.forward(client, hidden)?;
        let shape = normed.shape().to_vec();
        let hidden_size = shape[shape.len() - 1];
        let rows = normed.tensor().numel() / hidden_size.max(1);
        let flat = var_reshape(&normed, &[rows, hidden_size]).map_err(Error::Numr)?;

        let mut local = head.forward(client, &flat)?.into_local();
        if let Some(m_width) = self.config.m_width {
            local = var_mul_scalar(&local, 1.0 / m_width, client).map_err(Error::Numr)?;
        }
        let mut out_shape = shape[..shape.len() - 1].to_vec();
        out_shape.push(local.shape()[1]);
        let local = var_reshape(&local, &out_shape).map_err(Error::Numr)?;

        let logits = DTensor::from_local(local, Placement::Shard(-1), self.tp_comm.clone())?;
        if parallel {
            Ok(logits.into_local())
        } else {
            Ok(logits.redistribute(Placement::Replicate)?.into_local())
        }
    }
}

/// A [`CausalLm`] stage bound to its client and per-micro-batch arguments,
/// ready for [`crate::distributed::Schedule1F1B`].
pub struct CausalLmStage<R: Runtime, C> {
    model: CausalLm<R>,
    client: C,
    args: ForwardArgs,
}

impl<R: Runtime, C> CausalLmStage<R, C> {
    pub fn new(model: CausalLm<R>, client: C, args: ForwardArgs) -> Self {
        Self { model, client, args }
    }

    pub fn model(&self) -> &CausalLm<R> {
        &self.model
    }
}

impl<R, C> AuxRelayStage<R> for CausalLmStage<R, C>
where
    R: Runtime<DType = DType>,
    C: ModelClient<R> + Send,
    R::Client: ModelClient<R>,
    CausalLm<R>: Send,
{
    fn forward(&mut self, micro_batch_id: usize, input: Var<R>, carried: CarriedState<R>) -> Result<StageOutput<R>> {
        tracing::trace!(
            stage = self.model.layout.stage_id(),
            micro_batch = micro_batch_id,
            carried = carried.kind(),
            "stage forward"
        );
        self.model.forward(&self.client, &input, carried, &self.args)
    }
}
