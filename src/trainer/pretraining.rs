//! Next-token pretraining on top of [`CausalLm`]
//!
//! Batches arrive as `[batch, seq_len + 1]` token blocks. The first `seq_len`
//! tokens of each row are the input and the last `seq_len` the labels. Without
//! pipelining [`PretrainingModel::forward`] returns the loss directly; with it
//! [`PretrainingModel::into_pipeline`] hands back a schedule stage and the
//! [`LmLoss`] the last stage runs.

use std::sync::Arc;

use crate::distributed::dtensor::{DTensor, Placement};
use crate::distributed::loss_parallel::{IGNORE_INDEX, combine_replicated_losses, vocab_parallel_cross_entropy};
use crate::distributed::pipeline::{CarriedState, StageOutput};
use crate::distributed::tensor_parallel::broadcast_tokens;
use crate::error::{Error, Result};
use crate::host::read_indices;
use crate::model::{CausalLm, CausalLmStage, ForwardArgs, ModelClient, PackedSequences, default_position_ids};
use crate::nn::scalar_value;
use crate::trainer::config::{LmLossScaling, PretrainingConfig};
use numr::autograd::{Var, var_mul_scalar};
use numr::dtype::DType;
use numr::ops::{ScalarOps, TensorOps};
use numr::runtime::{Communicator, Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// Loss of one batch.
///
/// `lm_loss` and `aux_loss` are only reported when the aux total is non-zero;
/// a dense model yields `loss` alone.
pub struct LossOutput<R: Runtime> {
    pub loss: Var<R>,
    pub lm_loss: Option<Var<R>>,
    pub aux_loss: Option<Var<R>>,
}

/// `[batch, seq_len + 1]` tokens into `[batch, seq_len]` inputs and labels.
pub fn shift_tokens<R: Runtime>(tokens: &Tensor<R>) -> Result<(Tensor<R>, Tensor<R>)> {
    let shape = tokens.shape();
    if shape.len() != 2 || shape[1] < 2 {
        return Err(Error::shape(format!(
            "pretraining tokens must be [batch, seq_len + 1] with seq_len >= 1, got {shape:?}"
        )));
    }
    let seq_len = shape[1] - 1;
    let input_ids = tokens.narrow(1, 0, seq_len).map_err(Error::Numr)?.contiguous();
    let labels = tokens.narrow(1, 1, seq_len).map_err(Error::Numr)?.contiguous();
    Ok((input_ids, labels))
}

/// Vocab-parallel LM loss plus the weighted aux total.
#[derive(Clone)]
pub struct LmLoss {
    multiplier: f64,
    scaling: LmLossScaling,
    coefficient: f64,
    tp_comm: Arc<dyn Communicator>,
}

impl LmLoss {
    pub fn new(multiplier: f64, scaling: LmLossScaling, coefficient: f64, tp_comm: Arc<dyn Communicator>) -> Self {
        Self {
            multiplier,
            scaling,
            coefficient,
            tp_comm,
        }
    }

    pub fn coefficient(&self) -> f64 {
        self.coefficient
    }

    /// `logits`: this rank's `[..., vocab / tp]` shard; `labels`: replicated ids
    /// in the same row order.
    pub fn compute<R, C>(&self, client: &C, logits: &Var<R>, aux_loss: &Var<R>, labels: &Tensor<R>) -> Result<LossOutput<R>>
    where
        R: Runtime<DType = DType>,
        C: RuntimeClient<R> + TensorOps<R> + ScalarOps<R>,
        R::Client: TensorOps<R> + ScalarOps<R>,
    {
        let lm_loss = vocab_parallel_cross_entropy(logits, labels, self.tp_comm.as_ref())?;
        let factor = match self.scaling {
            LmLossScaling::Sum => self.multiplier,
            LmLossScaling::TokenMean => {
                let tokens = read_indices(labels, "labels")?
                    .iter()
                    .filter(|&&l| l != IGNORE_INDEX)
                    .count();
                self.multiplier / tokens.max(1) as f64
            }
        };
        let lm_loss = if factor == 1.0 {
            lm_loss
        } else {
            var_mul_scalar(&lm_loss, factor, client).map_err(Error::Numr)?
        };

        if scalar_value(aux_loss)? == 0.0 {
            return Ok(LossOutput {
                loss: lm_loss,
                lm_loss: None,
                aux_loss: None,
            });
        }
        // Both losses are identical on every TP rank
        let replicated = |loss: &Var<R>| DTensor::from_local(loss.clone(), Placement::Replicate, self.tp_comm.clone());
        let loss = combine_replicated_losses(&replicated(&lm_loss)?, &replicated(aux_loss)?, self.coefficient)?
            .into_local();
        tracing::trace!(
            loss = scalar_value(&loss)?,
            coefficient = self.coefficient,
            "combined LM and aux loss"
        );
        Ok(LossOutput {
            loss,
            lm_loss: Some(lm_loss),
            aux_loss: Some(aux_loss.clone()),
        })
    }

    /// Loss function for [`crate::distributed::Schedule1F1B::run`] on the
    /// last stage; `labels[i]` belongs to micro-batch `i`.
    pub fn pipeline_loss_fn<'a, R, C>(
        &'a self,
        client: &'a C,
        labels: &'a [Tensor<R>],
    ) -> impl Fn(usize, &Var<R>, &Var<R>) -> Result<Var<R>> + 'a
    where
        R: Runtime<DType = DType>,
        C: RuntimeClient<R> + TensorOps<R> + ScalarOps<R>,
        R::Client: TensorOps<R> + ScalarOps<R>,
    {
        move |mb_id, logits, aux_loss| {
            let labels = labels.get(mb_id).ok_or_else(|| Error::InvalidArgument {
                arg: "labels",
                reason: format!("no labels for micro-batch {mb_id} ({} given)", labels.len()),
            })?;
            Ok(self.compute(client, logits, aux_loss, labels)?.loss)
        }
    }
}

/// [`CausalLm`] with the pretraining input pipeline and loss.
pub struct PretrainingModel<R: Runtime> {
    model: CausalLm<R>,
    config: PretrainingConfig,
    loss: LmLoss,
}

impl<R: Runtime<DType = DType>> PretrainingModel<R> {
    pub fn new(model: CausalLm<R>, config: PretrainingConfig) -> Result<Self> {
        config.validate(model.config(), model.layout().num_stages())?;
        let loss = LmLoss::new(
            config.lm_loss_multiplier,
            config.loss_scaling,
            model.config().router_aux_loss_coef,
            model.tp_comm().clone(),
        );
        Ok(Self { model, config, loss })
    }

    pub fn model(&self) -> &CausalLm<R> {
        &self.model
    }

    pub fn config(&self) -> &PretrainingConfig {
        &self.config
    }

    pub fn loss(&self) -> &LmLoss {
        &self.loss
    }

    /// Model inputs for `[batch, seq_len]` ids: the (possibly flattened) ids
    /// and the forward arguments.
    pub fn prepare_inputs(&self, input_ids: &Tensor<R>) -> Result<(Tensor<R>, ForwardArgs)> {
        let shape = input_ids.shape();
        if shape.len() != 2 {
            return Err(Error::shape(format!("input ids must be [batch, seq_len], got {shape:?}")));
        }
        let (batch, seq_len) = (shape[0], shape[1]);
        let args = ForwardArgs::default().with_parallel_logits(true);
        if !self.config.padding_free {
            return Ok((input_ids.clone(), args));
        }

        let packed = if self.config.reset_attention_mask {
            let eos = self.config.eos_token_id.ok_or_else(|| {
                Error::incompatible("reset_attention_mask needs eos_token_id")
            })?;
            let ids = read_indices(input_ids, "input_ids")?;
            PackedSequences::split_at_eos(&ids, batch, seq_len, eos)?
        } else {
            PackedSequences::uniform(batch, seq_len)?
        };
        let positions = if self.config.reset_position_ids {
            packed.position_ids()
        } else {
            default_position_ids(batch, seq_len, 0)
        };
        tracing::trace!(
            segments = packed.num_segments(),
            max_seqlen = packed.max_seqlen(),
            "packed pretraining batch"
        );

        let flat = input_ids.reshape(&[batch * seq_len]).map_err(Error::Numr)?;
        Ok((flat, ForwardArgs { packed: Some(packed), position_ids: Some(positions), ..args }))
    }

    /// Loss of one `[batch, seq_len + 1]` token block on an unpipelined model.
    pub fn forward<C>(&self, client: &C, tokens: &Tensor<R>) -> Result<LossOutput<R>>
    where
        C: ModelClient<R>,
        R::Client: ModelClient<R>,
    {
        if self.model.layout().num_stages() > 1 {
            return Err(Error::DistributedError {
                reason: "pipelined models train through into_pipeline".to_string(),
            });
        }
        // One broadcast covers both the inputs and the labels
        broadcast_tokens(self.model.tp_comm().as_ref(), tokens)?;
        let (input_ids, labels) = shift_tokens(tokens)?;
        let (input_ids, args) = self.prepare_inputs(&input_ids)?;
        let args = args.with_replicated_tokens(true);

        match self.model.forward(client, &Var::new(input_ids, false), CarriedState::None, &args)? {
            StageOutput::Final { logits, aux_loss, .. } => self.loss.compute(client, &logits, &aux_loss, &labels),
            StageOutput::Intermediate { .. } => Err(Error::DistributedError {
                reason: "single-stage model returned an intermediate activation".to_string(),
            }),
        }
    }

    /// Stage for [`crate::distributed::Schedule1F1B`] over micro-batches of
    /// `[micro_batch_size, sequence_length]` inputs, plus the loss used on the
    /// last stage.
    pub fn into_pipeline<C>(
        self,
        client: C,
        micro_batch_size: usize,
        sequence_length: usize,
    ) -> Result<(CausalLmStage<R, C>, LmLoss)> {
        let mut args = ForwardArgs::default().with_parallel_logits(true);
        if self.config.padding_free {
            args.packed = Some(PackedSequences::uniform(micro_batch_size, sequence_length)?);
            args.position_ids = Some(default_position_ids(micro_batch_size, sequence_length, 0));
        }
        tracing::debug!(
            stage = self.model.layout().stage_id(),
            micro_batch_size,
            sequence_length,
            padding_free = self.config.padding_free,
            "pretraining pipeline stage"
        );
        Ok((CausalLmStage::new(self.model, client, args), self.loss))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelConfig, StageLayout};
    use crate::test_utils::cpu_setup;
    use numr::runtime::NoOpCommunicator;
    use numr::runtime::cpu::{CpuDevice, CpuRuntime};

    fn model_config(moe: bool) -> ModelConfig {
        let mut cfg: ModelConfig = serde_yaml::from_str(
            r#"
vocab_size: 12
hidden_size: 8
num_layers: 2
num_heads: 2
intermediate_size: 16
initializer_range: 0.2
router_aux_loss_coef: 0.5
moe:
  num_experts: 2
  top_k: 1
"#,
        )
        .unwrap();
        if !moe {
            cfg.moe = None;
        }
        cfg
    }

    fn pretraining(cfg: &ModelConfig, options: PretrainingConfig, device: &CpuDevice) -> PretrainingModel<CpuRuntime> {
        let lm = CausalLm::new(cfg, StageLayout::single(), Arc::new(NoOpCommunicator), DType::F32, device).unwrap();
        PretrainingModel::new(lm, options).unwrap()
    }

    #[test]
    fn test_shift_tokens() {
        let (_client, device) = cpu_setup();
        let tokens = Tensor::<CpuRuntime>::from_slice(&[1i64, 2, 3, 4, 5, 6], &[2, 3], &device);
        let (input, labels) = shift_tokens(&tokens).unwrap();
        assert_eq!(input.to_vec::<i64>(), vec![1, 2, 4, 5]);
        assert_eq!(labels.to_vec::<i64>(), vec![2, 3, 5, 6]);

        let short = Tensor::<CpuRuntime>::from_slice(&[1i64, 2], &[2, 1], &device);
        assert!(shift_tokens(&short).is_err());
    }

    #[test]
    fn test_dense_model_reports_loss_only() {
        let (client, device) = cpu_setup();
        let model = pretraining(&model_config(false), PretrainingConfig::default(), &device);
        let tokens = Tensor::<CpuRuntime>::from_slice(&[1i64, 2, 3, 4, 5, 6, 7, 8], &[2, 4], &device);
        let out = model.forward(&client, &tokens).unwrap();
        assert!(out.lm_loss.is_none() && out.aux_loss.is_none());
        assert!(scalar_value(&out.loss).unwrap() > 0.0);
    }

    #[test]
    fn test_moe_loss_combines_aux() {
        let (client, device) = cpu_setup();
        let model = pretraining(&model_config(true), PretrainingConfig::default(), &device);
        let tokens = Tensor::<CpuRuntime>::from_slice(&[1i64, 2, 3, 4, 5, 6, 7, 8], &[2, 4], &device);
        let out = model.forward(&client, &tokens).unwrap();

        let lm = scalar_value(out.lm_loss.as_ref().unwrap()).unwrap();
        let aux = scalar_value(out.aux_loss.as_ref().unwrap()).unwrap();
        let total = scalar_value(&out.loss).unwrap();
        assert!((total - (lm + 0.5 * aux)).abs() < 1e-5);
    }

    #[test]
    fn test_token_mean_divides_by_label_count() {
        let (client, device) = cpu_setup();
        let cfg = model_config(false);
        let tokens = Tensor::<CpuRuntime>::from_slice(&[1i64, 2, 3, 4, 5, 6, 7, 8], &[2, 4], &device);

        let sum = pretraining(&cfg, PretrainingConfig::default().with_lm_loss_multiplier(2.0), &device);
        let mean = pretraining(
            &cfg,
            PretrainingConfig::default()
                .with_lm_loss_multiplier(2.0)
                .with_loss_scaling(LmLossScaling::TokenMean),
            &device,
        );
        let s = scalar_value(&sum.forward(&client, &tokens).unwrap().loss).unwrap();
        let m = scalar_value(&mean.forward(&client, &tokens).unwrap().loss).unwrap();
        assert!((s / 6.0 - m).abs() < 1e-5);
    }

    #[test]
    fn test_padding_free_matches_padded() {
        let (client, device) = cpu_setup();
        let cfg = model_config(true);
        let tokens = Tensor::<CpuRuntime>::from_slice(&[3i64, 1, 4, 1, 5, 9, 2, 6], &[2, 4], &device);

        let padded = pretraining(&cfg, PretrainingConfig::default(), &device);
        let packed = pretraining(&cfg, PretrainingConfig::default().with_padding_free(true), &device);
        let a = scalar_value(&padded.forward(&client, &tokens).unwrap().loss).unwrap();
        let b = scalar_value(&packed.forward(&client, &tokens).unwrap().loss).unwrap();
        assert!((a - b).abs() < 1e-4);
    }

    #[test]
    fn test_reset_builds_segments_at_eos() {
        let (_client, device) = cpu_setup();
        let options = PretrainingConfig::default()
            .with_padding_free(true)
            .with_reset_attention_mask(true)
            .with_reset_position_ids(true)
            .with_eos_token_id(0);
        let model = pretraining(&model_config(false), options, &device);
        let ids = Tensor::<CpuRuntime>::from_slice(&[5i64, 0, 6, 7, 0, 8], &[2, 3], &device);

        let (flat, args) = model.prepare_inputs(&ids).unwrap();
        assert_eq!(flat.shape(), &[6]);
        let packed = args.packed.unwrap();
        assert_eq!(packed.cu_seqlens(), &[0, 2, 3, 5, 6]);
        assert_eq!(args.position_ids.unwrap(), vec![0, 1, 0, 0, 1, 0]);
        assert!(args.output_parallel_lm_logits);
    }

    #[test]
    fn test_pipeline_loss_fn_picks_labels_by_micro_batch() {
        let (client, device) = cpu_setup();
        let loss = LmLoss::new(1.0, LmLossScaling::Sum, 0.0, Arc::new(NoOpCommunicator));
        let logits = Var::new(Tensor::<CpuRuntime>::from_slice(&[0.0f32, 0.0], &[1, 2], &device), false);
        let aux = Var::new(Tensor::<CpuRuntime>::zeros(&[1], DType::F32, &device), false);
        let labels = vec![Tensor::<CpuRuntime>::from_slice(&[1i64], &[1], &device)];

        let f = loss.pipeline_loss_fn(&client, &labels);
        let l = scalar_value(&f(0, &logits, &aux).unwrap()).unwrap();
        assert!((l - 2f64.ln()).abs() < 1e-6);
        assert!(f(1, &logits, &aux).is_err());
    }
}
