//! Top-k router with a switch-style load-balancing loss

use crate::error::{Error, Result};
use crate::host::{float_tensor, read_indices};
use crate::nn::init::ParamInit;
use crate::nn::linear::Linear;
use numr::autograd::{Var, var_gather, var_mean, var_mul, var_mul_scalar, var_reshape, var_softmax, var_sum};
use numr::dtype::DType;
use numr::ops::{ActivationOps, IndexingOps, ReduceOps, ScalarOps, SortingOps, TensorOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// Expert count and fan-out of an MoE layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct MoeConfig {
    pub num_experts: usize,
    /// Experts each token is sent to
    pub top_k: usize,
}

impl MoeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 || self.top_k > self.num_experts {
            return Err(Error::ModelError {
                reason: format!(
                    "top_k must be in 1..={}, got {}",
                    self.num_experts, self.top_k
                ),
            });
        }
        Ok(())
    }
}

/// Routing decision for a batch of tokens.
pub struct RouterOutput<R: Runtime> {
    /// Softmax over the selected logits: `[num_tokens, top_k]`
    pub weights: Var<R>,
    /// Selected experts: `[num_tokens, top_k]`
    pub indices: Tensor<R>,
    /// `num_experts * sum_e mean_prob_e * routed_fraction_e`, shape `[1]`
    pub aux_loss: Var<R>,
}

pub struct MoeRouter<R: Runtime> {
    gate: Linear<R>,
    config: MoeConfig,
}

impl<R: Runtime> MoeRouter<R> {
    pub fn new(gate: Linear<R>, config: MoeConfig) -> Result<Self> {
        config.validate()?;
        if gate.out_features() != config.num_experts {
            return Err(Error::ModelError {
                reason: format!(
                    "router gate has {} outputs for {} experts",
                    gate.out_features(),
                    config.num_experts
                ),
            });
        }
        Ok(Self { gate, config })
    }

    pub fn config(&self) -> MoeConfig {
        self.config
    }

    pub fn gate(&self) -> &Linear<R> {
        &self.gate
    }
}

impl<R: Runtime<DType = DType>> MoeRouter<R> {
    pub fn init(init: &mut ParamInit<R>, config: MoeConfig, hidden_size: usize, std: f64) -> Result<Self> {
        let gate = Linear::init(init, hidden_size, config.num_experts, false, std)?;
        Self::new(gate, config)
    }

    /// `x`: `[num_tokens, hidden_size]`
    pub fn route<C>(&self, client: &C, x: &Var<R>) -> Result<RouterOutput<R>>
    where
        C: RuntimeClient<R>
            + TensorOps<R>
            + ScalarOps<R>
            + ReduceOps<R>
            + ActivationOps<R>
            + SortingOps<R>
            + IndexingOps<R>,
        R::Client: TensorOps<R> + ScalarOps<R> + ReduceOps<R> + ActivationOps<R> + IndexingOps<R>,
    {
        let MoeConfig { num_experts, top_k } = self.config;
        let num_tokens = x.shape()[0];

        let logits = self.gate.forward(client, x)?;
        let probs = var_softmax(&logits, -1, client).map_err(Error::Numr)?;

        let (_, indices) = client
            .topk(logits.tensor(), top_k, -1, true, true)
            .map_err(Error::Numr)?;
        let top_logits = var_gather(&logits, 1, &indices, client).map_err(Error::Numr)?;
        let weights = var_softmax(&top_logits, -1, client).map_err(Error::Numr)?;

        // Routed fractions are counts, so they carry no gradient
        let mut counts = vec![0.0f64; num_experts];
        for e in read_indices(&indices, "indices")? {
            if let Some(c) = usize::try_from(e).ok().and_then(|e| counts.get_mut(e)) {
                *c += 1.0;
            }
        }
        let routed = (num_tokens * top_k).max(1) as f64;
        counts.iter_mut().for_each(|c| *c /= routed);
        let fraction = float_tensor::<R>(&counts, &[num_experts], x.tensor().dtype(), x.tensor().device())?;

        let mean_probs = var_mean(&probs, &[0], false, client).map_err(Error::Numr)?;
        let balance = var_mul(&mean_probs, &Var::new(fraction, false), client).map_err(Error::Numr)?;
        let aux_loss = var_sum(&balance, &[0], false, client)
            .and_then(|s| var_mul_scalar(&s, num_experts as f64, client))
            .and_then(|s| var_reshape(&s, &[1]))
            .map_err(Error::Numr)?;

        Ok(RouterOutput {
            weights,
            indices,
            aux_loss,
        })
    }
}
