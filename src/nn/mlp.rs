//! Feed-forward half of a transformer block
//!
//! [`MlpBlock`] is the closed set of feed-forward variants. Both arms expose
//! the same `compute`, returning the output and, for MoE, the router's
//! load-balancing loss.

use crate::error::{Error, Result};
use crate::nn::activation::Activation;
use crate::nn::init::ParamInit;
use crate::nn::linear::Linear;
use crate::nn::moe::MoeLayer;
use crate::nn::with_prefix;
use numr::autograd::{Var, var_reshape};
use numr::dtype::DType;
use numr::ops::{ActivationOps, IndexingOps, ReduceOps, ScalarOps, SortingOps, TensorOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};

/// Two-layer MLP, optionally gated.
///
/// Non-gated: `down(act(up(x)))`. Gated: `down(act(gate(x)) * up(x))`.
pub struct Mlp<R: Runtime> {
    up: Linear<R>,
    gate: Option<Linear<R>>,
    down: Linear<R>,
    activation: Activation,
}

impl<R: Runtime> Mlp<R> {
    pub fn new(
        up: Linear<R>,
        gate: Option<Linear<R>>,
        down: Linear<R>,
        activation: Activation,
    ) -> Result<Self> {
        if activation.is_glu() != gate.is_some() {
            return Err(Error::ModelError {
                reason: format!(
                    "activation {activation} {} a gate projection",
                    if activation.is_glu() { "requires" } else { "does not take" }
                ),
            });
        }
        Ok(Self {
            up,
            gate,
            down,
            activation,
        })
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn up(&self) -> &Linear<R> {
        &self.up
    }

    pub fn gate(&self) -> Option<&Linear<R>> {
        self.gate.as_ref()
    }

    pub fn down(&self) -> &Linear<R> {
        &self.down
    }

    pub fn named_parameters(&self) -> Vec<(String, &Var<R>)> {
        let mut params: Vec<_> = with_prefix("up", self.up.named_parameters()).collect();
        if let Some(gate) = &self.gate {
            params.extend(with_prefix("gate", gate.named_parameters()));
        }
        params.extend(with_prefix("down", self.down.named_parameters()));
        params
    }
}

impl<R: Runtime<DType = DType>> Mlp<R> {
    /// Projections drawn from `Normal(std)`; the output projection uses
    /// `std / sqrt(2 * num_layers)` as in depth-scaled GPT initializations.
    pub fn init(
        init: &mut ParamInit<R>,
        hidden_size: usize,
        intermediate_size: usize,
        activation: Activation,
        std: f64,
        num_layers: usize,
    ) -> Result<Self> {
        let up = Linear::init(init, hidden_size, intermediate_size, true, std)?;
        let gate = if activation.is_glu() {
            Some(Linear::init(init, hidden_size, intermediate_size, true, std)?)
        } else {
            None
        };
        let down_std = std / ((2 * num_layers.max(1)) as f64).sqrt();
        let down = Linear::init(init, intermediate_size, hidden_size, true, down_std)?;
        Self::new(up, gate, down, activation)
    }

    /// `x`: `[..., hidden_size]`
    pub fn forward<C>(&self, client: &C, x: &Var<R>) -> Result<Var<R>>
    where
        C: RuntimeClient<R> + TensorOps<R> + ScalarOps<R> + ActivationOps<R> + UnaryOps<R>,
        R::Client: TensorOps<R> + ScalarOps<R> + ActivationOps<R> + UnaryOps<R>,
    {
        let up = self.up.forward(client, x)?;
        let hidden = match &self.gate {
            Some(gate) => {
                let gate = gate.forward(client, x)?;
                self.activation.gated(client, &gate, &up)?
            }
            None => self.activation.forward(client, &up)?,
        };
        self.down.forward(client, &hidden)
    }
}

/// Feed-forward variant of one block.
pub enum MlpBlock<R: Runtime> {
    Dense(Mlp<R>),
    Moe(MoeLayer<R>),
}

impl<R: Runtime<DType = DType>> MlpBlock<R> {
    pub fn is_moe(&self) -> bool {
        matches!(self, MlpBlock::Moe(_))
    }

    pub fn named_parameters(&self) -> Vec<(String, &Var<R>)> {
        match self {
            MlpBlock::Dense(mlp) => mlp.named_parameters(),
            MlpBlock::Moe(moe) => moe.named_parameters(),
        }
    }

    /// `x`: `[..., hidden_size]`. Returns the output in the same shape and the
    /// router loss for MoE blocks.
    pub fn compute<C>(&self, client: &C, x: &Var<R>) -> Result<(Var<R>, Option<Var<R>>)>
    where
        C: RuntimeClient<R>
            + TensorOps<R>
            + ScalarOps<R>
            + ReduceOps<R>
            + ActivationOps<R>
            + UnaryOps<R>
            + SortingOps<R>
            + IndexingOps<R>,
        R::Client: TensorOps<R>
            + ScalarOps<R>
            + ReduceOps<R>
            + ActivationOps<R>
            + UnaryOps<R>
            + IndexingOps<R>,
    {
        match self {
            MlpBlock::Dense(mlp) => Ok((mlp.forward(client, x)?, None)),
            MlpBlock::Moe(moe) => {
                let shape = x.shape().to_vec();
                let hidden = shape.last().copied().unwrap_or(0);
                let tokens = x.tensor().numel() / hidden.max(1);
                let flat = var_reshape(x, &[tokens, hidden]).map_err(Error::Numr)?;
                let out = moe.forward(client, &flat)?;
                let output = var_reshape(&out.output, &shape).map_err(Error::Numr)?;
                Ok((output, Some(out.aux_loss)))
            }
        }
    }
}
