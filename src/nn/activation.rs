//! Activation selector for configurable MLPs

use crate::error::{Error, Result};
use numr::autograd::{Var, var_mul, var_sigmoid, var_silu, var_softplus};
use numr::dtype::DType;
use numr::ops::{ActivationOps, ScalarOps, TensorOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};

/// Activation function of an MLP.
///
/// `swiglu` is the gated variant: the up projection is doubled and the
/// result is `silu(gate) * up`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Silu,
    Sigmoid,
    Softplus,
    Swiglu,
}

impl Activation {
    /// Whether the MLP needs a separate gate projection.
    pub fn is_glu(self) -> bool {
        matches!(self, Activation::Swiglu)
    }

    /// Elementwise part of the activation. For GLU variants this is the gate
    /// nonlinearity; combine with the up branch through [`Activation::gated`].
    pub fn forward<R, C>(self, client: &C, x: &Var<R>) -> Result<Var<R>>
    where
        R: Runtime<DType = DType>,
        C: RuntimeClient<R> + TensorOps<R> + ScalarOps<R> + ActivationOps<R> + UnaryOps<R>,
        R::Client: TensorOps<R> + ScalarOps<R> + ActivationOps<R> + UnaryOps<R>,
    {
        match self {
            Activation::Silu | Activation::Swiglu => var_silu(x, client),
            Activation::Sigmoid => var_sigmoid(x, client),
            Activation::Softplus => var_softplus(x, client),
        }
        .map_err(Error::Numr)
    }

    /// `act(gate) * up`
    pub fn gated<R, C>(self, client: &C, gate: &Var<R>, up: &Var<R>) -> Result<Var<R>>
    where
        R: Runtime<DType = DType>,
        C: RuntimeClient<R> + TensorOps<R> + ScalarOps<R> + ActivationOps<R> + UnaryOps<R>,
        R::Client: TensorOps<R> + ScalarOps<R> + ActivationOps<R> + UnaryOps<R>,
    {
        let gate = self.forward(client, gate)?;
        var_mul(&gate, up, client).map_err(Error::Numr)
    }
}

impl std::fmt::Display for Activation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Activation::Silu => "silu",
            Activation::Sigmoid => "sigmoid",
            Activation::Softplus => "softplus",
            Activation::Swiglu => "swiglu",
        };
        f.write_str(name)
    }
}
