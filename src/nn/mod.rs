//! Neural network building blocks.
//!
//! Layers hold their parameters as [`numr::autograd::Var`]s and run with any
//! client that provides the ops they use. MoE layers hand their router loss
//! back to the caller, which adds it to the pass's [`ForwardContext`].

pub mod activation;
pub mod aux_loss;
pub mod embedding;
pub mod groupnorm;
pub mod init;
pub mod linear;
pub mod mlp;
pub mod moe;
pub mod norm;

pub use activation::Activation;
pub use aux_loss::{AuxLossAccumulator, ForwardContext, scalar_value};
pub use embedding::Embedding;
pub use groupnorm::GroupNorm;
pub use init::{Init, ParamInit};
pub use linear::Linear;
pub use mlp::{Mlp, MlpBlock};
pub use moe::{MoeConfig, MoeLayer, MoeOutput, MoeRouter, RouterOutput};
pub use norm::{Norm, NormKind};

use numr::autograd::Var;
use numr::runtime::Runtime;

/// Prepend `prefix.` to every parameter name.
pub(crate) fn with_prefix<'a, R: Runtime>(
    prefix: &str,
    params: Vec<(String, &'a Var<R>)>,
) -> impl Iterator<Item = (String, &'a Var<R>)> + use<'a, R> {
    let prefix = prefix.to_string();
    params
        .into_iter()
        .map(move |(name, var)| (format!("{prefix}.{name}"), var))
}
