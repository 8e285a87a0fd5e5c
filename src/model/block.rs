//! Pre-norm decoder block
//!
//! `h = x + attn(ln_1(x))`, then `h + mlp(ln_2(h))`. MoE blocks push their
//! router loss into the pass's [`ForwardContext`].

use crate::error::{Error, Result};
use crate::model::attention::SbAttention;
use crate::model::cache::KvCache;
use crate::model::config::ModelConfig;
use crate::model::inputs::PackedSequences;
use crate::model::traits::ModelClient;
use crate::nn::{ForwardContext, Mlp, MlpBlock, MoeLayer, Norm, ParamInit, with_prefix};
use numr::autograd::{Var, var_add};
use numr::dtype::DType;
use numr::runtime::Runtime;

pub struct Block<R: Runtime> {
    ln_1: Norm<R>,
    attn: SbAttention<R>,
    ln_2: Norm<R>,
    mlp: MlpBlock<R>,
    layer_idx: usize,
}

impl<R: Runtime<DType = DType>> Block<R> {
    pub fn init(init: &mut ParamInit<R>, config: &ModelConfig, layer_idx: usize) -> Result<Self> {
        let hidden = config.hidden_size;
        let eps = config.layer_norm_epsilon;
        let std = config.initializer_range;

        let ln_1 = Norm::init(init, config.normalization, hidden, eps)?;
        let attn = SbAttention::init(init, config, layer_idx)?;
        let ln_2 = Norm::init(init, config.normalization, hidden, eps)?;
        let mlp = match config.moe {
            Some(moe) if config.is_moe_layer(layer_idx) => MlpBlock::Moe(MoeLayer::init(
                init,
                moe,
                hidden,
                config.intermediate_size(),
                config.activation,
                std,
                config.num_layers,
            )?),
            _ => MlpBlock::Dense(Mlp::init(
                init,
                hidden,
                config.intermediate_size(),
                config.activation,
                std,
                config.num_layers,
            )?),
        };

        Ok(Self {
            ln_1,
            attn,
            ln_2,
            mlp,
            layer_idx,
        })
    }

    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    pub fn attention(&self) -> &SbAttention<R> {
        &self.attn
    }

    pub fn mlp(&self) -> &MlpBlock<R> {
        &self.mlp
    }

    pub fn named_parameters(&self) -> Vec<(String, &Var<R>)> {
        with_prefix("ln_1", self.ln_1.named_parameters())
            .chain(with_prefix("attn", self.attn.named_parameters()))
            .chain(with_prefix("ln_2", self.ln_2.named_parameters()))
            .chain(with_prefix("mlp", self.mlp.named_parameters()))
            .collect()
    }

    pub fn forward<C>(
        &self,
        client: &C,
        x: &Var<R>,
        packed: Option<&PackedSequences>,
        cache: Option<&mut KvCache<R>>,
        ctx: &mut ForwardContext<R>,
    ) -> Result<Var<R>>
    where
        C: ModelClient<R>,
        R::Client: ModelClient<R>,
    {
        let normed = self.ln_1.forward(client, x)?;
        let attn_out = self.attn.forward(client, &normed, packed, cache)?;
        let h = var_add(x, &attn_out, client).map_err(Error::Numr)?;

        let normed = self.ln_2.forward(client, &h)?;
        let (mlp_out, aux) = self.mlp.compute(client, &normed)?;
        if let Some(aux) = aux {
            ctx.add_aux_loss(client, &aux)?;
        }
        var_add(&h, &mlp_out, client).map_err(Error::Numr)
    }
}
