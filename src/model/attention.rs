//! Stick-breaking self-attention layer
//!
//! Projections, the stick-breaking kernel (dense, packed or decode), per-head
//! group norm and the output projection. The kernel's remainder only enters
//! the output through the optional head bias.

use crate::error::{Error, Result};
use crate::model::cache::KvCache;
use crate::model::config::ModelConfig;
use crate::model::inputs::PackedSequences;
use crate::model::traits::ModelClient;
use crate::nn::init::{Init, ParamInit};
use crate::nn::{GroupNorm, Linear, with_prefix};
use crate::ops::traits::stick_breaking::kv_group_size;
use crate::ops::{StickBreakingParams, var_sb_attention, var_sb_attention_varlen};
use numr::autograd::{Var, var_reshape};
use numr::dtype::DType;
use numr::runtime::Runtime;

/// Group norm epsilon over merged heads.
const HEAD_NORM_EPS: f32 = 1e-5;

pub struct SbAttention<R: Runtime> {
    q_proj: Linear<R>,
    k_proj: Linear<R>,
    v_proj: Linear<R>,
    c_proj: Linear<R>,
    norm: GroupNorm<R>,
    /// `[num_heads, head_dim]`, present with `sb_remainder`
    head_bias: Option<Var<R>>,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    params: StickBreakingParams,
    layer_idx: usize,
}

impl<R: Runtime<DType = DType>> SbAttention<R> {
    pub fn init(init: &mut ParamInit<R>, config: &ModelConfig, layer_idx: usize) -> Result<Self> {
        let hidden = config.hidden_size;
        let head_dim = config.head_dim();
        let num_kv_heads = config.kv_heads();
        kv_group_size(config.num_heads, num_kv_heads)?;

        let std = config.initializer_range;
        let out_std = std / ((2 * config.num_layers) as f64).sqrt();
        let bias = config.add_bias;
        let head_bias = if config.sb_remainder {
            Some(Var::new(init.tensor(&[config.num_heads, head_dim], Init::Zeros)?, true))
        } else {
            None
        };

        Ok(Self {
            q_proj: Linear::init(init, hidden, config.num_heads * head_dim, bias, std)?,
            k_proj: Linear::init(init, hidden, num_kv_heads * head_dim, bias, std)?,
            v_proj: Linear::init(init, hidden, num_kv_heads * head_dim, bias, std)?,
            c_proj: Linear::init(init, hidden, hidden, bias, out_std)?,
            norm: GroupNorm::init(init, config.num_heads, hidden, HEAD_NORM_EPS)?,
            head_bias,
            num_heads: config.num_heads,
            num_kv_heads,
            head_dim,
            params: StickBreakingParams::for_head_dim(head_dim).with_attend_current(config.attend_current),
            layer_idx,
        })
    }

    pub fn head_bias(&self) -> Option<&Var<R>> {
        self.head_bias.as_ref()
    }

    pub fn params(&self) -> StickBreakingParams {
        self.params
    }

    pub fn named_parameters(&self) -> Vec<(String, &Var<R>)> {
        let mut params: Vec<_> = with_prefix("q_proj", self.q_proj.named_parameters())
            .chain(with_prefix("k_proj", self.k_proj.named_parameters()))
            .chain(with_prefix("v_proj", self.v_proj.named_parameters()))
            .chain(with_prefix("norm", self.norm.named_parameters()))
            .chain(with_prefix("c_proj", self.c_proj.named_parameters()))
            .collect();
        if let Some(bias) = &self.head_bias {
            params.push(("head_bias".to_string(), bias));
        }
        params
    }

    /// `x`: `[batch, seq_len, hidden]`, or `[total_tokens, hidden]` when `packed`.
    ///
    /// With a cache the new keys are appended first; a single query token
    /// against a longer cache takes the decode path.
    pub fn forward<C>(
        &self,
        client: &C,
        x: &Var<R>,
        packed: Option<&PackedSequences>,
        cache: Option<&mut KvCache<R>>,
    ) -> Result<Var<R>>
    where
        C: ModelClient<R>,
        R::Client: ModelClient<R>,
    {
        let shape = x.shape().to_vec();
        let hidden = self.num_heads * self.head_dim;
        let tokens: Vec<usize> = shape[..shape.len() - 1].to_vec();

        let heads_shape = |n: usize| {
            let mut s = tokens.clone();
            s.extend([n, self.head_dim]);
            s
        };
        let q = self.q_proj.forward(client, x)?;
        let k = self.k_proj.forward(client, x)?;
        let v = self.v_proj.forward(client, x)?;
        let q = var_reshape(&q, &heads_shape(self.num_heads)).map_err(Error::Numr)?;
        let k = var_reshape(&k, &heads_shape(self.num_kv_heads)).map_err(Error::Numr)?;
        let v = var_reshape(&v, &heads_shape(self.num_kv_heads)).map_err(Error::Numr)?;
        let head_bias = self.head_bias.as_ref();

        let out = match (packed, cache) {
            (Some(packed), None) => {
                if tokens.len() != 1 {
                    return Err(Error::shape(format!(
                        "packed attention expects [total_tokens, hidden], got {shape:?}"
                    )));
                }
                let cu_seqlens = packed.to_tensor::<R>(x.tensor().device());
                var_sb_attention_varlen(&q, &k, &v, head_bias, &cu_seqlens, packed.max_seqlen(), self.params)?
                    .output
            }
            (Some(_), Some(_)) => {
                return Err(Error::InvalidArgument {
                    arg: "cache",
                    reason: "padding-free inputs cannot use a KV cache".to_string(),
                });
            }
            (None, Some(cache)) => {
                let (k_all, v_all) = cache.update(client, self.layer_idx, k.tensor(), v.tensor())?;
                let q_len = shape[1];
                if k_all.shape()[1] == q_len {
                    var_sb_attention(&q, &k, &v, head_bias, self.params)?.output
                } else {
                    let (out, _rem) = client.sb_attention_decode(
                        q.tensor(),
                        &k_all,
                        &v_all,
                        head_bias.map(|b| b.tensor()),
                        self.params,
                    )?;
                    Var::new(out, false)
                }
            }
            (None, None) => var_sb_attention(&q, &k, &v, head_bias, self.params)?.output,
        };

        let mut merged = tokens;
        merged.push(hidden);
        let out = var_reshape(&out, &merged).map_err(Error::Numr)?;
        let out = self.norm.forward(client, &out)?;
        self.c_proj.forward(client, &out)
    }
}
