//! Generation-time key/value cache
//!
//! One growing pair of `[batch, cached_len, num_kv_heads, head_dim]` tensors
//! per layer. Keys and values are appended along the sequence dimension every
//! call, so the decode path always sees every key written so far.

use crate::error::{Error, Result};
use numr::ops::ShapeOps;
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

struct LayerKv<R: Runtime> {
    k: Tensor<R>,
    v: Tensor<R>,
}

pub struct KvCache<R: Runtime> {
    layers: Vec<Option<LayerKv<R>>>,
}

impl<R: Runtime> KvCache<R> {
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: (0..num_layers).map(|_| None).collect(),
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Tokens cached for `layer`, zero if it has not been written.
    pub fn layer_len(&self, layer: usize) -> usize {
        self.layers
            .get(layer)
            .and_then(Option::as_ref)
            .map_or(0, |kv| kv.k.shape()[1])
    }

    /// Tokens cached for the first layer.
    pub fn seq_len(&self) -> usize {
        self.layer_len(0)
    }

    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(Option::is_none)
    }

    pub fn layer(&self, layer: usize) -> Option<(&Tensor<R>, &Tensor<R>)> {
        self.layers
            .get(layer)
            .and_then(Option::as_ref)
            .map(|kv| (&kv.k, &kv.v))
    }

    pub fn reset(&mut self) {
        self.layers.iter_mut().for_each(|l| *l = None);
    }

    /// Append `k`, `v` (`[batch, new_tokens, num_kv_heads, head_dim]`) to
    /// `layer` and return the full cached pair.
    pub fn update<C>(&mut self, client: &C, layer: usize, k: &Tensor<R>, v: &Tensor<R>) -> Result<(Tensor<R>, Tensor<R>)>
    where
        C: RuntimeClient<R> + ShapeOps<R>,
    {
        let num_layers = self.layers.len();
        let slot = self.layers.get_mut(layer).ok_or_else(|| Error::InvalidArgument {
            arg: "layer",
            reason: format!("cache holds {num_layers} layers, got index {layer}"),
        })?;
        if k.shape().len() != 4 || k.shape() != v.shape() {
            return Err(Error::shape(format!(
                "cache update expects matching 4D k/v, got {:?} and {:?}",
                k.shape(),
                v.shape()
            )));
        }

        let updated = match slot.take() {
            None => LayerKv {
                k: k.contiguous(),
                v: v.contiguous(),
            },
            Some(prev) => {
                let (p, n) = (prev.k.shape(), k.shape());
                if p[0] != n[0] || p[2..] != n[2..] {
                    return Err(Error::shape(format!(
                        "cache for layer {layer} holds {p:?}, cannot append {n:?}"
                    )));
                }
                LayerKv {
                    k: client.cat(&[&prev.k, k], 1).map_err(Error::Numr)?,
                    v: client.cat(&[&prev.v, v], 1).map_err(Error::Numr)?,
                }
            }
        };
        let out = (updated.k.clone(), updated.v.clone());
        *slot = Some(updated);
        Ok(out)
    }
}
