//! Autograd integration for stick-breaking attention
//!
//! Wraps `StickBreakingOps` (Tensor-level) into Var-level operations. The
//! backward pass recomputes the weights from the saved q/k instead of storing
//! the `[heads, T, T]` weight matrix.

use crate::error::Result;
use crate::ops::traits::{StickBreakingOps, StickBreakingParams};
use numr::autograd::{GradFn, TensorId, Var};
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use std::sync::Arc;

/// Output of a stick-breaking call with autograd tracking.
pub struct SbAttentionOutput<R: Runtime> {
    /// Attention output, same layout as `q`
    pub output: Var<R>,
    /// Unclaimed mass per query and head (detached)
    pub remainder: Tensor<R>,
}

enum SequenceLayout<R: Runtime> {
    Dense,
    Packed {
        cu_seqlens: Tensor<R>,
        max_seqlen: usize,
    },
}

/// Backward function for stick-breaking attention.
///
/// Saved state: q, k, v and, when present, head_bias.
struct StickBreakingBackward<R: Runtime> {
    input_ids: Vec<TensorId>,
    saved_tensors: Vec<Tensor<R>>,
    input_grad_fns: Vec<Option<Arc<dyn GradFn<R>>>>,
    layout: SequenceLayout<R>,
    params: StickBreakingParams,
}

impl<R: Runtime> GradFn<R> for StickBreakingBackward<R>
where
    R::Client: StickBreakingOps<R>,
{
    fn backward(&self, grad_output: &Tensor<R>) -> numr::error::Result<Vec<Option<Tensor<R>>>> {
        let client = R::default_client(grad_output.device());
        let q = &self.saved_tensors[0];
        let k = &self.saved_tensors[1];
        let v = &self.saved_tensors[2];
        let head_bias = self.saved_tensors.get(3);

        let grads = match &self.layout {
            SequenceLayout::Dense => {
                client.sb_attention_bwd(grad_output, q, k, v, head_bias, self.params)
            }
            SequenceLayout::Packed {
                cu_seqlens,
                max_seqlen,
            } => client.sb_attention_varlen_bwd(
                grad_output,
                q,
                k,
                v,
                head_bias,
                cu_seqlens,
                *max_seqlen,
                self.params,
            ),
        }
        .map_err(|e| numr::error::Error::Internal(format!("sb_attention backward failed: {e}")))?;

        let mut out = vec![Some(grads.dq), Some(grads.dk), Some(grads.dv)];
        if head_bias.is_some() {
            out.push(grads.dhead_bias);
        }
        Ok(out)
    }

    fn backward_var(&self, grad_output: &Var<R>) -> numr::error::Result<Vec<Option<Var<R>>>> {
        // First-order only
        let grads = self.backward(grad_output.tensor())?;
        Ok(grads
            .into_iter()
            .map(|g| g.map(|t| Var::new(t, false)))
            .collect())
    }

    fn inputs(&self) -> &[TensorId] {
        &self.input_ids
    }

    fn input_grad_fns(&self) -> Vec<Option<Arc<dyn GradFn<R>>>> {
        self.input_grad_fns.clone()
    }

    fn saved_tensors(&self) -> &[Tensor<R>] {
        &self.saved_tensors
    }

    fn name(&self) -> &'static str {
        "StickBreakingBackward"
    }
}

fn track<R>(
    output: Tensor<R>,
    q: &Var<R>,
    k: &Var<R>,
    v: &Var<R>,
    head_bias: Option<&Var<R>>,
    layout: SequenceLayout<R>,
    params: StickBreakingParams,
) -> Var<R>
where
    R: Runtime,
    R::Client: StickBreakingOps<R>,
{
    let mut inputs = vec![q, k, v];
    inputs.extend(head_bias);
    if !inputs.iter().any(|x| x.requires_grad()) {
        return Var::new(output, false);
    }

    let grad_fn = StickBreakingBackward {
        input_ids: inputs.iter().map(|x| x.id()).collect(),
        saved_tensors: inputs.iter().map(|x| x.tensor().clone()).collect(),
        input_grad_fns: inputs.iter().map(|x| x.grad_fn().cloned()).collect(),
        layout,
        params,
    };
    Var::from_op(output, Arc::new(grad_fn))
}

/// Full-sequence stick-breaking attention with autograd tracking.
///
/// `q`: `[batch, seq_len, num_heads, head_dim]`, `k`/`v` with `num_kv_heads`.
pub fn var_sb_attention<R>(
    q: &Var<R>,
    k: &Var<R>,
    v: &Var<R>,
    head_bias: Option<&Var<R>>,
    params: StickBreakingParams,
) -> Result<SbAttentionOutput<R>>
where
    R: Runtime,
    R::Client: StickBreakingOps<R>,
{
    let client = R::default_client(q.tensor().device());
    let (output, remainder) = client.sb_attention_fwd(
        q.tensor(),
        k.tensor(),
        v.tensor(),
        head_bias.map(|b| b.tensor()),
        params,
    )?;
    let output = track(output, q, k, v, head_bias, SequenceLayout::Dense, params);
    Ok(SbAttentionOutput { output, remainder })
}

/// Packed stick-breaking attention with autograd tracking.
///
/// `q`: `[total_tokens, num_heads, head_dim]`; segments given by `cu_seqlens`.
#[allow(clippy::too_many_arguments)]
pub fn var_sb_attention_varlen<R>(
    q: &Var<R>,
    k: &Var<R>,
    v: &Var<R>,
    head_bias: Option<&Var<R>>,
    cu_seqlens: &Tensor<R>,
    max_seqlen: usize,
    params: StickBreakingParams,
) -> Result<SbAttentionOutput<R>>
where
    R: Runtime,
    R::Client: StickBreakingOps<R>,
{
    let client = R::default_client(q.tensor().device());
    let (output, remainder) = client.sb_attention_varlen_fwd(
        q.tensor(),
        k.tensor(),
        v.tensor(),
        head_bias.map(|b| b.tensor()),
        cu_seqlens,
        max_seqlen,
        params,
    )?;
    let layout = SequenceLayout::Packed {
        cu_seqlens: cu_seqlens.clone(),
        max_seqlen,
    };
    let output = track(output, q, k, v, head_bias, layout, params);
    Ok(SbAttentionOutput { output, remainder })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::autograd::backward;
    use numr::runtime::cpu::CpuRuntime;

    fn var(data: &[f32], shape: &[usize], device: &numr::runtime::cpu::CpuDevice) -> Var<CpuRuntime> {
        Var::new(Tensor::<CpuRuntime>::from_slice(data, shape, device), true)
    }

    #[test]
    fn test_var_sb_attention_grads_reach_all_inputs() {
        let (client, device) = cpu_setup();
        let q = var(&[0.3, -0.1, 0.2, 0.5, -0.4, 0.1, 0.0, 0.2], &[1, 4, 1, 2], &device);
        let k = var(&[0.1, 0.4, -0.3, 0.2, 0.5, 0.5, -0.2, 0.1], &[1, 4, 1, 2], &device);
        let v = var(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], &[1, 4, 1, 2], &device);
        let bias = var(&[0.5, -0.5], &[1, 2], &device);

        let out = var_sb_attention(&q, &k, &v, Some(&bias), StickBreakingParams::for_head_dim(2))
            .unwrap();
        assert_eq!(out.output.shape(), &[1, 4, 1, 2]);
        assert_eq!(out.remainder.shape(), &[1, 4, 1]);

        let loss = numr::autograd::var_sum(&out.output, &[0, 1, 2, 3], false, &client).unwrap();
        let grads = backward(&loss, &client).unwrap();
        for x in [&q, &k, &v] {
            let g = grads.get(x.id()).expect("missing grad");
            assert_eq!(g.shape(), x.shape());
        }
        let gb = grads.get(bias.id()).expect("missing bias grad");
        // d(sum O)/d bias[d] = sum_i R_i
        let rem_total: f32 = out.remainder.to_vec::<f32>().iter().sum();
        for x in gb.to_vec::<f32>() {
            assert!((x - rem_total).abs() < 1e-5);
        }
    }

    #[test]
    fn test_var_sb_attention_no_grad_is_detached() {
        let (_client, device) = cpu_setup();
        let t = Tensor::<CpuRuntime>::from_slice(&[0.1f32, 0.2, 0.3, 0.4], &[2, 1, 2], &device);
        let x = Var::new(t, false);
        let cu = Tensor::<CpuRuntime>::from_slice(&[0i32, 2], &[2], &device);
        let out = var_sb_attention_varlen(&x, &x, &x, None, &cu, 2, StickBreakingParams::for_head_dim(2))
            .unwrap();
        assert!(!out.output.requires_grad());
    }
}
