//! CPU implementation of stick-breaking attention
//!
//! Every path is lowered to a list of query rows, each with its causal key
//! window already clipped, and run through the same f64 recurrence. Dense
//! batches are packed segments of equal length; decode is one row per batch
//! element positioned at the end of its key cache.

use crate::error::{Error, Result};
use crate::ops::traits::stick_breaking::{kv_group_size, validate_cu_seqlens};
use crate::ops::traits::{StickBreakingGrads, StickBreakingOps, StickBreakingParams};
use numr::dtype::DType;
use numr::ops::TypeConversionOps;
use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
use numr::tensor::Tensor;

/// Head geometry shared by every row of one call.
#[derive(Debug, Clone, Copy)]
struct Heads {
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    group: usize,
}

impl Heads {
    fn q_offset(&self, token: usize, head: usize) -> usize {
        (token * self.num_heads + head) * self.head_dim
    }

    fn kv_offset(&self, token: usize, head: usize) -> usize {
        (token * self.num_kv_heads + head / self.group) * self.head_dim
    }
}

/// A query token and the keys it may see, `key_start..key_start + n_keys`.
#[derive(Debug, Clone, Copy)]
struct QueryRow {
    q_token: usize,
    key_start: usize,
    n_keys: usize,
}

fn rows_for_segments(bounds: &[usize], attend_current: bool) -> Vec<QueryRow> {
    let mut rows = Vec::with_capacity(bounds.last().copied().unwrap_or(0));
    for seg in bounds.windows(2) {
        let (start, len) = (seg[0], seg[1] - seg[0]);
        for i in 0..len {
            rows.push(QueryRow {
                q_token: start + i,
                key_start: start,
                n_keys: if attend_current { i + 1 } else { i },
            });
        }
    }
    rows
}

#[inline]
fn log_sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        -(-x).exp().ln_1p()
    } else {
        x - x.exp().ln_1p()
    }
}

#[inline]
fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Host-side view of one call's inputs.
struct Problem<'a> {
    heads: Heads,
    scale: f64,
    q: &'a [f64],
    k: &'a [f64],
}

impl Problem<'_> {
    /// Fill `att` with the row's weights and `sig` with the break probabilities.
    /// Returns the remainder `exp(sum_j beta_j)`.
    fn row_weights(&self, row: QueryRow, head: usize, att: &mut Vec<f64>, sig: &mut Vec<f64>) -> f64 {
        let d = self.heads.head_dim;
        let q_off = self.heads.q_offset(row.q_token, head);
        let q_row = &self.q[q_off..q_off + d];

        att.clear();
        sig.clear();
        for j in 0..row.n_keys {
            let k_off = self.heads.kv_offset(row.key_start + j, head);
            let s = self.scale * dot(q_row, &self.k[k_off..k_off + d]);
            att.push(s);
            sig.push(sigmoid(s));
        }

        // Walk from the key nearest the query outwards, accumulating log(1 - p).
        let mut log_survive = 0.0;
        for j in (0..row.n_keys).rev() {
            let s = att[j];
            att[j] = (log_sigmoid(s) + log_survive).exp();
            log_survive += log_sigmoid(-s);
        }
        log_survive.exp()
    }
}

struct Forward {
    out: Vec<f64>,
    rem: Vec<f64>,
}

fn forward_rows(problem: &Problem<'_>, v: &[f64], bias: Option<&[f64]>, rows: &[QueryRow]) -> Forward {
    let heads = problem.heads;
    let d = heads.head_dim;
    let mut out = vec![0.0f64; problem.q.len()];
    let mut rem = vec![0.0f64; problem.q.len() / d.max(1)];
    let (mut att, mut sig) = (Vec::new(), Vec::new());

    for &row in rows {
        for h in 0..heads.num_heads {
            let r = problem.row_weights(row, h, &mut att, &mut sig);
            let o_off = heads.q_offset(row.q_token, h);
            let o_row = &mut out[o_off..o_off + d];
            for (j, &a) in att.iter().enumerate() {
                let v_off = heads.kv_offset(row.key_start + j, h);
                for (o, &x) in o_row.iter_mut().zip(&v[v_off..v_off + d]) {
                    *o += a * x;
                }
            }
            if let Some(b) = bias {
                for (o, &x) in o_row.iter_mut().zip(&b[h * d..(h + 1) * d]) {
                    *o += r * x;
                }
            }
            rem[row.q_token * heads.num_heads + h] = r;
        }
    }
    Forward { out, rem }
}

struct Backward {
    dq: Vec<f64>,
    dk: Vec<f64>,
    dv: Vec<f64>,
    dbias: Option<Vec<f64>>,
}

/// Gradients of `L = sum(dout * O)`.
///
/// For key `m` of a row, `log att_j` depends on `s_m` through `z_m` when
/// `j == m` and through `beta_m` when `j < m`; `log R` depends on every `beta`.
/// Hence `dL/ds_m = att_m g_m (1 - p_m) - p_m (sum_{j<m} att_j g_j + R dR)` with
/// `g_j = dout . v_j`, `dR = dout . head_bias` and `p_m = sigmoid(s_m)`.
fn backward_rows(
    problem: &Problem<'_>,
    dout: &[f64],
    v: &[f64],
    bias: Option<&[f64]>,
    rows: &[QueryRow],
) -> Backward {
    let heads = problem.heads;
    let d = heads.head_dim;
    let mut dq = vec![0.0f64; problem.q.len()];
    let mut dk = vec![0.0f64; problem.k.len()];
    let mut dv = vec![0.0f64; v.len()];
    let mut dbias = bias.map(|b| vec![0.0f64; b.len()]);
    let (mut att, mut sig) = (Vec::new(), Vec::new());

    for &row in rows {
        for h in 0..heads.num_heads {
            let r = problem.row_weights(row, h, &mut att, &mut sig);
            let q_off = heads.q_offset(row.q_token, h);
            let dout_row = &dout[q_off..q_off + d];

            let dr = match (bias, dbias.as_mut()) {
                (Some(b), Some(db)) => {
                    for (g, &x) in db[h * d..(h + 1) * d].iter_mut().zip(dout_row) {
                        *g += r * x;
                    }
                    dot(dout_row, &b[h * d..(h + 1) * d])
                }
                _ => 0.0,
            };

            let mut prefix = 0.0;
            for j in 0..row.n_keys {
                let kv_off = heads.kv_offset(row.key_start + j, h);
                let g = dot(dout_row, &v[kv_off..kv_off + d]);
                let (a, p) = (att[j], sig[j]);
                let ds = a * g * (1.0 - p) - p * (prefix + r * dr);
                prefix += a * g;

                for c in 0..d {
                    dv[kv_off + c] += a * dout_row[c];
                    dq[q_off + c] += problem.scale * ds * problem.k[kv_off + c];
                    dk[kv_off + c] += problem.scale * ds * problem.q[q_off + c];
                }
            }
        }
    }
    Backward { dq, dk, dv, dbias }
}

fn host_f64(client: &CpuClient, t: &Tensor<CpuRuntime>) -> Result<Vec<f64>> {
    let t = t.contiguous();
    if t.dtype() == DType::F64 {
        return Ok(t.to_vec::<f64>());
    }
    Ok(client.cast(&t, DType::F64).map_err(Error::Numr)?.to_vec::<f64>())
}

fn to_device(
    client: &CpuClient,
    data: &[f64],
    shape: &[usize],
    dtype: DType,
    device: &CpuDevice,
) -> Result<Tensor<CpuRuntime>> {
    let t = Tensor::<CpuRuntime>::from_slice(data, shape, device);
    if dtype == DType::F64 {
        Ok(t)
    } else {
        client.cast(&t, dtype).map_err(Error::Numr)
    }
}

fn host_offsets(cu_seqlens: &Tensor<CpuRuntime>) -> Result<Vec<usize>> {
    let raw: Vec<i64> = match cu_seqlens.dtype() {
        DType::I32 => cu_seqlens
            .contiguous()
            .to_vec::<i32>()
            .into_iter()
            .map(i64::from)
            .collect(),
        DType::I64 => cu_seqlens.contiguous().to_vec::<i64>(),
        other => {
            return Err(Error::InvalidArgument {
                arg: "cu_seqlens",
                reason: format!("expected I32 or I64, got {other:?}"),
            });
        }
    };
    raw.into_iter()
        .map(|x| {
            usize::try_from(x).map_err(|_| Error::InvalidArgument {
                arg: "cu_seqlens",
                reason: format!("negative offset {x}"),
            })
        })
        .collect()
}

/// Check the trailing `[heads, head_dim]` dims of q/k/v and the optional bias.
fn head_layout(
    q: &Tensor<CpuRuntime>,
    k: &Tensor<CpuRuntime>,
    v: &Tensor<CpuRuntime>,
    head_bias: Option<&Tensor<CpuRuntime>>,
    ndim: usize,
) -> Result<Heads> {
    for (name, t) in [("q", q), ("k", k), ("v", v)] {
        if t.shape().len() != ndim {
            return Err(Error::shape(format!(
                "{name} must be {ndim}D, got shape {:?}",
                t.shape()
            )));
        }
    }
    if k.shape() != v.shape() {
        return Err(Error::shape(format!(
            "k {:?} and v {:?} must have the same shape",
            k.shape(),
            v.shape()
        )));
    }
    let num_heads = q.shape()[ndim - 2];
    let head_dim = q.shape()[ndim - 1];
    let num_kv_heads = k.shape()[ndim - 2];
    if k.shape()[ndim - 1] != head_dim {
        return Err(Error::shape(format!(
            "q head_dim {head_dim} != k head_dim {}",
            k.shape()[ndim - 1]
        )));
    }
    let group = kv_group_size(num_heads, num_kv_heads)?;
    if let Some(b) = head_bias {
        if b.shape() != [num_heads, head_dim] {
            return Err(Error::shape(format!(
                "head_bias must be [{num_heads}, {head_dim}], got {:?}",
                b.shape()
            )));
        }
    }
    Ok(Heads {
        num_heads,
        num_kv_heads,
        head_dim,
        group,
    })
}

fn dense_rows(
    q: &Tensor<CpuRuntime>,
    k: &Tensor<CpuRuntime>,
    attend_current: bool,
) -> Result<Vec<QueryRow>> {
    let (batch, seq_len) = (q.shape()[0], q.shape()[1]);
    if k.shape()[0] != batch || k.shape()[1] != seq_len {
        return Err(Error::shape(format!(
            "full path needs matching query/key batch and length, got q {:?} k {:?}",
            q.shape(),
            k.shape()
        )));
    }
    let bounds: Vec<usize> = (0..=batch).map(|b| b * seq_len).collect();
    Ok(rows_for_segments(&bounds, attend_current))
}

fn varlen_rows(
    q: &Tensor<CpuRuntime>,
    k: &Tensor<CpuRuntime>,
    cu_seqlens: &Tensor<CpuRuntime>,
    max_seqlen: usize,
    attend_current: bool,
) -> Result<Vec<QueryRow>> {
    let total = q.shape()[0];
    if k.shape()[0] != total {
        return Err(Error::shape(format!(
            "packed q has {total} tokens but k has {}",
            k.shape()[0]
        )));
    }
    let bounds = host_offsets(cu_seqlens)?;
    validate_cu_seqlens(&bounds, total, max_seqlen)?;
    Ok(rows_for_segments(&bounds, attend_current))
}

struct Inputs {
    q: Vec<f64>,
    k: Vec<f64>,
    v: Vec<f64>,
    bias: Option<Vec<f64>>,
}

fn gather_inputs(
    client: &CpuClient,
    q: &Tensor<CpuRuntime>,
    k: &Tensor<CpuRuntime>,
    v: &Tensor<CpuRuntime>,
    head_bias: Option<&Tensor<CpuRuntime>>,
) -> Result<Inputs> {
    Ok(Inputs {
        q: host_f64(client, q)?,
        k: host_f64(client, k)?,
        v: host_f64(client, v)?,
        bias: head_bias.map(|b| host_f64(client, b)).transpose()?,
    })
}

#[allow(clippy::too_many_arguments)]
fn sb_forward(
    client: &CpuClient,
    q: &Tensor<CpuRuntime>,
    k: &Tensor<CpuRuntime>,
    v: &Tensor<CpuRuntime>,
    head_bias: Option<&Tensor<CpuRuntime>>,
    heads: Heads,
    rows: &[QueryRow],
    params: StickBreakingParams,
) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
    let inputs = gather_inputs(client, q, k, v, head_bias)?;
    let problem = Problem {
        heads,
        scale: params.scale,
        q: &inputs.q,
        k: &inputs.k,
    };
    let Forward { out, rem } = forward_rows(&problem, &inputs.v, inputs.bias.as_deref(), rows);

    let q_shape = q.shape();
    let rem_shape = &q_shape[..q_shape.len() - 1];
    let device = q.device();
    Ok((
        to_device(client, &out, q_shape, q.dtype(), device)?,
        to_device(client, &rem, rem_shape, q.dtype(), device)?,
    ))
}

#[allow(clippy::too_many_arguments)]
fn sb_backward(
    client: &CpuClient,
    dout: &Tensor<CpuRuntime>,
    q: &Tensor<CpuRuntime>,
    k: &Tensor<CpuRuntime>,
    v: &Tensor<CpuRuntime>,
    head_bias: Option<&Tensor<CpuRuntime>>,
    heads: Heads,
    rows: &[QueryRow],
    params: StickBreakingParams,
) -> Result<StickBreakingGrads<CpuRuntime>> {
    if dout.shape() != q.shape() {
        return Err(Error::shape(format!(
            "dout {:?} must match q {:?}",
            dout.shape(),
            q.shape()
        )));
    }
    let inputs = gather_inputs(client, q, k, v, head_bias)?;
    let dout_host = host_f64(client, dout)?;
    let problem = Problem {
        heads,
        scale: params.scale,
        q: &inputs.q,
        k: &inputs.k,
    };
    let grads = backward_rows(&problem, &dout_host, &inputs.v, inputs.bias.as_deref(), rows);

    let device = q.device();
    let dhead_bias = match (grads.dbias, head_bias) {
        (Some(db), Some(b)) => Some(to_device(client, &db, b.shape(), b.dtype(), device)?),
        _ => None,
    };
    Ok(StickBreakingGrads {
        dq: to_device(client, &grads.dq, q.shape(), q.dtype(), device)?,
        dk: to_device(client, &grads.dk, k.shape(), k.dtype(), device)?,
        dv: to_device(client, &grads.dv, v.shape(), v.dtype(), device)?,
        dhead_bias,
    })
}

impl StickBreakingOps<CpuRuntime> for CpuClient {
    fn sb_attention_fwd(
        &self,
        q: &Tensor<CpuRuntime>,
        k: &Tensor<CpuRuntime>,
        v: &Tensor<CpuRuntime>,
        head_bias: Option<&Tensor<CpuRuntime>>,
        params: StickBreakingParams,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        let heads = head_layout(q, k, v, head_bias, 4)?;
        let rows = dense_rows(q, k, params.attend_current)?;
        sb_forward(self, q, k, v, head_bias, heads, &rows, params)
    }

    fn sb_attention_bwd(
        &self,
        dout: &Tensor<CpuRuntime>,
        q: &Tensor<CpuRuntime>,
        k: &Tensor<CpuRuntime>,
        v: &Tensor<CpuRuntime>,
        head_bias: Option<&Tensor<CpuRuntime>>,
        params: StickBreakingParams,
    ) -> Result<StickBreakingGrads<CpuRuntime>> {
        let heads = head_layout(q, k, v, head_bias, 4)?;
        let rows = dense_rows(q, k, params.attend_current)?;
        sb_backward(self, dout, q, k, v, head_bias, heads, &rows, params)
    }

    fn sb_attention_varlen_fwd(
        &self,
        q: &Tensor<CpuRuntime>,
        k: &Tensor<CpuRuntime>,
        v: &Tensor<CpuRuntime>,
        head_bias: Option<&Tensor<CpuRuntime>>,
        cu_seqlens: &Tensor<CpuRuntime>,
        max_seqlen: usize,
        params: StickBreakingParams,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        let heads = head_layout(q, k, v, head_bias, 3)?;
        let rows = varlen_rows(q, k, cu_seqlens, max_seqlen, params.attend_current)?;
        sb_forward(self, q, k, v, head_bias, heads, &rows, params)
    }

    fn sb_attention_varlen_bwd(
        &self,
        dout: &Tensor<CpuRuntime>,
        q: &Tensor<CpuRuntime>,
        k: &Tensor<CpuRuntime>,
        v: &Tensor<CpuRuntime>,
        head_bias: Option<&Tensor<CpuRuntime>>,
        cu_seqlens: &Tensor<CpuRuntime>,
        max_seqlen: usize,
        params: StickBreakingParams,
    ) -> Result<StickBreakingGrads<CpuRuntime>> {
        let heads = head_layout(q, k, v, head_bias, 3)?;
        let rows = varlen_rows(q, k, cu_seqlens, max_seqlen, params.attend_current)?;
        sb_backward(self, dout, q, k, v, head_bias, heads, &rows, params)
    }

    fn sb_attention_decode(
        &self,
        q: &Tensor<CpuRuntime>,
        k: &Tensor<CpuRuntime>,
        v: &Tensor<CpuRuntime>,
        head_bias: Option<&Tensor<CpuRuntime>>,
        params: StickBreakingParams,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        let heads = head_layout(q, k, v, head_bias, 4)?;
        let (batch, q_len) = (q.shape()[0], q.shape()[1]);
        if q_len != 1 {
            return Err(Error::shape(format!(
                "decode expects exactly one query token, got {q_len}"
            )));
        }
        let cached = k.shape()[1];
        if k.shape()[0] != batch || cached == 0 {
            return Err(Error::shape(format!(
                "decode needs a non-empty key cache per batch row, got k {:?} for batch {batch}",
                k.shape()
            )));
        }
        let n_keys = if params.attend_current { cached } else { cached - 1 };
        let rows: Vec<QueryRow> = (0..batch)
            .map(|b| QueryRow {
                q_token: b,
                key_start: b * cached,
                n_keys,
            })
            .collect();
        sb_forward(self, q, k, v, head_bias, heads, &rows, params)
    }

    fn sb_attention_weights_varlen(
        &self,
        q: &Tensor<CpuRuntime>,
        k: &Tensor<CpuRuntime>,
        cu_seqlens: &Tensor<CpuRuntime>,
        max_seqlen: usize,
        params: StickBreakingParams,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        let heads = head_layout(q, k, k, None, 3)?;
        let rows = varlen_rows(q, k, cu_seqlens, max_seqlen, params.attend_current)?;
        let q_host = host_f64(self, q)?;
        let k_host = host_f64(self, k)?;
        let problem = Problem {
            heads,
            scale: params.scale,
            q: &q_host,
            k: &k_host,
        };

        let total = q.shape()[0];
        let h = heads.num_heads;
        let mut weights = vec![0.0f64; h * total * total];
        let mut rem = vec![0.0f64; total * h];
        let (mut att, mut sig) = (Vec::new(), Vec::new());
        for &row in &rows {
            for head in 0..h {
                rem[row.q_token * h + head] = problem.row_weights(row, head, &mut att, &mut sig);
                let base = (head * total + row.q_token) * total + row.key_start;
                weights[base..base + att.len()].copy_from_slice(&att);
            }
        }

        let device = q.device();
        Ok((
            to_device(self, &weights, &[h, total, total], q.dtype(), device)?,
            to_device(self, &rem, &[total, h], q.dtype(), device)?,
        ))
    }
}
