//! Stick-breaking attention traits
//!
//! Stick-breaking attention replaces the softmax with a sequence of "breaks":
//! key `j` claims a sigmoid fraction of whatever mass keys closer to the query
//! left over. For query `i` and allowed keys `j <= e_i`:
//!
//! ```text
//! s_ij   = scale * (q_i . k_j)
//! z_ij   = logsigmoid(s_ij)
//! beta_ij = logsigmoid(-s_ij)
//! att_ij = exp(z_ij + sum_{k=j+1}^{e_i} beta_ik)
//! R_i    = prod_j (1 - sigmoid(s_ij)) = 1 - sum_j att_ij
//! ```
//!
//! The remainder `R_i` is the mass no key claimed. With a head bias the output
//! becomes `O_i = sum_j att_ij v_j + R_i * head_bias[h]`.
//!
//! # Layout contract
//!
//! - Dense: `q`, `k`, `v`: `[batch, seq_len, num_heads, head_dim]` (token-major)
//! - Packed: `q`, `k`, `v`: `[total_tokens, num_heads, head_dim]`, plus
//!   `cu_seqlens: [num_segments + 1]` (I32 or I64) and `max_seqlen`
//! - `k`/`v` may carry fewer heads than `q` (GQA/MQA): query head `h` reads
//!   kv head `h / (num_heads / num_kv_heads)`
//! - `head_bias`: `[num_heads, head_dim]`
//! - Remainder: the query layout minus `head_dim`
//!
//! All math runs in f64; results are returned in the dtype of `q`.

use crate::error::{Error, Result};
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Per-call knobs of the stick-breaking recurrence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StickBreakingParams {
    /// Score scale, `1/sqrt(head_dim)` by default
    pub scale: f64,
    /// Whether query `i` may attend to key `i` (`j <= i`) or only to `j < i`
    pub attend_current: bool,
}

impl StickBreakingParams {
    pub fn for_head_dim(head_dim: usize) -> Self {
        Self {
            scale: (head_dim as f64).sqrt().recip(),
            attend_current: true,
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_attend_current(mut self, attend_current: bool) -> Self {
        self.attend_current = attend_current;
        self
    }
}

/// Gradients of one stick-breaking call.
pub struct StickBreakingGrads<R: Runtime> {
    pub dq: Tensor<R>,
    pub dk: Tensor<R>,
    pub dv: Tensor<R>,
    /// Present when the forward ran with a head bias
    pub dhead_bias: Option<Tensor<R>>,
}

/// Stick-breaking attention kernels.
///
/// Forward calls return `(output, remainder)`.
#[allow(clippy::too_many_arguments)]
pub trait StickBreakingOps<R: Runtime> {
    /// Full-sequence forward; query and key lengths must match.
    fn sb_attention_fwd(
        &self,
        q: &Tensor<R>,
        k: &Tensor<R>,
        v: &Tensor<R>,
        head_bias: Option<&Tensor<R>>,
        params: StickBreakingParams,
    ) -> Result<(Tensor<R>, Tensor<R>)>;

    /// Full-sequence backward, recomputing the weights from `q`, `k`.
    fn sb_attention_bwd(
        &self,
        dout: &Tensor<R>,
        q: &Tensor<R>,
        k: &Tensor<R>,
        v: &Tensor<R>,
        head_bias: Option<&Tensor<R>>,
        params: StickBreakingParams,
    ) -> Result<StickBreakingGrads<R>>;

    /// Packed forward. Attention never crosses a `cu_seqlens` boundary.
    fn sb_attention_varlen_fwd(
        &self,
        q: &Tensor<R>,
        k: &Tensor<R>,
        v: &Tensor<R>,
        head_bias: Option<&Tensor<R>>,
        cu_seqlens: &Tensor<R>,
        max_seqlen: usize,
        params: StickBreakingParams,
    ) -> Result<(Tensor<R>, Tensor<R>)>;

    /// Packed backward.
    fn sb_attention_varlen_bwd(
        &self,
        dout: &Tensor<R>,
        q: &Tensor<R>,
        k: &Tensor<R>,
        v: &Tensor<R>,
        head_bias: Option<&Tensor<R>>,
        cu_seqlens: &Tensor<R>,
        max_seqlen: usize,
        params: StickBreakingParams,
    ) -> Result<StickBreakingGrads<R>>;

    /// Single-token decode against a key cache.
    ///
    /// `q`: `[batch, 1, num_heads, head_dim]`, `k`/`v`: `[batch, cached_len, num_kv_heads, head_dim]`.
    /// The query sits at position `cached_len - 1`, so the result equals the last
    /// row of the full path over the same keys. More than one query token is an error.
    fn sb_attention_decode(
        &self,
        q: &Tensor<R>,
        k: &Tensor<R>,
        v: &Tensor<R>,
        head_bias: Option<&Tensor<R>>,
        params: StickBreakingParams,
    ) -> Result<(Tensor<R>, Tensor<R>)>;

    /// Materialize packed attention weights `[num_heads, total_tokens, total_tokens]`
    /// and remainders `[total_tokens, num_heads]` for inspection.
    fn sb_attention_weights_varlen(
        &self,
        q: &Tensor<R>,
        k: &Tensor<R>,
        cu_seqlens: &Tensor<R>,
        max_seqlen: usize,
        params: StickBreakingParams,
    ) -> Result<(Tensor<R>, Tensor<R>)>;
}

/// Check packed-sequence offsets.
///
/// `cu_seqlens` must start at 0, increase strictly, end at `total_tokens`, and no
/// segment may be longer than `max_seqlen`.
pub fn validate_cu_seqlens(cu_seqlens: &[usize], total_tokens: usize, max_seqlen: usize) -> Result<()> {
    if cu_seqlens.len() < 2 {
        return Err(Error::InvalidArgument {
            arg: "cu_seqlens",
            reason: format!("need at least 2 offsets, got {}", cu_seqlens.len()),
        });
    }
    if cu_seqlens[0] != 0 {
        return Err(Error::InvalidArgument {
            arg: "cu_seqlens",
            reason: format!("must start at 0, starts at {}", cu_seqlens[0]),
        });
    }
    for pair in cu_seqlens.windows(2) {
        if pair[1] <= pair[0] {
            return Err(Error::InvalidArgument {
                arg: "cu_seqlens",
                reason: format!("must be strictly increasing, found {} -> {}", pair[0], pair[1]),
            });
        }
        if pair[1] - pair[0] > max_seqlen {
            return Err(Error::InvalidArgument {
                arg: "max_seqlen",
                reason: format!(
                    "segment of length {} exceeds max_seqlen {}",
                    pair[1] - pair[0],
                    max_seqlen
                ),
            });
        }
    }
    let last = cu_seqlens[cu_seqlens.len() - 1];
    if last != total_tokens {
        return Err(Error::InvalidArgument {
            arg: "cu_seqlens",
            reason: format!("last offset {last} != total tokens {total_tokens}"),
        });
    }
    Ok(())
}

/// Resolve the GQA repetition factor, failing on a head ratio that is not integral.
pub fn kv_group_size(num_heads: usize, num_kv_heads: usize) -> Result<usize> {
    if num_kv_heads == 0 || num_heads % num_kv_heads != 0 {
        return Err(Error::shape(format!(
            "num_heads ({num_heads}) must be a positive multiple of num_kv_heads ({num_kv_heads})"
        )));
    }
    Ok(num_heads / num_kv_heads)
}
