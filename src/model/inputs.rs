//! Padding-free input layout
//!
//! A padding-free batch is one `[total_tokens]` row of token ids plus segment
//! offsets. Without document resets every batch row is one segment; with
//! resets a segment also ends after every EOS token.

use crate::error::{Error, Result};
use crate::host::index_tensor;
use crate::ops::traits::stick_breaking::validate_cu_seqlens;
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Segment offsets of a packed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedSequences {
    cu_seqlens: Vec<usize>,
    max_seqlen: usize,
}

impl PackedSequences {
    /// Checked constructor; see [`validate_cu_seqlens`].
    pub fn new(cu_seqlens: Vec<usize>, max_seqlen: usize) -> Result<Self> {
        let total = cu_seqlens.last().copied().unwrap_or(0);
        validate_cu_seqlens(&cu_seqlens, total, max_seqlen)?;
        Ok(Self {
            cu_seqlens,
            max_seqlen,
        })
    }

    /// `batch` rows of `seq_len` tokens each: `0, S, 2S, .., B*S`.
    pub fn uniform(batch: usize, seq_len: usize) -> Result<Self> {
        if batch == 0 || seq_len == 0 {
            return Err(Error::InvalidArgument {
                arg: "batch",
                reason: format!("cannot pack an empty [{batch}, {seq_len}] batch"),
            });
        }
        Self::new((0..=batch).map(|b| b * seq_len).collect(), seq_len)
    }

    /// Segments of a `[batch, seq_len]` row-major token block that also end
    /// after every `eos_token_id`. `max_seqlen` is the longest segment.
    pub fn split_at_eos(tokens: &[i64], batch: usize, seq_len: usize, eos_token_id: i64) -> Result<Self> {
        if tokens.len() != batch * seq_len {
            return Err(Error::shape(format!(
                "expected {batch}x{seq_len} tokens, got {}",
                tokens.len()
            )));
        }
        let mut cu_seqlens = vec![0];
        for (row_idx, row) in tokens.chunks(seq_len.max(1)).enumerate() {
            let row_start = row_idx * seq_len;
            for (i, &tok) in row.iter().enumerate() {
                let end = row_start + i + 1;
                if tok == eos_token_id || i + 1 == row.len() {
                    cu_seqlens.push(end);
                }
            }
        }
        let max_seqlen = cu_seqlens.windows(2).map(|w| w[1] - w[0]).max().unwrap_or(0);
        Self::new(cu_seqlens, max_seqlen)
    }

    pub fn cu_seqlens(&self) -> &[usize] {
        &self.cu_seqlens
    }

    pub fn max_seqlen(&self) -> usize {
        self.max_seqlen
    }

    pub fn num_segments(&self) -> usize {
        self.cu_seqlens.len() - 1
    }

    pub fn total_tokens(&self) -> usize {
        self.cu_seqlens[self.cu_seqlens.len() - 1]
    }

    /// Position of every token inside its segment.
    pub fn position_ids(&self) -> Vec<i64> {
        self.cu_seqlens
            .windows(2)
            .flat_map(|w| 0..(w[1] - w[0]) as i64)
            .collect()
    }

    /// Offsets as an I64 tensor for the kernels.
    pub fn to_tensor<R: Runtime<DType = DType>>(&self, device: &R::Device) -> Tensor<R> {
        let offsets: Vec<i64> = self.cu_seqlens.iter().map(|&c| c as i64).collect();
        index_tensor::<R>(&offsets, &[offsets.len()], device)
    }
}

/// `arange(past_len, past_len + seq_len)` repeated for each batch row.
pub fn default_position_ids(batch: usize, seq_len: usize, past_len: usize) -> Vec<i64> {
    (0..batch)
        .flat_map(|_| (past_len..past_len + seq_len).map(|p| p as i64))
        .collect()
}
