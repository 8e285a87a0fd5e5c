//! Pretraining options

use crate::error::{Error, Result};
use crate::model::ModelConfig;

/// How the caller's `lm_loss_multiplier` is applied to the summed LM loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LmLossScaling {
    /// `lm_loss = multiplier * sum`
    #[default]
    Sum,
    /// `lm_loss = multiplier * sum / tokens`, counting labels that are not ignored
    TokenMean,
}

/// Input layout and loss options for pretraining
#[derive(Debug, Clone)]
pub struct PretrainingConfig {
    /// Flatten every batch to one packed row with segment offsets.
    pub padding_free: bool,
    /// End a segment after every EOS token.
    pub reset_attention_mask: bool,
    /// Restart positions at every segment.
    pub reset_position_ids: bool,
    pub eos_token_id: Option<i64>,
    pub lm_loss_multiplier: f64,
    pub loss_scaling: LmLossScaling,
}

impl Default for PretrainingConfig {
    fn default() -> Self {
        Self {
            padding_free: false,
            reset_attention_mask: false,
            reset_position_ids: false,
            eos_token_id: None,
            lm_loss_multiplier: 1.0,
            loss_scaling: LmLossScaling::Sum,
        }
    }
}

impl PretrainingConfig {
    pub fn with_padding_free(mut self, padding_free: bool) -> Self {
        self.padding_free = padding_free;
        self
    }

    pub fn with_reset_attention_mask(mut self, reset: bool) -> Self {
        self.reset_attention_mask = reset;
        self
    }

    pub fn with_reset_position_ids(mut self, reset: bool) -> Self {
        self.reset_position_ids = reset;
        self
    }

    pub fn with_eos_token_id(mut self, eos_token_id: i64) -> Self {
        self.eos_token_id = Some(eos_token_id);
        self
    }

    pub fn with_lm_loss_multiplier(mut self, multiplier: f64) -> Self {
        self.lm_loss_multiplier = multiplier;
        self
    }

    pub fn with_loss_scaling(mut self, scaling: LmLossScaling) -> Self {
        self.loss_scaling = scaling;
        self
    }

    /// Check these options against the model and the pipeline size.
    pub fn validate(&self, model: &ModelConfig, num_stages: usize) -> Result<()> {
        if model.is_encoder_decoder {
            return Err(Error::incompatible("pretraining supports decoder-only models"));
        }
        let resets = self.reset_attention_mask || self.reset_position_ids;
        if num_stages > 1 && resets {
            return Err(Error::incompatible(
                "reset_attention_mask and reset_position_ids are not supported with pipeline parallelism",
            ));
        }
        if self.reset_position_ids && !self.reset_attention_mask {
            return Err(Error::incompatible(
                "reset_position_ids requires reset_attention_mask",
            ));
        }
        if resets && !self.padding_free {
            return Err(Error::incompatible(
                "document resets are only supported with padding-free inputs",
            ));
        }
        if self.reset_attention_mask && self.eos_token_id.is_none() {
            return Err(Error::incompatible("reset_attention_mask needs eos_token_id"));
        }
        if !self.lm_loss_multiplier.is_finite() {
            return Err(Error::InvalidArgument {
                arg: "lm_loss_multiplier",
                reason: format!("must be finite, got {}", self.lm_loss_multiplier),
            });
        }
        Ok(())
    }
}
