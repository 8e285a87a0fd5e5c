//! Model configuration
//!
//! Loaded from YAML or JSON and validated before any weights are built.

use crate::distributed::pipeline::StageRole;
use crate::error::{Error, Result};
use crate::nn::{Activation, MoeConfig, NormKind};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::Path;

/// How absolute positions enter the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionEmbedding {
    /// Learned table indexed by position ids, added to token embeddings
    LearnedAbsolute,
    /// Stick-breaking attention orders keys by itself
    #[default]
    None,
}

/// Stick-breaking MoE decoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,

    #[serde(default)]
    pub num_kv_heads: Option<usize>,

    #[serde(default)]
    pub intermediate_size: Option<usize>,

    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,

    #[serde(default)]
    pub position_embedding: PositionEmbedding,

    #[serde(default = "default_activation")]
    pub activation: Activation,

    #[serde(default)]
    pub normalization: NormKind,

    #[serde(default = "default_eps")]
    pub layer_norm_epsilon: f64,

    /// Causal window of the stick-breaking kernel: `true` lets query `i`
    /// attend to keys `j <= i`, `false` restricts it to `j < i` (strictly
    /// causal; the first token of a sequence then attends to nothing and
    /// decoding reads every cached key but the newest).
    ///
    /// The default `true` is not the strictly causal kernel: weights trained
    /// with a `j < i` stick-breaking kernel need `attend_current: false`.
    #[serde(default = "default_true")]
    pub attend_current: bool,

    /// Add `remainder * head_bias` to every attention output
    #[serde(default)]
    pub sb_remainder: bool,

    #[serde(default = "default_true")]
    pub add_bias: bool,

    /// Absent for a dense model
    #[serde(default)]
    pub moe: Option<MoeConfig>,

    /// Every n-th block (counting from the first) is MoE when `moe` is set
    #[serde(default = "default_moe_interval")]
    pub moe_layer_interval: usize,

    #[serde(default = "default_router_aux_loss_coef")]
    pub router_aux_loss_coef: f64,

    /// μP width multiplier; logits are divided by it
    #[serde(default)]
    pub m_width: Option<f64>,

    #[serde(default = "default_initializer_range")]
    pub initializer_range: f64,

    #[serde(default)]
    pub init_seed: u64,

    #[serde(default)]
    pub tie_word_embeddings: bool,

    #[serde(default)]
    pub is_encoder_decoder: bool,
}

fn default_max_position_embeddings() -> usize {
    2048
}

fn default_activation() -> Activation {
    Activation::Swiglu
}

fn default_eps() -> f64 {
    1e-5
}

fn default_true() -> bool {
    true
}

fn default_moe_interval() -> usize {
    1
}

fn default_router_aux_loss_coef() -> f64 {
    0.01
}

fn default_initializer_range() -> f64 {
    0.02
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::ModelError {
        reason: reason.into(),
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(invalid("vocab_size must be > 0"));
        }
        if self.hidden_size == 0 {
            return Err(invalid("hidden_size must be > 0"));
        }
        if self.num_layers == 0 {
            return Err(invalid("num_layers must be > 0"));
        }
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            return Err(invalid(format!(
                "hidden_size ({}) must be divisible by num_heads ({})",
                self.hidden_size, self.num_heads
            )));
        }
        let kv = self.kv_heads();
        if kv == 0 || self.num_heads % kv != 0 {
            return Err(invalid(format!(
                "num_heads ({}) must be divisible by num_kv_heads ({kv})",
                self.num_heads
            )));
        }
        if self.intermediate_size() == 0 {
            return Err(invalid("intermediate_size must be > 0"));
        }
        if let Some(moe) = &self.moe {
            moe.validate()?;
            if self.moe_layer_interval == 0 {
                return Err(invalid("moe_layer_interval must be > 0"));
            }
        }
        if let Some(m) = self.m_width {
            if !(m.is_finite() && m > 0.0) {
                return Err(invalid(format!("m_width must be positive, got {m}")));
            }
        }
        if self.position_embedding == PositionEmbedding::LearnedAbsolute && self.max_position_embeddings == 0 {
            return Err(invalid("learned_absolute positions need max_position_embeddings > 0"));
        }
        Ok(())
    }

    pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| invalid(format!("IO error: {e}")))?;
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| invalid(format!("YAML parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| invalid(format!("IO error: {e}")))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| invalid(format!("JSON parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn kv_heads(&self) -> usize {
        self.num_kv_heads.unwrap_or(self.num_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    /// FFN width, defaulting to `4 * hidden_size`
    pub fn intermediate_size(&self) -> usize {
        self.intermediate_size.unwrap_or(4 * self.hidden_size)
    }

    /// Whether block `layer_idx` routes through experts.
    pub fn is_moe_layer(&self, layer_idx: usize) -> bool {
        self.moe.is_some() && layer_idx % self.moe_layer_interval.max(1) == 0
    }
}

/// Position of this rank's model chunk in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageLayout {
    stage_id: usize,
    num_stages: usize,
    role: StageRole,
}

impl StageLayout {
    /// A single stage holding the whole model.
    pub fn single() -> Self {
        Self {
            stage_id: 0,
            num_stages: 1,
            role: StageRole::Only,
        }
    }

    pub fn new(stage_id: usize, num_stages: usize) -> Result<Self> {
        let role = StageRole::new(stage_id, num_stages)?;
        Ok(Self {
            stage_id,
            num_stages,
            role,
        })
    }

    pub fn stage_id(&self) -> usize {
        self.stage_id
    }

    pub fn num_stages(&self) -> usize {
        self.num_stages
    }

    pub fn role(&self) -> StageRole {
        self.role
    }

    /// Blocks owned by this stage; layers must split evenly.
    pub fn layer_range(&self, num_layers: usize) -> Result<Range<usize>> {
        if num_layers % self.num_stages != 0 {
            return Err(Error::incompatible(format!(
                "num_layers ({num_layers}) is not divisible by the number of pipeline stages ({})",
                self.num_stages
            )));
        }
        let per_stage = num_layers / self.num_stages;
        let start = self.stage_id * per_stage;
        Ok(start..start + per_stage)
    }
}
