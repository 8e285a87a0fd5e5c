//! Stage roles and the carried-state slot passed between stages.

use crate::error::{Error, Result};
use crate::model::cache::KvCache;
use numr::autograd::Var;
use numr::runtime::Runtime;

/// Position of a rank in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRole {
    First,
    Middle,
    Last,
    /// Single stage, no pipelining.
    Only,
}

impl StageRole {
    pub fn new(stage_id: usize, num_stages: usize) -> Result<Self> {
        if num_stages == 0 || stage_id >= num_stages {
            return Err(Error::DistributedError {
                reason: format!("stage {stage_id} is outside a {num_stages}-stage pipeline"),
            });
        }
        Ok(match (stage_id == 0, stage_id + 1 == num_stages) {
            (true, true) => Self::Only,
            (true, false) => Self::First,
            (false, true) => Self::Last,
            (false, false) => Self::Middle,
        })
    }

    /// Owns the embeddings.
    pub fn is_first(self) -> bool {
        matches!(self, Self::First | Self::Only)
    }

    /// Owns the LM head and the loss.
    pub fn is_last(self) -> bool {
        matches!(self, Self::Last | Self::Only)
    }

    pub fn is_pipelined(self) -> bool {
        !matches!(self, Self::Only)
    }

    /// Check that `carried` matches what this position receives.
    ///
    /// Pipelined non-first stages receive the upstream aux total. The first
    /// stage of a pipeline receives nothing. Without pipelining the slot holds
    /// a KV cache or nothing.
    pub fn check_carried<R: Runtime>(self, carried: &CarriedState<R>) -> Result<()> {
        let ok = match (self, carried) {
            (Self::First, CarriedState::None) => true,
            (Self::Middle | Self::Last, CarriedState::AuxLoss(_)) => true,
            (Self::Only, CarriedState::None | CarriedState::Cache(_)) => true,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidArgument {
                arg: "carried",
                reason: format!("{self:?} stage cannot receive {}", carried.kind()),
            })
        }
    }
}

/// The one value a stage receives besides its activation.
pub enum CarriedState<R: Runtime> {
    None,
    /// Generation cache, only without pipelining.
    Cache(KvCache<R>),
    /// Aux-loss total of all upstream stages, `[1]`.
    AuxLoss(Var<R>),
}

impl<R: Runtime> CarriedState<R> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "nothing",
            Self::Cache(_) => "a KV cache",
            Self::AuxLoss(_) => "an aux loss",
        }
    }

    /// Split into the cache and the upstream aux total.
    pub fn into_parts(self) -> (Option<KvCache<R>>, Option<Var<R>>) {
        match self {
            Self::None => (None, None),
            Self::Cache(cache) => (Some(cache), None),
            Self::AuxLoss(aux) => (None, Some(aux)),
        }
    }
}

/// Result of one stage forward.
pub enum StageOutput<R: Runtime> {
    /// Last stage: logits and the aux total of the whole model.
    Final {
        logits: Var<R>,
        aux_loss: Var<R>,
        cache: Option<KvCache<R>>,
    },
    /// Any other stage: the activation and aux total to relay downstream.
    Intermediate { hidden: Var<R>, aux_loss: Var<R> },
}

impl<R: Runtime> StageOutput<R> {
    pub fn aux_loss(&self) -> &Var<R> {
        match self {
            Self::Final { aux_loss, .. } | Self::Intermediate { aux_loss, .. } => aux_loss,
        }
    }

    /// Activation or logits.
    pub fn output(&self) -> &Var<R> {
        match self {
            Self::Final { logits, .. } => logits,
            Self::Intermediate { hidden, .. } => hidden,
        }
    }

    /// Carried state for the next stage.
    pub fn relay(&self) -> CarriedState<R> {
        CarriedState::AuxLoss(self.aux_loss().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;
    use numr::tensor::Tensor;

    #[test]
    fn test_roles() {
        assert_eq!(StageRole::new(0, 1).unwrap(), StageRole::Only);
        assert_eq!(StageRole::new(0, 3).unwrap(), StageRole::First);
        assert_eq!(StageRole::new(1, 3).unwrap(), StageRole::Middle);
        assert_eq!(StageRole::new(2, 3).unwrap(), StageRole::Last);
        assert!(StageRole::new(3, 3).is_err());
        assert!(StageRole::Only.is_first() && StageRole::Only.is_last());
        assert!(!StageRole::Middle.is_first() && !StageRole::Middle.is_last());
    }

    #[test]
    fn test_carried_tag_follows_position() {
        let (_client, device) = cpu_setup();
        let aux = || {
            CarriedState::<CpuRuntime>::AuxLoss(Var::new(
                Tensor::<CpuRuntime>::from_slice(&[0.5f32], &[1], &device),
                false,
            ))
        };

        assert!(StageRole::First.check_carried(&CarriedState::<CpuRuntime>::None).is_ok());
        assert!(StageRole::First.check_carried(&aux()).is_err());
        assert!(StageRole::Middle.check_carried(&aux()).is_ok());
        assert!(StageRole::Last.check_carried(&CarriedState::<CpuRuntime>::None).is_err());
        assert!(StageRole::Only.check_carried(&aux()).is_err());
        assert!(
            StageRole::Only
                .check_carried(&CarriedState::Cache(KvCache::<CpuRuntime>::new(2)))
                .is_ok()
        );
        assert!(
            StageRole::Last
                .check_carried(&CarriedState::Cache(KvCache::<CpuRuntime>::new(2)))
                .is_err()
        );
    }
}
