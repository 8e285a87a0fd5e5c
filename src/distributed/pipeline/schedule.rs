//! 1F1B training schedule with an aux-loss relay.
//!
//! Every stage forwards `(activation, aux_total)` to the next stage and, on
//! backward, sends the gradients for both upstream. The last stage applies
//! the loss function to `(logits, aux_total)` and starts backward.

use std::sync::Arc;

use super::clock::{PipelineAction, PipelineClock};
use super::comm::{recv_relay, send_relay};
use super::relay::{CarriedState, StageOutput, StageRole};
use super::stage::{AuxRelayStage, RelayContext, SavedMicroBatch};
use crate::error::{Error, Result};
use crate::nn::aux_loss::scalar_value;
use numr::autograd::{GradStore, Var, backward, var_add, var_mul, var_sum};
use numr::dtype::DType;
use numr::ops::{ScalarOps, TensorOps};
use numr::runtime::{Communicator, Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// Loss on the last stage: `(micro_batch_id, logits, aux_total) -> [1]`.
pub type LossFn<'a, R> = dyn Fn(usize, &Var<R>, &Var<R>) -> Result<Var<R>> + 'a;

/// Output from one training iteration.
pub struct PipelineOutput<R: Runtime> {
    /// Per-micro-batch loss values (last stage only).
    pub losses: Vec<f64>,
    /// Per-micro-batch aux totals seen by the loss (last stage only).
    pub aux_losses: Vec<f64>,
    /// Gradients of this stage's graph, one store per micro-batch.
    pub grads: Vec<GradStore<R>>,
}

/// Drives one [`AuxRelayStage`] through the 1F1B order on the pipeline
/// communicator. The rank is the stage index.
pub struct Schedule1F1B<R: Runtime> {
    stage: Box<dyn AuxRelayStage<R>>,
    clock: PipelineClock,
    role: StageRole,
    pp_comm: Arc<dyn Communicator>,
    device: R::Device,
}

impl<R: Runtime<DType = DType>> Schedule1F1B<R> {
    pub fn new(
        stage: Box<dyn AuxRelayStage<R>>,
        num_micro_batches: usize,
        pp_comm: Arc<dyn Communicator>,
        device: R::Device,
    ) -> Result<Self> {
        let num_stages = pp_comm.world_size().max(1);
        let rank = pp_comm.rank();
        let clock = PipelineClock::new(num_stages, num_micro_batches, rank)?;
        let role = StageRole::new(rank, num_stages)?;
        tracing::debug!(
            stage = rank,
            num_stages,
            num_micro_batches,
            ?role,
            "pipeline schedule created"
        );
        Ok(Self {
            stage,
            clock,
            role,
            pp_comm,
            device,
        })
    }

    pub fn role(&self) -> StageRole {
        self.role
    }

    pub fn num_micro_batches(&self) -> usize {
        self.clock.num_micro_batches()
    }

    pub fn communicator(&self) -> &dyn Communicator {
        self.pp_comm.as_ref()
    }

    /// Run one training iteration.
    ///
    /// * `micro_batches`: stage inputs, required on the first stage only.
    /// * `loss_fn`: required on the last stage only.
    pub fn run<C>(
        &mut self,
        client: &C,
        micro_batches: Option<Vec<Tensor<R>>>,
        loss_fn: Option<&LossFn<'_, R>>,
    ) -> Result<PipelineOutput<R>>
    where
        C: RuntimeClient<R> + TensorOps<R> + ScalarOps<R>,
        R::Client: TensorOps<R> + ScalarOps<R>,
    {
        let m = self.clock.num_micro_batches();
        let mut inputs: Vec<Option<Tensor<R>>> = if self.role.is_first() {
            let mbs = micro_batches.ok_or_else(|| Error::DistributedError {
                reason: "first stage must provide micro_batches".to_string(),
            })?;
            if mbs.len() != m {
                return Err(Error::DistributedError {
                    reason: format!("expected {m} micro-batches, got {}", mbs.len()),
                });
            }
            mbs.into_iter().map(Some).collect()
        } else {
            (0..m).map(|_| None).collect()
        };
        if self.role.is_last() && loss_fn.is_none() {
            return Err(Error::DistributedError {
                reason: "last stage requires loss_fn".to_string(),
            });
        }

        let mut saved = RelayContext::new(m);
        let mut output = PipelineOutput {
            losses: Vec::new(),
            aux_losses: Vec::new(),
            grads: Vec::with_capacity(m),
        };

        for action in self.clock.schedule_1f1b() {
            match action {
                PipelineAction::Forward(mb_id) => {
                    let mb = self.forward(mb_id, &mut inputs)?;
                    saved.save(mb_id, mb);
                }
                PipelineAction::Backward(mb_id) => {
                    let mb = saved.take(mb_id).ok_or_else(|| Error::DistributedError {
                        reason: format!("no saved forward for micro-batch {mb_id}"),
                    })?;
                    let grads = self.backward(client, mb_id, mb, loss_fn, &mut output)?;
                    output.grads.push(grads);
                }
            }
        }

        Ok(output)
    }

    fn forward(
        &mut self,
        mb_id: usize,
        inputs: &mut [Option<Tensor<R>>],
    ) -> Result<SavedMicroBatch<R>> {
        let rank = self.clock.stage_id();
        let (input, aux_in) = if self.role.is_first() {
            let tokens = inputs
                .get_mut(mb_id)
                .and_then(Option::take)
                .ok_or_else(|| Error::DistributedError {
                    reason: format!("micro-batch {mb_id} already consumed"),
                })?;
            (Var::new(tokens, false), None)
        } else {
            let (hidden, aux) =
                recv_relay::<R>(self.pp_comm.as_ref(), rank - 1, mb_id, false, &self.device)?;
            (Var::new(hidden, true), Some(Var::new(aux, true)))
        };

        let carried = match &aux_in {
            Some(aux) => CarriedState::AuxLoss(aux.clone()),
            None => CarriedState::None,
        };
        self.role.check_carried(&carried)?;
        let out = self.stage.forward(mb_id, input.clone(), carried)?;

        match (&out, self.role.is_last()) {
            (StageOutput::Final { .. }, true) => {}
            (StageOutput::Intermediate { hidden, aux_loss }, false) => {
                send_relay(
                    self.pp_comm.as_ref(),
                    hidden.tensor(),
                    aux_loss.tensor(),
                    rank + 1,
                    mb_id,
                    false,
                )?;
            }
            (_, is_last) => {
                return Err(Error::DistributedError {
                    reason: format!(
                        "stage {rank} returned the wrong output kind (last stage: {is_last})"
                    ),
                });
            }
        }
        tracing::debug!(stage = rank, micro_batch = mb_id, "forward done");

        Ok(SavedMicroBatch {
            input,
            aux_in,
            output: out,
        })
    }

    fn backward<C>(
        &mut self,
        client: &C,
        mb_id: usize,
        mb: SavedMicroBatch<R>,
        loss_fn: Option<&LossFn<'_, R>>,
        output: &mut PipelineOutput<R>,
    ) -> Result<GradStore<R>>
    where
        C: RuntimeClient<R> + TensorOps<R> + ScalarOps<R>,
        R::Client: TensorOps<R> + ScalarOps<R>,
    {
        let rank = self.clock.stage_id();
        let root = match (&mb.output, loss_fn) {
            (StageOutput::Final { logits, aux_loss, .. }, Some(loss_fn)) => {
                let loss = loss_fn(mb_id, logits, aux_loss)?;
                output.losses.push(scalar_value(&loss)?);
                output.aux_losses.push(scalar_value(aux_loss)?);
                loss
            }
            (StageOutput::Intermediate { hidden, aux_loss }, _) => {
                let (grad_hidden, grad_aux) =
                    recv_relay::<R>(self.pp_comm.as_ref(), rank + 1, mb_id, true, &self.device)?;
                surrogate_loss(client, hidden, &grad_hidden, aux_loss, &grad_aux)?
            }
            (StageOutput::Final { .. }, None) => {
                return Err(Error::DistributedError {
                    reason: "last stage requires loss_fn".to_string(),
                });
            }
        };

        let grads = backward(&root, client).map_err(Error::Numr)?;

        if !self.role.is_first() {
            let grad_hidden = grad_or_zeros(&grads, &mb.input);
            let grad_aux = match &mb.aux_in {
                Some(aux) => grad_or_zeros(&grads, aux),
                None => Tensor::<R>::zeros(&[1], DType::F32, &self.device),
            };
            send_relay(
                self.pp_comm.as_ref(),
                &grad_hidden,
                &grad_aux,
                rank - 1,
                mb_id,
                true,
            )?;
        }
        tracing::debug!(stage = rank, micro_batch = mb_id, "backward done");

        Ok(grads)
    }
}

/// `sum(hidden * grad_hidden) + aux * grad_aux`, whose gradient with respect
/// to each stage parameter equals the downstream gradient of the real loss.
fn surrogate_loss<R, C>(
    client: &C,
    hidden: &Var<R>,
    grad_hidden: &Tensor<R>,
    aux: &Var<R>,
    grad_aux: &Tensor<R>,
) -> Result<Var<R>>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + TensorOps<R>,
    R::Client: TensorOps<R>,
{
    let all_dims: Vec<usize> = (0..hidden.shape().len()).collect();
    let h = var_mul(hidden, &Var::new(grad_hidden.clone(), false), client).map_err(Error::Numr)?;
    let h = var_sum(&h, &all_dims, false, client).map_err(Error::Numr)?;

    let grad_aux = grad_aux.reshape(aux.shape()).map_err(Error::Numr)?;
    let a = var_mul(aux, &Var::new(grad_aux, false), client).map_err(Error::Numr)?;
    let aux_dims: Vec<usize> = (0..a.shape().len()).collect();
    let a = var_sum(&a, &aux_dims, false, client).map_err(Error::Numr)?;

    var_add(&h, &a, client).map_err(Error::Numr)
}

fn grad_or_zeros<R: Runtime<DType = DType>>(grads: &GradStore<R>, var: &Var<R>) -> Tensor<R> {
    grads.get(var.id()).cloned().unwrap_or_else(|| {
        Tensor::<R>::zeros(var.shape(), var.tensor().dtype(), var.tensor().device())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::autograd::var_reshape;
    use numr::runtime::NoOpCommunicator;
    use numr::runtime::cpu::{CpuClient, CpuRuntime};

    /// Multiplies its input by a trainable weight and reports `sum(weight)`
    /// as its aux loss.
    struct ScaleStage {
        client: CpuClient,
        weight: Var<CpuRuntime>,
    }

    impl AuxRelayStage<CpuRuntime> for ScaleStage {
        fn forward(
            &mut self,
            _micro_batch_id: usize,
            input: Var<CpuRuntime>,
            carried: CarriedState<CpuRuntime>,
        ) -> Result<StageOutput<CpuRuntime>> {
            let logits = var_mul(&input, &self.weight, &self.client).map_err(Error::Numr)?;
            let aux = var_sum(&self.weight, &[0], false, &self.client).map_err(Error::Numr)?;
            let mut aux = var_reshape(&aux, &[1]).map_err(Error::Numr)?;
            if let (_, Some(upstream)) = carried.into_parts() {
                aux = var_add(&aux, &upstream, &self.client).map_err(Error::Numr)?;
            }
            Ok(StageOutput::Final {
                logits,
                aux_loss: aux,
                cache: None,
            })
        }
    }

    fn sum_plus_aux(
        client: &CpuClient,
    ) -> impl Fn(usize, &Var<CpuRuntime>, &Var<CpuRuntime>) -> Result<Var<CpuRuntime>> + '_ {
        move |_mb_id, logits, aux| {
            let dims: Vec<usize> = (0..logits.shape().len()).collect();
            let s = var_sum(logits, &dims, false, client).map_err(Error::Numr)?;
            let s = var_reshape(&s, &[1]).map_err(Error::Numr)?;
            var_add(&s, aux, client).map_err(Error::Numr)
        }
    }

    fn weight(values: &[f32], device: &numr::runtime::cpu::CpuDevice) -> Var<CpuRuntime> {
        Var::new(
            Tensor::<CpuRuntime>::from_slice(values, &[values.len()], device),
            true,
        )
    }

    #[test]
    fn test_single_stage_losses_and_grads() {
        let (client, device) = cpu_setup();
        let w = weight(&[2.0, 2.0], &device);
        let stage = Box::new(ScaleStage {
            client: client.clone(),
            weight: w.clone(),
        });
        let mut schedule =
            Schedule1F1B::<CpuRuntime>::new(stage, 2, Arc::new(NoOpCommunicator), device.clone())
                .unwrap();
        assert_eq!(schedule.role(), StageRole::Only);

        let mb0 = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0], &[2], &device);
        let mb1 = Tensor::<CpuRuntime>::from_slice(&[3.0f32, 4.0], &[2], &device);
        let loss_fn = sum_plus_aux(&client);

        let out = schedule
            .run(&client, Some(vec![mb0, mb1]), Some(&loss_fn))
            .unwrap();

        // loss = sum(w * x) + sum(w)
        assert_eq!(out.losses.len(), 2);
        assert!((out.losses[0] - 10.0).abs() < 1e-5);
        assert!((out.losses[1] - 18.0).abs() < 1e-5);
        assert!((out.aux_losses[0] - 4.0).abs() < 1e-6);

        // d loss / d w = x + 1
        assert_eq!(out.grads[0].get(w.id()).unwrap().to_vec::<f32>(), vec![2.0, 3.0]);
        assert_eq!(out.grads[1].get(w.id()).unwrap().to_vec::<f32>(), vec![4.0, 5.0]);
    }

    #[test]
    fn test_missing_loss_fn_on_last_stage() {
        let (client, device) = cpu_setup();
        let stage = Box::new(ScaleStage {
            client: client.clone(),
            weight: weight(&[1.0], &device),
        });
        let mut schedule =
            Schedule1F1B::<CpuRuntime>::new(stage, 1, Arc::new(NoOpCommunicator), device.clone())
                .unwrap();
        let mb = Tensor::<CpuRuntime>::from_slice(&[1.0f32], &[1], &device);
        assert!(schedule.run(&client, Some(vec![mb]), None).is_err());
    }

    #[test]
    fn test_zero_micro_batches_rejected() {
        let (client, device) = cpu_setup();
        let stage = Box::new(ScaleStage {
            client,
            weight: weight(&[1.0], &device),
        });
        assert!(
            Schedule1F1B::<CpuRuntime>::new(stage, 0, Arc::new(NoOpCommunicator), device).is_err()
        );
    }

    #[test]
    fn test_surrogate_matches_downstream_gradient() {
        let (client, device) = cpu_setup();
        let x = Var::new(
            Tensor::<CpuRuntime>::from_slice(&[1.0f32, -2.0], &[2], &device),
            true,
        );
        let aux = Var::new(Tensor::<CpuRuntime>::from_slice(&[0.3f32], &[1], &device), true);
        let gh = Tensor::<CpuRuntime>::from_slice(&[0.5f32, 4.0], &[2], &device);
        let ga = Tensor::<CpuRuntime>::from_slice(&[0.01f32], &[1], &device);

        let s = surrogate_loss(&client, &x, &gh, &aux, &ga).unwrap();
        let grads = backward(&s, &client).unwrap();
        assert_eq!(grads.get(x.id()).unwrap().to_vec::<f32>(), vec![0.5, 4.0]);
        assert_eq!(grads.get(aux.id()).unwrap().to_vec::<f32>(), vec![0.01]);
    }
}
