//! MoE layer: router plus a bank of expert MLPs

use crate::error::{Error, Result};
use crate::host::{float_tensor, read_indices};
use crate::nn::activation::Activation;
use crate::nn::init::ParamInit;
use crate::nn::mlp::Mlp;
use crate::nn::moe::router::{MoeConfig, MoeRouter, RouterOutput};
use crate::nn::with_prefix;
use numr::autograd::{Var, var_add, var_mul, var_sum};
use numr::dtype::DType;
use numr::ops::{ActivationOps, IndexingOps, ReduceOps, ScalarOps, SortingOps, TensorOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};

pub struct MoeOutput<R: Runtime> {
    /// `[num_tokens, hidden_size]`
    pub output: Var<R>,
    /// Router load-balancing loss, `[1]`
    pub aux_loss: Var<R>,
}

pub struct MoeLayer<R: Runtime> {
    router: MoeRouter<R>,
    experts: Vec<Mlp<R>>,
}

impl<R: Runtime> MoeLayer<R> {
    pub fn new(router: MoeRouter<R>, experts: Vec<Mlp<R>>) -> Result<Self> {
        let expected = router.config().num_experts;
        if experts.len() != expected {
            return Err(Error::ModelError {
                reason: format!("router expects {expected} experts, got {}", experts.len()),
            });
        }
        Ok(Self { router, experts })
    }

    pub fn router(&self) -> &MoeRouter<R> {
        &self.router
    }

    pub fn experts(&self) -> &[Mlp<R>] {
        &self.experts
    }

    pub fn named_parameters(&self) -> Vec<(String, &Var<R>)> {
        let mut params: Vec<_> = with_prefix("router.gate", self.router.gate().named_parameters()).collect();
        for (e, expert) in self.experts.iter().enumerate() {
            params.extend(with_prefix(&format!("experts.{e}"), expert.named_parameters()));
        }
        params
    }
}

impl<R: Runtime<DType = DType>> MoeLayer<R> {
    pub fn init(
        init: &mut ParamInit<R>,
        config: MoeConfig,
        hidden_size: usize,
        intermediate_size: usize,
        activation: Activation,
        std: f64,
        num_layers: usize,
    ) -> Result<Self> {
        let router = MoeRouter::init(init, config, hidden_size, std)?;
        let experts = (0..config.num_experts)
            .map(|_| Mlp::init(init, hidden_size, intermediate_size, activation, std, num_layers))
            .collect::<Result<Vec<_>>>()?;
        Self::new(router, experts)
    }

    /// `x`: `[num_tokens, hidden_size]`
    ///
    /// Experts run over the whole batch and are masked by the routing
    /// decision; experts no token picked are skipped.
    pub fn forward<C>(&self, client: &C, x: &Var<R>) -> Result<MoeOutput<R>>
    where
        C: RuntimeClient<R>
            + TensorOps<R>
            + ScalarOps<R>
            + ReduceOps<R>
            + ActivationOps<R>
            + UnaryOps<R>
            + SortingOps<R>
            + IndexingOps<R>,
        R::Client: TensorOps<R>
            + ScalarOps<R>
            + ReduceOps<R>
            + ActivationOps<R>
            + UnaryOps<R>
            + IndexingOps<R>,
    {
        let num_tokens = x.shape()[0];
        let top_k = self.router.config().top_k;
        let RouterOutput {
            weights,
            indices,
            aux_loss,
        } = self.router.route(client, x)?;
        let picks = read_indices(&indices, "indices")?;

        let mut output: Option<Var<R>> = None;
        for (expert_id, expert) in self.experts.iter().enumerate() {
            let mask: Vec<f64> = picks
                .iter()
                .map(|&e| if e == expert_id as i64 { 1.0 } else { 0.0 })
                .collect();
            if !mask.contains(&1.0) {
                continue;
            }
            let mask = float_tensor::<R>(&mask, &[num_tokens, top_k], weights.tensor().dtype(), x.tensor().device())?;

            // [num_tokens, 1] weight of this expert per token, zero when unrouted
            let gate = var_mul(&weights, &Var::new(mask, false), client)
                .and_then(|g| var_sum(&g, &[1], true, client))
                .map_err(Error::Numr)?;
            let expert_out = expert.forward(client, x)?;
            let contribution = var_mul(&expert_out, &gate, client).map_err(Error::Numr)?;

            output = Some(match output {
                Some(acc) => var_add(&acc, &contribution, client).map_err(Error::Numr)?,
                None => contribution,
            });
        }

        let output = output.ok_or_else(|| Error::shape("MoE layer called with no tokens"))?;
        tracing::trace!(num_tokens, top_k, "moe layer routed");
        Ok(MoeOutput { output, aux_loss })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::linear::Linear;
    use crate::test_utils::cpu_setup;
    use numr::autograd::backward;
    use numr::runtime::cpu::CpuRuntime;
    use numr::tensor::Tensor;

    fn scaled_identity_expert(scale: f32, device: &numr::runtime::cpu::CpuDevice) -> Mlp<CpuRuntime> {
        // down(silu(scale * x))
        let up = Linear::new(
            Tensor::<CpuRuntime>::from_slice(&[scale, 0.0, 0.0, scale], &[2, 2], device),
            None,
            false,
        );
        let down = Linear::new(
            Tensor::<CpuRuntime>::from_slice(&[1.0f32, 0.0, 0.0, 1.0], &[2, 2], device),
            None,
            false,
        );
        Mlp::new(up, None, down, Activation::Silu).unwrap()
    }

    #[test]
    fn test_top1_output_is_the_chosen_expert() {
        let (client, device) = cpu_setup();
        // gate logits = x, so expert 0 wins when x0 > x1
        let gate = Linear::new(
            Tensor::<CpuRuntime>::from_slice(&[1.0f32, 0.0, 0.0, 1.0], &[2, 2], &device),
            None,
            false,
        );
        let router = MoeRouter::new(gate, MoeConfig { num_experts: 2, top_k: 1 }).unwrap();
        let experts = vec![scaled_identity_expert(1.0, &device), scaled_identity_expert(2.0, &device)];
        let layer = MoeLayer::new(router, experts).unwrap();

        let x = Var::new(Tensor::<CpuRuntime>::from_slice(&[2.0f32, 1.0, 0.0, 3.0], &[2, 2], &device), false);
        let out = layer.forward(&client, &x).unwrap().output.tensor().to_vec::<f32>();

        let silu = |v: f32| v / (1.0 + (-v).exp());
        let expected = [silu(2.0), silu(1.0), silu(0.0), silu(6.0)];
        for (a, b) in out.iter().zip(expected) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn test_expert_count_must_match_router() {
        let (_client, device) = cpu_setup();
        let gate = Linear::new(Tensor::<CpuRuntime>::zeros(&[2, 2], DType::F32, &device), None, false);
        let router = MoeRouter::new(gate, MoeConfig { num_experts: 2, top_k: 1 }).unwrap();
        assert!(MoeLayer::new(router, vec![scaled_identity_expert(1.0, &device)]).is_err());
    }

    #[test]
    fn test_gradients_reach_router_and_experts() {
        let (client, device) = cpu_setup();
        let mut init = ParamInit::<CpuRuntime>::new(9, DType::F32, &device);
        let layer = MoeLayer::init(
            &mut init,
            MoeConfig { num_experts: 3, top_k: 2 },
            4,
            6,
            Activation::Swiglu,
            0.3,
            1,
        )
        .unwrap();
        let x = Var::new(
            Tensor::<CpuRuntime>::from_slice(
                &[0.5f32, -0.1, 0.3, 0.8, -0.6, 0.2, 0.9, -0.4, 0.1, 0.1, -0.2, 0.7],
                &[3, 4],
                &device,
            ),
            false,
        );
        let out = layer.forward(&client, &x).unwrap();
        let loss = numr::autograd::var_sum(&out.output, &[0, 1], false, &client).unwrap();
        let grads = backward(&loss, &client).unwrap();

        assert!(grads.get(layer.router().gate().weight().id()).is_some());
        let touched = layer
            .experts()
            .iter()
            .filter(|e| grads.get(e.down().weight().id()).is_some())
            .count();
        assert!(touched >= 1);
    }
}
