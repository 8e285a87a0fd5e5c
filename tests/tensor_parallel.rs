//! Tensor-parallel training step on an in-process TP group.
//!
//! Every rank of a TP group must report the loss of the unsharded model, and
//! the trunk gradients must equal the single-rank ones. Vocab-sized tables
//! hold their rank's rows of the single-rank gradient.

use std::collections::HashMap;
use std::sync::Arc;

use numr::autograd::{GradStore, backward};
use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
use numr::runtime::{Communicator, NoOpCommunicator};
use sbmoe::distributed::run_group;
use sbmoe::model::{CausalLm, ModelConfig, StageLayout};
use sbmoe::nn::scalar_value;
use sbmoe::trainer::{PretrainingConfig, PretrainingModel};
use sbmoe::{DType, Tensor};

const HIDDEN: usize = 8;
const VOCAB: usize = 16;
const TOKENS: [i64; 10] = [4, 1, 7, 7, 2, 9, 0, 3, 15, 6];

fn config() -> ModelConfig {
    serde_yaml::from_str(
        r#"
vocab_size: 16
hidden_size: 8
num_layers: 4
num_heads: 2
intermediate_size: 16
initializer_range: 0.2
init_seed: 5
router_aux_loss_coef: 0.1
moe:
  num_experts: 4
  top_k: 2
"#,
    )
    .unwrap()
}

fn named_grads(model: &CausalLm<CpuRuntime>, grads: &GradStore<CpuRuntime>) -> HashMap<String, Vec<f32>> {
    model
        .named_parameters()
        .into_iter()
        .filter_map(|(name, p)| grads.get(p.id()).map(|g| (name, g.to_vec::<f32>())))
        .collect()
}

/// One pretraining step on `tokens` (`[2, 5]`): loss and named gradients.
fn train_step(cfg: &ModelConfig, tokens: &[i64], tp_comm: Arc<dyn Communicator>) -> (f64, HashMap<String, Vec<f32>>) {
    let device = CpuDevice::new();
    let client = CpuClient::new(device.clone());
    let lm = CausalLm::new(cfg, StageLayout::single(), tp_comm, DType::F32, &device).unwrap();
    let model = PretrainingModel::new(lm, PretrainingConfig::default()).unwrap();
    let tokens = Tensor::<CpuRuntime>::from_slice(tokens, &[2, 5], &device);

    let out = model.forward(&client, &tokens).unwrap();
    let grads = backward(&out.loss, &client).unwrap();
    (scalar_value(&out.loss).unwrap(), named_grads(model.model(), &grads))
}

fn assert_close(name: &str, got: &[f32], want: &[f32]) {
    assert_eq!(got.len(), want.len(), "{name}: length");
    for (a, b) in got.iter().zip(want) {
        assert!((a - b).abs() <= 1e-4 * b.abs().max(1.0), "{name}: {a} vs {b}");
    }
}

#[test]
fn test_tp_group_matches_single_rank_step() {
    let cfg = config();
    let (want_loss, want_grads) = train_step(&cfg, &TOKENS, Arc::new(NoOpCommunicator));
    assert!(want_grads.contains_key("h.0.attn.q_proj.weight"));
    assert!(want_grads.contains_key("lm_head.weight"));

    for tp in [2, 4] {
        let rows = VOCAB / tp * HIDDEN;
        let per_rank = run_group(tp, |comm| {
            // Only rank 0's block counts; the step broadcasts it before the shift
            let tokens = if comm.rank() == 0 { TOKENS.to_vec() } else { vec![0; TOKENS.len()] };
            train_step(&cfg, &tokens, comm)
        });

        for (rank, (loss, grads)) in per_rank.iter().enumerate() {
            assert!(
                (loss - want_loss).abs() <= 1e-4 * want_loss.abs().max(1.0),
                "tp {tp} rank {rank}: loss {loss} vs {want_loss}"
            );
            assert_eq!(grads.len(), want_grads.len(), "tp {tp} rank {rank}: gradient set");
            for (name, want) in &want_grads {
                let got = &grads[name];
                let label = format!("tp {tp} rank {rank} {name}");
                if name == "wte.weight" || name == "lm_head.weight" {
                    assert_close(&label, got, &want[rank * rows..(rank + 1) * rows]);
                } else {
                    assert_close(&label, got, want);
                }
            }
        }
    }
}
