//! End-to-end pretraining step from a YAML model config.

use std::sync::Arc;

use numr::autograd::backward;
use numr::runtime::NoOpCommunicator;
use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
use sbmoe::error::Error;
use sbmoe::model::{CausalLm, ModelConfig, StageLayout};
use sbmoe::nn::scalar_value;
use sbmoe::trainer::{PretrainingConfig, PretrainingModel};
use sbmoe::{DType, Tensor};

const MODEL_YAML: &str = r#"
vocab_size: 20
hidden_size: 8
num_layers: 2
num_heads: 4
num_kv_heads: 2
intermediate_size: 16
position_embedding: learned_absolute
max_position_embeddings: 16
sb_remainder: true
m_width: 2.0
initializer_range: 0.1
router_aux_loss_coef: 0.01
moe:
  num_experts: 4
  top_k: 2
"#;

fn setup() -> (CpuClient, CpuDevice) {
    let device = CpuDevice::new();
    let client = CpuClient::new(device.clone());
    (client, device)
}

fn load_config() -> ModelConfig {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.yml");
    std::fs::write(&path, MODEL_YAML).unwrap();
    ModelConfig::load_yaml(&path).unwrap()
}

fn model(cfg: &ModelConfig, options: PretrainingConfig, device: &CpuDevice) -> PretrainingModel<CpuRuntime> {
    let lm = CausalLm::new(cfg, StageLayout::single(), Arc::new(NoOpCommunicator), DType::F32, device).unwrap();
    PretrainingModel::new(lm, options).unwrap()
}

#[test]
fn test_document_reset_step_backpropagates() {
    let (client, device) = setup();
    let cfg = load_config();
    let options = PretrainingConfig::default()
        .with_padding_free(true)
        .with_reset_attention_mask(true)
        .with_reset_position_ids(true)
        .with_eos_token_id(0);
    let pretraining = model(&cfg, options, &device);

    #[rustfmt::skip]
    let tokens = Tensor::<CpuRuntime>::from_slice(
        &[
            4i64, 7, 0, 3, 9, 11,
            0, 5, 5, 8, 0, 2,
        ],
        &[2, 6],
        &device,
    );
    let out = pretraining.forward(&client, &tokens).unwrap();
    let lm = scalar_value(out.lm_loss.as_ref().unwrap()).unwrap();
    let aux = scalar_value(out.aux_loss.as_ref().unwrap()).unwrap();
    let total = scalar_value(&out.loss).unwrap();
    assert!(lm.is_finite() && lm > 0.0);
    assert!((total - (lm + 0.01 * aux)).abs() < 1e-4);

    let grads = backward(&out.loss, &client).unwrap();
    let embedding = pretraining.model().embedding().unwrap().weight();
    let g = grads.get(embedding.id()).unwrap();
    assert_eq!(g.shape(), &[20, 8]);
    assert!(g.to_vec::<f32>().iter().any(|&x| x != 0.0));
}

#[test]
fn test_pipelined_model_rejects_resets() {
    let (_client, device) = setup();
    let cfg = load_config();
    let lm = CausalLm::<CpuRuntime>::new(
        &cfg,
        StageLayout::new(0, 2).unwrap(),
        Arc::new(NoOpCommunicator),
        DType::F32,
        &device,
    )
    .unwrap();
    let options = PretrainingConfig::default()
        .with_padding_free(true)
        .with_reset_attention_mask(true)
        .with_eos_token_id(0);
    assert!(matches!(
        PretrainingModel::new(lm, options),
        Err(Error::IncompatibleConfig { .. })
    ));
}

#[test]
fn test_position_overflow_is_reported() {
    let (client, device) = setup();
    let cfg = load_config();
    let pretraining = model(&cfg, PretrainingConfig::default(), &device);
    let tokens = Tensor::<CpuRuntime>::from_slice(&[1i64; 18], &[1, 18], &device);
    assert!(matches!(
        pretraining.forward(&client, &tokens),
        Err(Error::InvalidArgument { arg: "position_ids", .. })
    ));
}
