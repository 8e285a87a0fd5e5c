//! Vocab-parallel loss and the aux-loss combiner on a single TP rank.

use std::sync::Arc;

use numr::autograd::{Var, backward};
use numr::runtime::NoOpCommunicator;
use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
use sbmoe::Tensor;
use sbmoe::distributed::{DTensor, IGNORE_INDEX, Placement, combine_losses, vocab_parallel_cross_entropy};

fn setup() -> (CpuClient, CpuDevice) {
    let device = CpuDevice::new();
    let client = CpuClient::new(device.clone());
    (client, device)
}

fn scalar(device: &CpuDevice, value: f64, requires_grad: bool) -> Var<CpuRuntime> {
    Var::new(Tensor::<CpuRuntime>::from_slice(&[value], &[1], device), requires_grad)
}

#[test]
fn test_cross_entropy_sums_rows_and_skips_ignored() {
    let (_client, device) = setup();
    #[rustfmt::skip]
    let logits = [
        1.0f64, 2.0, 3.0,
        0.0, 0.0, 0.0,
        5.0, 1.0, 1.0,
    ];
    let logits = Var::new(Tensor::<CpuRuntime>::from_slice(&logits, &[3, 3], &device), false);
    let labels = Tensor::<CpuRuntime>::from_slice(&[2i64, IGNORE_INDEX, 0], &[3], &device);

    let loss = vocab_parallel_cross_entropy(&logits, &labels, &NoOpCommunicator).unwrap();
    let row0 = (1f64.exp() + 2f64.exp() + 3f64.exp()).ln() - 3.0;
    let row2 = (5f64.exp() + 2.0 * 1f64.exp()).ln() - 5.0;
    assert!((loss.tensor().to_vec::<f64>()[0] - (row0 + row2)).abs() < 1e-12);
}

#[test]
fn test_cross_entropy_gradient_is_softmax_minus_onehot() {
    let (client, device) = setup();
    let logits = Var::new(Tensor::<CpuRuntime>::from_slice(&[0.0f64, 0.0], &[1, 2], &device), true);
    let labels = Tensor::<CpuRuntime>::from_slice(&[1i64], &[1], &device);
    let loss = vocab_parallel_cross_entropy(&logits, &labels, &NoOpCommunicator).unwrap();
    let grads = backward(&loss, &client).unwrap();
    let g = grads.get(logits.id()).unwrap().to_vec::<f64>();
    assert!((g[0] - 0.5).abs() < 1e-12 && (g[1] + 0.5).abs() < 1e-12);
}

#[test]
fn test_combine_with_zero_coefficient() {
    let (client, device) = setup();
    let lm = scalar(&device, 3.25, true);
    let aux = scalar(&device, 7.0, true);

    let total = combine_losses(&lm, &aux, 0.0).unwrap();
    assert_eq!(total.tensor().to_vec::<f64>(), vec![3.25]);

    let grads = backward(&total, &client).unwrap();
    assert_eq!(grads.get(lm.id()).unwrap().to_vec::<f64>(), vec![1.0]);
    assert_eq!(grads.get(aux.id()).unwrap().to_vec::<f64>(), vec![0.0]);
}

#[test]
fn test_combine_scales_aux_gradient() {
    let (client, device) = setup();
    let lm = scalar(&device, 1.0, true);
    let aux = scalar(&device, 2.0, true);
    let total = combine_losses(&lm, &aux, 0.01).unwrap();
    assert!((total.tensor().to_vec::<f64>()[0] - 1.02).abs() < 1e-12);

    let grads = backward(&total, &client).unwrap();
    assert!((grads.get(aux.id()).unwrap().to_vec::<f64>()[0] - 0.01).abs() < 1e-15);
}

#[test]
fn test_sharded_logits_gather_on_one_rank() {
    let (_client, device) = setup();
    let local = Var::new(
        Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2], &device),
        false,
    );
    let sharded = DTensor::from_local(local, Placement::Shard(-1), Arc::new(NoOpCommunicator)).unwrap();
    assert_eq!(sharded.global_shape().unwrap(), vec![2, 2]);

    let full = sharded.redistribute(Placement::Replicate).unwrap();
    assert_eq!(full.placement(), Placement::Replicate);
    assert_eq!(full.to_local().tensor().to_vec::<f32>(), vec![1.0, 2.0, 3.0, 4.0]);
}
