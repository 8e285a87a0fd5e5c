//! Tensor-parallel loss combination
//!
//! The LM head leaves logits sharded along the vocabulary (`Shard(-1)`) while
//! labels are replicated. Cross entropy is computed without gathering the
//! logits: every rank contributes its shard's row maxima (all-gather), then its
//! partial sum-exp and target logit (all-reduce sum). The result is a summed
//! loss, which is then combined with the auxiliary loss through an op whose
//! gradients are pinned to `(g, coefficient * g)`.

use std::sync::Arc;

use crate::distributed::comm_utils::{all_gather_flat, all_reduce_tensor};
use crate::distributed::dtensor::{DTensor, Placement};
use crate::error::{Error, Result};
use crate::host::{float_tensor, read_floats, read_indices};
use numr::autograd::{GradFn, TensorId, Var};
use numr::dtype::DType;
use numr::runtime::{Communicator, ReduceOp, Runtime};
use numr::tensor::Tensor;

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// One rank's slice of the vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VocabShard {
    pub start: usize,
    pub size: usize,
}

impl VocabShard {
    /// Even split of `vocab_size` over `world_size` ranks.
    pub fn for_rank(vocab_size: usize, rank: usize, world_size: usize) -> Result<Self> {
        let world_size = world_size.max(1);
        if vocab_size % world_size != 0 {
            return Err(Error::incompatible(format!(
                "vocab_size ({vocab_size}) not divisible by tensor-parallel world size ({world_size})"
            )));
        }
        let size = vocab_size / world_size;
        Ok(Self {
            start: rank * size,
            size,
        })
    }

    pub fn end(&self) -> usize {
        self.start + self.size
    }

    fn local_index(&self, label: i64) -> Option<usize> {
        let label = usize::try_from(label).ok()?;
        (label >= self.start && label < self.start + self.size).then(|| label - self.start)
    }
}

/// Per-row maxima of one shard, `logits` laid out `[rows, shard.size]`.
pub(crate) fn shard_row_max(logits: &[f64], shard: VocabShard) -> Vec<f64> {
    logits
        .chunks(shard.size)
        .map(|row| row.iter().copied().fold(f64::NEG_INFINITY, f64::max))
        .collect()
}

/// Per-row `sum exp(x - max)` over the shard, and the shifted target logit when
/// the label falls inside the shard (zero otherwise).
pub(crate) fn shard_partials(
    logits: &[f64],
    shard: VocabShard,
    labels: &[i64],
    global_max: &[f64],
) -> (Vec<f64>, Vec<f64>) {
    let mut sum_exp = Vec::with_capacity(labels.len());
    let mut target = Vec::with_capacity(labels.len());
    for ((row, &label), &m) in logits.chunks(shard.size).zip(labels).zip(global_max) {
        sum_exp.push(row.iter().map(|&x| (x - m).exp()).sum());
        target.push(shard.local_index(label).map_or(0.0, |j| row[j] - m));
    }
    (sum_exp, target)
}

/// `log(sum_exp) - target` per row; ignored rows contribute nothing.
pub(crate) fn row_losses(sum_exp: &[f64], target: &[f64], labels: &[i64]) -> Vec<f64> {
    sum_exp
        .iter()
        .zip(target)
        .zip(labels)
        .map(|((&s, &t), &label)| if label == IGNORE_INDEX { 0.0 } else { s.ln() - t })
        .collect()
}

/// `softmax - onehot` on the shard, zero for ignored rows.
fn shard_grad_base(
    logits: &[f64],
    shard: VocabShard,
    labels: &[i64],
    global_max: &[f64],
    sum_exp: &[f64],
) -> Vec<f64> {
    let mut grad = Vec::with_capacity(logits.len());
    for (((row, &label), &m), &s) in logits.chunks(shard.size).zip(labels).zip(global_max).zip(sum_exp) {
        if label == IGNORE_INDEX {
            grad.extend(std::iter::repeat_n(0.0, row.len()));
            continue;
        }
        let hit = shard.local_index(label);
        grad.extend(
            row.iter()
                .enumerate()
                .map(|(j, &x)| (x - m).exp() / s - if Some(j) == hit { 1.0 } else { 0.0 }),
        );
    }
    grad
}

struct VocabParallelCrossEntropyBackward<R: Runtime> {
    input_id: [TensorId; 1],
    input_grad_fn: Option<Arc<dyn GradFn<R>>>,
    grad_base: Vec<f64>,
    logits_shape: Vec<usize>,
    logits_dtype: DType,
}

impl<R: Runtime<DType = DType>> GradFn<R> for VocabParallelCrossEntropyBackward<R> {
    fn backward(&self, grad_output: &Tensor<R>) -> numr::error::Result<Vec<Option<Tensor<R>>>> {
        let internal = |e: Error| numr::error::Error::Internal(format!("cross entropy backward: {e}"));
        let g = read_floats(grad_output, "grad_output")
            .map_err(internal)?
            .first()
            .copied()
            .unwrap_or(0.0);
        let scaled: Vec<f64> = self.grad_base.iter().map(|&x| g * x).collect();
        let grad = float_tensor::<R>(&scaled, &self.logits_shape, self.logits_dtype, grad_output.device())
            .map_err(internal)?;
        Ok(vec![Some(grad)])
    }

    fn backward_var(&self, grad_output: &Var<R>) -> numr::error::Result<Vec<Option<Var<R>>>> {
        let grads = self.backward(grad_output.tensor())?;
        Ok(grads
            .into_iter()
            .map(|g| g.map(|t| Var::new(t, false)))
            .collect())
    }

    fn inputs(&self) -> &[TensorId] {
        &self.input_id
    }

    fn input_grad_fns(&self) -> Vec<Option<Arc<dyn GradFn<R>>>> {
        vec![self.input_grad_fn.clone()]
    }

    fn saved_tensors(&self) -> &[Tensor<R>] {
        &[]
    }

    fn name(&self) -> &'static str {
        "VocabParallelCrossEntropyBackward"
    }
}

/// Summed cross entropy over vocab-sharded logits.
///
/// `logits`: this rank's `[..., vocab / world_size]` shard (F32 or F64).
/// `labels`: replicated `[...]` global token ids (I32 or I64), `IGNORE_INDEX` skips a row.
/// Returns a `[1]` loss identical on every rank.
pub fn vocab_parallel_cross_entropy<R: Runtime<DType = DType>>(
    logits: &Var<R>,
    labels: &Tensor<R>,
    comm: &dyn Communicator,
) -> Result<Var<R>> {
    let shape = logits.shape().to_vec();
    let shard_size = *shape.last().ok_or_else(|| Error::shape("logits must have a vocab dim"))?;
    let rows = logits.tensor().numel() / shard_size.max(1);
    if labels.numel() != rows {
        return Err(Error::shape(format!(
            "{} labels for {rows} logit rows",
            labels.numel()
        )));
    }
    let world_size = comm.world_size();
    let shard = VocabShard {
        start: comm.rank() * shard_size,
        size: shard_size,
    };
    let vocab = shard_size * world_size;

    let host_logits = read_floats(logits.tensor(), "logits")?;
    let host_labels = read_indices(labels, "labels")?;
    if let Some(&bad) = host_labels
        .iter()
        .find(|&&l| l != IGNORE_INDEX && (l < 0 || l as usize >= vocab))
    {
        return Err(Error::InvalidArgument {
            arg: "labels",
            reason: format!("label {bad} outside vocab of size {vocab}"),
        });
    }
    let device = logits.tensor().device();

    let mut global_max = shard_row_max(&host_logits, shard);
    if world_size > 1 {
        let local = float_tensor::<R>(&global_max, &[rows], DType::F64, device)?;
        let gathered = read_floats(&all_gather_flat(comm, &local)?, "row_max")?;
        for per_rank in gathered.chunks(rows) {
            for (m, &x) in global_max.iter_mut().zip(per_rank) {
                *m = m.max(x);
            }
        }
    }

    let (mut sum_exp, mut target) = shard_partials(&host_logits, shard, &host_labels, &global_max);
    if world_size > 1 {
        let packed: Vec<f64> = sum_exp.iter().chain(&target).copied().collect();
        let reduced = float_tensor::<R>(&packed, &[2 * rows], DType::F64, device)?;
        all_reduce_tensor(comm, &reduced, ReduceOp::Sum)?;
        let reduced = read_floats(&reduced, "partials")?;
        sum_exp.copy_from_slice(&reduced[..rows]);
        target.copy_from_slice(&reduced[rows..]);
    }

    let total: f64 = row_losses(&sum_exp, &target, &host_labels).iter().sum();
    tracing::trace!(rows, vocab, rank = comm.rank(), total, "vocab-parallel cross entropy");

    let dtype = logits.tensor().dtype();
    let out = float_tensor::<R>(&[total], &[1], dtype, device)?;
    if !logits.requires_grad() {
        return Ok(Var::new(out, false));
    }
    let grad_fn = VocabParallelCrossEntropyBackward {
        input_id: [logits.id()],
        input_grad_fn: logits.grad_fn().cloned(),
        grad_base: shard_grad_base(&host_logits, shard, &host_labels, &global_max, &sum_exp),
        logits_shape: shape,
        logits_dtype: dtype,
    };
    Ok(Var::from_op(out, Arc::new(grad_fn)))
}

struct CombineLossesBackward<R: Runtime> {
    input_ids: [TensorId; 2],
    input_grad_fns: [Option<Arc<dyn GradFn<R>>>; 2],
    coefficient: f64,
    aux_shape: Vec<usize>,
    aux_dtype: DType,
}

impl<R: Runtime<DType = DType>> GradFn<R> for CombineLossesBackward<R> {
    fn backward(&self, grad_output: &Tensor<R>) -> numr::error::Result<Vec<Option<Tensor<R>>>> {
        let internal = |e: Error| numr::error::Error::Internal(format!("combine_losses backward: {e}"));
        let g = read_floats(grad_output, "grad_output").map_err(internal)?;
        let g_aux: Vec<f64> = g.iter().map(|&x| self.coefficient * x).collect();
        let d_aux = float_tensor::<R>(&g_aux, &self.aux_shape, self.aux_dtype, grad_output.device())
            .map_err(internal)?;
        Ok(vec![Some(grad_output.clone()), Some(d_aux)])
    }

    fn backward_var(&self, grad_output: &Var<R>) -> numr::error::Result<Vec<Option<Var<R>>>> {
        let grads = self.backward(grad_output.tensor())?;
        Ok(grads
            .into_iter()
            .map(|g| g.map(|t| Var::new(t, false)))
            .collect())
    }

    fn inputs(&self) -> &[TensorId] {
        &self.input_ids
    }

    fn input_grad_fns(&self) -> Vec<Option<Arc<dyn GradFn<R>>>> {
        self.input_grad_fns.to_vec()
    }

    fn saved_tensors(&self) -> &[Tensor<R>] {
        &[]
    }

    fn name(&self) -> &'static str {
        "CombineLossesBackward"
    }
}

/// `lm_loss + coefficient * aux_loss` with gradients `(g, coefficient * g)`.
///
/// Both inputs are single-element `[1]` losses. With `coefficient == 0` the
/// forward value is exactly `lm_loss` and the aux gradient is zero.
pub fn combine_losses<R: Runtime<DType = DType>>(
    lm_loss: &Var<R>,
    aux_loss: &Var<R>,
    coefficient: f64,
) -> Result<Var<R>> {
    for (name, v) in [("lm_loss", lm_loss), ("aux_loss", aux_loss)] {
        if v.shape() != [1] {
            return Err(Error::shape(format!(
                "{name} must have shape [1], got {:?}",
                v.shape()
            )));
        }
    }
    let lm = read_floats(lm_loss.tensor(), "lm_loss")?[0];
    let total = if coefficient == 0.0 {
        lm
    } else {
        lm + coefficient * read_floats(aux_loss.tensor(), "aux_loss")?[0]
    };
    let out = float_tensor::<R>(&[total], &[1], lm_loss.tensor().dtype(), lm_loss.tensor().device())?;

    if !(lm_loss.requires_grad() || aux_loss.requires_grad()) {
        return Ok(Var::new(out, false));
    }
    let grad_fn = CombineLossesBackward {
        input_ids: [lm_loss.id(), aux_loss.id()],
        input_grad_fns: [lm_loss.grad_fn().cloned(), aux_loss.grad_fn().cloned()],
        coefficient,
        aux_shape: aux_loss.shape().to_vec(),
        aux_dtype: aux_loss.tensor().dtype(),
    };
    Ok(Var::from_op(out, Arc::new(grad_fn)))
}

/// [`combine_losses`] on the TP mesh. Both losses must be `Replicate`; the
/// total is too.
pub fn combine_replicated_losses<R: Runtime<DType = DType>>(
    lm_loss: &DTensor<R>,
    aux_loss: &DTensor<R>,
    coefficient: f64,
) -> Result<DTensor<R>> {
    for (name, loss) in [("lm_loss", lm_loss), ("aux_loss", aux_loss)] {
        if loss.placement() != Placement::Replicate {
            return Err(Error::DistributedError {
                reason: format!("{name} must be Replicate, got {:?}", loss.placement()),
            });
        }
    }
    let total = combine_losses(lm_loss.to_local(), aux_loss.to_local(), coefficient)?;
    DTensor::from_local(total, Placement::Replicate, lm_loss.comm().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::autograd::backward;
    use crate::distributed::in_process::run_group;
    use numr::runtime::NoOpCommunicator;
    use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};

    fn reference_ce(logits: &[f64], vocab: usize, labels: &[i64]) -> f64 {
        logits
            .chunks(vocab)
            .zip(labels)
            .filter(|(_, l)| **l != IGNORE_INDEX)
            .map(|(row, &l)| {
                let m = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let lse = m + row.iter().map(|x| (x - m).exp()).sum::<f64>().ln();
                lse - row[l as usize]
            })
            .sum()
    }

    /// Columns `[rank * size, (rank + 1) * size)` of every row.
    fn vocab_columns(full: &[f64], vocab: usize, rank: usize, size: usize) -> Vec<f64> {
        full.chunks(vocab)
            .flat_map(|row| row[rank * size..(rank + 1) * size].to_vec())
            .collect()
    }

    fn logits_fixture() -> (Vec<f64>, usize, Vec<i64>) {
        let vocab = 8;
        let logits: Vec<f64> = (0..4 * vocab)
            .map(|i| ((i as f64) * 0.917).sin() * 3.0)
            .collect();
        (logits, vocab, vec![3, 7, IGNORE_INDEX, 0])
    }

    fn var_f64(data: &[f64], shape: &[usize], device: &CpuDevice, grad: bool) -> Var<CpuRuntime> {
        Var::new(Tensor::<CpuRuntime>::from_slice(data, shape, device), grad)
    }

    #[test]
    fn test_sharded_matches_unsharded_across_ranks() {
        let (client, device) = cpu_setup();
        let (logits, vocab, labels) = logits_fixture();
        let rows = labels.len();
        let expected = reference_ce(&logits, vocab, &labels);

        let full = var_f64(&logits, &[rows, vocab], &device, true);
        let y = Tensor::<CpuRuntime>::from_slice(&labels, &[rows], &device);
        let loss = vocab_parallel_cross_entropy(&full, &y, &NoOpCommunicator).unwrap();
        let full_grad = backward(&loss, &client).unwrap().get(full.id()).unwrap().to_vec::<f64>();

        for world in [2, 4] {
            let size = vocab / world;
            let per_rank = run_group(world, |comm| {
                let device = CpuDevice::new();
                let client = CpuClient::new(device.clone());
                let local = vocab_columns(&logits, vocab, comm.rank(), size);
                let x = var_f64(&local, &[rows, size], &device, true);
                let y = Tensor::<CpuRuntime>::from_slice(&labels, &[rows], &device);
                let loss = vocab_parallel_cross_entropy(&x, &y, comm.as_ref()).unwrap();
                let grad = backward(&loss, &client).unwrap().get(x.id()).unwrap().to_vec::<f64>();
                (loss.tensor().to_vec::<f64>()[0], grad)
            });

            for (rank, (value, grad)) in per_rank.iter().enumerate() {
                assert!((value - expected).abs() < 1e-10, "world {world} rank {rank}: {value} vs {expected}");
                let want = vocab_columns(&full_grad, vocab, rank, size);
                for (a, b) in grad.iter().zip(&want) {
                    assert!((a - b).abs() < 1e-12, "world {world} rank {rank}: grad {a} vs {b}");
                }
            }
        }
    }

    #[test]
    fn test_single_rank_forward_and_gradient() {
        let (client, device) = cpu_setup();
        let (logits, vocab, labels) = logits_fixture();
        let x = var_f64(&logits, &[2, 2, vocab], &device, true);
        let y = Tensor::<CpuRuntime>::from_slice(&labels, &[2, 2], &device);

        let loss = vocab_parallel_cross_entropy(&x, &y, &NoOpCommunicator).unwrap();
        assert_eq!(loss.shape(), &[1]);
        let value = loss.tensor().to_vec::<f64>()[0];
        assert!((value - reference_ce(&logits, vocab, &labels)).abs() < 1e-10);

        let grads = backward(&loss, &client).unwrap();
        let g = grads.get(x.id()).unwrap().to_vec::<f64>();
        for (r, row) in g.chunks(vocab).enumerate() {
            let sum: f64 = row.iter().sum();
            assert!(sum.abs() < 1e-10, "row {r} grad sums to {sum}");
        }
        // ignored row has no gradient
        assert!(g[2 * vocab..3 * vocab].iter().all(|&v| v == 0.0));
        // target entry is p - 1 < 0
        assert!(g[3] < 0.0);
    }

    #[test]
    fn test_rejects_out_of_vocab_label() {
        let (_client, device) = cpu_setup();
        let x = var_f64(&[0.0; 4], &[1, 4], &device, false);
        let y = Tensor::<CpuRuntime>::from_slice(&[4i64], &[1], &device);
        assert!(vocab_parallel_cross_entropy(&x, &y, &NoOpCommunicator).is_err());
    }

    #[test]
    fn test_combine_pins_gradients() {
        let (client, device) = cpu_setup();
        let lm = var_f64(&[2.5], &[1], &device, true);
        let aux = var_f64(&[0.75], &[1], &device, true);
        let total = combine_losses(&lm, &aux, 0.01).unwrap();
        assert!((total.tensor().to_vec::<f64>()[0] - 2.5075).abs() < 1e-12);

        let grads = backward(&total, &client).unwrap();
        assert_eq!(grads.get(lm.id()).unwrap().to_vec::<f64>(), vec![1.0]);
        let g_aux = grads.get(aux.id()).unwrap().to_vec::<f64>()[0];
        assert!((g_aux - 0.01).abs() < 1e-15);
    }

    #[test]
    fn test_zero_coefficient_is_exactly_lm_loss() {
        let (client, device) = cpu_setup();
        let lm = var_f64(&[1.2345678901234567], &[1], &device, true);
        let aux = var_f64(&[f64::INFINITY], &[1], &device, true);
        let total = combine_losses(&lm, &aux, 0.0).unwrap();
        assert_eq!(total.tensor().to_vec::<f64>()[0], 1.2345678901234567);

        let grads = backward(&total, &client).unwrap();
        assert_eq!(grads.get(aux.id()).unwrap().to_vec::<f64>(), vec![0.0]);
    }

    #[test]
    fn test_combine_rejects_non_scalar() {
        let (_client, device) = cpu_setup();
        let lm = var_f64(&[1.0, 2.0], &[2], &device, false);
        let aux = var_f64(&[0.0], &[1], &device, false);
        assert!(combine_losses(&lm, &aux, 1.0).is_err());
    }

    #[test]
    fn test_replicated_combine_keeps_placement() {
        let (client, device) = cpu_setup();
        let comm: Arc<dyn Communicator> = Arc::new(NoOpCommunicator);
        let lm = var_f64(&[2.0], &[1], &device, true);
        let aux = var_f64(&[0.5], &[1], &device, true);
        let total = combine_replicated_losses(
            &DTensor::from_local(lm.clone(), Placement::Replicate, comm.clone()).unwrap(),
            &DTensor::from_local(aux.clone(), Placement::Replicate, comm).unwrap(),
            0.1,
        )
        .unwrap();
        assert_eq!(total.placement(), Placement::Replicate);
        assert!((total.to_local().tensor().to_vec::<f64>()[0] - 2.05).abs() < 1e-12);

        let grads = backward(total.to_local(), &client).unwrap();
        assert!((grads.get(aux.id()).unwrap().to_vec::<f64>()[0] - 0.1).abs() < 1e-15);
    }

    #[test]
    fn test_replicated_combine_rejects_sharded_loss() {
        let (_client, device) = cpu_setup();
        let comm: Arc<dyn Communicator> = Arc::new(NoOpCommunicator);
        let lm = DTensor::from_local(var_f64(&[2.0], &[1], &device, false), Placement::Shard(-1), comm.clone()).unwrap();
        let aux = DTensor::from_local(var_f64(&[0.5], &[1], &device, false), Placement::Replicate, comm).unwrap();
        assert!(combine_replicated_losses(&lm, &aux, 0.1).is_err());
        assert!(combine_replicated_losses(&aux, &lm, 0.1).is_err());
    }
}
