//! Sharded tensor adapter
//!
//! A [`DTensor`] pairs a local `Var` with its [`Placement`] along one mesh axis
//! (the tensor-parallel communicator). Redistribution is a pure layout change
//! plus communication, and is differentiable:
//!
//! - `Shard(d) -> Replicate`: all-gather along `d`; backward keeps this rank's slice
//! - `Replicate -> Shard(d)`: narrow to this rank's slice; backward all-gathers
//!
//! [`var_copy_to_tp_region`] marks where a replicated activation enters a
//! vocab-sharded op: identity forward, all-reduce sum of the gradient backward.

use std::sync::Arc;

use crate::distributed::comm_utils::{all_gather_flat, all_reduce_tensor};
use crate::error::{Error, Result};
use crate::host::{float_tensor, read_floats};
use numr::autograd::{GradFn, TensorId, Var};
use numr::dtype::DType;
use numr::ops::ShapeOps;
use numr::runtime::{Communicator, ReduceOp, Runtime};
use numr::tensor::Tensor;

/// How a logical tensor is laid out across the ranks of a mesh axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Every rank holds the full tensor
    Replicate,
    /// Rank `r` holds the `r`-th equal slice along the dim (negative dims count from the end)
    Shard(isize),
}

/// Local tensor plus its placement on a communicator.
pub struct DTensor<R: Runtime> {
    local: Var<R>,
    placement: Placement,
    comm: Arc<dyn Communicator>,
}

impl<R: Runtime<DType = DType>> DTensor<R> {
    /// Wrap a local tensor that is already laid out as `placement`.
    pub fn from_local(local: Var<R>, placement: Placement, comm: Arc<dyn Communicator>) -> Result<Self> {
        if let Placement::Shard(dim) = placement {
            normalize_dim(dim, local.shape().len())?;
        }
        Ok(Self {
            local,
            placement,
            comm,
        })
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn comm(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    pub fn to_local(&self) -> &Var<R> {
        &self.local
    }

    pub fn into_local(self) -> Var<R> {
        self.local
    }

    /// Shape of the logical (unsharded) tensor.
    pub fn global_shape(&self) -> Result<Vec<usize>> {
        let mut shape = self.local.shape().to_vec();
        if let Placement::Shard(dim) = self.placement {
            let d = normalize_dim(dim, shape.len())?;
            shape[d] *= self.comm.world_size();
        }
        Ok(shape)
    }

    /// Convert to another placement on the same communicator.
    pub fn redistribute(&self, target: Placement) -> Result<Self>
    where
        R::Client: ShapeOps<R>,
    {
        if self.placement == target {
            return Self::from_local(self.local.clone(), target, self.comm.clone());
        }
        let local = match (self.placement, target) {
            (Placement::Replicate, Placement::Replicate) => self.local.clone(),
            (Placement::Shard(dim), Placement::Replicate) => {
                var_all_gather(&self.local, dim, self.comm.clone())?
            }
            (Placement::Replicate, Placement::Shard(dim)) => {
                var_shard(&self.local, dim, self.comm.clone())?
            }
            (Placement::Shard(from), Placement::Shard(_)) => {
                let full = var_all_gather(&self.local, from, self.comm.clone())?;
                let full = Self::from_local(full, Placement::Replicate, self.comm.clone())?;
                return full.redistribute(target);
            }
        };
        tracing::trace!(
            from = ?self.placement,
            to = ?target,
            shape = ?local.shape(),
            "redistributed tensor"
        );
        Self::from_local(local, target, self.comm.clone())
    }

    /// The replicated full tensor.
    pub fn full_tensor(&self) -> Result<Var<R>>
    where
        R::Client: ShapeOps<R>,
    {
        Ok(self.redistribute(Placement::Replicate)?.into_local())
    }
}

fn normalize_dim(dim: isize, ndim: usize) -> Result<usize> {
    let d = if dim < 0 { dim + ndim as isize } else { dim };
    if d < 0 || d as usize >= ndim {
        return Err(Error::InvalidArgument {
            arg: "dim",
            reason: format!("dim {dim} out of range for {ndim}D tensor"),
        });
    }
    Ok(d as usize)
}

/// This rank's slice of `tensor` along `dim`.
fn local_slice<R: Runtime>(tensor: &Tensor<R>, dim: usize, rank: usize, world_size: usize) -> Result<Tensor<R>> {
    let size = tensor.shape()[dim];
    if size % world_size != 0 {
        return Err(Error::DistributedError {
            reason: format!("dim {dim} of size {size} not divisible by world_size {world_size}"),
        });
    }
    let shard = size / world_size;
    Ok(tensor
        .narrow(dim as isize, rank * shard, shard)
        .map_err(Error::Numr)?
        .contiguous())
}

/// Reorder a rank-major flat gather into the concatenation along `dim`.
pub(crate) fn reassemble_shards<R: Runtime>(
    flat: &Tensor<R>,
    shard_shape: &[usize],
    dim: usize,
    world_size: usize,
) -> Result<Tensor<R>>
where
    R::Client: ShapeOps<R>,
{
    let numel: usize = shard_shape.iter().product();
    let pieces = (0..world_size)
        .map(|r| {
            flat.narrow(0, r * numel, numel)
                .map_err(Error::Numr)?
                .contiguous()
                .reshape(shard_shape)
                .map_err(Error::Numr)
        })
        .collect::<Result<Vec<_>>>()?;
    let refs: Vec<&Tensor<R>> = pieces.iter().collect();
    Tensor::cat(&refs, dim as isize).map_err(Error::Numr)
}

/// Gather equal shards from every rank into the full tensor along `dim`.
pub fn all_gather_along<R: Runtime<DType = DType>>(
    local: &Tensor<R>,
    dim: usize,
    comm: &dyn Communicator,
) -> Result<Tensor<R>>
where
    R::Client: ShapeOps<R>,
{
    if comm.world_size() <= 1 {
        return Ok(local.clone());
    }
    let local = local.contiguous();
    let flat = all_gather_flat(comm, &local)?;
    reassemble_shards(&flat, local.shape(), dim, comm.world_size())
}

struct AllGatherBackward<R: Runtime> {
    input_id: [TensorId; 1],
    input_grad_fn: Option<Arc<dyn GradFn<R>>>,
    dim: usize,
    comm: Arc<dyn Communicator>,
}

impl<R: Runtime<DType = DType>> GradFn<R> for AllGatherBackward<R> {
    fn backward(&self, grad_output: &Tensor<R>) -> numr::error::Result<Vec<Option<Tensor<R>>>> {
        let grad = local_slice(
            grad_output,
            self.dim,
            self.comm.rank(),
            self.comm.world_size(),
        )
        .map_err(|e| numr::error::Error::Internal(format!("all_gather backward failed: {e}")))?;
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
        "AllGatherBackward"
    }
}

struct ShardBackward<R: Runtime> {
    input_id: [TensorId; 1],
    input_grad_fn: Option<Arc<dyn GradFn<R>>>,
    dim: usize,
    comm: Arc<dyn Communicator>,
}

impl<R: Runtime<DType = DType>> GradFn<R> for ShardBackward<R>
where
    R::Client: ShapeOps<R>,
{
    fn backward(&self, grad_output: &Tensor<R>) -> numr::error::Result<Vec<Option<Tensor<R>>>> {
        let grad = all_gather_along(grad_output, self.dim, self.comm.as_ref())
            .map_err(|e| numr::error::Error::Internal(format!("shard backward failed: {e}")))?;
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
        "ShardBackward"
    }
}

struct CopyToTpRegionBackward<R: Runtime> {
    input_id: [TensorId; 1],
    input_grad_fn: Option<Arc<dyn GradFn<R>>>,
    comm: Arc<dyn Communicator>,
}

impl<R: Runtime<DType = DType>> GradFn<R> for CopyToTpRegionBackward<R> {
    fn backward(&self, grad_output: &Tensor<R>) -> numr::error::Result<Vec<Option<Tensor<R>>>> {
        let internal = |e: Error| numr::error::Error::Internal(format!("copy_to_tp_region backward failed: {e}"));
        // Reduce a private copy; the incoming gradient may be shared
        let host = read_floats(grad_output, "grad_output").map_err(internal)?;
        let grad = float_tensor::<R>(&host, grad_output.shape(), grad_output.dtype(), grad_output.device())
            .map_err(internal)?;
        all_reduce_tensor(self.comm.as_ref(), &grad, ReduceOp::Sum).map_err(internal)?;
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
        "CopyToTpRegionBackward"
    }
}

/// Identity on a replicated tensor whose gradient is summed over the group.
///
/// Every rank feeds the same `x` into its own shard of a split op, so the
/// gradient of `x` is the sum of the per-shard gradients.
pub fn var_copy_to_tp_region<R: Runtime<DType = DType>>(x: &Var<R>, comm: Arc<dyn Communicator>) -> Result<Var<R>> {
    if comm.world_size() <= 1 || !x.requires_grad() {
        return Ok(x.clone());
    }
    let grad_fn = CopyToTpRegionBackward {
        input_id: [x.id()],
        input_grad_fn: x.grad_fn().cloned(),
        comm,
    };
    Ok(Var::from_op(x.tensor().clone(), Arc::new(grad_fn)))
}

/// Differentiable all-gather along `dim`.
pub fn var_all_gather<R: Runtime<DType = DType>>(
    local: &Var<R>,
    dim: isize,
    comm: Arc<dyn Communicator>,
) -> Result<Var<R>>
where
    R::Client: ShapeOps<R>,
{
    let dim = normalize_dim(dim, local.shape().len())?;
    let full = all_gather_along(local.tensor(), dim, comm.as_ref())?;
    if !local.requires_grad() {
        return Ok(Var::new(full, false));
    }
    let grad_fn = AllGatherBackward {
        input_id: [local.id()],
        input_grad_fn: local.grad_fn().cloned(),
        dim,
        comm,
    };
    Ok(Var::from_op(full, Arc::new(grad_fn)))
}

/// Differentiable narrow to this rank's shard along `dim`.
pub fn var_shard<R: Runtime<DType = DType>>(
    full: &Var<R>,
    dim: isize,
    comm: Arc<dyn Communicator>,
) -> Result<Var<R>>
where
    R::Client: ShapeOps<R>,
{
    let dim = normalize_dim(dim, full.shape().len())?;
    let shard = local_slice(full.tensor(), dim, comm.rank(), comm.world_size())?;
    if !full.requires_grad() {
        return Ok(Var::new(shard, false));
    }
    let grad_fn = ShardBackward {
        input_id: [full.id()],
        input_grad_fn: full.grad_fn().cloned(),
        dim,
        comm,
    };
    Ok(Var::from_op(shard, Arc::new(grad_fn)))
}
