//! Safe wrappers around the raw-pointer `Communicator` trait.
//!
//! Every helper follows the same contiguity-check, pointer, unsafe-call, sync
//! sequence so the rest of the crate never touches raw device pointers.

use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::{Communicator, ReduceOp, Runtime};
use numr::tensor::Tensor;

fn require_contiguous<R: Runtime>(tensor: &Tensor<R>, op: &str) -> Result<()> {
    if tensor.is_contiguous() {
        Ok(())
    } else {
        Err(Error::DistributedError {
            reason: format!("{op} requires a contiguous tensor"),
        })
    }
}

fn sync(comm: &dyn Communicator, after: &str) -> Result<()> {
    comm.sync().map_err(|e| Error::DistributedError {
        reason: format!("sync after {after} failed: {e}"),
    })
}

/// All-reduce a tensor in place.
pub fn all_reduce_tensor<R: Runtime<DType = DType>>(
    comm: &dyn Communicator,
    tensor: &Tensor<R>,
    op: ReduceOp,
) -> Result<()> {
    require_contiguous(tensor, "all_reduce")?;

    // Safety: tensor is contiguous, ptr is valid for `numel` elements of `dtype`
    unsafe {
        comm.all_reduce(tensor.ptr(), tensor.numel(), tensor.dtype(), op)
            .map_err(|e| Error::DistributedError {
                reason: format!("all_reduce failed: {e}"),
            })?;
    }
    sync(comm, "all_reduce")
}

/// Broadcast a tensor in place from `root` to every rank.
pub fn broadcast_tensor<R: Runtime<DType = DType>>(
    comm: &dyn Communicator,
    tensor: &Tensor<R>,
    root: usize,
) -> Result<()> {
    require_contiguous(tensor, "broadcast")?;

    // Safety: tensor is contiguous, ptr is valid device pointer
    unsafe {
        comm.broadcast(tensor.ptr(), tensor.numel(), tensor.dtype(), root)
            .map_err(|e| Error::DistributedError {
                reason: format!("broadcast from rank {root} failed: {e}"),
            })?;
    }
    sync(comm, "broadcast")
}

/// All-gather equal-sized tensors into a flat `[world_size * numel]` buffer,
/// ordered by rank.
pub fn all_gather_flat<R: Runtime<DType = DType>>(
    comm: &dyn Communicator,
    local: &Tensor<R>,
) -> Result<Tensor<R>> {
    let world_size = comm.world_size();
    let count = local.numel();
    if world_size <= 1 {
        return local.reshape(&[count]).map_err(Error::Numr);
    }
    require_contiguous(local, "all_gather")?;

    let recv = Tensor::<R>::zeros(&[count * world_size], local.dtype(), local.device());

    // Safety: both buffers are contiguous; recv holds world_size * count elements
    unsafe {
        comm.all_gather(local.ptr(), recv.ptr(), count, local.dtype())
            .map_err(|e| Error::DistributedError {
                reason: format!("all_gather failed: {e}"),
            })?;
    }
    sync(comm, "all_gather")?;
    Ok(recv)
}

/// Send a tensor preceded by a shape/dtype header.
///
/// Protocol:
/// 1. Header on `tag`: `[ndim, dim0, dim1, ..., dtype_id]` as u64
/// 2. Data on `tag + 1`
///
/// The receiving side uses [`recv_tensor_with_metadata`] with the same tag.
pub fn send_tensor_with_metadata<R: Runtime<DType = DType>>(
    comm: &dyn Communicator,
    tensor: &Tensor<R>,
    dest: usize,
    tag: u32,
) -> Result<()> {
    require_contiguous(tensor, "send")?;

    let shape = tensor.shape();
    if shape.is_empty() || shape.len() > MAX_DIMS {
        return Err(Error::DistributedError {
            reason: format!("can only send 1..={MAX_DIMS} dims, got shape {shape:?}"),
        });
    }
    let mut header: Vec<u64> = Vec::with_capacity(shape.len() + 2);
    header.push(shape.len() as u64);
    header.extend(shape.iter().map(|&d| d as u64));
    header.push(dtype_to_u64(tensor.dtype()));

    // Safety: header lives until after the sync below
    unsafe {
        comm.send(header.as_ptr() as u64, header.len(), DType::U64, dest, tag)
            .map_err(|e| Error::DistributedError {
                reason: format!("send header to rank {dest} failed: {e}"),
            })?;
    }
    sync(comm, "header send")?;

    // Safety: tensor is contiguous, ptr is valid device pointer
    unsafe {
        comm.send(tensor.ptr(), tensor.numel(), tensor.dtype(), dest, tag + 1)
            .map_err(|e| Error::DistributedError {
                reason: format!("send data to rank {dest} failed: {e}"),
            })?;
    }
    sync(comm, "data send")
}

const MAX_DIMS: usize = 8;

/// Receive a tensor sent by [`send_tensor_with_metadata`].
pub fn recv_tensor_with_metadata<R: Runtime<DType = DType>>(
    comm: &dyn Communicator,
    src: usize,
    tag: u32,
    device: &R::Device,
) -> Result<Tensor<R>> {
    const MAX_HEADER: usize = MAX_DIMS + 2;
    let mut header = [0u64; MAX_HEADER];

    // Safety: header buffer outlives the sync below
    unsafe {
        comm.recv(header.as_mut_ptr() as u64, MAX_HEADER, DType::U64, src, tag)
            .map_err(|e| Error::DistributedError {
                reason: format!("recv header from rank {src} failed: {e}"),
            })?;
    }
    sync(comm, "header recv")?;

    let ndim = header[0] as usize;
    if ndim == 0 || ndim > MAX_DIMS {
        return Err(Error::DistributedError {
            reason: format!("invalid ndim {ndim} in header from rank {src}"),
        });
    }
    let shape: Vec<usize> = header[1..=ndim].iter().map(|&d| d as usize).collect();
    let dtype = u64_to_dtype(header[ndim + 1])?;

    let buffer = Tensor::<R>::zeros(&shape, dtype, device);

    // Safety: buffer is freshly allocated and contiguous
    unsafe {
        comm.recv(buffer.ptr(), buffer.numel(), dtype, src, tag + 1)
            .map_err(|e| Error::DistributedError {
                reason: format!("recv data from rank {src} failed: {e}"),
            })?;
    }
    sync(comm, "data recv")?;
    Ok(buffer)
}

/// DType is `repr(u8)` with stable discriminants in numr.
fn dtype_to_u64(dtype: DType) -> u64 {
    (dtype as u8) as u64
}

fn u64_to_dtype(val: u64) -> Result<DType> {
    match val {
        0 => Ok(DType::F64),
        1 => Ok(DType::F32),
        2 => Ok(DType::F16),
        3 => Ok(DType::BF16),
        10 => Ok(DType::I64),
        11 => Ok(DType::I32),
        20 => Ok(DType::U64),
        21 => Ok(DType::U32),
        23 => Ok(DType::U8),
        30 => Ok(DType::Bool),
        _ => Err(Error::DistributedError {
            reason: format!("unsupported dtype discriminant {val} in header"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::runtime::NoOpCommunicator;
    use numr::runtime::cpu::CpuRuntime;

    #[test]
    fn test_all_reduce_single_rank_is_identity() {
        let (_client, device) = cpu_setup();
        let t = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0, 3.0], &[3], &device);
        all_reduce_tensor(&NoOpCommunicator, &t, ReduceOp::Sum).unwrap();
        assert_eq!(t.to_vec::<f32>(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_broadcast_single_rank() {
        let (_client, device) = cpu_setup();
        let t = Tensor::<CpuRuntime>::from_slice(&[7i64, 8], &[2], &device);
        broadcast_tensor(&NoOpCommunicator, &t, 0).unwrap();
        assert_eq!(t.to_vec::<i64>(), vec![7, 8]);
    }

    #[test]
    fn test_all_gather_single_rank_flattens() {
        let (_client, device) = cpu_setup();
        let t = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2], &device);
        let g = all_gather_flat(&NoOpCommunicator, &t).unwrap();
        assert_eq!(g.shape(), &[4]);
        assert_eq!(g.to_vec::<f32>(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_dtype_header_roundtrip() {
        for dt in [DType::F32, DType::F64, DType::F16, DType::BF16, DType::I32, DType::I64] {
            assert_eq!(u64_to_dtype(dtype_to_u64(dt)).unwrap(), dt);
        }
        assert!(u64_to_dtype(99).is_err());
    }

    #[test]
    fn test_send_rejects_too_many_dims() {
        let (_client, device) = cpu_setup();
        let t = Tensor::<CpuRuntime>::zeros(&[1; 9], DType::F32, &device);
        assert!(send_tensor_with_metadata(&NoOpCommunicator, &t, 0, 0).is_err());
    }

    #[test]
    fn test_recv_without_sender_reports_bad_header() {
        let (_client, device) = cpu_setup();
        // NoOp recv leaves the header zeroed, so ndim == 0
        let result = recv_tensor_with_metadata::<CpuRuntime>(&NoOpCommunicator, 0, 0, &device);
        assert!(result.is_err());
    }
}
