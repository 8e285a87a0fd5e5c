//! Host-side tensor reads and writes used by the f64 loss and relay paths.

use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Copy a float tensor to the host as f64.
pub(crate) fn read_floats<R: Runtime<DType = DType>>(t: &Tensor<R>, arg: &'static str) -> Result<Vec<f64>> {
    let t = t.contiguous();
    match t.dtype() {
        DType::F64 => Ok(t.to_vec::<f64>()),
        DType::F32 => Ok(t.to_vec::<f32>().into_iter().map(f64::from).collect()),
        other => Err(Error::InvalidArgument {
            arg,
            reason: format!("expected F32 or F64, got {other:?}"),
        }),
    }
}

/// Copy an integer tensor to the host as i64.
pub(crate) fn read_indices<R: Runtime<DType = DType>>(t: &Tensor<R>, arg: &'static str) -> Result<Vec<i64>> {
    let t = t.contiguous();
    match t.dtype() {
        DType::I64 => Ok(t.to_vec::<i64>()),
        DType::I32 => Ok(t.to_vec::<i32>().into_iter().map(i64::from).collect()),
        other => Err(Error::InvalidArgument {
            arg,
            reason: format!("expected I32 or I64, got {other:?}"),
        }),
    }
}

/// Build a float tensor of `dtype` from host f64 values.
pub(crate) fn float_tensor<R: Runtime<DType = DType>>(
    data: &[f64],
    shape: &[usize],
    dtype: DType,
    device: &R::Device,
) -> Result<Tensor<R>> {
    match dtype {
        DType::F64 => Ok(Tensor::<R>::from_slice(data, shape, device)),
        DType::F32 => {
            let narrowed: Vec<f32> = data.iter().map(|&x| x as f32).collect();
            Ok(Tensor::<R>::from_slice(&narrowed, shape, device))
        }
        other => Err(Error::InvalidArgument {
            arg: "dtype",
            reason: format!("expected F32 or F64, got {other:?}"),
        }),
    }
}

/// Build an I64 tensor from host indices.
pub(crate) fn index_tensor<R: Runtime<DType = DType>>(
    data: &[i64],
    shape: &[usize],
    device: &R::Device,
) -> Tensor<R> {
    Tensor::<R>::from_slice(data, shape, device)
}
