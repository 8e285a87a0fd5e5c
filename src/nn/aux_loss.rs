//! Auxiliary-loss accumulation for one forward pass
//!
//! MoE layers emit a scalar load-balancing loss each. Instead of a global
//! accumulator, every stage forward creates a [`ForwardContext`], threads it by
//! `&mut` through its blocks and consumes it with [`ForwardContext::finish`],
//! so a total can never leak into the next pass.

use crate::error::{Error, Result};
use crate::host::read_floats;
use numr::autograd::{Var, var_add, var_reshape};
use numr::dtype::DType;
use numr::ops::TensorOps;
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// Running sum of single-element losses.
///
/// Totals are kept as `[1]` Vars so gradients reach every contributing layer.
pub struct AuxLossAccumulator<R: Runtime> {
    total: Option<Var<R>>,
    count: usize,
    dtype: DType,
    device: R::Device,
}

impl<R: Runtime<DType = DType>> AuxLossAccumulator<R> {
    pub fn new(device: &R::Device) -> Self {
        Self {
            total: None,
            count: 0,
            dtype: DType::F32,
            device: device.clone(),
        }
    }

    /// Dtype of the zero returned by an empty drain.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Add one scalar contribution.
    pub fn add<C>(&mut self, client: &C, value: &Var<R>) -> Result<()>
    where
        C: RuntimeClient<R> + TensorOps<R>,
        R::Client: TensorOps<R>,
    {
        if value.tensor().numel() != 1 {
            return Err(Error::shape(format!(
                "aux loss must be a single element, got shape {:?}",
                value.shape()
            )));
        }
        let value = var_reshape(value, &[1]).map_err(Error::Numr)?;
        self.total = Some(match self.total.take() {
            Some(total) => var_add(&total, &value, client).map_err(Error::Numr)?,
            None => value,
        });
        self.count += 1;
        Ok(())
    }

    /// Return the total and reset to zero.
    ///
    /// A drain with no contributions returns a detached `[1]` zero.
    pub fn drain(&mut self) -> Var<R> {
        self.count = 0;
        self.total
            .take()
            .unwrap_or_else(|| Var::new(Tensor::<R>::zeros(&[1], self.dtype, &self.device), false))
    }

    /// Contributions since the last drain.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// State owned by one stage forward pass.
pub struct ForwardContext<R: Runtime> {
    aux: AuxLossAccumulator<R>,
}

impl<R: Runtime<DType = DType>> ForwardContext<R> {
    pub fn new(device: &R::Device) -> Self {
        Self {
            aux: AuxLossAccumulator::new(device),
        }
    }

    pub fn with_dtype(device: &R::Device, dtype: DType) -> Self {
        Self {
            aux: AuxLossAccumulator::new(device).with_dtype(dtype),
        }
    }

    pub fn add_aux_loss<C>(&mut self, client: &C, value: &Var<R>) -> Result<()>
    where
        C: RuntimeClient<R> + TensorOps<R>,
        R::Client: TensorOps<R>,
    {
        self.aux.add(client, value)
    }

    pub fn aux_contributions(&self) -> usize {
        self.aux.len()
    }

    /// End the pass, yielding the aux total.
    pub fn finish(mut self) -> Var<R> {
        self.aux.drain()
    }
}

/// Read a single-element loss back to the host.
pub fn scalar_value<R: Runtime<DType = DType>>(value: &Var<R>) -> Result<f64> {
    read_floats(value.tensor(), "value")?
        .first()
        .copied()
        .ok_or_else(|| Error::shape("empty loss tensor"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::autograd::backward;
    use numr::runtime::cpu::CpuRuntime;

    fn scalar(x: f32, device: &numr::runtime::cpu::CpuDevice, grad: bool) -> Var<CpuRuntime> {
        Var::new(Tensor::<CpuRuntime>::from_slice(&[x], &[1], device), grad)
    }

    #[test]
    fn test_add_then_drain_sums() {
        let (client, device) = cpu_setup();
        let mut acc = AuxLossAccumulator::<CpuRuntime>::new(&device);
        for x in [0.5f32, 1.25, 2.0] {
            acc.add(&client, &scalar(x, &device, false)).unwrap();
        }
        assert_eq!(acc.len(), 3);
        let total = acc.drain();
        assert_eq!(total.shape(), &[1]);
        assert!((scalar_value(&total).unwrap() - 3.75).abs() < 1e-6);
    }

    #[test]
    fn test_second_drain_is_zero() {
        let (client, device) = cpu_setup();
        let mut acc = AuxLossAccumulator::<CpuRuntime>::new(&device);
        acc.add(&client, &scalar(4.0, &device, false)).unwrap();
        let _ = acc.drain();
        assert!(acc.is_empty());
        assert_eq!(scalar_value(&acc.drain()).unwrap(), 0.0);
    }

    #[test]
    fn test_rejects_non_scalar() {
        let (client, device) = cpu_setup();
        let mut acc = AuxLossAccumulator::<CpuRuntime>::new(&device);
        let v = Var::new(
            Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0], &[2], &device),
            false,
        );
        assert!(matches!(
            acc.add(&client, &v),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_scalar_shapes_are_normalized() {
        let (client, device) = cpu_setup();
        let mut acc = AuxLossAccumulator::<CpuRuntime>::new(&device);
        let rank0 = Var::new(Tensor::<CpuRuntime>::from_slice(&[1.5f32], &[], &device), false);
        acc.add(&client, &rank0).unwrap();
        acc.add(&client, &scalar(0.5, &device, false)).unwrap();
        assert!((scalar_value(&acc.drain()).unwrap() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_context_finish_keeps_gradient_path() {
        let (client, device) = cpu_setup();
        let a = scalar(1.0, &device, true);
        let b = scalar(2.0, &device, true);
        let mut ctx = ForwardContext::<CpuRuntime>::new(&device);
        ctx.add_aux_loss(&client, &a).unwrap();
        ctx.add_aux_loss(&client, &b).unwrap();
        assert_eq!(ctx.aux_contributions(), 2);

        let total = ctx.finish();
        let grads = backward(&total, &client).unwrap();
        assert_eq!(grads.get(a.id()).unwrap().to_vec::<f32>(), vec![1.0]);
        assert_eq!(grads.get(b.id()).unwrap().to_vec::<f32>(), vec![1.0]);
    }
}
