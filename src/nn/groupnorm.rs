//! Per-head group normalization of merged attention outputs
//!
//! Stick-breaking outputs are not normalized per query (the remainder mass is
//! dropped), so each head's slice of the merged `[tokens, hidden]` output is
//! standardized on its own before the output projection.

use crate::error::{Error, Result};
use crate::nn::init::{Init, ParamInit};
use numr::autograd::{Var, var_group_norm, var_reshape};
use numr::dtype::DType;
use numr::ops::{NormalizationOps, ScalarOps, TensorOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// weight, bias: `[channels]`, split into `num_groups` contiguous groups
pub struct GroupNorm<R: Runtime> {
    weight: Var<R>,
    bias: Var<R>,
    num_groups: usize,
    eps: f32,
}

impl<R: Runtime> GroupNorm<R> {
    pub fn new(weight: Tensor<R>, bias: Tensor<R>, num_groups: usize, eps: f32, trainable: bool) -> Result<Self> {
        let channels = weight.shape().first().copied().unwrap_or(0);
        if num_groups == 0 || channels % num_groups != 0 {
            return Err(Error::shape(format!(
                "GroupNorm: {channels} channels cannot be split into {num_groups} groups"
            )));
        }
        Ok(Self {
            weight: Var::new(weight, trainable),
            bias: Var::new(bias, trainable),
            num_groups,
            eps,
        })
    }

    pub fn weight(&self) -> &Var<R> {
        &self.weight
    }

    pub fn bias(&self) -> &Var<R> {
        &self.bias
    }

    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    pub fn channels(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn named_parameters(&self) -> Vec<(String, &Var<R>)> {
        vec![("weight".to_string(), &self.weight), ("bias".to_string(), &self.bias)]
    }
}

impl<R: Runtime<DType = DType>> GroupNorm<R> {
    pub fn init(init: &mut ParamInit<R>, num_groups: usize, channels: usize, eps: f32) -> Result<Self> {
        let weight = init.tensor(&[channels], Init::Ones)?;
        let bias = init.tensor(&[channels], Init::Zeros)?;
        Self::new(weight, bias, num_groups, eps, true)
    }

    /// `input`: `[..., channels]`; every leading index is its own sample.
    pub fn forward<C>(&self, client: &C, input: &Var<R>) -> Result<Var<R>>
    where
        C: RuntimeClient<R> + NormalizationOps<R>,
        R::Client: TensorOps<R> + ScalarOps<R>,
    {
        let shape = input.shape().to_vec();
        let channels = self.channels();
        if shape.last() != Some(&channels) {
            return Err(Error::shape(format!(
                "GroupNorm over {channels} channels got input {shape:?}"
            )));
        }
        let samples = input.tensor().numel() / channels;

        // var_group_norm wants [N, C, *spatial]
        let x = var_reshape(input, &[samples, channels, 1]).map_err(Error::Numr)?;
        let y = var_group_norm(&x, &self.weight, &self.bias, self.num_groups, self.eps, client)
            .map_err(Error::Numr)?;
        var_reshape(&y, &shape).map_err(Error::Numr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::autograd::backward;
    use numr::runtime::cpu::CpuRuntime;

    #[test]
    fn test_each_head_is_standardized() {
        let (client, device) = cpu_setup();
        let mut init = ParamInit::<CpuRuntime>::new(0, DType::F32, &device);
        let norm = GroupNorm::init(&mut init, 2, 4, 1e-5).unwrap();

        // 3 tokens, 2 heads of width 2
        let input = Var::new(
            Tensor::<CpuRuntime>::from_slice(
                &[1.0f32, 3.0, 10.0, 20.0, -1.0, 1.0, 0.5, 0.7, 4.0, 8.0, 2.0, 2.5],
                &[3, 4],
                &device,
            ),
            false,
        );
        let out = norm.forward(&client, &input).unwrap();
        assert_eq!(out.shape(), &[3, 4]);
        for pair in out.tensor().to_vec::<f32>().chunks(2) {
            assert!((pair[0] + pair[1]).abs() < 1e-4);
            assert!((pair[0] + 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_rejects_uneven_groups() {
        let (_client, device) = cpu_setup();
        let w = Tensor::<CpuRuntime>::from_slice(&[1.0f32; 6], &[6], &device);
        let b = Tensor::<CpuRuntime>::from_slice(&[0.0f32; 6], &[6], &device);
        assert!(GroupNorm::new(w, b, 4, 1e-5, false).is_err());
    }

    #[test]
    fn test_backward_reaches_input_and_affine() {
        let (client, device) = cpu_setup();
        let mut init = ParamInit::<CpuRuntime>::new(0, DType::F32, &device);
        let norm = GroupNorm::init(&mut init, 2, 4, 1e-5).unwrap();
        let input = Var::new(
            Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0, 34.0], &[2, 4], &device),
            true,
        );
        let out = norm.forward(&client, &input).unwrap();
        let loss = numr::autograd::var_sum(&out, &[0, 1], false, &client).unwrap();
        let grads = backward(&loss, &client).unwrap();

        let dx = grads.get(input.id()).unwrap().to_vec::<f32>();
        assert!(dx.iter().all(|v| v.is_finite()));
        let db = grads.get(norm.bias().id()).unwrap().to_vec::<f32>();
        assert_eq!(db, vec![2.0, 2.0, 2.0, 2.0]);
    }
}
