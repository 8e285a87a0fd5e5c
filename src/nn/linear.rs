//! Dense linear layer

use crate::error::{Error, Result};
use crate::nn::init::{Init, ParamInit};
use numr::autograd::{Var, var_add, var_matmul, var_transpose};
use numr::dtype::DType;
use numr::ops::TensorOps;
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// `output = input @ weight^T + bias`
///
/// weight: `[out_features, in_features]`
pub struct Linear<R: Runtime> {
    weight: Var<R>,
    bias: Option<Var<R>>,
}

impl<R: Runtime> Linear<R> {
    pub fn new(weight: Tensor<R>, bias: Option<Tensor<R>>, trainable: bool) -> Self {
        Self {
            weight: Var::new(weight, trainable),
            bias: bias.map(|b| Var::new(b, trainable)),
        }
    }

    /// input: `[..., in_features]`, output: `[..., out_features]`
    pub fn forward<C>(&self, client: &C, input: &Var<R>) -> Result<Var<R>>
    where
        C: RuntimeClient<R> + TensorOps<R>,
        R::Client: TensorOps<R>,
    {
        let w_t = var_transpose(&self.weight).map_err(Error::Numr)?;
        let output = var_matmul(input, &w_t, client).map_err(Error::Numr)?;
        match &self.bias {
            Some(bias) => var_add(&output, bias, client).map_err(Error::Numr),
            None => Ok(output),
        }
    }

    pub fn weight(&self) -> &Var<R> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Var<R>> {
        self.bias.as_ref()
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn named_parameters(&self) -> Vec<(String, &Var<R>)> {
        let mut params = vec![("weight".to_string(), &self.weight)];
        if let Some(bias) = &self.bias {
            params.push(("bias".to_string(), bias));
        }
        params
    }
}

impl<R: Runtime<DType = DType>> Linear<R> {
    /// Trainable layer with `Normal(std)` weights and zero bias.
    pub fn init(
        init: &mut ParamInit<R>,
        in_features: usize,
        out_features: usize,
        bias: bool,
        std: f64,
    ) -> Result<Self> {
        let weight = init.tensor(&[out_features, in_features], Init::Normal(std))?;
        let bias = if bias {
            Some(init.tensor(&[out_features], Init::Zeros)?)
        } else {
            None
        };
        Ok(Self::new(weight, bias, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;

    #[test]
    fn test_linear_with_bias() {
        let (client, device) = cpu_setup();
        let w = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 0.0, 0.0, 2.0, 1.0, 1.0], &[3, 2], &device);
        let b = Tensor::<CpuRuntime>::from_slice(&[0.5f32, 0.0, -1.0], &[3], &device);
        let layer = Linear::new(w, Some(b), false);
        let x = Var::new(
            Tensor::<CpuRuntime>::from_slice(&[3.0f32, 4.0], &[1, 2], &device),
            false,
        );
        let y = layer.forward(&client, &x).unwrap();
        assert_eq!(y.tensor().to_vec::<f32>(), vec![3.5, 8.0, 6.0]);
        assert_eq!(layer.out_features(), 3);
    }

    #[test]
    fn test_init_shapes() {
        let (_client, device) = cpu_setup();
        let mut init = ParamInit::<CpuRuntime>::new(1, DType::F32, &device);
        let layer = Linear::init(&mut init, 4, 6, true, 0.02).unwrap();
        assert_eq!(layer.weight().shape(), &[6, 4]);
        assert_eq!(layer.bias().unwrap().shape(), &[6]);
        assert!(layer.weight().requires_grad());
    }
}
