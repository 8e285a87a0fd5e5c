//! Pre-norm layers of a transformer block
//!
//! `LayerNorm`: `(x - mean) / sqrt(var + eps) * weight + bias`
//! `RmsNorm`: `x / sqrt(mean(x^2) + eps) * weight`

use crate::error::{Error, Result};
use crate::nn::init::{Init, ParamInit};
use numr::autograd::{Var, var_add, var_add_scalar, var_div, var_mean, var_mul, var_sqrt, var_sub};
use numr::dtype::DType;
use numr::ops::{ReduceOps, ScalarOps, TensorOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// Which normalization a block uses, as named in model configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NormKind {
    #[default]
    LayerNorm,
    RmsNorm,
}

/// Normalization over the last dimension.
pub enum Norm<R: Runtime> {
    LayerNorm { weight: Var<R>, bias: Var<R>, eps: f64 },
    RmsNorm { weight: Var<R>, eps: f64 },
}

impl<R: Runtime> Norm<R> {
    pub fn layer_norm(weight: Tensor<R>, bias: Tensor<R>, eps: f64, trainable: bool) -> Self {
        Norm::LayerNorm {
            weight: Var::new(weight, trainable),
            bias: Var::new(bias, trainable),
            eps,
        }
    }

    pub fn rms_norm(weight: Tensor<R>, eps: f64, trainable: bool) -> Self {
        Norm::RmsNorm {
            weight: Var::new(weight, trainable),
            eps,
        }
    }

    pub fn kind(&self) -> NormKind {
        match self {
            Norm::LayerNorm { .. } => NormKind::LayerNorm,
            Norm::RmsNorm { .. } => NormKind::RmsNorm,
        }
    }

    pub fn weight(&self) -> &Var<R> {
        match self {
            Norm::LayerNorm { weight, .. } | Norm::RmsNorm { weight, .. } => weight,
        }
    }

    pub fn named_parameters(&self) -> Vec<(String, &Var<R>)> {
        match self {
            Norm::LayerNorm { weight, bias, .. } => {
                vec![("weight".to_string(), weight), ("bias".to_string(), bias)]
            }
            Norm::RmsNorm { weight, .. } => vec![("weight".to_string(), weight)],
        }
    }
}

impl<R: Runtime<DType = DType>> Norm<R> {
    /// Unit weight, zero bias.
    pub fn init(init: &mut ParamInit<R>, kind: NormKind, hidden_size: usize, eps: f64) -> Result<Self> {
        let weight = init.tensor(&[hidden_size], Init::Ones)?;
        Ok(match kind {
            NormKind::LayerNorm => {
                let bias = init.tensor(&[hidden_size], Init::Zeros)?;
                Self::layer_norm(weight, bias, eps, true)
            }
            NormKind::RmsNorm => Self::rms_norm(weight, eps, true),
        })
    }

    /// input: `[..., hidden_size]`, output: same shape
    pub fn forward<C>(&self, client: &C, input: &Var<R>) -> Result<Var<R>>
    where
        C: RuntimeClient<R> + TensorOps<R> + ScalarOps<R> + ReduceOps<R>,
        R::Client: TensorOps<R> + ScalarOps<R> + ReduceOps<R>,
    {
        let last = input.shape().len().saturating_sub(1);
        match self {
            Norm::LayerNorm { weight, bias, eps } => {
                let mean = var_mean(input, &[last], true, client).map_err(Error::Numr)?;
                let centered = var_sub(input, &mean, client).map_err(Error::Numr)?;
                let sq = var_mul(&centered, &centered, client).map_err(Error::Numr)?;
                let variance = var_mean(&sq, &[last], true, client).map_err(Error::Numr)?;
                let std = var_add_scalar(&variance, *eps, client)
                    .and_then(|v| var_sqrt(&v, client))
                    .map_err(Error::Numr)?;
                let normed = var_div(&centered, &std, client).map_err(Error::Numr)?;
                let scaled = var_mul(&normed, weight, client).map_err(Error::Numr)?;
                var_add(&scaled, bias, client).map_err(Error::Numr)
            }
            Norm::RmsNorm { weight, eps } => {
                let sq = var_mul(input, input, client).map_err(Error::Numr)?;
                let mean_sq = var_mean(&sq, &[last], true, client).map_err(Error::Numr)?;
                let rms = var_add_scalar(&mean_sq, *eps, client)
                    .and_then(|v| var_sqrt(&v, client))
                    .map_err(Error::Numr)?;
                let normed = var_div(input, &rms, client).map_err(Error::Numr)?;
                var_mul(&normed, weight, client).map_err(Error::Numr)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;

    fn input(device: &numr::runtime::cpu::CpuDevice) -> Var<CpuRuntime> {
        Var::new(
            Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0, 3.0, 4.0, -2.0, 2.0, -2.0, 2.0], &[2, 4], device),
            false,
        )
    }

    #[test]
    fn test_layer_norm_rows_are_standardized() {
        let (client, device) = cpu_setup();
        let mut init = ParamInit::<CpuRuntime>::new(0, DType::F32, &device);
        let norm = Norm::init(&mut init, NormKind::LayerNorm, 4, 1e-5).unwrap();
        let out = norm.forward(&client, &input(&device)).unwrap().tensor().to_vec::<f32>();
        for row in out.chunks(4) {
            let mean: f32 = row.iter().sum::<f32>() / 4.0;
            let var: f32 = row.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_rms_norm_unit_rms() {
        let (client, device) = cpu_setup();
        let mut init = ParamInit::<CpuRuntime>::new(0, DType::F32, &device);
        let norm = Norm::init(&mut init, NormKind::RmsNorm, 4, 1e-6).unwrap();
        assert_eq!(norm.kind(), NormKind::RmsNorm);
        let out = norm.forward(&client, &input(&device)).unwrap().tensor().to_vec::<f32>();
        // second row is +-2 everywhere, so it normalizes to +-1
        assert!(out[4..].iter().all(|x| (x.abs() - 1.0).abs() < 1e-4));
    }

    #[test]
    fn test_kind_from_config_name() {
        let k: NormKind = serde_yaml::from_str("rmsnorm").unwrap();
        assert_eq!(k, NormKind::RmsNorm);
        assert_eq!(NormKind::default(), NormKind::LayerNorm);
    }
}
