//! Seeded parameter initialization.
//!
//! Every rank seeds the same stream, so replicated weights match across the
//! TP group without a broadcast and vocab shards are cut from identical tables.

use crate::error::Result;
use crate::host::float_tensor;
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Initialization strategy for a new parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Zeros,
    Ones,
    /// Uniform in `[-bound, bound]`
    Uniform(f64),
    /// Gaussian with the given standard deviation
    Normal(f64),
}

/// Produces parameter tensors from one seeded stream.
pub struct ParamInit<R: Runtime> {
    rng: ChaCha8Rng,
    dtype: DType,
    device: R::Device,
}

impl<R: Runtime<DType = DType>> ParamInit<R> {
    pub fn new(seed: u64, dtype: DType, device: &R::Device) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            dtype,
            device: device.clone(),
        }
    }

    pub fn device(&self) -> &R::Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn tensor(&mut self, shape: &[usize], init: Init) -> Result<Tensor<R>> {
        let n: usize = shape.iter().product();
        let data: Vec<f64> = match init {
            Init::Zeros => vec![0.0; n],
            Init::Ones => vec![1.0; n],
            Init::Uniform(bound) => (0..n)
                .map(|_| self.rng.random_range(-bound..=bound))
                .collect(),
            Init::Normal(std) => (0..n).map(|_| std * self.standard_normal()).collect(),
        };
        float_tensor::<R>(&data, shape, self.dtype, &self.device)
    }

    /// Box-Muller draw.
    fn standard_normal(&mut self) -> f64 {
        let u1: f64 = 1.0 - self.rng.random::<f64>();
        let u2: f64 = self.rng.random::<f64>();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }
}
