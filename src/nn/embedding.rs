//! Lookup-table embedding, used for token and learned position embeddings

use crate::error::{Error, Result};
use crate::nn::init::{Init, ParamInit};
use numr::autograd::{Var, var_gather, var_reshape};
use numr::dtype::DType;
use numr::ops::IndexingOps;
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// weight: `[num_embeddings, embedding_dim]`
pub struct Embedding<R: Runtime> {
    weight: Var<R>,
}

impl<R: Runtime> Embedding<R> {
    pub fn new(weight: Tensor<R>, trainable: bool) -> Self {
        Self {
            weight: Var::new(weight, trainable),
        }
    }

    pub fn weight(&self) -> &Var<R> {
        &self.weight
    }

    pub fn num_embeddings(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn embedding_dim(&self) -> usize {
        self.weight.shape()[1]
    }
}

impl<R: Runtime<DType = DType>> Embedding<R> {
    pub fn init(init: &mut ParamInit<R>, num_embeddings: usize, embedding_dim: usize, std: f64) -> Result<Self> {
        let weight = init.tensor(&[num_embeddings, embedding_dim], Init::Normal(std))?;
        Ok(Self::new(weight, true))
    }

    /// indices: `[...]` integer tensor, output: `[..., embedding_dim]`
    pub fn forward<C>(&self, client: &C, indices: &Tensor<R>) -> Result<Var<R>>
    where
        C: RuntimeClient<R> + IndexingOps<R>,
        R::Client: IndexingOps<R>,
    {
        let dim = self.embedding_dim();
        let n = indices.numel();

        // Row gather along dim 0 wants one index per output element
        let rows = indices
            .reshape(&[n, 1])
            .and_then(|t| t.broadcast_to(&[n, dim]))
            .map_err(Error::Numr)?;
        let gathered = var_gather(&self.weight, 0, &rows, client).map_err(Error::Numr)?;

        let mut out_shape = indices.shape().to_vec();
        out_shape.push(dim);
        var_reshape(&gathered, &out_shape).map_err(Error::Numr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;

    #[test]
    fn test_lookup_rows() {
        let (client, device) = cpu_setup();
        let weight = Tensor::<CpuRuntime>::from_slice(
            &[0.0f32, 0.5, 1.0, 1.5, 2.0, 2.5],
            &[3, 2],
            &device,
        );
        let emb = Embedding::new(weight, false);
        let ids = Tensor::<CpuRuntime>::from_slice(&[2i64, 0], &[2], &device);
        let out = emb.forward(&client, &ids).unwrap();
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(out.tensor().to_vec::<f32>(), vec![2.0, 2.5, 0.0, 0.5]);
    }

    #[test]
    fn test_position_ids_keep_batch_shape() {
        let (client, device) = cpu_setup();
        let mut init = ParamInit::<CpuRuntime>::new(0, DType::F32, &device);
        let emb = Embedding::init(&mut init, 8, 3, 0.02).unwrap();
        let positions = Tensor::<CpuRuntime>::from_slice(&[0i64, 1, 2, 0, 1, 2], &[2, 3], &device);
        let out = emb.forward(&client, &positions).unwrap();
        assert_eq!(out.shape(), &[2, 3, 3]);

        let data = out.tensor().to_vec::<f32>();
        assert_eq!(&data[..9], &data[9..]);
    }
}
