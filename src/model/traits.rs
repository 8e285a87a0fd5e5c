//! Client bounds for model forward passes

use crate::ops::traits::StickBreakingOps;
use numr::ops::{
    ActivationOps, BinaryOps, CompareOps, IndexingOps, NormalizationOps, ReduceOps, ScalarOps,
    ShapeOps, SortingOps, TensorOps, UnaryOps,
};
use numr::runtime::{Runtime, RuntimeClient};

/// Trait alias for the full set of client bounds required by model forward passes.
pub trait ModelClient<R: Runtime>:
    RuntimeClient<R>
    + TensorOps<R>
    + ScalarOps<R>
    + ReduceOps<R>
    + IndexingOps<R>
    + ShapeOps<R>
    + ActivationOps<R>
    + BinaryOps<R>
    + UnaryOps<R>
    + CompareOps<R>
    + SortingOps<R>
    + NormalizationOps<R>
    + StickBreakingOps<R>
{
}

impl<R, C> ModelClient<R> for C
where
    R: Runtime,
    C: RuntimeClient<R>
        + TensorOps<R>
        + ScalarOps<R>
        + ReduceOps<R>
        + IndexingOps<R>
        + ShapeOps<R>
        + ActivationOps<R>
        + BinaryOps<R>
        + UnaryOps<R>
        + CompareOps<R>
        + SortingOps<R>
        + NormalizationOps<R>
        + StickBreakingOps<R>,
{
}
