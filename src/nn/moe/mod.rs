pub mod layer;
pub mod router;

pub use layer::{MoeLayer, MoeOutput};
pub use router::{MoeConfig, MoeRouter, RouterOutput};
