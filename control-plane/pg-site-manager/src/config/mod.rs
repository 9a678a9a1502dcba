mod cluster;
mod types;

pub use cluster::*;
pub use types::*;
