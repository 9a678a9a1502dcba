mod patroni;
mod postgres;

pub use patroni::*;
pub use postgres::*;
