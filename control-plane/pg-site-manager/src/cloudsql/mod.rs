//! Cloud SQL Admin API client.

mod auth;
mod client;
mod types;

pub use auth::{ServiceAccountKey, ServiceAccountTokenSource, StaticToken, TokenSource};
pub use client::{ManagedDbProvider, SqlAdminClient};
pub use types::*;
