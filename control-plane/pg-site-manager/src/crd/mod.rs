//! Typed views of the custom resources owned by the database operator.
//!
//! Only the fields read or patched here are modelled; schemas are published
//! by the operator that owns the CRDs.

pub mod patroni_core;
pub mod patroni_services;

pub use patroni_core::{
    CoreCondition, PatroniCore, PatroniCoreSpec, PatroniCoreStatus, PatroniSection,
    ReconcilePhase, StandbyCluster,
};
pub use patroni_services::{
    PatroniRef, PatroniServices, PatroniServicesSpec, PatroniServicesStatus, SiteManagerSpec,
    StandbyClusterHealthCheck,
};
