//! Kubernetes-facing collaborators.

mod discovery;
mod status_store;
mod workloads;

pub use discovery::read_cloud_sql_discovery;
pub use status_store::CrStatusStore;
pub use workloads::*;

pub(crate) fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 404)
}
