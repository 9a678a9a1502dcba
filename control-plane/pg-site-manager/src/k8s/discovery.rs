use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Api, Client};
use tracing::info;

use crate::backend::{BackendKind, choose_backend};
use crate::config::CloudSqlConfig;
use crate::error::Result;

/// Inspect the namespace for managed-cloud configuration.
pub async fn read_cloud_sql_discovery(
    client: Client,
    namespace: &str,
    cfg: &CloudSqlConfig,
) -> Result<BackendKind> {
    let cms: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let Some(cm) = cms.get_opt(&cfg.configmap).await? else {
        info!(
            configmap = %cfg.configmap,
            "Cloud SQL configuration not found, using Patroni backend"
        );
        return Ok(BackendKind::SelfManaged);
    };

    let secrets: Api<Secret> = Api::namespaced(client, namespace);
    let secret_data = secrets.get_opt(&cfg.secret).await?.and_then(|s| s.data);
    let kind = choose_backend(cm.data.as_ref(), secret_data.as_ref(), &cfg.credentials_key);
    if kind == BackendKind::SelfManaged {
        info!(secret = %cfg.secret, "Cloud SQL credentials are empty, using Patroni backend");
    }
    Ok(kind)
}
