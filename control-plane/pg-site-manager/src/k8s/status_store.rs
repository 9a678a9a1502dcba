use std::time::Duration;

use async_trait::async_trait;
use kube::{
    Api, Client, ResourceExt,
    api::{Patch, PatchParams},
};
use serde_json::json;
use tracing::{info, warn};

use super::is_not_found;
use crate::crd::PatroniServices;
use crate::error::{Result, SiteManagerError};
use crate::poll::retry_with_timeout;
use crate::sitemanager::{SiteManagerStatus, StatusStore};

/// Keeps the record in `status.siteManagerStatus` of the `PatroniServices`
/// resource. Writes carry the observed `resourceVersion`, so a concurrent
/// writer turns into a 409 and a retry.
#[derive(Clone)]
pub struct CrStatusStore {
    api: Api<PatroniServices>,
    name: String,
    retry_interval: Duration,
    retry_timeout: Duration,
}

impl CrStatusStore {
    pub fn new(client: Client, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.into(),
            retry_interval: Duration::from_secs(1),
            retry_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_retry(mut self, interval: Duration, timeout: Duration) -> Self {
        self.retry_interval = interval;
        self.retry_timeout = timeout;
        self
    }

    async fn try_save(&self, status: &SiteManagerStatus) -> Result<()> {
        let current = self.api.get_status(&self.name).await?;
        let patch = json!({
            "metadata": { "resourceVersion": current.resource_version() },
            "status": { "siteManagerStatus": status },
        });
        self.api
            .patch_status(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StatusStore for CrStatusStore {
    async fn load(&self) -> Result<SiteManagerStatus> {
        let cr = self.api.get_status(&self.name).await.map_err(|e| {
            if is_not_found(&e) {
                SiteManagerError::NotFound {
                    kind: "PatroniServices",
                    name: self.name.clone(),
                }
            } else {
                e.into()
            }
        })?;
        Ok(cr
            .status
            .and_then(|s| s.site_manager_status)
            .unwrap_or_default())
    }

    async fn save(&self, status: &SiteManagerStatus) -> Result<()> {
        info!(mode = ?status.mode, status = ?status.status, "Site Manager: update status");
        retry_with_timeout(
            self.retry_interval,
            self.retry_timeout,
            || async {
                let res = self.try_save(status).await;
                if let Err(e) = &res {
                    warn!(error = %e, "Can't update Site Manager status, retrying");
                }
                res
            },
            |e| !matches!(e, SiteManagerError::Kube(ke) if is_not_found(ke)),
        )
        .await
    }
}
