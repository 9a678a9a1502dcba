use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::sitemanager::SiteManagerStatus;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default)]
#[kube(
    group = "netcracker.com",
    version = "v1",
    kind = "PatroniServices",
    plural = "patroniservices",
    namespaced,
    status = "PatroniServicesStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct PatroniServicesSpec {
    pub patroni: Option<PatroniRef>,
    pub site_manager: Option<SiteManagerSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct PatroniRef {
    pub cluster_name: Option<String>,
}

impl PatroniServices {
    /// Cluster name declared on the resource, if any.
    pub fn cluster_name(&self) -> Option<&str> {
        self.spec
            .patroni
            .as_ref()
            .and_then(|p| p.cluster_name.as_deref())
            .filter(|n| !n.is_empty())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct SiteManagerSpec {
    /// Address of the active site a standby replicates from.
    pub active_cluster_host: Option<String>,
    pub active_cluster_port: Option<u16>,
    pub standby_cluster_health_check: Option<StandbyClusterHealthCheck>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StandbyClusterHealthCheck {
    pub retries_limit: Option<i32>,
    pub failure_retries_limit: Option<i32>,
    /// Seconds between health checks.
    pub retries_wait_timeout: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct PatroniServicesStatus {
    #[serde(default)]
    pub site_manager_status: Option<SiteManagerStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sitemanager::{Mode, TransitionStatus};
    use serde_json::json;

    #[test]
    fn reads_site_manager_section() {
        let cr: PatroniServices = serde_json::from_value(json!({
            "apiVersion": "netcracker.com/v1",
            "kind": "PatroniServices",
            "metadata": {"name": "patroni-services", "namespace": "pg"},
            "spec": {
                "patroni": {"clusterName": "patroni"},
                "siteManager": {
                    "activeClusterHost": "pg-patroni.site-a.svc",
                    "activeClusterPort": 5432,
                    "standbyClusterHealthCheck": {
                        "retriesLimit": 3,
                        "failureRetriesLimit": 5,
                        "retriesWaitTimeout": 30
                    }
                },
                "backupDaemon": {"install": true}
            },
            "status": {
                "siteManagerStatus": {"mode": "standby", "status": "done"}
            }
        }))
        .unwrap();

        assert_eq!(cr.cluster_name(), Some("patroni"));
        let sm = cr.spec.site_manager.unwrap();
        assert_eq!(sm.active_cluster_port, Some(5432));
        assert_eq!(
            sm.standby_cluster_health_check.unwrap().retries_wait_timeout,
            Some(30)
        );
        let status = cr.status.unwrap().site_manager_status.unwrap();
        assert_eq!(status.mode, Some(Mode::Standby));
        assert_eq!(status.status, Some(TransitionStatus::Done));
    }
}
