use kube::CustomResource;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default)]
#[kube(
    group = "netcracker.com",
    version = "v1",
    kind = "PatroniCore",
    plural = "patronicores",
    namespaced,
    status = "PatroniCoreStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct PatroniCoreSpec {
    pub patroni: Option<PatroniSection>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct PatroniSection {
    /// Desired number of cluster members.
    pub replicas: Option<i32>,
    pub standby_cluster: Option<StandbyCluster>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct StandbyCluster {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct PatroniCoreStatus {
    #[serde(default)]
    pub conditions: Vec<CoreCondition>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CoreCondition {
    #[serde(rename = "type", default)]
    pub type_: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Progress of the operator's reconcile cycle, from the first condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcilePhase {
    InProgress,
    Failed,
    Idle,
}

impl PatroniCore {
    pub fn expected_members(&self) -> usize {
        self.spec
            .patroni
            .as_ref()
            .and_then(|p| p.replicas)
            .map(|n| n.max(0) as usize)
            .unwrap_or(0)
    }

    pub fn reconcile_phase(&self) -> ReconcilePhase {
        let first = self
            .status
            .as_ref()
            .and_then(|s| s.conditions.first())
            .map(|c| c.type_.to_lowercase());
        match first.as_deref() {
            Some("in progress") => ReconcilePhase::InProgress,
            Some("failed") => ReconcilePhase::Failed,
            _ => ReconcilePhase::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn core(conditions: serde_json::Value) -> PatroniCore {
        serde_json::from_value(json!({
            "apiVersion": "netcracker.com/v1",
            "kind": "PatroniCore",
            "metadata": {"name": "patroni-core"},
            "spec": {"patroni": {"replicas": 2, "image": "patroni:latest"}},
            "status": {"conditions": conditions}
        }))
        .unwrap()
    }

    #[test]
    fn reconcile_phase_from_first_condition() {
        assert_eq!(
            core(json!([{"type": "In progress"}])).reconcile_phase(),
            ReconcilePhase::InProgress
        );
        assert_eq!(
            core(json!([{"type": "Failed"}, {"type": "Successful"}])).reconcile_phase(),
            ReconcilePhase::Failed
        );
        assert_eq!(
            core(json!([{"type": "Successful"}])).reconcile_phase(),
            ReconcilePhase::Idle
        );
        assert_eq!(core(json!([])).reconcile_phase(), ReconcilePhase::Idle);
    }

    #[test]
    fn expected_members_from_replicas() {
        assert_eq!(core(json!([])).expected_members(), 2);
    }
}
