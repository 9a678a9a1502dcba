use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CLOUD_SQL_INSTANCE: &str = "CLOUD_SQL_INSTANCE";
pub const READ_REPLICA_INSTANCE: &str = "READ_REPLICA_INSTANCE";
pub const STATE_RUNNABLE: &str = "RUNNABLE";
pub const OPERATION_DONE: &str = "DONE";

/// Subset of the `DatabaseInstance` resource this crate reads or writes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseInstance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_instance_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Settings>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_type: Option<String>,
    /// Kept opaque so a replica inherits every network setting of its
    /// primary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_configuration: Option<Value>,
}

impl DatabaseInstance {
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }

    pub fn is_type(&self, instance_type: &str) -> bool {
        self.instance_type.as_deref() == Some(instance_type)
    }

    pub fn in_region(&self, region: &str) -> bool {
        self.region.as_deref() == Some(region)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.settings
            .as_ref()
            .and_then(|s| s.user_labels.get(key))
            .map(String::as_str)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct InstancesListResponse {
    #[serde(default)]
    pub items: Vec<DatabaseInstance>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub operation_type: Option<String>,
    #[serde(default)]
    pub error: Option<OperationErrors>,
}

impl Operation {
    pub fn is_done(&self) -> bool {
        self.status.as_deref() == Some(OPERATION_DONE)
    }

    pub fn errors(&self) -> &[OperationError] {
        self.error.as_ref().map(|e| e.errors.as_slice()).unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationErrors {
    #[serde(default)]
    pub errors: Vec<OperationError>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}
