use std::collections::BTreeMap;

/// Names derived from the cluster name and namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterSettings {
    pub cluster_name: String,
    pub namespace: String,
    /// Base URL of the Patroni REST API, with trailing slash.
    pub patroni_url: String,
    /// In-cluster DNS name of the primary service.
    pub pg_host: String,
    /// Name prefix shared by every node statefulset.
    pub statefulset_prefix: String,
    pub external_service: String,
    pub config_map: String,
}

impl ClusterSettings {
    pub fn new(cluster_name: &str, namespace: &str) -> Self {
        ClusterSettings {
            cluster_name: cluster_name.to_string(),
            namespace: namespace.to_string(),
            patroni_url: format!("http://pg-{cluster_name}-api:8008/"),
            pg_host: format!("pg-{cluster_name}.{namespace}.svc.cluster.local"),
            statefulset_prefix: format!("pg-{cluster_name}-node"),
            external_service: format!("pg-{cluster_name}-external"),
            config_map: format!("{cluster_name}-config"),
        }
    }

    /// Labels shared by every Patroni member pod.
    pub fn common_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("app".to_string(), self.cluster_name.clone())])
    }

    pub fn label_selector(&self) -> String {
        self.common_labels()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_names_from_cluster() {
        let c = ClusterSettings::new("patroni", "pg");
        assert_eq!(c.patroni_url, "http://pg-patroni-api:8008/");
        assert_eq!(c.pg_host, "pg-patroni.pg.svc.cluster.local");
        assert_eq!(c.statefulset_prefix, "pg-patroni-node");
        assert_eq!(c.external_service, "pg-patroni-external");
        assert_eq!(c.config_map, "patroni-config");
        assert_eq!(c.label_selector(), "app=patroni");
    }
}
