use std::sync::Arc;

use tracing::{debug, info, warn};

use super::ClusterSnapshot;
use crate::clients::{CoordinationApi, DatabaseOps};
use crate::sitemanager::HealthStatus;

const RUNNING_STATES: [&str; 3] = ["running", "streaming", "in archive recovery"];

/// True when every member reports a running state. Vacuously true for an
/// empty cluster.
pub fn all_members_running(snapshot: &ClusterSnapshot) -> bool {
    snapshot
        .members
        .iter()
        .all(|m| RUNNING_STATES.contains(&m.state.as_str()))
}

pub fn leader_exists(snapshot: &ClusterSnapshot) -> bool {
    snapshot.members.iter().any(|m| m.role.is_leader())
}

pub fn member_count_matches(snapshot: &ClusterSnapshot, expected: usize) -> bool {
    snapshot.members.len() == expected
}

/// Replicas streaming from the primary must cover every non-leader member.
pub fn replication_count_sufficient(streaming: usize, expected_members: usize) -> bool {
    streaming >= expected_members.saturating_sub(1)
}

pub fn is_healthy(snapshot: &ClusterSnapshot, expected: usize) -> bool {
    all_members_running(snapshot)
        && leader_exists(snapshot)
        && member_count_matches(snapshot, expected)
}

pub fn is_degraded(
    snapshot: &ClusterSnapshot,
    expected: usize,
    replication_ok: bool,
) -> bool {
    !(replication_ok && member_count_matches(snapshot, expected))
}

/// Outcome of one health assessment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterHealth {
    pub healthy: bool,
    pub degraded: bool,
}

impl ClusterHealth {
    pub fn is_up(&self) -> bool {
        self.healthy && !self.degraded
    }

    /// Degraded takes precedence over down.
    pub fn status(&self) -> HealthStatus {
        if self.degraded {
            HealthStatus::Degraded
        } else if self.healthy {
            HealthStatus::Up
        } else {
            HealthStatus::Down
        }
    }
}

/// Reads a fresh snapshot and the primary's replication view on every call.
#[derive(Clone)]
pub struct HealthEvaluator {
    coordination: Arc<dyn CoordinationApi>,
    database: Arc<dyn DatabaseOps>,
    pg_host: String,
}

impl HealthEvaluator {
    pub fn new(
        coordination: Arc<dyn CoordinationApi>,
        database: Arc<dyn DatabaseOps>,
        pg_host: impl Into<String>,
    ) -> Self {
        Self {
            coordination,
            database,
            pg_host: pg_host.into(),
        }
    }

    pub async fn expected_replication_count(&self, expected_members: usize) -> bool {
        match self.database.streaming_replica_count(&self.pg_host).await {
            Ok(n) => replication_count_sufficient(n, expected_members),
            Err(e) => {
                warn!(host = %self.pg_host, error = %e, "Can not query replication count");
                false
            }
        }
    }

    pub async fn assess(&self, expected_members: usize) -> ClusterHealth {
        let snapshot = match self.coordination.cluster().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Can not fetch Patroni cluster state");
                return ClusterHealth {
                    healthy: false,
                    degraded: false,
                };
            }
        };
        let healthy = is_healthy(&snapshot, expected_members);
        let replication_ok = self.expected_replication_count(expected_members).await;
        let degraded = is_degraded(&snapshot, expected_members, replication_ok);
        debug!(
            members = snapshot.members.len(),
            expected_members, healthy, degraded, "Assessed Patroni cluster"
        );
        ClusterHealth { healthy, degraded }
    }

    pub async fn is_up(&self, expected_members: usize) -> bool {
        let health = self.assess(expected_members).await;
        if !health.is_up() {
            info!(?health, "Patroni cluster is not healthy");
        }
        health.is_up()
    }
}
