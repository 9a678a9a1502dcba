#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pg_site_manager::{
    Result, SiteManagerError,
    backend::SiteBackend,
    clients::{CoordinationApi, DatabaseOps},
    cloudsql::{
        CLOUD_SQL_INSTANCE, DatabaseInstance, ManagedDbProvider, Operation, OPERATION_DONE,
        READ_REPLICA_INSTANCE, STATE_RUNNABLE, Settings,
    },
    config::{HealthCheckLimits, Timings},
    crd::{SiteManagerSpec, StandbyCluster},
    health::{ClusterSnapshot, Member, MemberRole},
    k8s::{PatroniWorkloads, ProxyControl},
    sitemanager::{
        HealthStatus, MemoryStatusStore, Mode, ModeChangeRequest, SiteManagerStatus, StatusStore,
        TransitionStatus,
    },
};
use serde_json::Value;
use tokio::sync::Semaphore;

/// Timings short enough for real-clock tests and still valid under a paused
/// clock.
pub fn fast_timings() -> Timings {
    let ms = Duration::from_millis;
    Timings {
        standby_health_timeout: ms(20),
        standby_max_attempts: 2,
        reconcile_initial_delay: ms(1),
        reconcile_poll: ms(1),
        reconcile_timeout: ms(50),
        status_update_interval: ms(1),
        status_update_timeout: ms(20),
        pod_delete_interval: ms(1),
        pod_delete_timeout: ms(20),
        operation_poll: ms(1),
        operation_timeout: ms(50),
        provider_retry_timeout: ms(50),
        lag_poll: ms(1),
        lag_timeout: ms(20),
        active_pre_configure_delay: ms(1),
        startup_sync_attempts: 2,
        health: HealthCheckLimits {
            retries_limit: 2,
            failure_retries_limit: 3,
            wait: ms(1),
        },
    }
}

pub fn member(name: &str, role: MemberRole, state: &str) -> Member {
    Member {
        name: name.to_string(),
        role,
        state: state.to_string(),
        api_url: None,
        host: None,
        port: None,
        timeline: Some(1),
    }
}

pub fn healthy_snapshot(members: usize) -> ClusterSnapshot {
    let mut out = vec![member("node-1", MemberRole::StandbyLeader, "running")];
    for i in 1..members {
        out.push(member(&format!("node-{}", i + 1), MemberRole::Replica, "streaming"));
    }
    ClusterSnapshot { members: out }
}

/// Patroni double. Reports a healthy cluster of `members` while `healthy` is
/// set, an empty one otherwise.
pub struct FakeCoordination {
    pub members: usize,
    pub healthy: AtomicBool,
    pub patches: Mutex<Vec<Value>>,
    pub cluster_calls: AtomicUsize,
}

impl FakeCoordination {
    pub fn new(members: usize, healthy: bool) -> Arc<Self> {
        Arc::new(Self {
            members,
            healthy: AtomicBool::new(healthy),
            patches: Mutex::new(Vec::new()),
            cluster_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn patches(&self) -> Vec<Value> {
        self.patches.lock().unwrap().clone()
    }
}

#[async_trait]
impl CoordinationApi for FakeCoordination {
    async fn cluster(&self) -> Result<ClusterSnapshot> {
        self.cluster_calls.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(healthy_snapshot(self.members))
        } else {
            Ok(ClusterSnapshot::default())
        }
    }

    async fn patch_config(&self, patch: &Value) -> Result<()> {
        self.patches.lock().unwrap().push(patch.clone());
        Ok(())
    }
}

/// PostgreSQL double.
pub struct FakeDatabase {
    pub streaming: AtomicUsize,
    pub unreachable: AtomicBool,
    pub terminated: Mutex<Vec<String>>,
    /// Successive lag readings; empty means no managed replica stream.
    pub lag: Mutex<VecDeque<Option<i64>>>,
    pub lag_queries: AtomicUsize,
}

impl FakeDatabase {
    pub fn new(streaming: usize) -> Arc<Self> {
        Arc::new(Self {
            streaming: AtomicUsize::new(streaming),
            unreachable: AtomicBool::new(false),
            terminated: Mutex::new(Vec::new()),
            lag: Mutex::new(VecDeque::new()),
            lag_queries: AtomicUsize::new(0),
        })
    }

    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }
}

#[async_trait]
impl DatabaseOps for FakeDatabase {
    async fn streaming_replica_count(&self, _host: &str) -> Result<usize> {
        Ok(self.streaming.load(Ordering::SeqCst))
    }

    async fn terminate_active_connections(&self, host: &str) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(SiteManagerError::DatabaseUnavailable {
                host: host.to_string(),
                reason: "connection refused".into(),
            });
        }
        self.terminated.lock().unwrap().push(host.to_string());
        Ok(())
    }

    async fn replication_lag(&self, _host: &str) -> Result<Option<i64>> {
        self.lag_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.lag.lock().unwrap().pop_front().flatten())
    }
}

/// Kubernetes workload double recording each call as a short string.
pub struct FakeWorkloads {
    pub spec: Mutex<SiteManagerSpec>,
    pub expected: usize,
    pub reconcile_failed: AtomicBool,
    /// Coordination double whose health follows `scale_members`/`reinit_members`.
    pub heal_on_reinit: Option<Arc<FakeCoordination>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeWorkloads {
    pub fn new(active_host: &str, expected: usize) -> Self {
        Self {
            spec: Mutex::new(SiteManagerSpec {
                active_cluster_host: Some(active_host.to_string()),
                active_cluster_port: Some(5432),
                standby_cluster_health_check: None,
            }),
            expected,
            reconcile_failed: AtomicBool::new(false),
            heal_on_reinit: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn healing(mut self, coordination: Arc<FakeCoordination>) -> Self {
        self.heal_on_reinit = Some(coordination);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl PatroniWorkloads for FakeWorkloads {
    async fn site_manager_spec(&self) -> Result<SiteManagerSpec> {
        Ok(self.spec.lock().unwrap().clone())
    }

    async fn expected_members(&self) -> Result<usize> {
        Ok(self.expected)
    }

    async fn set_standby_source(&self, source: Option<&StandbyCluster>) -> Result<()> {
        self.record(match source {
            Some(s) => format!("standby_source:{}:{}", s.host, s.port),
            None => "standby_source:none".to_string(),
        });
        Ok(())
    }

    async fn wait_until_reconcile_done(&self) -> Result<()> {
        self.record("reconcile_wait".into());
        if self.reconcile_failed.load(Ordering::SeqCst) {
            return Err(SiteManagerError::ReconcileFailed);
        }
        Ok(())
    }

    async fn scale_members(&self, replicas: i32) -> Result<()> {
        self.record(format!("scale:{replicas}"));
        Ok(())
    }

    async fn reinit_members(&self) -> Result<()> {
        self.record("reinit".into());
        if let Some(c) = &self.heal_on_reinit {
            c.set_healthy(true);
        }
        Ok(())
    }

    async fn remove_cleaner_init(&self) -> Result<()> {
        self.record("remove_cleaner".into());
        Ok(())
    }

    async fn point_external_service(&self, external_name: &str) -> Result<()> {
        self.record(format!("external:{external_name}"));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeProxy {
    pub targets: Mutex<Vec<String>>,
}

impl FakeProxy {
    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProxyControl for FakeProxy {
    async fn repoint_proxy(&self, connection_name: &str) -> Result<()> {
        self.targets.lock().unwrap().push(connection_name.to_string());
        Ok(())
    }
}

pub fn cloud_instance(
    name: &str,
    region: &str,
    instance_type: &str,
    namespace: &str,
) -> DatabaseInstance {
    DatabaseInstance {
        name: Some(name.to_string()),
        region: Some(region.to_string()),
        instance_type: Some(instance_type.to_string()),
        connection_name: Some(format!("proj:{region}:{name}")),
        state: Some(STATE_RUNNABLE.to_string()),
        database_version: Some("POSTGRES_15".to_string()),
        settings: Some(Settings {
            user_labels: [("namespace".to_string(), namespace.to_string())]
                .into_iter()
                .collect(),
            tier: Some("db-custom-2-7680".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn done_op(name: &str) -> Operation {
    Operation {
        name: name.to_string(),
        status: Some(OPERATION_DONE.to_string()),
        ..Default::default()
    }
}

/// In-memory Cloud SQL. Mutations apply immediately and their operations are
/// already done. Errors queued under a method name are returned first.
#[derive(Default)]
pub struct FakeProvider {
    pub instances: Mutex<Vec<DatabaseInstance>>,
    pub calls: Mutex<Vec<String>>,
    pub failures: Mutex<HashMap<&'static str, VecDeque<SiteManagerError>>>,
    pub operations: Mutex<HashMap<String, VecDeque<Operation>>>,
}

impl FakeProvider {
    pub fn with_instances(instances: Vec<DatabaseInstance>) -> Arc<Self> {
        Arc::new(Self {
            instances: Mutex::new(instances),
            ..Default::default()
        })
    }

    pub fn fail_next(&self, method: &'static str, error: SiteManagerError) {
        self.failures
            .lock()
            .unwrap()
            .entry(method)
            .or_default()
            .push_back(error);
    }

    /// Script the states `get_operation(name)` reports, in order.
    pub fn script_operation(&self, name: &str, states: Vec<Operation>) {
        self.operations
            .lock()
            .unwrap()
            .insert(name.to_string(), states.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn instances(&self) -> Vec<DatabaseInstance> {
        self.instances.lock().unwrap().clone()
    }

    fn enter(&self, method: &'static str, call: String) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        match self
            .failures
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(|q| q.pop_front())
        {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ManagedDbProvider for FakeProvider {
    async fn list_instances(&self) -> Result<Vec<DatabaseInstance>> {
        self.enter("list", "list".into())?;
        Ok(self.instances())
    }

    async fn insert_instance(&self, instance: &DatabaseInstance) -> Result<Operation> {
        self.enter("insert", format!("insert:{}", instance.name()))?;
        let mut created = instance.clone();
        created.state = Some(STATE_RUNNABLE.to_string());
        created.connection_name = Some(format!(
            "proj:{}:{}",
            created.region.clone().unwrap_or_default(),
            created.name()
        ));
        self.instances.lock().unwrap().push(created);
        Ok(done_op(&format!("insert-{}", instance.name())))
    }

    async fn delete_instance(&self, name: &str) -> Result<Operation> {
        self.enter("delete", format!("delete:{name}"))?;
        self.instances.lock().unwrap().retain(|i| i.name() != name);
        Ok(done_op(&format!("delete-{name}")))
    }

    async fn promote_replica(&self, name: &str) -> Result<Operation> {
        self.enter("promote", format!("promote:{name}"))?;
        for i in self.instances.lock().unwrap().iter_mut() {
            if i.name() == name {
                i.instance_type = Some(CLOUD_SQL_INSTANCE.to_string());
                i.master_instance_name = None;
            }
        }
        Ok(done_op(&format!("promote-{name}")))
    }

    async fn patch_instance(&self, name: &str, patch: &DatabaseInstance) -> Result<Operation> {
        let availability = patch
            .settings
            .as_ref()
            .and_then(|s| s.availability_type.clone())
            .unwrap_or_default();
        self.enter("patch", format!("patch:{name}:{availability}"))?;
        Ok(done_op(&format!("patch-{name}")))
    }

    async fn get_operation(&self, name: &str) -> Result<Operation> {
        self.enter("operation", format!("operation:{name}"))?;
        let scripted = self
            .operations
            .lock()
            .unwrap()
            .get_mut(name)
            .and_then(|q| q.pop_front());
        Ok(scripted.unwrap_or_else(|| done_op(name)))
    }
}

pub fn is_replica(i: &DatabaseInstance) -> bool {
    i.is_type(READ_REPLICA_INSTANCE)
}

/// Backend double for controller and HTTP tests. Transitions block until
/// `release` is called.
pub struct FakeBackend {
    pub calls: AtomicUsize,
    pub pre_configure_calls: AtomicUsize,
    pub fail: AtomicBool,
    pub gate: Semaphore,
    pub observed: Mutex<Option<Mode>>,
    pub health: Mutex<HealthStatus>,
    pub pre_configure: bool,
    pub rejected: Mutex<Vec<(Mode, Option<Mode>)>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    pub fn with_pre_configure() -> Arc<Self> {
        Self::build(true)
    }

    fn build(pre_configure: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            pre_configure_calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            gate: Semaphore::new(0),
            observed: Mutex::new(None),
            health: Mutex::new(HealthStatus::Up),
            pre_configure,
            rejected: Mutex::new(Vec::new()),
        })
    }

    /// Let `n` blocked transitions finish.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn pass_gate(&self) -> Result<()> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| SiteManagerError::Internal(e.to_string()))?;
        permit.forget();
        if self.fail.load(Ordering::SeqCst) {
            return Err(SiteManagerError::Unhealthy("scripted failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SiteBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn request_mode_change(&self, _req: &ModeChangeRequest) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await
    }

    async fn health(&self) -> HealthStatus {
        *self.health.lock().unwrap()
    }

    async fn current_mode(&self) -> Result<Option<Mode>> {
        Ok(self.observed.lock().unwrap().clone())
    }

    fn supports_pre_configure(&self) -> bool {
        self.pre_configure
    }

    async fn pre_configure(&self, _req: &ModeChangeRequest) -> Result<()> {
        self.pre_configure_calls.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await
    }

    async fn reject_unsupported(&self, requested: &Mode, current: Option<&Mode>) {
        self.rejected
            .lock()
            .unwrap()
            .push((requested.clone(), current.cloned()));
    }
}

/// Status store whose reads and writes can be made to fail. The record
/// itself lives in `inner`, which tests inspect directly.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStatusStore,
    pub failing_loads: AtomicUsize,
    pub loads: AtomicUsize,
    pub reject_done: AtomicBool,
    pub reject_all_saves: AtomicBool,
}

impl FlakyStore {
    pub fn with_status(status: SiteManagerStatus) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStatusStore::with_status(status),
            ..Default::default()
        })
    }

    /// Make the next `n` loads fail.
    pub fn fail_loads(&self, n: usize) {
        self.failing_loads.store(n, Ordering::SeqCst);
    }

    pub async fn record(&self) -> SiteManagerStatus {
        self.inner.load().await.unwrap()
    }
}

#[async_trait]
impl StatusStore for FlakyStore {
    async fn load(&self) -> Result<SiteManagerStatus> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SiteManagerError::Internal("transient api error".into()));
        }
        self.inner.load().await
    }

    async fn save(&self, status: &SiteManagerStatus) -> Result<()> {
        let rejected = self.reject_all_saves.load(Ordering::SeqCst)
            || (self.reject_done.load(Ordering::SeqCst)
                && status.status == Some(TransitionStatus::Done));
        if rejected {
            return Err(SiteManagerError::Internal("write rejected".into()));
        }
        self.inner.save(status).await
    }
}

/// Poll `check` on the real clock until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub struct EnvGuard {
    key: &'static str,
    old: Option<String>,
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        unsafe {
            if let Some(ref v) = self.old {
                std::env::set_var(self.key, v);
            } else {
                std::env::remove_var(self.key);
            }
        }
    }
}

pub fn set_env(key: &'static str, val: &str) -> EnvGuard {
    let old = std::env::var(key).ok();
    unsafe {
        std::env::set_var(key, val);
    }
    EnvGuard { key, old }
}
