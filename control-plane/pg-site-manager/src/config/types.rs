use std::fmt;
use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct SiteManagerConfig {
    #[envconfig(from = "HTTP_PORT", default = "8080")]
    pub http_port: u16,

    /// Namespace the operator and the database cluster live in.
    #[envconfig(from = "WATCH_NAMESPACE", default = "default")]
    pub namespace: String,

    #[envconfig(from = "PG_CLUSTER_NAME", default = "patroni")]
    pub cluster_name: String,

    /// Name of the `PatroniServices` resource carrying the site-manager status.
    #[envconfig(from = "PG_SERVICES_CR_NAME", default = "patroni-services")]
    pub services_cr_name: String,

    #[envconfig(from = "PG_CORE_CR_NAME", default = "patroni-core")]
    pub core_cr_name: String,

    #[envconfig(nested)]
    pub postgres: PostgresConfig,

    #[envconfig(nested)]
    pub auth: AuthConfig,

    #[envconfig(nested)]
    pub timings: TimingConfig,

    #[envconfig(nested)]
    pub cloud_sql: CloudSqlConfig,
}

#[derive(Envconfig, Clone)]
pub struct PostgresConfig {
    #[envconfig(from = "PG_ADMIN_USER", default = "postgres")]
    pub user: String,
    #[envconfig(from = "PG_ADMIN_PASSWORD")]
    pub password: Option<String>,
    #[envconfig(from = "PG_PORT", default = "5432")]
    pub port: u16,
    #[envconfig(from = "PG_DATABASE", default = "postgres")]
    pub database: String,
    #[envconfig(from = "PG_CONNECT_TIMEOUT_SECS", default = "10")]
    pub connect_timeout_secs: u64,
}

// Keep the password out of the startup log line.
impl fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("port", &self.port)
            .field("database", &self.database)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

/// Optional bearer-token protection of the HTTP surface.
#[derive(Envconfig, Clone, Debug)]
pub struct AuthConfig {
    #[envconfig(from = "SM_HTTP_AUTH", default = "false")]
    pub enabled: bool,
    /// Namespace of the service account allowed to call the API.
    #[envconfig(from = "SM_NAMESPACE", default = "site-manager")]
    pub sm_namespace: String,
    #[envconfig(from = "SM_AUTH_SA", default = "site-manager-sa")]
    pub sm_service_account: String,
    #[envconfig(from = "SM_CUSTOM_AUDIENCE")]
    pub custom_audience: Option<String>,
    /// Minutes a successful token review is remembered.
    #[envconfig(from = "TOKEN_SESSION_TIMEOUT", default = "5")]
    pub session_timeout_mins: u64,
}

impl AuthConfig {
    pub fn expected_user(&self) -> String {
        format!(
            "system:serviceaccount:{}:{}",
            self.sm_namespace, self.sm_service_account
        )
    }
}

/// Every wait in the transition procedures, in seconds.
#[derive(Envconfig, Clone, Debug)]
pub struct TimingConfig {
    #[envconfig(from = "SM_STANDBY_HEALTH_TIMEOUT_SECS", default = "60")]
    pub standby_health_timeout_secs: u64,
    #[envconfig(from = "SM_STANDBY_MAX_ATTEMPTS", default = "3")]
    pub standby_max_attempts: u32,
    #[envconfig(from = "SM_RECONCILE_INITIAL_DELAY_SECS", default = "10")]
    pub reconcile_initial_delay_secs: u64,
    #[envconfig(from = "SM_RECONCILE_POLL_SECS", default = "5")]
    pub reconcile_poll_secs: u64,
    #[envconfig(from = "SM_RECONCILE_TIMEOUT_SECS", default = "600")]
    pub reconcile_timeout_secs: u64,
    #[envconfig(from = "SM_STATUS_UPDATE_TIMEOUT_SECS", default = "60")]
    pub status_update_timeout_secs: u64,
    #[envconfig(from = "SM_POD_DELETE_TIMEOUT_SECS", default = "300")]
    pub pod_delete_timeout_secs: u64,
    #[envconfig(from = "SM_OPERATION_POLL_SECS", default = "5")]
    pub operation_poll_secs: u64,
    #[envconfig(from = "SM_OPERATION_TIMEOUT_SECS", default = "900")]
    pub operation_timeout_secs: u64,
    /// Budget for retrying 409 responses on insert/patch/delete.
    #[envconfig(from = "SM_PROVIDER_RETRY_TIMEOUT_SECS", default = "300")]
    pub provider_retry_timeout_secs: u64,
    #[envconfig(from = "SM_LAG_TIMEOUT_SECS", default = "900")]
    pub lag_timeout_secs: u64,
    #[envconfig(from = "SM_ACTIVE_PRECONFIGURE_DELAY_SECS", default = "30")]
    pub active_pre_configure_delay_secs: u64,
    #[envconfig(from = "SM_STARTUP_SYNC_ATTEMPTS", default = "5")]
    pub startup_sync_attempts: u32,
    // Fallbacks when PatroniServices leaves standbyClusterHealthCheck unset.
    #[envconfig(from = "SM_HEALTH_RETRIES_LIMIT", default = "3")]
    pub health_retries_limit: u32,
    #[envconfig(from = "SM_HEALTH_FAILURE_RETRIES_LIMIT", default = "10")]
    pub health_failure_retries_limit: u32,
    #[envconfig(from = "SM_HEALTH_RETRIES_WAIT_SECS", default = "10")]
    pub health_retries_wait_secs: u64,
}

/// Resolved durations handed to the backends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timings {
    pub standby_health_timeout: Duration,
    pub standby_max_attempts: u32,
    pub reconcile_initial_delay: Duration,
    pub reconcile_poll: Duration,
    pub reconcile_timeout: Duration,
    pub status_update_interval: Duration,
    pub status_update_timeout: Duration,
    pub pod_delete_interval: Duration,
    pub pod_delete_timeout: Duration,
    pub operation_poll: Duration,
    pub operation_timeout: Duration,
    pub provider_retry_timeout: Duration,
    pub lag_poll: Duration,
    pub lag_timeout: Duration,
    pub active_pre_configure_delay: Duration,
    pub startup_sync_attempts: u32,
    pub health: HealthCheckLimits,
}

/// How many consecutive healthy checks a transition needs, and how many
/// failed checks abort it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthCheckLimits {
    pub retries_limit: u32,
    pub failure_retries_limit: u32,
    pub wait: Duration,
}

impl HealthCheckLimits {
    /// Non-positive values from the custom resource fall back to `self`.
    pub fn overridden_by(
        self,
        retries_limit: Option<i32>,
        failure_retries_limit: Option<i32>,
        wait_secs: Option<i32>,
    ) -> Self {
        let pick = |v: Option<i32>| v.filter(|n| *n > 0).map(|n| n as u32);
        HealthCheckLimits {
            retries_limit: pick(retries_limit).unwrap_or(self.retries_limit),
            failure_retries_limit: pick(failure_retries_limit)
                .unwrap_or(self.failure_retries_limit),
            wait: pick(wait_secs)
                .map(|s| Duration::from_secs(s as u64))
                .unwrap_or(self.wait),
        }
    }
}

impl From<&TimingConfig> for Timings {
    fn from(t: &TimingConfig) -> Self {
        let secs = Duration::from_secs;
        Timings {
            standby_health_timeout: secs(t.standby_health_timeout_secs),
            standby_max_attempts: t.standby_max_attempts.max(1),
            reconcile_initial_delay: secs(t.reconcile_initial_delay_secs),
            reconcile_poll: secs(t.reconcile_poll_secs),
            reconcile_timeout: secs(t.reconcile_timeout_secs),
            status_update_interval: secs(1),
            status_update_timeout: secs(t.status_update_timeout_secs),
            pod_delete_interval: secs(2),
            pod_delete_timeout: secs(t.pod_delete_timeout_secs),
            operation_poll: secs(t.operation_poll_secs),
            operation_timeout: secs(t.operation_timeout_secs),
            provider_retry_timeout: secs(t.provider_retry_timeout_secs),
            lag_poll: secs(t.operation_poll_secs),
            lag_timeout: secs(t.lag_timeout_secs),
            active_pre_configure_delay: secs(t.active_pre_configure_delay_secs),
            startup_sync_attempts: t.startup_sync_attempts.max(1),
            health: HealthCheckLimits {
                retries_limit: t.health_retries_limit,
                failure_retries_limit: t.health_failure_retries_limit,
                wait: secs(t.health_retries_wait_secs),
            },
        }
    }
}

impl Default for Timings {
    fn default() -> Self {
        Timings::from(&TimingConfig::default_values())
    }
}

impl TimingConfig {
    pub fn default_values() -> Self {
        TimingConfig {
            standby_health_timeout_secs: 60,
            standby_max_attempts: 3,
            reconcile_initial_delay_secs: 10,
            reconcile_poll_secs: 5,
            reconcile_timeout_secs: 600,
            status_update_timeout_secs: 60,
            pod_delete_timeout_secs: 300,
            operation_poll_secs: 5,
            operation_timeout_secs: 900,
            provider_retry_timeout_secs: 300,
            lag_timeout_secs: 900,
            active_pre_configure_delay_secs: 30,
            startup_sync_attempts: 5,
            health_retries_limit: 3,
            health_failure_retries_limit: 10,
            health_retries_wait_secs: 10,
        }
    }
}

/// Managed-cloud discovery and client settings.
#[derive(Envconfig, Clone, Debug)]
pub struct CloudSqlConfig {
    #[envconfig(from = "SM_CLOUDSQL_CONFIGMAP", default = "cloud-sql-configuration")]
    pub configmap: String,
    #[envconfig(
        from = "SM_CLOUDSQL_SECRET",
        default = "cloudsql-instance-credentials"
    )]
    pub secret: String,
    /// Secret key holding the service-account JSON; any non-empty key is
    /// used when this one is absent.
    #[envconfig(from = "SM_CLOUDSQL_CREDENTIALS_KEY", default = "credentials.json")]
    pub credentials_key: String,
    #[envconfig(
        from = "SM_CLOUDSQL_API_URL",
        default = "https://sqladmin.googleapis.com/sql"
    )]
    pub api_url: String,
    #[envconfig(
        from = "SM_PRECONFIGURE_STATUS_PATH",
        default = "/tmp/.pre-configure-status.json"
    )]
    pub pre_configure_status_path: String,
    #[envconfig(from = "SM_CLOUDSQL_PROXY_HOST", default = "pg-cloudsql-proxy")]
    pub proxy_host: String,
    #[envconfig(from = "SM_CLOUDSQL_PROXY_DAEMONSET", default = "cloudsql-proxy")]
    pub proxy_daemonset: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> SiteManagerConfig {
        SiteManagerConfig {
            http_port: 8080,
            namespace: "pg".into(),
            cluster_name: "patroni".into(),
            services_cr_name: "patroni-services".into(),
            core_cr_name: "patroni-core".into(),
            postgres: PostgresConfig {
                user: "postgres".into(),
                password: Some("s3cret".into()),
                port: 5432,
                database: "postgres".into(),
                connect_timeout_secs: 10,
            },
            auth: AuthConfig {
                enabled: true,
                sm_namespace: "site-manager".into(),
                sm_service_account: "sm-client".into(),
                custom_audience: None,
                session_timeout_mins: 5,
            },
            timings: TimingConfig::default_values(),
            cloud_sql: CloudSqlConfig {
                configmap: "cloud-sql-configuration".into(),
                secret: "cloudsql-instance-credentials".into(),
                credentials_key: "credentials.json".into(),
                api_url: "https://sqladmin.googleapis.com/sql".into(),
                pre_configure_status_path: "/tmp/.pre-configure-status.json"
                    .into(),
                proxy_host: "pg-cloudsql-proxy".into(),
                proxy_daemonset: "cloudsql-proxy".into(),
            },
        }
    }

    #[test]
    fn debug_output_redacts_password() {
        let rendered = format!("{:?}", base());
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn expected_user_is_service_account_principal() {
        assert_eq!(
            base().auth.expected_user(),
            "system:serviceaccount:site-manager:sm-client"
        );
    }

    #[test]
    fn timings_convert_to_durations() {
        let t = Timings::from(&base().timings);
        assert_eq!(t.reconcile_timeout, Duration::from_secs(600));
        assert_eq!(t.status_update_interval, Duration::from_secs(1));
        assert_eq!(t.health.wait, Duration::from_secs(10));
        assert_eq!(t.standby_max_attempts, 3);
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        let mut cfg = base().timings;
        cfg.standby_max_attempts = 0;
        assert_eq!(Timings::from(&cfg).standby_max_attempts, 1);
    }

    #[test]
    fn health_limits_prefer_positive_resource_values() {
        let fallback = Timings::default().health;
        let merged = fallback.overridden_by(Some(7), Some(0), None);
        assert_eq!(merged.retries_limit, 7);
        assert_eq!(merged.failure_retries_limit, fallback.failure_retries_limit);
        assert_eq!(merged.wait, fallback.wait);

        let merged = fallback.overridden_by(None, Some(2), Some(1));
        assert_eq!(merged.failure_retries_limit, 2);
        assert_eq!(merged.wait, Duration::from_secs(1));
    }
}
