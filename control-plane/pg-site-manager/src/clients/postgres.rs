use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::NoTls;
use tracing::{debug, error, info};

use crate::config::PostgresConfig;
use crate::error::{Result, SiteManagerError};

const STREAMING_REPLICAS_QUERY: &str = "select pid from pg_stat_replication \
     where not exists (select active_pid from pg_replication_slots rep_slots \
     where pid = rep_slots.active_pid and plugin is not null) \
     and usename = 'replicator' and state = 'streaming'";

const TERMINATE_CONNECTIONS_QUERY: &str = "select pg_terminate_backend(pid) \
     from pg_stat_activity \
     where (datname != 'postgres' or datname is null) \
     and (usename != 'replicator' or usename is null) \
     and pid <> pg_backend_pid()";

const REPLICATION_LAG_QUERY: &str = "select pg_wal_lsn_diff(sent_lsn, flush_lsn)::bigint as lag \
     from pg_stat_replication where usename = 'cloudsqlreplica'";

/// Administrative SQL issued against a database host.
#[async_trait]
pub trait DatabaseOps: Send + Sync {
    /// Physical replicas streaming from `host`.
    async fn streaming_replica_count(&self, host: &str) -> Result<usize>;

    async fn terminate_active_connections(&self, host: &str) -> Result<()>;

    /// Largest byte lag of the managed replica stream; `None` when no such
    /// stream is attached.
    async fn replication_lag(&self, host: &str) -> Result<Option<i64>>;
}

#[derive(Clone)]
pub struct PgClient {
    cfg: PostgresConfig,
}

impl PgClient {
    pub fn new(cfg: PostgresConfig) -> Self {
        Self { cfg }
    }

    async fn connect(&self, host: &str) -> Result<tokio_postgres::Client> {
        let mut pg = tokio_postgres::Config::new();
        pg.host(host)
            .port(self.cfg.port)
            .user(&self.cfg.user)
            .dbname(&self.cfg.database)
            .connect_timeout(Duration::from_secs(self.cfg.connect_timeout_secs));
        if let Some(password) = &self.cfg.password {
            pg.password(password);
        }

        let (client, connection) = pg.connect(NoTls).await.map_err(|e| {
            SiteManagerError::DatabaseUnavailable {
                host: host.to_string(),
                reason: e.to_string(),
            }
        })?;
        let host = host.to_string();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(%host, error = %e, "PostgreSQL connection error");
            }
        });
        Ok(client)
    }
}

#[async_trait]
impl DatabaseOps for PgClient {
    async fn streaming_replica_count(&self, host: &str) -> Result<usize> {
        let client = self.connect(host).await?;
        let rows = client.query(STREAMING_REPLICAS_QUERY, &[]).await?;
        debug!(%host, replicas = rows.len(), "Counted streaming replicas");
        Ok(rows.len())
    }

    async fn terminate_active_connections(&self, host: &str) -> Result<()> {
        info!(%host, "Terminating active client connections");
        let client = self.connect(host).await?;
        let rows = client.query(TERMINATE_CONNECTIONS_QUERY, &[]).await?;
        info!(%host, terminated = rows.len(), "Active connections terminated");
        Ok(())
    }

    async fn replication_lag(&self, host: &str) -> Result<Option<i64>> {
        let client = self.connect(host).await?;
        let rows = client.query(REPLICATION_LAG_QUERY, &[]).await?;
        let mut lag = None;
        for row in rows {
            let value: Option<i64> = row.try_get("lag")?;
            lag = lag.max(value);
        }
        Ok(lag)
    }
}
