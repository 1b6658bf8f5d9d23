use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool,
};
use tracing::{info, instrument};

use crate::util::env::{env_flag, env_parse};

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    /// Connect a pool for bulk loading. Never runs migrations; the target schema
    /// is expected to exist.
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let use_prepared = env_flag("USE_PREPARED", false);
        let mut connect_options = PgConnectOptions::from_str(database_url)?;

        if database_url.contains("sslmode=require") && !database_url.contains("sslmode=disable") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        if !use_prepared {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        // Optional fast-ingest session tuning
        let fast_ingest = env_flag("FAST_INGEST", false);
        let work_mem_mb: u32 = env_parse("FAST_INGEST_WORK_MEM_MB", 64);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    let _ = sqlx::query("SET application_name = 'surveillance_ingest'")
                        .persistent(false)
                        .execute(&mut *conn)
                        .await;
                    if fast_ingest {
                        // Best-effort; ignore errors to avoid blocking startup in restricted envs
                        let _ = sqlx::query("SET synchronous_commit = 'off'")
                            .persistent(false)
                            .execute(&mut *conn)
                            .await;
                        let _ = sqlx::query(&format!("SET work_mem = '{}MB'", work_mem_mb))
                            .persistent(false)
                            .execute(&mut *conn)
                            .await;
                    }
                    Ok(())
                })
            })
            .connect_with(connect_options)
            .await?;
        info!(max_connections, fast_ingest, "connected to db");
        Ok(Self { pool })
    }
}
