use std::sync::Arc;

use sqlx::PgPool;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::tenant;
use crate::services::metrics;
use crate::services::provisioner;

/// Redis list the schema-creation path pushes wake-ups onto. Messages carry
/// no payload; the worker re-derives its backlog from the registry.
const PROVISION_QUEUE_KEY: &str = "provision:tenant-schemas";

/// How long each BRPOP blocks before the loop falls back to polling the
/// registry directly.
const POLL_SECONDS: u64 = 30;

/// Push a wake-up onto the provisioning queue.
pub async fn enqueue_provision(client: &redis::Client) -> anyhow::Result<()> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    let _: i64 = redis::cmd("LPUSH")
        .arg(PROVISION_QUEUE_KEY)
        .arg(1)
        .query_async(&mut conn)
        .await?;
    Ok(())
}

/// Spawn the long-lived provisioning worker. It blocks on the queue with a
/// timeout, so the same loop covers both explicit wake-ups and a recurring
/// poll: on timeout it only runs when the registry reports pending tenants,
/// which also recovers wake-ups lost to a Redis outage.
pub fn start(pool: PgPool, redis: redis::Client, config: Arc<Config>) {
    tokio::spawn(async move {
        loop {
            let mut redis_conn = match redis.get_multiplexed_async_connection().await {
                Ok(c) => c,
                Err(e) => {
                    warn!("Provision worker: Redis unavailable: {e}");
                    tokio::time::sleep(tokio::time::Duration::from_secs(POLL_SECONDS)).await;
                    continue;
                }
            };

            let popped: Option<(String, String)> = redis::cmd("BRPOP")
                .arg(PROVISION_QUEUE_KEY)
                .arg(POLL_SECONDS)
                .query_async(&mut redis_conn)
                .await
                .unwrap_or(None);

            if popped.is_none() {
                match pending_backlog(&pool).await {
                    Ok(0) => continue,
                    Ok(n) => info!("Provision worker: poll found {n} pending tenant(s)"),
                    Err(e) => {
                        warn!("Provision worker: backlog check failed: {e}");
                        continue;
                    }
                }
            }

            match provisioner::run(&pool, &config).await {
                Ok(summary) => {
                    metrics::PROVISION_RUNS_COUNTER
                        .with_label_values(&["ok"])
                        .inc();
                    metrics::SCHEMAS_CREATED_COUNTER.inc_by(summary.created as f64);
                    metrics::SCHEMAS_SKIPPED_COUNTER.inc_by(summary.skipped as f64);
                }
                Err(e) => {
                    metrics::PROVISION_RUNS_COUNTER
                        .with_label_values(&["error"])
                        .inc();
                    error!("Provision worker: run failed: {e:#}");
                }
            }
        }
    });
}

async fn pending_backlog(pool: &PgPool) -> anyhow::Result<i64> {
    let mut conn = pool.acquire().await?;
    tenant::pending_count(&mut conn).await
}
