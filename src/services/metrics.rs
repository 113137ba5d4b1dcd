use lazy_static::lazy_static;
use prometheus::{register_counter, register_counter_vec, register_gauge, Counter, CounterVec, Gauge};
use sqlx::PgPool;
use tracing::{info, warn};

lazy_static! {
    // ── Event counters (increment on each event) ────────────────────────────
    pub static ref PROVISION_RUNS_COUNTER: CounterVec = register_counter_vec!(
        "provision_runs_total",
        "Batch provisioning runs by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref SCHEMAS_CREATED_COUNTER: Counter = register_counter!(
        "provision_schemas_created_total",
        "Tenant schemata created by the batch worker"
    ).unwrap();

    pub static ref SCHEMAS_SKIPPED_COUNTER: Counter = register_counter!(
        "provision_schemas_skipped_total",
        "Clone targets skipped because the schema already existed"
    ).unwrap();

    // ── Registry state ──────────────────────────────────────────────────────
    pub static ref TENANTS_GAUGE: Gauge = register_gauge!(
        "tenants_registered_total",
        "Rows in the tenant registry"
    ).unwrap();

    pub static ref TENANTS_CREATED_GAUGE: Gauge = register_gauge!(
        "tenants_created_total",
        "Tenants whose schema has been provisioned"
    ).unwrap();

    pub static ref TENANTS_PENDING_GAUGE: Gauge = register_gauge!(
        "tenants_pending_total",
        "Tenants waiting for the batch worker"
    ).unwrap();
}

/// Spawn the background metrics collector (refreshes every 5 minutes).
pub fn start(pool: PgPool) {
    tokio::spawn(async move {
        // Initial collection on startup
        if let Err(e) = collect(&pool).await {
            warn!("Metrics: initial collection failed: {}", e);
        }
        loop {
            tokio::time::sleep(tokio::time::Duration::from_secs(300)).await;
            if let Err(e) = collect(&pool).await {
                warn!("Metrics: collection failed: {}", e);
            }
        }
    });
}

async fn collect(pool: &PgPool) -> anyhow::Result<()> {
    let (total, created, pending): (i64, i64, i64) = sqlx::query_as(
        "SELECT COUNT(*),
                COUNT(*) FILTER (WHERE schema_created),
                COUNT(*) FILTER (WHERE NOT schema_created AND NOT schema_create_running)
           FROM public.tenants",
    )
    .fetch_one(pool)
    .await?;

    TENANTS_GAUGE.set(total as f64);
    TENANTS_CREATED_GAUGE.set(created as f64);
    TENANTS_PENDING_GAUGE.set(pending as f64);

    info!("Metrics: registry has {total} tenant(s), {pending} pending");
    Ok(())
}
