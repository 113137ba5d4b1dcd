//! Tenant schema provisioning.
//!
//! Registration takes the synchronous path only for the reserved bootstrap
//! schemata (public and the template); ordinary tenants are recorded as
//! pending and picked up by the batch worker. The worker verifies the
//! server-side clone functions, reads the template structure once, then
//! claims, clones and commits batches of pending tenants until none remain.
//! Any number of workers may run this loop concurrently against the same
//! registry; mutual exclusion comes entirely from row locks held for the
//! lifetime of each batch transaction.

use sqlx::{PgConnection, PgPool};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::tenant;
use crate::models::tenant::Tenant;
use crate::services::clone_functions;
use crate::services::provision_scheduler;

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The requested name does not meet the schema identifier grammar.
    #[error("invalid schema name: \"{0}\"")]
    InvalidSchemaName(String),
    /// Required server-side function(s) absent even after a reinstall
    /// attempt. Signals a broken deployment, not a transient fault.
    #[error("clone functions missing after reinstall: {}", .0.join(", "))]
    CloneFunctionMissing(Vec<String>),
    /// The template schema is gone, either as a registry row or physically.
    #[error("template schema \"{0}\" does not exist")]
    CloneTemplateMissing(String),
}

/// Per-target outcome of a clone call, decoded once from the tagged
/// `+name` / `!name` strings returned by `public.create_schema`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloneOutcome {
    Created(String),
    Skipped(String),
}

impl CloneOutcome {
    pub fn parse(tagged: &str) -> anyhow::Result<Self> {
        if let Some(name) = tagged.strip_prefix('+') {
            Ok(CloneOutcome::Created(name.to_string()))
        } else if let Some(name) = tagged.strip_prefix('!') {
            Ok(CloneOutcome::Skipped(name.to_string()))
        } else {
            Err(anyhow::anyhow!("unrecognized clone result: {tagged:?}"))
        }
    }
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub batches: u32,
    pub created: usize,
    pub skipped: usize,
}

struct BatchSummary {
    created: Vec<String>,
    skipped: Vec<String>,
}

/// Synchronous entry point used at tenant registration.
///
/// Reserved schemata are bootstrapped immediately with the baseline objects;
/// every other name is validated, registered as pending and left for the
/// batch worker, with a fire-and-forget wake-up pushed onto the queue.
pub async fn create_tenant_schema(
    pool: &PgPool,
    redis: &redis::Client,
    config: &Config,
    schema_name: &str,
) -> anyhow::Result<Tenant> {
    if schema_name == "public" || schema_name == config.template_schema {
        info!("Bootstrapping reserved schema \"{schema_name}\" synchronously");
        return bootstrap_reserved_schema(pool, schema_name).await;
    }

    if !tenant::is_valid_schema_name(schema_name) {
        return Err(ProvisionError::InvalidSchemaName(schema_name.to_string()).into());
    }

    let mut tx = pool.begin().await?;
    let registered = match register_pending(&mut tx, config, schema_name).await {
        Ok(registered) => {
            tx.commit().await?;
            registered
        }
        Err(e) => {
            tx.rollback().await?;
            return Err(e);
        }
    };

    // The worker re-derives its backlog from registry state, so a lost
    // wake-up only delays provisioning until the next poll.
    if let Err(e) = provision_scheduler::enqueue_provision(redis).await {
        warn!("Could not enqueue provisioning wake-up for \"{schema_name}\": {e}");
    }

    Ok(registered)
}

/// A tenant can only be registered against a usable template; a missing
/// template is a configuration error the operator hears about right away.
async fn register_pending(
    conn: &mut PgConnection,
    config: &Config,
    schema_name: &str,
) -> anyhow::Result<Tenant> {
    verify_template(conn, &config.template_schema).await?;
    tenant::get_or_create(conn, schema_name).await
}

async fn bootstrap_reserved_schema(pool: &PgPool, schema_name: &str) -> anyhow::Result<Tenant> {
    tenant::bootstrap_schema(pool, schema_name).await?;

    let mut tx = pool.begin().await?;
    tenant::get_or_create(&mut tx, schema_name).await?;
    tenant::mark_created(&mut tx, &[schema_name.to_string()]).await?;
    let tenant = tenant::get(&mut tx, schema_name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("tenant row vanished for \"{schema_name}\""))?;
    tx.commit().await?;

    Ok(tenant)
}

/// One full batch-provisioning run: guard, template read, then
/// claim/clone/commit until a claim comes back empty.
pub async fn run(pool: &PgPool, config: &Config) -> anyhow::Result<RunSummary> {
    // Guard and template read happen before any claiming, in their own
    // transaction. A failure here aborts the run without touching a tenant.
    let mut tx = pool.begin().await?;
    let template_structure = match prepare_run(&mut tx, config).await {
        Ok(structure) => {
            tx.commit().await?;
            structure
        }
        Err(e) => {
            tx.rollback().await?;
            return Err(e);
        }
    };

    let mut summary = RunSummary::default();
    loop {
        let mut tx = pool.begin().await?;
        match process_batch(&mut tx, config, &template_structure).await {
            Ok(Some(batch)) => {
                tx.commit().await?;
                info!("Created schemata: {}", batch.created.join(", "));
                if !batch.skipped.is_empty() {
                    info!("Skipped existing schemata: {}", batch.skipped.join(", "));
                }
                summary.batches += 1;
                summary.created += batch.created.len();
                summary.skipped += batch.skipped.len();
            }
            Ok(None) => {
                tx.rollback().await?;
                break;
            }
            Err(e) => {
                // Revert the claim along with everything else: the batch
                // either lands created or exactly as it started.
                tx.rollback().await?;
                return Err(e);
            }
        }
    }

    Ok(summary)
}

async fn prepare_run(conn: &mut PgConnection, config: &Config) -> anyhow::Result<String> {
    clone_functions::ensure_clone_functions(conn).await?;
    verify_template(conn, &config.template_schema).await?;
    debug!(
        "Reading structure for template schema {}",
        config.template_schema
    );
    read_template_structure(conn, &config.template_schema).await
}

/// The template must exist both as a registry row and as a physical schema
/// before any clone is attempted.
pub async fn verify_template(conn: &mut PgConnection, template_schema: &str) -> anyhow::Result<()> {
    info!("Verifying that template schema \"{template_schema}\" exists");
    tenant::get_or_create(conn, template_schema).await?;
    if !tenant::schema_exists(conn, template_schema).await? {
        error!("Template schema \"{template_schema}\" does not exist");
        return Err(ProvisionError::CloneTemplateMissing(template_schema.to_string()).into());
    }
    Ok(())
}

async fn read_template_structure(
    conn: &mut PgConnection,
    template_schema: &str,
) -> anyhow::Result<String> {
    let structure: String = sqlx::query_scalar("SELECT public.read_schema($1)::text")
        .bind(template_schema)
        .fetch_one(&mut *conn)
        .await?;
    Ok(structure)
}

async fn process_batch(
    conn: &mut PgConnection,
    config: &Config,
    template_structure: &str,
) -> anyhow::Result<Option<BatchSummary>> {
    let batch = tenant::claim_pending_batch(conn, config.tenant_batch_size).await?;
    if batch.is_empty() {
        return Ok(None);
    }
    info!("Claimed {} pending tenant(s)", batch.len());

    let outcomes = create_schemata(conn, config, template_structure, &batch).await?;

    let mut created = Vec::new();
    let mut skipped = Vec::new();
    for outcome in outcomes {
        match outcome {
            CloneOutcome::Created(name) => created.push(name),
            CloneOutcome::Skipped(name) => skipped.push(name),
        }
    }

    // Skipped tenants keep schema_created = false; committing this
    // transaction releases their claim so a later run sees them again.
    tenant::mark_created(conn, &created).await?;

    Ok(Some(BatchSummary { created, skipped }))
}

/// Clone the whole batch in one round trip, reusing the structure read at
/// the start of the run.
async fn create_schemata(
    conn: &mut PgConnection,
    config: &Config,
    template_structure: &str,
    batch: &[String],
) -> anyhow::Result<Vec<CloneOutcome>> {
    let tagged: Vec<String> = sqlx::query_scalar(
        "SELECT public.create_schema($1, $2::jsonb, $3, copy_data => true)",
    )
    .bind(&config.template_schema)
    .bind(template_structure)
    .bind(batch)
    .fetch_one(&mut *conn)
    .await?;

    tagged.iter().map(|s| CloneOutcome::parse(s)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(database_url: &str) -> Config {
        Config {
            database_url: database_url.to_string(),
            redis_url: "redis://127.0.0.1:6379".into(),
            host: "127.0.0.1".into(),
            port: 0,
            template_schema: "template0".into(),
            tenant_batch_size: 25,
            super_admin_key: "test".into(),
        }
    }

    #[test]
    fn decodes_created_and_skipped_markers() {
        assert_eq!(
            CloneOutcome::parse("+acct10001").unwrap(),
            CloneOutcome::Created("acct10001".into())
        );
        assert_eq!(
            CloneOutcome::parse("!acct10002").unwrap(),
            CloneOutcome::Skipped("acct10002".into())
        );
    }

    #[test]
    fn rejects_unknown_markers() {
        assert!(CloneOutcome::parse("acct10003").is_err());
        assert!(CloneOutcome::parse("").is_err());
        assert!(CloneOutcome::parse("?acct10004").is_err());
    }

    #[test]
    fn error_messages_name_the_offender() {
        let err = ProvisionError::InvalidSchemaName("bad name; drop table x".into());
        assert!(err.to_string().contains("bad name; drop table x"));

        let err = ProvisionError::CloneFunctionMissing(vec![
            "public.read_schema".into(),
            "public.clone_schema".into(),
        ]);
        assert!(err.to_string().contains("public.read_schema, public.clone_schema"));

        let err = ProvisionError::CloneTemplateMissing("template0".into());
        assert!(err.to_string().contains("template0"));
    }

    /// An invalid name must fail before anything is registered or enqueued:
    /// the pool is lazy and Redis is never connected, so any round trip
    /// would error out loudly here.
    #[tokio::test]
    async fn invalid_name_fails_without_touching_the_store() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let redis = redis::Client::open("redis://127.0.0.1:1/").unwrap();
        let config = test_config("postgres://localhost/unused");

        let err = create_tenant_schema(&pool, &redis, &config, "bad name; drop table x")
            .await
            .unwrap_err();
        match err.downcast_ref::<ProvisionError>() {
            Some(ProvisionError::InvalidSchemaName(name)) => {
                assert_eq!(name, "bad name; drop table x");
            }
            other => panic!("expected InvalidSchemaName, got {other:?}"),
        }
    }

    // Live-database coverage. These need a PostgreSQL instance and are
    // ignored by default: TEST_DATABASE_URL=postgres://... cargo test -- --ignored

    async fn live_pool() -> PgPool {
        let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL not set");
        let pool = crate::db::create_pool(&url).await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        pool
    }

    async fn reset_registry(pool: &PgPool) {
        sqlx::query("DELETE FROM public.tenants")
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL instance (set TEST_DATABASE_URL)"]
    async fn batch_run_creates_pending_and_skips_existing() {
        let pool = live_pool().await;
        let config = test_config("");
        reset_registry(&pool).await;

        // Reserved bootstrap path: creates the physical template schema and
        // marks its registry row created, as server startup does.
        let redis = redis::Client::open("redis://127.0.0.1:1/").unwrap();
        let template = create_tenant_schema(&pool, &redis, &config, &config.template_schema)
            .await
            .unwrap();
        assert!(template.schema_created && !template.schema_create_running);

        let mut conn = pool.acquire().await.unwrap();
        for name in ["scenario_a", "scenario_b", "scenario_c"] {
            sqlx::raw_sql(&format!("DROP SCHEMA IF EXISTS {name} CASCADE"))
                .execute(&mut *conn)
                .await
                .unwrap();
            tenant::get_or_create(&mut conn, name).await.unwrap();
        }
        // scenario_c's schema already exists physically.
        sqlx::raw_sql("CREATE SCHEMA scenario_c")
            .execute(&mut *conn)
            .await
            .unwrap();
        drop(conn);

        let summary = run(&pool, &config).await.unwrap();
        assert_eq!(summary.created, 2);
        assert_eq!(summary.skipped, 1);

        let mut conn = pool.acquire().await.unwrap();
        let a = tenant::get(&mut conn, "scenario_a").await.unwrap().unwrap();
        let b = tenant::get(&mut conn, "scenario_b").await.unwrap().unwrap();
        let c = tenant::get(&mut conn, "scenario_c").await.unwrap().unwrap();
        assert!(a.schema_created && !a.schema_create_running);
        assert!(b.schema_created && !b.schema_create_running);
        // Skipped: claim released, still not marked created.
        assert!(!c.schema_created && !c.schema_create_running);

        // A second run claims nothing new: scenario_c is claimed again and
        // skipped again, the created tenants are untouched.
        let summary = run(&pool, &config).await.unwrap();
        assert_eq!(summary.created, 0);
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL instance (set TEST_DATABASE_URL)"]
    async fn concurrent_claims_never_overlap() {
        let pool = live_pool().await;
        reset_registry(&pool).await;

        let mut conn = pool.acquire().await.unwrap();
        for i in 0..10 {
            tenant::get_or_create(&mut conn, &format!("claim_race_{i}")).await.unwrap();
        }
        drop(conn);

        let mut tx_one = pool.begin().await.unwrap();
        let mut tx_two = pool.begin().await.unwrap();

        let first = tenant::claim_pending_batch(&mut tx_one, 6).await.unwrap();
        // The second claim must skip the locked rows instead of blocking.
        let second = tenant::claim_pending_batch(&mut tx_two, 6).await.unwrap();

        assert_eq!(first.len(), 6);
        assert_eq!(second.len(), 4);
        assert!(first.iter().all(|name| !second.contains(name)));

        // Abandoning both claims reverts every row to pending.
        tx_one.rollback().await.unwrap();
        tx_two.rollback().await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(tenant::pending_count(&mut conn).await.unwrap(), 10);
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL instance (set TEST_DATABASE_URL)"]
    async fn guard_reinstalls_missing_functions() {
        let pool = live_pool().await;

        let mut tx = pool.begin().await.unwrap();
        sqlx::raw_sql("DROP FUNCTION IF EXISTS public.read_schema(text, boolean)")
            .execute(&mut *tx)
            .await
            .unwrap();
        let missing = clone_functions::missing_functions(&mut tx).await.unwrap();
        assert!(missing.iter().any(|s| s.name == "read_schema"));

        clone_functions::ensure_clone_functions(&mut tx).await.unwrap();
        let missing = clone_functions::missing_functions(&mut tx).await.unwrap();
        assert!(missing.is_empty());
        tx.rollback().await.unwrap();
    }
}
