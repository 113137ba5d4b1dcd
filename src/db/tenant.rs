use sqlx::{PgConnection, PgPool};

use crate::models::tenant::Tenant;

/// Baseline objects applied to a freshly bootstrapped schema.
const TENANT_BASELINE_SQL: &str = include_str!("../../sql/tenant_baseline.sql");

/// Conservative schema-name grammar, safe to splice into DDL as a raw
/// identifier: lowercase letter or underscore first, then lowercase
/// alphanumerics and underscores, at most 63 bytes, and never the reserved
/// `pg_` prefix.
pub fn is_valid_schema_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= 63
        && !name.starts_with("pg_")
        && (first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Conditional insert under the uniqueness constraint: returns the existing
/// row when one is already registered, the freshly inserted row otherwise.
pub async fn get_or_create(conn: &mut PgConnection, schema_name: &str) -> anyhow::Result<Tenant> {
    let inserted = sqlx::query_as::<_, Tenant>(
        "INSERT INTO public.tenants (schema_name) VALUES ($1)
         ON CONFLICT (schema_name) DO NOTHING
         RETURNING *",
    )
    .bind(schema_name)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(tenant) = inserted {
        return Ok(tenant);
    }

    let existing = sqlx::query_as::<_, Tenant>("SELECT * FROM public.tenants WHERE schema_name = $1")
        .bind(schema_name)
        .fetch_one(&mut *conn)
        .await?;
    Ok(existing)
}

pub async fn get(conn: &mut PgConnection, schema_name: &str) -> anyhow::Result<Option<Tenant>> {
    let tenant = sqlx::query_as::<_, Tenant>("SELECT * FROM public.tenants WHERE schema_name = $1")
        .bind(schema_name)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(tenant)
}

pub async fn list(pool: &PgPool) -> anyhow::Result<Vec<Tenant>> {
    let tenants = sqlx::query_as::<_, Tenant>("SELECT * FROM public.tenants ORDER BY schema_name")
        .fetch_all(pool)
        .await?;
    Ok(tenants)
}

/// Whether the schema physically exists, independent of registry state.
pub async fn schema_exists(conn: &mut PgConnection, schema_name: &str) -> anyhow::Result<bool> {
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1)")
            .bind(schema_name)
            .fetch_one(&mut *conn)
            .await?;
    Ok(exists)
}

/// Atomically lock and flag up to `limit` pending tenants. The locking read
/// skips rows claimed by a concurrent worker instead of waiting on them, and
/// the flag flip happens in the same statement, so a row can only ever be
/// claimed once at a time. The claim lives and dies with the enclosing
/// transaction: a rollback reverts the rows to pending.
pub async fn claim_pending_batch(
    conn: &mut PgConnection,
    limit: i64,
) -> anyhow::Result<Vec<String>> {
    let claimed: Vec<String> = sqlx::query_scalar(
        "UPDATE public.tenants t
            SET schema_create_running = TRUE,
                schema_created = FALSE,
                updated_at = NOW()
           FROM (
                 SELECT schema_name
                   FROM public.tenants
                  WHERE schema_created = FALSE
                    AND schema_create_running = FALSE
                  LIMIT $1
                    FOR UPDATE SKIP LOCKED
                ) pending
          WHERE t.schema_name = pending.schema_name
        RETURNING t.schema_name",
    )
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;
    Ok(claimed)
}

/// Flip successfully cloned tenants to created and release their claim.
pub async fn mark_created(conn: &mut PgConnection, schema_names: &[String]) -> anyhow::Result<()> {
    if schema_names.is_empty() {
        return Ok(());
    }
    sqlx::query(
        "UPDATE public.tenants
            SET schema_create_running = FALSE,
                schema_created = TRUE,
                updated_at = NOW()
          WHERE schema_name = ANY($1)",
    )
    .bind(schema_names)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Tenants eligible for claiming right now.
pub async fn pending_count(conn: &mut PgConnection) -> anyhow::Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM public.tenants
          WHERE schema_created = FALSE AND schema_create_running = FALSE",
    )
    .fetch_one(&mut *conn)
    .await?;
    Ok(count)
}

/// Create a schema directly and apply the baseline objects, without cloning.
/// Used only for the reserved bootstrap schemata (public and the template).
pub async fn bootstrap_schema(pool: &PgPool, schema_name: &str) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::raw_sql(&format!(
        "CREATE SCHEMA IF NOT EXISTS \"{schema_name}\" AUTHORIZATION CURRENT_USER"
    ))
    .execute(&mut *tx)
    .await?;

    // SET LOCAL scopes the search path to this transaction; it resets on
    // commit, so the baseline's unqualified names land in the new schema.
    sqlx::raw_sql(&format!("SET LOCAL search_path = \"{schema_name}\", public"))
        .execute(&mut *tx)
        .await?;
    sqlx::raw_sql(TENANT_BASELINE_SQL).execute(&mut *tx).await?;

    tx.commit().await?;

    tracing::info!("Bootstrapped schema: {schema_name}");
    Ok(())
}

/// Drop a tenant's schema (cascading to everything in it) and remove the
/// registry row. Returns false if no row was registered under that name.
pub async fn drop_tenant(pool: &PgPool, schema_name: &str) -> anyhow::Result<bool> {
    let mut tx = pool.begin().await?;

    sqlx::raw_sql(&format!("DROP SCHEMA IF EXISTS \"{schema_name}\" CASCADE"))
        .execute(&mut *tx)
        .await?;

    let deleted = sqlx::query("DELETE FROM public.tenants WHERE schema_name = $1")
        .bind(schema_name)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(deleted.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_conservative_identifiers() {
        assert!(is_valid_schema_name("acct10001"));
        assert!(is_valid_schema_name("_staging"));
        assert!(is_valid_schema_name("tenant_42_west"));
        assert!(is_valid_schema_name("template0"));
    }

    #[test]
    fn rejects_injection_and_bad_grammar() {
        assert!(!is_valid_schema_name(""));
        assert!(!is_valid_schema_name("bad name; drop table x"));
        assert!(!is_valid_schema_name("1starts_with_digit"));
        assert!(!is_valid_schema_name("Uppercase"));
        assert!(!is_valid_schema_name("has-dash"));
        assert!(!is_valid_schema_name("dotted.name"));
        assert!(!is_valid_schema_name("quoted\"name"));
    }

    #[test]
    fn rejects_reserved_prefix_and_overlong_names() {
        assert!(!is_valid_schema_name("pg_catalog"));
        assert!(!is_valid_schema_name("pg_tenant"));

        let at_limit = "a".repeat(63);
        assert!(is_valid_schema_name(&at_limit));
        let over_limit = "a".repeat(64);
        assert!(!is_valid_schema_name(&over_limit));
    }
}
