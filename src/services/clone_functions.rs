//! Guard for the server-side cloning functions.
//!
//! The batch worker depends on three PL/pgSQL functions living in the
//! database. Deployments can lose them (fresh database, restored dump), so
//! every run re-checks the function catalog and reinstalls anything missing
//! from the embedded SQL sources before claiming a single tenant.

use sqlx::PgConnection;
use tracing::{error, info, warn};

use crate::services::provisioner::ProvisionError;

/// One required server-side function: where it lives, what it is called and
/// the full identity signature it must expose, plus the SQL source it can be
/// reinstalled from.
#[derive(Debug, Clone, Copy)]
pub struct CloneFunctionSpec {
    pub schema: &'static str,
    pub name: &'static str,
    pub signature: &'static str,
    pub source: &'static str,
}

impl CloneFunctionSpec {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// The three functions the provisioning loop depends on. The signatures are
/// part of the compatibility surface and are matched verbatim against
/// `pg_get_function_arguments`.
pub const CLONE_FUNCTIONS: [CloneFunctionSpec; 3] = [
    CloneFunctionSpec {
        schema: "public",
        name: "read_schema",
        signature: "public.read_schema(source_schema text, _verbose boolean DEFAULT false)",
        source: include_str!("../../sql/read_schema.sql"),
    },
    CloneFunctionSpec {
        schema: "public",
        name: "create_schema",
        signature: "public.create_schema(source_schema text, source_structure jsonb, \
                    new_schemata text[], copy_data boolean DEFAULT false, \
                    _verbose boolean DEFAULT false)",
        source: include_str!("../../sql/create_schema.sql"),
    },
    CloneFunctionSpec {
        schema: "public",
        name: "clone_schema",
        signature: "public.clone_schema(source_schema text, dest_schema text, \
                    copy_data boolean DEFAULT false, _verbose boolean DEFAULT false)",
        source: include_str!("../../sql/clone_schema.sql"),
    },
];

/// Verify all required functions exist, reinstalling any that are missing.
/// Still-missing functions after the reinstall are a deployment error and
/// abort the run.
pub async fn ensure_clone_functions(conn: &mut PgConnection) -> anyhow::Result<()> {
    info!("Verifying that clone function(s) exist");
    let missing = missing_functions(conn).await?;
    if missing.is_empty() {
        info!("Clone functions exist");
        return Ok(());
    }

    let names: Vec<String> = missing.iter().map(|s| s.qualified_name()).collect();
    warn!("Clone function(s) missing: {}", names.join(", "));

    for spec in &missing {
        info!("Installing clone function \"{}\"", spec.qualified_name());
        sqlx::raw_sql(&format!("SET search_path = {}", spec.schema))
            .execute(&mut *conn)
            .await?;
        sqlx::raw_sql(spec.source).execute(&mut *conn).await?;
    }
    sqlx::raw_sql("SET search_path = public")
        .execute(&mut *conn)
        .await?;

    let still_missing = missing_functions(conn).await?;
    if !still_missing.is_empty() {
        let names: Vec<String> = still_missing.iter().map(|s| s.qualified_name()).collect();
        error!(
            "Clone functions {} still missing after reinstall",
            names.join(", ")
        );
        return Err(ProvisionError::CloneFunctionMissing(names).into());
    }

    Ok(())
}

/// Check the function catalog for each required (schema, name, signature).
pub async fn missing_functions(
    conn: &mut PgConnection,
) -> anyhow::Result<Vec<CloneFunctionSpec>> {
    let mut missing = Vec::new();
    for spec in CLONE_FUNCTIONS {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (
                SELECT 1
                  FROM pg_proc p
                  JOIN pg_namespace n ON n.oid = p.pronamespace
                 WHERE n.nspname = $1
                   AND p.proname = $2
                   AND n.nspname || '.' || p.proname
                       || '(' || pg_get_function_arguments(p.oid) || ')' = $3
             )",
        )
        .bind(spec.schema)
        .bind(spec.name)
        .bind(spec.signature)
        .fetch_one(&mut *conn)
        .await?;

        if !exists {
            missing.push(spec);
        }
    }
    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specs_cover_the_three_required_functions() {
        let names: Vec<&str> = CLONE_FUNCTIONS.iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["read_schema", "create_schema", "clone_schema"]);
        assert!(CLONE_FUNCTIONS.iter().all(|s| s.schema == "public"));
    }

    #[test]
    fn signatures_match_their_function_names() {
        for spec in CLONE_FUNCTIONS {
            assert!(
                spec.signature.starts_with(&format!("{}.{}(", spec.schema, spec.name)),
                "signature {:?} does not open with the qualified name",
                spec.signature
            );
            assert!(spec.signature.ends_with(')'));
        }
    }

    #[test]
    fn sources_define_their_own_function() {
        for spec in CLONE_FUNCTIONS {
            assert!(
                spec.source.contains(&format!("CREATE OR REPLACE FUNCTION {}(", spec.name)),
                "embedded SQL for {} does not define it",
                spec.name
            );
        }
    }
}
