use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One row of the tenant registry (`public.tenants`).
///
/// `schema_created` flips to true once the tenant's schema has been cloned
/// and is ready for use; `schema_create_running` is true only while a worker
/// holds an exclusive claim on the row inside an open transaction.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Tenant {
    pub id: Uuid,
    pub schema_name: String,
    pub schema_created: bool,
    pub schema_create_running: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTenantRequest {
    pub schema_name: String,
}
