use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use crate::{
    db::tenant,
    middleware::super_admin::SuperAdminAuth,
    models::tenant::CreateTenantRequest,
    services::provision_scheduler,
    services::provisioner::{self, ProvisionError},
    AppState,
};

// ─── Tenant registry ──────────────────────────────────────────────────────────

pub async fn list_tenants(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    tenant::list(&state.db)
        .await
        .map(|items| Json(serde_json::to_value(items).unwrap()))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))))
}

pub async fn get_tenant(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Path(schema_name): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let mut conn = state
        .db
        .acquire()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))))?;

    tenant::get(&mut conn, &schema_name)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))))?
        .map(|t| Json(serde_json::to_value(t).unwrap()))
        .ok_or((StatusCode::NOT_FOUND, Json(json!({ "error": "Tenant not found" }))))
}

/// Register a tenant. Reserved schemata come back 201 (bootstrapped in
/// place); everything else comes back 202 and is provisioned by the batch
/// worker.
pub async fn register_tenant(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Json(body): Json<CreateTenantRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let schema_name = body.schema_name.trim().to_lowercase();

    let registered = provisioner::create_tenant_schema(
        &state.db,
        &state.redis_client,
        &state.config,
        &schema_name,
    )
    .await
    .map_err(|e| match e.downcast_ref::<ProvisionError>() {
        Some(ProvisionError::InvalidSchemaName(_)) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))),
    })?;

    let status = if registered.schema_created {
        StatusCode::CREATED
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(serde_json::to_value(registered).unwrap())))
}

pub async fn delete_tenant(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Path(schema_name): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if schema_name == "public" || schema_name == state.config.template_schema {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Reserved schemata cannot be deleted" })),
        ));
    }
    // The name is spliced into DDL; re-check it even though registration
    // already did.
    if !tenant::is_valid_schema_name(&schema_name) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("invalid schema name: \"{schema_name}\"") })),
        ));
    }

    let deleted = tenant::drop_tenant(&state.db, &schema_name)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))))?;

    if !deleted {
        return Err((StatusCode::NOT_FOUND, Json(json!({ "error": "Tenant not found" }))));
    }
    Ok(Json(json!({ "message": "Tenant deleted" })))
}

// ─── Provisioning control ─────────────────────────────────────────────────────

/// Push a wake-up onto the provisioning queue.
pub async fn trigger_provision_run(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    provision_scheduler::enqueue_provision(&state.redis_client)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": "Provisioning run enqueued" })),
    ))
}
