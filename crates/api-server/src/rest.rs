//! REST handlers for tenant records, audit queries and platform administration.

use crate::context::RequestContext;
use crate::error::ApiError;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use practice_core::{
    IsolationError, Principal, PrincipalId, Role, SessionContext, Tenant, TenantId, TenantRole,
    TenantStatus,
};
use practice_platform::{
    AccessGuard, AuditAction, AuditEntry, CoverageReport, IsolationStack, RoleChange,
};
use practice_store::Row;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub stack: Arc<IsolationStack>,
    pub node_id: String,
    pub start_time: Instant,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub policy_coverage: bool,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let covered = state.stack.policies.coverage_report().is_covered();
    Json(HealthResponse {
        status: if covered { "healthy" } else { "degraded" }.to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        policy_coverage: covered,
    })
}

// Tenant-scoped records

/// GET /v1/records/:table: every record the caller's tenant can see.
pub async fn list_records(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(table): Path<String>,
) -> Result<Json<Vec<Row>>, ApiError> {
    let tx = state.stack.binder.begin(&ctx).await?;
    let rows = state.stack.records.list(&tx, &table)?;
    tx.commit()?;
    Ok(Json(rows))
}

/// GET /v1/records/:table/:id
pub async fn get_record(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path((table, id)): Path<(String, Uuid)>,
) -> Result<Json<Row>, ApiError> {
    let tx = state.stack.binder.begin(&ctx).await?;
    let row = state.stack.records.get(&tx, &table, id)?;
    tx.commit()?;
    Ok(Json(row))
}

/// POST /v1/records/:table
pub async fn create_record(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(table): Path<String>,
    Json(payload): Json<Map<String, Value>>,
) -> Result<(StatusCode, Json<Row>), ApiError> {
    let mut tx = state.stack.binder.begin(&ctx).await?;
    let row = state.stack.records.create(&mut tx, &table, payload, None)?;
    tx.commit()?;
    Ok((StatusCode::CREATED, Json(row)))
}

/// PATCH /v1/records/:table/:id
pub async fn update_record(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path((table, id)): Path<(String, Uuid)>,
    Json(values): Json<Map<String, Value>>,
) -> Result<Json<Row>, ApiError> {
    let mut tx = state.stack.binder.begin(&ctx).await?;
    let row = state.stack.records.update(&mut tx, &table, id, values)?;
    tx.commit()?;
    Ok(Json(row))
}

/// DELETE /v1/records/:table/:id
pub async fn delete_record(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path((table, id)): Path<(String, Uuid)>,
) -> Result<StatusCode, ApiError> {
    let mut tx = state.stack.binder.begin(&ctx).await?;
    state.stack.records.delete(&mut tx, &table, id)?;
    tx.commit()?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /v1/audit: the caller's tenant audit trail. Tenant admins only.
pub async fn tenant_audit(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    let tenant_id = match &ctx {
        SessionContext::TenantScoped {
            tenant_id,
            role: TenantRole::TenantAdmin,
            ..
        } => *tenant_id,
        other => {
            return Err(IsolationError::InsufficientPrivilege {
                principal_id: other.principal_id(),
                role: other.role(),
            }
            .into())
        }
    };
    let tx = state.stack.binder.begin(&ctx).await?;
    let entries = state.stack.audit.by_tenant(&tx, tenant_id)?;
    tx.commit()?;
    Ok(Json(entries))
}

// Platform administration
//
// Directory changes are planned inside the bypass transaction and applied
// only once it has committed with its audit entry.

fn bypass_reason(ctx: &SessionContext) -> &str {
    match ctx {
        SessionContext::PlatformAdmin {
            reason: Some(reason),
            ..
        } => reason,
        _ => "",
    }
}

#[derive(Debug, Serialize)]
pub struct BypassResponse<T> {
    pub data: T,
    pub audit_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct TargetTenant {
    pub tenant_id: TenantId,
}

/// GET /v1/admin/records/:table: cross-tenant read through the audited bypass.
pub async fn admin_list_records(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(table): Path<String>,
) -> Result<Json<BypassResponse<Vec<Row>>>, ApiError> {
    let stack = &state.stack;
    let done = stack
        .bypass
        .with_platform_admin_bypass(
            &ctx,
            bypass_reason(&ctx),
            AuditAction::new("list", table.clone(), "*"),
            |tx| stack.records.list(tx, &table),
        )
        .await?;
    Ok(Json(BypassResponse {
        data: done.value,
        audit_id: done.audit.id,
    }))
}

/// POST /v1/admin/records/:table?tenant_id=..: create on behalf of a tenant.
pub async fn admin_create_record(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(table): Path<String>,
    Query(target): Query<TargetTenant>,
    Json(payload): Json<Map<String, Value>>,
) -> Result<(StatusCode, Json<BypassResponse<Row>>), ApiError> {
    let stack = &state.stack;
    stack.tenants.ensure_active(target.tenant_id)?;
    let done = stack
        .bypass
        .with_platform_admin_bypass(
            &ctx,
            bypass_reason(&ctx),
            AuditAction::new("create", table.clone(), "new").for_tenant(target.tenant_id),
            |tx| {
                let row = stack
                    .records
                    .create(tx, &table, payload, Some(target.tenant_id))?;
                Ok(row)
            },
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(BypassResponse {
            data: done.value,
            audit_id: done.audit.id,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// GET /v1/admin/audit/bypass?from=..&to=..: compliance review of bypasses.
pub async fn bypass_events(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Query(range): Query<RangeQuery>,
) -> Result<Json<BypassResponse<Vec<AuditEntry>>>, ApiError> {
    if range.from > range.to {
        return Err(IsolationError::Validation("'from' is after 'to'".into()).into());
    }
    let stack = &state.stack;
    let done = stack
        .bypass
        .with_platform_admin_bypass(
            &ctx,
            bypass_reason(&ctx),
            AuditAction::new("review", stack.audit.table(), "bypass_events"),
            |tx| stack.audit.bypass_events_in_range(tx, range.from, range.to),
        )
        .await?;
    Ok(Json(BypassResponse {
        data: done.value,
        audit_id: done.audit.id,
    }))
}

/// GET /v1/admin/coverage: row security coverage report.
pub async fn coverage(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
) -> Result<Json<CoverageReport>, ApiError> {
    AccessGuard::require_platform_admin(&ctx)?;
    Ok(Json(state.stack.policies.coverage_report()))
}

/// GET /v1/admin/tenants
pub async fn list_tenants(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
) -> Result<Json<Vec<Tenant>>, ApiError> {
    AccessGuard::require_platform_admin(&ctx)?;
    Ok(Json(state.stack.tenants.list()))
}

#[derive(Debug, Deserialize)]
pub struct OnboardRequest {
    pub name: String,
}

/// POST /v1/admin/tenants
pub async fn onboard_tenant(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Json(req): Json<OnboardRequest>,
) -> Result<(StatusCode, Json<Tenant>), ApiError> {
    let stack = &state.stack;
    let tenant_id = TenantId::new();
    let done = stack
        .bypass
        .with_platform_admin_bypass(
            &ctx,
            bypass_reason(&ctx),
            AuditAction::new("onboard", "tenant", tenant_id).for_tenant(tenant_id),
            |_| stack.tenants.plan_onboard(tenant_id, &req.name),
        )
        .await?;
    let tenant = stack.tenants.apply_onboard(done.value)?;
    Ok((StatusCode::CREATED, Json(tenant)))
}

/// POST /v1/admin/tenants/:id/deactivate
pub async fn deactivate_tenant(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(id): Path<TenantId>,
) -> Result<Json<Tenant>, ApiError> {
    let stack = &state.stack;
    stack
        .bypass
        .with_platform_admin_bypass(
            &ctx,
            bypass_reason(&ctx),
            AuditAction::new("deactivate", "tenant", id).for_tenant(id),
            |_| stack.tenants.plan_status(id),
        )
        .await?;
    Ok(Json(stack.tenants.set_status(id, TenantStatus::Deactivated)?))
}

/// POST /v1/admin/tenants/:id/reactivate
pub async fn reactivate_tenant(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(id): Path<TenantId>,
) -> Result<Json<Tenant>, ApiError> {
    let stack = &state.stack;
    stack
        .bypass
        .with_platform_admin_bypass(
            &ctx,
            bypass_reason(&ctx),
            AuditAction::new("reactivate", "tenant", id).for_tenant(id),
            |_| stack.tenants.plan_status(id),
        )
        .await?;
    Ok(Json(stack.tenants.set_status(id, TenantStatus::Active)?))
}

#[derive(Debug, Deserialize)]
pub struct ProvisionRequest {
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    pub role: Role,
}

/// POST /v1/admin/principals
pub async fn provision_principal(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Json(req): Json<ProvisionRequest>,
) -> Result<(StatusCode, Json<Principal>), ApiError> {
    let stack = &state.stack;
    let mut action = AuditAction::new("provision", "principal", req.role);
    if let Some(tenant_id) = req.tenant_id {
        action = action.for_tenant(tenant_id);
    }
    let done = stack
        .bypass
        .with_platform_admin_bypass(&ctx, bypass_reason(&ctx), action, |_| {
            stack.tenants.plan_provision(req.tenant_id, req.role)
        })
        .await?;
    let principal = stack.tenants.apply_provision(done.value)?;
    Ok((StatusCode::CREATED, Json(principal)))
}

#[derive(Debug, Deserialize)]
pub struct RoleRequest {
    pub role: Role,
}

/// PUT /v1/admin/principals/:id/role: audited role change.
pub async fn change_role(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(id): Path<PrincipalId>,
    Json(req): Json<RoleRequest>,
) -> Result<Json<RoleChange>, ApiError> {
    let stack = &state.stack;
    let principal = stack.tenants.principal(id).ok_or(IsolationError::NotFound {
        resource_type: "principal".to_string(),
        resource_id: id.to_string(),
    })?;
    let mut action = AuditAction::new(format!("change_role:{}", req.role), "principal", id);
    if let Some(tenant_id) = principal.tenant_id {
        action = action.for_tenant(tenant_id);
    }
    let done = stack
        .bypass
        .with_platform_admin_bypass(&ctx, bypass_reason(&ctx), action, |_| {
            stack.tenants.plan_role_change(id, req.role)
        })
        .await?;
    Ok(Json(stack.tenants.apply_role_change(done.value)?))
}
