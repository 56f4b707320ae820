//! Per-request session context.
//!
//! The upstream gateway authenticates the caller and forwards the verified
//! identity in headers. This layer turns it into a [`SessionContext`] before
//! any handler runs; handlers receive it through [`RequestContext`].

use crate::error::ApiError;
use crate::rest::AppState;
use axum::async_trait;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use practice_core::{AuthenticatedPrincipal, PrincipalId, Role, SessionContext, TenantId};
use practice_platform::{AccessGuard, TenantContextMiddleware};

pub const PRINCIPAL_HEADER: &str = "x-principal-id";
pub const TENANT_HEADER: &str = "x-tenant-id";
pub const ROLE_HEADER: &str = "x-principal-role";
pub const BYPASS_REASON_HEADER: &str = "x-bypass-reason";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, ApiError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(|v| Some(v.trim()).filter(|v| !v.is_empty()))
            .map_err(|_| ApiError::Unauthenticated(format!("{name} is not valid UTF-8"))),
    }
}

/// Verified identity from the gateway headers.
pub fn principal_from_headers(headers: &HeaderMap) -> Result<AuthenticatedPrincipal, ApiError> {
    let principal_id: PrincipalId = header(headers, PRINCIPAL_HEADER)?
        .ok_or_else(|| ApiError::Unauthenticated(format!("missing {PRINCIPAL_HEADER}")))?
        .parse()
        .map_err(|_| ApiError::Unauthenticated(format!("malformed {PRINCIPAL_HEADER}")))?;
    let role: Role = header(headers, ROLE_HEADER)?
        .ok_or_else(|| ApiError::Unauthenticated(format!("missing {ROLE_HEADER}")))?
        .parse()
        .map_err(ApiError::Unauthenticated)?;
    let tenant_id: Option<TenantId> = header(headers, TENANT_HEADER)?
        .map(str::parse)
        .transpose()
        .map_err(|_| ApiError::Unauthenticated(format!("malformed {TENANT_HEADER}")))?;

    Ok(AuthenticatedPrincipal {
        principal_id,
        tenant_id,
        role,
    })
}

/// Derive the session context and reject inactive tenants.
pub async fn session_context(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let principal = principal_from_headers(req.headers())?;
    let reason = header(req.headers(), BYPASS_REASON_HEADER)?;
    let context = TenantContextMiddleware::derive(&principal, reason)?;
    if let Some(tenant_id) = context.tenant_id() {
        state.stack.tenants.ensure_active(tenant_id)?;
    }
    req.extensions_mut().insert(context);
    Ok(next.run(req).await)
}

/// Extractor for the derived context. Fails closed when the layer did not run.
pub struct RequestContext(pub SessionContext);

#[async_trait]
impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let context = AccessGuard::assert_bound(parts.extensions.get::<SessionContext>(), "request")?;
        Ok(RequestContext(context.clone()))
    }
}
