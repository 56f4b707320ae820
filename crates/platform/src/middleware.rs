//! Request-level derivation of the session context.
//!
//! Runs before any data access and performs none itself: it only turns an
//! already-authenticated principal into a [`SessionContext`] or rejects it.

use practice_core::{
    AuthenticatedPrincipal, IsolationError, IsolationResult, Role, SessionContext, TenantRole,
};
use tracing::{debug, warn};

/// Maximum accepted length of a bypass reason.
const MAX_REASON_LEN: usize = 512;

pub struct TenantContextMiddleware;

impl TenantContextMiddleware {
    /// Derive the context for one request.
    ///
    /// Non-admin principals without a tenant fail with `MissingTenant`.
    /// A platform admin always gets a `PlatformAdmin` context; any tenant id it
    /// carries is ignored.
    pub fn derive(
        principal: &AuthenticatedPrincipal,
        reason: Option<&str>,
    ) -> IsolationResult<SessionContext> {
        let context = match (principal.role, principal.tenant_id) {
            (Role::PlatformAdmin, _) => {
                SessionContext::platform_admin(principal.principal_id, normalize_reason(reason))
            }
            (Role::TenantUser, Some(tenant_id)) => {
                SessionContext::tenant(principal.principal_id, tenant_id, TenantRole::TenantUser)
            }
            (Role::TenantAdmin, Some(tenant_id)) => {
                SessionContext::tenant(principal.principal_id, tenant_id, TenantRole::TenantAdmin)
            }
            (role, None) => {
                warn!(
                    principal_id = %principal.principal_id,
                    role = %role,
                    "Principal without tenant rejected"
                );
                return Err(IsolationError::MissingTenant {
                    principal_id: principal.principal_id,
                    role,
                });
            }
        };

        debug!(
            principal_id = %context.principal_id(),
            role = %context.role(),
            "Session context derived"
        );
        Ok(context)
    }
}

fn normalize_reason(reason: Option<&str>) -> Option<String> {
    reason
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(|r| r.chars().take(MAX_REASON_LEN).collect())
}
