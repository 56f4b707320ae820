//! Application-level access checks.
//!
//! These run before a data operation and fail with explicit errors, unlike
//! row security which silently filters. They have no side effects.

use practice_core::{IsolationError, IsolationResult, PrincipalId, SessionContext, TenantId};

/// The resource a write is about to touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub resource_type: String,
    pub resource_id: String,
    /// Owning tenant as stored; `None` if the row carries no tenant.
    pub tenant_id: Option<TenantId>,
}

impl ResourceRef {
    pub fn new(
        resource_type: impl Into<String>,
        resource_id: impl ToString,
        tenant_id: Option<TenantId>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.to_string(),
            tenant_id,
        }
    }
}

pub struct AccessGuard;

impl AccessGuard {
    /// Fails with `NoTenantContext` when no context is present.
    pub fn assert_bound<'a>(
        context: Option<&'a SessionContext>,
        operation: &str,
    ) -> IsolationResult<&'a SessionContext> {
        context.ok_or_else(|| IsolationError::no_context(operation))
    }

    /// Tenant-scoped contexts may only touch resources of their own tenant.
    /// A resource without an owner is treated as foreign.
    pub fn assert_ownership(resource: &ResourceRef, context: &SessionContext) -> IsolationResult<()> {
        match context {
            SessionContext::PlatformAdmin { .. } => Ok(()),
            SessionContext::TenantScoped {
                principal_id,
                tenant_id,
                ..
            } => {
                if resource.tenant_id == Some(*tenant_id) {
                    Ok(())
                } else {
                    Err(IsolationError::CrossTenantAccess {
                        principal_id: Some(*principal_id),
                        context_tenant: Some(*tenant_id),
                        resource_tenant: resource.tenant_id,
                        resource_type: resource.resource_type.clone(),
                        resource_id: resource.resource_id.clone(),
                    })
                }
            }
        }
    }

    /// Returns the admin principal, or `InsufficientPrivilege`.
    pub fn require_platform_admin(context: &SessionContext) -> IsolationResult<PrincipalId> {
        match context {
            SessionContext::PlatformAdmin { principal_id, .. } => Ok(*principal_id),
            SessionContext::TenantScoped { principal_id, .. } => {
                Err(IsolationError::InsufficientPrivilege {
                    principal_id: *principal_id,
                    role: context.role(),
                })
            }
        }
    }
}
