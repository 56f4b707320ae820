use crate::types::{PrincipalId, Role, TenantId};
use std::fmt;
use thiserror::Error;

pub type IsolationResult<T> = Result<T, IsolationError>;

#[derive(Error, Debug)]
pub enum IsolationError {
    /// A non-platform principal arrived without a tenant.
    #[error("principal {principal_id} ({role}) has no tenant")]
    MissingTenant { principal_id: PrincipalId, role: Role },

    /// A data operation ran without a bound session context.
    #[error("no tenant context bound for {operation}")]
    NoTenantContext { operation: String },

    /// An explicit write targeted a resource owned by another tenant.
    #[error(
        "principal {} bound to tenant {} attempted {resource_type}/{resource_id} owned by tenant {}",
        or_none(.principal_id),
        or_none(.context_tenant),
        or_none(.resource_tenant)
    )]
    CrossTenantAccess {
        principal_id: Option<PrincipalId>,
        context_tenant: Option<TenantId>,
        resource_tenant: Option<TenantId>,
        resource_type: String,
        resource_id: String,
    },

    /// Transaction-local binding could not be established.
    #[error("transaction context binding failed: {0}")]
    BindingFailure(String),

    #[error("principal {principal_id} ({role}) lacks platform admin privilege")]
    InsufficientPrivilege { principal_id: PrincipalId, role: Role },

    /// A platform admin context was bound outside the audited bypass path.
    #[error("platform admin context for {principal_id} must go through the audited bypass")]
    UnauditedBypass { principal_id: PrincipalId },

    #[error("tenant {0} is not active")]
    TenantInactive(TenantId),

    #[error("{resource_type} {resource_id} not found")]
    NotFound {
        resource_type: String,
        resource_id: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

fn or_none<T: fmt::Display>(id: &Option<T>) -> String {
    id.as_ref().map_or_else(|| "none".to_string(), T::to_string)
}

impl IsolationError {
    /// Errors that surface externally as an opaque authorization failure.
    pub fn is_authorization_failure(&self) -> bool {
        matches!(
            self,
            IsolationError::MissingTenant { .. }
                | IsolationError::CrossTenantAccess { .. }
                | IsolationError::InsufficientPrivilege { .. }
                | IsolationError::UnauditedBypass { .. }
                | IsolationError::TenantInactive(_)
        )
    }

    /// Programming or infrastructure defects: opaque externally, detailed in logs.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            IsolationError::NoTenantContext { .. }
                | IsolationError::BindingFailure(_)
                | IsolationError::Storage(_)
                | IsolationError::Config(_)
                | IsolationError::Serialization(_)
                | IsolationError::Internal(_)
        )
    }

    /// Stable machine-readable kind, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            IsolationError::MissingTenant { .. } => "missing_tenant",
            IsolationError::NoTenantContext { .. } => "no_tenant_context",
            IsolationError::CrossTenantAccess { .. } => "cross_tenant_access",
            IsolationError::BindingFailure(_) => "binding_failure",
            IsolationError::InsufficientPrivilege { .. } => "insufficient_privilege",
            IsolationError::UnauditedBypass { .. } => "unaudited_bypass",
            IsolationError::TenantInactive(_) => "tenant_inactive",
            IsolationError::NotFound { .. } => "not_found",
            IsolationError::Validation(_) => "validation",
            IsolationError::Storage(_) => "storage",
            IsolationError::Config(_) => "config",
            IsolationError::Serialization(_) => "serialization",
            IsolationError::Internal(_) => "internal",
        }
    }

    pub fn no_context(operation: impl Into<String>) -> Self {
        IsolationError::NoTenantContext {
            operation: operation.into(),
        }
    }
}
