//! Identity types shared by every layer of the isolation stack.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a tenant (one customer organization).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TenantId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of an authenticated principal (user or service account).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(pub Uuid);

impl PrincipalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PrincipalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PrincipalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Principal role as issued by the session provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    TenantUser,
    TenantAdmin,
    PlatformAdmin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::TenantUser => "tenant_user",
            Role::TenantAdmin => "tenant_admin",
            Role::PlatformAdmin => "platform_admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tenant_user" => Ok(Role::TenantUser),
            "tenant_admin" => Ok(Role::TenantAdmin),
            "platform_admin" => Ok(Role::PlatformAdmin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Roles that are always confined to a single tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantRole {
    TenantUser,
    TenantAdmin,
}

impl From<TenantRole> for Role {
    fn from(role: TenantRole) -> Self {
        match role {
            TenantRole::TenantUser => Role::TenantUser,
            TenantRole::TenantAdmin => Role::TenantAdmin,
        }
    }
}

/// Tenant lifecycle status. Tenants are deactivated on offboarding, never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Deactivated,
}

/// The isolation boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub slug: String,
    pub status: TenantStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A provisioned principal. `tenant_id` is `None` only for platform admins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: PrincipalId,
    pub tenant_id: Option<TenantId>,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

/// Identity handed over by the upstream authentication collaborator.
/// Credentials have already been verified; nothing here is trusted beyond that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedPrincipal {
    pub principal_id: PrincipalId,
    pub tenant_id: Option<TenantId>,
    pub role: Role,
}

/// Per-request execution context. Lives for one transaction only.
///
/// Tenant-scoped and platform-admin contexts are distinct variants so that
/// every consumer has to handle the bypass case explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum SessionContext {
    TenantScoped {
        principal_id: PrincipalId,
        tenant_id: TenantId,
        role: TenantRole,
    },
    PlatformAdmin {
        principal_id: PrincipalId,
        reason: Option<String>,
    },
}

impl SessionContext {
    pub fn tenant(principal_id: PrincipalId, tenant_id: TenantId, role: TenantRole) -> Self {
        SessionContext::TenantScoped {
            principal_id,
            tenant_id,
            role,
        }
    }

    pub fn platform_admin(principal_id: PrincipalId, reason: Option<String>) -> Self {
        SessionContext::PlatformAdmin {
            principal_id,
            reason,
        }
    }

    pub fn principal_id(&self) -> PrincipalId {
        match self {
            SessionContext::TenantScoped { principal_id, .. }
            | SessionContext::PlatformAdmin { principal_id, .. } => *principal_id,
        }
    }

    /// Bound tenant; `None` for platform admins.
    pub fn tenant_id(&self) -> Option<TenantId> {
        match self {
            SessionContext::TenantScoped { tenant_id, .. } => Some(*tenant_id),
            SessionContext::PlatformAdmin { .. } => None,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            SessionContext::TenantScoped { role, .. } => (*role).into(),
            SessionContext::PlatformAdmin { .. } => Role::PlatformAdmin,
        }
    }

    #[inline]
    pub fn is_platform_admin(&self) -> bool {
        matches!(self, SessionContext::PlatformAdmin { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trips_through_str() {
        for role in [Role::TenantUser, Role::TenantAdmin, Role::PlatformAdmin] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn test_session_context_accessors() {
        let principal = PrincipalId::new();
        let tenant = TenantId::new();

        let scoped = SessionContext::tenant(principal, tenant, TenantRole::TenantAdmin);
        assert_eq!(scoped.principal_id(), principal);
        assert_eq!(scoped.tenant_id(), Some(tenant));
        assert_eq!(scoped.role(), Role::TenantAdmin);
        assert!(!scoped.is_platform_admin());

        let admin = SessionContext::platform_admin(principal, Some("support ticket".into()));
        assert_eq!(admin.tenant_id(), None);
        assert_eq!(admin.role(), Role::PlatformAdmin);
        assert!(admin.is_platform_admin());
    }

    #[test]
    fn test_tenant_id_parse() {
        let id = TenantId::new();
        let parsed: TenantId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<TenantId>().is_err());
    }
}
