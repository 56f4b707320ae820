//! Tenant and principal lifecycle: onboarding, offboarding, provisioning.
//!
//! Tenants are deactivated, never deleted or merged. Role changes return a
//! [`RoleChange`] that the caller records in the audit log.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use practice_core::{
    AuthenticatedPrincipal, IsolationError, IsolationResult, Principal, PrincipalId, Role, Tenant,
    TenantId, TenantStatus,
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// A role transition, to be audited by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleChange {
    pub principal_id: PrincipalId,
    pub tenant_id: Option<TenantId>,
    pub from: Role,
    pub to: Role,
    pub changed_at: DateTime<Utc>,
}

/// Tenant directory backed by DashMap.
///
/// Mutations come in two steps so an audited caller can validate inside the
/// bypass transaction and apply only after it commits: `plan_*` checks and
/// builds the change without touching the directory, `apply_*` installs it.
/// The one-step methods do both.
pub struct TenantDirectory {
    tenants: DashMap<TenantId, Tenant>,
    slugs: DashMap<String, TenantId>,
    principals: DashMap<PrincipalId, Principal>,
}

impl Default for TenantDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl TenantDirectory {
    pub fn new() -> Self {
        Self {
            tenants: DashMap::new(),
            slugs: DashMap::new(),
            principals: DashMap::new(),
        }
    }

    /// Create a new active tenant. Slugs are unique.
    pub fn onboard(&self, name: &str) -> IsolationResult<Tenant> {
        let tenant = self.plan_onboard(TenantId::new(), name)?;
        self.apply_onboard(tenant)
    }

    /// Build the tenant `onboard` would create under `id`.
    pub fn plan_onboard(&self, id: TenantId, name: &str) -> IsolationResult<Tenant> {
        let name = name.trim();
        if name.is_empty() {
            return Err(IsolationError::Validation("tenant name must not be empty".into()));
        }
        let slug = slugify(name);
        if self.slugs.contains_key(&slug) {
            return Err(duplicate_slug(&slug));
        }

        let now = Utc::now();
        Ok(Tenant {
            id,
            name: name.to_string(),
            slug,
            status: TenantStatus::Active,
            created_at: now,
            updated_at: now,
        })
    }

    /// Claim the slug and insert the tenant. The slug claim is atomic.
    pub fn apply_onboard(&self, tenant: Tenant) -> IsolationResult<Tenant> {
        match self.slugs.entry(tenant.slug.clone()) {
            Entry::Occupied(_) => Err(duplicate_slug(&tenant.slug)),
            Entry::Vacant(slot) => {
                slot.insert(tenant.id);
                self.tenants.insert(tenant.id, tenant.clone());
                info!(tenant_id = %tenant.id, tenant_name = %tenant.name, "Tenant onboarded");
                Ok(tenant)
            }
        }
    }

    pub fn get(&self, id: TenantId) -> Option<Tenant> {
        self.tenants.get(&id).map(|e| e.value().clone())
    }

    /// All tenants, oldest first.
    pub fn list(&self) -> Vec<Tenant> {
        let mut tenants: Vec<Tenant> = self.tenants.iter().map(|e| e.value().clone()).collect();
        tenants.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.slug.cmp(&b.slug)));
        tenants
    }

    /// Offboard a tenant. Its data stays isolated under the same id.
    pub fn deactivate(&self, id: TenantId) -> IsolationResult<Tenant> {
        self.set_status(id, TenantStatus::Deactivated)
    }

    pub fn reactivate(&self, id: TenantId) -> IsolationResult<Tenant> {
        self.set_status(id, TenantStatus::Active)
    }

    /// Check that a status change can be applied.
    pub fn plan_status(&self, id: TenantId) -> IsolationResult<Tenant> {
        self.get(id).ok_or_else(|| not_found("tenant", id))
    }

    pub fn set_status(&self, id: TenantId, status: TenantStatus) -> IsolationResult<Tenant> {
        let mut entry = self
            .tenants
            .get_mut(&id)
            .ok_or_else(|| not_found("tenant", id))?;
        entry.status = status;
        entry.updated_at = Utc::now();
        info!(tenant_id = %id, status = ?status, "Tenant status changed");
        Ok(entry.clone())
    }

    pub fn is_active(&self, id: TenantId) -> bool {
        self.tenants
            .get(&id)
            .is_some_and(|t| t.status == TenantStatus::Active)
    }

    /// Unknown and deactivated tenants are both rejected with `TenantInactive`.
    pub fn ensure_active(&self, id: TenantId) -> IsolationResult<()> {
        if self.is_active(id) {
            Ok(())
        } else {
            Err(IsolationError::TenantInactive(id))
        }
    }

    /// Provision a principal. Platform admins have no tenant; everyone else
    /// belongs to exactly one active tenant.
    pub fn provision(&self, tenant_id: Option<TenantId>, role: Role) -> IsolationResult<Principal> {
        let principal = self.plan_provision(tenant_id, role)?;
        self.apply_provision(principal)
    }

    pub fn plan_provision(
        &self,
        tenant_id: Option<TenantId>,
        role: Role,
    ) -> IsolationResult<Principal> {
        let principal_id = PrincipalId::new();
        let tenant_id = match (role, tenant_id) {
            (Role::PlatformAdmin, None) => None,
            (Role::PlatformAdmin, Some(_)) => {
                return Err(IsolationError::Validation(
                    "platform admins are not tenant members".into(),
                ))
            }
            (role, None) => return Err(IsolationError::MissingTenant { principal_id, role }),
            (_, Some(tenant_id)) => {
                self.ensure_active(tenant_id)?;
                Some(tenant_id)
            }
        };

        Ok(Principal {
            id: principal_id,
            tenant_id,
            role,
            created_at: Utc::now(),
        })
    }

    pub fn apply_provision(&self, principal: Principal) -> IsolationResult<Principal> {
        if let Some(tenant_id) = principal.tenant_id {
            self.ensure_active(tenant_id)?;
        }
        info!(principal_id = %principal.id, role = %principal.role, "Principal provisioned");
        self.principals.insert(principal.id, principal.clone());
        Ok(principal)
    }

    pub fn principal(&self, id: PrincipalId) -> Option<Principal> {
        self.principals.get(&id).map(|e| e.value().clone())
    }

    /// Identity as the session provider would hand it to the middleware.
    pub fn authenticate(&self, id: PrincipalId) -> Option<AuthenticatedPrincipal> {
        self.principal(id).map(|p| AuthenticatedPrincipal {
            principal_id: p.id,
            tenant_id: p.tenant_id,
            role: p.role,
        })
    }

    /// Change a principal's role within its tenant. Moving between tenant
    /// roles and platform admin is not a role change; provision a new principal.
    pub fn change_role(&self, id: PrincipalId, to: Role) -> IsolationResult<RoleChange> {
        let change = self.plan_role_change(id, to)?;
        self.apply_role_change(change)
    }

    pub fn plan_role_change(&self, id: PrincipalId, to: Role) -> IsolationResult<RoleChange> {
        let principal = self.principal(id).ok_or_else(|| not_found("principal", id))?;
        let from = principal.role;
        if (from == Role::PlatformAdmin) != (to == Role::PlatformAdmin) {
            return Err(IsolationError::Validation(format!(
                "cannot change role from {from} to {to}"
            )));
        }
        Ok(RoleChange {
            principal_id: id,
            tenant_id: principal.tenant_id,
            from,
            to,
            changed_at: Utc::now(),
        })
    }

    /// Fails if the role moved away from `change.from` after planning.
    pub fn apply_role_change(&self, change: RoleChange) -> IsolationResult<RoleChange> {
        let mut entry = self
            .principals
            .get_mut(&change.principal_id)
            .ok_or_else(|| not_found("principal", change.principal_id))?;
        if entry.role != change.from {
            return Err(IsolationError::Validation(format!(
                "role of {} changed concurrently",
                change.principal_id
            )));
        }
        entry.role = change.to;
        info!(principal_id = %change.principal_id, from = %change.from, to = %change.to, "Principal role changed");
        Ok(change)
    }
}

fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect()
}

fn duplicate_slug(slug: &str) -> IsolationError {
    IsolationError::Validation(format!("tenant slug '{slug}' already exists"))
}

fn not_found(resource_type: &str, id: impl ToString) -> IsolationError {
    IsolationError::NotFound {
        resource_type: resource_type.to_string(),
        resource_id: id.to_string(),
    }
}
