//! Tenant-scoped record access on top of a bound transaction.
//!
//! `list` is deliberately unfiltered: scoping comes from row security alone.
//! Writes stamp or check the owning tenant explicitly through [`AccessGuard`].

use crate::binder::BoundTransaction;
use crate::guard::{AccessGuard, ResourceRef};
use crate::policy::TENANT_COLUMN;
use practice_core::{IsolationError, IsolationResult, SessionContext, TenantId};
use practice_store::{Filter, Row};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct RecordStore {
    tables: BTreeSet<String>,
    tenant_column: String,
}

impl RecordStore {
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
            tenant_column: TENANT_COLUMN.to_string(),
        }
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(String::as_str)
    }

    /// Insert a record, stamping its tenant exactly once.
    ///
    /// Tenant-scoped contexts always write their own tenant; a payload naming
    /// another tenant is rejected. Platform admins must name the target tenant,
    /// either as `target` or in the payload.
    pub fn create(
        &self,
        tx: &mut BoundTransaction,
        table: &str,
        mut payload: Map<String, Value>,
        target: Option<TenantId>,
    ) -> IsolationResult<Row> {
        self.check_table(table)?;
        let id = Uuid::new_v4();
        let claimed = match payload.get(&self.tenant_column) {
            None | Some(Value::Null) => None,
            Some(value) => Some(parse_tenant(value)?),
        };

        let owner = match tx.context() {
            SessionContext::TenantScoped { .. } => {
                if let Some(claimed) = claimed {
                    let resource = ResourceRef::new(table, id, Some(claimed));
                    AccessGuard::assert_ownership(&resource, tx.context())
                        .map_err(|e| security_event(tx, e))?;
                }
                tx.context().tenant_id()
            }
            SessionContext::PlatformAdmin { .. } => match (target, claimed) {
                (Some(t), Some(c)) if t != c => {
                    return Err(IsolationError::Validation(
                        "payload tenant differs from target tenant".into(),
                    ))
                }
                (Some(t), _) | (None, Some(t)) => Some(t),
                (None, None) => {
                    return Err(IsolationError::Validation(
                        "platform admin writes must name a target tenant".into(),
                    ))
                }
            },
        };

        let owner = owner.ok_or_else(|| IsolationError::no_context("create"))?;
        payload.insert(self.tenant_column.clone(), Value::String(owner.to_string()));
        let row = Row::with_id(id, payload);
        tx.insert(table, row.clone())
            .map_err(|e| security_event(tx, e))?;
        debug!(table = %table, record_id = %id, tenant_id = %owner, "Record created");
        Ok(row)
    }

    /// Every row the bound context can see, with no application filter.
    pub fn list(&self, tx: &BoundTransaction, table: &str) -> IsolationResult<Vec<Row>> {
        self.check_table(table)?;
        tx.select(table, None)
    }

    pub fn get(&self, tx: &BoundTransaction, table: &str, id: Uuid) -> IsolationResult<Row> {
        self.check_table(table)?;
        tx.select(table, Some(&Filter::Id(id)))?
            .into_iter()
            .next()
            .ok_or_else(|| not_found(table, id))
    }

    /// Update a record after checking ownership. The tenant column cannot change.
    pub fn update(
        &self,
        tx: &mut BoundTransaction,
        table: &str,
        id: Uuid,
        mut values: Map<String, Value>,
    ) -> IsolationResult<Row> {
        let current = self.get(tx, table, id)?;
        let owner = self.owner_of(&current);
        AccessGuard::assert_ownership(&ResourceRef::new(table, id, owner), tx.context())
            .map_err(|e| security_event(tx, e))?;

        if let Some(value) = values.remove(&self.tenant_column) {
            if !value.is_null() && Some(parse_tenant(&value)?) != owner {
                let err = IsolationError::CrossTenantAccess {
                    principal_id: Some(tx.context().principal_id()),
                    context_tenant: tx.context().tenant_id(),
                    resource_tenant: owner,
                    resource_type: table.to_string(),
                    resource_id: id.to_string(),
                };
                return Err(security_event(tx, err));
            }
        }

        if tx.update(table, id, values.clone())? == 0 {
            return Err(not_found(table, id));
        }
        let mut updated = current;
        updated.values.extend(values);
        Ok(updated)
    }

    /// Delete a record after checking ownership.
    pub fn delete(&self, tx: &mut BoundTransaction, table: &str, id: Uuid) -> IsolationResult<()> {
        let current = self.get(tx, table, id)?;
        let owner = self.owner_of(&current);
        AccessGuard::assert_ownership(&ResourceRef::new(table, id, owner), tx.context())
            .map_err(|e| security_event(tx, e))?;
        if tx.delete(table, id)? == 0 {
            return Err(not_found(table, id));
        }
        Ok(())
    }

    fn owner_of(&self, row: &Row) -> Option<TenantId> {
        row.get_str(&self.tenant_column)
            .and_then(|s| s.parse().ok())
    }

    fn check_table(&self, table: &str) -> IsolationResult<()> {
        if self.tables.contains(table) {
            Ok(())
        } else {
            Err(IsolationError::Validation(format!(
                "unknown resource type '{table}'"
            )))
        }
    }
}

fn parse_tenant(value: &Value) -> IsolationResult<TenantId> {
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| IsolationError::Validation("tenant_id must be a UUID string".into()))
}

fn not_found(table: &str, id: Uuid) -> IsolationError {
    IsolationError::NotFound {
        resource_type: table.to_string(),
        resource_id: id.to_string(),
    }
}

/// Log cross-tenant rejections as security events; pass every error through.
fn security_event(tx: &BoundTransaction, err: IsolationError) -> IsolationError {
    if let IsolationError::CrossTenantAccess {
        resource_tenant,
        resource_type,
        resource_id,
        ..
    } = &err
    {
        metrics::counter!("isolation.cross_tenant_denied").increment(1);
        warn!(
            security_event = true,
            transaction_id = %tx.id(),
            principal_id = %tx.context().principal_id(),
            context_tenant = ?tx.context().tenant_id(),
            resource_tenant = ?resource_tenant,
            resource_type = %resource_type,
            resource_id = %resource_id,
            "Cross-tenant access rejected"
        );
    }
    err
}
