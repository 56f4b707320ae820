//! Append-only audit log of privileged and bypass actions.
//!
//! Entries are written inside the transaction of the action they document,
//! so they commit or roll back together with it. The audit table is itself
//! tenant-scoped: tenants see entries about their own data, platform admins
//! see everything.

use crate::binder::BoundTransaction;
use chrono::{DateTime, Utc};
use practice_core::{IsolationResult, PrincipalId, SessionContext, TenantId};
use practice_store::{Filter, Row, TableSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

pub const AUDIT_TABLE: &str = "audit_log";

/// Column holding the entry timestamp in epoch milliseconds, for range scans.
const TIMESTAMP_MS: &str = "ts_ms";

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub principal_id: PrincipalId,
    /// Tenant whose data the action touched; `None` for platform-wide actions.
    pub tenant_id: Option<TenantId>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub bypass_used: bool,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// What is being audited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditAction {
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    /// Target tenant of a platform admin action. Ignored for tenant-scoped
    /// contexts, which always audit against their own tenant.
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
}

impl AuditAction {
    pub fn new(
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl ToString,
    ) -> Self {
        Self {
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.to_string(),
            tenant_id: None,
        }
    }

    pub fn for_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }
}

pub struct AuditRecorder {
    table: String,
}

impl Default for AuditRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditRecorder {
    pub fn new() -> Self {
        Self {
            table: AUDIT_TABLE.to_string(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Tenant column is nullable for platform-wide entries; rows are never
    /// updated or deleted.
    pub fn schema(&self) -> TableSchema {
        TableSchema::tenant_scoped(self.table.clone(), "tenant_id")
            .nullable_tenant()
            .append_only()
    }

    /// Append one entry in `tx`. Principal, reason and the bypass flag come
    /// from the transaction, not the caller.
    pub fn record(&self, tx: &mut BoundTransaction, action: &AuditAction) -> IsolationResult<AuditEntry> {
        let (tenant_id, reason) = match tx.context() {
            SessionContext::TenantScoped { tenant_id, .. } => (Some(*tenant_id), None),
            SessionContext::PlatformAdmin { reason, .. } => (action.tenant_id, reason.clone()),
        };
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            transaction_id: tx.id(),
            principal_id: tx.context().principal_id(),
            tenant_id,
            action: action.action.clone(),
            resource_type: action.resource_type.clone(),
            resource_id: action.resource_id.clone(),
            bypass_used: tx.bypass_used(),
            reason,
            timestamp: Utc::now(),
        };

        let mut values = match serde_json::to_value(&entry)? {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        values.insert(
            TIMESTAMP_MS.to_string(),
            Value::from(entry.timestamp.timestamp_millis()),
        );
        tx.insert(&self.table, Row::with_id(entry.id, values))?;

        info!(
            audit_id = %entry.id,
            transaction_id = %entry.transaction_id,
            principal_id = %entry.principal_id,
            action = %entry.action,
            resource = %entry.resource_type,
            bypass_used = entry.bypass_used,
            "Audit entry recorded"
        );
        Ok(entry)
    }

    pub fn by_tenant(&self, tx: &BoundTransaction, tenant_id: TenantId) -> IsolationResult<Vec<AuditEntry>> {
        self.query(tx, Filter::eq("tenant_id", tenant_id.to_string()))
    }

    pub fn by_principal(
        &self,
        tx: &BoundTransaction,
        principal_id: PrincipalId,
    ) -> IsolationResult<Vec<AuditEntry>> {
        self.query(tx, Filter::eq("principal_id", principal_id.to_string()))
    }

    /// Bypass entries with `from <= timestamp <= to`, for compliance review.
    pub fn bypass_events_in_range(
        &self,
        tx: &BoundTransaction,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> IsolationResult<Vec<AuditEntry>> {
        self.query(
            tx,
            Filter::All(vec![
                Filter::eq("bypass_used", true),
                Filter::Between {
                    column: TIMESTAMP_MS.to_string(),
                    from: from.timestamp_millis(),
                    to: to.timestamp_millis(),
                },
            ]),
        )
    }

    fn query(&self, tx: &BoundTransaction, filter: Filter) -> IsolationResult<Vec<AuditEntry>> {
        let mut entries = tx
            .select(&self.table, Some(&filter))?
            .into_iter()
            .map(|row| serde_json::from_value(Value::Object(row.values)))
            .collect::<Result<Vec<AuditEntry>, _>>()?;
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        Ok(entries)
    }
}
