//! Table storage and the row-security catalog.

use crate::error::{StorageError, StorageResult};
use crate::predicate::RowPolicy;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use practice_core::config::Credential;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// A stored row: primary key plus a JSON object of column values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: Uuid,
    pub values: Map<String, Value>,
}

impl Row {
    pub fn new(values: Map<String, Value>) -> Self {
        Self::with_id(Uuid::new_v4(), values)
    }

    pub fn with_id(id: Uuid, values: Map<String, Value>) -> Self {
        Self { id, values }
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.values.get(column).and_then(Value::as_str)
    }
}

/// Table definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    /// Owning-tenant column; immutable once a row is inserted.
    pub tenant_column: Option<String>,
    pub tenant_nullable: bool,
    pub append_only: bool,
}

impl TableSchema {
    /// A table whose rows each belong to exactly one tenant.
    pub fn tenant_scoped(name: impl Into<String>, tenant_column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tenant_column: Some(tenant_column.into()),
            tenant_nullable: false,
            append_only: false,
        }
    }

    /// A table with no tenant column.
    pub fn global(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tenant_column: None,
            tenant_nullable: false,
            append_only: false,
        }
    }

    pub fn nullable_tenant(mut self) -> Self {
        self.tenant_nullable = true;
        self
    }

    pub fn append_only(mut self) -> Self {
        self.append_only = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RowSecurity {
    pub enabled: bool,
    pub forced: bool,
    pub policies: Vec<RowPolicy>,
}

impl RowSecurity {
    /// Policies that bind a connection with `credential`, or `None` when row
    /// security does not apply (disabled, or owner without FORCE).
    pub fn effective(&self, credential: Credential) -> Option<Vec<RowPolicy>> {
        if !self.enabled {
            return None;
        }
        if credential == Credential::Owner && !self.forced {
            return None;
        }
        Some(self.policies.clone())
    }
}

pub(crate) struct Table {
    pub schema: TableSchema,
    pub security: RwLock<RowSecurity>,
    pub rows: RwLock<BTreeMap<Uuid, Row>>,
}

impl Table {
    fn info(&self) -> TableInfo {
        let security = self.security.read();
        TableInfo {
            name: self.schema.name.clone(),
            tenant_column: self.schema.tenant_column.clone(),
            append_only: self.schema.append_only,
            rls_enabled: security.enabled,
            rls_forced: security.forced,
            policies: security.policies.clone(),
        }
    }
}

/// Catalog view of one table (the `pg_class` / `pg_policies` analogue).
#[derive(Debug, Clone, Serialize)]
pub struct TableInfo {
    pub name: String,
    pub tenant_column: Option<String>,
    pub append_only: bool,
    pub rls_enabled: bool,
    pub rls_forced: bool,
    pub policies: Vec<RowPolicy>,
}

/// Shared storage engine. Cheap to share behind an `Arc`.
pub struct Engine {
    tables: DashMap<String, Arc<Table>>,
    next_connection_id: AtomicU64,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// `CREATE TABLE IF NOT EXISTS`. Returns `true` when the table was created.
    pub fn create_table(&self, schema: TableSchema) -> bool {
        match self.tables.entry(schema.name.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                info!(table = %schema.name, "Table created");
                slot.insert(Arc::new(Table {
                    schema,
                    security: RwLock::new(RowSecurity::default()),
                    rows: RwLock::new(BTreeMap::new()),
                }));
                true
            }
        }
    }

    /// `ALTER TABLE .. ENABLE ROW LEVEL SECURITY` (plus `FORCE` when requested).
    pub fn enable_row_security(&self, table: &str, force: bool) -> StorageResult<()> {
        let table = self.table(table)?;
        let mut security = table.security.write();
        security.enabled = true;
        security.forced = security.forced || force;
        Ok(())
    }

    /// `ALTER TABLE .. DISABLE ROW LEVEL SECURITY, NO FORCE ROW LEVEL SECURITY`.
    pub fn disable_row_security(&self, table: &str) -> StorageResult<()> {
        let table = self.table(table)?;
        let mut security = table.security.write();
        security.enabled = false;
        security.forced = false;
        Ok(())
    }

    /// `ALTER TABLE .. NO FORCE ROW LEVEL SECURITY`.
    pub fn unforce_row_security(&self, table: &str) -> StorageResult<()> {
        self.table(table)?.security.write().forced = false;
        Ok(())
    }

    /// `CREATE POLICY`. Fails if a policy with the same name exists.
    pub fn create_policy(&self, table: &str, policy: RowPolicy) -> StorageResult<()> {
        let t = self.table(table)?;
        let mut security = t.security.write();
        if security.policies.iter().any(|p| p.name == policy.name) {
            return Err(StorageError::PolicyExists {
                table: table.to_string(),
                policy: policy.name,
            });
        }
        info!(table = %table, policy = %policy.name, "Row policy created");
        security.policies.push(policy);
        Ok(())
    }

    /// `DROP POLICY IF EXISTS`. Returns `true` when a policy was removed.
    pub fn drop_policy(&self, table: &str, name: &str) -> StorageResult<bool> {
        let t = self.table(table)?;
        let mut security = t.security.write();
        let before = security.policies.len();
        security.policies.retain(|p| p.name != name);
        Ok(security.policies.len() < before)
    }

    pub fn policies(&self, table: &str) -> StorageResult<Vec<RowPolicy>> {
        Ok(self.table(table)?.security.read().policies.clone())
    }

    /// All tables, sorted by name.
    pub fn catalog(&self) -> Vec<TableInfo> {
        let mut infos: Vec<TableInfo> = self
            .tables
            .iter()
            .map(|entry| entry.value().info())
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn table_info(&self, table: &str) -> StorageResult<TableInfo> {
        Ok(self.table(table)?.info())
    }

    /// Committed row count, ignoring row security (catalog statistic).
    pub fn committed_rows(&self, table: &str) -> StorageResult<usize> {
        Ok(self.table(table)?.rows.read().len())
    }

    pub(crate) fn table(&self, name: &str) -> StorageResult<Arc<Table>> {
        self.tables
            .get(name)
            .map(|t| t.value().clone())
            .ok_or_else(|| StorageError::UnknownTable(name.to_string()))
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::Predicate;

    fn policy(name: &str) -> RowPolicy {
        let p = Predicate::ColumnEqualsSetting {
            column: "tenant_id".into(),
            setting: "app.tenant_id".into(),
        };
        RowPolicy::new(name, p.clone(), p)
    }

    #[test]
    fn test_create_table_is_idempotent() {
        let engine = Engine::new();
        assert!(engine.create_table(TableSchema::tenant_scoped("patients", "tenant_id")));
        assert!(!engine.create_table(TableSchema::tenant_scoped("patients", "tenant_id")));
        assert_eq!(engine.catalog().len(), 1);
    }

    #[test]
    fn test_duplicate_policy_is_rejected() {
        let engine = Engine::new();
        engine.create_table(TableSchema::tenant_scoped("orders", "tenant_id"));
        engine.create_policy("orders", policy("tenant_isolation")).unwrap();
        let err = engine
            .create_policy("orders", policy("tenant_isolation"))
            .unwrap_err();
        assert!(matches!(err, StorageError::PolicyExists { .. }));
        assert_eq!(engine.policies("orders").unwrap().len(), 1);

        assert!(engine.drop_policy("orders", "tenant_isolation").unwrap());
        assert!(!engine.drop_policy("orders", "tenant_isolation").unwrap());
    }

    #[test]
    fn test_row_security_applicability() {
        let security = RowSecurity {
            enabled: true,
            forced: false,
            policies: vec![policy("p")],
        };
        assert!(security.effective(Credential::Owner).is_none());
        assert_eq!(security.effective(Credential::Restricted).unwrap().len(), 1);

        let forced = RowSecurity {
            forced: true,
            ..security
        };
        assert!(forced.effective(Credential::Owner).is_some());
        assert!(RowSecurity::default().effective(Credential::Restricted).is_none());
    }

    #[test]
    fn test_unknown_table() {
        let engine = Engine::new();
        assert_eq!(
            engine.enable_row_security("nope", true).unwrap_err(),
            StorageError::UnknownTable("nope".into())
        );
    }
}
