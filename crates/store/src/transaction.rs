//! Transactions: transaction-local settings, staged writes, row security.

use crate::engine::{Row, Table};
use crate::error::{StorageError, StorageResult};
use crate::pool::PooledConnection;
use crate::predicate::{Filter, RowPolicy, SettingLookup};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A pending write. Updates and deletes remember the committed row they
/// started from; commit fails if that row changed or vanished meanwhile.
#[derive(Debug, Clone)]
enum Staged {
    Insert(Row),
    Update { base: Row, row: Row },
    Delete { base: Row },
}

/// Settings visible to a statement: transaction-local first, then session.
struct Visible<'a> {
    local: &'a HashMap<String, String>,
    session: &'a HashMap<String, String>,
}

impl SettingLookup for Visible<'_> {
    fn setting(&self, name: &str) -> Option<&str> {
        self.local
            .get(name)
            .or_else(|| self.session.get(name))
            .map(String::as_str)
    }
}

/// Custom settings must be qualified, e.g. `app.tenant_id`.
pub(crate) fn validate_setting_name(name: &str) -> StorageResult<()> {
    let valid = match name.split_once('.') {
        Some((prefix, key)) => {
            !prefix.is_empty()
                && !key.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidSetting(name.to_string()))
    }
}

/// An open transaction on a pooled connection.
///
/// Writes are staged and applied atomically by [`commit`](Self::commit).
/// Dropping an uncommitted transaction rolls it back; transaction-local
/// settings are owned here and vanish with it.
pub struct Transaction {
    id: Uuid,
    conn: PooledConnection,
    local: HashMap<String, String>,
    staged: BTreeMap<String, BTreeMap<Uuid, Staged>>,
    rows_affected: u64,
    finished: bool,
}

impl Transaction {
    pub(crate) fn new(conn: PooledConnection) -> Self {
        Self {
            id: Uuid::new_v4(),
            conn,
            local: HashMap::new(),
            staged: BTreeMap::new(),
            rows_affected: 0,
            finished: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn connection_id(&self) -> u64 {
        self.conn.connection().id()
    }

    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    /// `set_config(name, value, is_local)`.
    pub fn set_config(&mut self, name: &str, value: &str, is_local: bool) -> StorageResult<()> {
        validate_setting_name(name)?;
        if is_local {
            self.local.insert(name.to_string(), value.to_string());
        } else {
            self.conn
                .connection_mut()
                .session_mut()
                .insert(name.to_string(), value.to_string());
        }
        Ok(())
    }

    /// `current_setting(name, true)`: `None` when unset.
    pub fn current_setting(&self, name: &str) -> Option<String> {
        self.visible().setting(name).map(str::to_string)
    }

    /// `SELECT * FROM table [WHERE filter]`, after row security.
    pub fn select(&self, table: &str, filter: Option<&Filter>) -> StorageResult<Vec<Row>> {
        let t = self.table(table)?;
        let policies = self.effective_policies(&t)?;
        let settings = self.visible();

        let mut rows: BTreeMap<Uuid, Row> = t.rows.read().clone();
        if let Some(staged) = self.staged.get(table) {
            for (id, change) in staged {
                match change {
                    Staged::Insert(row) | Staged::Update { row, .. } => {
                        rows.insert(*id, row.clone());
                    }
                    Staged::Delete { .. } => {
                        rows.remove(id);
                    }
                }
            }
        }

        let mut out = Vec::new();
        for row in rows.into_values() {
            if !visible(&policies, &row, &settings)? {
                continue;
            }
            if filter.map_or(true, |f| f.matches(&row)) {
                out.push(row);
            }
        }
        Ok(out)
    }

    /// `INSERT`. The row must satisfy `WITH CHECK` of some policy.
    pub fn insert(&mut self, table: &str, row: Row) -> StorageResult<Uuid> {
        let t = self.table(table)?;
        let policies = self.effective_policies(&t)?;
        check_not_null(&t, &row)?;
        if self.current(&t, row.id).is_some() {
            return Err(StorageError::DuplicateKey {
                table: table.to_string(),
                id: row.id,
            });
        }
        check_write(&policies, &row, &self.visible(), table)?;

        let id = row.id;
        self.stage(table, id, Staged::Insert(row));
        self.rows_affected += 1;
        Ok(id)
    }

    /// `UPDATE .. SET values WHERE id = $1`. Returns rows affected (0 or 1);
    /// rows hidden by row security count as absent.
    pub fn update(&mut self, table: &str, id: Uuid, values: Map<String, Value>) -> StorageResult<u64> {
        let t = self.table(table)?;
        if t.schema.append_only {
            return Err(StorageError::AppendOnly(table.to_string()));
        }
        let policies = self.effective_policies(&t)?;
        let Some(current) = self.current(&t, id) else {
            return Ok(0);
        };
        if !visible(&policies, &current, &self.visible())? {
            return Ok(0);
        }

        if let Some(column) = &t.schema.tenant_column {
            if let Some(new_value) = values.get(column) {
                if current.values.get(column) != Some(new_value) {
                    return Err(StorageError::ImmutableColumn {
                        table: table.to_string(),
                        column: column.clone(),
                    });
                }
            }
        }

        let mut next = current.clone();
        for (k, v) in values {
            next.values.insert(k, v);
        }
        check_write(&policies, &next, &self.visible(), table)?;

        let change = match self.staged.get(table).and_then(|s| s.get(&id)) {
            Some(Staged::Insert(_)) => Staged::Insert(next),
            Some(Staged::Update { base, .. }) => Staged::Update {
                base: base.clone(),
                row: next,
            },
            _ => Staged::Update {
                base: current,
                row: next,
            },
        };
        self.stage(table, id, change);
        self.rows_affected += 1;
        Ok(1)
    }

    /// `DELETE .. WHERE id = $1`. Returns rows affected (0 or 1).
    pub fn delete(&mut self, table: &str, id: Uuid) -> StorageResult<u64> {
        let t = self.table(table)?;
        if t.schema.append_only {
            return Err(StorageError::AppendOnly(table.to_string()));
        }
        let policies = self.effective_policies(&t)?;
        let Some(current) = self.current(&t, id) else {
            return Ok(0);
        };
        if !visible(&policies, &current, &self.visible())? {
            return Ok(0);
        }

        let staged = self.staged.entry(table.to_string()).or_default();
        match staged.get(&id) {
            Some(Staged::Insert(_)) => {
                staged.remove(&id);
            }
            Some(Staged::Update { base, .. }) => {
                let base = base.clone();
                staged.insert(id, Staged::Delete { base });
            }
            _ => {
                staged.insert(id, Staged::Delete { base: current });
            }
        }
        self.rows_affected += 1;
        Ok(1)
    }

    /// `COMMIT`. Applies every staged write atomically and returns rows affected.
    pub fn commit(mut self) -> StorageResult<u64> {
        self.finished = true;
        let staged = std::mem::take(&mut self.staged);
        let engine = self.conn.connection().engine().clone();

        let tables: Vec<(Arc<Table>, BTreeMap<Uuid, Staged>)> = staged
            .into_iter()
            .map(|(name, changes)| engine.table(&name).map(|t| (t, changes)))
            .collect::<StorageResult<_>>()?;

        // Lock in name order (BTreeMap iteration) so concurrent commits cannot deadlock.
        let mut guards: Vec<_> = tables.iter().map(|(t, _)| t.rows.write()).collect();

        for ((table, changes), rows) in tables.iter().zip(guards.iter()) {
            for (id, change) in changes {
                match change {
                    Staged::Insert(_) if rows.contains_key(id) => {
                        return Err(StorageError::DuplicateKey {
                            table: table.schema.name.clone(),
                            id: *id,
                        });
                    }
                    Staged::Update { base, .. } | Staged::Delete { base }
                        if rows.get(id) != Some(base) =>
                    {
                        debug!(transaction_id = %self.id, table = %table.schema.name, row_id = %id, "Concurrent write detected at commit");
                        return Err(StorageError::SerializationFailure {
                            table: table.schema.name.clone(),
                            id: *id,
                        });
                    }
                    _ => {}
                }
            }
        }
        for ((_, changes), rows) in tables.iter().zip(guards.iter_mut()) {
            for (id, change) in changes {
                match change {
                    Staged::Insert(row) | Staged::Update { row, .. } => {
                        rows.insert(*id, row.clone());
                    }
                    Staged::Delete { .. } => {
                        rows.remove(id);
                    }
                }
            }
        }

        debug!(transaction_id = %self.id, rows_affected = self.rows_affected, "Transaction committed");
        Ok(self.rows_affected)
    }

    /// `ROLLBACK`.
    pub fn rollback(mut self) {
        self.finished = true;
        self.discard();
    }

    fn discard(&mut self) {
        if !self.staged.is_empty() {
            debug!(transaction_id = %self.id, tables = self.staged.len(), "Staged writes discarded");
        }
        self.staged.clear();
        self.local.clear();
    }

    fn visible(&self) -> Visible<'_> {
        Visible {
            local: &self.local,
            session: self.conn.connection().session(),
        }
    }

    fn table(&self, name: &str) -> StorageResult<Arc<Table>> {
        self.conn.connection().engine().table(name)
    }

    /// Row policies binding this connection. Every setting they read must be
    /// set before the statement runs, even if the table is empty.
    fn effective_policies(&self, table: &Table) -> StorageResult<Option<Vec<RowPolicy>>> {
        let policies = table
            .security
            .read()
            .effective(self.conn.connection().credential());
        if let Some(policies) = &policies {
            let settings = self.visible();
            for policy in policies {
                for name in policy.using.settings().into_iter().chain(policy.with_check.settings()) {
                    if settings.setting(name).is_none() {
                        return Err(StorageError::UnsetSetting(name.to_string()));
                    }
                }
            }
        }
        Ok(policies)
    }

    /// Latest version of a row as seen by this transaction.
    fn current(&self, table: &Table, id: Uuid) -> Option<Row> {
        match self.staged.get(&table.schema.name).and_then(|s| s.get(&id)) {
            Some(Staged::Insert(row)) | Some(Staged::Update { row, .. }) => Some(row.clone()),
            Some(Staged::Delete { .. }) => None,
            None => table.rows.read().get(&id).cloned(),
        }
    }

    fn stage(&mut self, table: &str, id: Uuid, change: Staged) {
        self.staged
            .entry(table.to_string())
            .or_default()
            .insert(id, change);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            debug!(transaction_id = %self.id, "Transaction dropped without commit, rolling back");
            self.discard();
        }
    }
}

fn visible(
    policies: &Option<Vec<RowPolicy>>,
    row: &Row,
    settings: &dyn SettingLookup,
) -> StorageResult<bool> {
    let Some(policies) = policies else {
        return Ok(true);
    };
    for policy in policies {
        if policy.using.evaluate(row, settings)? {
            return Ok(true);
        }
    }
    // Row security enabled with no permissive policy: default deny.
    Ok(false)
}

fn check_write(
    policies: &Option<Vec<RowPolicy>>,
    row: &Row,
    settings: &dyn SettingLookup,
    table: &str,
) -> StorageResult<()> {
    let Some(policies) = policies else {
        return Ok(());
    };
    for policy in policies {
        if policy.with_check.evaluate(row, settings)? {
            return Ok(());
        }
    }
    Err(StorageError::PolicyViolation(table.to_string()))
}

fn check_not_null(table: &Table, row: &Row) -> StorageResult<()> {
    if let Some(column) = &table.schema.tenant_column {
        let present = row.values.get(column).is_some_and(|v| !v.is_null());
        if !present && !table.schema.tenant_nullable {
            return Err(StorageError::NotNull {
                table: table.schema.name.clone(),
                column: column.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, TableSchema};
    use crate::pool::{Pool, PoolOptions};
    use crate::predicate::Predicate;
    use practice_core::config::Credential;
    use serde_json::json;
    use std::time::Duration;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    fn setup(credential: Credential, force: bool) -> Pool {
        let engine = Arc::new(Engine::new());
        engine.create_table(TableSchema::tenant_scoped("orders", "tenant_id"));
        let predicate = Predicate::Any(vec![
            Predicate::ColumnEqualsSetting {
                column: "tenant_id".into(),
                setting: "app.tenant_id".into(),
            },
            Predicate::SettingEquals {
                setting: "app.role".into(),
                value: "platform_admin".into(),
            },
        ]);
        engine
            .create_policy("orders", RowPolicy::new("tenant_isolation", predicate.clone(), predicate))
            .unwrap();
        engine.enable_row_security("orders", force).unwrap();
        Pool::new(
            engine,
            PoolOptions {
                size: 3,
                checkout_timeout: Duration::from_millis(100),
                reset_on_checkout: true,
                credential,
            },
        )
    }

    async fn bound(pool: &Pool, tenant: &str, role: &str) -> Transaction {
        let mut tx = pool.checkout().await.unwrap().begin();
        tx.set_config("app.tenant_id", tenant, true).unwrap();
        tx.set_config("app.role", role, true).unwrap();
        tx
    }

    #[tokio::test]
    async fn test_rows_filtered_by_bound_tenant() {
        let pool = setup(Credential::Restricted, false);

        let mut tx = bound(&pool, "acme", "tenant_user").await;
        tx.insert("orders", Row::new(obj(json!({"tenant_id": "acme", "sku": "lens"}))))
            .unwrap();
        tx.commit().unwrap();

        let tx = bound(&pool, "globex", "tenant_user").await;
        assert!(tx.select("orders", None).unwrap().is_empty());
        drop(tx);

        let tx = bound(&pool, "", "platform_admin").await;
        assert_eq!(tx.select("orders", None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unbound_statement_fails_even_on_empty_table() {
        let pool = setup(Credential::Restricted, false);
        let tx = pool.checkout().await.unwrap().begin();
        let err = tx.select("orders", None).unwrap_err();
        assert!(matches!(err, StorageError::UnsetSetting(_)));
    }

    #[tokio::test]
    async fn test_owner_bypasses_unless_forced() {
        let pool = setup(Credential::Owner, false);
        let tx = pool.checkout().await.unwrap().begin();
        assert!(tx.select("orders", None).is_ok());
        drop(tx);

        let forced = setup(Credential::Owner, true);
        let tx = forced.checkout().await.unwrap().begin();
        assert!(tx.select("orders", None).is_err());
    }

    #[tokio::test]
    async fn test_with_check_rejects_foreign_tenant_insert() {
        let pool = setup(Credential::Restricted, true);
        let mut tx = bound(&pool, "acme", "tenant_user").await;
        let err = tx
            .insert("orders", Row::new(obj(json!({"tenant_id": "globex"}))))
            .unwrap_err();
        assert_eq!(err, StorageError::PolicyViolation("orders".into()));
    }

    #[tokio::test]
    async fn test_update_cannot_reassign_tenant() {
        let pool = setup(Credential::Restricted, true);
        let mut tx = bound(&pool, "", "platform_admin").await;
        let id = tx
            .insert("orders", Row::new(obj(json!({"tenant_id": "acme", "qty": 1}))))
            .unwrap();
        assert_eq!(tx.update("orders", id, obj(json!({"qty": 2}))).unwrap(), 1);
        let err = tx
            .update("orders", id, obj(json!({"tenant_id": "globex"})))
            .unwrap_err();
        assert!(matches!(err, StorageError::ImmutableColumn { .. }));
    }

    #[tokio::test]
    async fn test_hidden_rows_are_not_updated_or_deleted() {
        let pool = setup(Credential::Restricted, true);
        let mut tx = bound(&pool, "acme", "tenant_user").await;
        let id = tx
            .insert("orders", Row::new(obj(json!({"tenant_id": "acme"}))))
            .unwrap();
        tx.commit().unwrap();

        let mut tx = bound(&pool, "globex", "tenant_user").await;
        assert_eq!(tx.update("orders", id, obj(json!({"qty": 9}))).unwrap(), 0);
        assert_eq!(tx.delete("orders", id).unwrap(), 0);
        tx.commit().unwrap();

        assert_eq!(pool.engine().committed_rows("orders").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_does_not_revive_concurrently_deleted_row() {
        let pool = setup(Credential::Restricted, true);
        let mut tx = bound(&pool, "acme", "tenant_user").await;
        let id = tx
            .insert("orders", Row::new(obj(json!({"tenant_id": "acme", "qty": 1}))))
            .unwrap();
        tx.commit().unwrap();

        let mut updater = bound(&pool, "acme", "tenant_user").await;
        assert_eq!(updater.update("orders", id, obj(json!({"qty": 2}))).unwrap(), 1);

        let mut deleter = bound(&pool, "acme", "tenant_user").await;
        assert_eq!(deleter.delete("orders", id).unwrap(), 1);
        deleter.commit().unwrap();

        assert_eq!(
            updater.commit().unwrap_err(),
            StorageError::SerializationFailure {
                table: "orders".into(),
                id
            }
        );
        assert_eq!(pool.engine().committed_rows("orders").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_updates_first_committer_wins() {
        let pool = setup(Credential::Restricted, true);
        let mut tx = bound(&pool, "acme", "tenant_user").await;
        let id = tx
            .insert("orders", Row::new(obj(json!({"tenant_id": "acme", "qty": 1}))))
            .unwrap();
        tx.commit().unwrap();

        let mut first = bound(&pool, "acme", "tenant_user").await;
        let mut second = bound(&pool, "acme", "tenant_user").await;
        first.update("orders", id, obj(json!({"qty": 2}))).unwrap();
        second.update("orders", id, obj(json!({"qty": 3}))).unwrap();
        second.delete("orders", id).unwrap();
        first.commit().unwrap();
        assert!(matches!(
            second.commit(),
            Err(StorageError::SerializationFailure { .. })
        ));

        let tx = bound(&pool, "acme", "tenant_user").await;
        let rows = tx.select("orders", None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values["qty"], json!(2));
    }

    #[tokio::test]
    async fn test_drop_rolls_back_and_local_settings_vanish() {
        let pool = setup(Credential::Restricted, true);
        let mut tx = bound(&pool, "acme", "tenant_user").await;
        tx.insert("orders", Row::new(obj(json!({"tenant_id": "acme"}))))
            .unwrap();
        drop(tx);
        assert_eq!(pool.engine().committed_rows("orders").unwrap(), 0);

        let tx = pool.checkout().await.unwrap().begin();
        assert_eq!(tx.current_setting("app.tenant_id"), None);
    }

    #[tokio::test]
    async fn test_session_setting_survives_transaction() {
        let pool = Pool::new(
            Arc::new(Engine::new()),
            PoolOptions {
                size: 1,
                reset_on_checkout: false,
                ..PoolOptions::default()
            },
        );
        let mut tx = pool.checkout().await.unwrap().begin();
        tx.set_config("app.tenant_id", "acme", false).unwrap();
        tx.commit().unwrap();

        let tx = pool.checkout().await.unwrap().begin();
        assert_eq!(tx.current_setting("app.tenant_id").as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn test_invalid_setting_name() {
        let pool = setup(Credential::Restricted, true);
        let mut tx = pool.checkout().await.unwrap().begin();
        assert!(matches!(
            tx.set_config("tenant", "acme", true),
            Err(StorageError::InvalidSetting(_))
        ));
        assert!(tx.set_config("app.tenant_id", "acme", true).is_ok());
    }

    #[tokio::test]
    async fn test_append_only_table() {
        let engine = Arc::new(Engine::new());
        engine.create_table(TableSchema::global("ledger").append_only());
        let pool = Pool::new(engine, PoolOptions::default());
        let mut tx = pool.checkout().await.unwrap().begin();
        let id = tx.insert("ledger", Row::new(obj(json!({"n": 1})))).unwrap();
        assert_eq!(
            tx.delete("ledger", id).unwrap_err(),
            StorageError::AppendOnly("ledger".into())
        );
    }
}
