//! Transaction-local binding of the session context.
//!
//! Every transaction is opened through [`TransactionContextBinder`], which sets
//! the tenant and role as transaction-local settings before handing out a
//! [`BoundTransaction`]. The settings live inside the storage transaction and
//! disappear with it, so a pooled connection never carries them over.

use practice_core::config::DatabaseConfig;
use practice_core::{IsolationError, IsolationResult, SessionContext};
use practice_store::{Filter, Pool, Row, Transaction};
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Instant;
use tracing::{error, info};
use uuid::Uuid;

/// Log target of the per-transaction record.
pub const TRANSACTION_LOG_TARGET: &str = "practice_platform::transaction";

/// Per-transaction lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Unbound,
    Bound,
    Committed,
    Aborted,
}

impl TxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Unbound => "unbound",
            TxState::Bound => "bound",
            TxState::Committed => "committed",
            TxState::Aborted => "aborted",
        }
    }
}

/// Names of the transaction-local settings the row policies read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSettings {
    pub tenant: String,
    pub role: String,
}

impl Default for BindingSettings {
    fn default() -> Self {
        Self {
            tenant: "app.tenant_id".to_string(),
            role: "app.role".to_string(),
        }
    }
}

impl From<&DatabaseConfig> for BindingSettings {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            tenant: config.tenant_setting.clone(),
            role: config.role_setting.clone(),
        }
    }
}

/// Opens transactions with the session context bound.
#[derive(Clone)]
pub struct TransactionContextBinder {
    pool: Pool,
    settings: BindingSettings,
}

impl TransactionContextBinder {
    pub fn new(pool: Pool, settings: BindingSettings) -> Self {
        Self { pool, settings }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn settings(&self) -> &BindingSettings {
        &self.settings
    }

    /// Begin a transaction bound to a tenant-scoped context.
    ///
    /// Platform admin contexts are refused here; they are only bound by the
    /// bypass gate, which audits them.
    pub async fn begin(&self, context: &SessionContext) -> IsolationResult<BoundTransaction> {
        if let SessionContext::PlatformAdmin { principal_id, .. } = context {
            error!(principal_id = %principal_id, "Platform admin context bound outside bypass");
            return Err(IsolationError::UnauditedBypass {
                principal_id: *principal_id,
            });
        }
        self.begin_bound(context).await
    }

    pub(crate) async fn begin_privileged(
        &self,
        context: &SessionContext,
    ) -> IsolationResult<BoundTransaction> {
        self.begin_bound(context).await
    }

    async fn begin_bound(&self, context: &SessionContext) -> IsolationResult<BoundTransaction> {
        let conn = self.pool.checkout().await?;
        let mut tx = BoundTransaction::unbound(conn.begin(), context.clone());
        // Binding failures abort the transaction and are not retried.
        if let Err(e) = tx.bind(&self.settings) {
            metrics::counter!("isolation.binding_failures").increment(1);
            error!(
                transaction_id = %tx.id(),
                principal_id = %context.principal_id(),
                error = %e,
                "Transaction context binding failed"
            );
            tx.abort();
            return Err(e);
        }
        Ok(tx)
    }
}

/// Value bound to the tenant setting. Platform admins bind the empty string,
/// which never equals a tenant column, so only the role branch admits rows.
fn bound_tenant_value(context: &SessionContext) -> String {
    context
        .tenant_id()
        .map(|t| t.to_string())
        .unwrap_or_default()
}

/// A storage transaction carrying exactly one session context.
///
/// Data operations are only legal in the `Bound` state. `commit` and `abort`
/// consume the handle, so a finished context can never be reused. Dropping it
/// rolls back.
pub struct BoundTransaction {
    id: Uuid,
    tx: Option<Transaction>,
    context: SessionContext,
    state: TxState,
    bypass_used: bool,
    started: Instant,
}

impl BoundTransaction {
    pub(crate) fn unbound(tx: Transaction, context: SessionContext) -> Self {
        Self {
            id: tx.id(),
            tx: Some(tx),
            context,
            state: TxState::Unbound,
            bypass_used: false,
            started: Instant::now(),
        }
    }

    fn bind(&mut self, settings: &BindingSettings) -> IsolationResult<()> {
        if self.state != TxState::Unbound {
            return Err(IsolationError::BindingFailure(format!(
                "transaction {} already {}",
                self.id,
                self.state.as_str()
            )));
        }
        let tenant = bound_tenant_value(&self.context);
        let role = self.context.role().as_str();
        let tx = self.tx_mut("bind")?;

        tx.set_config(&settings.tenant, &tenant, true)
            .map_err(|e| IsolationError::BindingFailure(e.to_string()))?;
        tx.set_config(&settings.role, role, true)
            .map_err(|e| IsolationError::BindingFailure(e.to_string()))?;

        let read_tenant = tx.current_setting(&settings.tenant);
        let read_role = tx.current_setting(&settings.role);
        if read_tenant.as_deref() != Some(tenant.as_str()) || read_role.as_deref() != Some(role) {
            return Err(IsolationError::BindingFailure(format!(
                "read back {read_tenant:?}/{read_role:?}, expected {tenant:?}/{role:?}"
            )));
        }

        self.state = TxState::Bound;
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn bypass_used(&self) -> bool {
        self.bypass_used
    }

    pub(crate) fn mark_bypass(&mut self) {
        self.bypass_used = true;
    }

    pub fn rows_affected(&self) -> u64 {
        self.tx.as_ref().map_or(0, Transaction::rows_affected)
    }

    pub fn connection_id(&self) -> Option<u64> {
        self.tx.as_ref().map(Transaction::connection_id)
    }

    /// Value of a setting as the storage engine sees it.
    pub fn current_setting(&self, name: &str) -> IsolationResult<Option<String>> {
        Ok(self.bound("current_setting")?.current_setting(name))
    }

    pub fn select(&self, table: &str, filter: Option<&Filter>) -> IsolationResult<Vec<Row>> {
        Ok(self.bound("select")?.select(table, filter)?)
    }

    pub fn insert(&mut self, table: &str, row: Row) -> IsolationResult<Uuid> {
        Ok(self.bound_mut("insert")?.insert(table, row)?)
    }

    pub fn update(&mut self, table: &str, id: Uuid, values: Map<String, Value>) -> IsolationResult<u64> {
        Ok(self.bound_mut("update")?.update(table, id, values)?)
    }

    pub fn delete(&mut self, table: &str, id: Uuid) -> IsolationResult<u64> {
        Ok(self.bound_mut("delete")?.delete(table, id)?)
    }

    pub fn commit(mut self) -> IsolationResult<u64> {
        let tx = self.take("commit")?;
        match tx.commit() {
            Ok(rows) => {
                self.finish(TxState::Committed, rows);
                Ok(rows)
            }
            Err(e) => {
                self.finish(TxState::Aborted, 0);
                Err(e.into())
            }
        }
    }

    pub fn abort(mut self) {
        self.rollback();
    }

    fn rollback(&mut self) {
        if let Some(tx) = self.tx.take() {
            tx.rollback();
            self.finish(TxState::Aborted, 0);
        }
    }

    fn bound(&self, operation: &str) -> IsolationResult<&Transaction> {
        if self.state != TxState::Bound {
            return Err(IsolationError::no_context(operation));
        }
        self.tx
            .as_ref()
            .ok_or_else(|| IsolationError::no_context(operation))
    }

    fn bound_mut(&mut self, operation: &str) -> IsolationResult<&mut Transaction> {
        if self.state != TxState::Bound {
            return Err(IsolationError::no_context(operation));
        }
        self.tx_mut(operation)
    }

    fn tx_mut(&mut self, operation: &str) -> IsolationResult<&mut Transaction> {
        self.tx
            .as_mut()
            .ok_or_else(|| IsolationError::no_context(operation))
    }

    fn take(&mut self, operation: &str) -> IsolationResult<Transaction> {
        if self.state != TxState::Bound {
            return Err(IsolationError::no_context(operation));
        }
        self.tx
            .take()
            .ok_or_else(|| IsolationError::no_context(operation))
    }

    /// Terminal transition: emits the transaction record and releases the context.
    fn finish(&mut self, outcome: TxState, rows_affected: u64) {
        let was_bound = self.state == TxState::Bound;
        self.state = outcome;
        if !was_bound {
            return;
        }
        let duration_ms = self.started.elapsed().as_millis() as u64;
        info!(
            target: TRANSACTION_LOG_TARGET,
            transaction_id = %self.id,
            principal_id = %self.context.principal_id(),
            tenant_id = %bound_tenant_value(&self.context),
            bypass_used = self.bypass_used,
            duration_ms,
            rows_affected,
            outcome = outcome.as_str(),
            "Transaction finished"
        );
        metrics::counter!("isolation.transactions", "outcome" => outcome.as_str()).increment(1);
    }
}

impl Drop for BoundTransaction {
    fn drop(&mut self) {
        self.rollback();
    }
}
