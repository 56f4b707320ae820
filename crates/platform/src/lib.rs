//! Multi-tenant data isolation: session context derivation, transaction
//! binding, row security policies, access guards and the audit trail.
//!
//! Each layer enforces tenant scoping on its own. The middleware rejects
//! requests without a tenant, row security filters every statement, the guard
//! rejects explicit cross-tenant writes, and bypasses are audited.

pub mod audit;
pub mod binder;
pub mod bypass;
pub mod guard;
pub mod middleware;
pub mod policy;
mod policy_sql;
pub mod records;
pub mod tenancy;

pub use audit::{AuditAction, AuditEntry, AuditRecorder};
pub use binder::{BindingSettings, BoundTransaction, TransactionContextBinder, TxState};
pub use bypass::{BypassGate, Bypassed};
pub use guard::{AccessGuard, ResourceRef};
pub use middleware::TenantContextMiddleware;
pub use policy::{
    CoverageReport, CoverageStatus, InstallOutcome, PolicyGap, PolicyGapWarning,
    RowSecurityPolicyEngine,
};
pub use records::RecordStore;
pub use tenancy::{RoleChange, TenantDirectory};

use practice_core::config::AppConfig;
use practice_core::IsolationResult;
use practice_store::{Engine, Pool, PoolOptions};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// The wired isolation stack shared by the API and the CLI.
pub struct IsolationStack {
    pub engine: Arc<Engine>,
    pub binder: TransactionContextBinder,
    pub policies: RowSecurityPolicyEngine,
    pub audit: Arc<AuditRecorder>,
    pub bypass: BypassGate,
    pub tenants: TenantDirectory,
    pub records: RecordStore,
}

impl IsolationStack {
    /// Declare tables and open the pool. Policies are not installed yet.
    pub fn new(config: &AppConfig) -> IsolationResult<Self> {
        let engine = Arc::new(Engine::new());
        let settings = BindingSettings::from(&config.database);
        let audit = Arc::new(AuditRecorder::new());

        let mut policies = RowSecurityPolicyEngine::new(engine.clone(), settings.clone());
        policies.declare_all(config.isolation.tenant_tables.iter().cloned())?;
        policies.declare(audit.schema())?;

        let pool = Pool::new(
            engine.clone(),
            PoolOptions {
                size: config.database.pool_size,
                checkout_timeout: Duration::from_millis(config.database.checkout_timeout_ms),
                reset_on_checkout: config.database.reset_on_checkout,
                credential: config.database.credential,
            },
        );
        let binder = TransactionContextBinder::new(pool, settings);
        let bypass = BypassGate::new(binder.clone(), audit.clone());

        info!(
            tables = config.isolation.tenant_tables.len(),
            pool_size = config.database.pool_size,
            "Isolation stack initialized"
        );

        Ok(Self {
            engine,
            binder,
            policies,
            audit,
            bypass,
            tenants: TenantDirectory::new(),
            records: RecordStore::new(config.isolation.tenant_tables.iter().cloned()),
        })
    }

    /// `new` followed by policy installation on every declared table.
    pub fn bootstrap(config: &AppConfig) -> IsolationResult<Self> {
        let stack = Self::new(config)?;
        stack.policies.install_all()?;
        Ok(stack)
    }
}
