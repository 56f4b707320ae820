//! The only path that binds a platform admin context.

use crate::audit::{AuditAction, AuditEntry, AuditRecorder};
use crate::binder::{BoundTransaction, TransactionContextBinder};
use crate::guard::AccessGuard;
use practice_core::{IsolationError, IsolationResult, SessionContext};
use std::sync::Arc;
use tracing::{info, warn};

/// Value returned by a bypassed action together with its audit entry.
#[derive(Debug, Clone)]
pub struct Bypassed<T> {
    pub value: T,
    pub audit: AuditEntry,
}

pub struct BypassGate {
    binder: TransactionContextBinder,
    audit: Arc<AuditRecorder>,
}

impl BypassGate {
    pub fn new(binder: TransactionContextBinder, audit: Arc<AuditRecorder>) -> Self {
        Self { binder, audit }
    }

    /// Run `f` with cross-tenant access.
    ///
    /// The caller must be a platform admin and give a non-empty reason. Exactly
    /// one audit entry with `bypass_used = true` is written in the same
    /// transaction before `f` runs. If `f` or the commit fails, the whole
    /// transaction (audit entry included) rolls back and nothing was bypassed.
    pub async fn with_platform_admin_bypass<T, F>(
        &self,
        context: &SessionContext,
        reason: &str,
        action: AuditAction,
        f: F,
    ) -> IsolationResult<Bypassed<T>>
    where
        F: FnOnce(&mut BoundTransaction) -> IsolationResult<T>,
    {
        let principal_id = AccessGuard::require_platform_admin(context).inspect_err(|e| {
            warn!(
                principal_id = %context.principal_id(),
                action = %action.action,
                error = %e,
                security_event = true,
                "Bypass refused"
            );
        })?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(IsolationError::Validation(
                "a bypass requires a reason".to_string(),
            ));
        }

        let admin = SessionContext::platform_admin(principal_id, Some(reason.to_string()));
        let mut tx = self.binder.begin_privileged(&admin).await?;
        tx.mark_bypass();
        let audit = self.audit.record(&mut tx, &action)?;

        let value = match f(&mut tx) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    transaction_id = %tx.id(),
                    principal_id = %principal_id,
                    action = %action.action,
                    error = %e,
                    "Bypassed action failed, rolling back"
                );
                tx.abort();
                return Err(e);
            }
        };
        tx.commit()?;

        metrics::counter!("isolation.bypass").increment(1);
        info!(
            principal_id = %principal_id,
            audit_id = %audit.id,
            action = %audit.action,
            reason = %reason,
            "Platform admin bypass completed"
        );
        Ok(Bypassed { value, audit })
    }
}
