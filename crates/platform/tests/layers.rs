//! Each enforcement layer holds on its own when the others are missing.

mod common;

use common::{config, obj, stack, user};
use practice_core::IsolationError;
use practice_platform::{InstallOutcome, IsolationStack, PolicyGap};
use practice_store::{Row, TableSchema};
use serde_json::json;

#[tokio::test]
async fn row_security_scopes_writes_that_skip_the_guard() {
    let stack = stack(2);
    let acme = stack.tenants.onboard("Acme").unwrap().id;
    let globex = stack.tenants.onboard("Globex").unwrap().id;

    let mut tx = stack.binder.begin(&user(acme)).await.unwrap();
    let row = stack
        .records
        .create(&mut tx, "orders", obj(json!({"qty": 1})), None)
        .unwrap();
    tx.commit().unwrap();

    // Buggy business code: straight to storage, no ownership check.
    let mut tx = stack.binder.begin(&user(globex)).await.unwrap();
    assert_eq!(tx.update("orders", row.id, obj(json!({"qty": 99}))).unwrap(), 0);
    assert_eq!(tx.delete("orders", row.id).unwrap(), 0);

    let forged = Row::new(obj(json!({"tenant_id": acme.to_string(), "qty": 5})));
    let err = tx.insert("orders", forged).unwrap_err();
    assert!(matches!(err, IsolationError::CrossTenantAccess { .. }));
    tx.commit().unwrap();

    let tx = stack.binder.begin(&user(acme)).await.unwrap();
    let rows = tx.select("orders", None).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].values["qty"], json!(1));
}

#[tokio::test]
async fn guard_rejects_cross_tenant_writes_without_row_security() {
    // Policies declared but never installed.
    let stack = IsolationStack::new(&config(2)).unwrap();
    let acme = stack.tenants.onboard("Acme").unwrap().id;
    let globex = stack.tenants.onboard("Globex").unwrap().id;

    let mut tx = stack.binder.begin(&user(acme)).await.unwrap();
    let row = stack
        .records
        .create(&mut tx, "invoices", obj(json!({"total": 10})), None)
        .unwrap();
    tx.commit().unwrap();

    let mut tx = stack.binder.begin(&user(globex)).await.unwrap();
    let err = stack
        .records
        .update(&mut tx, "invoices", row.id, obj(json!({"total": 0})))
        .unwrap_err();
    assert!(matches!(err, IsolationError::CrossTenantAccess { .. }));
    assert!(err.is_authorization_failure());
    let err = stack.records.delete(&mut tx, "invoices", row.id).unwrap_err();
    assert!(matches!(err, IsolationError::CrossTenantAccess { .. }));

    // Without row security the unfiltered list is not scoped; coverage says so.
    assert_eq!(stack.records.list(&tx, "invoices").unwrap().len(), 1);
    assert!(!stack.policies.coverage_report().is_covered());
}

#[tokio::test]
async fn policy_installation_is_idempotent() {
    let stack = stack(1);
    let before: Vec<_> = stack.engine.catalog();

    let outcomes = stack.policies.install_all().unwrap();
    assert!(outcomes
        .iter()
        .all(|(_, outcome)| *outcome == InstallOutcome::AlreadyInstalled));

    let after = stack.engine.catalog();
    for (b, a) in before.iter().zip(after.iter()) {
        assert_eq!(b.policies, a.policies);
        assert_eq!(a.policies.len(), 1);
        assert!(a.rls_enabled && a.rls_forced);
    }
    assert!(stack.policies.coverage_report().is_covered());
}

#[tokio::test]
async fn new_table_without_policy_is_reported() {
    let stack = stack(1);
    stack
        .engine
        .create_table(TableSchema::tenant_scoped("lab_results", "tenant_id"));

    let report = stack.policies.coverage_report();
    let gaps: Vec<_> = report
        .gaps
        .iter()
        .filter(|g| g.table == "lab_results")
        .map(|g| g.gap.clone())
        .collect();
    assert_eq!(gaps, vec![PolicyGap::RowSecurityDisabled, PolicyGap::NoPolicy]);
}

#[tokio::test]
async fn unforced_table_lets_owner_credentials_through() {
    let stack = stack(1);
    let acme = stack.tenants.onboard("Acme").unwrap().id;
    let globex = stack.tenants.onboard("Globex").unwrap().id;

    let mut tx = stack.binder.begin(&user(acme)).await.unwrap();
    stack
        .records
        .create(&mut tx, "patients", obj(json!({"name": "Ada"})), None)
        .unwrap();
    tx.commit().unwrap();

    stack.engine.unforce_row_security("patients").unwrap();
    let report = stack.policies.coverage_report();
    assert!(report
        .gaps
        .iter()
        .any(|g| g.table == "patients" && g.gap == PolicyGap::NotForced));

    let tx = stack.binder.begin(&user(globex)).await.unwrap();
    assert_eq!(stack.records.list(&tx, "patients").unwrap().len(), 1);
    drop(tx);

    assert_eq!(
        stack.policies.install("patients").unwrap(),
        InstallOutcome::Installed
    );
    let tx = stack.binder.begin(&user(globex)).await.unwrap();
    assert!(stack.records.list(&tx, "patients").unwrap().is_empty());
}

#[tokio::test]
async fn unbound_storage_access_fails_closed_on_empty_tables() {
    let stack = stack(1);
    let raw = stack.binder.pool().checkout().await.unwrap().begin();
    for table in ["patients", "orders", "prescriptions", "invoices", "audit_log"] {
        let err: IsolationError = raw.select(table, None).unwrap_err().into();
        assert!(err.is_internal(), "{table} returned {err:?}");
    }
}
