mod common;

use common::{obj, stack, stack_with, user};
use practice_core::config::Credential;
use practice_core::IsolationError;
use serde_json::json;

#[tokio::test]
async fn sequential_transactions_on_one_connection_never_share_bindings() {
    let stack = stack(1);
    let acme = stack.tenants.onboard("Acme").unwrap().id;
    let globex = stack.tenants.onboard("Globex").unwrap().id;

    let mut tx = stack.binder.begin(&user(acme)).await.unwrap();
    stack
        .records
        .create(&mut tx, "invoices", obj(json!({"total": 120})), None)
        .unwrap();
    tx.commit().unwrap();

    let mut connection = None;
    for round in 0..200 {
        let (tenant, other) = if round % 2 == 0 { (acme, globex) } else { (globex, acme) };
        let tx = stack.binder.begin(&user(tenant)).await.unwrap();

        // Single pooled connection: every round reuses it.
        let id = tx.connection_id();
        assert!(connection.is_none() || connection == id);
        connection = id;

        assert_eq!(
            tx.current_setting("app.tenant_id").unwrap(),
            Some(tenant.to_string())
        );
        let rows = stack.records.list(&tx, "invoices").unwrap();
        assert!(rows
            .iter()
            .all(|r| r.get_str("tenant_id") != Some(other.to_string().as_str())));
        if tenant == acme {
            assert_eq!(rows.len(), 1);
        } else {
            assert!(rows.is_empty());
        }
        if round % 3 == 0 {
            tx.abort();
        } else {
            tx.commit().unwrap();
        }
    }
}

#[tokio::test]
async fn bindings_are_gone_after_release_even_without_reset() {
    let stack = stack_with(1, Credential::Restricted, false);
    let acme = stack.tenants.onboard("Acme").unwrap().id;

    let tx = stack.binder.begin(&user(acme)).await.unwrap();
    drop(tx);

    // Raw checkout without binding: transaction-local state did not survive.
    let raw = stack.binder.pool().checkout().await.unwrap().begin();
    assert_eq!(raw.current_setting("app.tenant_id"), None);
    assert_eq!(raw.current_setting("app.role"), None);

    // And the unbound statement fails instead of returning an empty result.
    let err: IsolationError = raw.select("invoices", None).unwrap_err().into();
    assert!(matches!(err, IsolationError::NoTenantContext { .. }));
}

#[tokio::test]
async fn leaked_session_setting_is_shadowed_by_the_binding() {
    let stack = stack_with(1, Credential::Restricted, false);
    let acme = stack.tenants.onboard("Acme").unwrap().id;
    let globex = stack.tenants.onboard("Globex").unwrap().id;

    let mut tx = stack.binder.begin(&user(acme)).await.unwrap();
    stack
        .records
        .create(&mut tx, "orders", obj(json!({"sku": "A-1"})), None)
        .unwrap();
    tx.commit().unwrap();

    // Misbehaving code sets a connection-persistent tenant.
    let mut conn = stack.binder.pool().checkout().await.unwrap();
    conn.set_session("app.tenant_id", &acme.to_string()).unwrap();
    drop(conn);

    let tx = stack.binder.begin(&user(globex)).await.unwrap();
    assert!(stack.records.list(&tx, "orders").unwrap().is_empty());
}

#[tokio::test]
async fn reset_on_checkout_clears_connection_state() {
    let stack = stack_with(1, Credential::Restricted, true);
    let mut conn = stack.binder.pool().checkout().await.unwrap();
    conn.set_session("app.tenant_id", "leaked").unwrap();
    drop(conn);

    let conn = stack.binder.pool().checkout().await.unwrap();
    assert_eq!(conn.connection().session_setting("app.tenant_id"), None);
}

#[tokio::test]
async fn cancelled_request_rolls_back_and_releases_connection() {
    let stack = std::sync::Arc::new(stack(1));
    let acme = stack.tenants.onboard("Acme").unwrap().id;

    let task = {
        let stack = stack.clone();
        tokio::spawn(async move {
            let mut tx = stack.binder.begin(&user(acme)).await.unwrap();
            stack
                .records
                .create(&mut tx, "patients", obj(json!({"name": "pending"})), None)
                .unwrap();
            std::future::pending::<()>().await;
            tx.commit().unwrap();
        })
    };
    tokio::task::yield_now().await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    task.abort();
    let _ = task.await;

    assert_eq!(stack.engine.committed_rows("patients").unwrap(), 0);
    let tx = stack.binder.begin(&user(acme)).await.unwrap();
    assert!(stack.records.list(&tx, "patients").unwrap().is_empty());
}
