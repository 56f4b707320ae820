#![allow(dead_code)]

use practice_core::config::{AppConfig, Credential};
use practice_core::{PrincipalId, SessionContext, TenantId, TenantRole};
use practice_platform::IsolationStack;
use serde_json::{Map, Value};

pub fn config(pool_size: usize) -> AppConfig {
    let mut config = AppConfig::default();
    config.database.pool_size = pool_size;
    config.database.checkout_timeout_ms = 2_000;
    config
}

pub fn stack(pool_size: usize) -> IsolationStack {
    IsolationStack::bootstrap(&config(pool_size)).unwrap()
}

pub fn stack_with(pool_size: usize, credential: Credential, reset_on_checkout: bool) -> IsolationStack {
    let mut config = config(pool_size);
    config.database.credential = credential;
    config.database.reset_on_checkout = reset_on_checkout;
    IsolationStack::bootstrap(&config).unwrap()
}

pub fn user(tenant: TenantId) -> SessionContext {
    SessionContext::tenant(PrincipalId::new(), tenant, TenantRole::TenantUser)
}

pub fn admin() -> SessionContext {
    SessionContext::platform_admin(PrincipalId::new(), None)
}

pub fn obj(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
