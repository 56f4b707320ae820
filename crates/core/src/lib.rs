pub mod config;
pub mod error;
pub mod types;

pub use config::AppConfig;
pub use error::{IsolationError, IsolationResult};
pub use types::{
    AuthenticatedPrincipal, Principal, PrincipalId, Role, SessionContext, Tenant, TenantId,
    TenantRole, TenantStatus,
};
