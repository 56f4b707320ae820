use practice_core::IsolationError;
use thiserror::Error;
use uuid::Uuid;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("table {0} does not exist")]
    UnknownTable(String),

    #[error("policy {policy} already exists on {table}")]
    PolicyExists { table: String, policy: String },

    /// A policy referenced a setting that was never bound.
    #[error("unrecognized configuration parameter \"{0}\"")]
    UnsetSetting(String),

    #[error("invalid configuration parameter name \"{0}\"")]
    InvalidSetting(String),

    #[error("new row violates row-level security policy for table {0}")]
    PolicyViolation(String),

    #[error("column {column} of {table} cannot be changed after insert")]
    ImmutableColumn { table: String, column: String },

    #[error("null value in column {column} of {table} violates not-null constraint")]
    NotNull { table: String, column: String },

    #[error("{0} is append-only")]
    AppendOnly(String),

    #[error("duplicate key {id} in {table}")]
    DuplicateKey { table: String, id: Uuid },

    /// A staged update or delete found its row changed or gone at commit.
    #[error("could not serialize access to {id} in {table} due to concurrent update")]
    SerializationFailure { table: String, id: Uuid },

    #[error("timed out waiting for a pooled connection")]
    PoolTimeout,

    #[error("connection pool is closed")]
    PoolClosed,
}

impl From<StorageError> for IsolationError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::UnsetSetting(setting) => IsolationError::NoTenantContext {
                operation: format!("statement reading unset {setting}"),
            },
            StorageError::PolicyViolation(table) => IsolationError::CrossTenantAccess {
                principal_id: None,
                context_tenant: None,
                resource_tenant: None,
                resource_type: table,
                resource_id: "new row".to_string(),
            },
            StorageError::DuplicateKey { .. }
            | StorageError::ImmutableColumn { .. }
            | StorageError::NotNull { .. }
            | StorageError::AppendOnly(_) => IsolationError::Validation(err.to_string()),
            other => IsolationError::Storage(other.to_string()),
        }
    }
}
