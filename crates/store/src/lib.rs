//! In-process storage engine with native transaction-local settings and
//! declarative row-level security.
//!
//! The engine models the parts of a relational database that tenant
//! isolation depends on:
//! - settings bound with `set_config(name, value, is_local = true)` live in the
//!   transaction and disappear with it; `is_local = false` settings stick to the
//!   pooled connection until it is reset
//! - row policies (`USING` / `WITH CHECK`) are evaluated by the engine on every
//!   select, insert, update and delete, not by callers
//! - a policy that reads an unset setting fails the statement instead of
//!   returning an empty result

pub mod engine;
pub mod error;
pub mod pool;
pub mod predicate;
pub mod transaction;

pub use engine::{Engine, Row, TableInfo, TableSchema};
pub use error::{StorageError, StorageResult};
pub use pool::{Connection, Pool, PoolOptions, PooledConnection};
pub use practice_core::config::Credential;
pub use predicate::{Filter, Predicate, RowPolicy, SettingLookup};
pub use transaction::Transaction;
