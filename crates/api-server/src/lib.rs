#![warn(clippy::unwrap_used)]

pub mod context;
pub mod error;
pub mod rest;
pub mod server;

pub use error::{ApiError, ErrorResponse};
pub use rest::AppState;
pub use server::{router, ApiServer};
