//! Shared plumbing for the backend services: environment settings, logging,
//! the Postgres pool with auto-committing transactions, and the RabbitMQ
//! client with its validated (and optionally batched) consumption pipeline.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod rabbitmq;
pub mod transaction;

pub use error::{AppError, Result};
