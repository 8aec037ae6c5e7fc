//! Common utilities, types, and configurations shared across cosmosql crates.
//!
//! This crate contains the base building blocks of the driver, including:
//! - **Configuration**: Strongly typed driver settings (`config`).
//! - **Resilience**: Backoff and the service retry policy (`retry`).
//! - **Cancellation**: Deadline-bearing call contexts (`context`).
//! - **Accounting**: Request-unit meters (`charge`).
//! - **Partitioning**: Partition key definitions and values (`models`).
//! - **Telemetry**: Log subscriber setup (`telemetry`).
pub mod charge;
pub mod config;
pub mod context;
pub mod models;
pub mod retry;
pub mod telemetry;

pub use charge::ChargeMeter;
pub use context::CallContext;
