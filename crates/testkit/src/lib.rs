//! Test support for cosmosql.
//!
//! [`Emulator`] implements the client's `HttpSender` over an in-memory account,
//! so driver and client tests run the full request pipeline (signing, retries,
//! routing, cross-partition merges) without a live service.
//!
//! - **Emulation**: databases, containers, documents, offers and key ranges (`emulator`).
//! - **Queries**: per-range query evaluation with resumable continuations (`eval`, `query`).
//! - **Faults**: scripted throttling, gone and error responses (`fault`).
pub mod emulator;
pub mod eval;
pub mod fault;
pub mod query;

pub use emulator::{Emulator, RecordedRequest, ACCOUNT_KEY, ENDPOINT};
pub use fault::Fault;
