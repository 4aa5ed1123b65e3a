//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted connection:
//!     → limits.rs (take an admission ticket or reject)
//!     → ticket travels in the connection's feature bag
//!     → slot returned when the chain finishes (or released early)
//! ```
//!
//! # Design Decisions
//! - Fail closed: over-quota connections are closed, not queued
//! - Releasing is idempotent so every cleanup path may call it

pub mod limits;

pub use limits::{AdmissionTicket, ConnectionLimiter, ConnectionReleaser, ResourceCounter};
