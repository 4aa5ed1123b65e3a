//! Synchronization primitives shared by the TLS and transport layers.
//!
//! # Design Decisions
//! - Hot paths reuse their waiters and timers instead of allocating per operation
//! - Native callback threads only ever complete; async tasks only ever wait

pub mod completion;
pub mod timer_pool;

pub use completion::ResettableCompletionSource;
pub use timer_pool::{PooledTimer, TimerPool};
