//! Deterministic, pure logic shared by the loop controller.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod backoff;
pub mod budget;
pub mod classifier;
pub mod completion;
pub mod costs;
pub mod events;
pub mod rate_limit;
pub mod selector;
pub mod session_id;
pub mod struggle;
pub mod types;
