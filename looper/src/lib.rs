//! Iteration scheduler for AI-agent CLIs.
//!
//! `looper` runs an agent on the same task over and over until the agent
//! signals genuine completion, while guarding the host against runaway
//! spend, stalled processes, and provider rate limits. The architecture
//! keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (classification, model
//!   selection, budget, struggle counters). No I/O, fully testable in
//!   isolation.
//! - **[`io`]**: Side-effecting operations (locked file store, sandboxed
//!   process execution, prompts, signals). Isolated behind traits where
//!   tests need fakes.
//!
//! Orchestration modules ([`start`], [`looping`], [`validate`], [`status`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod start;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
