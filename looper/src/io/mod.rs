//! I/O helpers for looper commands.

pub mod agent;
pub mod config;
pub mod context;
pub mod cost;
pub mod interrupt;
pub mod iteration_log;
pub mod lock;
pub mod mcp;
pub mod pid;
pub mod process;
pub mod prompt;
pub mod rate_limits;
pub mod sandbox;
pub mod session;
pub mod slots;
pub mod snapshot;
pub mod store;
