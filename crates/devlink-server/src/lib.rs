//! devlink-server library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! ```text
//! application/      scheduling: packets, pools, health, shared scheduler
//! infrastructure/
//!   network/        multiplexer, clients, listeners, connector, services
//!   storage/        TOML configuration
//! ```

pub mod application;
pub mod infrastructure;
