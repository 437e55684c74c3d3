//! Infrastructure layer: sockets, TLS, and configuration files.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `devlink_core`, but MUST NOT be imported by the `application` layer.

pub mod network;
pub mod storage;
