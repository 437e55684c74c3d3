//! Domain types shared by every layer of the engine.
//!
//! Descriptions are read-only once constructed; they are normally wrapped in
//! an `Arc` and shared between the pool that schedules work for a device and
//! the link that carries its bytes.

pub mod context;
pub mod description;
pub mod endpoint;
pub mod instruction;
