//! Application layer: instruction scheduling independent of any transport.
//!
//! Everything here talks to the outside world only through the [`Link`]
//! trait, so pools can be driven by real sockets in production and by
//! recording doubles in tests.
//!
//! - **`packet`** – one queued instruction and the handle its caller polls.
//! - **`link`** – the byte-sending seam implemented by infrastructure.
//! - **`health`** – connection-health policies (`AlwaysOnline`, `HealthMonitor`).
//! - **`instruction_pool`** – the per-(channel, device) work queue and its
//!   send/await-response exchange.
//! - **`scheduler`** – one task shared round-robin by many pools.
//! - **`sender_pool`** – pools wired with a health monitor, in single-task
//!   and dedicated-task flavours.

pub mod health;
pub mod instruction_pool;
pub mod link;
pub mod packet;
pub mod scheduler;
pub mod sender_pool;

pub use health::{AlwaysOnline, HealthMonitor, HealthPolicy, LinkStatus, StatusChange};
pub use instruction_pool::{
    ContextConsumer, InstructionPool, PoolBuilder, ResponseSink, DEFAULT_CAPACITY,
    DEFAULT_PRIORITY, HIGHEST_PRIORITY,
};
pub use link::{Link, LinkError};
pub use packet::{Packet, PacketHandle};
pub use scheduler::SharedScheduler;
pub use sender_pool::SenderPool;
