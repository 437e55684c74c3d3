//! # devlink-core
//!
//! Shared domain types for the devlink instruction engine.  This crate has no
//! dependency on sockets or an async runtime; everything here is plain data
//! plus the two algorithms that must be testable in isolation:
//!
//! - **`domain`** – [`Endpoint`], the read-only channel/device/instruction
//!   descriptions supplied by configuration, and the [`InstructionContext`]
//!   that records the outcome of one dispatched instruction.
//!
//! - **`queue`** – the bounded priority queue that backs every instruction
//!   pool (lower priority value dequeues first, FIFO within a priority,
//!   explicit eviction on overflow) and the sequence counter used to number
//!   packets and sockets.
//!
//! - **`framing`** – strategies that cut a raw byte stream into frames
//!   before they are handed to a pool as responses.

pub mod domain;
pub mod framing;
pub mod queue;

pub use domain::context::InstructionContext;
pub use domain::description::{
    ChannelDescription, ChannelProtocol, DeviceDescription, ReconnectPolicy,
    DEFAULT_DETECTION_THRESHOLD, DEFAULT_TIMEOUT,
};
pub use domain::endpoint::{Endpoint, EndpointParseError};
pub use domain::instruction::{
    Decoded, FixedBytesCodec, InstructionCodec, InstructionDescription, InstructionError,
};
pub use framing::{FrameBuffer, Framing, FramingError, Pushed};
pub use queue::priority::{BoundedPriorityQueue, Enqueued, Prioritized};
pub use queue::sequence::SequenceCounter;
