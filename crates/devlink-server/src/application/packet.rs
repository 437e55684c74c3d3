//! Packets: one instruction bound to a device, queued for dispatch.
//!
//! Ownership is explicit.  A [`Packet`] is move-only: it moves into the pool's
//! queue on enqueue and out of it to the dispatcher, so it can be dispatched
//! at most once.  The outcome is published through a `watch` channel; any
//! number of [`PacketHandle`]s may observe it.
//!
//! A packet that is dropped before it was completed (pool shut down, task
//! aborted mid-exchange) publishes a failed context from its `Drop` impl, so
//! a caller waiting on a handle is always released.

use std::time::Duration;

use devlink_core::{InstructionContext, InstructionDescription, InstructionError, Prioritized};
use tokio::sync::watch;
use tokio::time::Instant;

type Outcome = Option<InstructionContext>;

pub struct Packet {
    id: u64,
    device: String,
    instruction: InstructionDescription,
    priority: u8,
    enqueued_at: Instant,
    completion: Option<watch::Sender<Outcome>>,
}

impl Packet {
    /// Creates a packet and the handle observing its outcome.
    pub fn new(
        id: u64,
        device: impl Into<String>,
        instruction: InstructionDescription,
        priority: u8,
    ) -> (Self, PacketHandle) {
        let (tx, rx) = watch::channel(None);
        let packet = Self {
            id,
            device: device.into(),
            instruction,
            priority,
            enqueued_at: Instant::now(),
            completion: Some(tx),
        };
        (packet, PacketHandle { id, rx })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn instruction(&self) -> &InstructionDescription {
        &self.instruction
    }

    /// Time spent since the packet was created.
    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    /// Publishes the outcome and consumes the packet.
    pub fn complete(mut self, context: InstructionContext) {
        if let Some(tx) = self.completion.take() {
            tx.send_replace(Some(context));
        }
    }

    /// Completes the packet as failed with `error`.
    pub fn fail(self, error: &InstructionError) {
        let context =
            InstructionContext::failure(&self.device, &self.instruction.name, error.to_string());
        self.complete(context);
    }
}

impl Prioritized for Packet {
    fn priority(&self) -> u8 {
        self.priority
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let Some(tx) = self.completion.take() {
            tx.send_replace(Some(InstructionContext::failure(
                &self.device,
                &self.instruction.name,
                InstructionError::Shutdown.to_string(),
            )));
        }
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("instruction", &self.instruction.name)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Shared view of a packet's outcome.
#[derive(Debug, Clone)]
pub struct PacketHandle {
    id: u64,
    rx: watch::Receiver<Outcome>,
}

impl PacketHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// `true` once the packet has been completed (successfully or not).
    pub fn is_processed(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The outcome, if the packet has been completed.
    pub fn context(&self) -> Option<InstructionContext> {
        self.rx.borrow().clone()
    }

    /// Waits until the packet is completed.
    pub async fn wait(&self) -> InstructionContext {
        let mut rx = self.rx.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            InstructionContext::failure("", "", InstructionError::Shutdown.to_string())
        })
    }
}
