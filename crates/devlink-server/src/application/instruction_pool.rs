//! Per-(channel, device) instruction scheduling.
//!
//! An [`InstructionPool`] decouples "something wants this device to do X"
//! from "the link is free to send".  Callers enqueue instructions with a
//! priority; a dispatcher pulls them off one at a time, performs the
//! send/await-response exchange over the pool's [`Link`], and publishes an
//! [`InstructionContext`] for every packet.
//!
//! # Dispatch modes
//!
//! - **Dedicated** – the pool owns one tokio task, started with
//!   [`InstructionPool::start`].
//! - **Shared** – the pool is registered on a [`SharedScheduler`] which
//!   round-robins one packet per pool per turn.
//!
//! # Responses
//!
//! Inbound frames for the device arrive through a [`ResponseSink`] (or
//! [`InstructionPool::on_response`]).  During an exchange the dispatcher
//! offers each frame to the instruction's codec until one completes the
//! request or the deadline passes.  Frames arriving while nothing is
//! outstanding are discarded at the start of the next exchange.
//!
//! # Tick instructions
//!
//! Periodic instructions are kept in a name → tick map.  Whenever the
//! dispatcher looks for work it enqueues every tick whose period has elapsed
//! and whose previous packet has completed, so a slow device never
//! accumulates a backlog of identical polls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use devlink_core::{
    BoundedPriorityQueue, ChannelDescription, Decoded, DeviceDescription, Enqueued,
    InstructionContext, InstructionDescription, InstructionError, SequenceCounter,
};
use serde_json::{Map, Value};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::application::health::{AlwaysOnline, HealthPolicy, LinkStatus};
use crate::application::link::Link;
use crate::application::packet::{Packet, PacketHandle};
use crate::application::scheduler::SharedScheduler;

/// Most urgent priority; used by synchronous calls.
pub const HIGHEST_PRIORITY: u8 = 0;
pub const DEFAULT_PRIORITY: u8 = 5;
pub const DEFAULT_CAPACITY: usize = 64;

/// Longest the dispatcher sleeps without being woken.
pub(crate) const IDLE_WAIT: Duration = Duration::from_secs(1);

const RESPONSE_BUFFER: usize = 64;

/// Callback receiving every completed context.
pub type ContextConsumer = Arc<dyn Fn(&InstructionContext) + Send + Sync>;

/// Cloneable entry point for inbound frames addressed to one pool.
///
/// Every accepted frame also tells the pool's health policy that the device
/// is talking, which lifts an offline device back to `Unknown`.
#[derive(Clone)]
pub struct ResponseSink {
    tx: mpsc::Sender<Vec<u8>>,
    pool: Arc<str>,
    device: Arc<DeviceDescription>,
    health: Arc<dyn HealthPolicy>,
}

impl ResponseSink {
    /// Hands one complete frame to the pool.  Returns `false` if the frame
    /// was dropped because the pool is gone or not keeping up.
    pub fn deliver(&self, frame: Vec<u8>) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.health.frame_received(&self.device);
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!("pool {}: response buffer full, dropping frame", self.pool);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

impl std::fmt::Debug for ResponseSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseSink").field("pool", &self.pool).finish()
    }
}

enum DispatchMode {
    Dedicated,
    Shared(SharedScheduler),
}

struct TickEntry {
    instruction: InstructionDescription,
    period: Duration,
    last_fired: Option<Instant>,
    pending: Option<PacketHandle>,
}

impl TickEntry {
    fn is_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|h| !h.is_processed())
    }

    fn due_in(&self, now: Instant) -> Duration {
        match self.last_fired {
            None => Duration::ZERO,
            Some(last) => self.period.saturating_sub(now.saturating_duration_since(last)),
        }
    }
}

pub(crate) struct PoolShared {
    name: Arc<str>,
    channel: Arc<ChannelDescription>,
    device: Arc<DeviceDescription>,
    link: Arc<dyn Link>,
    health: Arc<dyn HealthPolicy>,
    consumer: Option<ContextConsumer>,
    tick_priority: u8,
    queue: Mutex<BoundedPriorityQueue<Packet>>,
    ticks: Mutex<HashMap<String, TickEntry>>,
    packet_ids: SequenceCounter,
    paused: AtomicBool,
    closed: AtomicBool,
    wake: Arc<Notify>,
    responses_tx: mpsc::Sender<Vec<u8>>,
    responses: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    processed: AtomicU64,
    mode: DispatchMode,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`InstructionPool`].
pub struct PoolBuilder {
    channel: Arc<ChannelDescription>,
    device: Arc<DeviceDescription>,
    link: Arc<dyn Link>,
    capacity: usize,
    health: Option<Arc<dyn HealthPolicy>>,
    consumer: Option<ContextConsumer>,
    tick_priority: u8,
    scheduler: Option<SharedScheduler>,
}

impl PoolBuilder {
    pub fn new(
        channel: Arc<ChannelDescription>,
        device: Arc<DeviceDescription>,
        link: Arc<dyn Link>,
    ) -> Self {
        Self {
            channel,
            device,
            link,
            capacity: DEFAULT_CAPACITY,
            health: None,
            consumer: None,
            tick_priority: DEFAULT_PRIORITY,
            scheduler: None,
        }
    }

    /// Maximum number of queued packets.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn health(mut self, health: Arc<dyn HealthPolicy>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn consumer(mut self, consumer: ContextConsumer) -> Self {
        self.consumer = Some(consumer);
        self
    }

    /// Priority given to packets created from tick instructions.
    pub fn tick_priority(mut self, priority: u8) -> Self {
        self.tick_priority = priority;
        self
    }

    /// Dispatch on `scheduler` instead of a dedicated task.
    pub fn shared(mut self, scheduler: &SharedScheduler) -> Self {
        self.scheduler = Some(scheduler.clone());
        self
    }

    pub fn channel(&self) -> &Arc<ChannelDescription> {
        &self.channel
    }

    pub fn device(&self) -> &Arc<DeviceDescription> {
        &self.device
    }

    pub fn link(&self) -> &Arc<dyn Link> {
        &self.link
    }

    pub fn build(self) -> InstructionPool {
        let name: Arc<str> = format!("{}/{}", self.channel.name, self.device.name).into();
        let (responses_tx, responses_rx) = mpsc::channel(RESPONSE_BUFFER);
        let (mode, wake) = match self.scheduler {
            Some(scheduler) => {
                let wake = scheduler.waker();
                (DispatchMode::Shared(scheduler), wake)
            }
            None => (DispatchMode::Dedicated, Arc::new(Notify::new())),
        };

        let pool = InstructionPool {
            shared: Arc::new(PoolShared {
                name,
                channel: self.channel,
                device: self.device,
                link: self.link,
                health: self.health.unwrap_or_else(|| Arc::new(AlwaysOnline)),
                consumer: self.consumer,
                tick_priority: self.tick_priority,
                queue: Mutex::new(BoundedPriorityQueue::new(self.capacity)),
                ticks: Mutex::new(HashMap::new()),
                packet_ids: SequenceCounter::new(),
                paused: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                wake,
                responses_tx,
                responses: tokio::sync::Mutex::new(responses_rx),
                processed: AtomicU64::new(0),
                mode,
                dispatcher: Mutex::new(None),
            }),
        };

        if let DispatchMode::Shared(scheduler) = &pool.shared.mode {
            scheduler.register(&pool);
        }
        pool
    }
}

/// Priority work queue plus dispatcher for one device.
///
/// Cheap to clone; all clones refer to the same pool.
#[derive(Clone)]
pub struct InstructionPool {
    shared: Arc<PoolShared>,
}

/// Non-owning reference held by the shared scheduler.
#[derive(Clone)]
pub(crate) struct PoolRef(Weak<PoolShared>);

impl PoolRef {
    pub(crate) fn upgrade(&self) -> Option<InstructionPool> {
        self.0.upgrade().map(|shared| InstructionPool { shared })
    }

    pub(crate) fn refers_to(&self, pool: &InstructionPool) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(&pool.shared))
    }
}

impl InstructionPool {
    /// `"<channel>/<device>"`.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn channel(&self) -> &ChannelDescription {
        &self.shared.channel
    }

    pub fn device(&self) -> &DeviceDescription {
        &self.shared.device
    }

    pub fn link(&self) -> &Arc<dyn Link> {
        &self.shared.link
    }

    pub fn status(&self) -> LinkStatus {
        self.shared.health.status()
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.shared.mode, DispatchMode::Shared(_))
    }

    pub(crate) fn downgrade(&self) -> PoolRef {
        PoolRef(Arc::downgrade(&self.shared))
    }

    // ── Enqueueing ───────────────────────────────────────────────────────────

    /// Wraps `instruction` in a packet and queues it by priority.
    ///
    /// With `auto_delete` the pool keeps sole ownership and no handle is
    /// returned; otherwise the handle lets the caller poll or await the
    /// outcome.  A packet pushed out by overflow completes as failed.
    pub fn add_instruction(
        &self,
        instruction: InstructionDescription,
        auto_delete: bool,
        priority: u8,
    ) -> Option<PacketHandle> {
        let handle = self.enqueue(instruction, priority);
        if auto_delete {
            None
        } else {
            Some(handle)
        }
    }

    /// Registers `instruction` to be enqueued every `period`.
    ///
    /// The first run is due immediately.  Re-adding an existing name updates
    /// its instruction and period.
    pub fn add_tick_instruction(&self, instruction: InstructionDescription, period: Duration) {
        let name = instruction.name.clone();
        {
            let mut ticks = self.lock_ticks();
            match ticks.get_mut(&name) {
                Some(entry) => {
                    entry.instruction = instruction;
                    entry.period = period;
                }
                None => {
                    ticks.insert(
                        name.clone(),
                        TickEntry {
                            instruction,
                            period,
                            last_fired: None,
                            pending: None,
                        },
                    );
                }
            }
        }
        debug!("pool {}: tick '{name}' every {period:?}", self.name());
        self.wake();
    }

    /// Stops scheduling the named tick.  Returns `false` if it was unknown.
    pub fn remove_tick_instruction(&self, name: &str) -> bool {
        self.lock_ticks().remove(name).is_some()
    }

    pub fn tick_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_ticks().keys().cloned().collect();
        names.sort();
        names
    }

    /// Enqueues at the highest priority and waits for the outcome.
    ///
    /// Waits at most the instruction's timeout (or the device/channel
    /// default).  Never fails: every problem comes back as a context with
    /// `success == false`.  While the device is offline the call fails
    /// immediately.
    pub async fn execute_instruction_sync(
        &self,
        instruction: InstructionDescription,
    ) -> InstructionContext {
        let device = self.shared.device.name.clone();
        let name = instruction.name.clone();

        if !self.shared.health.admit() {
            debug!("pool {}: '{name}' refused, device offline", self.name());
            return InstructionContext::failure(device, name, InstructionError::Offline.to_string());
        }

        let timeout = self.timeout_for(&instruction);
        let handle = self.enqueue(instruction, HIGHEST_PRIORITY);

        match tokio::time::timeout(timeout, handle.wait()).await {
            Ok(context) => context,
            Err(_) => {
                let error = InstructionError::Timeout(timeout);
                let queued = self
                    .lock_queue()
                    .remove_first(|packet| packet.id() == handle.id());
                // A packet still in flight is reported by the dispatcher when
                // its own deadline passes.
                if let Some(packet) = queued {
                    self.finish(packet, Err(error.clone()));
                }
                handle
                    .context()
                    .unwrap_or_else(|| InstructionContext::failure(device, name, error.to_string()))
            }
        }
    }

    fn enqueue(&self, instruction: InstructionDescription, priority: u8) -> PacketHandle {
        let id = self.shared.packet_ids.next();
        let (packet, handle) = Packet::new(id, &self.shared.device.name, instruction, priority);

        if self.is_closed() {
            self.finish(packet, Err(InstructionError::Shutdown));
            return handle;
        }

        let outcome = self.lock_queue().push(packet);
        self.settle(outcome);
        self.wake();
        handle
    }

    fn settle(&self, outcome: Enqueued<Packet>) {
        match outcome {
            Enqueued::Accepted => {}
            Enqueued::Evicted(victim) | Enqueued::Rejected(victim) => {
                warn!(
                    "pool {}: queue full ({} dropped so far), failing '{}' (priority {})",
                    self.name(),
                    self.dropped_count(),
                    victim.instruction().name,
                    devlink_core::Prioritized::priority(&victim)
                );
                self.finish(victim, Err(InstructionError::Evicted));
            }
        }
    }

    // ── Control ──────────────────────────────────────────────────────────────

    /// Stops dispatching after the current exchange.  Queued packets stay.
    pub fn pause(&self) {
        if !self.shared.paused.swap(true, Ordering::SeqCst) {
            info!("pool {}: paused", self.name());
        }
    }

    pub fn resume(&self) {
        if self.shared.paused.swap(false, Ordering::SeqCst) {
            info!("pool {}: resumed", self.name());
            self.wake();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Spawns the dedicated dispatcher task.  No-op for shared pools and for
    /// pools that are already running or shut down.
    pub fn start(&self) {
        if self.is_shared() || self.is_closed() {
            return;
        }
        let mut dispatcher = self.lock_dispatcher();
        if dispatcher.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.shared);
        *dispatcher = Some(tokio::spawn(run_dedicated(weak)));
        debug!("pool {}: dispatcher started", self.name());
    }

    /// Stops dispatching and fails every queued packet.
    ///
    /// A packet caught mid-exchange in a dedicated dispatcher is failed when
    /// the task is cancelled.  Every failed packet reaches the consumer and
    /// counts as processed.  Idempotent.
    pub async fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let task = self.lock_dispatcher().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        let drained = self.lock_queue().drain();
        let count = drained.len();
        for packet in drained {
            self.finish(packet, Err(InstructionError::Shutdown));
        }
        self.lock_ticks().clear();

        if let DispatchMode::Shared(scheduler) = &self.shared.mode {
            scheduler.unregister(self);
        }
        info!("pool {}: shut down ({count} queued packet(s) failed)", self.name());
    }

    // ── Responses ────────────────────────────────────────────────────────────

    /// Handle for transports to push inbound frames through.
    pub fn response_sink(&self) -> ResponseSink {
        ResponseSink {
            tx: self.shared.responses_tx.clone(),
            pool: Arc::clone(&self.shared.name),
            device: Arc::clone(&self.shared.device),
            health: Arc::clone(&self.shared.health),
        }
    }

    /// Offers one inbound frame to the outstanding exchange.
    pub fn on_response(&self, frame: Vec<u8>) -> bool {
        self.response_sink().deliver(frame)
    }

    // ── Metrics ──────────────────────────────────────────────────────────────

    pub fn pending_count(&self) -> usize {
        self.lock_queue().len()
    }

    /// Packets evicted or refused because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.lock_queue().dropped_count()
    }

    /// Packets that have completed, successfully or not.
    pub fn processed_count(&self) -> u64 {
        self.shared.processed.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.lock_queue().capacity()
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// Next packet to dispatch, after enqueueing any due ticks.
    pub(crate) fn next_packet(&self) -> Option<Packet> {
        if self.is_closed() || self.is_paused() {
            return None;
        }
        self.enqueue_due_ticks();
        self.lock_queue().pop()
    }

    /// How long the dispatcher may sleep before a tick falls due.
    pub(crate) fn idle_delay(&self) -> Duration {
        let now = Instant::now();
        self.lock_ticks()
            .values()
            .filter(|entry| !entry.is_pending())
            .map(|entry| entry.due_in(now))
            .min()
            .unwrap_or(IDLE_WAIT)
            .min(IDLE_WAIT)
    }

    fn enqueue_due_ticks(&self) {
        let now = Instant::now();
        let mut due = Vec::new();
        {
            let mut ticks = self.lock_ticks();
            for entry in ticks.values_mut() {
                if entry.is_pending() || entry.due_in(now) > Duration::ZERO {
                    continue;
                }
                let id = self.shared.packet_ids.next();
                let (packet, handle) = Packet::new(
                    id,
                    &self.shared.device.name,
                    entry.instruction.clone(),
                    self.shared.tick_priority,
                );
                entry.last_fired = Some(now);
                entry.pending = Some(handle);
                due.push(packet);
            }
        }
        for packet in due {
            let outcome = self.lock_queue().push(packet);
            self.settle(outcome);
        }
    }

    /// Runs one packet through the send/await-response exchange.
    pub(crate) async fn dispatch(&self, packet: Packet) {
        let instruction = packet.instruction().clone();
        let timeout = self.timeout_for(&instruction);
        debug!(
            "pool {}: dispatching '{}' (packet {}, waited {:?})",
            self.name(),
            instruction.name,
            packet.id(),
            packet.age()
        );
        let in_flight = InFlight {
            pool: self,
            packet: Some(packet),
        };
        let result = self.exchange(&instruction, timeout).await;
        in_flight.settle(result);
    }

    async fn exchange(
        &self,
        instruction: &InstructionDescription,
        timeout: Duration,
    ) -> Result<Map<String, Value>, InstructionError> {
        let device = &self.shared.device;
        let request = instruction.codec.encode(device)?;
        let deadline = Instant::now() + timeout;

        let mut responses = self.shared.responses.lock().await;
        while responses.try_recv().is_ok() {}

        match tokio::time::timeout_at(deadline, self.shared.link.send(&request)).await {
            Err(_) => return Err(InstructionError::Timeout(timeout)),
            Ok(Err(e)) => return Err(InstructionError::Send(e.to_string())),
            Ok(Ok(())) => {}
        }
        if !instruction.expects_response {
            return Ok(Map::new());
        }

        loop {
            match tokio::time::timeout_at(deadline, responses.recv()).await {
                Err(_) => return Err(InstructionError::Timeout(timeout)),
                Ok(None) => return Err(InstructionError::Send("response channel closed".into())),
                Ok(Some(frame)) => match instruction.codec.decode(device, &frame)? {
                    Decoded::Complete(values) => return Ok(values),
                    Decoded::Partial => {
                        debug!(
                            "pool {}: {} byte frame does not answer '{}'",
                            self.name(),
                            frame.len(),
                            instruction.name
                        );
                    }
                },
            }
        }
    }

    fn finish(&self, packet: Packet, result: Result<Map<String, Value>, InstructionError>) {
        let device = &self.shared.device;
        let context = match result {
            Ok(values) => {
                self.shared.health.success_handle(device);
                InstructionContext::success(&device.name, &packet.instruction().name, values)
            }
            Err(error) => {
                debug!(
                    "pool {}: '{}' failed: {error}",
                    self.name(),
                    packet.instruction().name
                );
                self.shared
                    .health
                    .error_handle(device, packet.instruction(), &error);
                InstructionContext::failure(&device.name, &packet.instruction().name, error.to_string())
            }
        };
        self.shared.processed.fetch_add(1, Ordering::Relaxed);
        if let Some(consumer) = &self.shared.consumer {
            consumer(&context);
        }
        packet.complete(context);
    }

    fn timeout_for(&self, instruction: &InstructionDescription) -> Duration {
        instruction
            .timeout
            .unwrap_or_else(|| self.shared.device.effective_timeout(&self.shared.channel))
    }

    fn wake(&self) {
        self.shared.wake.notify_one();
    }

    fn lock_queue(&self) -> MutexGuard<'_, BoundedPriorityQueue<Packet>> {
        self.shared.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_ticks(&self) -> MutexGuard<'_, HashMap<String, TickEntry>> {
        self.shared.ticks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_dispatcher(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.shared.dispatcher.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for InstructionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstructionPool")
            .field("name", &self.shared.name)
            .field("shared", &self.is_shared())
            .field("paused", &self.is_paused())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A packet between dequeue and completion.  Cancelling the exchange drops
/// it, which fails the packet through [`InstructionPool::finish`].
struct InFlight<'a> {
    pool: &'a InstructionPool,
    packet: Option<Packet>,
}

impl InFlight<'_> {
    fn settle(mut self, result: Result<Map<String, Value>, InstructionError>) {
        if let Some(packet) = self.packet.take() {
            self.pool.finish(packet, result);
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(packet) = self.packet.take() {
            self.pool.finish(packet, Err(InstructionError::Shutdown));
        }
    }
}

/// Dedicated dispatcher loop.  Holds only a weak reference while idle so a
/// dropped pool ends its task.
async fn run_dedicated(weak: Weak<PoolShared>) {
    loop {
        let Some(shared) = weak.upgrade() else {
            break;
        };
        let pool = InstructionPool { shared };
        if pool.is_closed() {
            break;
        }
        if let Some(packet) = pool.next_packet() {
            pool.dispatch(packet).await;
            continue;
        }

        let wake = Arc::clone(&pool.shared.wake);
        let delay = pool.idle_delay();
        drop(pool);
        tokio::select! {
            _ = wake.notified() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::link::MockLink;
    use devlink_core::{ChannelProtocol, Endpoint, FixedBytesCodec};
    use std::sync::atomic::AtomicUsize;

    fn recording_link(log: Arc<Mutex<Vec<Vec<u8>>>>) -> MockLink {
        let mut link = MockLink::new();
        link.expect_send().returning(move |bytes| {
            log.lock().unwrap().push(bytes.to_vec());
            Ok(())
        });
        link.expect_is_connected().return_const(true);
        link.expect_endpoint()
            .returning(|| Endpoint::new("127.0.0.1", 5020));
        link
    }

    fn builder(link: MockLink) -> PoolBuilder {
        let channel = Arc::new(
            ChannelDescription::new("bench", ChannelProtocol::Tcp)
                .with_timeout(Duration::from_millis(100)),
        );
        let device = Arc::new(DeviceDescription::new("meter-1"));
        PoolBuilder::new(channel, device, Arc::new(link))
    }

    fn fire(name: &str, payload: &[u8]) -> InstructionDescription {
        InstructionDescription::fixed(name, payload.to_vec()).without_response()
    }

    #[tokio::test]
    async fn test_pool_dispatches_by_priority_then_fifo() {
        // Arrange: queue everything before the dispatcher starts.
        let log = Arc::new(Mutex::new(Vec::new()));
        let pool = builder(recording_link(Arc::clone(&log))).build();
        let handles = vec![
            pool.add_instruction(fire("p5", b"5"), false, 5).unwrap(),
            pool.add_instruction(fire("p1a", b"1a"), false, 1).unwrap(),
            pool.add_instruction(fire("p3", b"3"), false, 3).unwrap(),
            pool.add_instruction(fire("p1b", b"1b"), false, 1).unwrap(),
        ];

        // Act
        pool.start();
        for handle in &handles {
            assert!(handle.wait().await.success);
        }

        // Assert
        let sent = log.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![b"1a".to_vec(), b"1b".to_vec(), b"3".to_vec(), b"5".to_vec()]
        );
        assert_eq!(pool.processed_count(), 4);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_auto_delete_returns_no_handle() {
        let pool = builder(recording_link(Arc::default())).build();
        assert!(pool
            .add_instruction(fire("x", b"x"), true, DEFAULT_PRIORITY)
            .is_none());
        assert_eq!(pool.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_overflow_fails_evicted_packet() {
        let pool = builder(recording_link(Arc::default())).capacity(2).build();
        let oldest = pool.add_instruction(fire("a", b"a"), false, 9).unwrap();
        pool.add_instruction(fire("b", b"b"), false, 9);
        pool.add_instruction(fire("c", b"c"), false, 1);

        let context = oldest.context().expect("evicted packet completes");
        assert!(!context.success);
        assert_eq!(pool.dropped_count(), 1);
        assert_eq!(pool.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_sync_call_times_out_with_failed_context() {
        // Arrange: the link swallows the request and nothing answers.
        let pool = builder(recording_link(Arc::default())).build();
        pool.start();
        let started = Instant::now();

        // Act
        let context = pool
            .execute_instruction_sync(
                InstructionDescription::fixed("read", b"R".to_vec())
                    .with_timeout(Duration::from_millis(80)),
            )
            .await;

        // Assert
        let elapsed = started.elapsed();
        assert!(!context.success);
        assert!(elapsed >= Duration::from_millis(80), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "returned after {elapsed:?}");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_call_completes_with_decoded_response() {
        let pool = builder(recording_link(Arc::default())).build();
        pool.start();
        let sink = pool.response_sink();

        let responder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sink.deliver(b"noise".to_vec());
            sink.deliver(b"OK:42".to_vec());
        });
        let codec = FixedBytesCodec::new(b"R".to_vec()).expecting_prefix(b"OK".to_vec());
        let context = pool
            .execute_instruction_sync(InstructionDescription::new("read", Arc::new(codec)))
            .await;

        responder.await.unwrap();
        assert!(context.success, "{:?}", context.message);
        assert_eq!(
            context.value("response").unwrap().as_array().unwrap().len(),
            5
        );
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_paused_pool_holds_packets_until_resumed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pool = builder(recording_link(Arc::clone(&log))).build();
        pool.pause();
        pool.start();
        let handle = pool.add_instruction(fire("x", b"x"), false, 1).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_processed());
        assert!(log.lock().unwrap().is_empty());

        pool.resume();
        assert!(handle.wait().await.success);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_tick_instruction_fires_repeatedly_until_removed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pool = builder(recording_link(Arc::clone(&log))).build();
        pool.add_tick_instruction(fire("poll", b"P"), Duration::from_millis(20));
        pool.start();

        tokio::time::sleep(Duration::from_millis(110)).await;
        assert!(pool.remove_tick_instruction("poll"));
        let fired = log.lock().unwrap().len();
        assert!(fired >= 3, "tick fired {fired} times");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(log.lock().unwrap().len() <= fired + 1);
        assert!(!pool.remove_tick_instruction("poll"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_fails_queued_packets() {
        let pool = builder(recording_link(Arc::default())).build();
        let handle = pool.add_instruction(fire("x", b"x"), false, 1).unwrap();

        pool.shutdown().await;

        let context = handle.wait().await;
        assert!(!context.success);
        assert_eq!(pool.pending_count(), 0);
        // Packets added after shutdown fail straight away.
        let late = pool.add_instruction(fire("y", b"y"), false, 1).unwrap();
        assert!(late.is_processed());
    }

    fn counting_consumer(seen: &Arc<AtomicUsize>) -> ContextConsumer {
        let counter = Arc::clone(seen);
        Arc::new(move |ctx: &InstructionContext| {
            assert!(!ctx.success);
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_shutdown_reports_drained_packets_to_consumer() {
        // Arrange: two auto-delete packets that never get dispatched.
        let seen = Arc::new(AtomicUsize::new(0));
        let pool = builder(recording_link(Arc::default()))
            .consumer(counting_consumer(&seen))
            .build();
        pool.add_instruction(fire("a", b"a"), true, 1);
        pool.add_instruction(fire("b", b"b"), true, 1);

        // Act
        pool.shutdown().await;

        // Assert
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(pool.processed_count(), 2);

        // A packet offered to the closed pool is reported the same way.
        pool.add_instruction(fire("c", b"c"), true, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(pool.processed_count(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_mid_exchange_reports_packet_to_consumer() {
        // Arrange: the request goes out, but no answer ever comes.
        let log = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::new(AtomicUsize::new(0));
        let pool = builder(recording_link(Arc::clone(&log)))
            .consumer(counting_consumer(&seen))
            .build();
        pool.start();
        let handle = pool
            .add_instruction(
                InstructionDescription::fixed("read", b"R".to_vec()).with_timeout(Duration::from_secs(5)),
                false,
                1,
            )
            .unwrap();
        for _ in 0..100 {
            if !log.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(log.lock().unwrap().len(), 1);

        // Act
        pool.shutdown().await;

        // Assert
        assert!(!handle.wait().await.success);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(pool.processed_count(), 1);
    }

    #[tokio::test]
    async fn test_consumer_sees_every_context() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let pool = builder(recording_link(Arc::default()))
            .consumer(Arc::new(move |_ctx: &InstructionContext| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .build();
        pool.start();

        let a = pool.add_instruction(fire("a", b"a"), false, 1).unwrap();
        let b = pool.add_instruction(fire("b", b"b"), false, 1).unwrap();
        a.wait().await;
        b.wait().await;

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        pool.shutdown().await;
    }
}
