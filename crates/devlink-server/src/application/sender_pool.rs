//! Pools wired with a connection-health monitor.
//!
//! A [`SenderPool`] is an [`InstructionPool`] whose health policy is a
//! [`HealthMonitor`].  Two flavours exist:
//!
//! - [`SenderPool::single`] – dispatches on a [`SharedScheduler`] together
//!   with the other devices on the same physical link, and re-establishes
//!   the link when the device goes offline.
//! - [`SenderPool::multi`] – one dedicated dispatcher per device, for
//!   independently linked devices.  The link owner is responsible for
//!   reconnecting; while the device is offline the pool admits one trial
//!   exchange per step of the channel's back-off policy.

use std::ops::Deref;
use std::sync::Arc;

use crate::application::health::{HealthMonitor, HealthPolicy, LinkStatus, StatusChange};
use crate::application::instruction_pool::{InstructionPool, PoolBuilder};
use crate::application::scheduler::SharedScheduler;

#[derive(Clone)]
pub struct SenderPool {
    pool: InstructionPool,
    health: HealthMonitor,
}

impl SenderPool {
    /// Shared-scheduler flavour.  Starts `scheduler` if it is not running.
    pub fn single(builder: PoolBuilder, scheduler: &SharedScheduler) -> Self {
        let health = HealthMonitor::with_reconnect(
            builder.device().detection_threshold,
            Arc::clone(builder.link()),
            builder.channel().reconnect.clone(),
        );
        let pool = builder
            .health(Arc::new(health.clone()))
            .shared(scheduler)
            .build();
        scheduler.start();
        Self { pool, health }
    }

    /// Dedicated-dispatcher flavour.  The dispatcher is started immediately.
    pub fn multi(builder: PoolBuilder) -> Self {
        let health = HealthMonitor::with_backoff(
            builder.device().detection_threshold,
            builder.channel().reconnect.clone(),
        );
        let pool = builder.health(Arc::new(health.clone())).build();
        pool.start();
        Self { pool, health }
    }

    pub fn pool(&self) -> &InstructionPool {
        &self.pool
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn status(&self) -> LinkStatus {
        self.health.status()
    }

    pub fn on_status_changed<F>(&self, listener: F)
    where
        F: Fn(&StatusChange) + Send + Sync + 'static,
    {
        self.health.on_status_changed(listener);
    }
}

impl Deref for SenderPool {
    type Target = InstructionPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl std::fmt::Debug for SenderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderPool")
            .field("pool", &self.pool)
            .field("status", &self.status())
            .finish()
    }
}
