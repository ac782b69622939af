//! Event handlers: the stateless glue between bus events and the kernel's
//! components.
//!
//! Each handler has an explicit start/stop pair instead of subscribing from
//! its constructor, and the registry composes start order — stop runs in
//! reverse so no subscriber outlives what it depends on.

pub mod checkpoint;
pub mod dependency;
pub mod output;
pub mod persistence;
pub mod query;
pub mod queue;
pub mod schedule;
pub mod worker;
pub mod worktree;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{error, info};

use crate::error::KernelResult;
use crate::events::{EventBus, SubscriptionId};

/// A bus-attached handler with explicit lifecycle.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Register this handler's subscriptions.
    async fn start(self: Arc<Self>, bus: Arc<EventBus>) -> KernelResult<()>;

    /// Remove this handler's subscriptions.
    async fn stop(&self, bus: &EventBus) -> KernelResult<()>;
}

/// Bookkeeping for the subscription ids a handler holds while started.
#[derive(Default)]
pub struct SubscriptionSet {
    ids: Mutex<Vec<SubscriptionId>>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, id: SubscriptionId) {
        self.ids.lock().unwrap_or_else(|e| e.into_inner()).push(id);
    }

    /// Unsubscribe everything recorded so far.
    pub fn clear(&self, bus: &EventBus) {
        let ids: Vec<_> = self
            .ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for id in ids {
            bus.unsubscribe(id);
        }
    }
}

/// Starts handlers in registration order and stops them in reverse.
pub struct HandlerRegistry {
    bus: Arc<EventBus>,
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            handlers: Vec::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.push(handler);
    }

    /// Start every handler in registration order. On failure, handlers
    /// started so far are stopped again (in reverse) before the error is
    /// returned.
    pub async fn start_all(&self) -> KernelResult<()> {
        let mut started = Vec::new();
        for handler in &self.handlers {
            match Arc::clone(handler).start(Arc::clone(&self.bus)).await {
                Ok(()) => {
                    info!(handler = handler.name(), "handler started");
                    started.push(Arc::clone(handler));
                }
                Err(err) => {
                    error!(handler = handler.name(), error = %err, "handler failed to start");
                    for h in started.iter().rev() {
                        let _ = h.stop(&self.bus).await;
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Stop every handler in reverse registration order. Errors are logged
    /// and do not prevent the remaining handlers from stopping.
    pub async fn stop_all(&self) {
        for handler in self.handlers.iter().rev() {
            if let Err(err) = handler.stop(&self.bus).await {
                error!(handler = handler.name(), error = %err, "handler failed to stop");
            } else {
                info!(handler = handler.name(), "handler stopped");
            }
        }
    }
}
