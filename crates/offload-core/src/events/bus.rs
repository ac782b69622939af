//! In-process publish/subscribe bus with request/response correlation.
//!
//! A single emit dispatches to every matching handler sequentially, in
//! subscription order, awaiting each; a failing handler never prevents the
//! ones after it from running. Requests register a one-shot channel keyed
//! by correlation id; the responder delivers through [`EventBus::respond`]
//! and a timer evicts the entry if no response arrives in time.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::warn;
use uuid::Uuid;

use crate::error::{ErrorCode, KernelError, KernelResult};

use super::types::{Event, EventKind, QueryResponse};

/// Boxed async event handler.
pub type EventHandlerFn =
    Arc<dyn Fn(Event) -> BoxFuture<'static, KernelResult<()>> + Send + Sync>;

/// Identifier returned by subscribe calls, used to unsubscribe.
pub type SubscriptionId = u64;

/// Wrap an async closure into an [`EventHandlerFn`].
pub fn handler<F, Fut>(f: F) -> EventHandlerFn
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = KernelResult<()>> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}

struct Entry {
    id: SubscriptionId,
    handler: EventHandlerFn,
}

#[derive(Default)]
struct Registry {
    by_kind: HashMap<EventKind, Vec<Entry>>,
    global: Vec<Entry>,
    total: usize,
}

type PendingMap = HashMap<Uuid, oneshot::Sender<KernelResult<QueryResponse>>>;

/// The kernel's event bus.
pub struct EventBus {
    registry: Mutex<Registry>,
    pending: Mutex<PendingMap>,
    next_id: AtomicU64,
    disposed: AtomicBool,
    max_listeners_per_event: usize,
    max_total_subscriptions: usize,
    request_timeout: Duration,
}

impl EventBus {
    pub fn new(
        max_listeners_per_event: usize,
        max_total_subscriptions: usize,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry::default()),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
            max_listeners_per_event,
            max_total_subscriptions,
            request_timeout,
        })
    }

    /// Subscribe to one event kind. Handlers run in subscription order.
    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: EventHandlerFn,
    ) -> KernelResult<SubscriptionId> {
        self.check_disposed()?;
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());

        if registry.total >= self.max_total_subscriptions {
            return Err(self.limit_error("total subscription limit reached"));
        }
        let entries = registry.by_kind.entry(kind).or_default();
        if entries.len() >= self.max_listeners_per_event {
            return Err(self.limit_error(format!(
                "listener limit reached for {kind:?}"
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.push(Entry { id, handler });
        registry.total += 1;
        Ok(id)
    }

    /// Subscribe to every event. Global and kind-specific handlers share
    /// one ordering: an emit dispatches strictly by subscription id.
    pub fn subscribe_all(&self, handler: EventHandlerFn) -> KernelResult<SubscriptionId> {
        self.check_disposed()?;
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());

        if registry.total >= self.max_total_subscriptions {
            return Err(self.limit_error("total subscription limit reached"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        registry.global.push(Entry { id, handler });
        registry.total += 1;
        Ok(id)
    }

    /// Remove a subscription. Returns whether anything was removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());

        for entries in registry.by_kind.values_mut() {
            if let Some(pos) = entries.iter().position(|e| e.id == id) {
                entries.remove(pos);
                registry.total -= 1;
                return true;
            }
        }
        if let Some(pos) = registry.global.iter().position(|e| e.id == id) {
            registry.global.remove(pos);
            registry.total -= 1;
            return true;
        }
        false
    }

    /// Active subscription count across all kinds plus global.
    pub fn subscription_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .total
    }

    /// Publish an event to every matching handler.
    ///
    /// Handlers run one after another on the emitter's task; an erroring
    /// handler is logged and the rest still run. Returns the aggregate of
    /// all handler failures, or `Ok` if none failed. Nothing is rolled
    /// back.
    pub async fn emit(&self, event: Event) -> KernelResult<()> {
        self.check_disposed()?;

        let handlers: Vec<(SubscriptionId, EventHandlerFn)> = {
            let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            let mut out = Vec::new();
            if let Some(entries) = registry.by_kind.get(&event.kind()) {
                out.extend(entries.iter().map(|e| (e.id, Arc::clone(&e.handler))));
            }
            out.extend(
                registry
                    .global
                    .iter()
                    .map(|e| (e.id, Arc::clone(&e.handler))),
            );
            // One total order across kind-specific and global subscribers,
            // so an early global observer sees an event before any handler
            // that might emit follow-ups while handling it.
            out.sort_by_key(|(id, _)| *id);
            out
        };

        let mut failures = Vec::new();
        for (id, handler) in handlers {
            if let Err(err) = handler(event.clone()).await {
                warn!(
                    subscription = id,
                    kind = ?event.kind(),
                    error = %err,
                    "event handler failed"
                );
                failures.push(err);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(KernelError::aggregate(failures))
        }
    }

    /// Emit a query event and await its correlated response.
    ///
    /// The response subscriber is evicted on timeout; a late respond()
    /// then finds nothing and the answer is dropped.
    pub async fn request(&self, event: Event) -> KernelResult<QueryResponse> {
        self.check_disposed()?;

        let correlation_id = event.correlation_id().ok_or_else(|| {
            KernelError::system("request() called with an event that has no correlation id")
        })?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.insert(correlation_id, tx);
        }

        if let Err(err) = self.emit(event).await {
            // If no handler managed to respond, surface the emit failure.
            let had_pending = self
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&correlation_id)
                .is_some();
            if had_pending {
                return Err(err);
            }
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_closed)) => Err(KernelError::shutdown()),
            Err(_elapsed) => {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&correlation_id);
                Err(KernelError::new(
                    ErrorCode::RequestTimeout,
                    format!(
                        "no response within {} ms",
                        self.request_timeout.as_millis()
                    ),
                ))
            }
        }
    }

    /// Deliver a response for an outstanding request. Returns false when
    /// the request already timed out (the answer is discarded).
    pub fn respond(&self, correlation_id: Uuid, result: KernelResult<QueryResponse>) -> bool {
        let sender = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&correlation_id);
        match sender {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Tear down the bus: unregister everything and reject pending
    /// requests with `SHUTDOWN`.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);

        {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.by_kind.clear();
            registry.global.clear();
            registry.total = 0;
        }

        let pending: Vec<_> = {
            let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            map.drain().collect()
        };
        for (_, tx) in pending {
            let _ = tx.send(Err(KernelError::shutdown()));
        }
    }

    fn check_disposed(&self) -> KernelResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(KernelError::shutdown())
        } else {
            Ok(())
        }
    }

    fn limit_error(&self, message: impl Into<String>) -> KernelError {
        KernelError::new(ErrorCode::SubscriptionLimitExceeded, message)
    }
}
