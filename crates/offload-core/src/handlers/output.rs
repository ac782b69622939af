//! Output handler: feeds captured chunks into the per-task buffers.
//!
//! The pumps only announce chunks; this handler owns the write into the
//! capture component. An over-budget chunk is dropped with a warning and
//! the task keeps running — killing on overflow is not this handler's
//! call.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{ErrorCode, KernelResult};
use crate::events::{Event, EventBus, EventKind, handler};
use crate::output::OutputCapture;

use super::{Handler, SubscriptionSet};

pub struct OutputHandler {
    capture: Arc<OutputCapture>,
    subscriptions: SubscriptionSet,
}

impl OutputHandler {
    pub fn new(capture: Arc<OutputCapture>) -> Arc<Self> {
        Arc::new(Self {
            capture,
            subscriptions: SubscriptionSet::new(),
        })
    }

    async fn handle(&self, event: Event) -> KernelResult<()> {
        let Event::OutputCaptured {
            task_id,
            stream,
            chunk,
        } = event
        else {
            debug!("output handler ignoring event");
            return Ok(());
        };

        match self.capture.append(task_id, stream, chunk) {
            Ok(()) => Ok(()),
            Err(err) if err.code == ErrorCode::OutputBufferLimitExceeded => {
                warn!(task_id = %task_id, ?stream, "output buffer full, discarding chunk");
                Ok(())
            }
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "output capture failed");
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Handler for OutputHandler {
    fn name(&self) -> &'static str {
        "output"
    }

    async fn start(self: Arc<Self>, bus: Arc<EventBus>) -> KernelResult<()> {
        let this = Arc::clone(&self);
        let id = bus.subscribe(
            EventKind::OutputCaptured,
            handler(move |event| {
                let this = Arc::clone(&this);
                async move { this.handle(event).await }
            }),
        )?;
        self.subscriptions.record(id);
        Ok(())
    }

    async fn stop(&self, bus: &EventBus) -> KernelResult<()> {
        self.subscriptions.clear(bus);
        Ok(())
    }
}
