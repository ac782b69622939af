//! Event bus and event vocabulary.

mod bus;
mod types;

pub use bus::{EventBus, EventHandlerFn, SubscriptionId, handler};
pub use types::{Event, EventKind, QueryResponse};
