//! Event subscription layer
//!
//! - [`InstanceEventManager`]: one remote subscription per [`EventKey`]
//! - [`BulkMonitor`]: one class-wide modification subscription, dispatched
//!   by identity

pub mod bulk;
pub mod manager;

pub use bulk::{BulkMonitor, BulkSubscription};
pub use manager::{EventHandler, EventKey, InstanceEventManager, Subscription};

/// Either kind of registration handle
pub enum EventRegistration {
    Instance(Subscription),
    Bulk(BulkSubscription),
}

impl EventRegistration {
    pub async fn release(&self) {
        match self {
            EventRegistration::Instance(sub) => sub.release().await,
            EventRegistration::Bulk(sub) => sub.release().await,
        }
    }
}
