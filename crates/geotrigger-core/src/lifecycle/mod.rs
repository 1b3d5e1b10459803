pub mod schema;
pub mod store;

pub use store::{CompleteReceipt, LifecycleStore, OutboxEntry, PendingEvent};
