//! Change notifications for tenant stats stores.
//!
//! The ingestion pipeline announces completed writes through an
//! [`EventBus`]; delivery and fan-out belong to the bus implementation.

pub mod bus;
pub mod in_memory_bus;
pub mod notification;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use notification::{Notification, StatsEvent};
