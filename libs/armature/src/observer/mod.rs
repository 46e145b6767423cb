//! CloudEvents-typed asynchronous observer bus.

pub mod bus;
pub mod event;

pub use bus::{Observer, ObserverBus, ObserverDescriptor};
pub use event::{types, CloudEvent};
