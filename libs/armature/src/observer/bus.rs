//! Observer bus: asynchronous fan-out of [`CloudEvent`]s.
//!
//! Each observer gets a dedicated worker task fed by an unbounded channel:
//! delivery is serial *per observer* in submission order, unordered across
//! observers. `notify` snapshots the observer list under the lock and
//! submits without it, so an observer may unregister itself (or others) from
//! inside its handler without deadlock. A panicking or failing observer is
//! logged and never disturbs the rest of the fan-out.
//!
//! Workers are spawned at registration time, so `register` must run inside a
//! Tokio runtime.

use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::event::CloudEvent;

/// A subscriber on the bus.
#[async_trait::async_trait]
pub trait Observer: Send + Sync + 'static {
    /// Stable observer name, used for logging and descriptors.
    fn name(&self) -> &str;

    async fn on_event(&self, event: CloudEvent) -> anyhow::Result<()>;
}

/// Snapshot of one registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObserverDescriptor {
    pub name: String,
    /// `None` means subscribed to all event types.
    pub event_types: Option<Vec<String>>,
}

struct Registration {
    observer: Arc<dyn Observer>,
    event_types: Option<Vec<String>>,
    tx: mpsc::UnboundedSender<CloudEvent>,
}

impl Registration {
    fn matches(&self, ty: &str) -> bool {
        match &self.event_types {
            None => true,
            Some(types) => types.iter().any(|t| t == ty),
        }
    }
}

#[derive(Default)]
pub struct ObserverBus {
    observers: Mutex<Vec<Registration>>,
}

impl ObserverBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe an observer. An empty `event_types` list subscribes to all
    /// events. Membership does not carry lifecycle responsibility: dropping
    /// the bus merely stops delivery.
    pub fn register(&self, observer: Arc<dyn Observer>, event_types: &[&str]) {
        let (tx, mut rx) = mpsc::unbounded_channel::<CloudEvent>();
        let worker_observer = observer.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let name = worker_observer.name().to_owned();
                let ty = event.ty.clone();
                let call = std::panic::AssertUnwindSafe(worker_observer.on_event(event));
                match call.catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        tracing::warn!(observer = %name, event = %ty, error = %error, "observer failed");
                    }
                    Err(panic) => {
                        tracing::error!(
                            observer = %name,
                            event = %ty,
                            panic = %panic_message(&panic),
                            "observer panicked"
                        );
                    }
                }
            }
        });

        let event_types = if event_types.is_empty() {
            None
        } else {
            Some(event_types.iter().map(|s| (*s).to_owned()).collect())
        };
        self.observers.lock().push(Registration {
            observer,
            event_types,
            tx,
        });
    }

    /// Remove an observer by identity. Safe to call from inside a handler.
    pub fn unregister(&self, observer: &Arc<dyn Observer>) {
        self.observers
            .lock()
            .retain(|r| !Arc::ptr_eq(&r.observer, observer));
        // The worker drains its queue and exits once the sender is dropped.
    }

    /// Fan an event out. Returns once the event is submitted to every
    /// matching observer's queue, not once handlers complete.
    pub fn notify(&self, _cancel: &CancellationToken, event: &CloudEvent) {
        let targets: Vec<mpsc::UnboundedSender<CloudEvent>> = {
            let observers = self.observers.lock();
            observers
                .iter()
                .filter(|r| r.matches(&event.ty))
                .map(|r| r.tx.clone())
                .collect()
        };
        for tx in targets {
            // A closed channel means the observer is being torn down; that is
            // not an error for the emitter.
            let _ = tx.send(event.clone());
        }
    }

    pub fn descriptors(&self) -> Vec<ObserverDescriptor> {
        self.observers
            .lock()
            .iter()
            .map(|r| ObserverDescriptor {
                name: r.observer.name().to_owned(),
                event_types: r.event_types.clone(),
            })
            .collect()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
