//! In-process publish/subscribe for die events.
//!
//! Handlers run synchronously, in registration order, on the task that fires
//! the event. A handler that errors or panics is logged and skipped; the
//! remaining handlers still run.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::error;

use crate::core::die::cache::FieldSet;
use crate::core::protocol::{BatteryLevel, NotifyUser, RollState};
use crate::error::HandlerError;
use crate::utils::lock;

/// Identifies a registered handler so it can be removed later.
pub type HandlerId = u64;

/// An event that can be routed by kind.
pub trait Event {
    type Kind: Copy + Eq + Hash + Debug;

    fn kind(&self) -> Self::Kind;
}

type Handler<C, E> = Arc<dyn Fn(&C, &E) -> anyhow::Result<()> + Send + Sync>;

/// Ordered handler lists keyed by event kind.
pub struct EventHub<C, E: Event> {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<E::Kind, Vec<(HandlerId, Handler<C, E>)>>>,
}

impl<C, E: Event> Default for EventHub<C, E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(HashMap::new()),
        }
    }
}

impl<C, E: Event> EventHub<C, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: E::Kind, handler: F) -> HandlerId
    where
        F: Fn(&C, &E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: Handler<C, E> = Arc::new(handler);
        lock(&self.handlers).entry(kind).or_default().push((id, handler));
        id
    }

    /// Returns false if no handler has this id.
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut handlers = lock(&self.handlers);
        for list in handlers.values_mut() {
            if let Some(pos) = list.iter().position(|(hid, _)| *hid == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn handler_count(&self, kind: E::Kind) -> usize {
        lock(&self.handlers).get(&kind).map_or(0, Vec::len)
    }

    /// Calls every handler registered for the event's kind.
    ///
    /// The handler list is snapshotted first, so handlers may subscribe or
    /// unsubscribe while running.
    pub fn fire(&self, context: &C, event: &E) -> Vec<HandlerError> {
        let kind = event.kind();
        let snapshot: Vec<(HandlerId, Handler<C, E>)> = lock(&self.handlers)
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        let mut failures = Vec::new();
        for (id, handler) in snapshot {
            let message = match catch_unwind(AssertUnwindSafe(|| handler(context, event))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(panic) => panic_message(panic.as_ref()),
            };
            let failure = HandlerError {
                event: format!("{:?}", kind),
                handler: id,
                message,
            };
            error!("{}", failure);
            failures.push(failure);
        }
        failures
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

/// Kinds of events a die publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DataChanged,
    RollState,
    Rolled,
    BatteryLevel,
    NotifyUser,
    DebugLog,
    Connected,
    Disconnected,
    ReconnectFailed,
}

/// Events a die publishes to application handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DieEvent {
    /// Cached fields were updated; fired once per applied message
    DataChanged(FieldSet),
    RollState(RollState),
    /// The die came to rest after rolling or being handled
    Rolled { face: u8 },
    BatteryLevel(BatteryLevel),
    /// The die has a question for the user; answer with `respond_to_notify_user`
    NotifyUser(NotifyUser),
    DebugLog(String),
    Connected,
    /// The link dropped without being asked to
    Disconnected,
    /// Auto-reconnect gave up
    ReconnectFailed(String),
}

impl Event for DieEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        match self {
            Self::DataChanged(_) => EventKind::DataChanged,
            Self::RollState(_) => EventKind::RollState,
            Self::Rolled { .. } => EventKind::Rolled,
            Self::BatteryLevel(_) => EventKind::BatteryLevel,
            Self::NotifyUser(_) => EventKind::NotifyUser,
            Self::DebugLog(_) => EventKind::DebugLog,
            Self::Connected => EventKind::Connected,
            Self::Disconnected => EventKind::Disconnected,
            Self::ReconnectFailed(_) => EventKind::ReconnectFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    type Hub = EventHub<(), DieEvent>;

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let hub = Hub::new();
        let seen = recorder();
        for name in ["first", "second", "third"] {
            let seen = seen.clone();
            hub.subscribe(EventKind::Connected, move |_, _| {
                seen.lock().unwrap().push(name);
                Ok(())
            });
        }

        let failures = hub.fire(&(), &DieEvent::Connected);

        assert!(failures.is_empty());
        assert_eq!(*seen.lock().unwrap(), ["first", "second", "third"]);
    }

    #[test]
    fn test_only_matching_kind_is_called() {
        let hub = Hub::new();
        let seen = recorder();
        let s = seen.clone();
        hub.subscribe(EventKind::Disconnected, move |_, _| {
            s.lock().unwrap().push("disconnected");
            Ok(())
        });

        hub.fire(&(), &DieEvent::Connected);

        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failing_handlers_are_isolated() {
        let hub = Hub::new();
        let seen = recorder();
        hub.subscribe(EventKind::Rolled, |_, _| Err(anyhow!("boom")));
        hub.subscribe(EventKind::Rolled, |_, _| panic!("kaboom"));
        let s = seen.clone();
        hub.subscribe(EventKind::Rolled, move |_, event| {
            assert_eq!(*event, DieEvent::Rolled { face: 5 });
            s.lock().unwrap().push("survivor");
            Ok(())
        });

        let failures = hub.fire(&(), &DieEvent::Rolled { face: 5 });

        assert_eq!(*seen.lock().unwrap(), ["survivor"]);
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].message, "boom");
        assert_eq!(failures[0].event, "Rolled");
        assert_eq!(failures[1].message, "panicked: kaboom");
    }

    #[test]
    fn test_unsubscribe() {
        let hub = Hub::new();
        let id = hub.subscribe(EventKind::Connected, |_, _| Ok(()));
        hub.subscribe(EventKind::Connected, |_, _| Ok(()));
        assert_eq!(hub.handler_count(EventKind::Connected), 2);

        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        assert_eq!(hub.handler_count(EventKind::Connected), 1);
    }

    #[test]
    fn test_handler_may_subscribe_while_firing() {
        let hub = Arc::new(Hub::new());
        let inner = hub.clone();
        hub.subscribe(EventKind::Connected, move |_, _| {
            inner.subscribe(EventKind::Connected, |_, _| Ok(()));
            Ok(())
        });

        hub.fire(&(), &DieEvent::Connected);

        assert_eq!(hub.handler_count(EventKind::Connected), 2);
    }
}
