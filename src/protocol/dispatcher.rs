use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::trace;

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::event::{Event, EventSink};

type HandlerFn = dyn Fn(&mut Event) + Send + Sync + 'static;

/// Handler priority. Handlers run from `Lowest` to `Highest`, so the highest
/// priority handler gets the last word on a cancellable event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
}

/// Identifies one registration for [`EventDispatcher::unregister`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registration {
    id: HandlerId,
    priority: Priority,
    handler: Arc<HandlerFn>,
}

/// Priority-ordered event sink.
///
/// Dispatch runs over a snapshot of the registrations, so handlers may
/// register or unregister handlers while an event is being delivered.
/// Cancelling an event does not stop later handlers from seeing it.
pub struct EventDispatcher {
    handlers: Arc<RwLock<Vec<Registration>>>,
    next_id: AtomicU64,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register<F>(&self, priority: Priority, handler: F) -> Result<HandlerId>
    where
        F: Fn(&mut Event) + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.to_string()))?;

        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        // keep registration order within one priority
        let pos = handlers.partition_point(|r| r.priority <= priority);
        handlers.insert(
            pos,
            Registration {
                id,
                priority,
                handler: Arc::new(handler),
            },
        );
        Ok(id)
    }

    /// Register at [`Priority::Normal`].
    pub fn on<F>(&self, handler: F) -> Result<HandlerId>
    where
        F: Fn(&mut Event) + Send + Sync + 'static,
    {
        self.register(Priority::Normal, handler)
    }

    pub fn unregister(&self, id: HandlerId) -> bool {
        let Ok(mut handlers) = self.handlers.write() else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|r| r.id != id);
        handlers.len() != before
    }

    pub fn is_registered(&self, id: HandlerId) -> bool {
        self.handlers
            .read()
            .map(|handlers| handlers.iter().any(|r| r.id == id))
            .unwrap_or(false)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().map(|h| h.len()).unwrap_or(0)
    }

    pub fn dispatch(&self, event: &mut Event) {
        let snapshot: Vec<Arc<HandlerFn>> = match self.handlers.read() {
            Ok(handlers) => handlers.iter().map(|r| r.handler.clone()).collect(),
            Err(_) => return,
        };

        trace!(event = event.kind().name(), handlers = snapshot.len(), "Dispatching event");
        for handler in snapshot {
            handler(event);
        }
    }
}

impl EventSink for EventDispatcher {
    fn emit(&self, event: &mut Event) {
        self.dispatch(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::event::NetworkEvent;
    use std::sync::Mutex;

    fn incoming() -> Event {
        Event::new(NetworkEvent::IncomingConnection {
            peer: "127.0.0.1:9".parse().unwrap(),
        })
    }

    #[test]
    fn handlers_run_from_lowest_to_highest() {
        let dispatcher = EventDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (priority, tag) in [
            (Priority::Highest, "highest"),
            (Priority::Lowest, "lowest"),
            (Priority::Normal, "normal-a"),
            (Priority::Normal, "normal-b"),
            (Priority::High, "high"),
            (Priority::Low, "low"),
        ] {
            let order = order.clone();
            dispatcher
                .register(priority, move |_| order.lock().unwrap().push(tag))
                .unwrap();
        }

        dispatcher.emit(&mut incoming());
        assert_eq!(
            *order.lock().unwrap(),
            vec!["lowest", "low", "normal-a", "normal-b", "high", "highest"]
        );
    }

    #[test]
    fn later_handler_can_uncancel() {
        let dispatcher = EventDispatcher::new();
        dispatcher
            .register(Priority::Low, |event| {
                event.cancel();
            })
            .unwrap();
        let seen_cancelled = Arc::new(Mutex::new(false));
        let seen = seen_cancelled.clone();
        dispatcher
            .register(Priority::High, move |event| {
                *seen.lock().unwrap() = event.is_cancelled();
                event.set_cancelled(false);
            })
            .unwrap();

        let mut event = incoming();
        dispatcher.emit(&mut event);
        assert!(*seen_cancelled.lock().unwrap());
        assert!(!event.is_cancelled());
    }

    #[test]
    fn unregister_removes_handler() {
        let dispatcher = EventDispatcher::new();
        let id = dispatcher.on(|event| {
            event.cancel();
        }).unwrap();
        assert!(dispatcher.is_registered(id));
        assert!(dispatcher.unregister(id));
        assert!(!dispatcher.unregister(id));

        let mut event = incoming();
        dispatcher.emit(&mut event);
        assert!(!event.is_cancelled());
        assert_eq!(dispatcher.handler_count(), 0);
    }
}
