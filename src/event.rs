//! Before/after notifications for every tracked operation, plus illegal-access
//! reports.
//!
//! Listeners are called synchronously on the thread doing the memory
//! operation, in registration order. A listener that panics is logged and
//! skipped; the next listener still runs and the memory operation still
//! completes.

use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use serde::Serialize;

use crate::{error::IllegalMemoryAccess, serialize::serde_addr};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MemoryEvent {
    BeforeAllocate {
        size: u64,
    },
    AfterAllocate {
        #[serde(with = "serde_addr")]
        address: u64,
        size: u64,
    },
    BeforeFree {
        #[serde(with = "serde_addr")]
        address: u64,
        /// Tracked size, if the address was tracked
        size: Option<u64>,
        is_known_address: bool,
    },
    AfterFree {
        #[serde(with = "serde_addr")]
        address: u64,
        size: Option<u64>,
        is_known_address: bool,
    },
    BeforeReallocate {
        #[serde(with = "serde_addr")]
        old_address: u64,
        old_size: Option<u64>,
        new_size: u64,
        is_known_address: bool,
    },
    AfterReallocate {
        #[serde(with = "serde_addr")]
        old_address: u64,
        old_size: Option<u64>,
        #[serde(with = "serde_addr")]
        new_address: u64,
        new_size: u64,
        is_known_address: bool,
    },
    IllegalAccess(IllegalMemoryAccess),
}

pub trait MemoryListener: Send + Sync {
    fn on_event(&self, event: &MemoryEvent);
}

impl<F> MemoryListener for F
where
    F: Fn(&MemoryEvent) + Send + Sync,
{
    fn on_event(&self, event: &MemoryEvent) {
        self(event)
    }
}

/// Handle returned by [`EventBus::register`], used to deregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

#[derive(Clone)]
struct Registered {
    id: ListenerId,
    /// For log lines
    name: String,
    listener: Arc<dyn MemoryListener>,
}

impl Registered {
    fn is(&self, listener: *const ()) -> bool {
        Arc::as_ptr(&self.listener) as *const () == listener
    }
}

/// Copy-on-write, so dispatch only holds the lock long enough to clone an
/// `Arc`. That also means a listener can (de)register from inside its own
/// callback without deadlocking.
pub struct EventBus {
    listeners: RwLock<Arc<[Registered]>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Arc::from(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register `listener`. Registering the same `Arc` twice is a no-op that
    /// hands back the original id.
    pub fn register<L>(&self, listener: Arc<L>) -> ListenerId
    where
        L: MemoryListener + 'static,
    {
        let ptr = Arc::as_ptr(&listener) as *const ();
        let mut listeners = self.listeners.write();
        if let Some(existing) = listeners.iter().find(|r| r.is(ptr)) {
            return existing.id;
        }
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let name = tynm::type_name::<L>();
        log::debug!("registered listener {name} as {id:?}");
        let mut updated = listeners.to_vec();
        updated.push(Registered {
            id,
            name,
            listener,
        });
        *listeners = updated.into();
        id
    }

    /// Returns `false` if `id` was not registered (or already deregistered)
    pub fn deregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(position) = listeners.iter().position(|r| r.id == id) else {
            return false;
        };
        let mut updated = listeners.to_vec();
        let removed = updated.remove(position);
        log::debug!("deregistered listener {} ({id:?})", removed.name);
        *listeners = updated.into();
        true
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dispatch(&self, event: &MemoryEvent) {
        let listeners = Arc::clone(&*self.listeners.read());
        for registered in listeners.iter() {
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| registered.listener.on_event(event)));
            if let Err(payload) = outcome {
                log::warn!(
                    "listener {} panicked on {event:?}: {}",
                    registered.name,
                    panic_message(&*payload)
                );
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.read();
        f.debug_list()
            .entries(listeners.iter().map(|r| (r.id, &r.name)))
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

/// Forwards every event into a channel, for consumers that would rather
/// process events on their own thread
pub struct ChannelListener {
    sender: Sender<MemoryEvent>,
}

impl ChannelListener {
    pub fn unbounded() -> (Self, Receiver<MemoryEvent>) {
        let (sender, receiver) = channel::unbounded();
        (Self { sender }, receiver)
    }

    /// Events that do not fit are dropped, we never block a memory operation
    /// on a slow consumer
    pub fn bounded(capacity: usize) -> (Self, Receiver<MemoryEvent>) {
        let (sender, receiver) = channel::bounded(capacity);
        (Self { sender }, receiver)
    }
}

impl MemoryListener for ChannelListener {
    fn on_event(&self, event: &MemoryEvent) {
        match self.sender.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => log::trace!("event channel full, dropped {event:?}"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    fn alloc_event(size: u64) -> MemoryEvent {
        MemoryEvent::BeforeAllocate { size }
    }

    struct Recorder {
        tag: &'static str,
        seen: Arc<Mutex<Vec<(&'static str, MemoryEvent)>>>,
    }

    impl MemoryListener for Recorder {
        fn on_event(&self, event: &MemoryEvent) {
            self.seen.lock().push((self.tag, event.clone()));
        }
    }

    #[test]
    fn dispatches_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            bus.register(Arc::new(Recorder {
                tag,
                seen: Arc::clone(&seen),
            }));
        }
        bus.dispatch(&alloc_event(8));
        let tags: Vec<_> = seen.lock().iter().map(|(tag, _)| *tag).collect();
        assert_eq!(tags, ["first", "second", "third"]);
    }

    #[test]
    fn registration_is_idempotent() {
        let bus = EventBus::new();
        let listener = Arc::new(|_: &MemoryEvent| {});
        let a = bus.register(Arc::clone(&listener));
        let b = bus.register(Arc::clone(&listener));
        assert_eq!(a, b);
        assert_eq!(bus.len(), 1);

        assert!(bus.deregister(a));
        assert!(!bus.deregister(a));
        assert!(bus.is_empty());
    }

    #[test]
    fn panicking_listener_is_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.register(Arc::new(|_: &MemoryEvent| panic!("boom")));
        bus.register(Arc::new(Recorder {
            tag: "survivor",
            seen: Arc::clone(&seen),
        }));
        bus.dispatch(&alloc_event(1));
        bus.dispatch(&alloc_event(2));
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn listener_can_deregister_itself() {
        let bus = Arc::new(EventBus::new());
        let id = Arc::new(Mutex::new(None));
        let listener = {
            let bus = Arc::clone(&bus);
            let id = Arc::clone(&id);
            Arc::new(move |_: &MemoryEvent| {
                if let Some(id) = *id.lock() {
                    bus.deregister(id);
                }
            })
        };
        *id.lock() = Some(bus.register(listener));
        bus.dispatch(&alloc_event(1));
        assert!(bus.is_empty());
    }

    #[test]
    fn channel_listener_forwards_events() {
        let bus = EventBus::new();
        let (listener, receiver) = ChannelListener::bounded(1);
        bus.register(Arc::new(listener));
        bus.dispatch(&alloc_event(1));
        bus.dispatch(&alloc_event(2));
        assert_eq!(receiver.try_recv().unwrap(), alloc_event(1));
        // Second one did not fit
        assert!(receiver.try_recv().is_err());
    }
}
