//! Typed publish/subscribe used by every component to emit and observe named
//! events without knowing about each other.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// An event that can be routed by its kind.
pub trait Event: Send + Sync + 'static {
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

pub type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

type Registry<E> = HashMap<<E as Event>::Kind, Vec<(ListenerId, Handler<E>)>>;

pub struct Dispatcher<E: Event> {
    listeners: Mutex<Registry<E>>,
    next_id: AtomicU64,
}

impl<E: Event> Default for Dispatcher<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> Dispatcher<E> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add_listener<F>(&self, kind: E::Kind, handler: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.add_handler(kind, Arc::new(handler))
    }

    pub fn add_handler(&self, kind: E::Kind, handler: Handler<E>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .entry(kind)
            .or_default()
            .push((id, handler));
        id
    }

    /// Returns `false` when no listener with `id` was registered for `kind`.
    pub fn remove_listener(&self, kind: E::Kind, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(handlers) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            listeners.remove(&kind);
        }
        removed
    }

    /// Invokes the handlers registered for the event's kind in insertion
    /// order and returns how many ran. The lock is released before handlers
    /// run, so a handler may register or remove listeners.
    pub fn emit(&self, event: &E) -> usize {
        let handlers: Vec<Handler<E>> = self
            .listeners
            .lock()
            .get(&event.kind())
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.listeners.lock().get(&kind).map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        self.listeners.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        Ping,
        Pong,
    }

    #[derive(Debug)]
    struct Signal(Kind, u32);

    impl Event for Signal {
        type Kind = Kind;

        fn kind(&self) -> Kind {
            self.0
        }
    }

    #[test]
    fn handlers_run_in_insertion_order() {
        let dispatcher = Dispatcher::<Signal>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let seen = Arc::clone(&seen);
            dispatcher.add_listener(Kind::Ping, move |signal: &Signal| {
                seen.lock().push(format!("{tag}{}", signal.1));
            });
        }
        assert_eq!(dispatcher.emit(&Signal(Kind::Ping, 1)), 3);
        assert_eq!(*seen.lock(), vec!["a1", "b1", "c1"]);
    }

    #[test]
    fn kinds_are_isolated() {
        let dispatcher = Dispatcher::<Signal>::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        dispatcher.add_listener(Kind::Pong, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(dispatcher.emit(&Signal(Kind::Ping, 0)), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn remove_reports_whether_anything_was_removed() {
        let dispatcher = Dispatcher::<Signal>::new();
        let id = dispatcher.add_listener(Kind::Ping, |_| {});
        assert!(!dispatcher.remove_listener(Kind::Pong, id));
        assert!(dispatcher.remove_listener(Kind::Ping, id));
        assert!(!dispatcher.remove_listener(Kind::Ping, id));
        assert_eq!(dispatcher.listener_count(Kind::Ping), 0);
    }

    #[test]
    fn handler_may_unregister_itself_while_running() {
        let dispatcher = Arc::new(Dispatcher::<Signal>::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicU64::new(0));

        let inner = Arc::clone(&dispatcher);
        let own_id = Arc::clone(&slot);
        let counter = Arc::clone(&calls);
        let id = dispatcher.add_listener(Kind::Ping, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *own_id.lock() {
                inner.remove_listener(Kind::Ping, id);
            }
        });
        *slot.lock() = Some(id);

        dispatcher.emit(&Signal(Kind::Ping, 0));
        dispatcher.emit(&Signal(Kind::Ping, 1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
