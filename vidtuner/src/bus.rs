/*!
    Typed in-process publish/subscribe.

    Handlers are keyed by the event's concrete type and invoked synchronously
    on the publishing thread, outside of the subscriber table lock. A handler
    that panics is logged and skipped, the remaining handlers still run.
*/

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error};

type Handler = Arc<dyn Fn(&dyn Any) + Send + Sync>;

/**
    Token returned from [`EventBus::subscribe`], used to unsubscribe.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken {
    type_id: TypeId,
    id: u64,
}

#[derive(Default)]
struct Subscribers {
    handlers: HashMap<TypeId, Vec<(u64, Handler)>>,
}

/**
    In-process event bus.

    Cheap to clone, all clones share the same subscriber table.
*/
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    subscribers: RwLock<Subscribers>,
    next_id: AtomicU64,
    disposed: AtomicBool,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /**
        Register a handler for events of type `T`.

        Returns `None` if the bus has been disposed.
    */
    pub fn subscribe<T, F>(&self, handler: F) -> Option<SubscriptionToken>
    where
        T: Any + Send + Sync,
        F: Fn(&T) + Send + Sync + 'static,
    {
        if self.is_disposed() {
            return None;
        }

        let type_id = TypeId::of::<T>();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: Handler = Arc::new(move |event: &dyn Any| {
            if let Some(event) = event.downcast_ref::<T>() {
                handler(event);
            }
        });

        let mut subscribers = self.inner.subscribers.write();
        // Re-check under the lock so a concurrent dispose cannot be undone
        if self.is_disposed() {
            return None;
        }
        subscribers
            .handlers
            .entry(type_id)
            .or_default()
            .push((id, handler));

        Some(SubscriptionToken { type_id, id })
    }

    /**
        Subscribe to events of type `T` through an unbounded channel.

        Events are cloned into the channel in publish order, which makes this
        the simplest way to consume events from an async task. The receiver
        yields `None` once the bus is disposed.
    */
    pub fn subscribe_channel<T>(&self) -> (Option<SubscriptionToken>, mpsc::UnboundedReceiver<T>)
    where
        T: Any + Clone + Send + Sync,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.subscribe::<T, _>(move |event| {
            let _ = tx.send(event.clone());
        });
        (token, rx)
    }

    /**
        Remove a previously registered handler.

        Returns true if the handler was still registered.
    */
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut subscribers = self.inner.subscribers.write();
        let Some(handlers) = subscribers.handlers.get_mut(&token.type_id) else {
            return false;
        };

        let before = handlers.len();
        handlers.retain(|(id, _)| *id != token.id);
        let removed = handlers.len() != before;

        if handlers.is_empty() {
            subscribers.handlers.remove(&token.type_id);
        }

        removed
    }

    /**
        Deliver an event to every current subscriber of its type.

        Publishing with no subscribers, or after disposal, does nothing.
        Returns the number of handlers that ran to completion.
    */
    pub fn publish<T>(&self, event: T) -> usize
    where
        T: Any + Send + Sync,
    {
        if self.is_disposed() {
            return 0;
        }

        let handlers: Vec<Handler> = {
            let subscribers = self.inner.subscribers.read();
            match subscribers.handlers.get(&TypeId::of::<T>()) {
                Some(handlers) => handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(
                    event = std::any::type_name::<T>(),
                    "event handler panicked"
                ),
            }
        }

        delivered
    }

    /**
        Number of handlers currently registered for `T`.
    */
    pub fn subscriber_count<T: Any>(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .handlers
            .get(&TypeId::of::<T>())
            .map_or(0, Vec::len)
    }

    /**
        Drop every subscriber and turn further subscribe/publish calls into no-ops.
    */
    pub fn dispose(&self) {
        let mut subscribers = self.inner.subscribers.write();
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let count: usize = subscribers.handlers.values().map(Vec::len).sum();
        subscribers.handlers.clear();
        debug!(count, "event bus disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }
}
