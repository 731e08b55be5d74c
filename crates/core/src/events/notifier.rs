use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, error};

use super::{SyncEvent, SyncEventKind};

type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

static NEXT_NOTIFIER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // Notifiers currently delivering on this thread.
    static DELIVERING: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ListenerEntry {
    id: u64,
    kind: Option<SyncEventKind>,
    listener: Listener,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<ListenerEntry>,
}

/// Process-wide publish/subscribe channel between the coordinator and UI
/// observers.
///
/// Delivery is synchronous and serialized: one event reaches every listener
/// before the next one starts. A listener that publishes from inside its
/// handler has the event queued behind the current one.
pub struct ChangeNotifier {
    id: u64,
    registry: Arc<Mutex<Registry>>,
    queue: Mutex<VecDeque<SyncEvent>>,
    delivery: Mutex<()>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self {
            id: NEXT_NOTIFIER_ID.fetch_add(1, Ordering::Relaxed),
            registry: Arc::new(Mutex::new(Registry::default())),
            queue: Mutex::new(VecDeque::new()),
            delivery: Mutex::new(()),
        }
    }

    /// Listen to every event kind.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(listener))
    }

    /// Listen to a single event kind.
    pub fn subscribe_kind<F>(&self, kind: SyncEventKind, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(listener))
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.registry).listeners.len()
    }

    /// Fire-and-forget delivery to the listeners subscribed right now.
    pub fn publish(&self, event: SyncEvent) {
        lock(&self.queue).push_back(event);

        let reentrant = DELIVERING.with(|ids| ids.borrow().contains(&self.id));
        if reentrant {
            return;
        }

        let _serial = lock(&self.delivery);
        DELIVERING.with(|ids| ids.borrow_mut().push(self.id));
        loop {
            let next = lock(&self.queue).pop_front();
            match next {
                Some(event) => self.deliver(&event),
                None => break,
            }
        }
        DELIVERING.with(|ids| ids.borrow_mut().retain(|id| *id != self.id));
    }

    fn register(&self, kind: Option<SyncEventKind>, listener: Listener) -> Subscription {
        let mut registry = lock(&self.registry);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.listeners.push(ListenerEntry { id, kind, listener });
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    fn deliver(&self, event: &SyncEvent) {
        // Snapshot so listeners may subscribe or unsubscribe while handling.
        let listeners: Vec<(u64, Listener)> = lock(&self.registry)
            .listeners
            .iter()
            .filter(|entry| entry.kind.map_or(true, |kind| kind == event.kind()))
            .map(|entry| (entry.id, Arc::clone(&entry.listener)))
            .collect();

        debug!(
            "[Notifier] Delivering {:?} to {} listener(s)",
            event.kind(),
            listeners.len()
        );
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(
                    "[Notifier] Listener {} panicked while handling {:?}",
                    id,
                    event.kind()
                );
            }
        }
    }
}

/// Keeps a listener registered; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Keep the listener registered for the notifier's whole lifetime.
    pub fn detach(mut self) {
        self.registry = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).listeners.retain(|entry| entry.id != self.id);
        }
    }
}
