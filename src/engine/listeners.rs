#![forbid(unsafe_code)]

// Callback registries behind the engine's `on_*` subscription methods

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Handle returned by every `on_*` registration. Dropping it removes the callback.
#[must_use = "dropping a Subscription unregisters its callback"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(remove: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self { remove: Some(Box::new(remove)) }
    }

    /// A subscription that owns nothing, for callbacks that can never fire.
    pub fn noop() -> Self {
        Self { remove: None }
    }

    /// Keeps the callback registered for the lifetime of the emitter.
    pub fn detach(mut self) {
        self.remove = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

type EventCallback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Recurring listeners. Emission snapshots the callbacks before invoking them, so a
/// callback may drop its own (or any other) subscription while running.
pub struct Listeners<E> {
    next_id: AtomicU64,
    callbacks: Arc<Mutex<HashMap<u64, EventCallback<E>>>>,
}

impl<E: 'static> Listeners<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            callbacks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn add(&self, callback: EventCallback<E>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, callback);

        let callbacks = Arc::downgrade(&self.callbacks);
        Subscription::new(move || {
            if let Some(callbacks) = callbacks.upgrade() {
                callbacks.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            }
        })
    }

    pub fn emit(&self, event: &E) {
        let snapshot: Vec<EventCallback<E>> = {
            let callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
            callbacks.values().cloned().collect()
        };
        for callback in snapshot {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: 'static> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

type OnceCallback<A> = Box<dyn FnOnce(A) + Send>;

struct OnceState<A> {
    fired: Option<A>,
    callbacks: HashMap<u64, OnceCallback<A>>,
}

/// One-shot listeners (close, died). `fire` runs at most once; callbacks added after it
/// ran are invoked immediately with the same argument.
pub struct OnceListeners<A: Clone> {
    next_id: AtomicU64,
    state: Arc<Mutex<OnceState<A>>>,
}

impl<A: Clone + Send + 'static> OnceListeners<A> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            state: Arc::new(Mutex::new(OnceState {
                fired: None,
                callbacks: HashMap::new(),
            })),
        }
    }

    pub fn add(&self, callback: OnceCallback<A>) -> Subscription {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(arg) = state.fired.clone() {
            drop(state);
            callback(arg);
            return Subscription::noop();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        state.callbacks.insert(id, callback);
        drop(state);

        let weak = Arc::downgrade(&self.state);
        Subscription::new(move || {
            if let Some(state) = weak.upgrade() {
                state.lock().unwrap_or_else(|e| e.into_inner()).callbacks.remove(&id);
            }
        })
    }

    /// Returns false if the listeners had already fired.
    pub fn fire(&self, arg: A) -> bool {
        let callbacks = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.fired.is_some() {
                return false;
            }
            state.fired = Some(arg.clone());
            std::mem::take(&mut state.callbacks)
        };

        let mut ordered: Vec<(u64, OnceCallback<A>)> = callbacks.into_iter().collect();
        ordered.sort_by_key(|(id, _)| *id);
        for (_, callback) in ordered {
            callback(arg.clone());
        }
        true
    }

    pub fn fired(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).fired.is_some()
    }
}

impl<A: Clone + Send + 'static> Default for OnceListeners<A> {
    fn default() -> Self {
        Self::new()
    }
}
