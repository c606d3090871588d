#![forbid(unsafe_code)]

// Id-keyed resource maps with the shared close contract

use crate::engine::{Resource, Subscription};
use crate::media::types::{MediaError, MediaResult};
use crate::signaling::{Notifier, SocketMessage};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock as StdRwLock;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Outbound notification sent when a registered resource closes on its own
pub struct ClosedNotice {
    pub notifier: Notifier,
    pub method: &'static str,
    pub data: Value,
}

struct Entry<T: ?Sized> {
    serial: u64,
    resource: Arc<T>,
    remote_closed: Arc<AtomicBool>,
    subscriptions: Vec<Subscription>,
}

type Entries<T> = StdRwLock<HashMap<String, Entry<T>>>;

/// Holds resources of one kind. Every entry is removed by its own close hook, whichever
/// side closed it; the peer hears about the closure only if it did not ask for it.
pub struct Registry<T: Resource + ?Sized> {
    kind: &'static str,
    next_serial: AtomicU64,
    entries: Arc<Entries<T>>,
}

impl<T: Resource + ?Sized + 'static> Registry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            next_serial: AtomicU64::new(0),
            entries: Arc::new(StdRwLock::new(HashMap::new())),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Inserts `resource` and installs its close hook. `subscriptions` (event forwarders)
    /// live exactly as long as the entry. Returns false if the id is already registered.
    pub fn register(&self, resource: Arc<T>, notice: ClosedNotice, subscriptions: Vec<Subscription>) -> bool {
        let id = resource.id().to_string();
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let remote_closed = Arc::new(AtomicBool::new(false));

        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            if entries.contains_key(&id) {
                return false;
            }
            entries.insert(
                id.clone(),
                Entry {
                    serial,
                    resource: resource.clone(),
                    remote_closed: remote_closed.clone(),
                    subscriptions: Vec::new(),
                },
            );
        }

        let hook = resource.on_close(Self::close_hook(
            Arc::downgrade(&self.entries),
            self.kind,
            id.clone(),
            serial,
            remote_closed,
            notice,
        ));

        // The hook may already have run if the resource closed before we got here.
        let leftover = {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            match entries.get_mut(&id).filter(|entry| entry.serial == serial) {
                Some(entry) => {
                    entry.subscriptions.push(hook);
                    entry.subscriptions.extend(subscriptions);
                    None
                }
                None => Some((hook, subscriptions)),
            }
        };
        drop(leftover);

        true
    }

    fn close_hook(
        entries: Weak<Entries<T>>,
        kind: &'static str,
        id: String,
        serial: u64,
        remote_closed: Arc<AtomicBool>,
        notice: ClosedNotice,
    ) -> Box<dyn FnOnce() + Send> {
        Box::new(move || {
            let removed = entries.upgrade().and_then(|entries| {
                let mut entries = entries.write().unwrap_or_else(|e| e.into_inner());
                match entries.get(&id) {
                    Some(entry) if entry.serial == serial => entries.remove(&id),
                    _ => None,
                }
            });
            // Subscriptions are dropped outside the lock
            drop(removed);

            if remote_closed.load(Ordering::SeqCst) {
                debug!("{} {} closed by request", kind, id);
                return;
            }

            debug!("{} {} closed, notifying {}", kind, id, notice.method);
            notice.notifier.notify(SocketMessage::new(notice.method, notice.data));
        })
    }

    /// Looks up a resource, failing with `NotFound`
    pub fn get(&self, id: &str) -> MediaResult<Arc<T>> {
        self.find(id).ok_or_else(|| MediaError::not_found(self.kind, id))
    }

    pub fn find(&self, id: &str) -> Option<Arc<T>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(id).map(|entry| entry.resource.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).contains_key(id)
    }

    /// Peer-requested close: the close hook will not notify.
    pub fn close_by_request(&self, id: &str) -> MediaResult<()> {
        let resource = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            let entry = entries.get(id).ok_or_else(|| MediaError::not_found(self.kind, id))?;
            entry.remote_closed.store(true, Ordering::SeqCst);
            entry.resource.clone()
        };

        resource.close();
        Ok(())
    }

    pub fn values(&self) -> Vec<Arc<T>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.values().map(|entry| entry.resource.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
