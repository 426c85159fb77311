use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Identifies one registered handler so it can be removed on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Handlers keyed by message type, kept in registration order.
pub struct HandlerRegistry<H: ?Sized> {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<String, Vec<(HandlerId, Arc<H>)>>>,
}

impl<H: ?Sized> HandlerRegistry<H> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, kind: &str, handler: Arc<H>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    /// Removes exactly one handler. Returns false if it was already gone.
    pub fn remove(&self, kind: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = handlers.get_mut(kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(kind);
        }
        removed
    }

    /// Snapshot of the handlers for `kind`, so callers never run user code
    /// under the lock.
    pub fn handlers_for(&self, kind: &str) -> Vec<Arc<H>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .map_or(0, Vec::len)
    }
}

impl<H: ?Sized> Default for HandlerRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}
