//! Per-kind message observers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::messages::{Message, MessageKind};

/// Callback invoked for an inbound message.
pub type Observer = Box<dyn FnMut(&Message) + Send>;

/// One handler per message kind, shared between a message loop and whoever
/// is waiting on it.
///
/// Handlers run on the loop task while the table is locked, so they must not
/// touch the table themselves.
#[derive(Clone, Default)]
pub struct ObserverTable {
    handlers: Arc<Mutex<HashMap<MessageKind, Observer>>>,
}

impl ObserverTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the handler for `kind`, replacing any previous one.
    pub fn set<F>(&self, kind: MessageKind, handler: F)
    where
        F: FnMut(&Message) + Send + 'static,
    {
        self.handlers.lock().insert(kind, Box::new(handler));
    }

    /// Remove the handler for `kind`.
    pub fn remove(&self, kind: MessageKind) {
        self.handlers.lock().remove(&kind);
    }

    /// Remove every handler, dropping anything they captured.
    pub fn clear(&self) {
        let drained: Vec<Observer> = self.handlers.lock().drain().map(|(_, h)| h).collect();
        drop(drained);
    }

    /// Whether a handler is installed for `kind`.
    pub fn is_set(&self, kind: MessageKind) -> bool {
        self.handlers.lock().contains_key(&kind)
    }

    /// Run the handler for the message's kind. Returns false when none is installed.
    pub fn notify(&self, message: &Message) -> bool {
        let mut handlers = self.handlers.lock();
        match handlers.get_mut(&message.kind()) {
            Some(handler) => {
                handler(message);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for ObserverTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<MessageKind> = self.handlers.lock().keys().copied().collect();
        f.debug_struct("ObserverTable").field("kinds", &kinds).finish()
    }
}
