use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{Notification, NotificationType};

pub type NotificationHandler = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Registry of handlers per [NotificationType].
///
/// Handlers run synchronously on the sending thread, in registration order. A panicking handler
/// is logged and does not prevent the remaining handlers from running.
pub struct NotificationCenter {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<NotificationType, Vec<(u64, NotificationHandler)>>>,
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a handler and returns its id. Ids increase monotonically.
    pub fn add_handler<F>(&self, notification_type: NotificationType, handler: F) -> u64
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .entry(notification_type)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Returns whether a handler with that id was registered for the topic.
    pub fn remove_handler(&self, id: u64, notification_type: NotificationType) -> bool {
        let mut handlers = self.handlers.write();
        match handlers.get_mut(&notification_type) {
            Some(list) => {
                let before = list.len();
                list.retain(|(handler_id, _)| *handler_id != id);
                before != list.len()
            }
            None => false,
        }
    }

    pub fn clear(&self, notification_type: NotificationType) {
        self.handlers.write().remove(&notification_type);
    }

    pub fn clear_all(&self) {
        self.handlers.write().clear();
    }

    pub fn handler_count(&self, notification_type: NotificationType) -> usize {
        self.handlers
            .read()
            .get(&notification_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn send(&self, notification: Notification) {
        // Snapshot so handlers may add or remove handlers without deadlocking.
        let handlers: Vec<NotificationHandler> = match self
            .handlers
            .read()
            .get(&notification.notification_type())
        {
            Some(list) => list.iter().map(|(_, handler)| handler.clone()).collect(),
            None => return,
        };

        for handler in handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&notification))) {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    "Notification handler for {:?} panicked: {}",
                    notification.notification_type(),
                    message
                );
            }
        }
    }
}

impl Default for NotificationCenter {
    fn default() -> Self {
        Self::new()
    }
}
