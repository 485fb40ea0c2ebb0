//! Process-wide lookup of notification centers by SDK key.
//!
//! Lets components built before the client (such as a config manager) share the center the
//! client will use. Entries are created on first access and released when the client closes.

use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::Mutex;

use super::NotificationCenter;

lazy_static! {
    static ref NOTIFICATION_CENTERS: Mutex<HashMap<String, Arc<NotificationCenter>>> =
        Mutex::new(HashMap::new());
}

/// Returns the center for `sdk_key`, creating it if needed.
pub fn get_notification_center(sdk_key: &str) -> Arc<NotificationCenter> {
    NOTIFICATION_CENTERS
        .lock()
        .entry(sdk_key.to_string())
        .or_insert_with(|| Arc::new(NotificationCenter::new()))
        .clone()
}

/// Drops the registry entry of `sdk_key` and clears its handlers.
pub fn release_notification_center(sdk_key: &str) {
    if let Some(center) = NOTIFICATION_CENTERS.lock().remove(sdk_key) {
        center.clear_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::NotificationType;

    #[test]
    fn same_key_shares_a_center() {
        let a = get_notification_center("registry-shared");
        let b = get_notification_center("registry-shared");
        assert!(Arc::ptr_eq(&a, &b));

        let other = get_notification_center("registry-other");
        assert!(!Arc::ptr_eq(&a, &other));

        release_notification_center("registry-shared");
        release_notification_center("registry-other");
    }

    #[test]
    fn release_creates_a_fresh_center_next_time() {
        let before = get_notification_center("registry-release");
        before.add_handler(NotificationType::Track, |_| {});

        release_notification_center("registry-release");
        assert_eq!(before.handler_count(NotificationType::Track), 0);

        let after = get_notification_center("registry-release");
        assert!(!Arc::ptr_eq(&before, &after));
        release_notification_center("registry-release");
    }
}
