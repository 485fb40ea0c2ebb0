//! Publish/subscribe fan-out of SDK activity to application handlers.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{Map, Value};

pub mod center;
pub mod registry;

use crate::events::dispatcher::LogEvent;

/// Topics a handler can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NotificationType {
    Decision,
    Track,
    LogEvent,
    ProjectConfigUpdate,
}

/// A decision was made. `decision_type` is `flag` for decide calls; the legacy accessors use
/// `ab-test`, `feature`, `feature-variable` and `all-feature-variables`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionNotification {
    #[serde(rename = "type")]
    pub decision_type: String,
    pub user_id: String,
    pub attributes: HashMap<String, Value>,
    pub decision_info: Map<String, Value>,
}

/// A conversion event was tracked.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackNotification {
    pub event_key: String,
    pub user_id: String,
    pub attributes: HashMap<String, Value>,
    pub event_tags: HashMap<String, Value>,
}

/// A new datafile revision became current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfigUpdateNotification {
    pub revision: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Decision(DecisionNotification),
    Track(TrackNotification),
    /// An event batch is about to be dispatched.
    LogEvent(LogEvent),
    ProjectConfigUpdate(ProjectConfigUpdateNotification),
}

impl Notification {
    pub fn notification_type(&self) -> NotificationType {
        match self {
            Notification::Decision(_) => NotificationType::Decision,
            Notification::Track(_) => NotificationType::Track,
            Notification::LogEvent(_) => NotificationType::LogEvent,
            Notification::ProjectConfigUpdate(_) => NotificationType::ProjectConfigUpdate,
        }
    }
}

pub use center::{NotificationCenter, NotificationHandler};
