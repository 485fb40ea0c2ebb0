//! Wire format of the event endpoint.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::project_config::Region;

use super::event::{DecisionMetadata, EventPayload, UserEvent, VisitorAttribute};

const CAMPAIGN_ACTIVATED_EVENT_KEY: &str = "campaign_activated";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub account_id: String,
    pub project_id: String,
    pub revision: String,
    pub client_name: String,
    pub client_version: String,
    pub anonymize_ip: bool,
    pub enrich_decisions: bool,
    pub region: Region,
    pub visitors: Vec<Visitor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visitor {
    pub visitor_id: String,
    pub attributes: Vec<VisitorAttribute>,
    pub snapshots: Vec<Snapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub decisions: Vec<Decision>,
    pub events: Vec<SnapshotEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub campaign_id: String,
    pub experiment_id: String,
    pub variation_id: String,
    pub metadata: DecisionMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEvent {
    pub entity_id: String,
    pub key: String,
    pub timestamp: i64,
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tags: Option<HashMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub revenue: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<f64>,
}

impl From<&UserEvent> for Visitor {
    fn from(event: &UserEvent) -> Self {
        let snapshot = match &event.payload {
            EventPayload::Impression(impression) => Snapshot {
                decisions: vec![Decision {
                    campaign_id: impression.campaign_id.clone(),
                    experiment_id: impression.experiment_id.clone(),
                    variation_id: impression.variation_id.clone(),
                    metadata: impression.metadata.clone(),
                }],
                events: vec![SnapshotEvent {
                    entity_id: impression.campaign_id.clone(),
                    key: CAMPAIGN_ACTIVATED_EVENT_KEY.to_string(),
                    timestamp: event.timestamp,
                    uuid: event.uuid.clone(),
                    tags: None,
                    revenue: None,
                    value: None,
                }],
            },
            EventPayload::Conversion(conversion) => Snapshot {
                decisions: Vec::new(),
                events: vec![SnapshotEvent {
                    entity_id: conversion.entity_id.clone(),
                    key: conversion.key.clone(),
                    timestamp: event.timestamp,
                    uuid: event.uuid.clone(),
                    tags: Some(conversion.tags.clone()).filter(|tags| !tags.is_empty()),
                    revenue: conversion.revenue,
                    value: conversion.value,
                }],
            },
        };

        Visitor {
            visitor_id: event.visitor_id.clone(),
            attributes: event.attributes.clone(),
            snapshots: vec![snapshot],
        }
    }
}

impl EventBatch {
    /// Builds a batch from events sharing one `(project_id, revision)`. Project data is taken
    /// from the first event. Returns `None` for an empty slice.
    pub fn from_events(events: &[UserEvent]) -> Option<Self> {
        let first = events.first()?;
        debug_assert!(events.iter().all(|e| e.batch_key() == first.batch_key()));

        let context = &first.context;
        Some(Self {
            account_id: context.account_id.clone(),
            project_id: context.project_id.clone(),
            revision: context.revision.clone(),
            client_name: context.client_name.clone(),
            client_version: context.client_version.clone(),
            anonymize_ip: context.anonymize_ip,
            enrich_decisions: true,
            region: context.region,
            visitors: events.iter().map(Visitor::from).collect(),
        })
    }
}
