use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::decision::{BOT_FILTERING_ATTRIBUTE, DecisionSource};
use crate::project_config::{EventType, Experiment, ProjectConfig, Region, Variation};

const RESERVED_ATTRIBUTE_PREFIX: &str = "$opt_";
const CUSTOM_ATTRIBUTE_TYPE: &str = "custom";
const REVENUE_TAG: &str = "revenue";
const VALUE_TAG: &str = "value";

/// `rule_type` reported by the legacy activate call.
pub const EXPERIMENT_RULE_TYPE: &str = "experiment";

/// Project-level data shared by every event built against one datafile revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    pub account_id: String,
    pub project_id: String,
    pub revision: String,
    pub client_name: String,
    pub client_version: String,
    pub anonymize_ip: bool,
    pub region: Region,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitorAttribute {
    pub entity_id: String,
    pub key: String,
    #[serde(rename = "type")]
    pub attribute_type: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionMetadata {
    pub flag_key: String,
    pub rule_key: String,
    pub rule_type: String,
    pub variation_key: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cmab_uuid: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImpressionEvent {
    /// Layer (campaign) id.
    pub campaign_id: String,
    pub experiment_id: String,
    pub variation_id: String,
    pub metadata: DecisionMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversionEvent {
    pub entity_id: String,
    pub key: String,
    pub tags: HashMap<String, Value>,
    pub revenue: Option<i64>,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Impression(ImpressionEvent),
    Conversion(ConversionEvent),
}

/// An impression or conversion waiting to be batched.
#[derive(Debug, Clone, PartialEq)]
pub struct UserEvent {
    pub uuid: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub visitor_id: String,
    pub attributes: Vec<VisitorAttribute>,
    pub context: EventContext,
    pub payload: EventPayload,
}

impl UserEvent {
    /// Events can share a batch only when this key matches.
    pub fn batch_key(&self) -> (&str, &str) {
        (&self.context.project_id, &self.context.revision)
    }
}

impl Display for UserEvent {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let kind = match &self.payload {
            EventPayload::Impression(_) => "impression",
            EventPayload::Conversion(_) => "conversion",
        };
        write!(f, "{} event {} for visitor {}", kind, self.uuid, self.visitor_id)
    }
}

/// Everything needed to describe an impression.
pub struct ImpressionInput<'a> {
    pub experiment: Option<&'a Experiment>,
    pub variation: Option<&'a Variation>,
    pub flag_key: &'a str,
    pub rule_type: &'a str,
    pub enabled: bool,
    pub cmab_uuid: Option<&'a str>,
}

impl<'a> ImpressionInput<'a> {
    pub fn for_flag(
        flag_key: &'a str,
        experiment: Option<&'a Experiment>,
        variation: Option<&'a Variation>,
        source: DecisionSource,
        cmab_uuid: Option<&'a str>,
    ) -> Self {
        Self {
            experiment,
            variation,
            flag_key,
            rule_type: source.rule_type(),
            enabled: variation.map(|v| v.feature_enabled).unwrap_or(false),
            cmab_uuid,
        }
    }
}

pub struct EventFactory {
    client_name: String,
    client_version: String,
}

impl EventFactory {
    pub fn new(client_name: impl Into<String>, client_version: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            client_version: client_version.into(),
        }
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn context(&self, config: &ProjectConfig) -> EventContext {
        EventContext {
            account_id: config.account_id().to_string(),
            project_id: config.project_id().to_string(),
            revision: config.revision().to_string(),
            client_name: self.client_name.clone(),
            client_version: self.client_version.clone(),
            anonymize_ip: config.anonymize_ip(),
            region: config.region(),
        }
    }

    pub fn new_impression(
        &self,
        config: &ProjectConfig,
        input: ImpressionInput,
        user_id: &str,
        attributes: &HashMap<String, Value>,
    ) -> UserEvent {
        let (campaign_id, experiment_id, rule_key) = match input.experiment {
            Some(experiment) => (
                experiment.layer_id.clone(),
                experiment.id.clone(),
                experiment.key.clone(),
            ),
            None => (String::new(), String::new(), String::new()),
        };
        let (variation_id, variation_key) = match input.variation {
            Some(variation) => (variation.id.clone(), variation.key.clone()),
            None => (String::new(), String::new()),
        };

        UserEvent {
            uuid: Uuid::new_v4().to_string(),
            timestamp: Self::now(),
            visitor_id: user_id.to_string(),
            attributes: visitor_attributes(config, attributes),
            context: self.context(config),
            payload: EventPayload::Impression(ImpressionEvent {
                campaign_id,
                experiment_id,
                variation_id,
                metadata: DecisionMetadata {
                    flag_key: input.flag_key.to_string(),
                    rule_key,
                    rule_type: input.rule_type.to_string(),
                    variation_key,
                    enabled: input.enabled,
                    cmab_uuid: input.cmab_uuid.map(str::to_owned),
                },
            }),
        }
    }

    pub fn new_conversion(
        &self,
        config: &ProjectConfig,
        event: &EventType,
        user_id: &str,
        attributes: &HashMap<String, Value>,
        tags: &HashMap<String, Value>,
    ) -> UserEvent {
        UserEvent {
            uuid: Uuid::new_v4().to_string(),
            timestamp: Self::now(),
            visitor_id: user_id.to_string(),
            attributes: visitor_attributes(config, attributes),
            context: self.context(config),
            payload: EventPayload::Conversion(ConversionEvent {
                entity_id: event.id.clone(),
                key: event.key.clone(),
                tags: tags.clone(),
                revenue: tags.get(REVENUE_TAG).and_then(revenue_value),
                value: tags.get(VALUE_TAG).and_then(numeric_value),
            }),
        }
    }
}

fn revenue_value(tag: &Value) -> Option<i64> {
    match tag.as_i64() {
        Some(revenue) => Some(revenue),
        None => tag
            .as_f64()
            .filter(|n| n.is_finite() && n.fract() == 0.0)
            .map(|n| n as i64),
    }
}

fn numeric_value(tag: &Value) -> Option<f64> {
    match tag {
        Value::Number(n) => n.as_f64().filter(|n| n.is_finite()),
        Value::String(s) => s.parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

/// Attributes reported with an event: only attributes declared in the datafile or reserved
/// `$opt_` attributes, holding scalar values. Sorted by key.
fn visitor_attributes(
    config: &ProjectConfig,
    attributes: &HashMap<String, Value>,
) -> Vec<VisitorAttribute> {
    let mut result: Vec<VisitorAttribute> = attributes
        .iter()
        .filter_map(|(key, value)| {
            let valid_value = match value {
                Value::String(_) | Value::Bool(_) => true,
                Value::Number(n) => n.as_f64().map(f64::is_finite).unwrap_or(false),
                _ => false,
            };
            if !valid_value {
                debug!("Attribute ({}) has an unsupported value and is not sent", key);
                return None;
            }

            let entity_id = match config.attribute_id(key) {
                Some(id) => id.to_string(),
                None if key.starts_with(RESERVED_ATTRIBUTE_PREFIX) => key.clone(),
                None => {
                    debug!("Attribute ({}) is not in the datafile and is not sent", key);
                    return None;
                }
            };

            Some(VisitorAttribute {
                entity_id,
                key: key.clone(),
                attribute_type: CUSTOM_ATTRIBUTE_TYPE.to_string(),
                value: value.clone(),
            })
        })
        .collect();
    result.sort_by(|a, b| a.key.cmp(&b.key));

    if let Some(bot_filtering) = config.bot_filtering() {
        result.push(VisitorAttribute {
            entity_id: BOT_FILTERING_ATTRIBUTE.to_string(),
            key: BOT_FILTERING_ATTRIBUTE.to_string(),
            attribute_type: CUSTOM_ATTRIBUTE_TYPE.to_string(),
            value: Value::Bool(bot_filtering),
        });
    }
    result
}
