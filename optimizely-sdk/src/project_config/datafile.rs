//! Wire model of the JSON datafile. These types mirror the document exactly and are converted into
//! the indexed [crate::ProjectConfig] once parsing succeeds. Unknown fields are ignored.

use std::collections::HashMap;

use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Datafile {
    pub version: String,
    pub revision: String,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default, rename = "anonymizeIP")]
    pub anonymize_ip: bool,
    #[serde(default)]
    pub bot_filtering: Option<bool>,
    #[serde(default)]
    pub send_flag_decisions: bool,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub sdk_key: Option<String>,
    #[serde(default)]
    pub environment_key: Option<String>,
    #[serde(default)]
    pub experiments: Vec<ExperimentData>,
    #[serde(default)]
    pub groups: Vec<GroupData>,
    #[serde(default)]
    pub feature_flags: Vec<FeatureFlagData>,
    #[serde(default)]
    pub rollouts: Vec<RolloutData>,
    #[serde(default)]
    pub attributes: Vec<AttributeData>,
    #[serde(default)]
    pub audiences: Vec<AudienceData>,
    #[serde(default)]
    pub typed_audiences: Vec<AudienceData>,
    #[serde(default)]
    pub events: Vec<EventData>,
    #[serde(default)]
    pub integrations: Vec<IntegrationData>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExperimentData {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub layer_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub variations: Vec<VariationData>,
    #[serde(default)]
    pub traffic_allocation: Vec<TrafficAllocationData>,
    #[serde(default)]
    pub audience_ids: Vec<String>,
    #[serde(default)]
    pub audience_conditions: Option<serde_json::Value>,
    #[serde(default)]
    pub forced_variations: HashMap<String, String>,
    #[serde(default)]
    pub cmab: Option<CmabData>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VariationData {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub feature_enabled: Option<bool>,
    #[serde(default)]
    pub variables: Vec<VariableValueData>,
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct VariableValueData {
    pub id: String,
    pub value: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TrafficAllocationData {
    pub entity_id: String,
    pub end_of_range: u32,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CmabData {
    #[serde(default)]
    pub attribute_ids: Vec<String>,
    #[serde(default)]
    pub traffic_allocation: u32,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GroupData {
    pub id: String,
    #[serde(default)]
    pub policy: String,
    #[serde(default)]
    pub traffic_allocation: Vec<TrafficAllocationData>,
    #[serde(default)]
    pub experiments: Vec<ExperimentData>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FeatureFlagData {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub rollout_id: String,
    #[serde(default)]
    pub experiment_ids: Vec<String>,
    #[serde(default)]
    pub variables: Vec<VariableData>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VariableData {
    pub id: String,
    pub key: String,
    #[serde(rename = "type")]
    pub variable_type: String,
    #[serde(default)]
    pub sub_type: Option<String>,
    #[serde(default)]
    pub default_value: String,
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct RolloutData {
    pub id: String,
    #[serde(default)]
    pub experiments: Vec<ExperimentData>,
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct AttributeData {
    pub id: String,
    pub key: String,
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct AudienceData {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Either a JSON-encoded string (legacy audiences) or an inline condition array (typed
    /// audiences).
    pub conditions: serde_json::Value,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EventData {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub experiment_ids: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IntegrationData {
    pub key: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_are_ignored() {
        let datafile: Datafile = serde_json::from_str(
            r#"{
                "version": "4",
                "revision": "42",
                "accountId": "a",
                "projectId": "p",
                "someFutureField": {"nested": true},
                "experiments": [{"id": "1", "key": "exp", "unknown": 1}]
            }"#,
        )
        .expect("datafile should parse");

        assert_eq!(datafile.revision, "42");
        assert_eq!(datafile.experiments.len(), 1);
        assert!(!datafile.anonymize_ip);
        assert!(datafile.bot_filtering.is_none());
    }

    #[test]
    fn audience_conditions_accept_strings_and_arrays() {
        let legacy: AudienceData = serde_json::from_str(
            r#"{"id": "1", "name": "a", "conditions": "[\"and\", {\"name\": \"x\"}]"}"#,
        )
        .unwrap();
        assert!(legacy.conditions.is_string());

        let typed: AudienceData = serde_json::from_str(
            r#"{"id": "2", "name": "b", "conditions": ["or", {"name": "x"}]}"#,
        )
        .unwrap();
        assert!(typed.conditions.is_array());
    }
}
