//! The parsed, indexed and immutable form of a datafile.
//!
//! A [ProjectConfig] is built once per datafile revision and then shared behind an [Arc] by every
//! decision made against that revision. It is never mutated; a new revision produces a new value.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod conditions;
pub(crate) mod datafile;

use conditions::{
    parse_audience_conditions, parse_audience_id_conditions, ConditionTree, UserCondition,
};
use datafile::{Datafile, ExperimentData, TrafficAllocationData, VariationData};

const SUPPORTED_VERSIONS: [&str; 3] = ["2", "3", "4"];
const RUNNING_STATUS: &str = "Running";
const ODP_INTEGRATION_KEY: &str = "odp";
const QUALIFIED_MATCH_TYPE: &str = "qualified";

/// Error type used to represent problems obtaining or parsing a project configuration.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No datafile has been successfully loaded yet.
    #[error("Optimizely SDK not configured properly yet.")]
    NotReady,

    /// The datafile could not be parsed.
    #[error("invalid datafile: {0}")]
    InvalidDatafile(String),

    /// The datafile declares a schema version this SDK does not understand.
    #[error("unsupported datafile version: {0}")]
    UnsupportedVersion(String),
}

/// The region hosting the event endpoint for a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Region {
    #[default]
    US,
    EU,
}

/// A single bucketing slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficAllocation {
    pub entity_id: String,
    pub end_of_range: u32,
}

impl From<&TrafficAllocationData> for TrafficAllocation {
    fn from(data: &TrafficAllocationData) -> Self {
        Self {
            entity_id: data.entity_id.clone(),
            end_of_range: data.end_of_range,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variation {
    pub id: String,
    pub key: String,
    pub feature_enabled: bool,
    /// Variable values keyed by variable id.
    pub variables: HashMap<String, String>,
}

impl From<&VariationData> for Variation {
    fn from(data: &VariationData) -> Self {
        Self {
            id: data.id.clone(),
            key: data.key.clone(),
            feature_enabled: data.feature_enabled.unwrap_or(false),
            variables: data
                .variables
                .iter()
                .map(|v| (v.id.clone(), v.value.clone()))
                .collect(),
        }
    }
}

/// Contextual multi-armed bandit settings attached to an experiment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmab {
    pub attribute_ids: Vec<String>,
    pub traffic_allocation: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    pub id: String,
    pub key: String,
    pub layer_id: String,
    pub status: String,
    pub variations: Vec<Variation>,
    pub traffic_allocation: Vec<TrafficAllocation>,
    /// `None` means the experiment is open to everyone.
    pub audience_conditions: Option<ConditionTree<String>>,
    /// Whitelisted users, user id to variation key.
    pub forced_variations: HashMap<String, String>,
    pub group_id: Option<String>,
    pub cmab: Option<Cmab>,
}

impl Experiment {
    pub fn is_running(&self) -> bool {
        self.status == RUNNING_STATUS
    }

    pub fn variation_by_id(&self, id: &str) -> Option<&Variation> {
        self.variations.iter().find(|v| v.id == id)
    }

    pub fn variation_by_key(&self, key: &str) -> Option<&Variation> {
        self.variations.iter().find(|v| v.key == key)
    }

    fn from_data(data: &ExperimentData, group_id: Option<&str>) -> Result<Self, ConfigError> {
        let audience_conditions = match &data.audience_conditions {
            Some(serde_json::Value::Array(items)) if items.is_empty() => None,
            Some(value) => Some(parse_audience_id_conditions(value).map_err(|e| {
                ConfigError::InvalidDatafile(format!(
                    "experiment {} has invalid audience conditions: {}",
                    data.key, e
                ))
            })?),
            None if data.audience_ids.is_empty() => None,
            None => Some(ConditionTree::Or(
                data.audience_ids
                    .iter()
                    .map(|id| ConditionTree::Leaf(id.clone()))
                    .collect(),
            )),
        };

        Ok(Self {
            id: data.id.clone(),
            key: data.key.clone(),
            layer_id: data.layer_id.clone(),
            status: data.status.clone(),
            variations: data.variations.iter().map(Variation::from).collect(),
            traffic_allocation: data
                .traffic_allocation
                .iter()
                .map(TrafficAllocation::from)
                .collect(),
            audience_conditions,
            forced_variations: data.forced_variations.clone(),
            group_id: group_id.map(str::to_owned),
            cmab: data.cmab.as_ref().map(|cmab| Cmab {
                attribute_ids: cmab.attribute_ids.clone(),
                traffic_allocation: cmab.traffic_allocation,
            }),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPolicy {
    Random,
    Overlapping,
}

/// A mutually exclusive group of experiments.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub id: String,
    pub policy: GroupPolicy,
    pub traffic_allocation: Vec<TrafficAllocation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    Boolean,
    Integer,
    Double,
    String,
    Json,
}

impl VariableType {
    fn parse(variable_type: &str, sub_type: Option<&str>) -> Option<Self> {
        match (variable_type, sub_type) {
            ("string", Some("json")) | ("json", _) => Some(Self::Json),
            ("boolean", _) => Some(Self::Boolean),
            ("integer", _) => Some(Self::Integer),
            ("double", _) => Some(Self::Double),
            ("string", _) => Some(Self::String),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVariable {
    pub id: String,
    pub key: String,
    pub variable_type: VariableType,
    pub default_value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureFlag {
    pub id: String,
    pub key: String,
    pub rollout_id: String,
    pub experiment_ids: Vec<String>,
    pub variables: Vec<FeatureVariable>,
}

impl FeatureFlag {
    pub fn variable_by_key(&self, key: &str) -> Option<&FeatureVariable> {
        self.variables.iter().find(|v| v.key == key)
    }
}

/// An ordered list of targeting rules; the last one is the "everyone else" rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Rollout {
    pub id: String,
    pub experiments: Vec<Arc<Experiment>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Audience {
    pub id: String,
    pub name: String,
    pub conditions: ConditionTree<UserCondition>,
}

/// A conversion event declared in the datafile.
#[derive(Debug, Clone, PartialEq)]
pub struct EventType {
    pub id: String,
    pub key: String,
    pub experiment_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct OdpIntegration {
    pub public_key: Option<String>,
    pub host: Option<String>,
    pub segments_to_check: Vec<String>,
}

impl OdpIntegration {
    pub fn is_integrated(&self) -> bool {
        self.public_key.is_some() && self.host.is_some()
    }
}

/// Immutable, indexed snapshot of one datafile revision.
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    datafile: String,
    version: String,
    revision: String,
    account_id: String,
    project_id: String,
    anonymize_ip: bool,
    bot_filtering: Option<bool>,
    send_flag_decisions: bool,
    region: Region,
    sdk_key: Option<String>,
    environment_key: Option<String>,
    experiments_by_id: HashMap<String, Arc<Experiment>>,
    experiment_ids_by_key: HashMap<String, String>,
    groups_by_id: HashMap<String, Group>,
    features_by_key: HashMap<String, FeatureFlag>,
    feature_keys: Vec<String>,
    rollouts_by_id: HashMap<String, Rollout>,
    attributes_by_key: HashMap<String, String>,
    attribute_keys_by_id: HashMap<String, String>,
    audiences_by_id: HashMap<String, Audience>,
    events_by_key: HashMap<String, EventType>,
    experiment_feature_map: HashMap<String, Vec<String>>,
    flag_variations: HashMap<String, Vec<Variation>>,
    odp: OdpIntegration,
}

impl ProjectConfig {
    /// Parses and indexes a datafile.
    pub fn from_datafile(datafile: impl AsRef<[u8]>) -> Result<Self, ConfigError> {
        let bytes = datafile.as_ref();
        let parsed: Datafile = serde_json::from_slice(bytes)
            .map_err(|e| ConfigError::InvalidDatafile(e.to_string()))?;

        if !SUPPORTED_VERSIONS.contains(&parsed.version.as_str()) {
            return Err(ConfigError::UnsupportedVersion(parsed.version));
        }

        let raw = String::from_utf8_lossy(bytes).into_owned();
        Self::index(parsed, raw)
    }

    fn index(datafile: Datafile, raw: String) -> Result<Self, ConfigError> {
        let mut experiments_by_id = HashMap::new();
        let mut groups_by_id = HashMap::new();

        for data in &datafile.experiments {
            let experiment = Experiment::from_data(data, None)?;
            experiments_by_id.insert(experiment.id.clone(), Arc::new(experiment));
        }

        for group in &datafile.groups {
            let policy = match group.policy.as_str() {
                "overlapping" => GroupPolicy::Overlapping,
                _ => GroupPolicy::Random,
            };
            for data in &group.experiments {
                let experiment = Experiment::from_data(data, Some(&group.id))?;
                experiments_by_id.insert(experiment.id.clone(), Arc::new(experiment));
            }
            groups_by_id.insert(
                group.id.clone(),
                Group {
                    id: group.id.clone(),
                    policy,
                    traffic_allocation: group
                        .traffic_allocation
                        .iter()
                        .map(TrafficAllocation::from)
                        .collect(),
                },
            );
        }

        let experiment_ids_by_key = experiments_by_id
            .values()
            .map(|e| (e.key.clone(), e.id.clone()))
            .collect();

        let mut rollouts_by_id = HashMap::new();
        for rollout in &datafile.rollouts {
            let experiments = rollout
                .experiments
                .iter()
                .map(|data| Experiment::from_data(data, None).map(Arc::new))
                .collect::<Result<Vec<_>, _>>()?;
            rollouts_by_id.insert(
                rollout.id.clone(),
                Rollout {
                    id: rollout.id.clone(),
                    experiments,
                },
            );
        }

        let mut audiences_by_id = HashMap::new();
        // Typed audiences take precedence over legacy audiences sharing an id.
        for audience in datafile.audiences.iter().chain(&datafile.typed_audiences) {
            match parse_audience_conditions(&audience.conditions) {
                Ok(conditions) => {
                    audiences_by_id.insert(
                        audience.id.clone(),
                        Audience {
                            id: audience.id.clone(),
                            name: audience.name.clone(),
                            conditions,
                        },
                    );
                }
                Err(e) => warn!("Skipping audience {} with invalid conditions: {}", audience.id, e),
            }
        }

        let mut features_by_key = HashMap::new();
        let mut feature_keys = Vec::with_capacity(datafile.feature_flags.len());
        let mut experiment_feature_map: HashMap<String, Vec<String>> = HashMap::new();
        let mut flag_variations = HashMap::new();

        for flag in &datafile.feature_flags {
            let variables = flag
                .variables
                .iter()
                .filter_map(|v| {
                    match VariableType::parse(&v.variable_type, v.sub_type.as_deref()) {
                        Some(variable_type) => Some(FeatureVariable {
                            id: v.id.clone(),
                            key: v.key.clone(),
                            variable_type,
                            default_value: v.default_value.clone(),
                        }),
                        None => {
                            warn!(
                                "Ignoring variable {} of flag {} with unknown type {}",
                                v.key, flag.key, v.variable_type
                            );
                            None
                        }
                    }
                })
                .collect();

            for experiment_id in &flag.experiment_ids {
                experiment_feature_map
                    .entry(experiment_id.clone())
                    .or_default()
                    .push(flag.key.clone());
            }

            let mut seen = HashSet::new();
            let mut variations = Vec::new();
            let experiment_rules = flag
                .experiment_ids
                .iter()
                .filter_map(|id| experiments_by_id.get(id));
            let rollout_rules = rollouts_by_id
                .get(&flag.rollout_id)
                .into_iter()
                .flat_map(|r: &Rollout| r.experiments.iter());
            for rule in experiment_rules.chain(rollout_rules) {
                for variation in &rule.variations {
                    if seen.insert(variation.id.clone()) {
                        variations.push(variation.clone());
                    }
                }
            }
            flag_variations.insert(flag.key.clone(), variations);

            feature_keys.push(flag.key.clone());
            features_by_key.insert(
                flag.key.clone(),
                FeatureFlag {
                    id: flag.id.clone(),
                    key: flag.key.clone(),
                    rollout_id: flag.rollout_id.clone(),
                    experiment_ids: flag.experiment_ids.clone(),
                    variables,
                },
            );
        }

        let attributes_by_key = datafile
            .attributes
            .iter()
            .map(|a| (a.key.clone(), a.id.clone()))
            .collect();
        let attribute_keys_by_id = datafile
            .attributes
            .iter()
            .map(|a| (a.id.clone(), a.key.clone()))
            .collect();

        let events_by_key = datafile
            .events
            .iter()
            .map(|e| {
                (
                    e.key.clone(),
                    EventType {
                        id: e.id.clone(),
                        key: e.key.clone(),
                        experiment_ids: e.experiment_ids.clone(),
                    },
                )
            })
            .collect();

        let mut odp = datafile
            .integrations
            .iter()
            .find(|i| i.key == ODP_INTEGRATION_KEY)
            .map(|i| OdpIntegration {
                public_key: i.public_key.clone(),
                host: i.host.clone(),
                segments_to_check: Vec::new(),
            })
            .unwrap_or_default();
        odp.segments_to_check = segments_to_check(&audiences_by_id);

        let region = match datafile.region.as_deref() {
            Some("EU") => Region::EU,
            _ => Region::US,
        };

        Ok(Self {
            datafile: raw,
            version: datafile.version,
            revision: datafile.revision,
            account_id: datafile.account_id,
            project_id: datafile.project_id,
            anonymize_ip: datafile.anonymize_ip,
            bot_filtering: datafile.bot_filtering,
            send_flag_decisions: datafile.send_flag_decisions,
            region,
            sdk_key: datafile.sdk_key,
            environment_key: datafile.environment_key,
            experiments_by_id,
            experiment_ids_by_key,
            groups_by_id,
            features_by_key,
            feature_keys,
            rollouts_by_id,
            attributes_by_key,
            attribute_keys_by_id,
            audiences_by_id,
            events_by_key,
            experiment_feature_map,
            flag_variations,
            odp,
        })
    }

    /// The raw datafile this configuration was built from.
    pub fn datafile(&self) -> &str {
        &self.datafile
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn anonymize_ip(&self) -> bool {
        self.anonymize_ip
    }

    pub fn bot_filtering(&self) -> Option<bool> {
        self.bot_filtering
    }

    pub fn send_flag_decisions(&self) -> bool {
        self.send_flag_decisions
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn sdk_key(&self) -> Option<&str> {
        self.sdk_key.as_deref()
    }

    pub fn environment_key(&self) -> Option<&str> {
        self.environment_key.as_deref()
    }

    pub fn experiment_by_id(&self, id: &str) -> Option<&Arc<Experiment>> {
        self.experiments_by_id.get(id)
    }

    pub fn experiment_by_key(&self, key: &str) -> Option<&Arc<Experiment>> {
        self.experiment_ids_by_key
            .get(key)
            .and_then(|id| self.experiments_by_id.get(id))
    }

    pub fn group_by_id(&self, id: &str) -> Option<&Group> {
        self.groups_by_id.get(id)
    }

    pub fn feature_by_key(&self, key: &str) -> Option<&FeatureFlag> {
        self.features_by_key.get(key)
    }

    /// Flag keys in datafile order.
    pub fn feature_keys(&self) -> &[String] {
        &self.feature_keys
    }

    pub fn rollout_by_id(&self, id: &str) -> Option<&Rollout> {
        self.rollouts_by_id.get(id)
    }

    pub fn attribute_id(&self, key: &str) -> Option<&str> {
        self.attributes_by_key.get(key).map(String::as_str)
    }

    pub fn attribute_key(&self, id: &str) -> Option<&str> {
        self.attribute_keys_by_id.get(id).map(String::as_str)
    }

    pub fn audience_by_id(&self, id: &str) -> Option<&Audience> {
        self.audiences_by_id.get(id)
    }

    pub fn event_by_key(&self, key: &str) -> Option<&EventType> {
        self.events_by_key.get(key)
    }

    /// Keys of the flags that reference the given experiment id.
    pub fn features_for_experiment(&self, experiment_id: &str) -> &[String] {
        self.experiment_feature_map
            .get(experiment_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every variation reachable from a flag, across its experiments and rollout rules.
    pub fn flag_variations(&self, flag_key: &str) -> &[Variation] {
        self.flag_variations
            .get(flag_key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn flag_variation_by_key(&self, flag_key: &str, variation_key: &str) -> Option<&Variation> {
        self.flag_variations(flag_key)
            .iter()
            .find(|v| v.key == variation_key)
    }

    /// Finds the rule (experiment or rollout rule) of a flag with the given key.
    pub fn flag_rule_by_key(&self, flag: &FeatureFlag, rule_key: &str) -> Option<Arc<Experiment>> {
        flag.experiment_ids
            .iter()
            .filter_map(|id| self.experiments_by_id.get(id))
            .chain(
                self.rollouts_by_id
                    .get(&flag.rollout_id)
                    .into_iter()
                    .flat_map(|r| r.experiments.iter()),
            )
            .find(|e| e.key == rule_key)
            .cloned()
    }

    pub fn odp_integration(&self) -> &OdpIntegration {
        &self.odp
    }
}

fn segments_to_check(audiences: &HashMap<String, Audience>) -> Vec<String> {
    let mut segments: Vec<String> = audiences
        .values()
        .flat_map(|audience| audience.conditions.leaves())
        .filter(|leaf| leaf.match_type.as_deref() == Some(QUALIFIED_MATCH_TYPE))
        .filter_map(|leaf| leaf.value.as_str().map(str::to_owned))
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    segments.sort();
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_common::{datafile_with_everything, DATAFILE_S1};
    use test_case::test_case;

    #[test]
    fn parses_and_indexes_datafile() {
        let config = ProjectConfig::from_datafile(datafile_with_everything())
            .expect("datafile should parse");

        assert_eq!(config.revision(), "101");
        assert_eq!(config.account_id(), "account-1");
        assert_eq!(config.project_id(), "project-1");
        assert!(config.send_flag_decisions());
        assert_eq!(config.region(), Region::US);

        let experiment = config.experiment_by_key("exp_with_audience").unwrap();
        assert!(experiment.is_running());
        assert_eq!(experiment.variation_by_key("a").unwrap().id, "10001");
        assert!(experiment.audience_conditions.is_some());

        let grouped = config.experiment_by_key("group_exp_1").unwrap();
        assert_eq!(grouped.group_id.as_deref(), Some("group-1"));
        assert_eq!(
            config.group_by_id("group-1").unwrap().policy,
            GroupPolicy::Random
        );

        assert_eq!(config.attribute_id("age"), Some("attr-age"));
        assert_eq!(config.attribute_key("attr-age"), Some("age"));
        assert_eq!(config.event_by_key("purchase").unwrap().id, "event-1");
    }

    #[test]
    fn flag_variations_include_experiments_and_rollout_rules() {
        let config = ProjectConfig::from_datafile(datafile_with_everything()).unwrap();

        let keys: Vec<&str> = config
            .flag_variations("feature_1")
            .iter()
            .map(|v| v.key.as_str())
            .collect();
        assert!(keys.contains(&"a"));
        assert!(keys.contains(&"b"));
        assert!(keys.contains(&"rollout_on"));

        let flag = config.feature_by_key("feature_1").unwrap();
        assert_eq!(
            config.flag_rule_by_key(flag, "everyone_else").unwrap().id,
            "rule-2"
        );
        assert!(config.flag_rule_by_key(flag, "unknown").is_none());
    }

    #[test]
    fn audience_ids_become_or_condition_when_conditions_absent() {
        let config = ProjectConfig::from_datafile(datafile_with_everything()).unwrap();
        let experiment = config.experiment_by_key("exp_with_audience_ids").unwrap();

        assert_eq!(
            experiment.audience_conditions,
            Some(ConditionTree::Or(vec![ConditionTree::Leaf(
                "aud-adult".to_string()
            )]))
        );
    }

    #[test]
    fn odp_segments_are_collected_from_audiences() {
        let config = ProjectConfig::from_datafile(datafile_with_everything()).unwrap();
        let odp = config.odp_integration();

        assert!(odp.is_integrated());
        assert_eq!(odp.segments_to_check, vec!["vip".to_string()]);
    }

    #[test_case("1"; "version one")]
    #[test_case("5"; "version five")]
    fn rejects_unsupported_versions(version: &str) {
        let datafile = DATAFILE_S1.replace("\"version\": \"4\"", &format!("\"version\": \"{}\"", version));
        let result = ProjectConfig::from_datafile(datafile);
        assert_eq!(
            result.unwrap_err(),
            ConfigError::UnsupportedVersion(version.to_string())
        );
    }

    #[test]
    fn rejects_invalid_json() {
        let result = ProjectConfig::from_datafile("{not json");
        assert!(matches!(result, Err(ConfigError::InvalidDatafile(_))));
    }

    #[test]
    fn eu_region_is_recognised() {
        let datafile = DATAFILE_S1.replace("\"region\": \"US\"", "\"region\": \"EU\"");
        let config = ProjectConfig::from_datafile(datafile).unwrap();
        assert_eq!(config.region(), Region::EU);
    }
}
