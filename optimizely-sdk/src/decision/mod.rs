//! The decision engine: given a flag and a user, which variation applies and why.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::project_config::{Experiment, Variation};

pub mod audience;
pub mod bucketer;
pub mod cmab;
pub mod forced_decisions;
pub mod matchers;
pub mod options;
pub mod reasons;
pub mod semver;
pub mod service;
pub mod user_profile;

use forced_decisions::{DecisionContext, ForcedDecision};
use reasons::DecisionReasons;

/// Reserved attribute overriding the id used for bucketing.
pub const BUCKETING_ID_ATTRIBUTE: &str = "$opt_bucketing_id";
/// Reserved attribute reporting whether bot filtering is active.
pub const BOT_FILTERING_ATTRIBUTE: &str = "$opt_bot_filtering";
/// Reserved attribute carrying the user agent, used by bot filtering.
pub const USER_AGENT_ATTRIBUTE: &str = "$opt_user_agent";

/// A point in time copy of the user data a decision is evaluated against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecisionUser {
    pub user_id: String,
    pub attributes: HashMap<String, Value>,
    /// `None` until segments have been fetched or set.
    pub qualified_segments: Option<Vec<String>>,
    pub forced_decisions: HashMap<DecisionContext, ForcedDecision>,
}

impl DecisionUser {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    /// The id hashed by the bucketer: `$opt_bucketing_id` when it is a string, the user id
    /// otherwise.
    pub fn bucketing_id(&self, reasons: &mut DecisionReasons) -> String {
        match self.attributes.get(BUCKETING_ID_ATTRIBUTE) {
            Some(Value::String(id)) => id.clone(),
            Some(_) => {
                reasons.add_info(format!(
                    "Bucketing ID attribute is not a string. Defaulted to user id ({}).",
                    self.user_id
                ));
                self.user_id.clone()
            }
            None => self.user_id.clone(),
        }
    }
}

/// Where a flag decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    FeatureTest,
    Rollout,
}

impl DecisionSource {
    /// Value reported as `rule_type` in impression metadata.
    pub fn rule_type(&self) -> &'static str {
        match self {
            DecisionSource::FeatureTest => "feature-test",
            DecisionSource::Rollout => "rollout",
        }
    }
}

/// Outcome of evaluating a single flag.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureDecision {
    /// The rule that produced the variation, if any.
    pub experiment: Option<Arc<Experiment>>,
    pub variation: Option<Variation>,
    pub source: DecisionSource,
    pub cmab_uuid: Option<String>,
}

impl FeatureDecision {
    pub fn miss() -> Self {
        Self {
            experiment: None,
            variation: None,
            source: DecisionSource::Rollout,
            cmab_uuid: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.variation
            .as_ref()
            .map(|v| v.feature_enabled)
            .unwrap_or(false)
    }

    pub fn rule_key(&self) -> &str {
        self.experiment.as_ref().map(|e| e.key.as_str()).unwrap_or("")
    }
}

/// Variation chosen within one experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentDecision {
    pub variation: Variation,
    pub cmab_uuid: Option<String>,
}
