use std::collections::HashMap;

use crate::project_config::{ProjectConfig, Variation};

use super::reasons::DecisionReasons;

/// Identifies what a forced decision applies to: a whole flag, or one rule of a flag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecisionContext {
    pub flag_key: String,
    pub rule_key: Option<String>,
}

impl DecisionContext {
    /// An empty rule key is the same as no rule key.
    pub fn new(flag_key: impl Into<String>, rule_key: Option<&str>) -> Self {
        Self {
            flag_key: flag_key.into(),
            rule_key: rule_key.filter(|r| !r.is_empty()).map(str::to_owned),
        }
    }

    fn describe(&self) -> String {
        match &self.rule_key {
            Some(rule_key) => format!("flag ({}), rule ({})", self.flag_key, rule_key),
            None => format!("flag ({})", self.flag_key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForcedDecision {
    pub variation_key: String,
}

impl ForcedDecision {
    pub fn new(variation_key: impl Into<String>) -> Self {
        Self {
            variation_key: variation_key.into(),
        }
    }
}

/// Resolves a forced decision to a variation of the flag in the current configuration.
pub(crate) fn find_validated_forced_decision(
    config: &ProjectConfig,
    forced_decisions: &HashMap<DecisionContext, ForcedDecision>,
    context: &DecisionContext,
    user_id: &str,
    reasons: &mut DecisionReasons,
) -> Option<Variation> {
    let forced = forced_decisions.get(context)?;

    match config.flag_variation_by_key(&context.flag_key, &forced.variation_key) {
        Some(variation) => {
            reasons.add_info(format!(
                "Variation ({}) is mapped to {} and user ({}) in the forced decision map",
                variation.key,
                context.describe(),
                user_id
            ));
            Some(variation.clone())
        }
        None => {
            reasons.add_error(format!(
                "Invalid variation is mapped to {} and user ({}) in the forced decision map",
                context.describe(),
                user_id
            ));
            None
        }
    }
}
