use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Per-call switches accepted by the decide APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecideOption {
    /// Do not emit an impression event.
    DisableDecisionEvent,
    /// Omit disabled flags from batch decisions.
    EnabledFlagsOnly,
    /// Neither read nor write the user profile service.
    IgnoreUserProfileService,
    /// Include informational reasons in the decision.
    IncludeReasons,
    /// Do not resolve variable values.
    ExcludeVariables,
    /// Bypass the CMAB cache without writing to it.
    IgnoreCmabCache,
    /// Clear the whole CMAB cache before deciding.
    ResetCmabCache,
    /// Drop the CMAB cache entries of this user before deciding.
    InvalidateUserCmabCache,
}

impl FromStr for DecideOption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown decide option: {}", s))
    }
}

/// Effective option set of a decide call.
///
/// Client defaults and per-call options combine field by field with OR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecideOptions {
    pub disable_decision_event: bool,
    pub enabled_flags_only: bool,
    pub ignore_user_profile_service: bool,
    pub include_reasons: bool,
    pub exclude_variables: bool,
    pub ignore_cmab_cache: bool,
    pub reset_cmab_cache: bool,
    pub invalidate_user_cmab_cache: bool,
}

impl DecideOptions {
    pub fn from_options(options: &[DecideOption]) -> Self {
        let mut result = Self::default();
        for option in options {
            match option {
                DecideOption::DisableDecisionEvent => result.disable_decision_event = true,
                DecideOption::EnabledFlagsOnly => result.enabled_flags_only = true,
                DecideOption::IgnoreUserProfileService => {
                    result.ignore_user_profile_service = true
                }
                DecideOption::IncludeReasons => result.include_reasons = true,
                DecideOption::ExcludeVariables => result.exclude_variables = true,
                DecideOption::IgnoreCmabCache => result.ignore_cmab_cache = true,
                DecideOption::ResetCmabCache => result.reset_cmab_cache = true,
                DecideOption::InvalidateUserCmabCache => result.invalidate_user_cmab_cache = true,
            }
        }
        result
    }

    pub fn merge(&self, other: &DecideOptions) -> Self {
        Self {
            disable_decision_event: self.disable_decision_event || other.disable_decision_event,
            enabled_flags_only: self.enabled_flags_only || other.enabled_flags_only,
            ignore_user_profile_service: self.ignore_user_profile_service
                || other.ignore_user_profile_service,
            include_reasons: self.include_reasons || other.include_reasons,
            exclude_variables: self.exclude_variables || other.exclude_variables,
            ignore_cmab_cache: self.ignore_cmab_cache || other.ignore_cmab_cache,
            reset_cmab_cache: self.reset_cmab_cache || other.reset_cmab_cache,
            invalidate_user_cmab_cache: self.invalidate_user_cmab_cache
                || other.invalidate_user_cmab_cache,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("DISABLE_DECISION_EVENT", DecideOption::DisableDecisionEvent)]
    #[test_case("ENABLED_FLAGS_ONLY", DecideOption::EnabledFlagsOnly)]
    #[test_case("IGNORE_USER_PROFILE_SERVICE", DecideOption::IgnoreUserProfileService)]
    #[test_case("INCLUDE_REASONS", DecideOption::IncludeReasons)]
    #[test_case("EXCLUDE_VARIABLES", DecideOption::ExcludeVariables)]
    #[test_case("IGNORE_CMAB_CACHE", DecideOption::IgnoreCmabCache)]
    #[test_case("RESET_CMAB_CACHE", DecideOption::ResetCmabCache)]
    #[test_case("INVALIDATE_USER_CMAB_CACHE", DecideOption::InvalidateUserCmabCache)]
    fn parses_option_names(name: &str, expected: DecideOption) {
        assert_eq!(name.parse::<DecideOption>(), Ok(expected));
    }

    #[test]
    fn rejects_unknown_option_names() {
        assert!("SOMETHING_ELSE".parse::<DecideOption>().is_err());
    }

    #[test]
    fn merge_is_field_wise_or() {
        let defaults = DecideOptions::from_options(&[DecideOption::IncludeReasons]);
        let call = DecideOptions::from_options(&[DecideOption::DisableDecisionEvent]);
        let merged = defaults.merge(&call);

        assert!(merged.include_reasons);
        assert!(merged.disable_decision_event);
        assert!(!merged.exclude_variables);
        assert_eq!(merged, call.merge(&defaults));
    }
}
