//! Leaf predicates of audience conditions.

use std::cmp::Ordering;

use serde_json::Value;

use crate::project_config::conditions::UserCondition;

use super::audience::Tri;
use super::semver::compare_versions;
use super::DecisionUser;

const CUSTOM_ATTRIBUTE_TYPE: &str = "custom_attribute";
const THIRD_PARTY_DIMENSION_TYPE: &str = "third_party_dimension";

// Largest integer an f64 represents exactly.
const MAX_SAFE_NUMBER: f64 = 9_007_199_254_740_992.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchType {
    Exact,
    Exists,
    Substring,
    Gt,
    Ge,
    Lt,
    Le,
    SemverEq,
    SemverGt,
    SemverGe,
    SemverLt,
    SemverLe,
    Qualified,
}

impl MatchType {
    fn parse(match_type: Option<&str>) -> Option<Self> {
        Some(match match_type {
            // Legacy audiences omit the match type and mean exact.
            None | Some("exact") => Self::Exact,
            Some("exists") => Self::Exists,
            Some("substring") => Self::Substring,
            Some("gt") => Self::Gt,
            Some("ge") => Self::Ge,
            Some("lt") => Self::Lt,
            Some("le") => Self::Le,
            Some("semver_eq") => Self::SemverEq,
            Some("semver_gt") => Self::SemverGt,
            Some("semver_ge") => Self::SemverGe,
            Some("semver_lt") => Self::SemverLt,
            Some("semver_le") => Self::SemverLe,
            Some("qualified") => Self::Qualified,
            Some(_) => return None,
        })
    }
}

fn finite_number(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .filter(|n| n.is_finite() && n.abs() <= MAX_SAFE_NUMBER)
}

/// Evaluates one condition against the user.
pub fn evaluate_condition(condition: &UserCondition, user: &DecisionUser) -> Tri {
    if condition.condition_type != CUSTOM_ATTRIBUTE_TYPE
        && condition.condition_type != THIRD_PARTY_DIMENSION_TYPE
    {
        warn!(
            "Audience condition has an unknown condition type ({})",
            condition.condition_type
        );
        return Tri::Unknown;
    }

    let match_type = match MatchType::parse(condition.match_type.as_deref()) {
        Some(match_type) => match_type,
        None => {
            warn!(
                "Audience condition uses an unknown match type ({:?})",
                condition.match_type
            );
            return Tri::Unknown;
        }
    };

    if match_type == MatchType::Qualified {
        return qualified(condition, user);
    }

    let attribute = user.attributes.get(&condition.name);
    if match_type == MatchType::Exists {
        return Tri::from(!matches!(attribute, None | Some(Value::Null)));
    }

    let attribute = match attribute {
        None | Some(Value::Null) => {
            debug!(
                "Audience condition on attribute ({}) evaluated to UNKNOWN: no value for user ({})",
                condition.name, user.user_id
            );
            return Tri::Unknown;
        }
        Some(value) => value,
    };

    match match_type {
        MatchType::Exact => exact(condition, attribute),
        MatchType::Substring => match (attribute.as_str(), condition.value.as_str()) {
            (Some(haystack), Some(needle)) => Tri::from(haystack.contains(needle)),
            _ => mismatch(condition, attribute),
        },
        MatchType::Gt | MatchType::Ge | MatchType::Lt | MatchType::Le => {
            match (finite_number(attribute), finite_number(&condition.value)) {
                (Some(user_value), Some(target)) => Tri::from(match match_type {
                    MatchType::Gt => user_value > target,
                    MatchType::Ge => user_value >= target,
                    MatchType::Lt => user_value < target,
                    _ => user_value <= target,
                }),
                _ => mismatch(condition, attribute),
            }
        }
        _ => semver(match_type, condition, attribute),
    }
}

fn exact(condition: &UserCondition, attribute: &Value) -> Tri {
    match (&condition.value, attribute) {
        (Value::String(target), Value::String(user_value)) => Tri::from(target == user_value),
        (Value::Bool(target), Value::Bool(user_value)) => Tri::from(target == user_value),
        (Value::Number(_), Value::Number(_)) => {
            match (finite_number(attribute), finite_number(&condition.value)) {
                (Some(user_value), Some(target)) => Tri::from(user_value == target),
                _ => mismatch(condition, attribute),
            }
        }
        _ => mismatch(condition, attribute),
    }
}

fn semver(match_type: MatchType, condition: &UserCondition, attribute: &Value) -> Tri {
    let ordering = match (attribute.as_str(), condition.value.as_str()) {
        (Some(user_version), Some(target)) => compare_versions(user_version, target),
        _ => None,
    };
    let ordering = match ordering {
        Some(ordering) => ordering,
        None => return mismatch(condition, attribute),
    };

    Tri::from(match match_type {
        MatchType::SemverEq => ordering == Ordering::Equal,
        MatchType::SemverGt => ordering == Ordering::Greater,
        MatchType::SemverGe => ordering != Ordering::Less,
        MatchType::SemverLt => ordering == Ordering::Less,
        _ => ordering != Ordering::Greater,
    })
}

fn qualified(condition: &UserCondition, user: &DecisionUser) -> Tri {
    let segment = match condition.value.as_str() {
        Some(segment) => segment,
        None => return Tri::Unknown,
    };
    match &user.qualified_segments {
        Some(segments) => Tri::from(segments.iter().any(|s| s == segment)),
        None => Tri::False,
    }
}

fn mismatch(condition: &UserCondition, attribute: &Value) -> Tri {
    warn!(
        "Audience condition on attribute ({}) evaluated to UNKNOWN: value {} is not applicable to condition value {}",
        condition.name, attribute, condition.value
    );
    Tri::Unknown
}
