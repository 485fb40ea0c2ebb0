//! Three-valued evaluation of audience condition trees.

use std::fmt;

use crate::project_config::conditions::ConditionTree;
use crate::project_config::ProjectConfig;

use super::matchers::evaluate_condition;
use super::reasons::DecisionReasons;
use super::DecisionUser;

/// Result of evaluating a condition. `Unknown` means the user lacks the data needed to decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tri {
    True,
    False,
    Unknown,
}

impl Tri {
    /// Any `False` wins, then any `Unknown`.
    pub fn and(items: impl IntoIterator<Item = Tri>) -> Tri {
        let mut saw_unknown = false;
        for item in items {
            match item {
                Tri::False => return Tri::False,
                Tri::Unknown => saw_unknown = true,
                Tri::True => {}
            }
        }
        if saw_unknown {
            Tri::Unknown
        } else {
            Tri::True
        }
    }

    /// Any `True` wins, then any `Unknown`.
    pub fn or(items: impl IntoIterator<Item = Tri>) -> Tri {
        let mut saw_unknown = false;
        for item in items {
            match item {
                Tri::True => return Tri::True,
                Tri::Unknown => saw_unknown = true,
                Tri::False => {}
            }
        }
        if saw_unknown {
            Tri::Unknown
        } else {
            Tri::False
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Tri {
        match self {
            Tri::True => Tri::False,
            Tri::False => Tri::True,
            Tri::Unknown => Tri::Unknown,
        }
    }

    pub fn is_true(self) -> bool {
        self == Tri::True
    }
}

impl From<bool> for Tri {
    fn from(value: bool) -> Self {
        if value {
            Tri::True
        } else {
            Tri::False
        }
    }
}

impl fmt::Display for Tri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tri::True => "TRUE",
            Tri::False => "FALSE",
            Tri::Unknown => "UNKNOWN",
        })
    }
}

/// Evaluates a tree, delegating leaves to `leaf`.
pub fn evaluate_tree<L, F>(tree: &ConditionTree<L>, leaf: &mut F) -> Tri
where
    F: FnMut(&L) -> Tri,
{
    match tree {
        ConditionTree::And(children) => {
            Tri::and(children.iter().map(|c| evaluate_tree(c, &mut *leaf)))
        }
        ConditionTree::Or(children) => {
            Tri::or(children.iter().map(|c| evaluate_tree(c, &mut *leaf)))
        }
        ConditionTree::Not(Some(child)) => evaluate_tree(child, leaf).not(),
        ConditionTree::Not(None) => Tri::Unknown,
        ConditionTree::Leaf(value) => leaf(value),
    }
}

/// Decides whether `user` belongs to the audiences gating a rule. A rule without audience
/// conditions admits everyone.
pub fn is_user_in_audience(
    config: &ProjectConfig,
    audience_conditions: Option<&ConditionTree<String>>,
    rule_label: &str,
    user: &DecisionUser,
    reasons: &mut DecisionReasons,
) -> bool {
    let conditions = match audience_conditions {
        Some(conditions) => conditions,
        None => {
            reasons.add_info(format!(
                "Audiences for {} collectively evaluated to TRUE.",
                rule_label
            ));
            return true;
        }
    };

    let result = evaluate_tree(conditions, &mut |audience_id: &String| {
        match config.audience_by_id(audience_id) {
            Some(audience) => {
                let result = evaluate_tree(&audience.conditions, &mut |condition| {
                    evaluate_condition(condition, user)
                });
                debug!("Audience ({}) evaluated to {}.", audience.name, result);
                result
            }
            None => {
                warn!("Audience ({}) is not in the datafile.", audience_id);
                Tri::Unknown
            }
        }
    });

    reasons.add_info(format!(
        "Audiences for {} collectively evaluated to {}.",
        rule_label, result
    ));
    result.is_true()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_common::everything_config;
    use serde_json::json;
    use test_case::test_case;

    #[test_case(Tri::True, Tri::Unknown, Tri::Unknown)]
    #[test_case(Tri::False, Tri::Unknown, Tri::False)]
    #[test_case(Tri::True, Tri::True, Tri::True)]
    fn and_algebra(a: Tri, b: Tri, expected: Tri) {
        assert_eq!(Tri::and([a, b]), expected);
        assert_eq!(Tri::and([b, a]), expected);
    }

    #[test_case(Tri::True, Tri::Unknown, Tri::True)]
    #[test_case(Tri::False, Tri::Unknown, Tri::Unknown)]
    #[test_case(Tri::False, Tri::False, Tri::False)]
    fn or_algebra(a: Tri, b: Tri, expected: Tri) {
        assert_eq!(Tri::or([a, b]), expected);
        assert_eq!(Tri::or([b, a]), expected);
    }

    #[test]
    fn not_algebra() {
        assert_eq!(Tri::Unknown.not(), Tri::Unknown);
        assert_eq!(Tri::True.not(), Tri::False);
        assert_eq!(Tri::False.not(), Tri::True);
    }

    #[test]
    fn evaluates_nested_trees() {
        let tree = ConditionTree::And(vec![
            ConditionTree::Leaf(true),
            ConditionTree::Not(Some(Box::new(ConditionTree::Or(vec![
                ConditionTree::Leaf(false),
                ConditionTree::Leaf(false),
            ])))),
        ]);
        assert_eq!(evaluate_tree(&tree, &mut |leaf| Tri::from(*leaf)), Tri::True);
        assert_eq!(
            evaluate_tree(&ConditionTree::<bool>::Not(None), &mut |leaf| Tri::from(*leaf)),
            Tri::Unknown
        );
    }

    #[test]
    fn experiment_audiences_use_user_attributes() {
        let config = everything_config();
        let experiment = config.experiment_by_key("exp_with_audience").unwrap();
        let conditions = experiment.audience_conditions.as_ref();

        let mut adult = DecisionUser::new("tester");
        adult.attributes.insert("age".to_string(), json!(30));
        let mut minor = DecisionUser::new("tester");
        minor.attributes.insert("age".to_string(), json!(12));
        let unknown = DecisionUser::new("tester");

        let mut reasons = DecisionReasons::new(true);
        assert!(is_user_in_audience(&config, conditions, "experiment", &adult, &mut reasons));
        assert!(!is_user_in_audience(&config, conditions, "experiment", &minor, &mut reasons));
        assert!(!is_user_in_audience(&config, conditions, "experiment", &unknown, &mut reasons));
        assert!(reasons
            .as_slice()
            .iter()
            .any(|r| r == "Audiences for experiment collectively evaluated to UNKNOWN."));
    }

    #[test]
    fn missing_audience_conditions_admit_everyone() {
        let config = everything_config();
        let mut reasons = DecisionReasons::new(false);
        assert!(is_user_in_audience(
            &config,
            None,
            "rule",
            &DecisionUser::new("anyone"),
            &mut reasons
        ));
    }
}
