use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

const AND_OPERATOR: &str = "and";
const OR_OPERATOR: &str = "or";
const NOT_OPERATOR: &str = "not";

/// Error produced while turning a JSON condition document into a [ConditionTree].
#[non_exhaustive]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConditionParseError {
    /// The legacy string encoding of a condition list did not contain valid JSON.
    #[error("condition string is not valid JSON: {0}")]
    InvalidJson(String),

    /// A leaf did not have the expected shape.
    #[error("invalid condition leaf: {0}")]
    InvalidLeaf(String),
}

/// A boolean expression over leaves of type `L`.
///
/// Audience-condition trees carry audience ids as leaves; the condition tree of an individual
/// audience carries [UserCondition]s.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionTree<L> {
    And(Vec<ConditionTree<L>>),
    Or(Vec<ConditionTree<L>>),
    Not(Option<Box<ConditionTree<L>>>),
    Leaf(L),
}

impl<L> ConditionTree<L> {
    /// Visit every leaf in depth-first order.
    pub fn leaves(&self) -> Vec<&L> {
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        leaves
    }

    fn collect_leaves<'a>(&'a self, leaves: &mut Vec<&'a L>) {
        match self {
            ConditionTree::And(children) | ConditionTree::Or(children) => {
                for child in children {
                    child.collect_leaves(leaves);
                }
            }
            ConditionTree::Not(Some(child)) => child.collect_leaves(leaves),
            ConditionTree::Not(None) => {}
            ConditionTree::Leaf(leaf) => leaves.push(leaf),
        }
    }
}

/// A single attribute predicate as found in an audience definition.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserCondition {
    #[serde(rename = "type", default)]
    pub condition_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "match", default)]
    pub match_type: Option<String>,
    #[serde(default)]
    pub value: Value,
}

/// Parses the conditions of one audience. Legacy datafiles encode the list as a JSON string;
/// typed audiences inline it.
pub fn parse_audience_conditions(
    value: &Value,
) -> Result<ConditionTree<UserCondition>, ConditionParseError> {
    let decoded;
    let value = match value {
        Value::String(s) => {
            decoded = serde_json::from_str::<Value>(s)
                .map_err(|e| ConditionParseError::InvalidJson(e.to_string()))?;
            &decoded
        }
        other => other,
    };

    parse_tree(value, &|leaf| {
        serde_json::from_value::<UserCondition>(leaf.clone())
            .map_err(|e| ConditionParseError::InvalidLeaf(e.to_string()))
    })
}

/// Parses the `audienceConditions` of an experiment, whose leaves are audience ids.
pub fn parse_audience_id_conditions(
    value: &Value,
) -> Result<ConditionTree<String>, ConditionParseError> {
    parse_tree(value, &|leaf| match leaf {
        Value::String(id) => Ok(id.clone()),
        other => Err(ConditionParseError::InvalidLeaf(other.to_string())),
    })
}

fn parse_tree<L, F>(value: &Value, parse_leaf: &F) -> Result<ConditionTree<L>, ConditionParseError>
where
    F: Fn(&Value) -> Result<L, ConditionParseError>,
{
    let items = match value {
        Value::Array(items) => items,
        leaf => return parse_leaf(leaf).map(ConditionTree::Leaf),
    };

    let (operator, operands) = match items.first() {
        Some(Value::String(op)) if is_operator(op) => (op.as_str(), &items[1..]),
        _ => (OR_OPERATOR, &items[..]),
    };

    let mut children = operands
        .iter()
        .map(|operand| parse_tree(operand, parse_leaf))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(match operator {
        AND_OPERATOR => ConditionTree::And(children),
        NOT_OPERATOR => {
            if children.is_empty() {
                ConditionTree::Not(None)
            } else {
                ConditionTree::Not(Some(Box::new(children.swap_remove(0))))
            }
        }
        _ => ConditionTree::Or(children),
    })
}

fn is_operator(op: &str) -> bool {
    matches!(op, AND_OPERATOR | OR_OPERATOR | NOT_OPERATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_legacy_string_conditions() {
        let value = json!(
            "[\"and\", [\"or\", [\"or\", {\"name\": \"browser\", \"type\": \"custom_attribute\", \"value\": \"chrome\"}]]]"
        );
        let tree = parse_audience_conditions(&value).expect("should parse");

        let leaves = tree.leaves();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].name, "browser");
        assert_eq!(leaves[0].match_type, None);
        assert!(matches!(tree, ConditionTree::And(_)));
    }

    #[test]
    fn missing_operator_defaults_to_or() {
        let tree = parse_audience_id_conditions(&json!(["1", "2"])).unwrap();
        assert_eq!(
            tree,
            ConditionTree::Or(vec![
                ConditionTree::Leaf("1".to_string()),
                ConditionTree::Leaf("2".to_string())
            ])
        );
    }

    #[test]
    fn single_leaf_is_accepted() {
        let tree = parse_audience_id_conditions(&json!("42")).unwrap();
        assert_eq!(tree, ConditionTree::Leaf("42".to_string()));
    }

    #[test]
    fn not_takes_first_operand_only() {
        let tree = parse_audience_id_conditions(&json!(["not", "1", "2"])).unwrap();
        assert_eq!(
            tree,
            ConditionTree::Not(Some(Box::new(ConditionTree::Leaf("1".to_string()))))
        );

        let empty = parse_audience_id_conditions(&json!(["not"])).unwrap();
        assert_eq!(empty, ConditionTree::Not(None));
    }

    #[test]
    fn invalid_json_string_is_an_error() {
        let result = parse_audience_conditions(&json!("[\"and\", "));
        assert!(matches!(result, Err(ConditionParseError::InvalidJson(_))));
    }

    #[test]
    fn non_string_audience_id_is_an_error() {
        let result = parse_audience_id_conditions(&json!(["and", 12]));
        assert!(matches!(result, Err(ConditionParseError::InvalidLeaf(_))));
    }
}
