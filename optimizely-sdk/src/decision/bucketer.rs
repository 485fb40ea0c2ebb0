//! Deterministic assignment of users to traffic slots.

use crate::project_config::{Experiment, GroupPolicy, ProjectConfig, TrafficAllocation, Variation};

use super::reasons::DecisionReasons;

/// Upper bound (exclusive) of the bucket space.
pub const MAX_TRAFFIC_VALUE: u32 = 10_000;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

fn fnv1a_32(input: &[u8]) -> u32 {
    input.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Maps a bucketing key into `[0, MAX_TRAFFIC_VALUE)`.
pub fn bucket_value(bucketing_key: &str) -> u32 {
    let hash = u64::from(fnv1a_32(bucketing_key.as_bytes()));
    ((hash * u64::from(MAX_TRAFFIC_VALUE)) >> 32) as u32
}

/// Returns the entity owning the slot `bucket` falls into. An entry with an empty entity id
/// reserves traffic for nobody.
pub fn find_bucket(bucket: u32, allocation: &[TrafficAllocation]) -> Option<&str> {
    allocation
        .iter()
        .find(|slot| bucket < slot.end_of_range)
        .map(|slot| slot.entity_id.as_str())
        .filter(|entity_id| !entity_id.is_empty())
}

/// Buckets `bucketing_id` across an allocation keyed by `entity_id`.
pub fn bucket_to_entity<'a>(
    bucketing_id: &str,
    entity_id: &str,
    allocation: &'a [TrafficAllocation],
) -> Option<&'a str> {
    let bucket = bucket_value(&format!("{}{}", bucketing_id, entity_id));
    find_bucket(bucket, allocation)
}

/// Buckets a user into one of the variations of `experiment`, honouring mutually exclusive
/// groups.
pub fn bucket<'a>(
    config: &ProjectConfig,
    experiment: &'a Experiment,
    bucketing_id: &str,
    reasons: &mut DecisionReasons,
) -> Option<&'a Variation> {
    if let Some(group) = experiment
        .group_id
        .as_deref()
        .and_then(|id| config.group_by_id(id))
    {
        if group.policy == GroupPolicy::Random {
            match bucket_to_entity(bucketing_id, &group.id, &group.traffic_allocation) {
                Some(chosen) if chosen == experiment.id => {
                    reasons.add_info(format!(
                        "User with bucketing ID ({}) is in experiment ({}) of group ({}).",
                        bucketing_id, experiment.key, group.id
                    ));
                }
                Some(_) => {
                    reasons.add_info(format!(
                        "User with bucketing ID ({}) is not in experiment ({}) of group ({}).",
                        bucketing_id, experiment.key, group.id
                    ));
                    return None;
                }
                None => {
                    reasons.add_info(format!(
                        "User with bucketing ID ({}) is not in any experiment of group ({}).",
                        bucketing_id, group.id
                    ));
                    return None;
                }
            }
        }
    }

    let variation_id =
        match bucket_to_entity(bucketing_id, &experiment.id, &experiment.traffic_allocation) {
            Some(id) => id,
            None => {
                reasons.add_info(format!(
                    "User with bucketing ID ({}) is not in any variation of experiment ({}).",
                    bucketing_id, experiment.key
                ));
                return None;
            }
        };

    let variation = experiment.variation_by_id(variation_id);
    if variation.is_none() {
        reasons.add_error(format!(
            "Bucketed into unknown variation id ({}) of experiment ({}).",
            variation_id, experiment.key
        ));
    }
    variation
}
