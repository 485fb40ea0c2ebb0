use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::project_config::{
    Experiment, FeatureFlag, ProjectConfig, TrafficAllocation, Variation,
};

use super::audience::is_user_in_audience;
use super::bucketer::{bucket, bucket_to_entity};
use super::cmab::CmabService;
use super::forced_decisions::{find_validated_forced_decision, DecisionContext};
use super::options::DecideOptions;
use super::reasons::DecisionReasons;
use super::user_profile::{UserProfileService, UserProfileTracker};
use super::{DecisionSource, DecisionUser, ExperimentDecision, FeatureDecision};

// Entity id of the single admission slot used for CMAB traffic.
const CMAB_ADMISSION_ENTITY: &str = "$";

/// Resolves flags and experiments for users.
///
/// Evaluation order for a flag is: a forced decision on the flag, then each feature experiment
/// in order, then the rollout rules, and finally a miss.
pub struct DecisionService {
    user_profile_service: Option<Arc<dyn UserProfileService>>,
    cmab_service: Option<Arc<CmabService>>,
    // user id -> experiment id -> variation id
    forced_variations: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl DecisionService {
    pub fn new(
        user_profile_service: Option<Arc<dyn UserProfileService>>,
        cmab_service: Option<Arc<CmabService>>,
    ) -> Self {
        Self {
            user_profile_service,
            cmab_service,
            forced_variations: RwLock::new(HashMap::new()),
        }
    }

    pub fn cmab_service(&self) -> Option<&Arc<CmabService>> {
        self.cmab_service.as_ref()
    }

    pub(crate) fn profile_tracker(
        &self,
        user_id: &str,
        options: &DecideOptions,
    ) -> UserProfileTracker<'_> {
        let service = if options.ignore_user_profile_service {
            None
        } else {
            self.user_profile_service.as_deref()
        };
        UserProfileTracker::new(service, user_id)
    }

    /// Decides several flags for one user. The user profile is loaded at most once and saved
    /// at most once for the whole batch.
    pub fn get_variations_for_features(
        &self,
        config: &ProjectConfig,
        flags: &[&FeatureFlag],
        user: &DecisionUser,
        options: &DecideOptions,
    ) -> Vec<(FeatureDecision, DecisionReasons)> {
        let mut tracker = self.profile_tracker(&user.user_id, options);
        let decisions = flags
            .iter()
            .map(|flag| {
                let mut reasons = DecisionReasons::new(options.include_reasons);
                let decision =
                    self.decide_flag(config, flag, user, options, &mut tracker, &mut reasons);
                (decision, reasons)
            })
            .collect();
        tracker.save_if_modified();
        decisions
    }

    pub fn get_variation_for_feature(
        &self,
        config: &ProjectConfig,
        flag: &FeatureFlag,
        user: &DecisionUser,
        options: &DecideOptions,
    ) -> (FeatureDecision, DecisionReasons) {
        self.get_variations_for_features(config, &[flag], user, options)
            .into_iter()
            .next()
            .unwrap_or_else(|| {
                (
                    FeatureDecision::miss(),
                    DecisionReasons::new(options.include_reasons),
                )
            })
    }

    fn decide_flag(
        &self,
        config: &ProjectConfig,
        flag: &FeatureFlag,
        user: &DecisionUser,
        options: &DecideOptions,
        tracker: &mut UserProfileTracker,
        reasons: &mut DecisionReasons,
    ) -> FeatureDecision {
        let flag_context = DecisionContext::new(&flag.key, None);
        if let Some(variation) = find_validated_forced_decision(
            config,
            &user.forced_decisions,
            &flag_context,
            &user.user_id,
            reasons,
        ) {
            return FeatureDecision {
                experiment: None,
                variation: Some(variation),
                source: DecisionSource::FeatureTest,
                cmab_uuid: None,
            };
        }

        if let Some(decision) =
            self.decide_feature_experiments(config, flag, user, options, tracker, reasons)
        {
            return decision;
        }

        if let Some(decision) = self.decide_rollout(config, flag, user, reasons) {
            return decision;
        }

        reasons.add_info(format!(
            "The user ({}) is not bucketed into any of the rules of flag ({}).",
            user.user_id, flag.key
        ));
        FeatureDecision::miss()
    }

    fn decide_feature_experiments(
        &self,
        config: &ProjectConfig,
        flag: &FeatureFlag,
        user: &DecisionUser,
        options: &DecideOptions,
        tracker: &mut UserProfileTracker,
        reasons: &mut DecisionReasons,
    ) -> Option<FeatureDecision> {
        for experiment_id in &flag.experiment_ids {
            let experiment = match config.experiment_by_id(experiment_id) {
                Some(experiment) => experiment,
                None => {
                    reasons.add_error(format!(
                        "Experiment id ({}) of flag ({}) is not in the datafile.",
                        experiment_id, flag.key
                    ));
                    continue;
                }
            };

            let rule_context = DecisionContext::new(&flag.key, Some(&experiment.key));
            if let Some(variation) = find_validated_forced_decision(
                config,
                &user.forced_decisions,
                &rule_context,
                &user.user_id,
                reasons,
            ) {
                return Some(FeatureDecision {
                    experiment: Some(experiment.clone()),
                    variation: Some(variation),
                    source: DecisionSource::FeatureTest,
                    cmab_uuid: None,
                });
            }

            if let Some(decision) =
                self.get_variation(config, experiment, user, options, tracker, reasons)
            {
                return Some(FeatureDecision {
                    experiment: Some(experiment.clone()),
                    variation: Some(decision.variation),
                    source: DecisionSource::FeatureTest,
                    cmab_uuid: decision.cmab_uuid,
                });
            }
        }

        if flag.experiment_ids.is_empty() {
            reasons.add_info(format!(
                "The feature flag ({}) is not used in any experiments.",
                flag.key
            ));
        }
        None
    }

    fn decide_rollout(
        &self,
        config: &ProjectConfig,
        flag: &FeatureFlag,
        user: &DecisionUser,
        reasons: &mut DecisionReasons,
    ) -> Option<FeatureDecision> {
        if flag.rollout_id.is_empty() {
            reasons.add_info(format!(
                "The feature flag ({}) is not used in a rollout.",
                flag.key
            ));
            return None;
        }

        let rollout = match config.rollout_by_id(&flag.rollout_id) {
            Some(rollout) => rollout,
            None => {
                reasons.add_error(format!(
                    "Rollout id ({}) of flag ({}) is not in the datafile.",
                    flag.rollout_id, flag.key
                ));
                return None;
            }
        };

        let rules = &rollout.experiments;
        if rules.is_empty() {
            return None;
        }

        let bucketing_id = user.bucketing_id(reasons);
        let everyone_else = rules.len() - 1;
        let mut index = 0;

        while index < rules.len() {
            let rule = &rules[index];
            let rule_context = DecisionContext::new(&flag.key, Some(&rule.key));
            if let Some(variation) = find_validated_forced_decision(
                config,
                &user.forced_decisions,
                &rule_context,
                &user.user_id,
                reasons,
            ) {
                return Some(FeatureDecision {
                    experiment: Some(rule.clone()),
                    variation: Some(variation),
                    source: DecisionSource::Rollout,
                    cmab_uuid: None,
                });
            }

            let label = if index == everyone_else {
                "Everyone Else".to_string()
            } else {
                (index + 1).to_string()
            };

            if !is_user_in_audience(
                config,
                rule.audience_conditions.as_ref(),
                &format!("rule ({})", label),
                user,
                reasons,
            ) {
                reasons.add_info(format!(
                    "User ({}) does not meet conditions for targeting rule ({}).",
                    user.user_id, label
                ));
                index += 1;
                continue;
            }

            reasons.add_info(format!(
                "User ({}) meets conditions for targeting rule ({}).",
                user.user_id, label
            ));

            match bucket(config, rule, &bucketing_id, reasons) {
                Some(variation) => {
                    reasons.add_info(format!(
                        "User ({}) is in the traffic group of targeting rule ({}).",
                        user.user_id, label
                    ));
                    return Some(FeatureDecision {
                        experiment: Some(rule.clone()),
                        variation: Some(variation.clone()),
                        source: DecisionSource::Rollout,
                        cmab_uuid: None,
                    });
                }
                None if index < everyone_else => {
                    // A traffic miss on a targeting rule skips the remaining targeting rules.
                    reasons.add_info(format!(
                        "User ({}) is not in the traffic group for targeting rule ({}). Checking \"Everyone Else\" rule now.",
                        user.user_id, label
                    ));
                    index = everyone_else;
                }
                None => {
                    reasons.add_info(format!(
                        "User ({}) is not in the traffic group for targeting rule ({}).",
                        user.user_id, label
                    ));
                    index += 1;
                }
            }
        }

        None
    }

    /// Resolves an experiment for the user: forced variation, whitelist, saved profile,
    /// audience, then CMAB or bucketing.
    pub(crate) fn get_variation(
        &self,
        config: &ProjectConfig,
        experiment: &Experiment,
        user: &DecisionUser,
        options: &DecideOptions,
        tracker: &mut UserProfileTracker,
        reasons: &mut DecisionReasons,
    ) -> Option<ExperimentDecision> {
        if !experiment.is_running() {
            reasons.add_info(format!("Experiment ({}) is not running.", experiment.key));
            return None;
        }

        if let Some(variation) = self.forced_variation(experiment, &user.user_id, reasons) {
            return Some(ExperimentDecision {
                variation,
                cmab_uuid: None,
            });
        }

        if let Some(variation) = whitelisted_variation(experiment, &user.user_id, reasons) {
            return Some(ExperimentDecision {
                variation,
                cmab_uuid: None,
            });
        }

        // Bandit assignments are dynamic and never sticky.
        let use_profile = experiment.cmab.is_none() && tracker.is_active();
        if use_profile {
            if let Some(variation_id) = tracker.saved_variation_id(&experiment.id, reasons) {
                match experiment.variation_by_id(&variation_id) {
                    Some(variation) => {
                        reasons.add_info(format!(
                            "User ({}) was previously bucketed into variation ({}) of experiment ({}).",
                            user.user_id, variation.key, experiment.key
                        ));
                        return Some(ExperimentDecision {
                            variation: variation.clone(),
                            cmab_uuid: None,
                        });
                    }
                    None => reasons.add_info(format!(
                        "User ({}) was previously bucketed into variation with id ({}) for experiment ({}), but no matching variation was found.",
                        user.user_id, variation_id, experiment.key
                    )),
                }
            }
        }

        if !is_user_in_audience(
            config,
            experiment.audience_conditions.as_ref(),
            &format!("experiment ({})", experiment.key),
            user,
            reasons,
        ) {
            reasons.add_info(format!(
                "User ({}) does not meet conditions to be in experiment ({}).",
                user.user_id, experiment.key
            ));
            return None;
        }

        let bucketing_id = user.bucketing_id(reasons);
        let decision = if experiment.cmab.is_some() {
            self.cmab_variation(config, experiment, user, &bucketing_id, options, reasons)?
        } else {
            let variation = bucket(config, experiment, &bucketing_id, reasons)?;
            ExperimentDecision {
                variation: variation.clone(),
                cmab_uuid: None,
            }
        };

        reasons.add_info(format!(
            "User ({}) is in variation ({}) of experiment ({}).",
            user.user_id, decision.variation.key, experiment.key
        ));

        if use_profile {
            tracker.record(&experiment.id, &decision.variation.id);
        }
        Some(decision)
    }

    fn cmab_variation(
        &self,
        config: &ProjectConfig,
        experiment: &Experiment,
        user: &DecisionUser,
        bucketing_id: &str,
        options: &DecideOptions,
        reasons: &mut DecisionReasons,
    ) -> Option<ExperimentDecision> {
        let cmab = experiment.cmab.as_ref()?;
        let admission = [TrafficAllocation {
            entity_id: CMAB_ADMISSION_ENTITY.to_string(),
            end_of_range: cmab.traffic_allocation,
        }];
        if bucket_to_entity(bucketing_id, &experiment.id, &admission).is_none() {
            reasons.add_info(format!(
                "User ({}) not in CMAB experiment ({}) due to traffic allocation.",
                user.user_id, experiment.key
            ));
            return None;
        }

        let service = match &self.cmab_service {
            Some(service) => service,
            None => {
                reasons.add_error(format!(
                    "CMAB fetch failed for experiment ({}): no CMAB service configured",
                    experiment.key
                ));
                return None;
            }
        };

        let decision = match service.get_decision(config, user, experiment, options) {
            Ok(decision) => decision,
            Err(e) => {
                reasons.add_error(format!(
                    "CMAB fetch failed for experiment ({}): {}",
                    experiment.key, e
                ));
                return None;
            }
        };

        match experiment.variation_by_id(&decision.variation_id) {
            Some(variation) => Some(ExperimentDecision {
                variation: variation.clone(),
                cmab_uuid: Some(decision.cmab_uuid),
            }),
            None => {
                reasons.add_error(format!(
                    "CMAB returned unknown variation id ({}) for experiment ({}).",
                    decision.variation_id, experiment.key
                ));
                None
            }
        }
    }

    /// Forces `user_id` into a variation of an experiment, or clears the mapping when
    /// `variation_key` is `None`. Returns false when the experiment or variation is unknown.
    pub fn set_forced_variation(
        &self,
        config: &ProjectConfig,
        experiment_key: &str,
        user_id: &str,
        variation_key: Option<&str>,
    ) -> bool {
        let experiment = match config.experiment_by_key(experiment_key) {
            Some(experiment) => experiment,
            None => {
                warn!("Experiment key ({}) is not in datafile.", experiment_key);
                return false;
            }
        };

        let mut forced = self.forced_variations.write();
        match variation_key {
            None => {
                if let Some(map) = forced.get_mut(user_id) {
                    map.remove(&experiment.id);
                }
                debug!(
                    "Variation mapped to experiment ({}) has been removed for user ({}).",
                    experiment_key, user_id
                );
                true
            }
            Some(variation_key) => match experiment.variation_by_key(variation_key) {
                Some(variation) => {
                    forced
                        .entry(user_id.to_string())
                        .or_default()
                        .insert(experiment.id.clone(), variation.id.clone());
                    debug!(
                        "Set variation ({}) for experiment ({}) and user ({}) in the forced variation map.",
                        variation_key, experiment_key, user_id
                    );
                    true
                }
                None => {
                    warn!(
                        "Variation key ({}) is not in datafile for experiment ({}).",
                        variation_key, experiment_key
                    );
                    false
                }
            },
        }
    }

    pub fn get_forced_variation(
        &self,
        config: &ProjectConfig,
        experiment_key: &str,
        user_id: &str,
    ) -> Option<Variation> {
        let experiment = config.experiment_by_key(experiment_key)?;
        self.forced_variation(experiment, user_id, &mut DecisionReasons::new(false))
    }

    fn forced_variation(
        &self,
        experiment: &Experiment,
        user_id: &str,
        reasons: &mut DecisionReasons,
    ) -> Option<Variation> {
        let forced = self.forced_variations.read();
        let variation_id = forced.get(user_id)?.get(&experiment.id)?;
        let variation = experiment.variation_by_id(variation_id)?;
        reasons.add_info(format!(
            "Variation ({}) is mapped to experiment ({}) and user ({}) in the forced variation map",
            variation.key, experiment.key, user_id
        ));
        Some(variation.clone())
    }
}

fn whitelisted_variation(
    experiment: &Experiment,
    user_id: &str,
    reasons: &mut DecisionReasons,
) -> Option<Variation> {
    let variation_key = experiment.forced_variations.get(user_id)?;
    match experiment.variation_by_key(variation_key) {
        Some(variation) => {
            reasons.add_info(format!(
                "User ({}) is forced in variation ({}).",
                user_id, variation_key
            ));
            Some(variation.clone())
        }
        None => {
            reasons.add_error(format!(
                "Variation ({}) forced for user ({}) is not in experiment ({}).",
                variation_key, user_id, experiment.key
            ));
            None
        }
    }
}
