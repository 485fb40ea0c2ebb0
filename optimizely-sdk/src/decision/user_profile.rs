//! Sticky bucketing through an application supplied profile store.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::reasons::DecisionReasons;

/// Prior bucketing decisions of one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    /// Experiment id to variation id.
    pub experiment_bucket_map: HashMap<String, String>,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            experiment_bucket_map: HashMap::new(),
        }
    }
}

/// Trait for a persistent store of [UserProfile]s.
///
/// Implementations must be safe to call from many threads. Failures should be handled inside
/// the implementation; a lookup that cannot be served returns `None`.
pub trait UserProfileService: Send + Sync {
    fn lookup(&self, user_id: &str) -> Option<UserProfile>;

    fn save(&self, profile: UserProfile);
}

/// Loads a profile lazily, records new bucketing decisions in memory, and saves them once when
/// the decide call completes.
pub(crate) struct UserProfileTracker<'a> {
    service: Option<&'a dyn UserProfileService>,
    user_id: String,
    profile: Option<UserProfile>,
    loaded: bool,
    modified: bool,
}

impl<'a> UserProfileTracker<'a> {
    pub fn new(service: Option<&'a dyn UserProfileService>, user_id: &str) -> Self {
        Self {
            service,
            user_id: user_id.to_string(),
            profile: None,
            loaded: false,
            modified: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.service.is_some()
    }

    fn load(&mut self, reasons: &mut DecisionReasons) {
        if self.loaded {
            return;
        }
        self.loaded = true;

        let service = match self.service {
            Some(service) => service,
            None => return,
        };

        self.profile = match service.lookup(&self.user_id) {
            Some(profile) => Some(profile),
            None => {
                reasons.add_info(format!(
                    "We were unable to get a user profile map from the UserProfileService for user ({}).",
                    self.user_id
                ));
                Some(UserProfile::new(self.user_id.clone()))
            }
        };
    }

    /// Returns the variation id previously saved for the experiment.
    pub fn saved_variation_id(
        &mut self,
        experiment_id: &str,
        reasons: &mut DecisionReasons,
    ) -> Option<String> {
        self.load(reasons);
        self.profile
            .as_ref()
            .and_then(|p| p.experiment_bucket_map.get(experiment_id))
            .cloned()
    }

    pub fn record(&mut self, experiment_id: &str, variation_id: &str) {
        if self.service.is_none() {
            return;
        }
        self.load(&mut DecisionReasons::new(false));
        let user_id = self.user_id.clone();
        let profile = self
            .profile
            .get_or_insert_with(|| UserProfile::new(user_id));
        let previous = profile
            .experiment_bucket_map
            .insert(experiment_id.to_string(), variation_id.to_string());
        if previous.as_deref() != Some(variation_id) {
            self.modified = true;
        }
    }

    /// Persists the profile if anything changed during the call.
    pub fn save_if_modified(&mut self) {
        if !self.modified {
            return;
        }
        if let (Some(service), Some(profile)) = (self.service, self.profile.as_ref()) {
            debug!("Saving user profile for user ({})", profile.user_id);
            service.save(profile.clone());
        }
        self.modified = false;
    }
}
