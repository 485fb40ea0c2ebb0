use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::client::{Client, ClientError};
use crate::decision::forced_decisions::{DecisionContext, ForcedDecision};
use crate::decision::options::DecideOption;
use crate::decision::DecisionUser;
use crate::odp::{OdpError, OdpSegmentOption};

/// The result of deciding one flag for a user.
#[derive(Debug, Clone)]
pub struct OptimizelyDecision {
    /// Key of the variation the user got, empty when no variation applies.
    pub variation_key: String,
    pub enabled: bool,
    /// Variable values of the flag, typed according to the datafile.
    pub variables: Map<String, Value>,
    /// Key of the rule that produced the variation, empty for forced or missed decisions.
    pub rule_key: String,
    pub flag_key: String,
    /// Copy of the user context the decision was made for.
    pub user_context: UserContext,
    pub reasons: Vec<String>,
    pub cmab_uuid: Option<String>,
}

impl OptimizelyDecision {
    pub(crate) fn error(
        flag_key: &str,
        user_context: UserContext,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            variation_key: String::new(),
            enabled: false,
            variables: Map::new(),
            rule_key: String::new(),
            flag_key: flag_key.to_string(),
            user_context,
            reasons: vec![reason.into()],
            cmab_uuid: None,
        }
    }
}

/// A user of the application, bound to the [Client] that created it.
///
/// Attributes, qualified segments and forced decisions can be changed at any time and from any
/// thread. Every read returns a copy; a decide call evaluates against the values held when it
/// starts.
///
/// Cloning a context copies its data, the clone and the original evolve independently.
///
/// # Examples
///
/// ```
/// # use optimizely_sdk::{Client, ConfigBuilder, BuildError, DecideOption};
/// # use std::collections::HashMap;
/// # use std::sync::Arc;
/// # fn main() -> Result<(), BuildError> {
///     let client = Arc::new(Client::build(ConfigBuilder::new("sdk-key").offline(true).build())?);
///     let user = client.create_user_context("user-123", HashMap::new());
///     user.set_attribute("plan", "gold");
///
///     let decision = user.decide("checkout_flow", &[DecideOption::IncludeReasons]);
///     if decision.enabled {
///         // ...
///     }
/// #   Ok(())
/// # }
/// ```
pub struct UserContext {
    client: Arc<Client>,
    user_id: String,
    attributes: RwLock<HashMap<String, Value>>,
    qualified_segments: RwLock<Option<Vec<String>>>,
    forced_decisions: RwLock<HashMap<DecisionContext, ForcedDecision>>,
}

impl UserContext {
    pub(crate) fn new(
        client: Arc<Client>,
        user_id: String,
        attributes: HashMap<String, Value>,
    ) -> Self {
        Self {
            client,
            user_id,
            attributes: RwLock::new(attributes),
            qualified_segments: RwLock::new(None),
            forced_decisions: RwLock::new(HashMap::new()),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn attributes(&self) -> HashMap<String, Value> {
        self.attributes.read().clone()
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.attributes.write().insert(key.into(), value.into());
    }

    /// Segments the user qualifies for. `None` until they have been fetched or set.
    pub fn qualified_segments(&self) -> Option<Vec<String>> {
        self.qualified_segments.read().clone()
    }

    pub fn set_qualified_segments(&self, segments: Option<Vec<String>>) {
        *self.qualified_segments.write() = segments;
    }

    pub fn is_qualified_for(&self, segment: &str) -> bool {
        self.qualified_segments
            .read()
            .as_ref()
            .map(|segments| segments.iter().any(|s| s == segment))
            .unwrap_or(false)
    }

    /// Asks the ODP service which of the project's segments the user qualifies for and stores
    /// the answer on this context. On failure the stored segments are cleared.
    pub fn fetch_qualified_segments(&self, options: &[OdpSegmentOption]) -> Result<(), OdpError> {
        match self.client.fetch_qualified_segments(&self.user_id, options) {
            Ok(segments) => {
                self.set_qualified_segments(Some(segments));
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Audience segments fetch failed for user ({}): {}",
                    self.user_id, e
                );
                self.set_qualified_segments(None);
                Err(e)
            }
        }
    }

    /// Forces the variation returned for a flag, or for one rule of a flag. Always succeeds;
    /// an unknown variation is reported when a decision consults it.
    pub fn set_forced_decision(&self, context: &DecisionContext, decision: &ForcedDecision) -> bool {
        self.forced_decisions
            .write()
            .insert(context.clone(), decision.clone());
        true
    }

    pub fn get_forced_decision(&self, context: &DecisionContext) -> Option<ForcedDecision> {
        self.forced_decisions.read().get(context).cloned()
    }

    /// Returns false when nothing was forced for `context`.
    pub fn remove_forced_decision(&self, context: &DecisionContext) -> bool {
        self.forced_decisions.write().remove(context).is_some()
    }

    pub fn remove_all_forced_decisions(&self) -> bool {
        self.forced_decisions.write().clear();
        true
    }

    /// Decides one flag for this user.
    ///
    /// Never fails: problems such as an unknown flag or a client that has no datafile yet are
    /// reported as a disabled decision carrying the error in its reasons.
    pub fn decide(&self, key: &str, options: &[DecideOption]) -> OptimizelyDecision {
        let keys = [key.to_string()];
        self.client
            .decide_flags(self, &keys, options, false)
            .remove(key)
            .unwrap_or_else(|| {
                OptimizelyDecision::error(key, self.clone(), "No decision was made for the flag.")
            })
    }

    /// Decides several flags at once. The user profile is loaded and saved at most once.
    ///
    /// With [DecideOption::EnabledFlagsOnly] disabled flags are left out of the result.
    pub fn decide_for_keys(
        &self,
        keys: &[&str],
        options: &[DecideOption],
    ) -> HashMap<String, OptimizelyDecision> {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        self.client.decide_flags(self, &keys, options, true)
    }

    /// Decides every flag of the current datafile.
    pub fn decide_all(&self, options: &[DecideOption]) -> HashMap<String, OptimizelyDecision> {
        let keys = self.client.flag_keys();
        self.client.decide_flags(self, &keys, options, true)
    }

    /// Records a conversion for this user. Unknown event keys are logged and ignored.
    pub fn track_event(
        &self,
        event_key: &str,
        event_tags: HashMap<String, Value>,
    ) -> Result<(), ClientError> {
        self.client
            .track(event_key, &self.user_id, &self.attributes(), &event_tags)
    }

    /// Copy of the data a decision is evaluated against.
    pub(crate) fn snapshot(&self) -> DecisionUser {
        DecisionUser {
            user_id: self.user_id.clone(),
            attributes: self.attributes(),
            qualified_segments: self.qualified_segments(),
            forced_decisions: self.forced_decisions.read().clone(),
        }
    }
}

impl Clone for UserContext {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            user_id: self.user_id.clone(),
            attributes: RwLock::new(self.attributes()),
            qualified_segments: RwLock::new(self.qualified_segments()),
            forced_decisions: RwLock::new(self.forced_decisions.read().clone()),
        }
    }
}

impl fmt::Debug for UserContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserContext")
            .field("user_id", &self.user_id)
            .field("attributes", &*self.attributes.read())
            .field("qualified_segments", &*self.qualified_segments.read())
            .finish()
    }
}
