/// Collects the human readable explanation of a decision.
///
/// Error reasons are always kept. Informational reasons are only kept when the caller asked for
/// them with [crate::DecideOption::IncludeReasons].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecisionReasons {
    include_info: bool,
    reasons: Vec<String>,
}

impl DecisionReasons {
    pub fn new(include_info: bool) -> Self {
        Self {
            include_info,
            reasons: Vec::new(),
        }
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!("{}", message);
        self.reasons.push(message);
    }

    pub fn add_info(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!("{}", message);
        if self.include_info {
            self.reasons.push(message);
        }
    }

    pub fn append(&mut self, other: DecisionReasons) {
        self.reasons.extend(other.reasons);
    }

    pub fn includes_info(&self) -> bool {
        self.include_info
    }

    pub fn is_empty(&self) -> bool {
        self.reasons.is_empty()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.reasons
    }

    pub fn as_slice(&self) -> &[String] {
        &self.reasons
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_reasons_require_opt_in() {
        let mut reasons = DecisionReasons::new(false);
        reasons.add_info("bucketed");
        reasons.add_error("flag missing");
        assert_eq!(reasons.into_vec(), vec!["flag missing".to_string()]);

        let mut reasons = DecisionReasons::new(true);
        reasons.add_info("bucketed");
        reasons.add_error("flag missing");
        assert_eq!(reasons.as_slice().len(), 2);
    }
}
