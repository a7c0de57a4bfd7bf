use crate::error::ConfigError;
use regex::Regex;
use std::collections::BTreeMap;

/// Workloads opt in to updates by carrying this label with the value `true`.
pub static ENABLED_LABEL: &str = "kube-digest-updater/enabled";

/// A compiled pattern matched against service names.
#[derive(Debug, Clone)]
pub struct BlacklistRule(Regex);

impl BlacklistRule {
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        Regex::new(pattern)
            .map(BlacklistRule)
            .map_err(|source| ConfigError::InvalidBlacklistPattern {
                pattern: pattern.to_string(),
                source,
            })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.0.is_match(name)
    }
}

/// Which services are considered at all. Built once at startup, then only read.
#[derive(Debug, Clone)]
pub enum EligibilityMode {
    Unrestricted,
    BlacklistExclude(Vec<BlacklistRule>),
    LabelOptIn(String),
}

impl EligibilityMode {
    /// Validating constructor for the `labelEnable` / `blacklist` settings.
    pub fn from_settings(label_opt_in: bool, blacklist: &[String]) -> Result<Self, ConfigError> {
        match (label_opt_in, blacklist.is_empty()) {
            (true, false) => Err(ConfigError::ConflictingEligibility),
            (true, true) => Ok(EligibilityMode::LabelOptIn(ENABLED_LABEL.to_string())),
            (false, true) => Ok(EligibilityMode::Unrestricted),
            (false, false) => Self::blacklist(blacklist),
        }
    }

    pub fn blacklist(patterns: &[String]) -> Result<Self, ConfigError> {
        let rules = patterns
            .iter()
            .map(|pattern| BlacklistRule::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(EligibilityMode::BlacklistExclude(rules))
    }

    pub fn is_eligible(&self, name: &str, labels: &BTreeMap<String, String>) -> bool {
        match self {
            EligibilityMode::Unrestricted => true,
            EligibilityMode::BlacklistExclude(rules) => {
                !rules.iter().any(|rule| rule.matches(name))
            }
            EligibilityMode::LabelOptIn(key) => {
                labels.get(key).is_some_and(|value| value == "true")
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            EligibilityMode::Unrestricted => "all services".to_string(),
            EligibilityMode::BlacklistExclude(rules) => format!(
                "all services except names matching {} blacklist rule(s)",
                rules.len()
            ),
            EligibilityMode::LabelOptIn(key) => format!("services labelled {}=true", key),
        }
    }
}
