use crate::credentials::{RegistryCredential, SecretString, StaticCredentials};
use crate::cycle::CycleSettings;
use crate::error::ConfigError;
use crate::policy::EligibilityMode;
use crate::scheduler::Trigger;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs, path::Path};
use tracing::info;

pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 300;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub poll_interval_seconds: Option<u64>,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub label_enable: bool,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub debug: bool,
    /// Namespace to watch, the client's default namespace when unset.
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default = "default_max_concurrent_resolutions")]
    pub max_concurrent_resolutions: usize,
    #[serde(default = "default_max_concurrent_updates")]
    pub max_concurrent_updates: usize,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default)]
    pub webserver: Webserver,
    #[serde(default)]
    pub registries: Vec<Registry>,
    #[serde(default)]
    pub insecure_registries: Vec<String>,
    #[serde(default)]
    pub tls: Tls,
    #[serde(default)]
    pub feature_flags: FeatureFlags,
}

#[derive(Debug, Deserialize)]
pub struct Registry {
    pub hostname: String,
    pub username: Option<String>,
    pub token: SecretString,
}

#[derive(Debug, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

impl Default for Webserver {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tls {
    #[serde(default)]
    pub ca_certificate_paths: Vec<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlags {
    #[serde(default)]
    pub enable_jfrog_artifactory_fallback: bool,
}

fn default_max_concurrent_resolutions() -> usize {
    4
}

fn default_max_concurrent_updates() -> usize {
    1
}

fn default_request_timeout_seconds() -> u64 {
    30
}

/// The validated settings every cycle runs with.
#[derive(Debug)]
pub struct EngineConfig {
    pub trigger: Trigger,
    pub eligibility: EligibilityMode,
    pub debug_logging: bool,
}

impl EngineConfig {
    pub fn new(
        poll_interval_seconds: Option<u64>,
        schedule_expression: Option<String>,
        label_opt_in_enabled: bool,
        blacklist_patterns: &[String],
        debug_logging: bool,
    ) -> Result<Self, ConfigError> {
        let trigger = match (poll_interval_seconds, schedule_expression) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingSchedule),
            (Some(0), None) => return Err(ConfigError::InvalidInterval),
            (Some(seconds), None) => Trigger::Interval(Duration::from_secs(seconds)),
            (None, Some(expression)) if expression.trim().is_empty() => {
                return Err(ConfigError::InvalidSchedule {
                    expression,
                    reason: "schedule is empty".to_string(),
                });
            }
            (None, Some(expression)) => Trigger::Cron(expression.trim().to_string()),
            (None, None) => Trigger::Interval(Duration::from_secs(DEFAULT_POLL_INTERVAL_SECONDS)),
        };
        let eligibility = EligibilityMode::from_settings(label_opt_in_enabled, blacklist_patterns)?;

        Ok(Self {
            trigger,
            eligibility,
            debug_logging,
        })
    }
}

impl Config {
    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        EngineConfig::new(
            self.poll_interval_seconds,
            self.schedule.clone(),
            self.label_enable,
            &self.blacklist,
            self.debug,
        )
    }

    pub fn cycle_settings(&self) -> Result<CycleSettings, ConfigError> {
        if self.max_concurrent_resolutions == 0 {
            return Err(ConfigError::ZeroLimit {
                field: "maxConcurrentResolutions",
            });
        }
        if self.max_concurrent_updates == 0 {
            return Err(ConfigError::ZeroLimit {
                field: "maxConcurrentUpdates",
            });
        }
        if self.request_timeout_seconds == 0 {
            return Err(ConfigError::ZeroLimit {
                field: "requestTimeoutSeconds",
            });
        }
        Ok(CycleSettings {
            max_concurrent_resolutions: self.max_concurrent_resolutions,
            max_concurrent_updates: self.max_concurrent_updates,
            call_timeout: Duration::from_secs(self.request_timeout_seconds),
        })
    }

    pub fn credentials(&self) -> StaticCredentials {
        let mut credentials = StaticCredentials::new();
        for registry in &self.registries {
            credentials.insert(
                registry.hostname.clone(),
                RegistryCredential::from_parts(registry.username.clone(), registry.token.clone()),
            );
        }
        credentials
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming the first missing variable.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing: Option<String> = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| var_name.to_string());
            String::new()
        })
    });

    if let Some(var_name) = missing {
        return Err(ConfigError::MissingEnvVar(var_name).into());
    }
    Ok(result.into_owned())
}
