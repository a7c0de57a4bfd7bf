use crate::image_reference::ImageReference;
use crate::orchestrator::ServiceId;
use std::time::Duration;

/// Invalid or conflicting configuration. Always fatal, raised before the first cycle.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid blacklist pattern {pattern:?}: {source}")]
    InvalidBlacklistPattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("conflicting eligibility configuration: labelEnable cannot be combined with a blacklist")]
    ConflictingEligibility,

    #[error("conflicting schedule configuration: only one of pollIntervalSeconds or schedule can be set")]
    ConflictingSchedule,

    #[error("pollIntervalSeconds must be a positive integer")]
    InvalidInterval,

    #[error("invalid schedule {expression:?}: {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("{field} must be greater than zero")]
    ZeroLimit { field: &'static str },
}

/// Service discovery against the orchestrator failed. Aborts the current cycle only.
#[derive(Debug, thiserror::Error)]
pub enum ConnectivityError {
    #[error("service discovery failed: {0}")]
    Discovery(String),

    #[error("service discovery timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionFailure {
    #[error("image has no tag to resolve")]
    MissingTag,

    #[error("request timed out")]
    Timeout,

    #[error("request failed: {0}")]
    Transport(String),

    #[error("registry responded with status {0}")]
    Status(u16),

    #[error("response does not contain a Docker-Content-Digest header")]
    MissingDigest,

    #[error("invalid digest {0:?}")]
    InvalidDigest(String),
}

/// Registry digest lookup failed for one image.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to resolve digest for {image}: {failure}")]
pub struct ResolutionError {
    pub image: ImageReference,
    pub failure: ResolutionFailure,
}

impl ResolutionError {
    pub fn new(image: &ImageReference, failure: ResolutionFailure) -> Self {
        Self {
            image: image.clone(),
            failure,
        }
    }
}

/// The orchestrator rejected or failed an update for one service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateError {
    #[error("orchestrator rejected update of {service}: {message}")]
    Rejected { service: ServiceId, message: String },

    #[error("update of {service} timed out after {timeout:?}")]
    Timeout { service: ServiceId, timeout: Duration },
}

/// A cycle that produced no report at all.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),

    #[error("cycle cancelled before service discovery completed")]
    Cancelled,
}
