use crate::error::{CycleError, ResolutionError, UpdateError};
use crate::orchestrator::ServiceId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotEligible,
    DigestUnresolved,
    DigestUnchanged,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotEligible => write!(f, "not-eligible"),
            SkipReason::DigestUnresolved => write!(f, "digest-unresolved"),
            SkipReason::DigestUnchanged => write!(f, "digest-unchanged"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceFailure {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Update(#[from] UpdateError),
}

impl ServiceFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceFailure::Resolution(_) => "ResolutionError",
            ServiceFailure::Update(_) => "UpdateError",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Updated { from: String, to: String },
    Skipped(SkipReason),
    Failed(ServiceFailure),
    /// Shutdown arrived before this service's work completed.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ServiceOutcome {
    pub service: ServiceId,
    pub name: String,
    pub outcome: Outcome,
}

/// Outcomes of one cycle in discovery order.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<ServiceOutcome>,
}

impl CycleReport {
    pub fn updated(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Updated { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Skipped(_)))
    }

    pub fn skipped_for(&self, reason: SkipReason) -> usize {
        self.count(|o| *o == Outcome::Skipped(reason))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Failed(_)))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Cancelled))
    }

    #[cfg(test)]
    pub fn outcome_of(&self, name: &str) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|o| o.name == name)
            .map(|o| &o.outcome)
    }

    fn count(&self, predicate: impl Fn(&Outcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| predicate(&o.outcome)).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedCounts {
    pub total: usize,
    pub not_eligible: usize,
    pub digest_unresolved: usize,
    pub digest_unchanged: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureDetail {
    pub service: String,
    pub kind: &'static str,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub checked: usize,
    pub updated: usize,
    pub skipped: SkippedCounts,
    pub failed: usize,
    pub cancelled: usize,
    pub failures: Vec<FailureDetail>,
}

impl From<&CycleReport> for CycleSummary {
    fn from(report: &CycleReport) -> Self {
        let failures = report
            .outcomes
            .iter()
            .filter_map(|o| match &o.outcome {
                Outcome::Failed(failure) => Some(FailureDetail {
                    service: o.service.to_string(),
                    kind: failure.kind(),
                    error: failure.to_string(),
                }),
                _ => None,
            })
            .collect();

        CycleSummary {
            started_at: report.started_at,
            finished_at: report.finished_at,
            checked: report.outcomes.len(),
            updated: report.updated(),
            skipped: SkippedCounts {
                total: report.skipped(),
                not_eligible: report.skipped_for(SkipReason::NotEligible),
                digest_unresolved: report.skipped_for(SkipReason::DigestUnresolved),
                digest_unchanged: report.skipped_for(SkipReason::DigestUnchanged),
            },
            failed: report.failed(),
            cancelled: report.cancelled(),
            failures,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReporterStatus {
    /// Set while the scheduler accepts fire events.
    pub scheduler_running: bool,
    pub last_cycle: Option<CycleSummary>,
    pub last_aborted_at: Option<DateTime<Utc>>,
    pub last_abort_reason: Option<String>,
}

/// Logs every finished cycle and remembers the latest one for the status endpoint.
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    status: Arc<RwLock<ReporterStatus>>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn report(&self, report: &CycleReport) -> CycleSummary {
        let summary = CycleSummary::from(report);
        let duration = report.finished_at - report.started_at;

        info!(
            "Cycle finished in {}ms: checked={} updated={} skipped={} (not-eligible={}, digest-unresolved={}, digest-unchanged={}) failed={} cancelled={}",
            duration.num_milliseconds(),
            summary.checked,
            summary.updated,
            summary.skipped.total,
            summary.skipped.not_eligible,
            summary.skipped.digest_unresolved,
            summary.skipped.digest_unchanged,
            summary.failed,
            summary.cancelled
        );
        for outcome in &report.outcomes {
            if let Outcome::Updated { from, to } = &outcome.outcome {
                info!(
                    "Service {} ({}) moved from {} to {}",
                    outcome.name, outcome.service, from, to
                );
            }
        }
        for failure in &summary.failures {
            warn!(
                "Service {} failed with {}: {}",
                failure.service, failure.kind, failure.error
            );
        }

        self.status.write().await.last_cycle = Some(summary.clone());
        summary
    }

    pub async fn report_aborted(&self, err: &CycleError) {
        error!("Cycle aborted: {}", err);
        let mut status = self.status.write().await;
        status.last_aborted_at = Some(Utc::now());
        status.last_abort_reason = Some(err.to_string());
    }

    pub async fn set_scheduler_running(&self, running: bool) {
        self.status.write().await.scheduler_running = running;
    }

    pub async fn is_scheduler_running(&self) -> bool {
        self.status.read().await.scheduler_running
    }

    pub async fn status(&self) -> ReporterStatus {
        self.status.read().await.clone()
    }

    #[cfg(test)]
    pub async fn last_cycle(&self) -> Option<CycleSummary> {
        self.status.read().await.last_cycle.clone()
    }
}
