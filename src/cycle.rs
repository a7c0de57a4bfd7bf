use crate::error::{ConnectivityError, CycleError, UpdateError};
use crate::oci_registry::DigestResolver;
use crate::orchestrator::{Orchestrator, Service, ServiceId};
use crate::policy::EligibilityMode;
use crate::report::{CycleReport, Outcome, ServiceFailure, ServiceOutcome, SkipReason};
use chrono::Utc;
use futures::{StreamExt, stream};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub max_concurrent_resolutions: usize,
    pub max_concurrent_updates: usize,
    /// Upper bound for each orchestrator call.
    pub call_timeout: Duration,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            max_concurrent_resolutions: 4,
            max_concurrent_updates: 1,
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// A service whose registry digest moved away from the deployed one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCandidate {
    pub service: ServiceId,
    pub old_digest: String,
    pub new_digest: String,
}

enum Decision {
    Done(Outcome),
    Update(UpdateCandidate),
}

/// Runs one discovery, filter, resolve, update pass.
pub struct CycleDriver {
    orchestrator: Arc<dyn Orchestrator>,
    resolver: Arc<dyn DigestResolver>,
    eligibility: Arc<EligibilityMode>,
    settings: CycleSettings,
}

impl CycleDriver {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        resolver: Arc<dyn DigestResolver>,
        eligibility: Arc<EligibilityMode>,
        settings: CycleSettings,
    ) -> Self {
        Self {
            orchestrator,
            resolver,
            eligibility,
            settings,
        }
    }

    /// Every discovered service ends up in the report exactly once. Cancellation
    /// turns outstanding work into [`Outcome::Cancelled`]; an update that was
    /// already submitted is allowed to finish.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<CycleReport, CycleError> {
        let started_at = Utc::now();
        let services = self.discover(cancel).await?;
        info!("Scanning {} services for digest changes", services.len());

        let mut outcomes: Vec<Option<Outcome>> = (0..services.len()).map(|_| None).collect();
        let mut eligible = Vec::new();
        for (index, service) in services.iter().enumerate() {
            if self.eligibility.is_eligible(&service.name, &service.labels) {
                eligible.push(index);
            } else {
                debug!("Skipping {}, not eligible", service.id);
                outcomes[index] = Some(Outcome::Skipped(SkipReason::NotEligible));
            }
        }

        let decisions: Vec<(usize, Decision)> = stream::iter(eligible)
            .map(|index| {
                let service = &services[index];
                async move { (index, self.decide(service, cancel).await) }
            })
            .buffer_unordered(self.settings.max_concurrent_resolutions)
            .collect()
            .await;

        let mut candidates = Vec::new();
        for (index, decision) in decisions {
            match decision {
                Decision::Done(outcome) => outcomes[index] = Some(outcome),
                Decision::Update(candidate) => candidates.push((index, candidate)),
            }
        }

        let applied: Vec<(usize, Outcome)> = stream::iter(candidates)
            .map(|(index, candidate)| {
                let service = &services[index];
                async move { (index, self.apply(service, candidate, cancel).await) }
            })
            .buffer_unordered(self.settings.max_concurrent_updates)
            .collect()
            .await;
        for (index, outcome) in applied {
            outcomes[index] = Some(outcome);
        }

        let outcomes = services
            .into_iter()
            .zip(outcomes)
            .map(|(service, outcome)| ServiceOutcome {
                service: service.id,
                name: service.name,
                outcome: outcome.unwrap_or(Outcome::Cancelled),
            })
            .collect();

        Ok(CycleReport {
            started_at,
            finished_at: Utc::now(),
            outcomes,
        })
    }

    async fn discover(&self, cancel: &CancellationToken) -> Result<Vec<Service>, CycleError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CycleError::Cancelled),
            listed = timeout(self.settings.call_timeout, self.orchestrator.list_services()) => {
                match listed {
                    Ok(services) => Ok(services?),
                    Err(_) => Err(ConnectivityError::Timeout(self.settings.call_timeout).into()),
                }
            }
        }
    }

    async fn decide(&self, service: &Service, cancel: &CancellationToken) -> Decision {
        let image = service.deployed_image();
        let Some(deployed) = service.deployed_digest.as_deref() else {
            debug!("Skipping {}, deployed digest is not known yet", service.id);
            return Decision::Done(Outcome::Skipped(SkipReason::DigestUnresolved));
        };
        if image.tag.is_none() {
            debug!("Skipping {}, image {} is pinned without a tag", service.id, image);
            return Decision::Done(Outcome::Skipped(SkipReason::DigestUnresolved));
        }

        let resolved = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Decision::Done(Outcome::Cancelled),
            resolved = self.resolver.resolve_digest(image) => resolved,
        };

        match resolved {
            Err(e) => {
                warn!("Could not resolve digest for {}: {}", service.id, e);
                Decision::Done(Outcome::Failed(ServiceFailure::Resolution(e)))
            }
            Ok(digest) if digest == deployed => {
                info!("Skipping {}, digest is up to date", service.id);
                Decision::Done(Outcome::Skipped(SkipReason::DigestUnchanged))
            }
            Ok(digest) => {
                info!(
                    "Found updated image digest {} for {} (deployed {})",
                    digest, service.id, deployed
                );
                Decision::Update(UpdateCandidate {
                    service: service.id.clone(),
                    old_digest: deployed.to_string(),
                    new_digest: digest,
                })
            }
        }
    }

    async fn apply(
        &self,
        service: &Service,
        candidate: UpdateCandidate,
        cancel: &CancellationToken,
    ) -> Outcome {
        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        info!(
            "Triggering rollout for {} to digest {}",
            candidate.service, candidate.new_digest
        );
        let applied = timeout(
            self.settings.call_timeout,
            self.orchestrator.apply_update(service, &candidate.new_digest),
        )
        .await;

        match applied {
            Ok(Ok(())) => {
                info!("Successfully triggered rollout for {}", service.id);
                Outcome::Updated {
                    from: candidate.old_digest,
                    to: candidate.new_digest,
                }
            }
            Ok(Err(e)) => {
                warn!("Update of {} failed: {}", service.id, e);
                Outcome::Failed(ServiceFailure::Update(e))
            }
            Err(_) => {
                warn!(
                    "Update of {} did not complete within {:?}",
                    service.id, self.settings.call_timeout
                );
                Outcome::Failed(ServiceFailure::Update(UpdateError::Timeout {
                    service: service.id.clone(),
                    timeout: self.settings.call_timeout,
                }))
            }
        }
    }
}
