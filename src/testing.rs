//! In-memory orchestrator and registry used by the cycle and scheduler tests.

use crate::error::{ConnectivityError, ResolutionError, ResolutionFailure, UpdateError};
use crate::image_reference::ImageReference;
use crate::oci_registry::DigestResolver;
use crate::orchestrator::{Orchestrator, Service, ServiceId};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

pub fn service(name: &str, image: &str, digest: Option<&str>) -> Service {
    service_with_labels(name, image, digest, &[])
}

pub fn service_with_labels(
    name: &str,
    image: &str,
    digest: Option<&str>,
    labels: &[(&str, &str)],
) -> Service {
    Service {
        id: ServiceId {
            kind: "Deployment".to_string(),
            namespace: "default".to_string(),
            name: name.to_string(),
            container: "app".to_string(),
        },
        name: name.to_string(),
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
        image: ImageReference::parse(image).unwrap(),
        deployed_digest: digest.map(str::to_string),
    }
}

/// Counts calls that are running at the same time and keeps the highest count.
#[derive(Default)]
pub struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(&self) -> InFlightGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(self)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlightGuard<'a>(&'a InFlight);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Orchestrator whose state changes when updates are applied, like a real cluster.
#[derive(Default)]
pub struct FakeOrchestrator {
    services: Mutex<Vec<Service>>,
    pub fail_discovery: bool,
    pub reject_updates: HashSet<String>,
    pub update_delay: Option<Duration>,
    /// When set, every discovery call waits for one permit.
    pub discovery_gate: Option<Arc<Semaphore>>,
    pub list_calls: AtomicUsize,
    pub updates: Mutex<Vec<(String, String)>>,
    pub update_calls: InFlight,
}

impl FakeOrchestrator {
    pub fn new(services: Vec<Service>) -> Self {
        Self {
            services: Mutex::new(services),
            ..Default::default()
        }
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> Vec<(String, String)> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn list_services(&self) -> Result<Vec<Service>, ConnectivityError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.discovery_gate {
            gate.acquire().await.unwrap().forget();
        }
        if self.fail_discovery {
            return Err(ConnectivityError::Discovery("connection refused".to_string()));
        }
        Ok(self.services.lock().unwrap().clone())
    }

    async fn apply_update(&self, service: &Service, digest: &str) -> Result<(), UpdateError> {
        let _running = self.update_calls.enter();
        if let Some(delay) = self.update_delay {
            tokio::time::sleep(delay).await;
        }
        if self.reject_updates.contains(&service.name) {
            return Err(UpdateError::Rejected {
                service: service.id.clone(),
                message: "admission webhook denied the request".to_string(),
            });
        }
        self.updates
            .lock()
            .unwrap()
            .push((service.name.clone(), digest.to_string()));

        let pinned = service.image.pinned(digest);
        let mut services = self.services.lock().unwrap();
        if let Some(stored) = services.iter_mut().find(|s| s.id == service.id) {
            stored.image = ImageReference::parse(&pinned).unwrap();
            stored.deployed_digest = Some(digest.to_string());
        }
        Ok(())
    }
}

/// Registry answering from a fixed table keyed by `repository:tag`.
#[derive(Default)]
pub struct FakeRegistry {
    digests: HashMap<String, Result<String, ResolutionFailure>>,
    delays: HashMap<String, Duration>,
    latency: Option<Duration>,
    pub calls: Mutex<Vec<String>>,
    pub resolutions: InFlight,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_digest(mut self, image: &str, digest: &str) -> Self {
        self.digests.insert(key_of(image), Ok(digest.to_string()));
        self
    }

    pub fn with_failure(mut self, image: &str, failure: ResolutionFailure) -> Self {
        self.digests.insert(key_of(image), Err(failure));
        self
    }

    pub fn with_delay(mut self, image: &str, delay: Duration) -> Self {
        self.delays.insert(key_of(image), delay);
        self
    }

    /// Delay applied to every lookup without its own delay.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

fn key_of(image: &str) -> String {
    key(&ImageReference::parse(image).unwrap())
}

fn key(image: &ImageReference) -> String {
    format!(
        "{}/{}:{}",
        image.registry,
        image.repository,
        image.tag.as_deref().unwrap_or("")
    )
}

#[async_trait]
impl DigestResolver for FakeRegistry {
    async fn resolve_digest(&self, image: &ImageReference) -> Result<String, ResolutionError> {
        let _running = self.resolutions.enter();
        let key = key(image);
        self.calls.lock().unwrap().push(key.clone());
        if let Some(delay) = self.delays.get(&key).copied().or(self.latency) {
            tokio::time::sleep(delay).await;
        }
        match self.digests.get(&key) {
            Some(Ok(digest)) => Ok(digest.clone()),
            Some(Err(failure)) => Err(ResolutionError::new(image, failure.clone())),
            None => Err(ResolutionError::new(image, ResolutionFailure::Status(404))),
        }
    }
}
