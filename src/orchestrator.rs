use crate::error::{ConnectivityError, UpdateError};
use crate::image_reference::ImageReference;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;

/// Identity of one updatable container of a workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub container: String,
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}:{}",
            self.kind, self.namespace, self.name, self.container
        )
    }
}

/// Read-only snapshot of a service, taken fresh at the start of every cycle.
#[derive(Debug, Clone)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub image: ImageReference,
    /// Digest currently running, if the orchestrator has resolved one.
    pub deployed_digest: Option<String>,
}

impl Service {
    pub fn deployed_image(&self) -> &ImageReference {
        &self.image
    }
}

/// The cluster control plane as seen by an update cycle.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Full inventory of services. Any failure means no partial list is returned.
    async fn list_services(&self) -> Result<Vec<Service>, ConnectivityError>;

    /// Submit a single request moving `service` to `digest`. Rollout and rollback
    /// after acceptance are the orchestrator's business.
    async fn apply_update(&self, service: &Service, digest: &str) -> Result<(), UpdateError>;
}
