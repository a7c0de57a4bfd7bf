use crate::error::{ConnectivityError, UpdateError};
use crate::image_reference::{ImageReference, is_valid_digest};
use crate::orchestrator::{Orchestrator, Service, ServiceId};
use crate::rollout::Rollout;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

pub async fn create_client(timeout: Duration) -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let mut config = kube::Config::infer().await?;
    config.connect_timeout = Some(timeout);
    config.read_timeout = Some(timeout);
    config.write_timeout = Some(timeout);

    let client = Client::try_from(config)?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to namespace {}, Kubernetes API server with version {}.{}",
        client.default_namespace(),
        api_server_info.major,
        api_server_info.minor
    );
    Ok(client)
}

/// Deployments, StatefulSets and DaemonSets of one namespace, one service per container.
pub struct KubeOrchestrator {
    client: Client,
    namespace: String,
}

impl KubeOrchestrator {
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        let namespace = namespace.unwrap_or_else(|| client.default_namespace().to_string());
        Self { client, namespace }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn list_kind<K: Rollout>(
        &self,
        pods: &[Pod],
        services: &mut Vec<Service>,
    ) -> Result<(), ConnectivityError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), &self.namespace);
        let workloads = api
            .list(&ListParams::default())
            .await
            .map_err(|e| discovery_error(K::kind_name(), e))?;

        debug!(
            "Found {} {} objects in namespace {}",
            workloads.items.len(),
            K::kind_name(),
            self.namespace
        );
        for workload in &workloads.items {
            services.extend(services_for_workload(workload, &self.namespace, pods));
        }
        Ok(())
    }

    async fn patch<K: Rollout>(&self, service: &Service, image: &str) -> Result<(), UpdateError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), &service.id.namespace);
        K::patch_container_image(&api, &service.id.name, &service.id.container, image)
            .await
            .map_err(|e| UpdateError::Rejected {
                service: service.id.clone(),
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn list_services(&self) -> Result<Vec<Service>, ConnectivityError> {
        let pod_api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let pods = pod_api
            .list(&ListParams::default())
            .await
            .map_err(|e| discovery_error("Pod", e))?
            .items;

        let mut services = Vec::new();
        self.list_kind::<Deployment>(&pods, &mut services).await?;
        self.list_kind::<StatefulSet>(&pods, &mut services).await?;
        self.list_kind::<DaemonSet>(&pods, &mut services).await?;
        Ok(services)
    }

    async fn apply_update(&self, service: &Service, digest: &str) -> Result<(), UpdateError> {
        let image = service.image.pinned(digest);
        info!("Setting image of {} to {}", service.id, image);

        match service.id.kind.as_str() {
            kind if kind == Deployment::kind_name() => {
                self.patch::<Deployment>(service, &image).await
            }
            kind if kind == StatefulSet::kind_name() => {
                self.patch::<StatefulSet>(service, &image).await
            }
            kind if kind == DaemonSet::kind_name() => {
                self.patch::<DaemonSet>(service, &image).await
            }
            other => Err(UpdateError::Rejected {
                service: service.id.clone(),
                message: format!("unsupported workload kind {}", other),
            }),
        }
    }
}

fn discovery_error(kind: &str, error: kube::Error) -> ConnectivityError {
    ConnectivityError::Discovery(format!("failed to list {} objects: {}", kind, error))
}

/// Builds one service per container of the workload's pod template.
fn services_for_workload<K: Rollout>(workload: &K, namespace: &str, pods: &[Pod]) -> Vec<Service> {
    let name = workload.name_any();
    let Some(pod_spec) = workload.pod_spec() else {
        warn!("Skipping {} {} without a pod template spec", K::kind_name(), name);
        return Vec::new();
    };
    let pod = workload
        .selector()
        .and_then(|selector| newest_running_pod(selector, pods));
    let labels = workload.labels().clone();
    let namespace = workload.namespace().unwrap_or_else(|| namespace.to_string());

    pod_spec
        .containers
        .iter()
        .filter_map(|container| {
            let Some(raw_image) = container.image.as_deref() else {
                warn!(
                    "Skipping container {} of {} {} without an image",
                    container.name,
                    K::kind_name(),
                    name
                );
                return None;
            };
            let image = match ImageReference::parse(raw_image) {
                Ok(image) => image,
                Err(e) => {
                    warn!(
                        "Skipping container {} of {} {}: image {} is invalid: {}",
                        container.name,
                        K::kind_name(),
                        name,
                        raw_image,
                        e
                    );
                    return None;
                }
            };
            // A digest pinned in the spec wins over what a possibly outdated pod reports
            let deployed_digest = image
                .digest
                .clone()
                .or_else(|| pod.and_then(|pod| running_digest(pod, &container.name)));

            Some(Service {
                id: ServiceId {
                    kind: K::kind_name().to_string(),
                    namespace: namespace.clone(),
                    name: name.clone(),
                    container: container.name.clone(),
                },
                name: name.clone(),
                labels: labels.clone(),
                image,
                deployed_digest,
            })
        })
        .collect()
}

/// Newest pod matched by `selector` whose containers all report an image ID.
fn newest_running_pod<'a>(selector: &BTreeMap<String, String>, pods: &'a [Pod]) -> Option<&'a Pod> {
    if selector.is_empty() {
        return None;
    }
    pods.iter()
        .filter(|pod| pod.metadata.deletion_timestamp.is_none())
        .filter(|pod| {
            let labels = pod.labels();
            selector
                .iter()
                .all(|(key, value)| labels.get(key) == Some(value))
        })
        .filter(|pod| {
            let statuses = pod
                .status
                .as_ref()
                .and_then(|status| status.container_statuses.as_ref());
            match statuses {
                Some(statuses) if !statuses.is_empty() => {
                    if let Some(invalid) = statuses.iter().find(|cs| cs.image_id.is_empty()) {
                        debug!(
                            "Skipping pod {} because container {} contains an empty imageID field",
                            pod.name_any(),
                            invalid.name
                        );
                        false
                    } else {
                        true
                    }
                }
                _ => false,
            }
        })
        .max_by(|a, b| {
            a.metadata
                .creation_timestamp
                .cmp(&b.metadata.creation_timestamp)
        })
}

/// Digest from a container status `imageID` such as `docker.io/library/nginx@sha256:...`.
fn running_digest(pod: &Pod, container: &str) -> Option<String> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|cs| cs.name == container)
        .and_then(|cs| cs.image_id.split_once('@'))
        .map(|(_, digest)| digest)
        .filter(|digest| is_valid_digest(digest))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const OLD: &str = "sha256:aaaa0000aaaa0000aaaa0000aaaa0000aaaa0000aaaa0000aaaa0000aaaa0000";
    const NEW: &str = "sha256:bbbb0000bbbb0000bbbb0000bbbb0000bbbb0000bbbb0000bbbb0000bbbb0000";
    const PINNED: &str = "sha256:cccc0000cccc0000cccc0000cccc0000cccc0000cccc0000cccc0000cccc0000";

    fn deployment(containers: serde_json::Value) -> Deployment {
        serde_json::from_value(json!({
            "metadata": {
                "name": "web",
                "namespace": "shop",
                "labels": { "kube-digest-updater/enabled": "true" }
            },
            "spec": {
                "selector": { "matchLabels": { "app": "web" } },
                "template": { "spec": { "containers": containers } }
            }
        }))
        .unwrap()
    }

    fn pod(name: &str, created: &str, app: &str, statuses: serde_json::Value) -> Pod {
        serde_json::from_value(json!({
            "metadata": {
                "name": name,
                "creationTimestamp": created,
                "labels": { "app": app }
            },
            "status": { "containerStatuses": statuses }
        }))
        .unwrap()
    }

    fn status(container: &str, digest: &str) -> serde_json::Value {
        json!({
            "name": container,
            "image": "nginx:latest",
            "imageID": format!("docker.io/library/nginx@{}", digest),
            "ready": true,
            "restartCount": 0
        })
    }

    #[test]
    fn test_services_take_digest_from_newest_pod() {
        let workload = deployment(json!([
            { "name": "app", "image": "nginx:latest" },
            { "name": "sidecar", "image": "ghcr.io/acme/proxy:2" }
        ]));
        let pods = vec![
            pod(
                "web-old",
                "2026-01-01T00:00:00Z",
                "web",
                json!([status("app", OLD), status("sidecar", OLD)]),
            ),
            pod(
                "web-new",
                "2026-02-01T00:00:00Z",
                "web",
                json!([status("app", NEW), status("sidecar", NEW)]),
            ),
            pod("other", "2026-03-01T00:00:00Z", "api", json!([status("app", PINNED)])),
        ];

        let services = services_for_workload(&workload, "default", &pods);
        assert_eq!(services.len(), 2);

        let app = &services[0];
        assert_eq!(app.id.to_string(), "Deployment/shop/web:app");
        assert_eq!(app.name, "web");
        assert_eq!(app.deployed_digest.as_deref(), Some(NEW));
        assert_eq!(app.labels.get("kube-digest-updater/enabled").map(String::as_str), Some("true"));

        let sidecar = &services[1];
        assert_eq!(sidecar.id.container, "sidecar");
        assert_eq!(sidecar.image.registry, "ghcr.io");
        assert_eq!(sidecar.deployed_digest.as_deref(), Some(NEW));
    }

    #[test]
    fn test_pinned_spec_digest_wins_over_pod_status() {
        let workload = deployment(json!([
            { "name": "app", "image": format!("nginx:latest@{}", PINNED) }
        ]));
        let pods = vec![pod("web-1", "2026-01-01T00:00:00Z", "web", json!([status("app", OLD)]))];

        let services = services_for_workload(&workload, "default", &pods);
        assert_eq!(services[0].deployed_digest.as_deref(), Some(PINNED));
    }

    #[test]
    fn test_missing_pod_leaves_digest_unknown() {
        let workload = deployment(json!([{ "name": "app", "image": "nginx:latest" }]));
        let pending = pod(
            "web-1",
            "2026-01-01T00:00:00Z",
            "web",
            json!([{
                "name": "app",
                "image": "nginx:latest",
                "imageID": "",
                "ready": false,
                "restartCount": 0
            }]),
        );

        let services = services_for_workload(&workload, "default", &[pending]);
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].deployed_digest, None);
    }

    #[test]
    fn test_invalid_images_are_skipped() {
        let workload = deployment(json!([
            { "name": "broken", "image": "app:" },
            { "name": "noimage" },
            { "name": "app", "image": "nginx" }
        ]));

        let services = services_for_workload(&workload, "default", &[]);
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].id.container, "app");
    }

    #[test]
    fn test_empty_selector_matches_no_pod() {
        let pods = vec![pod("web-1", "2026-01-01T00:00:00Z", "web", json!([status("app", OLD)]))];
        assert!(newest_running_pod(&BTreeMap::new(), &pods).is_none());
    }

    #[test]
    fn test_running_digest_ignores_malformed_image_id() {
        let malformed = pod(
            "web-1",
            "2026-01-01T00:00:00Z",
            "web",
            json!([{
                "name": "app",
                "image": "nginx",
                "imageID": "nginx-without-digest",
                "ready": true,
                "restartCount": 0
            }]),
        );
        assert_eq!(running_digest(&malformed, "app"), None);
        assert_eq!(running_digest(&malformed, "missing"), None);
    }
}
