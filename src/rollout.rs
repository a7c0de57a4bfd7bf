use chrono::Utc;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::PodSpec;
use kube::api::{Patch, PatchParams};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::debug;

pub static UPDATED_AT_ANNOTATION: &str = "kube-digest-updater/updatedAt";
pub static FIELD_MANAGER: &str = "kube-digest-updater";

/// A workload kind whose pod template can be repointed at a new image.
pub trait Rollout
where
    Self: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Send
        + Sync
        + DeserializeOwned
        + 'static,
{
    fn kind_name() -> &'static str {
        std::any::type_name::<Self>()
            .rsplit("::")
            .next()
            .unwrap_or("Workload")
    }
    fn selector(&self) -> Option<&BTreeMap<String, String>>;
    fn pod_spec(&self) -> Option<&PodSpec>;

    /// Sets `container` to `image` in the pod template with one strategic merge
    /// patch. Containers merge by name, so the other containers are untouched.
    async fn patch_container_image(
        api: &Api<Self>,
        resource_name: &str,
        container: &str,
        image: &str,
    ) -> kube::Result<()> {
        let patch = json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": {
                            UPDATED_AT_ANNOTATION: Utc::now().to_rfc3339(),
                        }
                    },
                    "spec": {
                        "containers": [
                            { "name": container, "image": image }
                        ]
                    }
                }
            }
        });

        debug!(
            "Patching {} {} with patch {}",
            Self::kind_name(),
            resource_name,
            patch
        );
        api.patch(
            resource_name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Strategic(&patch),
        )
        .await?;
        Ok(())
    }
}

impl Rollout for Deployment {
    fn selector(&self) -> Option<&BTreeMap<String, String>> {
        self.spec.as_ref()?.selector.match_labels.as_ref()
    }

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }
}

impl Rollout for StatefulSet {
    fn selector(&self) -> Option<&BTreeMap<String, String>> {
        self.spec.as_ref()?.selector.match_labels.as_ref()
    }

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }
}

impl Rollout for DaemonSet {
    fn selector(&self) -> Option<&BTreeMap<String, String>> {
        self.spec.as_ref()?.selector.match_labels.as_ref()
    }

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }
}
