//! Kubernetes client seams.
//!
//! The reconcilers talk to the cluster through small traits so tests can mock
//! the API surface while production wires in the real client.

pub mod owner;
pub mod rollout;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;

#[cfg(test)]
use mockall::automock;

use crate::labels::{OUTDATED_AT_LABEL, REVISION_LABEL, TAG_LABEL};
use crate::Error;

/// Pod and webhook operations used by the reconcilers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeOps: Send + Sync {
    /// List all pods in a namespace
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, Error>;

    /// Fetch a single pod, or None if it no longer exists
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// Set the outdated marker label on a pod
    async fn label_pod_outdated(
        &self,
        namespace: &str,
        name: &str,
        stamp: &str,
    ) -> Result<(), Error>;

    /// Resolve a revision tag to its revision via the tag's injection webhook
    async fn webhook_revision_for_tag(&self, tag: &str) -> Result<Option<String>, Error>;
}

/// Real [`KubeOps`] implementation backed by the cluster API
pub struct KubeApi {
    client: Client,
}

impl KubeApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn shared(client: Client) -> Arc<dyn KubeOps> {
        Arc::new(Self::new(client))
    }
}

#[async_trait]
impl KubeOps for KubeApi {
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default()).await?;
        Ok(pods.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn label_pod_outdated(
        &self,
        namespace: &str,
        name: &str,
        stamp: &str,
    ) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({
            "metadata": {
                "labels": { OUTDATED_AT_LABEL: stamp }
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn webhook_revision_for_tag(&self, tag: &str) -> Result<Option<String>, Error> {
        let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
        let selector = format!("{TAG_LABEL}={tag}");
        let webhooks = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(webhooks
            .items
            .iter()
            .find_map(|wh| wh.labels().get(REVISION_LABEL).cloned()))
    }
}
