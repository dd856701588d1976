//! Owner-chain resolution for pods.
//!
//! A pod's rolling restart has to happen on its top-level workload controller
//! (the Deployment behind a ReplicaSet, not the ReplicaSet itself). The chain
//! is discovered dynamically from owner references so that intermediate kinds
//! we never heard of still resolve.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::{Api, Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Owner graphs are acyclic in practice, but the walk is bounded anyway.
const MAX_OWNER_DEPTH: usize = 8;

/// A pod's top-level owning controller
#[derive(Debug, Clone)]
pub struct PodController {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub object: DynamicObject,
}

/// Resolves a pod to its top-level owning controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OwnerResolver: Send + Sync {
    /// Walk the owner-reference chain from a pod upwards.
    ///
    /// Returns the pod itself (kind `Pod`) when it has no controller owner;
    /// callers must check the kind before acting.
    async fn resolve_top_controller(
        &self,
        namespace: &str,
        pod_name: &str,
    ) -> Result<PodController, Error>;
}

/// Real resolver using dynamic resource lookups
pub struct DynamicOwnerResolver {
    client: Client,
}

impl DynamicOwnerResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn shared(client: Client) -> Arc<dyn OwnerResolver> {
        Arc::new(Self::new(client))
    }
}

#[async_trait]
impl OwnerResolver for DynamicOwnerResolver {
    async fn resolve_top_controller(
        &self,
        namespace: &str,
        pod_name: &str,
    ) -> Result<PodController, Error> {
        let pod_resource = ApiResource {
            group: String::new(),
            version: "v1".to_string(),
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            plural: "pods".to_string(),
        };
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &pod_resource);
        let mut object = api
            .get_opt(pod_name)
            .await?
            .ok_or_else(|| Error::PodNotFound {
                namespace: namespace.to_string(),
                name: pod_name.to_string(),
            })?;
        let mut kind = "Pod".to_string();

        for _ in 0..MAX_OWNER_DEPTH {
            let Some(owner) = controller_reference(&object) else {
                break;
            };
            let resource = api_resource_for(&owner);
            let api: Api<DynamicObject> =
                Api::namespaced_with(self.client.clone(), namespace, &resource);
            object = api.get_opt(&owner.name).await?.ok_or_else(|| {
                Error::ControllerNotFound {
                    kind: owner.kind.clone(),
                    namespace: namespace.to_string(),
                    name: owner.name.clone(),
                }
            })?;
            kind = owner.kind.clone();
        }

        let name = object.name_any();
        Ok(PodController {
            kind,
            name,
            namespace: namespace.to_string(),
            object,
        })
    }
}

/// The owner reference flagged as the managing controller, if any
fn controller_reference(object: &DynamicObject) -> Option<OwnerReference> {
    object
        .owner_references()
        .iter()
        .find(|r| r.controller.unwrap_or(false))
        .cloned()
}

/// Build the dynamic resource descriptor for an owner reference
fn api_resource_for(owner: &OwnerReference) -> ApiResource {
    let (group, version) = parse_api_version(&owner.api_version);
    ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version: owner.api_version.clone(),
        kind: owner.kind.clone(),
        plural: pluralize_kind(&owner.kind),
    }
}

/// Parse an apiVersion into group and version components
fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        // Core API (e.g. "v1")
        None => ("", api_version),
    }
}

/// Convert a Kind to its plural resource name
fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    match lower.as_str() {
        "deployment" => "deployments".to_string(),
        "daemonset" => "daemonsets".to_string(),
        "replicaset" => "replicasets".to_string(),
        "statefulset" => "statefulsets".to_string(),
        "replicationcontroller" => "replicationcontrollers".to_string(),
        "job" => "jobs".to_string(),
        "cronjob" => "cronjobs".to_string(),
        _ => format!("{}s", lower),
    }
}
