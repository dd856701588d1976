//! Proxy synchronization snapshots.
//!
//! The control plane answers a debug-synchronization discovery request with
//! one `DiscoveryResponse` per control-plane instance, each enumerating the
//! proxies it configures as `ClientConfig` resources. This module defines the
//! wire shapes and turns them into [`ProxyStatusRecord`]s.

use std::collections::HashMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use prost::Message;
use regex::Regex;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Type URL of the debug-synchronization discovery request
pub const TYPE_DEBUG_SYNCHRONIZATION: &str = "mesh.io/debug/syncz";

/// Type URL of the per-proxy sync-state resources in the response
pub const TYPE_CLIENT_CONFIG: &str =
    "type.googleapis.com/envoy.service.status.v3.ClientConfig";

/// Node metadata key for the proxy's cluster
pub const META_CLUSTER_ID: &str = "CLUSTER_ID";

/// Node metadata key for the proxied pod's namespace
pub const META_NAMESPACE: &str = "NAMESPACE";

/// Node metadata key for the control-plane version the proxy reports
pub const META_VERSION: &str = "VERSION";

/// Control-plane pods are named `control-plane-<REV>-<hash>-<hash>`; the
/// revision is everything between the prefix and the two hash segments.
static REVISION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^control-plane-(.+)-[^-]+-[^-]+$").expect("revision pattern must compile")
});

/// Sync state of one proxied pod, as reported by its control-plane instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyStatusRecord {
    pub cluster_id: String,
    pub control_plane_pod: String,
    pub control_plane_revision: String,
    pub control_plane_version: String,
    /// Fully qualified proxy node id, `<pod>.<namespace>`
    pub proxied_pod_id: String,
    pub proxied_pod_name: String,
    pub proxied_pod_namespace: String,
}

/// Capability to fetch the current proxy sync snapshots, keyed by
/// control-plane pod id
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProxyStatusSource: Send + Sync {
    async fn debug_sync(&self) -> Result<HashMap<String, DiscoveryResponse>, Error>;
}

// Minimal wire shapes for the discovery exchange. Field numbers follow the
// xDS protocol.

#[derive(Clone, PartialEq, prost::Message)]
pub struct DiscoveryRequest {
    #[prost(message, optional, tag = "2")]
    pub node: Option<Node>,
    #[prost(string, tag = "4")]
    pub type_url: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DiscoveryResponse {
    #[prost(string, tag = "1")]
    pub version_info: String,
    #[prost(message, repeated, tag = "2")]
    pub resources: Vec<prost_types::Any>,
    #[prost(string, tag = "4")]
    pub type_url: String,
    #[prost(string, tag = "5")]
    pub nonce: String,
    #[prost(message, optional, tag = "6")]
    pub control_plane: Option<ControlPlane>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ControlPlane {
    #[prost(string, tag = "1")]
    pub identifier: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Node {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(message, optional, tag = "3")]
    pub metadata: Option<prost_types::Struct>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ClientConfig {
    #[prost(message, optional, tag = "1")]
    pub node: Option<Node>,
}

/// The control plane writes its instance identity as JSON; fall back to the
/// raw string when it isn't.
#[derive(Debug, serde::Deserialize)]
struct ControlPlaneIdentity {
    #[serde(alias = "ID")]
    id: String,
}

/// Control-plane pod id carried in a response
pub fn control_plane_id(response: &DiscoveryResponse) -> String {
    let identifier = response
        .control_plane
        .as_ref()
        .map(|cp| cp.identifier.as_str())
        .unwrap_or_default();
    match serde_json::from_str::<ControlPlaneIdentity>(identifier) {
        Ok(identity) => identity.id,
        Err(_) => identifier.to_string(),
    }
}

/// Strip the revision out of a control-plane pod name, or empty when the name
/// doesn't match the expected shape.
pub fn parse_control_plane_revision(pod_name: &str) -> String {
    REVISION_PATTERN
        .captures(pod_name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

/// Flatten a debug-synchronization response map into proxy status records
pub fn parse_proxy_statuses(
    responses: &HashMap<String, DiscoveryResponse>,
) -> Result<Vec<ProxyStatusRecord>, Error> {
    let mut records = Vec::new();
    for response in responses.values() {
        let control_plane_pod = control_plane_id(response);
        let control_plane_revision = parse_control_plane_revision(&control_plane_pod);
        for resource in &response.resources {
            let config = ClientConfig::decode(resource.value.as_slice())
                .map_err(|e| Error::proxy_status_parse(format!("ClientConfig: {e}")))?;
            let node = config
                .node
                .ok_or_else(|| Error::proxy_status_parse("ClientConfig without node"))?;
            let namespace = metadata_string(&node, META_NAMESPACE);
            let pod_name = node
                .id
                .strip_suffix(&format!(".{namespace}"))
                .unwrap_or(&node.id)
                .to_string();
            records.push(ProxyStatusRecord {
                cluster_id: metadata_string(&node, META_CLUSTER_ID),
                control_plane_pod: control_plane_pod.clone(),
                control_plane_revision: control_plane_revision.clone(),
                control_plane_version: metadata_string(&node, META_VERSION),
                proxied_pod_id: node.id.clone(),
                proxied_pod_name: pod_name,
                proxied_pod_namespace: namespace,
            });
        }
    }
    Ok(records)
}

fn metadata_string(node: &Node, key: &str) -> String {
    node.metadata
        .as_ref()
        .and_then(|m| m.fields.get(key))
        .and_then(|v| match &v.kind {
            Some(prost_types::value::Kind::StringValue(s)) => Some(s.clone()),
            _ => None,
        })
        .unwrap_or_default()
}
