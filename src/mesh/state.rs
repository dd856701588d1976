//! The fused mesh-state cache.
//!
//! One instance lives for the process lifetime. Refreshes are single-flight
//! (a try-lock; losers return immediately and read whatever snapshot is
//! current) and TTL-bounded. Readers never block a refresh: the snapshot is
//! an immutable struct behind an `Arc` that each refresh replaces wholesale.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::k8s::KubeOps;
use crate::mesh::proxy_status::{parse_proxy_statuses, ProxyStatusRecord, ProxyStatusSource};
use crate::mesh::tags::{collect_revision_tags, MeshApi, RevisionTag};
use crate::Error;

/// How long a snapshot stays fresh before a reconcile triggers a refresh
const REFRESH_TTL: Duration = Duration::from_secs(10 * 60);

/// Immutable view produced by one refresh
#[derive(Default)]
struct Snapshot {
    proxy_statuses: Vec<ProxyStatusRecord>,
    tag_info: HashMap<String, RevisionTag>,
    revision_by_namespace: HashMap<String, String>,
    last_update: Option<Instant>,
}

/// Fused mesh view: revision tags, namespace assignments, proxy sync state
pub struct MeshState {
    snapshot: RwLock<Arc<Snapshot>>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl Default for MeshState {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshState {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    fn swap(&self, snapshot: Snapshot) {
        *self.snapshot.write() = Arc::new(snapshot);
    }

    /// Rebuild the cached view from the cluster and the control plane.
    ///
    /// No-ops when another refresh is in flight or the snapshot is younger
    /// than the TTL. A proxy-status failure after the tag rebuild leaves the
    /// fresh tags in place and surfaces the error; the stale timestamp makes
    /// the next caller retry.
    pub async fn refresh(
        &self,
        api: &dyn MeshApi,
        proxies: &dyn ProxyStatusSource,
    ) -> Result<(), Error> {
        let Ok(_guard) = self.refresh_lock.try_lock() else {
            debug!("mesh state is already being refreshed");
            return Ok(());
        };

        if let Some(last) = self.current().last_update {
            if last.elapsed() < REFRESH_TTL {
                debug!("mesh state is fresh, skipping refresh");
                return Ok(());
            }
        }
        info!("refreshing mesh state");

        let tags = collect_revision_tags(api).await?;
        let mut tag_info = HashMap::with_capacity(tags.len());
        let mut revision_by_namespace = HashMap::new();
        for tag in tags {
            for namespace in &tag.namespaces {
                revision_by_namespace.insert(namespace.clone(), tag.revision.clone());
            }
            tag_info.insert(tag.tag.clone(), tag);
        }
        for tag in tag_info.values() {
            debug!(
                tag = %tag.tag,
                revision = %tag.revision,
                namespaces = %tag.namespaces.join(","),
                "revision tag"
            );
        }

        // Publish the tag view before the proxy-status fetch so a transport
        // failure still leaves namespace resolution current.
        let previous = self.current();
        self.swap(Snapshot {
            proxy_statuses: previous.proxy_statuses.clone(),
            tag_info: tag_info.clone(),
            revision_by_namespace: revision_by_namespace.clone(),
            last_update: previous.last_update,
        });

        let responses = proxies.debug_sync().await?;
        let proxy_statuses = parse_proxy_statuses(&responses)?;
        info!(
            tags = tag_info.len(),
            proxies = proxy_statuses.len(),
            "refreshed mesh state"
        );
        self.swap(Snapshot {
            proxy_statuses,
            tag_info,
            revision_by_namespace,
            last_update: Some(Instant::now()),
        });
        Ok(())
    }

    /// Expire the snapshot so the next refresh runs regardless of the TTL.
    /// Called when a revision-tag webhook changes: the tag mapping is the one
    /// input that must not be served stale.
    pub fn invalidate(&self) {
        let previous = self.current();
        self.swap(Snapshot {
            proxy_statuses: previous.proxy_statuses.clone(),
            tag_info: previous.tag_info.clone(),
            revision_by_namespace: previous.revision_by_namespace.clone(),
            last_update: None,
        });
    }

    /// The revision a namespace is configured to use, if any
    pub fn desired_revision(&self, namespace: &str) -> Option<String> {
        self.current().revision_by_namespace.get(namespace).cloned()
    }

    /// The revision a tag resolves to, if the tag is known
    pub fn revision_for_tag(&self, tag: &str) -> Option<String> {
        self.current()
            .tag_info
            .get(tag)
            .map(|t| t.revision.clone())
    }

    /// Pods whose proxy reports a different revision than their namespace is
    /// configured for. Namespaces without a configured revision are skipped,
    /// as are pods that no longer exist.
    pub async fn check_proxied_pods(&self, kube: &dyn KubeOps) -> Result<Vec<Pod>, Error> {
        let snapshot = self.current();
        let mut outdated = Vec::new();
        for status in &snapshot.proxy_statuses {
            let Some(configured) = snapshot
                .revision_by_namespace
                .get(&status.proxied_pod_namespace)
            else {
                continue;
            };
            if *configured == status.control_plane_revision {
                continue;
            }
            info!(
                pod = %status.proxied_pod_name,
                ns = %status.proxied_pod_namespace,
                proxyRevision = %status.control_plane_revision,
                nsRevision = %configured,
                "Outdated pod found"
            );
            match kube
                .get_pod(&status.proxied_pod_namespace, &status.proxied_pod_name)
                .await
            {
                Ok(Some(pod)) => outdated.push(pod),
                Ok(None) => {
                    debug!(
                        pod = %status.proxied_pod_name,
                        ns = %status.proxied_pod_namespace,
                        "outdated pod no longer exists"
                    );
                }
                Err(e) => {
                    warn!(
                        pod = %status.proxied_pod_name,
                        ns = %status.proxied_pod_namespace,
                        error = %e,
                        "couldn't fetch outdated pod, continuing"
                    );
                }
            }
        }
        info!(count = outdated.len(), "checked proxied pods");
        Ok(outdated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::MockKubeOps;
    use crate::labels::{REVISION_LABEL, TAG_LABEL};
    use crate::mesh::proxy_status::{
        ClientConfig, ControlPlane, DiscoveryResponse, MockProxyStatusSource, Node,
        META_CLUSTER_ID, META_NAMESPACE, META_VERSION, TYPE_DEBUG_SYNCHRONIZATION,
    };
    use crate::mesh::tags::MockMeshApi;
    use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use prost::Message;
    use std::collections::BTreeMap;

    fn webhook(tag: &str, revision: &str) -> MutatingWebhookConfiguration {
        let mut labels = BTreeMap::new();
        labels.insert(REVISION_LABEL.to_string(), revision.to_string());
        labels.insert(TAG_LABEL.to_string(), tag.to_string());
        MutatingWebhookConfiguration {
            metadata: ObjectMeta {
                name: Some(format!("{tag}-wh")),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn sync_response(control_plane_pod: &str, pods: &[(&str, &str)]) -> DiscoveryResponse {
        let resources = pods
            .iter()
            .map(|(pod, ns)| {
                let mut fields = BTreeMap::new();
                for (key, value) in [
                    (META_NAMESPACE, *ns),
                    (META_CLUSTER_ID, "main"),
                    (META_VERSION, "1.21.3"),
                ] {
                    fields.insert(
                        key.to_string(),
                        prost_types::Value {
                            kind: Some(prost_types::value::Kind::StringValue(value.to_string())),
                        },
                    );
                }
                let config = ClientConfig {
                    node: Some(Node {
                        id: format!("{pod}.{ns}"),
                        metadata: Some(prost_types::Struct { fields }),
                    }),
                };
                prost_types::Any {
                    type_url: "type.googleapis.com/envoy.service.status.v3.ClientConfig"
                        .to_string(),
                    value: config.encode_to_vec(),
                }
            })
            .collect();
        DiscoveryResponse {
            version_info: "1".to_string(),
            resources,
            type_url: TYPE_DEBUG_SYNCHRONIZATION.to_string(),
            nonce: "n".to_string(),
            control_plane: Some(ControlPlane {
                identifier: control_plane_pod.to_string(),
            }),
        }
    }

    fn mesh_api_with_stable_tag() -> MockMeshApi {
        let mut api = MockMeshApi::new();
        api.expect_list_revision_webhooks()
            .returning(|| Ok(vec![webhook("stable", "v2")]));
        api.expect_namespaces_with_revision_label()
            .returning(|tag| match tag {
                "stable" => Ok(vec!["shop".to_string()]),
                _ => Ok(Vec::new()),
            });
        api
    }

    fn proxy_source_with(responses: Vec<(&'static str, Vec<(&'static str, &'static str)>)>) -> MockProxyStatusSource {
        let mut source = MockProxyStatusSource::new();
        source.expect_debug_sync().returning(move || {
            let mut map = HashMap::new();
            for (cp, pods) in &responses {
                map.insert(cp.to_string(), sync_response(cp, pods));
            }
            Ok(map)
        });
        source
    }

    #[tokio::test]
    async fn test_refresh_builds_namespace_index() {
        let state = MeshState::new();
        let api = mesh_api_with_stable_tag();
        let source = proxy_source_with(vec![(
            "control-plane-v2-abc-def",
            vec![("cart-6b9f", "shop")],
        )]);

        state.refresh(&api, &source).await.unwrap();

        assert_eq!(state.desired_revision("shop"), Some("v2".to_string()));
        assert_eq!(state.desired_revision("other"), None);
        assert_eq!(state.revision_for_tag("stable"), Some("v2".to_string()));
        assert_eq!(state.revision_for_tag("canary"), None);
    }

    #[tokio::test]
    async fn test_desired_revision_is_deterministic() {
        let state = MeshState::new();
        let api = mesh_api_with_stable_tag();
        let source = proxy_source_with(vec![]);
        state.refresh(&api, &source).await.unwrap();

        let first = state.desired_revision("shop");
        let second = state.desired_revision("shop");
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_is_ttl_bounded() {
        let state = MeshState::new();
        let source = proxy_source_with(vec![]);

        let mut api = MockMeshApi::new();
        api.expect_list_revision_webhooks()
            .times(1)
            .returning(|| Ok(vec![webhook("stable", "v2")]));
        api.expect_namespaces_with_revision_label()
            .returning(|_| Ok(vec!["shop".to_string()]));

        state.refresh(&api, &source).await.unwrap();
        // Within the TTL the second refresh must not touch the API again
        // (the mock's times(1) would fail the test otherwise).
        state.refresh(&api, &source).await.unwrap();

        tokio::time::advance(Duration::from_secs(11 * 60)).await;
        let mut api2 = MockMeshApi::new();
        api2.expect_list_revision_webhooks()
            .times(1)
            .returning(|| Ok(vec![webhook("stable", "v3")]));
        api2.expect_namespaces_with_revision_label()
            .returning(|_| Ok(vec!["shop".to_string()]));
        state.refresh(&api2, &source).await.unwrap();
        assert_eq!(state.desired_revision("shop"), Some("v3".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_expires_the_ttl() {
        let state = MeshState::new();
        let source = proxy_source_with(vec![]);
        let api = mesh_api_with_stable_tag();
        state.refresh(&api, &source).await.unwrap();
        assert_eq!(state.desired_revision("shop"), Some("v2".to_string()));

        // The tag webhook was re-pointed; without invalidation this refresh
        // would be a TTL no-op and keep serving v2.
        state.invalidate();
        // Reads between invalidation and refresh still see the old snapshot.
        assert_eq!(state.desired_revision("shop"), Some("v2".to_string()));

        let mut api2 = MockMeshApi::new();
        api2.expect_list_revision_webhooks()
            .returning(|| Ok(vec![webhook("stable", "v3")]));
        api2.expect_namespaces_with_revision_label()
            .returning(|_| Ok(vec!["shop".to_string()]));
        state.refresh(&api2, &source).await.unwrap();
        assert_eq!(state.desired_revision("shop"), Some("v3".to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_refresh_is_single_flight() {
        let state = MeshState::new();
        let _held = state.refresh_lock.lock().await;

        // With the lock held, a refresh returns success without touching
        // either source.
        let mut api = MockMeshApi::new();
        api.expect_list_revision_webhooks().never();
        let mut source = MockProxyStatusSource::new();
        source.expect_debug_sync().never();

        state.refresh(&api, &source).await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_tags_and_surfaces_error() {
        let state = MeshState::new();
        let api = mesh_api_with_stable_tag();
        let mut source = MockProxyStatusSource::new();
        source
            .expect_debug_sync()
            .returning(|| Err(Error::xds("connection refused")));

        let err = state.refresh(&api, &source).await.unwrap_err();
        assert!(matches!(err, Error::Xds(_)));

        // Tag view survived the failed proxy fetch...
        assert_eq!(state.desired_revision("shop"), Some("v2".to_string()));
        // ...and the snapshot is still considered stale, so the next refresh
        // retries the proxy fetch.
        let api = mesh_api_with_stable_tag();
        let source = proxy_source_with(vec![(
            "control-plane-v2-abc-def",
            vec![("cart-6b9f", "shop")],
        )]);
        state.refresh(&api, &source).await.unwrap();
    }

    #[tokio::test]
    async fn test_check_proxied_pods_reports_revision_drift() {
        let state = MeshState::new();
        let api = mesh_api_with_stable_tag();
        // Proxy still synced to v1 while the namespace wants v2; a second pod
        // in an unconfigured namespace is ignored.
        let source = proxy_source_with(vec![(
            "control-plane-v1-abc-def",
            vec![("cart-6b9f", "shop"), ("job-x", "batch")],
        )]);
        state.refresh(&api, &source).await.unwrap();

        let mut kube = MockKubeOps::new();
        kube.expect_get_pod()
            .withf(|ns, name| ns == "shop" && name == "cart-6b9f")
            .returning(|_, _| {
                Ok(Some(Pod {
                    metadata: ObjectMeta {
                        name: Some("cart-6b9f".to_string()),
                        namespace: Some("shop".to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                }))
            });

        let outdated = state.check_proxied_pods(&kube).await.unwrap();
        assert_eq!(outdated.len(), 1);
        assert_eq!(outdated[0].metadata.name.as_deref(), Some("cart-6b9f"));
    }

    #[tokio::test]
    async fn test_check_proxied_pods_skips_in_sync_proxies() {
        let state = MeshState::new();
        let api = mesh_api_with_stable_tag();
        let source = proxy_source_with(vec![(
            "control-plane-v2-abc-def",
            vec![("cart-6b9f", "shop")],
        )]);
        state.refresh(&api, &source).await.unwrap();

        let mut kube = MockKubeOps::new();
        kube.expect_get_pod().never();
        let outdated = state.check_proxied_pods(&kube).await.unwrap();
        assert!(outdated.is_empty());
    }
}
