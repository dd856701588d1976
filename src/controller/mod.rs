//! Controller wiring and shared reconcile context.
//!
//! Two controllers cooperate: the namespace controller detects pods whose
//! sidecar revision no longer matches what their namespace selects and marks
//! them, and the pod controller acts on marked pods by rolling their owning
//! workload controller. Webhook configuration changes fan out to every
//! namespace pointed at the changed tag.

pub mod namespace;
pub mod pod;

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, Controller, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::k8s::owner::{DynamicOwnerResolver, OwnerResolver};
use crate::k8s::rollout::{KubeRolloutDriver, RolloutDriver};
use crate::k8s::{KubeApi, KubeOps};
use crate::labels::{
    INJECTOR_APP_LABEL, INJECTOR_APP_VALUE, OUTDATED_AT_LABEL, REVISION_LABEL, TAG_LABEL,
};
use crate::mesh::xds::XdsProxyStatusSource;
use crate::mesh::{KubeMeshApi, MeshApi, MeshState, ProxyStatusSource};
use crate::ratelimit::Governor;

/// Shared state for both reconcilers.
///
/// Holds the client seams as trait objects so tests can swap in mocks, the
/// way production swaps in the real cluster-backed implementations.
pub struct Context {
    pub config: Config,
    pub kube: Arc<dyn KubeOps>,
    pub mesh_api: Arc<dyn MeshApi>,
    pub proxies: Arc<dyn ProxyStatusSource>,
    pub owners: Arc<dyn OwnerResolver>,
    pub rollouts: Arc<dyn RolloutDriver>,
    pub mesh: Arc<MeshState>,
    pub governor: Arc<Governor>,
    /// One reconcile in flight per controller
    namespace_serial: Semaphore,
    pod_serial: Semaphore,
}

impl Context {
    /// Create a context wired to the real cluster
    pub fn new(client: Client, config: Config) -> Self {
        let governor = Arc::new(Governor::new(&config));
        Self {
            kube: KubeApi::shared(client.clone()),
            mesh_api: KubeMeshApi::shared(client.clone()),
            proxies: Arc::new(XdsProxyStatusSource::new(config.xds.clone(), client.clone())),
            owners: DynamicOwnerResolver::shared(client.clone()),
            rollouts: KubeRolloutDriver::shared(client),
            mesh: Arc::new(MeshState::new()),
            governor,
            namespace_serial: Semaphore::new(1),
            pod_serial: Semaphore::new(1),
            config,
        }
    }

    /// Create a context with custom client implementations.
    ///
    /// This is primarily used for testing with mock clients.
    pub fn with_clients(
        config: Config,
        kube: Arc<dyn KubeOps>,
        mesh_api: Arc<dyn MeshApi>,
        proxies: Arc<dyn ProxyStatusSource>,
        owners: Arc<dyn OwnerResolver>,
        rollouts: Arc<dyn RolloutDriver>,
    ) -> Self {
        let governor = Arc::new(Governor::new(&config));
        Self {
            kube,
            mesh_api,
            proxies,
            owners,
            rollouts,
            mesh: Arc::new(MeshState::new()),
            governor,
            namespace_serial: Semaphore::new(1),
            pod_serial: Semaphore::new(1),
            config,
        }
    }

    pub(crate) async fn serialize_namespace_reconciles(
        &self,
    ) -> Option<tokio::sync::SemaphorePermit<'_>> {
        self.namespace_serial.acquire().await.ok()
    }

    pub(crate) async fn serialize_pod_reconciles(
        &self,
    ) -> Option<tokio::sync::SemaphorePermit<'_>> {
        self.pod_serial.acquire().await.ok()
    }
}

/// Namespace requests synthesized from a webhook event.
///
/// Only webhooks owned by the sidecar injector and carrying a tag are
/// admitted; for those, every namespace whose revision label equals the tag
/// is enqueued.
fn namespaces_for_webhook(
    webhook: &MutatingWebhookConfiguration,
    namespaces: &Store<Namespace>,
) -> Vec<ObjectRef<Namespace>> {
    let labels = webhook.labels();
    if labels.get(INJECTOR_APP_LABEL).map(String::as_str) != Some(INJECTOR_APP_VALUE) {
        return Vec::new();
    }
    let Some(tag) = labels.get(TAG_LABEL).filter(|t| !t.is_empty()) else {
        return Vec::new();
    };

    let affected: Vec<ObjectRef<Namespace>> = namespaces
        .state()
        .iter()
        .filter(|ns| ns.labels().get(REVISION_LABEL) == Some(tag))
        .map(|ns| ObjectRef::from_obj(ns.as_ref()))
        .collect();
    debug!(
        webhook = %webhook.name_any(),
        tag = %tag,
        affected = affected.len(),
        "webhook change fans out to namespaces"
    );
    affected
}

/// One-time catch-up for drift that predates this process: refresh the mesh
/// view and mark any pod whose proxy reports a revision its namespace no
/// longer selects.
pub async fn initial_drift_sweep(ctx: &Context) {
    if let Err(e) = ctx
        .mesh
        .refresh(ctx.mesh_api.as_ref(), ctx.proxies.as_ref())
        .await
    {
        warn!(error = %e, "initial mesh state refresh failed, skipping drift sweep");
        return;
    }
    let pods = match ctx.mesh.check_proxied_pods(ctx.kube.as_ref()).await {
        Ok(pods) => pods,
        Err(e) => {
            warn!(error = %e, "initial drift sweep failed");
            return;
        }
    };
    let mut marked = 0;
    for pod in &pods {
        let Some(ns) = pod.namespace() else { continue };
        let Some(desired) = ctx.mesh.desired_revision(&ns) else {
            continue;
        };
        match namespace::mark_pod_if_outdated(ctx.kube.as_ref(), pod, &desired).await {
            Ok(true) => marked += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(pod = %pod.name_any(), ns = %ns, error = %e, "couldn't mark pod, continuing");
            }
        }
    }
    info!(candidates = pods.len(), marked, "initial drift sweep done");
}

/// Run both controllers until shutdown
pub async fn run_controllers(client: Client, ctx: Arc<Context>) {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());
    let webhooks: Api<MutatingWebhookConfiguration> = Api::all(client.clone());

    let namespace_selector = watcher::Config::default().labels(REVISION_LABEL);
    let pod_selector = watcher::Config::default().labels(OUTDATED_AT_LABEL);
    let webhook_selector = watcher::Config::default().labels(TAG_LABEL);

    // Label index of revision-labeled namespaces, kept warm for the webhook
    // fan-out mapper (the mapper is synchronous and cannot list).
    let (namespace_index, index_writer) = reflector::store::<Namespace>();
    let index_task = watcher(Api::<Namespace>::all(client), namespace_selector.clone())
        .default_backoff()
        .reflect(index_writer)
        .applied_objects()
        .for_each(|event| {
            if let Err(e) = event {
                warn!(error = %e, "namespace index watch error");
            }
            futures::future::ready(())
        });

    let index_for_mapper = namespace_index.clone();
    let mesh_for_mapper = ctx.mesh.clone();
    let namespace_controller = Controller::new(namespaces, namespace_selector)
        .watches(webhooks, webhook_selector, move |webhook| {
            let affected = namespaces_for_webhook(&webhook, &index_for_mapper);
            if !affected.is_empty() {
                // A changed tag mapping must not be answered from a cached
                // snapshot when the fan-out reconciles run.
                mesh_for_mapper.invalidate();
            }
            affected
        })
        .shutdown_on_signal()
        .run(namespace::reconcile, namespace::error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(?obj, "Namespace reconciliation completed"),
                Err(e) => debug!(error = ?e, "Namespace reconciliation error"),
            }
        });

    let pod_controller = Controller::new(pods, pod_selector)
        .shutdown_on_signal()
        .run(pod::reconcile, pod::error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(?obj, "Pod reconciliation completed"),
                Err(e) => debug!(error = ?e, "Pod reconciliation error"),
            }
        });

    info!("Starting namespace and pod controllers...");
    tokio::select! {
        _ = index_task => info!("namespace index stream ended"),
        _ = namespace_controller => info!("Namespace controller completed"),
        _ = pod_controller => info!("Pod controller completed"),
    }
}
