//! Rolling-restart driver for workload controllers.
//!
//! Restarts are triggered the way `kubectl rollout restart` does it: a
//! strategic-merge patch stamps an annotation onto the workload's pod
//! template, and the workload controller's own update strategy takes over
//! from there.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::k8s::owner::PodController;
use crate::labels::RESTARTED_AT_ANNOTATION;
use crate::Error;

/// A controller restarted once stays untouched for this long, so event storms
/// cannot re-trigger a rollout that was just issued.
const RESTART_SUPPRESSION_MINUTES: i64 = 60;

/// What a restart request actually did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    /// The pod template was patched
    Triggered,
    /// A restart was already issued within the suppression window
    Suppressed,
    /// Dry-run mode: the intent was logged, nothing was patched
    DryRun,
}

/// Workload kinds that support a rolling restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    Deployment,
    DaemonSet,
    StatefulSet,
}

impl WorkloadKind {
    /// Look up a kind string in the registry of restartable kinds
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "Deployment" => Some(Self::Deployment),
            "DaemonSet" => Some(Self::DaemonSet),
            "StatefulSet" => Some(Self::StatefulSet),
            _ => None,
        }
    }
}

/// Drives rollout restarts and readiness checks for workload controllers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RolloutDriver: Send + Sync {
    /// Whether any previous rollout of this controller has completed.
    ///
    /// A restart is only issued on a settled controller; any other state
    /// (progressing, error, unknown) means hands off.
    async fn is_rollout_ready(&self, controller: &PodController) -> Result<bool, Error>;

    /// Trigger a rolling restart by stamping the pod-template annotation
    async fn trigger_restart(
        &self,
        controller: &PodController,
        dry_run: bool,
    ) -> Result<RestartOutcome, Error>;
}

/// Real driver backed by the cluster API
pub struct KubeRolloutDriver {
    client: Client,
}

impl KubeRolloutDriver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn shared(client: Client) -> Arc<dyn RolloutDriver> {
        Arc::new(Self::new(client))
    }

    async fn fetch<K>(&self, controller: &PodController) -> Result<K, Error>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &controller.namespace);
        api.get_opt(&controller.name)
            .await?
            .ok_or_else(|| Error::ControllerNotFound {
                kind: controller.kind.clone(),
                namespace: controller.namespace.clone(),
                name: controller.name.clone(),
            })
    }

    async fn restart_workload<K>(
        &self,
        controller: &PodController,
        dry_run: bool,
        template_annotations: fn(&K) -> Option<&BTreeMap<String, String>>,
    ) -> Result<RestartOutcome, Error>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let object: K = self.fetch(controller).await?;

        if let Some(previous) =
            template_annotations(&object).and_then(|a| a.get(RESTARTED_AT_ANNOTATION))
        {
            if within_suppression_window(previous, Utc::now()) {
                debug!(
                    ns = %controller.namespace,
                    podController = %controller.name,
                    restartedAt = %previous,
                    "Recent restart already issued, suppressing"
                );
                return Ok(RestartOutcome::Suppressed);
            }
        }

        if dry_run {
            info!(
                ns = %controller.namespace,
                podController = %controller.name,
                podControllerKind = %controller.kind,
                "Dry Run Mode: Not Patching Resource"
            );
            return Ok(RestartOutcome::DryRun);
        }

        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let api: Api<K> = Api::namespaced(self.client.clone(), &controller.namespace);
        let patch = restart_patch(&stamp);
        api.patch(&controller.name, &PatchParams::default(), &Patch::Strategic(&patch))
            .await?;
        info!(
            ns = %controller.namespace,
            podController = %controller.name,
            podControllerKind = %controller.kind,
            restartedAt = %stamp,
            "Triggered rollout restart"
        );
        Ok(RestartOutcome::Triggered)
    }
}

#[async_trait]
impl RolloutDriver for KubeRolloutDriver {
    async fn is_rollout_ready(&self, controller: &PodController) -> Result<bool, Error> {
        let kind = WorkloadKind::from_kind(&controller.kind)
            .ok_or_else(|| Error::UnsupportedKind(controller.kind.clone()))?;
        let ready = match kind {
            WorkloadKind::Deployment => {
                deployment_rollout_complete(&self.fetch::<Deployment>(controller).await?)
            }
            WorkloadKind::DaemonSet => {
                daemonset_rollout_complete(&self.fetch::<DaemonSet>(controller).await?)
            }
            WorkloadKind::StatefulSet => {
                statefulset_rollout_complete(&self.fetch::<StatefulSet>(controller).await?)
            }
        };
        debug!(
            ns = %controller.namespace,
            podController = %controller.name,
            podControllerKind = %controller.kind,
            ready,
            "Rollout readiness checked"
        );
        Ok(ready)
    }

    async fn trigger_restart(
        &self,
        controller: &PodController,
        dry_run: bool,
    ) -> Result<RestartOutcome, Error> {
        let kind = WorkloadKind::from_kind(&controller.kind)
            .ok_or_else(|| Error::UnsupportedKind(controller.kind.clone()))?;
        match kind {
            WorkloadKind::Deployment => {
                self.restart_workload::<Deployment>(controller, dry_run, |d| {
                    d.spec
                        .as_ref()?
                        .template
                        .metadata
                        .as_ref()?
                        .annotations
                        .as_ref()
                })
                .await
            }
            WorkloadKind::DaemonSet => {
                self.restart_workload::<DaemonSet>(controller, dry_run, |d| {
                    d.spec
                        .as_ref()?
                        .template
                        .metadata
                        .as_ref()?
                        .annotations
                        .as_ref()
                })
                .await
            }
            WorkloadKind::StatefulSet => {
                self.restart_workload::<StatefulSet>(controller, dry_run, |s| {
                    s.spec
                        .as_ref()?
                        .template
                        .metadata
                        .as_ref()?
                        .annotations
                        .as_ref()
                })
                .await
            }
        }
    }
}

/// The strategic-merge patch body for a restart stamp
fn restart_patch(stamp: &str) -> serde_json::Value {
    json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": { RESTARTED_AT_ANNOTATION: stamp }
                }
            }
        }
    })
}

/// Whether an existing restart stamp is recent enough to suppress a new one.
/// Unparseable stamps don't suppress.
fn within_suppression_window(stamp: &str, now: DateTime<Utc>) -> bool {
    match DateTime::parse_from_rfc3339(stamp) {
        Ok(at) => {
            now.signed_duration_since(at.with_timezone(&Utc))
                < ChronoDuration::minutes(RESTART_SUPPRESSION_MINUTES)
        }
        Err(_) => false,
    }
}

/// Whether the controller has observed the newest spec generation
fn generation_observed(generation: Option<i64>, observed: Option<i64>) -> bool {
    match (generation, observed) {
        (Some(generation), Some(observed)) => observed >= generation,
        (Some(_), None) => false,
        (None, _) => true,
    }
}

/// A Deployment's rollout is complete when its replica counts have converged
/// on the updated template.
fn deployment_rollout_complete(deployment: &Deployment) -> bool {
    let Some(status) = &deployment.status else {
        return false;
    };
    if !generation_observed(deployment.metadata.generation, status.observed_generation) {
        return false;
    }
    if let Some(conditions) = &status.conditions {
        if !conditions.is_empty() && !conditions.iter().any(|c| c.status == "True") {
            return false;
        }
    }
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let updated = status.updated_replicas.unwrap_or(0);
    let total = status.replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);
    updated >= desired && total <= updated && available >= updated
}

/// A DaemonSet's rollout is complete when the updated pods are scheduled and
/// available on every targeted node.
fn daemonset_rollout_complete(daemonset: &DaemonSet) -> bool {
    let Some(status) = &daemonset.status else {
        return false;
    };
    if !generation_observed(daemonset.metadata.generation, status.observed_generation) {
        return false;
    }
    if let Some(conditions) = &status.conditions {
        if !conditions.is_empty() && !conditions.iter().any(|c| c.status == "True") {
            return false;
        }
    }
    let desired = status.desired_number_scheduled;
    let updated = status.updated_number_scheduled.unwrap_or(0);
    let available = status.number_available.unwrap_or(0);
    updated >= desired && available >= desired
}

/// A StatefulSet's rollout is complete when replica counts converged and the
/// update revision has become the current revision.
fn statefulset_rollout_complete(statefulset: &StatefulSet) -> bool {
    let Some(status) = &statefulset.status else {
        return false;
    };
    if !generation_observed(statefulset.metadata.generation, status.observed_generation) {
        return false;
    }
    if let Some(conditions) = &status.conditions {
        if !conditions.is_empty() && !conditions.iter().any(|c| c.status == "True") {
            return false;
        }
    }
    let desired = statefulset
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let updated = status.updated_replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);
    if !(updated >= desired && status.replicas <= updated && available >= updated) {
        return false;
    }
    match (&status.update_revision, &status.current_revision) {
        (Some(update), Some(current)) => update == current,
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{
        DaemonSetSpec, DaemonSetStatus, DeploymentCondition, DeploymentSpec, DeploymentStatus,
        StatefulSetSpec, StatefulSetStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn deployment(generation: i64, status: DeploymentStatus, replicas: i32) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("cart".to_string()),
                generation: Some(generation),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            status: Some(status),
        }
    }

    fn settled_deployment_status(replicas: i32) -> DeploymentStatus {
        DeploymentStatus {
            observed_generation: Some(2),
            replicas: Some(replicas),
            updated_replicas: Some(replicas),
            available_replicas: Some(replicas),
            conditions: Some(vec![DeploymentCondition {
                type_: "Progressing".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    #[test]
    fn test_workload_kind_registry() {
        assert_eq!(
            WorkloadKind::from_kind("Deployment"),
            Some(WorkloadKind::Deployment)
        );
        assert_eq!(
            WorkloadKind::from_kind("DaemonSet"),
            Some(WorkloadKind::DaemonSet)
        );
        assert_eq!(
            WorkloadKind::from_kind("StatefulSet"),
            Some(WorkloadKind::StatefulSet)
        );
        assert_eq!(WorkloadKind::from_kind("Job"), None);
        assert_eq!(WorkloadKind::from_kind("Pod"), None);
        assert_eq!(WorkloadKind::from_kind("deployment"), None);
    }

    #[test]
    fn test_deployment_settled_is_ready() {
        let d = deployment(2, settled_deployment_status(3), 3);
        assert!(deployment_rollout_complete(&d));
    }

    #[test]
    fn test_deployment_mid_rollout_is_not_ready() {
        // Fewer updated replicas than desired: the rollout is still going.
        let mut status = settled_deployment_status(3);
        status.updated_replicas = Some(1);
        let d = deployment(2, status, 3);
        assert!(!deployment_rollout_complete(&d));

        // Old replicas still hanging around.
        let mut status = settled_deployment_status(3);
        status.replicas = Some(5);
        let d = deployment(2, status, 3);
        assert!(!deployment_rollout_complete(&d));

        // Updated but not yet available.
        let mut status = settled_deployment_status(3);
        status.available_replicas = Some(2);
        let d = deployment(2, status, 3);
        assert!(!deployment_rollout_complete(&d));
    }

    #[test]
    fn test_deployment_stale_observation_is_not_ready() {
        let mut status = settled_deployment_status(3);
        status.observed_generation = Some(1);
        let d = deployment(2, status, 3);
        assert!(!deployment_rollout_complete(&d));

        let mut status = settled_deployment_status(3);
        status.observed_generation = None;
        let d = deployment(2, status, 3);
        assert!(!deployment_rollout_complete(&d));
    }

    #[test]
    fn test_deployment_without_true_condition_is_not_ready() {
        let mut status = settled_deployment_status(3);
        status.conditions = Some(vec![DeploymentCondition {
            type_: "Progressing".to_string(),
            status: "False".to_string(),
            ..Default::default()
        }]);
        let d = deployment(2, status, 3);
        assert!(!deployment_rollout_complete(&d));
    }

    #[test]
    fn test_deployment_without_status_is_not_ready() {
        let mut d = deployment(2, settled_deployment_status(3), 3);
        d.status = None;
        assert!(!deployment_rollout_complete(&d));
    }

    #[test]
    fn test_daemonset_readiness() {
        let mut ds = DaemonSet {
            metadata: ObjectMeta {
                generation: Some(1),
                ..Default::default()
            },
            spec: Some(DaemonSetSpec::default()),
            status: Some(DaemonSetStatus {
                observed_generation: Some(1),
                desired_number_scheduled: 4,
                updated_number_scheduled: Some(4),
                number_available: Some(4),
                ..Default::default()
            }),
        };
        assert!(daemonset_rollout_complete(&ds));

        if let Some(status) = ds.status.as_mut() {
            status.updated_number_scheduled = Some(2);
        }
        assert!(!daemonset_rollout_complete(&ds));

        if let Some(status) = ds.status.as_mut() {
            status.updated_number_scheduled = Some(4);
            status.number_available = Some(3);
        }
        assert!(!daemonset_rollout_complete(&ds));
    }

    #[test]
    fn test_statefulset_requires_revision_convergence() {
        let mut sts = StatefulSet {
            metadata: ObjectMeta {
                generation: Some(1),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(2),
                ..Default::default()
            }),
            status: Some(StatefulSetStatus {
                observed_generation: Some(1),
                replicas: 2,
                updated_replicas: Some(2),
                available_replicas: Some(2),
                current_revision: Some("web-7d4f".to_string()),
                update_revision: Some("web-7d4f".to_string()),
                ..Default::default()
            }),
        };
        assert!(statefulset_rollout_complete(&sts));

        if let Some(status) = sts.status.as_mut() {
            status.update_revision = Some("web-9a1c".to_string());
        }
        assert!(!statefulset_rollout_complete(&sts));
    }

    #[test]
    fn test_suppression_window() {
        let now = Utc::now();
        let recent = (now - ChronoDuration::minutes(10)).to_rfc3339();
        assert!(within_suppression_window(&recent, now));

        let old = (now - ChronoDuration::minutes(90)).to_rfc3339();
        assert!(!within_suppression_window(&old, now));

        // Clock skew: a stamp slightly in the future still suppresses.
        let future = (now + ChronoDuration::minutes(5)).to_rfc3339();
        assert!(within_suppression_window(&future, now));

        assert!(!within_suppression_window("not-a-timestamp", now));
        assert!(!within_suppression_window("", now));
    }

    #[test]
    fn test_restart_patch_shape() {
        let patch = restart_patch("2026-08-02T10:00:00Z");
        assert_eq!(
            patch["spec"]["template"]["metadata"]["annotations"][RESTARTED_AT_ANNOTATION],
            "2026-08-02T10:00:00Z"
        );
    }
}
