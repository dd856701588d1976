//! Namespace reconciler.
//!
//! Fires when a namespace's revision label changes (or when a webhook event
//! fans out to the namespace). Re-resolves the namespace's desired revision
//! and marks every pod whose sidecar annotation disagrees; the pod
//! reconciler takes it from there.

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{error, info, instrument, warn};

use crate::controller::Context;
use crate::k8s::KubeOps;
use crate::labels::{OUTDATED_AT_LABEL, REVISION_LABEL};
use crate::Error;

/// Reconcile a namespace: detect and mark outdated pods
#[instrument(skip(namespace, ctx), fields(namespace = %namespace.name_any()))]
pub async fn reconcile(namespace: Arc<Namespace>, ctx: Arc<Context>) -> Result<Action, Error> {
    let _permit = ctx.serialize_namespace_reconciles().await;
    let name = namespace.name_any();

    let Some(tag) = namespace
        .labels()
        .get(REVISION_LABEL)
        .filter(|v| !v.is_empty())
        .cloned()
    else {
        return Ok(Action::await_change());
    };

    if let Err(e) = ctx
        .mesh
        .refresh(ctx.mesh_api.as_ref(), ctx.proxies.as_ref())
        .await
    {
        warn!(error = %e, "mesh state refresh failed");
        return Err(e);
    }

    // The cache answers from its tag fan-out; a namespace it doesn't know yet
    // falls back to resolving the tag through its injection webhook.
    let desired = match ctx.mesh.desired_revision(&name) {
        Some(revision) => revision,
        None => match ctx.kube.webhook_revision_for_tag(&tag).await? {
            Some(revision) => revision,
            None => {
                info!(tag = %tag, "no revision resolves for namespace tag");
                ctx.governor.record_namespace_success(&name);
                return Ok(Action::await_change());
            }
        },
    };

    let pods = ctx.kube.list_pods(&name).await?;
    let mut marked = 0;
    for pod in &pods {
        if mark_pod_if_outdated(ctx.kube.as_ref(), pod, &desired).await? {
            marked += 1;
        }
    }
    if marked > 0 {
        info!(marked, desired = %desired, "labeled outdated pods");
    }

    ctx.governor.record_namespace_success(&name);
    Ok(Action::await_change())
}

/// Mark one pod as outdated when its observed revision disagrees with the
/// desired one.
///
/// A pod is outdated only when both revisions are non-empty and differ. Pods
/// already carrying the marker are left alone; the pod reconciler owns them
/// from the first marking on.
pub async fn mark_pod_if_outdated(
    kube: &dyn KubeOps,
    pod: &Pod,
    desired: &str,
) -> Result<bool, Error> {
    let observed = pod
        .annotations()
        .get(REVISION_LABEL)
        .cloned()
        .unwrap_or_default();
    if observed.is_empty() || desired.is_empty() || observed == desired {
        return Ok(false);
    }
    if pod
        .labels()
        .get(OUTDATED_AT_LABEL)
        .is_some_and(|v| !v.is_empty())
    {
        return Ok(false);
    }

    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();
    let stamp = Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default()
        .to_string();
    info!(
        pod = %name,
        ns = %namespace,
        observed = %observed,
        desired = %desired,
        "marking pod outdated"
    );
    kube.label_pod_outdated(&namespace, &name, &stamp).await?;
    Ok(true)
}

/// Requeue with the composite backoff after a failed reconcile
pub fn error_policy(namespace: Arc<Namespace>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = namespace.name_any();
    let delay = ctx.governor.namespace_retry_delay(&name);
    error!(
        error = %error,
        namespace = %name,
        retry_in_secs = delay.as_secs(),
        "namespace reconciliation failed"
    );
    Action::requeue(delay)
}
