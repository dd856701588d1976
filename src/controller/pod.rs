//! Pod reconciler.
//!
//! Acts on pods carrying the outdated marker: resolves the pod's top-level
//! owning controller, waits for any in-flight rollout to settle, then
//! triggers a rolling restart within the process-wide restart budget.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::Context;
use crate::k8s::rollout::RestartOutcome;
use crate::labels::OUTDATED_AT_LABEL;
use crate::Error;

/// Retry delay when a readiness check errors out
const READINESS_RETRY_DELAY: Duration = Duration::from_secs(15);

/// Safety-net recheck while a previous rollout is still progressing
const ROLLOUT_SETTLE_DELAY: Duration = Duration::from_secs(30);

/// Reconcile a marked pod: restart its owning workload controller
#[instrument(skip(pod, ctx), fields(pod = %pod.name_any(), ns = %pod.namespace().unwrap_or_default()))]
pub async fn reconcile(pod: Arc<Pod>, ctx: Arc<Context>) -> Result<Action, Error> {
    let _permit = ctx.serialize_pod_reconciles().await;
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();

    let Some(current) = ctx.kube.get_pod(&namespace, &name).await? else {
        debug!("pod is gone, nothing to do");
        return Ok(Action::await_change());
    };
    if !current
        .labels()
        .get(OUTDATED_AT_LABEL)
        .is_some_and(|v| !v.is_empty())
    {
        return Ok(Action::await_change());
    }

    let controller = match ctx.owners.resolve_top_controller(&namespace, &name).await {
        Ok(controller) => controller,
        Err(e) if e.is_gone() => {
            info!(error = %e, "owner chain vanished, skipping");
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };
    if controller.kind == "Pod" {
        info!("pod has no controller owner, skipping");
        return Ok(Action::await_change());
    }

    let ready = match ctx.rollouts.is_rollout_ready(&controller).await {
        Ok(ready) => ready,
        Err(Error::UnsupportedKind(kind)) => {
            info!(
                kind = %kind,
                controller = %controller.name,
                "unsupported controller kind, skipping"
            );
            return Ok(Action::await_change());
        }
        Err(e) if e.is_gone() => {
            info!(error = %e, "controller vanished, skipping");
            return Ok(Action::await_change());
        }
        Err(e) => {
            warn!(error = %e, "rollout readiness undetermined, retrying");
            return Ok(Action::requeue(READINESS_RETRY_DELAY));
        }
    };
    if !ready {
        info!(
            controller = %controller.name,
            kind = %controller.kind,
            "previous rollout still in progress, not restarting"
        );
        return Ok(Action::requeue(ROLLOUT_SETTLE_DELAY));
    }

    if let Err(wait) = ctx.governor.try_acquire_restart() {
        debug!(
            wait_secs = wait.as_secs(),
            "restart budget exhausted, requeueing"
        );
        return Ok(Action::requeue(wait));
    }

    let outcome = match ctx
        .rollouts
        .trigger_restart(&controller, ctx.config.dry_run)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) if e.is_gone() => {
            info!(error = %e, "controller vanished before restart, skipping");
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };
    match outcome {
        RestartOutcome::Triggered => info!(
            controller = %controller.name,
            kind = %controller.kind,
            "rollout restart triggered"
        ),
        RestartOutcome::Suppressed => debug!(
            controller = %controller.name,
            "restart suppressed, controller was restarted recently"
        ),
        RestartOutcome::DryRun => {}
    }
    Ok(Action::await_change())
}

/// Flat-delay retry after a failed reconcile; new pod events re-trigger the
/// work anyway, so no exponential growth here.
pub fn error_policy(pod: Arc<Pod>, error: &Error, ctx: Arc<Context>) -> Action {
    let delay = ctx.governor.pod_retry_delay();
    error!(
        error = %error,
        pod = %pod.name_any(),
        ns = %pod.namespace().unwrap_or_default(),
        retry_in_secs = delay.as_secs(),
        "pod reconciliation failed"
    );
    Action::requeue(delay)
}
