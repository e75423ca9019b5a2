use std::sync::Arc;

use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{info, warn};

use crate::cdkstack::{drift, git_sync};
use crate::crd::{CdkTsStack, Phase};
use crate::error::{Error, Result};
use crate::metrics::{MetricsSink, DRIFT_STATUS_GROUP, GIT_SYNC_STATUS_GROUP};
use crate::store::ResourceStoreGateway;

fn is_succeeded(obj: &CdkTsStack) -> bool {
    obj.status.as_ref().map(|s| s.phase.clone()) == Some(Phase::Succeeded)
}

/// §4.5.2 / §4.5.5: drift-checks every `Succeeded` resource with `actions.driftDetection`
/// enabled. `DriftChecking` is an owned phase; once eligibility is confirmed here,
/// `drift::check` alone transitions the resource out of it. Per-resource failures are logged
/// and eventized but never abort the sweep.
pub async fn drift_sweep(store: &ResourceStoreGateway, metrics: &Arc<MetricsSink>) -> Result<()> {
    metrics.expire_group(DRIFT_STATUS_GROUP).await?;
    let resources = store.list_all().await?;
    let candidates: Vec<CdkTsStack> = resources
        .into_iter()
        .filter(|obj| is_succeeded(obj) && obj.spec.actions.drift_detection)
        .collect();
    info!(count = candidates.len(), "starting drift sweep");

    for obj in candidates {
        let namespace = match obj.namespace() {
            Some(ns) => ns,
            None => continue,
        };
        let name = obj.name_any();

        let fresh = match reconfirm(store, &namespace, &name, |o| {
            is_succeeded(o) && o.spec.actions.drift_detection
        })
        .await
        {
            Some(obj) => obj,
            None => continue,
        };

        if let Err(e) = drift::check(store, metrics, &fresh, &namespace, &name).await {
            warn!(
                namespace,
                name,
                error = %e,
                error_label = %e.metric_label(),
                "drift sweep: check failed for resource"
            );
            store
                .emit_event(
                    &namespace,
                    &fresh,
                    EventType::Warning,
                    "DriftCheckFailure",
                    format!("Drift check failed ({}): {e}", e.metric_label()),
                )
                .await;
        }
    }

    Ok(())
}

/// §4.5.2 / §4.5.6: Git-sync-checks every `Succeeded` resource with `actions.deploy` enabled
/// (auto-redeploy itself is gated separately, inside `git_sync::check`).
pub async fn git_sync_sweep(store: &ResourceStoreGateway, metrics: &Arc<MetricsSink>) -> Result<()> {
    metrics.expire_group(GIT_SYNC_STATUS_GROUP).await?;
    let resources = store.list_all().await?;
    let candidates: Vec<CdkTsStack> = resources
        .into_iter()
        .filter(|obj| is_succeeded(obj) && obj.spec.actions.deploy)
        .collect();
    info!(count = candidates.len(), "starting git-sync sweep");

    for obj in candidates {
        let namespace = match obj.namespace() {
            Some(ns) => ns,
            None => continue,
        };
        let name = obj.name_any();

        let fresh = match reconfirm(store, &namespace, &name, |o| {
            is_succeeded(o) && o.spec.actions.deploy
        })
        .await
        {
            Some(obj) => obj,
            None => continue,
        };

        if let Err(e) = git_sync::check(store, metrics, &fresh, &namespace, &name).await {
            warn!(
                namespace,
                name,
                error = %e,
                error_label = %e.metric_label(),
                "git-sync sweep: check failed for resource"
            );
            store
                .emit_event(
                    &namespace,
                    &fresh,
                    EventType::Warning,
                    "GitSyncCheckFailure",
                    format!("Git-sync check failed ({}): {e}", e.metric_label()),
                )
                .await;
        }
    }

    Ok(())
}

/// Re-reads the resource under the sweep's own authority and re-applies `eligible`: the object
/// may have moved on (finished deletion, had `driftDetection` toggled off, been picked up by the
/// other sweeper) between the initial list and this point in the loop. `None` means skip.
async fn reconfirm(
    store: &ResourceStoreGateway,
    namespace: &str,
    name: &str,
    eligible: impl Fn(&CdkTsStack) -> bool,
) -> Option<CdkTsStack> {
    match store.get(namespace, name).await {
        Ok(obj) if eligible(&obj) => Some(obj),
        Ok(_) => None,
        Err(Error::NotFound) => None,
        Err(e) => {
            warn!(
                namespace,
                name,
                error = %e,
                error_label = %e.metric_label(),
                "sweep: failed to re-read resource, skipping"
            );
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn stack(phase: Phase, drift_detection: bool, deploy: bool) -> CdkTsStack {
        use crate::crd::{Actions, CdkTsStackSpec, CdkTsStackStatus};
        let mut obj = CdkTsStack::new(
            "x",
            CdkTsStackSpec {
                credentials_secret_name: "creds".to_owned(),
                actions: Actions {
                    drift_detection,
                    deploy,
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        obj.status = Some(CdkTsStackStatus { phase, ..Default::default() });
        obj
    }

    #[test]
    fn only_succeeded_with_drift_detection_is_eligible() {
        assert!(is_succeeded(&stack(Phase::Succeeded, true, false)));
        assert!(!is_succeeded(&stack(Phase::Failed, true, false)));
    }

    #[test]
    fn cloning_phase_is_never_succeeded() {
        assert!(!is_succeeded(&stack(Phase::Cloning, true, true)));
    }
}
