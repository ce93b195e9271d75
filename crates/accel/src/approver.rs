//! Install-plan approver: a cluster-wide watch that flips
//! `spec.approved` to true on every pending install plan it observes.

use anyhow::{anyhow, Result};
use futures::TryStreamExt;
use kube::api::{Api, Patch, PatchParams, WatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, WatchEvent};
use kube::Client;
use metrics::counter;
use serde_json::{json, Value};
use tracing::{info, warn};

use zap_core::{ShutdownSignal, RETRY_TIME};

fn install_plan_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("operators.coreos.com", "v1alpha1", "InstallPlan"),
        "installplans",
    )
}

/// Resource version to resume the watch from after `event`. Watch errors
/// reset to "0": resuming from a stale version (410 Gone) would replay
/// the same expired-version error on every restart.
fn resume_version(event: &WatchEvent<DynamicObject>, current: &str) -> String {
    match event {
        WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o
            .metadata
            .resource_version
            .clone()
            .unwrap_or_else(|| current.to_string()),
        WatchEvent::Bookmark(b) => b.metadata.resource_version.clone(),
        WatchEvent::Error(_) => "0".to_string(),
    }
}

fn is_approved(plan: &DynamicObject) -> bool {
    plan.data
        .pointer("/spec/approved")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

async fn approve(client: &Client, ar: &ApiResource, plan: &DynamicObject) -> Result<()> {
    let name = plan
        .metadata
        .name
        .clone()
        .ok_or_else(|| anyhow!("install plan without a name"))?;
    let namespace = plan.metadata.namespace.clone().unwrap_or_default();
    info!(%name, %namespace, "approving installplan");
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), &namespace, ar);
    api.patch(
        &name,
        &PatchParams::default(),
        &Patch::Merge(json!({ "spec": { "approved": true } })),
    )
    .await?;
    counter!("installplans_approved", 1u64);
    Ok(())
}

/// Watch install plans in all namespaces until shutdown. Self-restarting:
/// plain events advance the resume point, watch errors reset it to "0"
/// and back off at the shared cadence, as do construction failures. Patch
/// failures are logged and skipped; the plan resurfaces on the next
/// resync.
pub async fn approve_install_plans(client: Client, mut signal: ShutdownSignal) {
    let ar = install_plan_resource();
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
    let mut resource_version = "0".to_string();
    loop {
        if signal.is_triggered() {
            info!("stopping installplan watcher");
            return;
        }
        let stream = match api.watch(&WatchParams::default(), &resource_version).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "watch installplans error, will retry in {}s", RETRY_TIME.as_secs());
                signal.sleep(RETRY_TIME).await;
                continue;
            }
        };
        futures::pin_mut!(stream);
        loop {
            let event = tokio::select! {
                ev = stream.try_next() => ev,
                _ = signal.triggered() => {
                    info!("stopping installplan watcher");
                    return;
                }
            };
            match event {
                Ok(Some(ev)) => {
                    resource_version = resume_version(&ev, &resource_version);
                    match ev {
                        WatchEvent::Added(plan) => {
                            info!(name = ?plan.metadata.name, namespace = ?plan.metadata.namespace, "installplan watch: added");
                            if !is_approved(&plan) {
                                if let Err(e) = approve(&client, &ar, &plan).await {
                                    warn!(error = %e, "update installplans error, will retry");
                                }
                            }
                        }
                        WatchEvent::Error(e) => {
                            if signal.is_triggered() {
                                info!("stopping installplan watcher");
                                return;
                            }
                            warn!(error = %e, "installplan watch error, restarting watch in {}s", RETRY_TIME.as_secs());
                            signal.sleep(RETRY_TIME).await;
                            break;
                        }
                        _ => {}
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    if signal.is_triggered() {
                        return;
                    }
                    resource_version = "0".to_string();
                    warn!(error = %e, "installplan watch stream failed, restarting in {}s", RETRY_TIME.as_secs());
                    signal.sleep(RETRY_TIME).await;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(approved: Option<bool>) -> DynamicObject {
        let ar = install_plan_resource();
        let mut plan = DynamicObject::new("install-abc", &ar).within("operators");
        plan.data = match approved {
            Some(v) => json!({ "spec": { "approved": v } }),
            None => json!({ "spec": {} }),
        };
        plan
    }

    #[test]
    fn pending_plans_are_recognised() {
        assert!(!is_approved(&plan(Some(false))));
        assert!(is_approved(&plan(Some(true))));
        // A plan without the field is treated as pending.
        assert!(!is_approved(&plan(None)));
    }

    #[test]
    fn watch_errors_reset_the_resume_point() {
        // A stale resume point answers every restart with another 410;
        // starting over is the only way out.
        let expired = kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "too old resource version: 8412".to_string(),
            reason: "Expired".to_string(),
            code: 410,
        };
        assert_eq!(resume_version(&WatchEvent::Error(expired), "8412"), "0");
    }

    #[test]
    fn plain_events_advance_the_resume_point() {
        let mut seen = plan(Some(true));
        seen.metadata.resource_version = Some("42".to_string());
        assert_eq!(resume_version(&WatchEvent::Added(seen), "41"), "42");

        // Objects without a version keep the current resume point.
        assert_eq!(resume_version(&WatchEvent::Modified(plan(None)), "41"), "41");
    }
}
