//! ZAP dynamic applier: creates arbitrary manifests against a
//! discovery-driven client, retrying until the cluster accepts them.

#![forbid(unsafe_code)]

use anyhow::anyhow;
use kube::api::PostParams;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::Client;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{info, warn};

use zap_core::{ResourceObject, ShutdownSignal, StatusEvent, RETRY_TIME};
use zap_kubehub::{dynamic_api, find_api_resource, is_already_exists};

/// Apply one manifest, emitting `starting` and then exactly one terminal
/// event: `success` on create-ok or already-exists, `fail` on shutdown,
/// `fatal` when the manifest cannot be formed into an API object at all.
/// Transient errors retry forever at the shared cadence; the authoritative
/// stop is the controller triggering `signal`, not a worker deadline.
pub async fn apply_manifest(
    client: Client,
    obj: ResourceObject,
    events: mpsc::Sender<StatusEvent>,
    mut signal: ShutdownSignal,
) {
    let ident = obj.ident();
    let _ = events.send(StatusEvent::starting(ident.clone())).await;

    let gvk = {
        let (group, version) = obj.group_version();
        GroupVersionKind::gvk(group, version, obj.kind())
    };

    // Identity checks happened at decode time; what can still fail here
    // is ill-typed metadata, and such a manifest will never apply. That
    // is a construction failure, not a retry or a cancellation.
    let payload: DynamicObject = match serde_json::from_value(obj.as_value().clone()) {
        Ok(o) => o,
        Err(e) => {
            let _ = events
                .send(StatusEvent::fatal(anyhow!(
                    "manifest {ident} is not a valid API object: {e}"
                )))
                .await;
            return;
        }
    };

    loop {
        if signal.is_triggered() {
            info!(ident = %ident, "cancelled application");
            let _ = events
                .send(StatusEvent::fail(ident, anyhow!("cancelled before create succeeded")))
                .await;
            return;
        }
        counter!("apply_attempts", 1u64);

        // Fresh discovery on every attempt: the CRD for this object may
        // have been created by a sibling worker since the last pass.
        let (ar, namespaced) = match find_api_resource(client.clone(), &gvk).await {
            Ok(found) => found,
            Err(e) => {
                warn!(ident = %ident, error = %e, "no REST mapping yet, will retry in {}s", RETRY_TIME.as_secs());
                signal.sleep(RETRY_TIME).await;
                continue;
            }
        };

        let api = dynamic_api(client.clone(), &ar, namespaced, obj.namespace());
        match api.create(&PostParams::default(), &payload).await {
            Ok(_) => {
                counter!("apply_ok", 1u64);
                info!(ident = %ident, "created");
                let _ = events.send(StatusEvent::success(ident)).await;
                return;
            }
            Err(e) if is_already_exists(&e) => {
                counter!("apply_ok", 1u64);
                info!(ident = %ident, "already exists");
                let _ = events.send(StatusEvent::success(ident)).await;
                return;
            }
            Err(e) => {
                counter!("apply_retry", 1u64);
                warn!(ident = %ident, error = %e, "failed to apply resource, will retry in {}s", RETRY_TIME.as_secs());
                signal.sleep(RETRY_TIME).await;
            }
        }
    }
}
