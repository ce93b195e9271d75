//! ZAP kube plumbing: client construction, per-attempt discovery, and the
//! cluster status probe.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use serde_json::Value;
use tracing::debug;

use zap_core::status_condition;

/// Build a client from the pod's environment: the in-cluster service
/// account when running inside a pod, the local kubeconfig otherwise.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("constructing kube client")
}

/// Resolve a GVK against a fresh discovery run. Deliberately uncached:
/// CRDs may be installed while an agent is running, and a mapper kept
/// from a prior attempt would miss them.
pub async fn find_api_resource(
    client: Client,
    gvk: &GroupVersionKind,
) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                debug!(group = %ar.group, version = %ar.version, kind = %ar.kind, namespaced, "resolved GVK");
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Dynamic API handle scoped to `namespace` when the resource is namespaced.
pub fn dynamic_api(
    client: Client,
    ar: &ApiResource,
    namespaced: bool,
    namespace: Option<&str>,
) -> Api<DynamicObject> {
    if namespaced {
        match namespace {
            Some(ns) => Api::namespaced_with(client, ns, ar),
            None => Api::all_with(client, ar),
        }
    } else {
        Api::all_with(client, ar)
    }
}

/// Create-time conflict with an object that is already on the cluster.
/// The agents treat this as success everywhere.
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.reason == "AlreadyExists")
}

fn cluster_version_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("config.openshift.io", "v1", "ClusterVersion"),
        "clusterversions",
    )
}

fn cluster_operator_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("config.openshift.io", "v1", "ClusterOperator"),
        "clusteroperators",
    )
}

/// Boolean predicates over the cluster lifecycle objects: is the cluster
/// still progressing, and is the operator catalog usable.
#[derive(Clone)]
pub struct ClusterStatusProbe {
    client: Client,
}

impl ClusterStatusProbe {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn condition(
        &self,
        ar: ApiResource,
        name: &str,
        condition_type: &str,
    ) -> Result<Option<bool>> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let obj = api
            .get(name)
            .await
            .with_context(|| format!("fetching {} {}", ar.kind, name))?;
        let raw: Value = serde_json::to_value(&obj)?;
        Ok(status_condition(&raw, condition_type))
    }

    /// Tri-state `Progressing` condition on the singleton ClusterVersion.
    /// `None` (condition absent) is neither a start nor a stop signal.
    pub async fn is_progressing(&self) -> Result<Option<bool>> {
        self.condition(cluster_version_resource(), "version", "Progressing")
            .await
    }

    /// `Available` condition on the OLM packageserver ClusterOperator.
    pub async fn is_operator_available(&self) -> Result<Option<bool>> {
        self.condition(
            cluster_operator_resource(),
            "operator-lifecycle-manager-packageserver",
            "Available",
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    #[test]
    fn already_exists_matches_reason() {
        let err = kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "configmaps \"a\" already exists".to_string(),
            reason: "AlreadyExists".to_string(),
            code: 409,
        });
        assert!(is_already_exists(&err));

        let err = kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "conflict".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        });
        assert!(!is_already_exists(&err));
    }

    #[test]
    fn probe_resources_use_known_plurals() {
        assert_eq!(cluster_version_resource().plural, "clusterversions");
        assert_eq!(cluster_operator_resource().plural, "clusteroperators");
        assert_eq!(cluster_version_resource().group, "config.openshift.io");
    }
}
