//! ZAP extractor: unwraps the governance policies targeted at a managed
//! cluster and publishes them as a single per-cluster configmap.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, PostParams, WatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, WatchEvent};
use kube::Client;
use metrics::counter;
use serde_json::Value;
use tracing::{info, warn};

use zap_core::{classify, inner_configmap, Bucket, ResourceObject};

/// Label a managed cluster must carry to opt into accelerated provisioning.
pub const PROVISIONING_LABEL: &str = "ztp-accelerated-provisioning";

fn policy_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("policy.open-cluster-management.io", "v1", "Policy"),
        "policies",
    )
}

fn managed_cluster_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("cluster.open-cluster-management.io", "v1", "ManagedCluster"),
        "managedclusters",
    )
}

/// True when a managed cluster opted into accelerated provisioning.
pub fn qualifies(labels: &BTreeMap<String, String>) -> bool {
    matches!(
        labels.get(PROVISIONING_LABEL).map(String::as_str),
        Some("full") | Some("policies")
    )
}

/// Descend the policy nesting and recover the raw embedded manifests:
/// Policy -> `spec.policyTemplates[].objectDefinition` (a
/// ConfigurationPolicy) -> `spec.object-templates[].objectDefinition`
/// (the Resource Object). The nesting depth is exactly three; policies
/// and templates without the expected arrays are skipped silently.
///
/// `status` is overwritten with an empty map on every recovered object.
/// It has to stay present: downstream serialisers distinguish absent
/// from empty.
pub fn unwrap_policies(policies: &[Value]) -> Result<Vec<ResourceObject>> {
    let mut out = Vec::new();
    for policy in policies {
        let templates = match policy.pointer("/spec/policyTemplates").and_then(Value::as_array) {
            Some(t) => t,
            None => continue,
        };
        for template in templates {
            let config_policy = template
                .get("objectDefinition")
                .ok_or_else(|| anyhow!("policyTemplate without objectDefinition"))?;
            let object_templates = match config_policy
                .pointer("/spec/object-templates")
                .and_then(Value::as_array)
            {
                Some(t) => t,
                None => continue,
            };
            for object_template in object_templates {
                let definition = object_template
                    .get("objectDefinition")
                    .ok_or_else(|| anyhow!("object-template without objectDefinition"))?;
                let mut obj = ResourceObject::from_value(definition.clone())
                    .context("decoding embedded object definition")?;
                obj.clear_status();
                out.push(obj);
            }
        }
    }
    Ok(out)
}

/// Objects for one cluster, bucketed by kind.
#[derive(Debug, Default)]
pub struct Classified {
    pub direct: Vec<ResourceObject>,
    pub wrapped: Vec<ResourceObject>,
    pub convert: Vec<ResourceObject>,
}

pub fn classify_objects(objects: Vec<ResourceObject>) -> Classified {
    let mut out = Classified::default();
    for obj in objects {
        match classify(obj.kind()) {
            Bucket::Direct => out.direct.push(obj),
            Bucket::Wrapped => out.wrapped.push(obj),
            Bucket::Convert => out.convert.push(obj),
        }
    }
    out
}

/// Placeholder conversion for PerformanceProfile/Tuned objects, gated
/// behind CONVERT_PERFORMANCE. Kept as an identity transform on purpose.
pub fn convert_performance(objects: Vec<ResourceObject>) -> Vec<ResourceObject> {
    objects
}

/// YAML-serialise `objects` into a configmap data map keyed by metadata
/// name. Colliding names resolve last-writer-wins; cross-kind collisions
/// are a user-authoring error this tool does not detect.
pub fn wrap_objects(
    data: &mut BTreeMap<String, String>,
    objects: &[ResourceObject],
) -> Result<()> {
    for obj in objects {
        data.insert(obj.name().to_string(), obj.to_yaml()?);
    }
    Ok(())
}

/// Build the inner configmap carrying the wrapped bucket. It is itself
/// applied on the target cluster, where the install accelerator picks it
/// up as its manifest bundle.
pub fn build_inner_configmap(wrapped: &[ResourceObject]) -> Result<ResourceObject> {
    let (name, namespace) = inner_configmap();
    let mut data = BTreeMap::new();
    wrap_objects(&mut data, wrapped)?;
    let value = serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": namespace },
        "data": data,
    });
    Ok(ResourceObject::from_value(value)?)
}

/// Assemble the full outer payload for one cluster from its unwrapped
/// policy objects: direct bucket + inner configmap + (possibly converted)
/// performance bucket, each entry YAML-keyed by metadata name.
pub fn build_cluster_payload(
    objects: Vec<ResourceObject>,
    convert: bool,
) -> Result<BTreeMap<String, String>> {
    let mut classified = classify_objects(objects);
    let inner = build_inner_configmap(&classified.wrapped)?;
    classified.direct.push(inner);
    let performance = if convert {
        convert_performance(classified.convert)
    } else {
        classified.convert
    };
    classified.direct.extend(performance);
    let mut data = BTreeMap::new();
    wrap_objects(&mut data, &classified.direct)?;
    Ok(data)
}

pub struct Extractor {
    client: Client,
}

impl Extractor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Extract the policies targeted at `cluster` into the per-cluster
    /// configmap `<cluster>-zap`. Create-once: when the configmap already
    /// exists the cluster is skipped without re-listing policies.
    pub async fn extract(&self, cluster: &str) -> Result<()> {
        let output_name = format!("{cluster}-zap");
        let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), cluster);
        if configmaps.get_opt(&output_name).await?.is_some() {
            info!(configmap = %output_name, namespace = %cluster, "configmap already exists, skip policy extraction");
            return Ok(());
        }

        let ar = policy_resource();
        let policies: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), cluster, &ar);
        let list = policies
            .list(&ListParams::default())
            .await
            .with_context(|| format!("listing policies in namespace {cluster}"))?;
        let raw: Vec<Value> = list
            .items
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<_, _>>()?;

        let objects = unwrap_policies(&raw)?;
        let data =
            build_cluster_payload(objects, zap_core::convert_performance_enabled())?;

        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(output_name.clone()),
                namespace: Some(cluster.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        match configmaps.create(&PostParams::default(), &cm).await {
            Ok(_) => {
                counter!("clusters_extracted", 1u64);
                info!(configmap = %output_name, namespace = %cluster, "cluster payload published");
                Ok(())
            }
            Err(e) if zap_kubehub::is_already_exists(&e) => {
                // Raced another extractor instance; the payload is there
                // either way.
                info!(configmap = %output_name, "configmap appeared concurrently, treating as success");
                Ok(())
            }
            Err(e) => Err(e).context("creating cluster payload configmap"),
        }
    }

    /// Stream managed-cluster registrations and extract qualifying
    /// additions. Returns when the stream ends or errors; the caller
    /// restarts the watch.
    pub async fn watch_managed_clusters(&self) -> Result<()> {
        let ar = managed_cluster_resource();
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let stream = api.watch(&WatchParams::default(), "0").await?;
        futures::pin_mut!(stream);
        while let Some(event) = stream.try_next().await? {
            match event {
                WatchEvent::Added(mc) => {
                    let name = mc.metadata.name.clone().unwrap_or_default();
                    let labels = mc.metadata.labels.clone().unwrap_or_default();
                    if !qualifies(&labels) {
                        info!(cluster = %name, "managed cluster not opted in, ignoring");
                        continue;
                    }
                    info!(cluster = %name, "managed cluster added");
                    if let Err(e) = self.extract(&name).await {
                        warn!(cluster = %name, error = %e, "policy extraction failed");
                    }
                }
                WatchEvent::Error(e) => return Err(anyhow!("watcher error: {e}")),
                _ => {}
            }
        }
        Ok(())
    }
}
