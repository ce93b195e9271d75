//! ZAP core types: resource objects, worker events, classification.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::watch;

/// Cadence shared by every retry path in the agents.
pub const RETRY_TIME: Duration = Duration::from_secs(30);

// ---- resource objects ----

/// Terminal decode failure for a manifest bundle entry. Distinct from the
/// transient errors the workers retry: a bundle that does not decode in
/// full is never partially applied.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("expected exactly one document, got {0}")]
    DocumentCount(usize),
    #[error("manifest missing {0}")]
    MissingField(&'static str),
}

/// A self-describing cluster resource carried as an opaque content map.
///
/// Identity is the (apiVersion, kind, namespace, name) tuple; everything
/// else passes through the agents untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceObject(Value);

impl ResourceObject {
    pub fn from_value(v: Value) -> Result<Self, ManifestError> {
        let obj = ResourceObject(v);
        if !obj.0.is_object() {
            return Err(ManifestError::MissingField("object body"));
        }
        if obj.api_version().is_empty() {
            return Err(ManifestError::MissingField("apiVersion"));
        }
        if obj.kind().is_empty() {
            return Err(ManifestError::MissingField("kind"));
        }
        if !obj.0.get("metadata").map_or(false, Value::is_object) {
            return Err(ManifestError::MissingField("metadata"));
        }
        if obj.name().is_empty() {
            return Err(ManifestError::MissingField("metadata.name"));
        }
        Ok(obj)
    }

    /// Decode a YAML manifest. Document separators are tolerated, but the
    /// text must hold exactly one non-empty document.
    pub fn from_yaml(text: &str) -> Result<Self, ManifestError> {
        let mut docs = Vec::new();
        for doc in serde_yaml::Deserializer::from_str(text) {
            let v = Value::deserialize(doc)?;
            if !v.is_null() {
                docs.push(v);
            }
        }
        let n = docs.len();
        match docs.pop() {
            Some(v) if n == 1 => Self::from_value(v),
            _ => Err(ManifestError::DocumentCount(n)),
        }
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.0)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn api_version(&self) -> &str {
        self.0.get("apiVersion").and_then(Value::as_str).unwrap_or("")
    }

    pub fn kind(&self) -> &str {
        self.0.get("kind").and_then(Value::as_str).unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.0
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.0
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// `(group, version)` from the apiVersion; core-group objects are `("", v)`.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version().split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", self.api_version()),
        }
    }

    /// Overwrite `status` with an empty map. The key stays present:
    /// downstream serialisers distinguish absent from empty.
    pub fn clear_status(&mut self) {
        if let Some(map) = self.0.as_object_mut() {
            map.insert("status".to_string(), Value::Object(Map::new()));
        }
    }

    pub fn ident(&self) -> ObjectIdent {
        ObjectIdent {
            api_version: self.api_version().to_string(),
            kind: self.kind().to_string(),
            name: self.name().to_string(),
            namespace: self.namespace().unwrap_or_default().to_string(),
        }
    }
}

// ---- worker status events ----

/// Identity of an apply worker as reported on the event channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ObjectIdent {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl ObjectIdent {
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ObjectIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.api_version, self.kind, self.name, self.namespace
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Success,
    Fail,
    Fatal,
}

/// One lifecycle report from a worker. Events are ordered per worker and
/// unordered across workers.
#[derive(Debug)]
pub struct StatusEvent {
    pub ident: ObjectIdent,
    pub state: WorkerState,
    pub error: Option<anyhow::Error>,
}

impl StatusEvent {
    pub fn starting(ident: ObjectIdent) -> Self {
        Self { ident, state: WorkerState::Starting, error: None }
    }

    pub fn success(ident: ObjectIdent) -> Self {
        Self { ident, state: WorkerState::Success, error: None }
    }

    pub fn fail(ident: ObjectIdent, error: anyhow::Error) -> Self {
        Self { ident, state: WorkerState::Fail, error: Some(error) }
    }

    pub fn fatal(error: anyhow::Error) -> Self {
        Self { ident: ObjectIdent::default(), state: WorkerState::Fatal, error: Some(error) }
    }
}

// ---- classification ----

/// Destination of an extracted object in the per-cluster payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    /// Applied as-is on the target cluster.
    Direct,
    /// Shipped inside the inner configmap.
    Wrapped,
    /// Routed through the performance conversion when enabled.
    Convert,
}

/// Kind-based routing used by the extractor.
pub fn classify(kind: &str) -> Bucket {
    match kind {
        "PerformanceProfile" | "Tuned" => Bucket::Convert,
        "Namespace" | "OperatorGroup" | "Subscription" | "CatalogSource" => Bucket::Direct,
        _ => Bucket::Wrapped,
    }
}

// ---- condition inspection ----

/// Inspect `status.conditions` for a condition of the given type.
/// `None` means the condition (or the whole status) is absent, which is
/// semantically distinct from present-and-false.
pub fn status_condition(obj: &Value, condition_type: &str) -> Option<bool> {
    let conditions = obj.pointer("/status/conditions")?.as_array()?;
    let condition = conditions
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(condition_type))?;
    Some(condition.get("status").and_then(Value::as_str) == Some("True"))
}

// ---- environment configuration ----

pub fn env_or(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

/// Name and namespace of the manifest bundle configmap.
pub fn bundle_configmap() -> (String, String) {
    (
        env_or("CONFIGMAP_NAME", "ztp-post-provision"),
        env_or("CONFIGMAP_NAMESPACE", "ztp-profile"),
    )
}

/// Name and namespace of the inner configmap emitted by the extractor.
pub fn inner_configmap() -> (String, String) {
    (
        env_or("INNER_CONFIGMAP_NAME", "ztp-post-provision"),
        env_or("INNER_CONFIGMAP_NAMESPACE", "ztp-profile"),
    )
}

/// Optional delay applied between the end condition and shutdown.
pub fn end_condition_extension() -> Option<Duration> {
    let raw = std::env::var("END_CONDITION_EXTENSION_TIME").ok()?;
    match humantime::parse_duration(&raw) {
        Ok(d) if !d.is_zero() => Some(d),
        _ => None,
    }
}

pub fn convert_performance_enabled() -> bool {
    std::env::var("CONVERT_PERFORMANCE")
        .map(|v| !v.is_empty())
        .unwrap_or(false)
}

// ---- cooperative shutdown ----

/// Shutdown broadcast shared by every worker in an agent. The controller
/// owns a `Shutdown`; workers hold `ShutdownSignal`s and check them at
/// every retry boundary and before each blocking call.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal { rx: self.tx.subscribe() }
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown triggers. Also resolves if the controller is
    /// gone; an orphaned worker has nothing left to report to.
    pub async fn triggered(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `dur`, waking early when shutdown triggers. Returns false
    /// on early wake.
    pub async fn sleep(&mut self, dur: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(dur) => true,
            _ = self.triggered() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cluster_version(condition_type: &str, status: &str) -> Value {
        json!({
            "apiVersion": "config.openshift.io/v1",
            "kind": "ClusterVersion",
            "metadata": { "name": "version" },
            "spec": {},
            "status": {
                "conditions": [
                    {
                        "type": condition_type,
                        "status": status,
                        "lastTransitionTime": "2023-09-03T16:10:07Z"
                    }
                ]
            }
        })
    }

    #[test]
    fn condition_present_and_true() {
        let obj = cluster_version("Progressing", "True");
        assert_eq!(status_condition(&obj, "Progressing"), Some(true));
    }

    #[test]
    fn condition_present_and_false() {
        let obj = cluster_version("Progressing", "False");
        assert_eq!(status_condition(&obj, "Progressing"), Some(false));
    }

    #[test]
    fn condition_absent_is_not_false() {
        let obj = cluster_version("Faking", "False");
        assert_eq!(status_condition(&obj, "Progressing"), None);
    }

    #[test]
    fn condition_without_status_block() {
        let obj = json!({ "apiVersion": "v1", "kind": "ConfigMap" });
        assert_eq!(status_condition(&obj, "Progressing"), None);
    }

    #[test]
    fn classify_routes_by_kind() {
        assert_eq!(classify("Namespace"), Bucket::Direct);
        assert_eq!(classify("OperatorGroup"), Bucket::Direct);
        assert_eq!(classify("Subscription"), Bucket::Direct);
        assert_eq!(classify("CatalogSource"), Bucket::Direct);
        assert_eq!(classify("PerformanceProfile"), Bucket::Convert);
        assert_eq!(classify("Tuned"), Bucket::Convert);
        assert_eq!(classify("SriovNetworkNodePolicy"), Bucket::Wrapped);
        assert_eq!(classify("ConfigMap"), Bucket::Wrapped);
    }

    #[test]
    fn from_yaml_single_document() {
        let obj = ResourceObject::from_yaml(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n  namespace: default\n",
        )
        .unwrap();
        assert_eq!(obj.api_version(), "v1");
        assert_eq!(obj.kind(), "ConfigMap");
        assert_eq!(obj.name(), "a");
        assert_eq!(obj.namespace(), Some("default"));
        assert_eq!(obj.group_version(), ("", "v1"));
    }

    #[test]
    fn from_yaml_tolerates_leading_separator() {
        let obj = ResourceObject::from_yaml(
            "---\napiVersion: sriovnetwork.openshift.io/v1\nkind: SriovNetwork\nmetadata:\n  name: n\n",
        )
        .unwrap();
        assert_eq!(obj.group_version(), ("sriovnetwork.openshift.io", "v1"));
        assert_eq!(obj.namespace(), None);
    }

    #[test]
    fn from_yaml_rejects_multiple_documents() {
        let err = ResourceObject::from_yaml(
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: b\n",
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::DocumentCount(2)));
    }

    #[test]
    fn from_yaml_rejects_empty_document() {
        let err = ResourceObject::from_yaml("---\n").unwrap_err();
        assert!(matches!(err, ManifestError::DocumentCount(0)));
    }

    #[test]
    fn from_yaml_rejects_missing_identity() {
        let err =
            ResourceObject::from_yaml("kind: ConfigMap\nmetadata:\n  name: a\n").unwrap_err();
        assert!(matches!(err, ManifestError::MissingField("apiVersion")));
        let err = ResourceObject::from_yaml("apiVersion: v1\nmetadata:\n  name: a\n").unwrap_err();
        assert!(matches!(err, ManifestError::MissingField("kind")));
        let err = ResourceObject::from_yaml("apiVersion: v1\nkind: ConfigMap\n").unwrap_err();
        assert!(matches!(err, ManifestError::MissingField("metadata")));
        let err = ResourceObject::from_yaml("apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n")
            .unwrap_err();
        assert!(matches!(err, ManifestError::MissingField("metadata.name")));
    }

    #[test]
    fn from_value_rejects_scalar_metadata() {
        let err = ResourceObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": "not-a-map"
        }))
        .unwrap_err();
        assert!(matches!(err, ManifestError::MissingField("metadata")));
    }

    #[test]
    fn yaml_round_trip_preserves_content() {
        let original = ResourceObject::from_value(json!({
            "apiVersion": "sriovnetwork.openshift.io/v1",
            "kind": "SriovNetworkNodePolicy",
            "metadata": { "name": "sriov-nnp-cplane", "namespace": "openshift-sriov-network-operator" },
            "spec": {
                "deviceType": "netdevice",
                "isRdma": true,
                "numVfs": 8,
                "nicSelector": { "pfNames": ["ens2f0"] }
            }
        }))
        .unwrap();
        let text = original.to_yaml().unwrap();
        let reparsed = ResourceObject::from_yaml(&text).unwrap();
        assert_eq!(original, reparsed);
    }

    #[test]
    fn clear_status_leaves_empty_map() {
        let mut obj = ResourceObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": "a" },
            "status": { "phase": "Active" }
        }))
        .unwrap();
        obj.clear_status();
        assert_eq!(obj.as_value().get("status"), Some(&json!({})));

        // Absent status gets inserted, not left out.
        let mut obj = ResourceObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": "b" }
        }))
        .unwrap();
        obj.clear_status();
        assert_eq!(obj.as_value().get("status"), Some(&json!({})));
    }

    #[test]
    fn ident_key_joins_identity_fields() {
        let obj = ResourceObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "a", "namespace": "default" }
        }))
        .unwrap();
        assert_eq!(obj.ident().key(), "v1 ConfigMap a default");
    }

    #[test]
    fn end_condition_extension_requires_a_positive_duration() {
        // Single test for every case: parallel tests must not race on the
        // process environment.
        std::env::set_var("END_CONDITION_EXTENSION_TIME", "90s");
        assert_eq!(end_condition_extension(), Some(Duration::from_secs(90)));

        std::env::set_var("END_CONDITION_EXTENSION_TIME", "1m 30s");
        assert_eq!(end_condition_extension(), Some(Duration::from_secs(90)));

        std::env::set_var("END_CONDITION_EXTENSION_TIME", "0s");
        assert_eq!(end_condition_extension(), None);

        std::env::set_var("END_CONDITION_EXTENSION_TIME", "ninety seconds");
        assert_eq!(end_condition_extension(), None);

        std::env::remove_var("END_CONDITION_EXTENSION_TIME");
        assert_eq!(end_condition_extension(), None);
    }

    #[tokio::test]
    async fn shutdown_wakes_sleepers() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.signal();
        assert!(!signal.is_triggered());
        shutdown.trigger();
        assert!(signal.is_triggered());
        assert!(!signal.sleep(Duration::from_secs(60)).await);
    }
}
