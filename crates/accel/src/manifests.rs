//! Manifest source: retrieves the user-supplied bundle configmap and
//! decodes its entries into resource objects.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::Client;
use tracing::{info, warn};

use zap_core::{bundle_configmap, ResourceObject, ShutdownSignal, RETRY_TIME};

/// Decode every bundle entry. Keys are opaque labels kept only for error
/// reporting. Any empty or malformed entry aborts the whole decode:
/// partial application would leave the cluster in a split-brain state.
pub fn bundle_to_manifests(data: &BTreeMap<String, String>) -> Result<Vec<ResourceObject>> {
    let mut out = Vec::with_capacity(data.len());
    for (key, text) in data {
        let obj = ResourceObject::from_yaml(text)
            .with_context(|| format!("decoding bundle entry {key:?}"))?;
        out.push(obj);
    }
    Ok(out)
}

/// Poll for the bundle configmap until it appears, then decode it in one
/// pass. A missing configmap is not an error; a bundle that fails to
/// decode is terminal.
pub async fn fetch_manifests(
    client: Client,
    signal: &mut ShutdownSignal,
) -> Result<Vec<ResourceObject>> {
    let (name, namespace) = bundle_configmap();
    let api: Api<ConfigMap> = Api::namespaced(client, &namespace);
    loop {
        if signal.is_triggered() {
            return Err(anyhow!("cancelled while waiting for configmap {namespace}/{name}"));
        }
        match api.get_opt(&name).await {
            Ok(Some(cm)) => {
                let data = cm.data.unwrap_or_default();
                let manifests = bundle_to_manifests(&data)?;
                info!(configmap = %name, namespace = %namespace, count = manifests.len(), "manifest bundle fetched");
                return Ok(manifests);
            }
            Ok(None) => {
                info!("waiting {}s for configmap {}/{} to appear", RETRY_TIME.as_secs(), namespace, name);
            }
            Err(e) => {
                warn!(error = %e, "configmap fetch failed, will retry in {}s", RETRY_TIME.as_secs());
            }
        }
        signal.sleep(RETRY_TIME).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CPLANE: &str = "apiVersion: sriovnetwork.openshift.io/v1
kind: SriovNetworkNodePolicy
metadata:
  name: sriov-nnp-cplane
  namespace: openshift-sriov-network-operator
spec:
  deviceType: netdevice
  isRdma: true
  nicSelector:
    pfNames:
    - ens2f0
  nodeSelector:
    node-role.kubernetes.io/worker: \"\"
  numVfs: 8
  priority: 10
  resourceName: cplane
";

    const UPLANE: &str = "apiVersion: sriovnetwork.openshift.io/v1
kind: SriovNetworkNodePolicy
metadata:
  name: sriov-nnp-uplane
  namespace: openshift-sriov-network-operator
spec:
  deviceType: vfio-pci
  isRdma: false
  nicSelector:
    pfNames:
    - ens2f1
  nodeSelector:
    node-role.kubernetes.io/worker: \"\"
  numVfs: 8
  priority: 10
  resourceName: uplane
";

    #[test]
    fn bundle_decodes_every_entry() {
        let mut data = BTreeMap::new();
        data.insert("sriov-nnp-cplane.yaml".to_string(), CPLANE.to_string());
        data.insert("sriov-nnp-uplane.yaml".to_string(), UPLANE.to_string());
        let manifests = bundle_to_manifests(&data).unwrap();
        assert_eq!(manifests.len(), 2);
        assert_eq!(manifests[0].kind(), "SriovNetworkNodePolicy");
        assert_eq!(manifests[0].name(), "sriov-nnp-cplane");
        assert_eq!(manifests[0].namespace(), Some("openshift-sriov-network-operator"));
    }

    #[test]
    fn empty_bundle_is_valid() {
        let data = BTreeMap::new();
        assert!(bundle_to_manifests(&data).unwrap().is_empty());
    }

    #[test]
    fn malformed_entry_aborts_whole_bundle() {
        let mut data = BTreeMap::new();
        data.insert("good.yaml".to_string(), CPLANE.to_string());
        data.insert("bad.yaml".to_string(), "kind: [unterminated".to_string());
        let err = bundle_to_manifests(&data).unwrap_err();
        assert!(err.to_string().contains("bad.yaml"), "err={err:#}");
    }

    #[test]
    fn empty_entry_aborts_whole_bundle() {
        let mut data = BTreeMap::new();
        data.insert("empty.yaml".to_string(), String::new());
        assert!(bundle_to_manifests(&data).is_err());
    }
}
