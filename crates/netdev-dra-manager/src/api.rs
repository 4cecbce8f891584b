use async_trait::async_trait;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Api;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// API group and version of the DRA resource types this driver consumes.
pub const RESOURCE_GROUP: &str = "resource.k8s.io";
pub const RESOURCE_VERSION: &str = "v1beta1";

/// `reservedFor` resource value identifying pods.
pub const RESERVED_FOR_PODS: &str = "pods";

/// The subset of a ResourceClaim the driver needs: identity, the allocation
/// result, and the consumers the claim is reserved for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceClaim {
  #[serde(default)]
  pub metadata: ObjectMeta,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<ResourceClaimStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
  #[serde(default)]
  pub name: String,

  #[serde(default)]
  pub namespace: String,

  #[serde(default)]
  pub uid: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceClaimStatus {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub allocation: Option<AllocationResult>,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub reserved_for: Vec<ResourceClaimConsumerReference>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceClaimConsumerReference {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub api_group: Option<String>,

  #[serde(default)]
  pub resource: String,

  #[serde(default)]
  pub name: String,

  #[serde(default)]
  pub uid: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResult {
  #[serde(default)]
  pub devices: DeviceAllocationResult,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAllocationResult {
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub results: Vec<DeviceRequestAllocationResult>,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub config: Vec<DeviceAllocationConfiguration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequestAllocationResult {
  #[serde(default)]
  pub request: String,

  #[serde(default)]
  pub driver: String,

  #[serde(default)]
  pub pool: String,

  #[serde(default)]
  pub device: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAllocationConfiguration {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source: Option<String>,

  /// Requests this configuration applies to; empty means all requests in
  /// the claim.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub requests: Vec<String>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub opaque: Option<OpaqueDeviceConfiguration>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpaqueDeviceConfiguration {
  #[serde(default)]
  pub driver: String,

  #[serde(default)]
  pub parameters: serde_json::Value,
}

impl ResourceClaim {
  pub fn namespaced_name(&self) -> String {
    format!("{}/{}", self.metadata.namespace, self.metadata.name)
  }

  /// UIDs of the pods the claim is reserved for.
  pub fn pod_uids(&self) -> Vec<String> {
    self
      .status
      .as_ref()
      .map(|status| {
        status
          .reserved_for
          .iter()
          .filter(|consumer| consumer.resource == RESERVED_FOR_PODS)
          .map(|consumer| consumer.uid.clone())
          .collect()
      })
      .unwrap_or_default()
  }

  /// Allocation results owned by `driver`.
  pub fn results_for_driver(&self, driver: &str) -> Vec<&DeviceRequestAllocationResult> {
    self
      .status
      .as_ref()
      .and_then(|status| status.allocation.as_ref())
      .map(|allocation| {
        allocation
          .devices
          .results
          .iter()
          .filter(|result| result.driver == driver)
          .collect()
      })
      .unwrap_or_default()
  }

  /// The opaque parameters applying to `request`, owned by `driver`. When
  /// several configs match the first one wins.
  pub fn opaque_parameters_for(&self, driver: &str, request: &str) -> Option<&serde_json::Value> {
    let allocation = self.status.as_ref()?.allocation.as_ref()?;
    allocation
      .devices
      .config
      .iter()
      .filter(|config| config.requests.is_empty() || config.requests.iter().any(|r| r == request))
      .filter_map(|config| config.opaque.as_ref())
      .find(|opaque| opaque.driver == driver)
      .map(|opaque| &opaque.parameters)
  }
}

#[derive(Debug, Error)]
pub enum ClaimReadError {
  #[error("Failed to fetch ResourceClaim {namespace}/{name}")]
  Fetch {
    namespace: String,
    name: String,
    #[source]
    source: kube::Error,
  },

  #[error("Failed to decode ResourceClaim {namespace}/{name}")]
  Decode {
    namespace: String,
    name: String,
    #[source]
    source: serde_json::Error,
  },
}

/// Where claims come from. The production implementation reads the API
/// server; tests inject fixtures.
#[async_trait]
pub trait ClaimReader: Send + Sync {
  async fn get(&self, namespace: &str, name: &str) -> Result<ResourceClaim, ClaimReadError>;
}

pub struct KubeClaimReader {
  client: kube::Client,
  resource: ApiResource,
}

impl KubeClaimReader {
  pub fn new(client: kube::Client) -> Self {
    let gvk = GroupVersionKind::gvk(RESOURCE_GROUP, RESOURCE_VERSION, "ResourceClaim");
    Self {
      client,
      resource: ApiResource::from_gvk(&gvk),
    }
  }
}

#[async_trait]
impl ClaimReader for KubeClaimReader {
  async fn get(&self, namespace: &str, name: &str) -> Result<ResourceClaim, ClaimReadError> {
    let api: Api<DynamicObject> =
      Api::namespaced_with(self.client.clone(), namespace, &self.resource);

    let object = api.get(name).await.map_err(|source| ClaimReadError::Fetch {
      namespace: namespace.to_string(),
      name: name.to_string(),
      source,
    })?;

    let value = serde_json::to_value(&object).map_err(|source| ClaimReadError::Decode {
      namespace: namespace.to_string(),
      name: name.to_string(),
      source,
    })?;

    serde_json::from_value(value).map_err(|source| ClaimReadError::Decode {
      namespace: namespace.to_string(),
      name: name.to_string(),
      source,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn claim_fixture() -> ResourceClaim {
    serde_json::from_value(json!({
      "metadata": {"name": "nic", "namespace": "team-a", "uid": "claim-uid-1"},
      "status": {
        "allocation": {
          "devices": {
            "results": [
              {"request": "nic0", "driver": "netdev.dra.dev", "pool": "node-1", "device": "net1-0000-8a-00-0"},
              {"request": "gpu0", "driver": "gpu.other.dev", "pool": "node-1", "device": "gpu-0"}
            ],
            "config": [
              {
                "requests": ["nic0"],
                "opaque": {
                  "driver": "netdev.dra.dev",
                  "parameters": {"interface": {"addresses": ["192.168.1.10/24"]}}
                }
              }
            ]
          }
        },
        "reservedFor": [
          {"resource": "pods", "name": "workload", "uid": "pod-uid-1"},
          {"resource": "deployments", "name": "other", "uid": "not-a-pod"}
        ]
      }
    }))
    .unwrap()
  }

  #[test]
  fn pod_uids_only_count_pods() {
    let claim = claim_fixture();
    assert_eq!(claim.pod_uids(), vec!["pod-uid-1".to_string()]);
  }

  #[test]
  fn results_are_filtered_by_driver() {
    let claim = claim_fixture();
    let results = claim.results_for_driver("netdev.dra.dev");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].device, "net1-0000-8a-00-0");
  }

  #[test]
  fn opaque_parameters_match_request_and_driver() {
    let claim = claim_fixture();
    assert!(claim
      .opaque_parameters_for("netdev.dra.dev", "nic0")
      .is_some());
    assert!(claim
      .opaque_parameters_for("netdev.dra.dev", "nic1")
      .is_none());
    assert!(claim.opaque_parameters_for("gpu.other.dev", "nic0").is_none());
  }

  #[test]
  fn unallocated_claim_has_no_results() {
    let claim: ResourceClaim = serde_json::from_value(json!({
      "metadata": {"name": "nic", "namespace": "team-a", "uid": "u"}
    }))
    .unwrap();

    assert!(claim.results_for_driver("netdev.dra.dev").is_empty());
    assert!(claim.pod_uids().is_empty());
  }
}
