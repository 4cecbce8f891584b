use crate::{
  api::{ClaimReadError, ClaimReader},
  claims::{ClaimRecord, ClaimStore},
  inventory::Inventory,
  podconfig::{ConfigParseError, NetworkConfig, PodConfig, PodConfigStore},
  sysfs::PciProbe,
};
use async_trait::async_trait;
use kubelet_draplugin_proto::v1beta1::{
  ClaimRef, DraPlugin, PreparedDevice, PrepareResults, UnprepareResults,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{event, Level};

#[derive(Debug, Error)]
pub enum PrepareError {
  #[error(transparent)]
  Read(#[from] ClaimReadError),

  #[error("Claim {0} has no allocation result for this driver")]
  NotAllocated(String),

  #[error("Device {0:?} is not in this node's inventory")]
  MissingDevice(String),

  #[error(transparent)]
  Config(#[from] ConfigParseError),
}

/// Implements the kubelet-facing prepare/unprepare surface: resolves claims
/// from the API server, validates their opaque config, and seeds the claim
/// and pod-config stores the runtime event handler works from.
pub struct NetworkDraPlugin {
  driver_name: String,
  claims: Arc<ClaimStore>,
  configs: Arc<PodConfigStore>,
  inventory: Inventory,
  reader: Arc<dyn ClaimReader>,
  probe: Arc<dyn PciProbe>,
}

impl NetworkDraPlugin {
  pub fn new(
    driver_name: impl Into<String>,
    claims: Arc<ClaimStore>,
    configs: Arc<PodConfigStore>,
    inventory: Inventory,
    reader: Arc<dyn ClaimReader>,
    probe: Arc<dyn PciProbe>,
  ) -> Self {
    Self {
      driver_name: driver_name.into(),
      claims,
      configs,
      inventory,
      reader,
      probe,
    }
  }

  /// Prepare a single claim. Nothing is cached until the whole claim has
  /// parsed and every referenced device exists, so a failed claim leaves no
  /// state behind.
  async fn prepare_claim(&self, claim_ref: &ClaimRef) -> Result<Vec<PreparedDevice>, PrepareError> {
    let claim = self
      .reader
      .get(&claim_ref.namespace, &claim_ref.name)
      .await?;

    let results = claim.results_for_driver(&self.driver_name);
    if claim
      .status
      .as_ref()
      .and_then(|status| status.allocation.as_ref())
      .is_none()
    {
      return Err(PrepareError::NotAllocated(claim_ref.namespaced_name()));
    }

    let pod_uids = claim.pod_uids();
    let mut prepared = Vec::new();
    let mut pending = Vec::new();

    for result in results {
      if self.inventory.get_device(&result.device).is_none() {
        return Err(PrepareError::MissingDevice(result.device.clone()));
      }

      let network = match claim.opaque_parameters_for(&self.driver_name, &result.request) {
        Some(parameters) => NetworkConfig::parse(parameters)?,
        None => NetworkConfig::default(),
      };

      let rdma_devices = self
        .inventory
        .get_device(&result.device)
        .and_then(|device| device.rdma_device().map(String::from))
        .map(|rdma| self.probe.rdma_char_devices(&rdma))
        .unwrap_or_default();

      pending.push((
        result.request.clone(),
        PodConfig {
          config: network,
          rdma_devices,
        },
      ));
      prepared.push(PreparedDevice {
        request_name: result.request.clone(),
        pool_name: result.pool.clone(),
        device_name: result.device.clone(),
        cdi_device_ids: Vec::new(),
      });
    }

    for pod_uid in &pod_uids {
      for (request, config) in &pending {
        self.configs.set(pod_uid, request, config.clone());
      }
    }

    self.claims.insert(ClaimRecord {
      uid: claim_ref.uid.clone(),
      namespace: claim_ref.namespace.clone(),
      name: claim_ref.name.clone(),
      pod_uids,
      results: claim
        .results_for_driver(&self.driver_name)
        .into_iter()
        .cloned()
        .collect(),
    });

    event!(
      target: "netdev-dra-manager",
      Level::INFO,
      claim = %claim_ref.namespaced_name(),
      devices = prepared.len(),
      "Prepared claim"
    );

    Ok(prepared)
  }

  /// Remove a claim and drain the desired state of every pod it was
  /// reserved for. Absent claims succeed silently.
  fn unprepare_claim(&self, claim_ref: &ClaimRef) {
    if let Some(record) = self.claims.remove(&claim_ref.namespaced_name()) {
      for pod_uid in &record.pod_uids {
        self.configs.drain(pod_uid);
      }

      event!(
        target: "netdev-dra-manager",
        Level::INFO,
        claim = %claim_ref.namespaced_name(),
        "Unprepared claim"
      );
    }
  }
}

#[async_trait]
impl DraPlugin for NetworkDraPlugin {
  async fn prepare_resource_claims(
    &self,
    claims: Vec<ClaimRef>,
  ) -> Result<PrepareResults, kubelet_draplugin_proto::tonic::Status> {
    let mut results = PrepareResults::new();
    for claim in claims {
      let outcome = match self.prepare_claim(&claim).await {
        Ok(devices) => Ok(devices),
        Err(error) => {
          event!(
            target: "netdev-dra-manager",
            Level::WARN,
            claim = %claim.namespaced_name(),
            %error,
            "Failed to prepare claim"
          );
          Err(error.to_string())
        }
      };

      results.insert(claim.uid.clone(), outcome);
    }

    Ok(results)
  }

  async fn unprepare_resource_claims(
    &self,
    claims: Vec<ClaimRef>,
  ) -> Result<UnprepareResults, kubelet_draplugin_proto::tonic::Status> {
    let mut results = UnprepareResults::new();
    for claim in claims {
      self.unprepare_claim(&claim);
      results.insert(claim.uid.clone(), Ok(()));
    }

    Ok(results)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::ResourceClaim;
  use crate::netlink::NetlinkHandle;
  use crate::sysfs::{PciDeviceInfo, SysfsError};
  use serde_json::json;
  use std::collections::HashMap;
  use std::sync::Mutex;

  struct FakeReader {
    claims: Mutex<HashMap<String, ResourceClaim>>,
  }

  #[async_trait]
  impl ClaimReader for FakeReader {
    async fn get(&self, namespace: &str, name: &str) -> Result<ResourceClaim, ClaimReadError> {
      self
        .claims
        .lock()
        .unwrap()
        .get(&format!("{}/{}", namespace, name))
        .cloned()
        .ok_or_else(|| ClaimReadError::Fetch {
          namespace: namespace.to_string(),
          name: name.to_string(),
          source: kube::Error::TlsRequired,
        })
    }
  }

  struct LoopbackProbe;

  impl PciProbe for LoopbackProbe {
    fn scan(&self) -> Result<Vec<PciDeviceInfo>, SysfsError> {
      Ok(vec![PciDeviceInfo {
        address: "0000:8a:00.0".to_string(),
        vendor: "0x8086".to_string(),
        device: "0x1572".to_string(),
        interface: Some("lo".to_string()),
        rdma_device: Some("mlx5_0".to_string()),
        ..Default::default()
      }])
    }

    fn is_virtual(&self, _interface: &str) -> bool {
      false
    }

    fn rdma_char_devices(&self, rdma_device: &str) -> Vec<String> {
      if rdma_device == "mlx5_0" {
        vec!["/dev/infiniband/uverbs0".to_string()]
      } else {
        Vec::new()
      }
    }
  }

  fn claim_json(parameters: serde_json::Value) -> ResourceClaim {
    serde_json::from_value(json!({
      "metadata": {"name": "nic", "namespace": "team-a", "uid": "claim-1"},
      "status": {
        "allocation": {
          "devices": {
            "results": [{
              "request": "nic0",
              "driver": "netdev.dra.dev",
              "pool": "node-1",
              "device": "net1-0000-8a-00-0"
            }],
            "config": [{
              "requests": ["nic0"],
              "opaque": {"driver": "netdev.dra.dev", "parameters": parameters}
            }]
          }
        },
        "reservedFor": [{"resource": "pods", "name": "workload", "uid": "pod-1"}]
      }
    }))
    .unwrap()
  }

  async fn plugin_with_claim(
    claim: ResourceClaim,
  ) -> (NetworkDraPlugin, Arc<ClaimStore>, Arc<PodConfigStore>) {
    let probe = Arc::new(LoopbackProbe);
    let netlink = NetlinkHandle::new().unwrap();
    let (inventory, runner, _rx) = crate::inventory::new(probe.clone(), netlink, None);
    runner.refresh().await.unwrap();

    let mut claims = HashMap::new();
    claims.insert(claim.namespaced_name(), claim);
    let reader = Arc::new(FakeReader {
      claims: Mutex::new(claims),
    });

    let claim_store = Arc::new(ClaimStore::new());
    let config_store = Arc::new(PodConfigStore::new());
    let plugin = NetworkDraPlugin::new(
      "netdev.dra.dev",
      claim_store.clone(),
      config_store.clone(),
      inventory,
      reader,
      probe,
    );

    (plugin, claim_store, config_store)
  }

  fn claim_ref() -> ClaimRef {
    ClaimRef {
      uid: "claim-1".to_string(),
      namespace: "team-a".to_string(),
      name: "nic".to_string(),
    }
  }

  #[tokio::test]
  async fn prepare_returns_device_triples_and_seeds_stores() {
    let claim = claim_json(json!({"interface": {"addresses": ["192.168.1.10/24"]}}));
    let (plugin, claim_store, config_store) = plugin_with_claim(claim).await;

    let results = plugin
      .prepare_resource_claims(vec![claim_ref()])
      .await
      .unwrap();
    let devices = results["claim-1"].as_ref().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].request_name, "nic0");
    assert_eq!(devices[0].pool_name, "node-1");
    assert_eq!(devices[0].device_name, "net1-0000-8a-00-0");

    assert!(claim_store.get("team-a/nic").is_some());
    let config = config_store.get_entry("pod-1", "nic0").unwrap();
    assert_eq!(config.rdma_devices, vec!["/dev/infiniband/uverbs0"]);
    assert_eq!(config.config.interface.addresses.len(), 1);
  }

  #[tokio::test]
  async fn unknown_config_field_fails_the_claim_without_caching() {
    let claim = claim_json(json!({"gateways": "x"}));
    let (plugin, claim_store, config_store) = plugin_with_claim(claim).await;

    let results = plugin
      .prepare_resource_claims(vec![claim_ref()])
      .await
      .unwrap();
    let error = results["claim-1"].as_ref().unwrap_err();
    assert!(error.contains("gateways"), "error should name the field: {}", error);

    assert!(claim_store.get("team-a/nic").is_none());
    assert!(config_store.get("pod-1").is_none());
  }

  #[tokio::test]
  async fn missing_device_fails_the_claim_without_caching() {
    let mut claim = claim_json(json!({}));
    claim
      .status
      .as_mut()
      .unwrap()
      .allocation
      .as_mut()
      .unwrap()
      .devices
      .results[0]
      .device = "net1-0000-ff-00-0".to_string();

    let (plugin, claim_store, _config_store) = plugin_with_claim(claim).await;
    let results = plugin
      .prepare_resource_claims(vec![claim_ref()])
      .await
      .unwrap();
    assert!(results["claim-1"].is_err());
    assert!(claim_store.get("team-a/nic").is_none());
  }

  #[tokio::test]
  async fn unprepare_is_idempotent_and_drains_configs() {
    let claim = claim_json(json!({}));
    let (plugin, claim_store, config_store) = plugin_with_claim(claim).await;

    plugin
      .prepare_resource_claims(vec![claim_ref()])
      .await
      .unwrap();
    assert!(config_store.get("pod-1").is_some());

    let results = plugin
      .unprepare_resource_claims(vec![claim_ref()])
      .await
      .unwrap();
    assert!(results["claim-1"].is_ok());
    assert!(claim_store.get("team-a/nic").is_none());
    assert!(config_store.get("pod-1").is_none());

    // absent claims succeed silently
    let results = plugin
      .unprepare_resource_claims(vec![claim_ref()])
      .await
      .unwrap();
    assert!(results["claim-1"].is_ok());
  }
}
