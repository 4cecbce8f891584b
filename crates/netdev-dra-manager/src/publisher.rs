use crate::{
  device::{AttributeValue, Device},
  selector::DeviceSelector,
};
use async_trait::async_trait;
use kube::{
  api::{Patch, PatchParams},
  core::{ApiResource, DynamicObject, GroupVersionKind},
  Api,
};
use serde_json::json;
use std::{
  sync::{
    atomic::{AtomicI64, Ordering},
    Arc, Mutex,
  },
  time::Duration,
};
use thiserror::Error;
use tokio::{
  sync::mpsc,
  time::{sleep, Instant},
};
use tracing::{event, Level};

/// Floor between two slice publications, decoupling the API server from
/// discovery churn.
pub const MIN_PUBLISH_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum PublishError {
  #[error("Failed to apply ResourceSlice")]
  Kube(#[from] kube::Error),
}

/// The one-pool, one-slice snapshot this node advertises.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverResources {
  pub driver_name: String,
  pub node_name: String,
  pub generation: i64,
  pub devices: Vec<Device>,
}

/// Destination for resource-slice snapshots. The production implementation
/// server-side-applies to the cluster API; tests record calls.
#[async_trait]
pub trait SliceStore: Send + Sync {
  async fn publish(&self, resources: &DriverResources) -> Result<(), PublishError>;
}

pub struct KubeSliceStore {
  api: Api<DynamicObject>,
  resource: ApiResource,
  field_manager: String,
}

impl KubeSliceStore {
  pub fn new(client: kube::Client, field_manager: impl Into<String>) -> Self {
    let gvk = GroupVersionKind::gvk(
      crate::api::RESOURCE_GROUP,
      crate::api::RESOURCE_VERSION,
      "ResourceSlice",
    );
    let resource = ApiResource::from_gvk(&gvk);

    Self {
      api: Api::all_with(client, &resource),
      resource,
      field_manager: field_manager.into(),
    }
  }
}

#[async_trait]
impl SliceStore for KubeSliceStore {
  async fn publish(&self, resources: &DriverResources) -> Result<(), PublishError> {
    let name = slice_name(&resources.node_name, &resources.driver_name);
    let object = DynamicObject::new(&name, &self.resource).data(json!({
      "spec": slice_spec(resources),
    }));

    self
      .api
      .patch(
        &name,
        &PatchParams::apply(&self.field_manager).force(),
        &Patch::Apply(&object),
      )
      .await?;

    Ok(())
  }
}

pub fn slice_name(node_name: &str, driver_name: &str) -> String {
  format!("{}-{}", node_name, driver_name.replace('.', "-"))
}

pub fn slice_spec(resources: &DriverResources) -> serde_json::Value {
  let devices: Vec<serde_json::Value> = resources
    .devices
    .iter()
    .map(|device| {
      let attributes: serde_json::Map<String, serde_json::Value> = device
        .attributes()
        .iter()
        .map(|(name, value)| (name.to_string(), attribute_json(value)))
        .collect();

      let capacity: serde_json::Map<String, serde_json::Value> = device
        .capacity()
        .iter()
        .map(|(name, value)| (name.to_string(), json!({ "value": value.to_string() })))
        .collect();

      let mut basic = serde_json::Map::new();
      basic.insert("attributes".to_string(), attributes.into());
      if !capacity.is_empty() {
        basic.insert("capacity".to_string(), capacity.into());
      }

      json!({
        "name": device.name().as_str(),
        "basic": basic,
      })
    })
    .collect();

  json!({
    "driver": resources.driver_name,
    "nodeName": resources.node_name,
    "pool": {
      "name": resources.node_name,
      "generation": resources.generation,
      "resourceSliceCount": 1,
    },
    "devices": devices,
  })
}

fn attribute_json(value: &AttributeValue) -> serde_json::Value {
  match value {
    AttributeValue::Str(v) => json!({ "string": v.as_str() }),
    AttributeValue::Int(v) => json!({ "int": v }),
    AttributeValue::Bool(v) => json!({ "bool": v }),
  }
}

/// Consumes inventory notifications, filters through the operator selector
/// and pushes slices. Publish failures are logged and retried on the next
/// notification; the last-published timestamp only advances on success.
pub struct Publisher {
  driver_name: String,
  node_name: String,
  selector: Option<DeviceSelector>,
  store: Arc<dyn SliceStore>,
  generation: AtomicI64,
  last_published: Mutex<Option<Instant>>,
}

impl Publisher {
  pub fn new(
    driver_name: impl Into<String>,
    node_name: impl Into<String>,
    selector: Option<DeviceSelector>,
    store: Arc<dyn SliceStore>,
  ) -> Self {
    Self {
      driver_name: driver_name.into(),
      node_name: node_name.into(),
      selector,
      store,
      generation: AtomicI64::new(1),
      last_published: Mutex::new(None),
    }
  }

  pub fn last_published(&self) -> Option<Instant> {
    *self.last_published.lock().unwrap()
  }

  pub async fn publish_resources(&self, mut notifications: mpsc::Receiver<Vec<Device>>) {
    let mut last_attempt: Option<Instant> = None;

    while let Some(devices) = notifications.recv().await {
      if let Some(last) = last_attempt {
        let elapsed = last.elapsed();
        if elapsed < MIN_PUBLISH_INTERVAL {
          sleep(MIN_PUBLISH_INTERVAL - elapsed).await;
        }
      }
      last_attempt = Some(Instant::now());

      let total = devices.len();
      let filtered: Vec<Device> = match &self.selector {
        Some(selector) => devices
          .into_iter()
          .filter(|device| selector.matches(device))
          .collect(),
        None => devices,
      };

      let resources = DriverResources {
        driver_name: self.driver_name.clone(),
        node_name: self.node_name.clone(),
        generation: self.generation.fetch_add(1, Ordering::Relaxed),
        devices: filtered,
      };

      match self.store.publish(&resources).await {
        Ok(()) => {
          *self.last_published.lock().unwrap() = Some(Instant::now());
          event!(
            target: "netdev-dra-manager",
            Level::DEBUG,
            published = resources.devices.len(),
            discovered = total,
            "Published resource slice"
          );
        }
        Err(error) => {
          event!(target: "netdev-dra-manager", Level::WARN, %error, "Failed to publish resource slice, will retry on next notification");
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::device::attr;
  use crate::string::InternedString;
  use std::collections::BTreeMap;

  #[derive(Default)]
  struct RecordingStore {
    published: Mutex<Vec<DriverResources>>,
    fail: std::sync::atomic::AtomicBool,
  }

  #[async_trait]
  impl SliceStore for RecordingStore {
    async fn publish(&self, resources: &DriverResources) -> Result<(), PublishError> {
      if self.fail.load(Ordering::Relaxed) {
        return Err(PublishError::Kube(kube::Error::TlsRequired));
      }

      self.published.lock().unwrap().push(resources.clone());
      Ok(())
    }
  }

  fn device(address: &str, ifname: &str) -> Device {
    let mut attributes = BTreeMap::new();
    attributes.insert(
      InternedString::new_static(attr::IF_NAME),
      AttributeValue::from(ifname),
    );
    attributes.insert(
      InternedString::new_static(attr::MTU),
      AttributeValue::from(1500i64),
    );
    attributes.insert(
      InternedString::new_static(attr::RDMA),
      AttributeValue::from(false),
    );
    Device::new(address, attributes).unwrap()
  }

  #[tokio::test]
  async fn publishes_filtered_snapshot() {
    let store = Arc::new(RecordingStore::default());
    let selector =
      DeviceSelector::compile(r#"device.attributes["ifName"] == "eth1""#).unwrap();
    let publisher = Publisher::new("netdev.dra.dev", "node-1", Some(selector), store.clone());

    let (tx, rx) = mpsc::channel(1);
    tx.send(vec![
      device("0000:8a:00.0", "eth1"),
      device("0000:8b:00.0", "eth2"),
    ])
    .await
    .unwrap();
    drop(tx);

    publisher.publish_resources(rx).await;

    let published = store.published.lock().unwrap();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].devices.len(), 1);
    assert_eq!(published[0].devices[0].name(), "net1-0000-8a-00-0");
    assert!(publisher.last_published().is_some());
  }

  #[tokio::test]
  async fn failed_publish_does_not_advance_timestamp() {
    let store = Arc::new(RecordingStore::default());
    store.fail.store(true, Ordering::Relaxed);
    let publisher = Publisher::new("netdev.dra.dev", "node-1", None, store.clone());

    let (tx, rx) = mpsc::channel(1);
    tx.send(vec![device("0000:8a:00.0", "eth1")]).await.unwrap();
    drop(tx);

    publisher.publish_resources(rx).await;
    assert!(publisher.last_published().is_none());
  }

  #[test]
  fn slice_spec_shape() {
    let resources = DriverResources {
      driver_name: "netdev.dra.dev".into(),
      node_name: "node-1".into(),
      generation: 7,
      devices: vec![device("0000:8a:00.0", "eth1")],
    };

    let spec = slice_spec(&resources);
    assert_eq!(spec["driver"], "netdev.dra.dev");
    assert_eq!(spec["pool"]["name"], "node-1");
    assert_eq!(spec["pool"]["generation"], 7);
    assert_eq!(spec["pool"]["resourceSliceCount"], 1);
    assert_eq!(spec["devices"][0]["name"], "net1-0000-8a-00-0");
    assert_eq!(
      spec["devices"][0]["basic"]["attributes"]["ifName"]["string"],
      "eth1"
    );
    assert_eq!(spec["devices"][0]["basic"]["attributes"]["mtu"]["int"], 1500);
    assert_eq!(
      spec["devices"][0]["basic"]["attributes"]["rdma"]["bool"],
      false
    );
  }

  #[test]
  fn slice_names_are_dns_safe() {
    assert_eq!(
      slice_name("node-1", "netdev.dra.dev"),
      "node-1-netdev-dra-dev"
    );
  }
}
