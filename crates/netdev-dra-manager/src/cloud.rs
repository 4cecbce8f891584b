use async_trait::async_trait;
use hyper::{body, Body, Client, Request};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout, Instant};
use tracing::{event, Level};

/// How long startup waits for the metadata server before the driver gives up
/// and runs without cloud attributes.
const FETCH_WINDOW: Duration = Duration::from_secs(15);
const RETRY_BACKOFF: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

const GCE_METADATA_ENDPOINT: &str = "http://169.254.169.254";

#[derive(Debug, Error)]
pub enum CloudError {
  #[error("Metadata request failed: {0}")]
  Http(#[from] hyper::Error),

  #[error("Failed to build metadata request")]
  Request(#[from] hyper::http::Error),

  #[error("Metadata server answered with status {0}")]
  Status(u16),

  #[error("Failed to decode metadata response")]
  Decode(#[from] serde_json::Error),

  #[error("Gave up fetching instance metadata after {0:?}")]
  TimedOut(Duration),

  #[error("Unknown cloud provider {0:?}")]
  UnknownProvider(String),
}

/// One NIC as the cloud sees it, matched against host devices by MAC.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudNic {
  pub mac: String,
  /// Provider network the NIC is attached to.
  pub network: String,
  /// Ordinal of the NIC on the instance; used for NIC<->GPU correlation via
  /// naming conventions.
  pub index: i64,
}

/// Immutable after startup.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudInstance {
  pub provider: &'static str,
  pub instance_id: String,
  pub instance_type: String,
  /// Label for the accelerator fabric the instance type implies, when known.
  pub accelerator_protocol: Option<String>,
  pub nics: Vec<CloudNic>,
}

impl CloudInstance {
  pub fn nic_by_mac(&self, mac: &str) -> Option<&CloudNic> {
    self
      .nics
      .iter()
      .find(|nic| nic.mac.eq_ignore_ascii_case(mac))
  }
}

/// One-shot metadata fetch, pluggable per provider.
#[async_trait]
pub trait CloudProvider: Send + Sync {
  fn name(&self) -> &'static str;

  async fn fetch(&self) -> Result<CloudInstance, CloudError>;
}

pub fn provider_for(name: &str) -> Result<Box<dyn CloudProvider>, CloudError> {
  match name {
    "gce" | "gcp" => Ok(Box::new(GceMetadata::default())),
    other => Err(CloudError::UnknownProvider(other.to_string())),
  }
}

/// Fetch with retries inside the startup window; errors are returned to the
/// caller, which logs and continues without cloud attributes.
pub async fn fetch_with_retries(provider: &dyn CloudProvider) -> Result<CloudInstance, CloudError> {
  let deadline = Instant::now() + FETCH_WINDOW;
  let mut last_error = None;

  while Instant::now() < deadline {
    match timeout(REQUEST_TIMEOUT, provider.fetch()).await {
      Ok(Ok(instance)) => return Ok(instance),
      Ok(Err(error)) => {
        event!(target: "netdev-dra-manager", Level::DEBUG, provider = provider.name(), %error, "Metadata fetch attempt failed");
        last_error = Some(error);
      }
      Err(_) => {
        event!(target: "netdev-dra-manager", Level::DEBUG, provider = provider.name(), "Metadata fetch attempt timed out");
      }
    }

    sleep(RETRY_BACKOFF).await;
  }

  Err(last_error.unwrap_or(CloudError::TimedOut(FETCH_WINDOW)))
}

/// GCE metadata server client. One recursive GET describes the instance and
/// all of its NICs.
pub struct GceMetadata {
  endpoint: String,
  client: Client<hyper::client::HttpConnector>,
}

impl Default for GceMetadata {
  fn default() -> Self {
    Self::new(GCE_METADATA_ENDPOINT)
  }
}

impl GceMetadata {
  pub fn new(endpoint: impl Into<String>) -> Self {
    Self {
      endpoint: endpoint.into(),
      client: Client::new(),
    }
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GceInstance {
  #[serde(default)]
  id: serde_json::Value,

  #[serde(default)]
  machine_type: String,

  #[serde(default)]
  network_interfaces: Vec<GceNetworkInterface>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GceNetworkInterface {
  #[serde(default)]
  mac: String,

  #[serde(default)]
  network: String,
}

#[async_trait]
impl CloudProvider for GceMetadata {
  fn name(&self) -> &'static str {
    "gce"
  }

  async fn fetch(&self) -> Result<CloudInstance, CloudError> {
    let uri = format!(
      "{}/computeMetadata/v1/instance/?recursive=true",
      self.endpoint
    );
    let request = Request::get(uri)
      .header("Metadata-Flavor", "Google")
      .body(Body::empty())?;

    let response = self.client.request(request).await?;
    let status = response.status();
    if !status.is_success() {
      return Err(CloudError::Status(status.as_u16()));
    }

    let bytes = body::to_bytes(response.into_body()).await?;
    let instance: GceInstance = serde_json::from_slice(&bytes)?;

    Ok(CloudInstance {
      provider: "gce",
      instance_id: instance.id.to_string(),
      instance_type: machine_type_name(&instance.machine_type).to_string(),
      accelerator_protocol: accelerator_protocol(&instance.machine_type),
      nics: instance
        .network_interfaces
        .into_iter()
        .enumerate()
        .map(|(index, nic)| CloudNic {
          mac: nic.mac,
          network: network_name(&nic.network).to_string(),
          index: index as i64,
        })
        .collect(),
    })
  }
}

/// `projects/123/machineTypes/a3-highgpu-8g` -> `a3-highgpu-8g`.
fn machine_type_name(machine_type: &str) -> &str {
  machine_type.rsplit('/').next().unwrap_or(machine_type)
}

/// `projects/123/networks/my-vpc` -> `my-vpc`.
fn network_name(network: &str) -> &str {
  network.rsplit('/').next().unwrap_or(network)
}

/// Accelerator fabric implied by the machine family.
fn accelerator_protocol(machine_type: &str) -> Option<String> {
  let name = machine_type_name(machine_type);
  if name.starts_with("a3-mega") {
    Some("tcpxo".to_string())
  } else if name.starts_with("a3-") {
    Some("tcpx".to_string())
  } else if name.starts_with("a4-") || name.starts_with("c4-") {
    Some("rdma".to_string())
  } else {
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn gce_instance_decodes_recursive_payload() {
    let payload = json!({
      "id": 1234567890,
      "machineType": "projects/424242/machineTypes/a3-highgpu-8g",
      "networkInterfaces": [
        {"mac": "42:01:0a:00:00:02", "network": "projects/424242/networks/gpu-net"},
        {"mac": "42:01:0a:00:00:03", "network": "projects/424242/networks/data-net"}
      ]
    });

    let instance: GceInstance = serde_json::from_value(payload).unwrap();
    assert_eq!(machine_type_name(&instance.machine_type), "a3-highgpu-8g");
    assert_eq!(instance.network_interfaces.len(), 2);
    assert_eq!(network_name(&instance.network_interfaces[0].network), "gpu-net");
  }

  #[test]
  fn nic_lookup_is_case_insensitive() {
    let instance = CloudInstance {
      provider: "gce",
      instance_id: "1".into(),
      instance_type: "a3-highgpu-8g".into(),
      accelerator_protocol: Some("tcpx".into()),
      nics: vec![CloudNic {
        mac: "42:01:0A:00:00:02".into(),
        network: "gpu-net".into(),
        index: 0,
      }],
    };

    assert!(instance.nic_by_mac("42:01:0a:00:00:02").is_some());
    assert!(instance.nic_by_mac("42:01:0a:00:00:99").is_none());
  }

  #[test]
  fn accelerator_protocol_follows_machine_family() {
    assert_eq!(
      accelerator_protocol("zones/x/machineTypes/a3-megagpu-8g").as_deref(),
      Some("tcpxo")
    );
    assert_eq!(
      accelerator_protocol("a3-highgpu-8g").as_deref(),
      Some("tcpx")
    );
    assert_eq!(accelerator_protocol("e2-standard-4"), None);
  }

  #[test]
  fn unknown_provider_is_an_error() {
    assert!(matches!(
      provider_for("azure"),
      Err(CloudError::UnknownProvider(_))
    ));
  }
}
