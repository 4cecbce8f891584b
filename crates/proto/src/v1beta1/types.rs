use super::proto;
use std::collections::HashMap;

/// Identifier for a resource claim as handed over by the kubelet. The claim
/// body itself is not part of the wire contract; plugins read it from the API
/// server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClaimRef {
  pub uid: String,
  pub namespace: String,
  pub name: String,
}

impl ClaimRef {
  /// `<namespace>/<name>` key used by stores indexing claims.
  pub fn namespaced_name(&self) -> String {
    format!("{}/{}", self.namespace, self.name)
  }
}

impl From<proto::Claim> for ClaimRef {
  fn from(value: proto::Claim) -> Self {
    Self {
      uid: value.uid,
      namespace: value.namespace,
      name: value.name,
    }
  }
}

impl From<ClaimRef> for proto::Claim {
  fn from(value: ClaimRef) -> Self {
    Self {
      uid: value.uid,
      namespace: value.namespace,
      name: value.name,
    }
  }
}

/// One device prepared for a claim, reported back to the kubelet for its
/// bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedDevice {
  pub request_name: String,
  pub pool_name: String,
  pub device_name: String,
  pub cdi_device_ids: Vec<String>,
}

impl From<PreparedDevice> for proto::Device {
  fn from(value: PreparedDevice) -> Self {
    Self {
      request_name: value.request_name,
      pool_name: value.pool_name,
      device_name: value.device_name,
      cdi_device_ids: value.cdi_device_ids,
    }
  }
}

impl From<proto::Device> for PreparedDevice {
  fn from(value: proto::Device) -> Self {
    Self {
      request_name: value.request_name,
      pool_name: value.pool_name,
      device_name: value.device_name,
      cdi_device_ids: value.cdi_device_ids,
    }
  }
}

/// Per-claim outcome of a prepare batch, keyed by claim UID. Errors are
/// carried per claim; the batch call itself only fails on transport errors.
pub type PrepareResults = HashMap<String, Result<Vec<PreparedDevice>, String>>;

/// Per-claim outcome of an unprepare batch, keyed by claim UID.
pub type UnprepareResults = HashMap<String, Result<(), String>>;

impl From<PrepareResults> for proto::NodePrepareResourcesResponse {
  fn from(value: PrepareResults) -> Self {
    let claims = value
      .into_iter()
      .map(|(uid, result)| {
        let response = match result {
          Ok(devices) => proto::NodePrepareResourceResponse {
            devices: devices.into_iter().map(Into::into).collect(),
            error: String::new(),
          },
          Err(error) => proto::NodePrepareResourceResponse {
            devices: Vec::new(),
            error,
          },
        };

        (uid, response)
      })
      .collect();

    Self { claims }
  }
}

impl From<UnprepareResults> for proto::NodeUnprepareResourcesResponse {
  fn from(value: UnprepareResults) -> Self {
    let claims = value
      .into_iter()
      .map(|(uid, result)| {
        let response = match result {
          Ok(()) => proto::NodeUnprepareResourceResponse {
            error: String::new(),
          },
          Err(error) => proto::NodeUnprepareResourceResponse { error },
        };

        (uid, response)
      })
      .collect();

    Self { claims }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn claim_ref_namespaced_name() {
    let claim = ClaimRef {
      uid: "uid-1".into(),
      namespace: "team-a".into(),
      name: "nic".into(),
    };

    assert_eq!(claim.namespaced_name(), "team-a/nic");
  }

  #[test]
  fn prepare_results_carry_per_claim_errors() {
    let mut results = PrepareResults::new();
    results.insert(
      "good".into(),
      Ok(vec![PreparedDevice {
        request_name: "req".into(),
        pool_name: "node-1".into(),
        device_name: "net1-0000-8a-00-0".into(),
        cdi_device_ids: Vec::new(),
      }]),
    );
    results.insert("bad".into(), Err("no such device".into()));

    let response = proto::NodePrepareResourcesResponse::from(results);
    assert_eq!(response.claims.len(), 2);
    assert!(response.claims["good"].error.is_empty());
    assert_eq!(response.claims["good"].devices.len(), 1);
    assert_eq!(response.claims["bad"].error, "no such device");
    assert!(response.claims["bad"].devices.is_empty());
  }
}
