use crate::device::{AttributeValue, Device};
use cel::{Context, Program, Value};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{event, Level};

#[derive(Debug, Error)]
pub enum SelectorError {
  #[error("Failed to compile selector expression: {0}")]
  Compile(String),
}

/// A compiled operator-supplied CEL expression evaluated against each
/// device's attribute bag, e.g.
/// `device.attributes["ifName"] == "eth1" && device.attributes["rdma"]`.
pub struct DeviceSelector {
  source: String,
  program: Program,
}

impl std::fmt::Debug for DeviceSelector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DeviceSelector")
      .field("source", &self.source)
      .finish()
  }
}

impl DeviceSelector {
  pub fn compile(expression: &str) -> Result<Self, SelectorError> {
    let program =
      Program::compile(expression).map_err(|e| SelectorError::Compile(e.to_string()))?;

    Ok(Self {
      source: expression.to_string(),
      program,
    })
  }

  pub fn source(&self) -> &str {
    &self.source
  }

  /// Pure function of (program, device). Evaluation errors and non-boolean
  /// results reject the device with a logged warning.
  pub fn matches(&self, device: &Device) -> bool {
    let mut context = Context::default();
    context.add_variable_from_value("device", device_value(device));

    match self.program.execute(&context) {
      Ok(Value::Bool(matched)) => matched,
      Ok(other) => {
        event!(
          target: "netdev-dra-manager",
          Level::WARN,
          device = %device.name(),
          selector = %self.source,
          "Selector evaluated to non-boolean {:?}, rejecting device",
          other
        );
        false
      }
      Err(error) => {
        event!(
          target: "netdev-dra-manager",
          Level::WARN,
          device = %device.name(),
          selector = %self.source,
          "Selector evaluation failed, rejecting device: {}",
          error
        );
        false
      }
    }
  }
}

fn device_value(device: &Device) -> Value {
  let mut attributes: HashMap<String, Value> = HashMap::new();
  for (name, value) in device.attributes() {
    let value = match value {
      AttributeValue::Str(v) => Value::from(v.to_string()),
      AttributeValue::Int(v) => Value::from(*v),
      AttributeValue::Bool(v) => Value::from(*v),
    };

    attributes.insert(name.to_string(), value);
  }

  let mut root: HashMap<String, Value> = HashMap::new();
  root.insert("name".to_string(), Value::from(device.name().to_string()));
  root.insert(
    "pciAddress".to_string(),
    Value::from(device.pci_address().to_string()),
  );
  root.insert("attributes".to_string(), Value::from(attributes));

  Value::from(root)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::device::attr;
  use crate::string::InternedString;
  use std::collections::BTreeMap;

  fn device(ifname: &str, rdma: bool, mtu: i64) -> Device {
    let mut attributes = BTreeMap::new();
    attributes.insert(
      InternedString::new_static(attr::IF_NAME),
      AttributeValue::from(ifname),
    );
    attributes.insert(
      InternedString::new_static(attr::RDMA),
      AttributeValue::from(rdma),
    );
    attributes.insert(
      InternedString::new_static(attr::MTU),
      AttributeValue::from(mtu),
    );

    Device::new("0000:8a:00.0", attributes).unwrap()
  }

  #[test]
  fn matches_on_string_attribute() {
    let selector = DeviceSelector::compile(r#"device.attributes["ifName"] == "eth1""#).unwrap();
    assert!(selector.matches(&device("eth1", false, 1500)));
    assert!(!selector.matches(&device("eth2", false, 1500)));
  }

  #[test]
  fn matches_on_bool_and_int_attributes() {
    let selector =
      DeviceSelector::compile(r#"device.attributes["rdma"] && device.attributes["mtu"] >= 1500"#)
        .unwrap();
    assert!(selector.matches(&device("eth1", true, 9000)));
    assert!(!selector.matches(&device("eth1", true, 1400)));
    assert!(!selector.matches(&device("eth1", false, 9000)));
  }

  #[test]
  fn non_boolean_result_rejects() {
    let selector = DeviceSelector::compile(r#"device.attributes["ifName"]"#).unwrap();
    assert!(!selector.matches(&device("eth1", false, 1500)));
  }

  #[test]
  fn missing_attribute_rejects_instead_of_erroring() {
    let selector = DeviceSelector::compile(r#"device.attributes["nope"] == "x""#).unwrap();
    assert!(!selector.matches(&device("eth1", false, 1500)));
  }

  #[test]
  fn bad_expression_fails_to_compile() {
    assert!(DeviceSelector::compile("device.attributes[").is_err());
  }
}
