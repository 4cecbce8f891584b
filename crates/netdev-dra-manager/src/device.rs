use crate::string::InternedString;
use serde::Serialize;
use std::{collections::BTreeMap, fmt, sync::Arc};
use thiserror::Error;

/// Prefix of the versioned device naming scheme. A new scheme needs a new
/// prefix and a parallel denormalizer.
pub const DEVICE_NAME_PREFIX: &str = "net1";

/// Attribute names published for every device. Names must stay stable; the
/// scheduler selects on them.
pub mod attr {
  pub const IF_NAME: &str = "ifName";
  pub const MAC: &str = "mac";
  pub const MTU: &str = "mtu";
  pub const ENCAPSULATION: &str = "encapsulation";
  pub const ALIAS: &str = "alias";
  pub const STATE: &str = "state";
  pub const TYPE: &str = "type";
  pub const IPV4: &str = "ipv4";
  pub const IPV6: &str = "ipv6";
  pub const PCI_VENDOR: &str = "pciVendor";
  pub const PCI_DEVICE: &str = "pciDevice";
  pub const PCI_SUBSYSTEM: &str = "pciSubsystem";
  pub const NUMA_NODE: &str = "numaNode";
  pub const PCI_ROOT: &str = "pciRoot";
  pub const RDMA: &str = "rdma";
  pub const RDMA_DEVICE: &str = "rdmaDevice";
  pub const SRIOV: &str = "sriov";
  pub const SRIOV_VFS: &str = "sriovVfs";
  pub const VIRTUAL: &str = "virtual";
  pub const EBPF: &str = "ebpf";
  pub const TC_FILTER_NAMES: &str = "tcFilterNames";
  pub const TCX_PROGRAM_NAMES: &str = "tcxProgramNames";
  pub const CLOUD_NETWORK: &str = "cloudNetwork";
  pub const INDEX: &str = "index";
}

/// The attributes that describe kernel state rather than hardware identity.
/// When a device's interface has moved into a pod the interface is invisible
/// from the host, so these are carried over from the previous refresh.
pub const MUTABLE_ATTRIBUTES: &[&str] = &[
  attr::IF_NAME,
  attr::MAC,
  attr::ENCAPSULATION,
  attr::ALIAS,
  attr::STATE,
  attr::TYPE,
  attr::IPV4,
  attr::IPV6,
  attr::EBPF,
  attr::TC_FILTER_NAMES,
  attr::TCX_PROGRAM_NAMES,
  attr::SRIOV,
  attr::SRIOV_VFS,
  attr::VIRTUAL,
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", untagged)]
pub enum AttributeValue {
  Str(InternedString),
  Int(i64),
  Bool(bool),
}

impl AttributeValue {
  pub fn as_str(&self) -> Option<&str> {
    match self {
      AttributeValue::Str(v) => Some(v.as_str()),
      _ => None,
    }
  }

  pub fn as_int(&self) -> Option<i64> {
    match self {
      AttributeValue::Int(v) => Some(*v),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      AttributeValue::Bool(v) => Some(*v),
      _ => None,
    }
  }
}

impl fmt::Display for AttributeValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      AttributeValue::Str(v) => fmt::Display::fmt(v, f),
      AttributeValue::Int(v) => fmt::Display::fmt(v, f),
      AttributeValue::Bool(v) => fmt::Display::fmt(v, f),
    }
  }
}

impl From<&str> for AttributeValue {
  fn from(value: &str) -> Self {
    AttributeValue::Str(InternedString::new(value))
  }
}

impl From<String> for AttributeValue {
  fn from(value: String) -> Self {
    AttributeValue::Str(InternedString::new(value))
  }
}

impl From<InternedString> for AttributeValue {
  fn from(value: InternedString) -> Self {
    AttributeValue::Str(value)
  }
}

impl From<i64> for AttributeValue {
  fn from(value: i64) -> Self {
    AttributeValue::Int(value)
  }
}

impl From<bool> for AttributeValue {
  fn from(value: bool) -> Self {
    AttributeValue::Bool(value)
  }
}

#[derive(Debug, PartialEq)]
struct Inner {
  name: InternedString,
  pci_address: InternedString,
  attributes: BTreeMap<InternedString, AttributeValue>,
  capacity: BTreeMap<InternedString, i64>,
}

/// A host network device keyed by its normalized PCI address. The identity
/// (name, PCI address) is immutable; the attribute bag is rebuilt on every
/// inventory refresh and is best-effort.
#[derive(Clone, PartialEq)]
pub struct Device(Arc<Inner>);

impl Device {
  pub fn new(
    pci_address: &str,
    attributes: BTreeMap<InternedString, AttributeValue>,
  ) -> Result<Self, DeviceNameError> {
    let name = normalize_pci_address(pci_address)?;

    Ok(Device(Arc::new(Inner {
      name: InternedString::new(name),
      pci_address: InternedString::new(pci_address),
      attributes,
      capacity: BTreeMap::new(),
    })))
  }

  pub fn name(&self) -> InternedString {
    self.0.name
  }

  pub fn pci_address(&self) -> InternedString {
    self.0.pci_address
  }

  pub fn attributes(&self) -> &BTreeMap<InternedString, AttributeValue> {
    &self.0.attributes
  }

  pub fn capacity(&self) -> &BTreeMap<InternedString, i64> {
    &self.0.capacity
  }

  pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
    self.0.attributes.get(name)
  }

  pub fn interface_name(&self) -> Option<&str> {
    self.attribute(attr::IF_NAME).and_then(|v| v.as_str())
  }

  pub fn mac(&self) -> Option<&str> {
    self.attribute(attr::MAC).and_then(|v| v.as_str())
  }

  pub fn rdma_device(&self) -> Option<&str> {
    self.attribute(attr::RDMA_DEVICE).and_then(|v| v.as_str())
  }

  pub fn is_rdma(&self) -> bool {
    self
      .attribute(attr::RDMA)
      .and_then(|v| v.as_bool())
      .unwrap_or(false)
  }
}

impl fmt::Debug for Device {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(&*self.0, f)
  }
}

#[derive(Debug, Error, PartialEq)]
pub enum DeviceNameError {
  #[error("Invalid PCI address: {0:?}")]
  InvalidPciAddress(String),

  #[error("Device name {0:?} does not use the net1 naming scheme")]
  UnknownScheme(String),

  #[error("Device name {0:?} is not a valid DNS-1123 label")]
  NotDns1123(String),
}

/// `0000:8a:00.0` -> `net1-0000-8a-00-0`. The result is a DNS-1123 label and
/// the mapping is reversible through [`denormalize_device_name`].
pub fn normalize_pci_address(address: &str) -> Result<String, DeviceNameError> {
  let invalid = || DeviceNameError::InvalidPciAddress(address.into());

  let (bus_part, function) = {
    let mut split = address.split('.');
    let bus_part = split.next().ok_or_else(invalid)?;
    let function = split.next().ok_or_else(invalid)?;
    if split.next().is_some() {
      return Err(invalid());
    }

    (bus_part, function)
  };

  let mut segments = bus_part.split(':');
  let domain = segments.next().ok_or_else(invalid)?;
  let bus = segments.next().ok_or_else(invalid)?;
  let device = segments.next().ok_or_else(invalid)?;
  if segments.next().is_some() {
    return Err(invalid());
  }

  for (segment, len) in &[(domain, 4), (bus, 2), (device, 2), (function, 1)] {
    if segment.len() != *len || !segment.chars().all(|c| c.is_ascii_hexdigit()) {
      return Err(invalid());
    }
    if segment.chars().any(|c| c.is_ascii_uppercase()) {
      return Err(invalid());
    }
  }

  let name = format!(
    "{}-{}-{}-{}-{}",
    DEVICE_NAME_PREFIX, domain, bus, device, function
  );
  if !is_dns1123_label(&name) {
    return Err(DeviceNameError::NotDns1123(name));
  }

  Ok(name)
}

/// `net1-0000-8a-00-0` -> `0000:8a:00.0`.
pub fn denormalize_device_name(name: &str) -> Result<String, DeviceNameError> {
  let rest = name
    .strip_prefix(DEVICE_NAME_PREFIX)
    .and_then(|rest| rest.strip_prefix('-'))
    .ok_or_else(|| DeviceNameError::UnknownScheme(name.into()))?;

  let segments: Vec<&str> = rest.split('-').collect();
  if segments.len() != 4 {
    return Err(DeviceNameError::UnknownScheme(name.into()));
  }

  let address = format!(
    "{}:{}:{}.{}",
    segments[0], segments[1], segments[2], segments[3]
  );

  // round-trip through the normalizer so malformed segments are rejected
  normalize_pci_address(&address)?;
  Ok(address)
}

pub fn is_dns1123_label(value: &str) -> bool {
  if value.is_empty() || value.len() > 63 {
    return false;
  }

  let valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-';
  if !value.chars().all(valid_char) {
    return false;
  }

  let first = value.chars().next().unwrap();
  let last = value.chars().last().unwrap();
  first != '-' && last != '-'
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn normalize_round_trips() {
    for address in &["0000:8a:00.0", "0000:00:1f.6", "abcd:ff:1e.7"] {
      let name = normalize_pci_address(address).unwrap();
      assert!(is_dns1123_label(&name), "{} is not DNS-1123", name);
      assert_eq!(denormalize_device_name(&name).unwrap(), *address);
    }
  }

  #[test]
  fn normalize_example() {
    assert_eq!(
      normalize_pci_address("0000:8a:00.0").unwrap(),
      "net1-0000-8a-00-0"
    );
  }

  #[test]
  fn normalize_rejects_malformed_addresses() {
    for address in &[
      "0000:8a:00",
      "8a:00.0",
      "0000:8a:00.0.1",
      "0000:8A:00.0",
      "000:8a:00.0",
      "zzzz:8a:00.0",
      "",
    ] {
      assert!(
        normalize_pci_address(address).is_err(),
        "{:?} should be rejected",
        address
      );
    }
  }

  #[test]
  fn denormalize_rejects_foreign_schemes() {
    for name in &["net2-0000-8a-00-0", "net1-0000-8a-00", "eth0", ""] {
      assert!(denormalize_device_name(name).is_err());
    }
  }

  #[test]
  fn device_accessors() {
    let mut attributes = BTreeMap::new();
    attributes.insert(
      InternedString::new_static(attr::IF_NAME),
      AttributeValue::from("eth1"),
    );
    attributes.insert(
      InternedString::new_static(attr::RDMA),
      AttributeValue::from(true),
    );
    attributes.insert(
      InternedString::new_static(attr::MTU),
      AttributeValue::from(1500i64),
    );

    let device = Device::new("0000:8a:00.0", attributes).unwrap();
    assert_eq!(device.name(), "net1-0000-8a-00-0");
    assert_eq!(device.interface_name(), Some("eth1"));
    assert!(device.is_rdma());
    assert_eq!(device.attribute(attr::MTU).unwrap().as_int(), Some(1500));
    assert_eq!(device.mac(), None);
  }
}
