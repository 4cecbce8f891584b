use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::{
  collections::{BTreeMap, HashMap},
  fmt,
  net::IpAddr,
  str::FromStr,
  sync::Mutex,
};
use thiserror::Error;

use crate::netlink::parse_mac;

/// Route scope values accepted in claim configs: RT_SCOPE_UNIVERSE and
/// RT_SCOPE_LINK.
pub const SCOPE_UNIVERSE: u8 = 0;
pub const SCOPE_LINK: u8 = 253;

/// Opaque per-device configuration carried in a resource claim. Parsing is
/// strict: unknown fields reject the claim.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NetworkConfig {
  #[serde(default)]
  pub interface: InterfaceConfig,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub routes: Vec<RouteConfig>,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub neighbors: Vec<NeighborConfig>,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub rules: Vec<RuleConfig>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ethtool: Option<EthtoolConfig>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InterfaceConfig {
  /// Name the interface should carry inside the pod. Defaults to the host
  /// name of the interface.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,

  #[serde(default, skip_serializing_if = "SmallVec::is_empty")]
  pub addresses: SmallVec<[String; 2]>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub mtu: Option<u32>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub hardware_addr: Option<String>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub gso_max_size: Option<u32>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub gro_max_size: Option<u32>,

  #[serde(
    default,
    rename = "gsoIPv4MaxSize",
    skip_serializing_if = "Option::is_none"
  )]
  pub gso_ipv4_max_size: Option<u32>,

  #[serde(
    default,
    rename = "groIPv4MaxSize",
    skip_serializing_if = "Option::is_none"
  )]
  pub gro_ipv4_max_size: Option<u32>,

  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub disable_ebpf_programs: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RouteConfig {
  /// CIDR or bare IP.
  pub destination: String,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub gateway: Option<String>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source: Option<String>,

  /// 0 (universe) or 253 (link).
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub scope: Option<u8>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub table: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NeighborConfig {
  pub destination: String,
  pub hardware_addr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuleConfig {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub priority: Option<u32>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub table: Option<u32>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source: Option<String>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub destination: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EthtoolConfig {
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub features: BTreeMap<String, bool>,
}

/// Everything the effector needs, with addresses and routes already parsed.
/// Produced by [`NetworkConfig::compile`], which is also the validation
/// entry point.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredState {
  pub name: Option<String>,
  pub addresses: Vec<IpNetwork>,
  pub mtu: Option<u32>,
  pub hardware_addr: Option<Vec<u8>>,
  pub gso_max_size: Option<u32>,
  pub gro_max_size: Option<u32>,
  pub gso_ipv4_max_size: Option<u32>,
  pub gro_ipv4_max_size: Option<u32>,
  pub disable_ebpf_programs: bool,
  pub routes: Vec<RouteSpec>,
  pub neighbors: Vec<NeighborSpec>,
  pub rules: Vec<RuleSpec>,
  pub ethtool_features: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteSpec {
  pub destination: IpNetwork,
  pub gateway: Option<IpAddr>,
  pub source: Option<IpAddr>,
  pub scope: u8,
  pub table: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NeighborSpec {
  pub destination: IpAddr,
  pub hardware_addr: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleSpec {
  pub priority: Option<u32>,
  pub table: u32,
  pub source: Option<IpNetwork>,
  pub destination: Option<IpNetwork>,
}

/// All problems found in a config, reported together.
#[derive(Debug, PartialEq)]
pub struct ValidationErrors(pub Vec<String>);

impl fmt::Display for ValidationErrors {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "invalid network config: {}", self.0.join("; "))
  }
}

impl std::error::Error for ValidationErrors {}

#[derive(Debug, Error)]
pub enum ConfigParseError {
  #[error("Failed to parse network config: {0}")]
  Parse(#[from] serde_json::Error),

  #[error(transparent)]
  Validation(#[from] ValidationErrors),
}

impl NetworkConfig {
  /// Strict parse followed by validation.
  pub fn parse(parameters: &serde_json::Value) -> Result<Self, ConfigParseError> {
    let config: NetworkConfig = serde_json::from_value(parameters.clone())?;
    config.compile()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ValidationErrors> {
    self.compile().map(drop)
  }

  /// Parse every field into effector-ready values, collecting all errors
  /// instead of stopping at the first.
  pub fn compile(&self) -> Result<DesiredState, ValidationErrors> {
    let mut errors = Vec::new();

    let mut addresses = Vec::new();
    for address in &self.interface.addresses {
      match IpNetwork::from_str(address) {
        Ok(network) => addresses.push(network),
        Err(_) => errors.push(format!("address {:?} is not a valid CIDR", address)),
      }
    }

    if let Some(mtu) = self.interface.mtu {
      if mtu == 0 {
        errors.push("mtu must be a positive integer".to_string());
      }
    }

    let hardware_addr = match &self.interface.hardware_addr {
      None => None,
      Some(mac) => match parse_mac(mac) {
        Ok(bytes) => Some(bytes),
        Err(_) => {
          errors.push(format!("hardwareAddr {:?} is not a valid MAC", mac));
          None
        }
      },
    };

    let mut routes = Vec::new();
    for route in &self.routes {
      match compile_route(route) {
        Ok(spec) => routes.push(spec),
        Err(mut route_errors) => errors.append(&mut route_errors),
      }
    }

    let mut neighbors = Vec::new();
    for neighbor in &self.neighbors {
      let destination = match IpAddr::from_str(&neighbor.destination) {
        Ok(ip) => Some(ip),
        Err(_) => {
          errors.push(format!(
            "neighbor destination {:?} is not a valid IP",
            neighbor.destination
          ));
          None
        }
      };

      let hardware_addr = match parse_mac(&neighbor.hardware_addr) {
        Ok(bytes) => Some(bytes),
        Err(_) => {
          errors.push(format!(
            "neighbor hardwareAddr {:?} is not a valid MAC",
            neighbor.hardware_addr
          ));
          None
        }
      };

      if let (Some(destination), Some(hardware_addr)) = (destination, hardware_addr) {
        neighbors.push(NeighborSpec {
          destination,
          hardware_addr,
        });
      }
    }

    let mut rules = Vec::new();
    for rule in &self.rules {
      match compile_rule(rule) {
        Ok(spec) => rules.push(spec),
        Err(mut rule_errors) => errors.append(&mut rule_errors),
      }
    }

    if !errors.is_empty() {
      return Err(ValidationErrors(errors));
    }

    Ok(DesiredState {
      name: self.interface.name.clone(),
      addresses,
      mtu: self.interface.mtu,
      hardware_addr,
      gso_max_size: self.interface.gso_max_size,
      gro_max_size: self.interface.gro_max_size,
      gso_ipv4_max_size: self.interface.gso_ipv4_max_size,
      gro_ipv4_max_size: self.interface.gro_ipv4_max_size,
      disable_ebpf_programs: self.interface.disable_ebpf_programs,
      routes,
      neighbors,
      rules,
      ethtool_features: self
        .ethtool
        .as_ref()
        .map(|e| e.features.clone())
        .unwrap_or_default(),
    })
  }
}

/// CIDR, or a bare IP treated as a host prefix.
fn parse_destination(text: &str) -> Result<IpNetwork, ()> {
  if let Ok(network) = IpNetwork::from_str(text) {
    return Ok(network);
  }

  let ip = IpAddr::from_str(text).map_err(drop)?;
  IpNetwork::new(ip, if ip.is_ipv4() { 32 } else { 128 }).map_err(drop)
}

fn compile_route(route: &RouteConfig) -> Result<RouteSpec, Vec<String>> {
  let mut errors = Vec::new();

  let destination = match parse_destination(&route.destination) {
    Ok(network) => Some(network),
    Err(()) => {
      errors.push(format!(
        "route destination {:?} is not a valid CIDR or IP",
        route.destination
      ));
      None
    }
  };

  let scope = match route.scope {
    None | Some(SCOPE_UNIVERSE) => SCOPE_UNIVERSE,
    Some(SCOPE_LINK) => SCOPE_LINK,
    Some(other) => {
      errors.push(format!(
        "route scope {} is not supported (must be {} or {})",
        other, SCOPE_UNIVERSE, SCOPE_LINK
      ));
      SCOPE_UNIVERSE
    }
  };

  let gateway = match &route.gateway {
    None => None,
    Some(gateway) => match IpAddr::from_str(gateway) {
      Ok(ip) => Some(ip),
      Err(_) => {
        errors.push(format!("route gateway {:?} is not a valid IP", gateway));
        None
      }
    },
  };

  if scope == SCOPE_UNIVERSE && route.gateway.is_none() {
    errors.push(format!(
      "route to {:?} needs a gateway (only link-scope routes may omit it)",
      route.destination
    ));
  }

  let source = match &route.source {
    None => None,
    Some(source) => match IpAddr::from_str(source) {
      Ok(ip) => Some(ip),
      Err(_) => {
        errors.push(format!("route source {:?} is not a valid IP", source));
        None
      }
    },
  };

  if !errors.is_empty() {
    return Err(errors);
  }

  Ok(RouteSpec {
    destination: destination.unwrap(),
    gateway,
    source,
    scope,
    table: route.table.unwrap_or(0),
  })
}

fn compile_rule(rule: &RuleConfig) -> Result<RuleSpec, Vec<String>> {
  let mut errors = Vec::new();

  let source = match &rule.source {
    None => None,
    Some(source) => match IpNetwork::from_str(source) {
      Ok(network) => Some(network),
      Err(_) => {
        errors.push(format!("rule source {:?} is not a valid CIDR", source));
        None
      }
    },
  };

  let destination = match &rule.destination {
    None => None,
    Some(destination) => match IpNetwork::from_str(destination) {
      Ok(network) => Some(network),
      Err(_) => {
        errors.push(format!(
          "rule destination {:?} is not a valid CIDR",
          destination
        ));
        None
      }
    },
  };

  if !errors.is_empty() {
    return Err(errors);
  }

  Ok(RuleSpec {
    priority: rule.priority,
    table: rule.table.unwrap_or(u32::from(RT_TABLE_MAIN_RULE)),
    source,
    destination,
  })
}

const RT_TABLE_MAIN_RULE: u8 = 254;

/// Desired state for one pod interface: the parsed claim config plus the
/// RDMA character devices the pod must be granted.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PodConfig {
  pub config: NetworkConfig,
  pub rdma_devices: Vec<String>,
}

/// pod-UID -> { request name -> PodConfig }, shared between the DRA plugin
/// server and the runtime event handler.
#[derive(Debug, Default)]
pub struct PodConfigStore {
  inner: Mutex<HashMap<String, HashMap<String, PodConfig>>>,
}

impl PodConfigStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Replaces any existing entry for `(pod_uid, request)`.
  pub fn set(&self, pod_uid: &str, request: &str, config: PodConfig) {
    let mut inner = self.inner.lock().unwrap();
    inner
      .entry(pod_uid.to_string())
      .or_default()
      .insert(request.to_string(), config);
  }

  pub fn get(&self, pod_uid: &str) -> Option<HashMap<String, PodConfig>> {
    self.inner.lock().unwrap().get(pod_uid).cloned()
  }

  pub fn get_entry(&self, pod_uid: &str, request: &str) -> Option<PodConfig> {
    self
      .inner
      .lock()
      .unwrap()
      .get(pod_uid)
      .and_then(|configs| configs.get(request))
      .cloned()
  }

  /// Atomically removes and returns everything recorded for the pod.
  pub fn drain(&self, pod_uid: &str) -> Option<HashMap<String, PodConfig>> {
    self.inner.lock().unwrap().remove(pod_uid)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn parse_full_config() {
    let parameters = json!({
      "interface": {
        "name": "net0",
        "addresses": ["192.168.1.10/24"],
        "mtu": 9000,
        "hardwareAddr": "aa:bb:cc:dd:ee:ff",
        "gsoMaxSize": 65536
      },
      "routes": [
        {"destination": "10.0.0.0/8", "gateway": "192.168.1.1"},
        {"destination": "192.168.1.1", "scope": 253}
      ],
      "neighbors": [{"destination": "192.168.1.1", "hardwareAddr": "00:11:22:33:44:55"}],
      "rules": [{"priority": 100, "table": 100, "source": "192.168.1.0/24"}],
      "ethtool": {"features": {"rx-checksum": true}}
    });

    let config = NetworkConfig::parse(&parameters).unwrap();
    let state = config.compile().unwrap();
    assert_eq!(state.name.as_deref(), Some("net0"));
    assert_eq!(state.addresses.len(), 1);
    assert_eq!(state.routes.len(), 2);
    assert_eq!(state.routes[1].scope, SCOPE_LINK);
    assert_eq!(state.neighbors.len(), 1);
    assert_eq!(state.rules.len(), 1);
    assert_eq!(state.rules[0].table, 100);
    assert_eq!(state.ethtool_features["rx-checksum"], true);
  }

  #[test]
  fn unknown_fields_are_rejected() {
    let parameters = json!({"gateways": "x"});
    let error = NetworkConfig::parse(&parameters).unwrap_err();
    assert!(
      error.to_string().contains("gateways"),
      "error should mention the unknown field: {}",
      error
    );
  }

  #[test]
  fn serde_round_trip() {
    let parameters = json!({
      "interface": {"name": "net0", "addresses": ["10.1.0.2/16"]},
      "routes": [{"destination": "10.0.0.0/8", "gateway": "10.1.0.1"}]
    });

    let config = NetworkConfig::parse(&parameters).unwrap();
    let serialized = serde_json::to_value(&config).unwrap();
    let reparsed = NetworkConfig::parse(&serialized).unwrap();
    assert_eq!(config, reparsed);
  }

  #[test]
  fn empty_config_is_valid() {
    let config = NetworkConfig::parse(&json!({})).unwrap();
    let state = config.compile().unwrap();
    assert!(state.addresses.is_empty());
    assert!(state.routes.is_empty());
  }

  #[test]
  fn link_scope_route_may_omit_gateway() {
    let config = NetworkConfig {
      routes: vec![RouteConfig {
        destination: "10.0.5.1".into(),
        gateway: None,
        source: None,
        scope: Some(SCOPE_LINK),
        table: None,
      }],
      ..Default::default()
    };

    let state = config.compile().unwrap();
    assert_eq!(state.routes[0].destination.prefix(), 32);
  }

  #[test]
  fn universe_scope_route_requires_gateway() {
    let config = NetworkConfig {
      routes: vec![RouteConfig {
        destination: "10.0.0.0/8".into(),
        gateway: None,
        source: None,
        scope: None,
        table: None,
      }],
      ..Default::default()
    };

    let errors = config.compile().unwrap_err();
    assert!(errors.0.iter().any(|e| e.contains("needs a gateway")));
  }

  #[test]
  fn all_errors_are_collected() {
    let config = NetworkConfig {
      interface: InterfaceConfig {
        addresses: smallvec::smallvec!["not-a-cidr".to_string()],
        mtu: Some(0),
        ..Default::default()
      },
      routes: vec![RouteConfig {
        destination: "bad".into(),
        gateway: Some("also-bad".into()),
        source: None,
        scope: Some(7),
        table: None,
      }],
      ..Default::default()
    };

    let errors = config.compile().unwrap_err();
    assert!(errors.0.len() >= 4, "expected many errors: {:?}", errors);
  }

  #[test]
  fn store_set_get_drain() {
    let store = PodConfigStore::new();
    store.set("pod-1", "nic0", PodConfig::default());
    store.set(
      "pod-1",
      "nic1",
      PodConfig {
        rdma_devices: vec!["/dev/infiniband/uverbs0".into()],
        ..Default::default()
      },
    );

    assert_eq!(store.get("pod-1").unwrap().len(), 2);
    assert!(store.get_entry("pod-1", "nic1").is_some());
    assert!(store.get("pod-2").is_none());

    let drained = store.drain("pod-1").unwrap();
    assert_eq!(drained.len(), 2);
    assert!(store.get("pod-1").is_none());
    assert!(store.drain("pod-1").is_none());
  }

  #[test]
  fn set_replaces_existing_entry() {
    let store = PodConfigStore::new();
    store.set("pod-1", "nic0", PodConfig::default());

    let replacement = PodConfig {
      rdma_devices: vec!["/dev/infiniband/uverbs1".into()],
      ..Default::default()
    };
    store.set("pod-1", "nic0", replacement.clone());

    assert_eq!(store.get_entry("pod-1", "nic0").unwrap(), replacement);
  }
}
