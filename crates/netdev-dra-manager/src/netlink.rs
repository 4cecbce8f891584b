pub mod rdma;

use crate::{
  netns::{self, NetnsError},
  podconfig::{NeighborSpec, RouteSpec, RuleSpec},
};
use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use netlink_packet_core::{NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_REQUEST};
use netlink_packet_route::{
  link::{InfoKind, LinkAttribute, LinkInfo, LinkMessage},
  route::{RouteAddress, RouteAttribute, RouteScope},
  rule::RuleAction,
  tc::TcAttribute,
  RouteNetlinkMessage,
};
use netlink_packet_utils::nla::DefaultNla;
use rtnetlink::{Handle, IpVersion};
use std::{
  collections::{HashMap, HashSet},
  io,
  net::IpAddr,
  os::unix::io::RawFd,
  path::{Path, PathBuf},
  sync::Arc,
};
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle};

/// IFLA_GSO_MAX_SIZE and friends. The IPv4 split variants are newer than the
/// typed attribute enum we compile against, so all four are written as raw
/// attributes.
const IFLA_GSO_MAX_SIZE: u16 = 40;
const IFLA_GRO_MAX_SIZE: u16 = 58;
const IFLA_GSO_IPV4_MAX_SIZE: u16 = 63;
const IFLA_GRO_IPV4_MAX_SIZE: u16 = 64;

const RT_TABLE_MAIN: u8 = 254;

#[derive(Debug, Error)]
pub enum NetlinkError {
  #[error("Failed to create netlink connection")]
  Connect(#[from] io::Error),

  #[error(transparent)]
  Netns(#[from] NetnsError),

  #[error(transparent)]
  Request(#[from] rtnetlink::Error),

  #[error("No link named {0:?} in the target namespace")]
  LinkNotFound(String),

  #[error("Kernel rejected netlink request: errno {0}")]
  Kernel(i32),

  #[error("Invalid hardware address {0:?}")]
  InvalidMac(String),
}

/// An rtnetlink handle bound to one network namespace. The backing connection
/// task is aborted when the handle is dropped.
pub struct NetlinkHandle {
  handle: Handle,
  connection: JoinHandle<()>,
}

impl Drop for NetlinkHandle {
  fn drop(&mut self) {
    self.connection.abort();
  }
}

impl NetlinkHandle {
  /// Handle in the namespace of the calling process (the root namespace for
  /// this driver).
  pub fn new() -> Result<Self, NetlinkError> {
    let (connection, handle, _) = rtnetlink::new_connection()?;
    let connection = tokio::spawn(connection);
    Ok(Self { handle, connection })
  }

  /// Create the netlink socket inside the namespace at `path`. The socket
  /// keeps its namespace for its whole lifetime, so the handle stays valid
  /// after the creating thread has switched back.
  pub async fn open_in(path: &Path) -> Result<Self, NetlinkError> {
    let (connection, handle, _) = netns::enter(path, rtnetlink::new_connection).await??;
    let connection = tokio::spawn(connection);
    Ok(Self { handle, connection })
  }

  pub async fn link_by_name(&self, name: &str) -> Result<Option<LinkMessage>, NetlinkError> {
    let mut links = self
      .handle
      .link()
      .get()
      .match_name(name.to_string())
      .execute();

    match links.try_next().await {
      Ok(link) => Ok(link),
      Err(rtnetlink::Error::NetlinkError(ref e)) if e.raw_code() == -libc::ENODEV => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  pub async fn links(&self) -> Result<Vec<LinkMessage>, NetlinkError> {
    let mut links = self.handle.link().get().execute();
    let mut result = Vec::new();
    while let Some(link) = links.try_next().await? {
      result.push(link);
    }

    Ok(result)
  }

  /// Addresses assigned to the link, with prefix length.
  pub async fn addresses(&self, index: u32) -> Result<Vec<(IpAddr, u8)>, NetlinkError> {
    let mut messages = self
      .handle
      .address()
      .get()
      .set_link_index_filter(index)
      .execute();

    let mut result = Vec::new();
    while let Some(message) = messages.try_next().await? {
      let prefix = message.header.prefix_len;
      for attribute in &message.attributes {
        if let netlink_packet_route::address::AddressAttribute::Address(address) = attribute {
          result.push((*address, prefix));
        }
      }
    }

    Ok(result)
  }

  /// Interface indexes that carry a default route in the main table. These
  /// interfaces are never published.
  pub async fn default_route_links(&self) -> Result<HashSet<u32>, NetlinkError> {
    let mut result = HashSet::new();
    for version in &[IpVersion::V4, IpVersion::V6] {
      let mut routes = self.handle.route().get(version.clone()).execute();
      while let Some(route) = routes.try_next().await? {
        if route.header.destination_prefix_length != 0 || route.header.table != RT_TABLE_MAIN {
          continue;
        }

        for attribute in &route.attributes {
          if let RouteAttribute::Oif(index) = attribute {
            result.insert(*index);
          }
        }
      }
    }

    Ok(result)
  }

  /// Move the link into the namespace identified by `ns_fd`. Addresses and
  /// routes on the link are dropped by the kernel as part of the move.
  pub async fn move_link_to_ns_fd(&self, index: u32, ns_fd: RawFd) -> Result<(), NetlinkError> {
    self
      .handle
      .link()
      .set(index)
      .setns_by_fd(ns_fd)
      .execute()
      .await?;
    Ok(())
  }

  pub async fn rename_link(&self, index: u32, name: &str) -> Result<(), NetlinkError> {
    self
      .handle
      .link()
      .set(index)
      .name(name.to_string())
      .execute()
      .await?;
    Ok(())
  }

  pub async fn set_mtu(&self, index: u32, mtu: u32) -> Result<(), NetlinkError> {
    self.handle.link().set(index).mtu(mtu).execute().await?;
    Ok(())
  }

  pub async fn set_mac(&self, index: u32, mac: &[u8]) -> Result<(), NetlinkError> {
    self
      .handle
      .link()
      .set(index)
      .address(mac.to_vec())
      .execute()
      .await?;
    Ok(())
  }

  pub async fn set_up(&self, index: u32) -> Result<(), NetlinkError> {
    self.handle.link().set(index).up().execute().await?;
    Ok(())
  }

  /// Apply GSO/GRO size limits. Attributes the kernel does not know are
  /// rejected with EINVAL by the kernel, not silently dropped.
  pub async fn set_link_sizes(
    &self,
    index: u32,
    gso_max_size: Option<u32>,
    gro_max_size: Option<u32>,
    gso_ipv4_max_size: Option<u32>,
    gro_ipv4_max_size: Option<u32>,
  ) -> Result<(), NetlinkError> {
    let sizes = [
      (IFLA_GSO_MAX_SIZE, gso_max_size),
      (IFLA_GRO_MAX_SIZE, gro_max_size),
      (IFLA_GSO_IPV4_MAX_SIZE, gso_ipv4_max_size),
      (IFLA_GRO_IPV4_MAX_SIZE, gro_ipv4_max_size),
    ];

    let mut message = LinkMessage::default();
    message.header.index = index;
    let mut any = false;
    for (kind, value) in &sizes {
      if let Some(value) = value {
        message
          .attributes
          .push(LinkAttribute::Other(DefaultNla::new(
            *kind,
            value.to_ne_bytes().to_vec(),
          )));
        any = true;
      }
    }

    if !any {
      return Ok(());
    }

    let mut request = NetlinkMessage::from(RouteNetlinkMessage::SetLink(message));
    request.header.flags = NLM_F_REQUEST | NLM_F_ACK;

    let mut handle = self.handle.clone();
    let mut response = handle.request(request)?;
    while let Some(message) = futures::StreamExt::next(&mut response).await {
      if let NetlinkPayload::Error(error) = message.payload {
        let code = error.raw_code();
        if code != 0 {
          return Err(NetlinkError::Kernel(code));
        }
      }
    }

    Ok(())
  }

  /// Add an address, treating an already-present address as success.
  pub async fn add_address(&self, index: u32, network: IpNetwork) -> Result<(), NetlinkError> {
    let result = self
      .handle
      .address()
      .add(index, network.ip(), network.prefix())
      .execute()
      .await;

    collapse_exists(result)?;
    Ok(())
  }

  /// Add a route on the link, treating an already-present route as success.
  pub async fn add_route(&self, index: u32, route: &RouteSpec) -> Result<(), NetlinkError> {
    let result = match route.destination {
      IpNetwork::V4(destination) => {
        let mut request = self
          .handle
          .route()
          .add()
          .v4()
          .destination_prefix(destination.ip(), destination.prefix())
          .output_interface(index);

        if let Some(IpAddr::V4(gateway)) = route.gateway {
          request = request.gateway(gateway);
        }

        let message = request.message_mut();
        message.header.scope = route_scope(route.scope);
        if route.table != 0 {
          if route.table <= u32::from(u8::MAX) {
            message.header.table = route.table as u8;
          } else {
            message.attributes.push(RouteAttribute::Table(route.table));
          }
        }
        if let Some(IpAddr::V4(source)) = route.source {
          message
            .attributes
            .push(RouteAttribute::PrefSource(RouteAddress::Inet(source)));
        }

        request.execute().await
      }

      IpNetwork::V6(destination) => {
        let mut request = self
          .handle
          .route()
          .add()
          .v6()
          .destination_prefix(destination.ip(), destination.prefix())
          .output_interface(index);

        if let Some(IpAddr::V6(gateway)) = route.gateway {
          request = request.gateway(gateway);
        }

        let message = request.message_mut();
        message.header.scope = route_scope(route.scope);
        if route.table != 0 {
          if route.table <= u32::from(u8::MAX) {
            message.header.table = route.table as u8;
          } else {
            message.attributes.push(RouteAttribute::Table(route.table));
          }
        }
        if let Some(IpAddr::V6(source)) = route.source {
          message
            .attributes
            .push(RouteAttribute::PrefSource(RouteAddress::Inet6(source)));
        }

        request.execute().await
      }
    };

    collapse_exists(result)?;
    Ok(())
  }

  /// Add a permanent neighbor entry; duplicates are success.
  pub async fn add_neighbour(&self, index: u32, neighbor: &NeighborSpec) -> Result<(), NetlinkError> {
    // NeighbourAddRequest defaults to a permanent entry.
    let result = self
      .handle
      .neighbours()
      .add(index, neighbor.destination)
      .link_local_address(&neighbor.hardware_addr)
      .execute()
      .await;

    collapse_exists(result)?;
    Ok(())
  }

  /// Add a policy rule; duplicates are success.
  pub async fn add_rule(&self, rule: &RuleSpec) -> Result<(), NetlinkError> {
    let v6 = matches!(rule.source, Some(IpNetwork::V6(_)))
      || matches!(rule.destination, Some(IpNetwork::V6(_)));

    let result = if v6 {
      let mut request = self
        .handle
        .rule()
        .add()
        .v6()
        .action(RuleAction::ToTable)
        .table_id(rule.table);
      if let Some(priority) = rule.priority {
        request = request.priority(priority);
      }
      if let Some(IpNetwork::V6(source)) = rule.source {
        request = request.source_prefix(source.ip(), source.prefix());
      }
      if let Some(IpNetwork::V6(destination)) = rule.destination {
        request = request.destination_prefix(destination.ip(), destination.prefix());
      }

      request.execute().await
    } else {
      let mut request = self
        .handle
        .rule()
        .add()
        .v4()
        .action(RuleAction::ToTable)
        .table_id(rule.table);
      if let Some(priority) = rule.priority {
        request = request.priority(priority);
      }
      if let Some(IpNetwork::V4(source)) = rule.source {
        request = request.source_prefix(source.ip(), source.prefix());
      }
      if let Some(IpNetwork::V4(destination)) = rule.destination {
        request = request.destination_prefix(destination.ip(), destination.prefix());
      }

      request.execute().await
    };

    collapse_exists(result)?;
    Ok(())
  }

  /// Remove every TC filter below the ingress hook. A missing ingress qdisc
  /// counts as flushed.
  pub async fn flush_ingress_filters(&self, index: u32) -> Result<(), NetlinkError> {
    use netlink_packet_route::tc::{TcHandle, TcMessage};

    let mut message = TcMessage::default();
    message.header.index = index as i32;
    message.header.parent = TcHandle {
      major: 0xffff,
      minor: 0xfff1,
    };

    let mut request = NetlinkMessage::from(RouteNetlinkMessage::DelTrafficFilter(message));
    request.header.flags = NLM_F_REQUEST | NLM_F_ACK;

    let mut handle = self.handle.clone();
    let mut response = handle.request(request)?;
    while let Some(message) = futures::StreamExt::next(&mut response).await {
      if let NetlinkPayload::Error(error) = message.payload {
        match error.raw_code() {
          0 => {}
          code if code == -libc::ENOENT || code == -libc::EINVAL => {}
          code => return Err(NetlinkError::Kernel(code)),
        }
      }
    }

    Ok(())
  }

  /// Kinds of TC filters attached to the link, e.g. `bpf`.
  pub async fn tc_filter_kinds(&self, index: u32) -> Result<Vec<String>, NetlinkError> {
    let mut handle = self.handle.clone();
    let mut filters = handle.traffic_filter(index as i32).get().execute();

    let mut kinds = Vec::new();
    while let Some(message) = filters.try_next().await? {
      for attribute in &message.attributes {
        if let TcAttribute::Kind(kind) = attribute {
          if !kinds.contains(kind) {
            kinds.push(kind.clone());
          }
        }
      }
    }

    Ok(kinds)
  }
}

/// Caches per-namespace handles so a pod's attach and detach reuse a single
/// netlink socket. Entries are invalidated when the pod's namespace goes
/// away.
pub struct HandleCache {
  root: NetlinkHandle,
  pods: Mutex<HashMap<PathBuf, Arc<NetlinkHandle>>>,
}

impl HandleCache {
  pub fn new() -> Result<Self, NetlinkError> {
    Ok(Self {
      root: NetlinkHandle::new()?,
      pods: Mutex::new(HashMap::new()),
    })
  }

  pub fn root(&self) -> &NetlinkHandle {
    &self.root
  }

  pub async fn in_netns(&self, path: &Path) -> Result<Arc<NetlinkHandle>, NetlinkError> {
    let mut pods = self.pods.lock().await;
    if let Some(handle) = pods.get(path) {
      return Ok(handle.clone());
    }

    let handle = Arc::new(NetlinkHandle::open_in(path).await?);
    pods.insert(path.to_owned(), handle.clone());
    Ok(handle)
  }

  pub async fn invalidate(&self, path: &Path) {
    self.pods.lock().await.remove(path);
  }
}

fn collapse_exists(result: Result<(), rtnetlink::Error>) -> Result<(), rtnetlink::Error> {
  match result {
    Err(rtnetlink::Error::NetlinkError(ref e)) if e.raw_code() == -libc::EEXIST => Ok(()),
    other => other,
  }
}

fn route_scope(scope: u8) -> RouteScope {
  match scope {
    253 => RouteScope::Link,
    _ => RouteScope::Universe,
  }
}

pub fn link_index(message: &LinkMessage) -> u32 {
  message.header.index
}

pub fn link_name(message: &LinkMessage) -> Option<String> {
  message.attributes.iter().find_map(|attribute| match attribute {
    LinkAttribute::IfName(name) => Some(name.clone()),
    _ => None,
  })
}

pub fn link_mac(message: &LinkMessage) -> Option<String> {
  message.attributes.iter().find_map(|attribute| match attribute {
    LinkAttribute::Address(bytes) => Some(format_mac(bytes)),
    _ => None,
  })
}

pub fn link_mtu(message: &LinkMessage) -> Option<u32> {
  message.attributes.iter().find_map(|attribute| match attribute {
    LinkAttribute::Mtu(mtu) => Some(*mtu),
    _ => None,
  })
}

pub fn link_alias(message: &LinkMessage) -> Option<String> {
  message.attributes.iter().find_map(|attribute| match attribute {
    LinkAttribute::IfAlias(alias) => Some(alias.clone()),
    _ => None,
  })
}

pub fn link_oper_state(message: &LinkMessage) -> Option<String> {
  message.attributes.iter().find_map(|attribute| match attribute {
    LinkAttribute::OperState(state) => Some(format!("{:?}", state).to_lowercase()),
    _ => None,
  })
}

/// Link kind (`veth`, `bond`, ...); physical devices carry no link-info and
/// report `device`.
pub fn link_kind(message: &LinkMessage) -> String {
  let kind = message.attributes.iter().find_map(|attribute| match attribute {
    LinkAttribute::LinkInfo(infos) => infos.iter().find_map(|info| match info {
      LinkInfo::Kind(kind) => Some(kind.clone()),
      _ => None,
    }),
    _ => None,
  });

  match kind {
    Some(InfoKind::Other(name)) => name,
    Some(kind) => format!("{:?}", kind).to_lowercase(),
    None => "device".to_string(),
  }
}

pub fn link_encapsulation(message: &LinkMessage) -> String {
  format!("{:?}", message.header.link_layer_type).to_lowercase()
}

pub fn format_mac(bytes: &[u8]) -> String {
  bytes
    .iter()
    .map(|b| format!("{:02x}", b))
    .collect::<Vec<_>>()
    .join(":")
}

pub fn parse_mac(text: &str) -> Result<Vec<u8>, NetlinkError> {
  let bytes: Result<Vec<u8>, _> = text
    .split(':')
    .map(|part| u8::from_str_radix(part, 16))
    .collect();

  match bytes {
    Ok(bytes) if bytes.len() == 6 => Ok(bytes),
    _ => Err(NetlinkError::InvalidMac(text.to_string())),
  }
}

/// Global-unicast check used when publishing addresses; the std `is_global`
/// helpers are still unstable.
pub fn is_global_unicast(address: &IpAddr) -> bool {
  match address {
    IpAddr::V4(v4) => {
      !v4.is_loopback()
        && !v4.is_link_local()
        && !v4.is_multicast()
        && !v4.is_broadcast()
        && !v4.is_unspecified()
    }
    IpAddr::V6(v6) => {
      !v6.is_loopback()
        && !v6.is_multicast()
        && !v6.is_unspecified()
        // link-local unicast fe80::/10
        && (v6.segments()[0] & 0xffc0) != 0xfe80
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn mac_round_trip() {
    let bytes = parse_mac("aa:bb:cc:dd:ee:0f").unwrap();
    assert_eq!(bytes, vec![0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x0f]);
    assert_eq!(format_mac(&bytes), "aa:bb:cc:dd:ee:0f");
  }

  #[test]
  fn invalid_macs_are_rejected() {
    for mac in &["", "aa:bb", "aa:bb:cc:dd:ee:ff:00", "zz:bb:cc:dd:ee:ff"] {
      assert!(parse_mac(mac).is_err(), "{:?} should be rejected", mac);
    }
  }

  #[test]
  fn global_unicast_filter() {
    let global: IpAddr = "192.168.1.10".parse().unwrap();
    let loopback: IpAddr = "127.0.0.1".parse().unwrap();
    let link_local: IpAddr = "169.254.0.1".parse().unwrap();
    let v6_link_local: IpAddr = "fe80::1".parse().unwrap();
    let v6_global: IpAddr = "2001:db8::1".parse().unwrap();

    assert!(is_global_unicast(&global));
    assert!(!is_global_unicast(&loopback));
    assert!(!is_global_unicast(&link_local));
    assert!(!is_global_unicast(&v6_link_local));
    assert!(is_global_unicast(&v6_global));
  }

  #[test]
  fn route_scopes_map_to_kernel_scopes() {
    assert_eq!(route_scope(253), RouteScope::Link);
    assert_eq!(route_scope(0), RouteScope::Universe);
  }
}
