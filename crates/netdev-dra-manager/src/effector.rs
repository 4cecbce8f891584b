use crate::{
  ethtool,
  netlink::{self, rdma, HandleCache, NetlinkError},
  netns::{self, NetnsError},
  podconfig::{DesiredState, RouteSpec, SCOPE_LINK},
};
use std::{
  fs::File,
  io,
  os::unix::io::AsRawFd,
  path::{Path, PathBuf},
  sync::Arc,
};
use thiserror::Error;
use tracing::{event, Level};

const ROOT_NETNS: &str = "/proc/self/ns/net";

#[derive(Debug, Error)]
pub enum EffectorError {
  #[error("Failed to open network namespace {path:?}")]
  OpenNetns {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Netns(#[from] NetnsError),

  #[error(transparent)]
  Netlink(#[from] NetlinkError),

  #[error(transparent)]
  Rdma(#[from] rdma::RdmaError),

  #[error(transparent)]
  Ethtool(#[from] ethtool::EthtoolError),

  #[error("No interface named {interface:?} in namespace {namespace:?}")]
  MissingLink {
    interface: String,
    namespace: PathBuf,
  },

  #[error("Background task failed: {0}")]
  Join(#[from] tokio::task::JoinError),
}

/// The code that touches the kernel: moves net and RDMA links between
/// namespaces and programs the desired state inside the target namespace.
/// Every step is idempotent so a retried attach converges.
pub struct Effector {
  handles: Arc<HandleCache>,
}

impl Effector {
  pub fn new(handles: Arc<HandleCache>) -> Self {
    Self { handles }
  }

  /// Move `host_if` (and its RDMA link, when present) into the namespace at
  /// `netns_path`, then configure it there. Safe to retry: a link that has
  /// already moved is configured in place, and every config step treats
  /// already-present state as success.
  pub async fn attach(
    &self,
    host_if: &str,
    rdma_device: Option<&str>,
    netns_path: &Path,
    desired: &DesiredState,
  ) -> Result<(), EffectorError> {
    let ns_file = File::open(netns_path).map_err(|source| EffectorError::OpenNetns {
      path: netns_path.to_owned(),
      source,
    })?;

    if let Some(rdma_name) = rdma_device {
      self.move_rdma_in(rdma_name, &ns_file).await?;
    }

    let root = self.handles.root();
    match root.link_by_name(host_if).await? {
      Some(link) => {
        let index = netlink::link_index(&link);
        if desired.disable_ebpf_programs {
          root.flush_ingress_filters(index).await?;
        }
        root.move_link_to_ns_fd(index, ns_file.as_raw_fd()).await?;
      }
      None => {
        // Not on the host: either a previous partial attach already moved
        // it, or the device is gone. configure() settles which.
        event!(target: "netdev-dra-manager", Level::DEBUG, interface = host_if, "Link not in the root namespace, assuming it already moved");
      }
    }

    self.configure(host_if, netns_path, desired).await
  }

  /// The RDMA link moves via its own netlink family. The move is executed on
  /// a plain blocking thread, which lives in the root namespace.
  async fn move_rdma_in(&self, rdma_name: &str, ns_file: &File) -> Result<(), EffectorError> {
    let fd = ns_file.try_clone().map_err(|source| EffectorError::OpenNetns {
      path: ROOT_NETNS.into(),
      source,
    })?;
    let name = rdma_name.to_string();

    let result =
      tokio::task::spawn_blocking(move || rdma::move_device_to_netns(&name, fd.as_raw_fd()))
        .await?;

    match result {
      Ok(()) => Ok(()),
      // already moved by a previous partial attach
      Err(rdma::RdmaError::DeviceNotFound(name)) => {
        event!(target: "netdev-dra-manager", Level::DEBUG, rdma = %name, "RDMA device not in the root namespace, assuming it already moved");
        Ok(())
      }
      Err(error) => Err(error.into()),
    }
  }

  async fn configure(
    &self,
    host_if: &str,
    netns_path: &Path,
    desired: &DesiredState,
  ) -> Result<(), EffectorError> {
    let handle = self.handles.in_netns(netns_path).await?;

    let target_name = desired.name.as_deref().unwrap_or(host_if);
    let link = match handle.link_by_name(host_if).await? {
      Some(link) => link,
      None => handle
        .link_by_name(target_name)
        .await?
        .ok_or_else(|| EffectorError::MissingLink {
          interface: host_if.to_string(),
          namespace: netns_path.to_owned(),
        })?,
    };
    let index = netlink::link_index(&link);

    if netlink::link_name(&link).as_deref() != Some(target_name) {
      handle.rename_link(index, target_name).await?;
    }

    if let Some(mac) = &desired.hardware_addr {
      handle.set_mac(index, mac).await?;
    }
    if let Some(mtu) = desired.mtu {
      handle.set_mtu(index, mtu).await?;
    }
    handle
      .set_link_sizes(
        index,
        desired.gso_max_size,
        desired.gro_max_size,
        desired.gso_ipv4_max_size,
        desired.gro_ipv4_max_size,
      )
      .await?;

    if !desired.ethtool_features.is_empty() {
      let features = desired.ethtool_features.clone();
      let interface = target_name.to_string();
      let outcome = netns::enter(netns_path, move || {
        ethtool::set_features(&interface, &features)
      })
      .await??;

      if !outcome.unknown.is_empty() {
        event!(
          target: "netdev-dra-manager",
          Level::WARN,
          interface = target_name,
          unknown = ?outcome.unknown,
          "Some ethtool features are unknown to the device"
        );
      }
    }

    for address in &desired.addresses {
      handle.add_address(index, *address).await?;
    }

    handle.set_up(index).await?;

    for route in order_routes(&desired.routes) {
      handle.add_route(index, &route).await?;
    }
    for neighbor in &desired.neighbors {
      handle.add_neighbour(index, neighbor).await?;
    }
    for rule in &desired.rules {
      handle.add_rule(rule).await?;
    }

    Ok(())
  }

  /// Move the link called `ifname` from the pod namespace back to the root
  /// namespace. A namespace or link that is already gone counts as detached;
  /// addresses and routes inside the pod namespace die with the move.
  pub async fn detach(&self, netns_path: &Path, ifname: &str) -> Result<(), EffectorError> {
    let root_ns = File::open(ROOT_NETNS).map_err(|source| EffectorError::OpenNetns {
      path: ROOT_NETNS.into(),
      source,
    })?;

    let handle = match self.handles.in_netns(netns_path).await {
      Ok(handle) => handle,
      Err(NetlinkError::Netns(ref error)) if error.is_not_found() => {
        self.handles.invalidate(netns_path).await;
        return Ok(());
      }
      Err(error) => return Err(error.into()),
    };

    self.move_rdma_out(netns_path, ifname, &root_ns).await?;

    match handle.link_by_name(ifname).await? {
      None => Ok(()),
      Some(link) => {
        handle
          .move_link_to_ns_fd(netlink::link_index(&link), root_ns.as_raw_fd())
          .await?;
        Ok(())
      }
    }
  }

  /// Drop the cached netlink handle for a namespace that is going away.
  pub async fn forget_namespace(&self, netns_path: &Path) {
    self.handles.invalidate(netns_path).await;
  }

  /// If an RDMA link carrying the interface's name exists in the pod
  /// namespace, move it back before the netdev.
  async fn move_rdma_out(
    &self,
    netns_path: &Path,
    ifname: &str,
    root_ns: &File,
  ) -> Result<(), EffectorError> {
    let fd = root_ns.try_clone().map_err(|source| EffectorError::OpenNetns {
      path: ROOT_NETNS.into(),
      source,
    })?;
    let name = ifname.to_string();

    let result = netns::enter(netns_path, move || -> Result<(), rdma::RdmaError> {
      if rdma::device_exists(&name)? {
        rdma::move_device_to_netns(&name, fd.as_raw_fd())?;
      }

      Ok(())
    })
    .await;

    match result {
      Ok(inner) => inner.map_err(Into::into),
      Err(ref error) if error.is_not_found() => Ok(()),
      Err(error) => Err(error.into()),
    }
  }
}

/// Link-scope routes must be installed before universe-scope routes: the
/// latter may depend on the former for gateway resolution.
pub fn order_routes(routes: &[RouteSpec]) -> Vec<RouteSpec> {
  let mut ordered = routes.to_vec();
  ordered.sort_by_key(|route| route.scope != SCOPE_LINK);
  ordered
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::podconfig::SCOPE_UNIVERSE;
  use std::net::IpAddr;

  fn route(destination: &str, scope: u8) -> RouteSpec {
    RouteSpec {
      destination: destination.parse().unwrap(),
      gateway: Some("10.0.5.1".parse::<IpAddr>().unwrap()),
      source: None,
      scope,
      table: 0,
    }
  }

  #[test]
  fn link_scope_routes_come_first() {
    let routes = vec![
      route("10.0.0.0/8", SCOPE_UNIVERSE),
      route("10.0.5.1/32", SCOPE_LINK),
      route("172.16.0.0/12", SCOPE_UNIVERSE),
      route("10.0.5.2/32", SCOPE_LINK),
    ];

    let ordered = order_routes(&routes);
    assert_eq!(ordered[0].scope, SCOPE_LINK);
    assert_eq!(ordered[1].scope, SCOPE_LINK);
    assert_eq!(ordered[2].scope, SCOPE_UNIVERSE);
    assert_eq!(ordered[3].scope, SCOPE_UNIVERSE);
    // stable within each scope
    assert_eq!(ordered[0].destination, routes[1].destination);
    assert_eq!(ordered[2].destination, routes[0].destination);
  }

  #[tokio::test]
  async fn detach_treats_missing_namespace_as_detached() {
    let handles = Arc::new(HandleCache::new().unwrap());
    let effector = Effector::new(handles);

    let result = effector
      .detach(Path::new("/run/netns/does-not-exist"), "eth1")
      .await;
    assert!(result.is_ok(), "missing netns must detach cleanly: {:?}", result);
  }

  #[tokio::test]
  async fn attach_surfaces_missing_namespace() {
    let handles = Arc::new(HandleCache::new().unwrap());
    let effector = Effector::new(handles);

    let desired = crate::podconfig::NetworkConfig::default().compile().unwrap();
    let result = effector
      .attach("eth1", None, Path::new("/run/netns/does-not-exist"), &desired)
      .await;
    assert!(matches!(result, Err(EffectorError::OpenNetns { .. })));
  }
}
