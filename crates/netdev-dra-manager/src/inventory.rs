use crate::{
  cloud::CloudInstance,
  device::{attr, AttributeValue, Device, DeviceNameError, MUTABLE_ATTRIBUTES},
  netlink::{self, NetlinkError, NetlinkHandle},
  string::InternedString,
  sysfs::{PciDeviceInfo, PciProbe, SysfsError},
};
use arc_swap::ArcSwap;
use netlink_packet_route::link::LinkMessage;
use std::{
  collections::{BTreeMap, HashMap, HashSet},
  net::IpAddr,
  path::PathBuf,
  sync::{Arc, Mutex},
  time::Duration,
};
use thiserror::Error;
use tokio::{
  sync::mpsc,
  time::{sleep, sleep_until, Instant},
};
use tracing::{event, Level};

/// Token-bucket floor between two refreshes.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
/// A refresh happens at least this often even without sync requests.
pub const MAX_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum InventoryError {
  #[error("PCI enumeration failed")]
  Pci(#[from] SysfsError),

  #[error(transparent)]
  Netlink(#[from] NetlinkError),

  #[error("Refresh task failed: {0}")]
  Join(#[from] tokio::task::JoinError),
}

struct Shared {
  devices: ArcSwap<BTreeMap<InternedString, Device>>,
  netns_by_pod: Mutex<BTreeMap<String, PathBuf>>,
  sync_tx: mpsc::Sender<()>,
}

/// Read handle over the device catalog and the pod-netns map. Cheap to clone
/// and safe to use from any task; the catalog is an atomically swapped
/// snapshot.
#[derive(Clone)]
pub struct Inventory {
  shared: Arc<Shared>,
}

impl Inventory {
  pub fn get_device(&self, name: &str) -> Option<Device> {
    self.shared.devices.load().get(name).cloned()
  }

  pub fn interface_name_for(&self, device_name: &str) -> Option<String> {
    self
      .get_device(device_name)
      .and_then(|device| device.interface_name().map(String::from))
  }

  pub fn snapshot(&self) -> Vec<Device> {
    self.shared.devices.load().values().cloned().collect()
  }

  /// Register the network namespace of a pod, keyed by `<namespace>/<name>`.
  pub fn add_pod_netns(&self, key: &str, path: PathBuf) {
    self
      .shared
      .netns_by_pod
      .lock()
      .unwrap()
      .insert(key.to_string(), path);
  }

  pub fn remove_pod_netns(&self, key: &str) {
    self.shared.netns_by_pod.lock().unwrap().remove(key);
  }

  pub fn pod_netns(&self, key: &str) -> Option<PathBuf> {
    self.shared.netns_by_pod.lock().unwrap().get(key).cloned()
  }

  /// Request an immediate refresh. Never blocks; a refresh already pending
  /// is enough.
  pub fn sync(&self) {
    let _ = self.shared.sync_tx.try_send(());
  }
}

/// Owns the refresh loop. Split from [`Inventory`] so dropping the runner
/// closes the notification channel while read handles stay alive.
pub struct InventoryRunner {
  shared: Arc<Shared>,
  probe: Arc<dyn PciProbe>,
  netlink: NetlinkHandle,
  cloud: Option<CloudInstance>,
  sync_rx: mpsc::Receiver<()>,
  notify_tx: mpsc::Sender<Vec<Device>>,
}

pub fn new(
  probe: Arc<dyn PciProbe>,
  netlink: NetlinkHandle,
  cloud: Option<CloudInstance>,
) -> (Inventory, InventoryRunner, mpsc::Receiver<Vec<Device>>) {
  let (sync_tx, sync_rx) = mpsc::channel(1);
  let (notify_tx, notify_rx) = mpsc::channel(4);

  let shared = Arc::new(Shared {
    devices: ArcSwap::new(Arc::new(BTreeMap::new())),
    netns_by_pod: Mutex::new(BTreeMap::new()),
    sync_tx,
  });

  let inventory = Inventory {
    shared: shared.clone(),
  };
  let runner = InventoryRunner {
    shared,
    probe,
    netlink,
    cloud,
    sync_rx,
    notify_tx,
  };

  (inventory, runner, notify_rx)
}

impl InventoryRunner {
  /// Refresh loop: first pass immediately, then whenever the max interval
  /// elapses or a sync request arrives, rate-limited by the min interval.
  /// Device-level problems are logged and skipped; only failing to
  /// enumerate the PCI bus ends the loop.
  pub async fn run(mut self) -> Result<(), InventoryError> {
    let mut last_refresh: Option<Instant> = None;
    let mut had_devices = false;

    loop {
      if let Some(last) = last_refresh {
        tokio::select! {
          _ = sleep_until(last + MAX_REFRESH_INTERVAL) => {}
          received = self.sync_rx.recv() => {
            if received.is_none() {
              event!(target: "netdev-dra-manager", Level::DEBUG, "All inventory handles dropped, stopping refresh loop");
              break;
            }
          }
        }

        let elapsed = last.elapsed();
        if elapsed < MIN_REFRESH_INTERVAL {
          sleep(MIN_REFRESH_INTERVAL - elapsed).await;
        }
      }

      let devices = self.refresh().await?;
      last_refresh = Some(Instant::now());

      // Notify on content, and once more on the transition to empty so the
      // publisher can retract the last slice.
      if should_notify(devices.len(), had_devices) {
        if self.notify_tx.send(devices.clone()).await.is_err() {
          event!(target: "netdev-dra-manager", Level::DEBUG, "Notification consumer gone, stopping refresh loop");
          break;
        }
      }

      had_devices = !devices.is_empty();
    }

    Ok(())
  }

  pub async fn refresh(&self) -> Result<Vec<Device>, InventoryError> {
    let probe = self.probe.clone();
    let pci_devices = tokio::task::spawn_blocking(move || probe.scan()).await??;

    let previous = self.shared.devices.load_full();

    let links = match self.netlink.links().await {
      Ok(links) => links,
      Err(error) => {
        event!(target: "netdev-dra-manager", Level::WARN, %error, "Link dump failed, falling back to previous attributes");
        Vec::new()
      }
    };
    let links_by_name: HashMap<String, &LinkMessage> = links
      .iter()
      .filter_map(|link| netlink::link_name(link).map(|name| (name, link)))
      .collect();

    let default_gateway_links = match self.netlink.default_route_links().await {
      Ok(indexes) => indexes,
      Err(error) => {
        event!(target: "netdev-dra-manager", Level::WARN, %error, "Route dump failed, default-gateway exclusion disabled this pass");
        HashSet::new()
      }
    };

    let mut devices = BTreeMap::new();
    for info in &pci_devices {
      match self
        .build_device(info, &links_by_name, &default_gateway_links, &previous)
        .await
      {
        Ok(Some(device)) => {
          devices.insert(device.name(), device);
        }
        Ok(None) => {}
        Err(error) => {
          event!(target: "netdev-dra-manager", Level::WARN, device = %info.address, %error, "Skipping device");
        }
      }
    }

    event!(target: "netdev-dra-manager", Level::DEBUG, devices.len = devices.len(), "Inventory refresh complete");

    let snapshot: Vec<Device> = devices.values().cloned().collect();
    self.shared.devices.store(Arc::new(devices));
    Ok(snapshot)
  }

  async fn build_device(
    &self,
    info: &PciDeviceInfo,
    links_by_name: &HashMap<String, &LinkMessage>,
    default_gateway_links: &HashSet<u32>,
    previous: &BTreeMap<InternedString, Device>,
  ) -> Result<Option<Device>, DeviceNameError> {
    let mut attributes: BTreeMap<InternedString, AttributeValue> = BTreeMap::new();

    set(&mut attributes, attr::PCI_VENDOR, AttributeValue::from(info.vendor.as_str()));
    set(&mut attributes, attr::PCI_DEVICE, AttributeValue::from(info.device.as_str()));
    if !info.subsystem_vendor.is_empty() || !info.subsystem_device.is_empty() {
      set(
        &mut attributes,
        attr::PCI_SUBSYSTEM,
        AttributeValue::from(format!(
          "{}:{}",
          info.subsystem_vendor, info.subsystem_device
        )),
      );
    }
    if let Some(numa_node) = info.numa_node {
      set(&mut attributes, attr::NUMA_NODE, AttributeValue::from(numa_node));
    }
    if let Some(pci_root) = &info.pci_root {
      set(&mut attributes, attr::PCI_ROOT, AttributeValue::from(pci_root.as_str()));
    }

    set(&mut attributes, attr::RDMA, AttributeValue::from(info.rdma_device.is_some()));
    if let Some(rdma_device) = &info.rdma_device {
      set(&mut attributes, attr::RDMA_DEVICE, AttributeValue::from(rdma_device.as_str()));
    }

    let link = info
      .interface
      .as_ref()
      .and_then(|name| links_by_name.get(name).copied());

    match (info.interface.as_ref(), link) {
      (Some(ifname), Some(link)) => {
        let index = netlink::link_index(link);
        if default_gateway_links.contains(&index) {
          // Never publish the interface carrying the node's default route.
          return Ok(None);
        }

        set(&mut attributes, attr::IF_NAME, AttributeValue::from(ifname.as_str()));
        if let Some(mac) = netlink::link_mac(link) {
          set(&mut attributes, attr::MAC, AttributeValue::from(mac));
        }
        if let Some(mtu) = netlink::link_mtu(link) {
          set(&mut attributes, attr::MTU, AttributeValue::from(i64::from(mtu)));
        }
        if let Some(alias) = netlink::link_alias(link) {
          set(&mut attributes, attr::ALIAS, AttributeValue::from(alias));
        }
        if let Some(state) = netlink::link_oper_state(link) {
          set(&mut attributes, attr::STATE, AttributeValue::from(state));
        }
        set(
          &mut attributes,
          attr::ENCAPSULATION,
          AttributeValue::from(netlink::link_encapsulation(link)),
        );
        set(&mut attributes, attr::TYPE, AttributeValue::from(netlink::link_kind(link)));

        match self.netlink.addresses(index).await {
          Ok(addresses) => {
            let (v4, v6): (Vec<String>, Vec<String>) = addresses
              .iter()
              .filter(|(address, _)| netlink::is_global_unicast(address))
              .fold((Vec::new(), Vec::new()), |(mut v4, mut v6), (address, prefix)| {
                match address {
                  IpAddr::V4(_) => v4.push(format!("{}/{}", address, prefix)),
                  IpAddr::V6(_) => v6.push(format!("{}/{}", address, prefix)),
                }
                (v4, v6)
              });

            if !v4.is_empty() {
              set(&mut attributes, attr::IPV4, AttributeValue::from(v4.join(",")));
            }
            if !v6.is_empty() {
              set(&mut attributes, attr::IPV6, AttributeValue::from(v6.join(",")));
            }
          }
          Err(error) => {
            event!(target: "netdev-dra-manager", Level::DEBUG, interface = %ifname, %error, "Address dump failed");
          }
        }

        match self.netlink.tc_filter_kinds(index).await {
          Ok(kinds) => {
            if !kinds.is_empty() {
              set(
                &mut attributes,
                attr::EBPF,
                AttributeValue::from(kinds.iter().any(|kind| kind == "bpf")),
              );
              set(&mut attributes, attr::TC_FILTER_NAMES, AttributeValue::from(kinds.join(",")));
            }
          }
          Err(error) => {
            event!(target: "netdev-dra-manager", Level::DEBUG, interface = %ifname, %error, "TC filter dump failed");
          }
        }

        let sriov = info.sriov_total_vfs.unwrap_or(0) > 0;
        set(&mut attributes, attr::SRIOV, AttributeValue::from(sriov));
        if sriov {
          set(
            &mut attributes,
            attr::SRIOV_VFS,
            AttributeValue::from(info.sriov_num_vfs.unwrap_or(0)),
          );
        }

        set(
          &mut attributes,
          attr::VIRTUAL,
          AttributeValue::from(self.probe.is_virtual(ifname)),
        );
      }

      // No resolvable interface: the device has most likely moved into a
      // pod. Keep the identity attributes fresh and carry the previous
      // mutable attributes forward.
      _ => {
        let name = crate::device::normalize_pci_address(&info.address)?;
        if let Some(previous_device) = previous.get(name.as_str()) {
          for mutable in MUTABLE_ATTRIBUTES {
            if let Some(value) = previous_device.attribute(mutable) {
              attributes.insert(InternedString::new_static(mutable), value.clone());
            }
          }
        }
      }
    }

    if let Some(cloud) = &self.cloud {
      let mac = attributes
        .get(attr::MAC)
        .and_then(|value| value.as_str().map(String::from));
      if let Some(nic) = mac.as_deref().and_then(|mac| cloud.nic_by_mac(mac)) {
        set(&mut attributes, attr::CLOUD_NETWORK, AttributeValue::from(nic.network.as_str()));
        set(&mut attributes, attr::INDEX, AttributeValue::from(nic.index));
      }
    }

    Device::new(&info.address, attributes).map(Some)
  }
}

fn set(
  attributes: &mut BTreeMap<InternedString, AttributeValue>,
  name: &'static str,
  value: AttributeValue,
) {
  attributes.insert(InternedString::new_static(name), value);
}

/// Emit on content, plus one trailing notification when the catalog becomes
/// empty so consumers can observe the transition.
fn should_notify(devices_len: usize, had_devices: bool) -> bool {
  devices_len > 0 || had_devices
}

#[cfg(test)]
mod tests {
  use super::*;

  struct FakeProbe {
    devices: Mutex<Vec<PciDeviceInfo>>,
  }

  impl FakeProbe {
    fn new(devices: Vec<PciDeviceInfo>) -> Arc<Self> {
      Arc::new(Self {
        devices: Mutex::new(devices),
      })
    }

    fn set(&self, devices: Vec<PciDeviceInfo>) {
      *self.devices.lock().unwrap() = devices;
    }
  }

  impl PciProbe for FakeProbe {
    fn scan(&self) -> Result<Vec<PciDeviceInfo>, SysfsError> {
      Ok(self.devices.lock().unwrap().clone())
    }

    fn is_virtual(&self, _interface: &str) -> bool {
      false
    }

    fn rdma_char_devices(&self, _rdma_device: &str) -> Vec<String> {
      Vec::new()
    }
  }

  fn pci_device(address: &str, interface: Option<&str>) -> PciDeviceInfo {
    PciDeviceInfo {
      address: address.to_string(),
      vendor: "0x8086".to_string(),
      device: "0x1572".to_string(),
      interface: interface.map(String::from),
      ..Default::default()
    }
  }

  #[test]
  fn notification_policy_covers_empty_transition() {
    assert!(!should_notify(0, false));
    assert!(should_notify(1, false));
    assert!(should_notify(1, true));
    assert!(should_notify(0, true));
  }

  #[tokio::test]
  async fn refresh_populates_link_attributes_from_the_kernel() {
    // the loopback interface exists everywhere and is never a default
    // gateway, which makes it a handy stand-in for a NIC
    let probe = FakeProbe::new(vec![pci_device("0000:8a:00.0", Some("lo"))]);
    let netlink = NetlinkHandle::new().unwrap();
    let (inventory, runner, _rx) = new(probe, netlink, None);

    let devices = runner.refresh().await.unwrap();
    assert_eq!(devices.len(), 1);

    let device = inventory.get_device("net1-0000-8a-00-0").unwrap();
    assert_eq!(device.interface_name(), Some("lo"));
    assert!(device.attribute(attr::MTU).is_some());
    assert_eq!(
      inventory.interface_name_for("net1-0000-8a-00-0").as_deref(),
      Some("lo")
    );
  }

  #[tokio::test]
  async fn missing_interface_keeps_previous_mutable_attributes() {
    let probe = FakeProbe::new(vec![pci_device("0000:8a:00.0", Some("lo"))]);
    let netlink = NetlinkHandle::new().unwrap();
    let (inventory, runner, _rx) = new(probe.clone(), netlink, None);

    runner.refresh().await.unwrap();
    assert!(inventory
      .get_device("net1-0000-8a-00-0")
      .unwrap()
      .interface_name()
      .is_some());

    // interface vanished from the host view (moved into a pod)
    probe.set(vec![pci_device("0000:8a:00.0", None)]);
    runner.refresh().await.unwrap();

    let device = inventory.get_device("net1-0000-8a-00-0").unwrap();
    assert_eq!(
      device.interface_name(),
      Some("lo"),
      "mutable attributes must be carried over"
    );
  }

  #[tokio::test]
  async fn unknown_devices_disappear_but_known_ones_stay() {
    let probe = FakeProbe::new(vec![
      pci_device("0000:8a:00.0", Some("lo")),
      pci_device("0000:8b:00.0", None),
    ]);
    let netlink = NetlinkHandle::new().unwrap();
    let (inventory, runner, _rx) = new(probe.clone(), netlink, None);

    let devices = runner.refresh().await.unwrap();
    assert_eq!(devices.len(), 2);

    probe.set(vec![pci_device("0000:8a:00.0", Some("lo"))]);
    runner.refresh().await.unwrap();
    assert!(inventory.get_device("net1-0000-8b-00-0").is_none());
    assert!(inventory.get_device("net1-0000-8a-00-0").is_some());
  }

  #[test]
  fn pod_netns_map_round_trip() {
    let (sync_tx, _sync_rx) = mpsc::channel(1);
    let shared = Arc::new(Shared {
      devices: ArcSwap::new(Arc::new(BTreeMap::new())),
      netns_by_pod: Mutex::new(BTreeMap::new()),
      sync_tx,
    });

    let inventory = Inventory { shared };
    inventory.add_pod_netns("team-a/pod", PathBuf::from("/run/netns/x"));
    assert_eq!(
      inventory.pod_netns("team-a/pod"),
      Some(PathBuf::from("/run/netns/x"))
    );
    inventory.remove_pod_netns("team-a/pod");
    assert_eq!(inventory.pod_netns("team-a/pod"), None);
  }
}
