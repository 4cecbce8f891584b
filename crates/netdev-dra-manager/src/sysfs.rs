use std::{
  fs, io,
  path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{event, Level};

/// PCI class prefix for network controllers (class 0x02).
const PCI_CLASS_NETWORK_PREFIX: &str = "0x02";

pub const SYS_BUS_PCI_DEVICES: &str = "bus/pci/devices";
pub const SYS_VIRTUAL_NET: &str = "devices/virtual/net";
pub const SYS_INFINIBAND_VERBS: &str = "class/infiniband_verbs";

/// Raw facts about one PCI network device, read straight out of sysfs. Pure
/// data; interpretation happens in the inventory.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PciDeviceInfo {
  /// Canonical PCI address, e.g. `0000:8a:00.0`.
  pub address: String,
  /// Vendor id as written in sysfs, e.g. `0x8086`.
  pub vendor: String,
  pub device: String,
  pub subsystem_vendor: String,
  pub subsystem_device: String,
  pub numa_node: Option<i64>,
  /// Root PCI bridge the device hangs off, e.g. `pci0000:00`.
  pub pci_root: Option<String>,
  /// Kernel interface name from the `net/` directory; absent when the
  /// interface has moved into another network namespace.
  pub interface: Option<String>,
  pub sriov_total_vfs: Option<i64>,
  pub sriov_num_vfs: Option<i64>,
  /// RDMA device associated with this function, from the `infiniband/`
  /// directory.
  pub rdma_device: Option<String>,
}

#[derive(Debug, Error)]
pub enum SysfsError {
  #[error("Failed to enumerate PCI devices under {path:?}")]
  Enumerate {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Io(#[from] io::Error),
}

/// Hardware discovery behind a trait so tests can inject a fake topology.
pub trait PciProbe: Send + Sync {
  /// Enumerate PCI devices of network class. Device-level read failures are
  /// logged and skipped; only a failure to list the bus is an error.
  fn scan(&self) -> Result<Vec<PciDeviceInfo>, SysfsError>;

  /// Whether the named interface is backed by a virtual device.
  fn is_virtual(&self, interface: &str) -> bool;

  /// `/dev/infiniband/uverbsN` character devices belonging to the given RDMA
  /// device.
  fn rdma_char_devices(&self, rdma_device: &str) -> Vec<String>;
}

/// Probe over a real (or test-constructed) sysfs tree.
pub struct SysfsPciProbe {
  root: PathBuf,
}

impl Default for SysfsPciProbe {
  fn default() -> Self {
    Self::new("/sys")
  }
}

impl SysfsPciProbe {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  fn read_device(&self, path: &Path, address: &str) -> io::Result<PciDeviceInfo> {
    let mut info = PciDeviceInfo {
      address: address.to_string(),
      vendor: read_trimmed(&path.join("vendor"))?,
      device: read_trimmed(&path.join("device"))?,
      ..Default::default()
    };

    info.subsystem_vendor = read_trimmed(&path.join("subsystem_vendor")).unwrap_or_default();
    info.subsystem_device = read_trimmed(&path.join("subsystem_device")).unwrap_or_default();
    info.numa_node = read_trimmed(&path.join("numa_node"))
      .ok()
      .and_then(|v| v.parse::<i64>().ok())
      .filter(|v| *v >= 0);
    info.pci_root = pci_root_of(path);
    info.interface = first_dir_entry(&path.join("net"));
    info.sriov_total_vfs = read_trimmed(&path.join("sriov_totalvfs"))
      .ok()
      .and_then(|v| v.parse::<i64>().ok());
    info.sriov_num_vfs = read_trimmed(&path.join("sriov_numvfs"))
      .ok()
      .and_then(|v| v.parse::<i64>().ok());
    info.rdma_device = first_dir_entry(&path.join("infiniband"));

    Ok(info)
  }
}

impl PciProbe for SysfsPciProbe {
  fn scan(&self) -> Result<Vec<PciDeviceInfo>, SysfsError> {
    let devices_dir = self.root.join(SYS_BUS_PCI_DEVICES);
    let entries = fs::read_dir(&devices_dir).map_err(|source| SysfsError::Enumerate {
      path: devices_dir.clone(),
      source,
    })?;

    let mut devices = Vec::new();
    for entry in entries {
      let entry = entry.map_err(|source| SysfsError::Enumerate {
        path: devices_dir.clone(),
        source,
      })?;

      let address = match entry.file_name().into_string() {
        Ok(v) => v,
        Err(_) => continue,
      };

      let path = entry.path();
      let class = match read_trimmed(&path.join("class")) {
        Ok(v) => v,
        Err(error) => {
          event!(target: "netdev-dra-manager", Level::DEBUG, device = %address, ?error, "Skipping PCI device without readable class");
          continue;
        }
      };

      if !class.starts_with(PCI_CLASS_NETWORK_PREFIX) {
        continue;
      }

      match self.read_device(&path, &address) {
        Ok(info) => devices.push(info),
        Err(error) => {
          event!(target: "netdev-dra-manager", Level::WARN, device = %address, ?error, "Failed to read PCI device, skipping");
        }
      }
    }

    devices.sort_by(|a, b| a.address.cmp(&b.address));
    Ok(devices)
  }

  fn is_virtual(&self, interface: &str) -> bool {
    self.root.join(SYS_VIRTUAL_NET).join(interface).exists()
  }

  fn rdma_char_devices(&self, rdma_device: &str) -> Vec<String> {
    let verbs_dir = self.root.join(SYS_INFINIBAND_VERBS);
    let entries = match fs::read_dir(&verbs_dir) {
      Ok(v) => v,
      Err(_) => return Vec::new(),
    };

    let mut devices = Vec::new();
    for entry in entries.flatten() {
      let name = match entry.file_name().into_string() {
        Ok(v) => v,
        Err(_) => continue,
      };

      let ibdev = match read_trimmed(&entry.path().join("ibdev")) {
        Ok(v) => v,
        Err(_) => continue,
      };

      if ibdev == rdma_device {
        devices.push(format!("/dev/infiniband/{}", name));
      }
    }

    devices.sort();
    devices
  }
}

fn read_trimmed(path: &Path) -> io::Result<String> {
  Ok(fs::read_to_string(path)?.trim().to_string())
}

fn first_dir_entry(path: &Path) -> Option<String> {
  let mut names: Vec<String> = fs::read_dir(path)
    .ok()?
    .flatten()
    .filter_map(|e| e.file_name().into_string().ok())
    .collect();

  names.sort();
  names.into_iter().next()
}

/// Walk the canonical device path upwards until the root bridge component,
/// e.g. `/sys/devices/pci0000:00/0000:00:02.0/0000:8a:00.0` -> `pci0000:00`.
fn pci_root_of(path: &Path) -> Option<String> {
  let canonical = fs::canonicalize(path).ok()?;
  canonical.components().find_map(|c| {
    let name = c.as_os_str().to_str()?;
    if name.starts_with("pci") && name.contains(':') {
      Some(name.to_string())
    } else {
      None
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;

  fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
  }

  fn fake_pci_device(root: &Path, address: &str, class: &str, iface: Option<&str>) -> PathBuf {
    let dev = root.join("devices/pci0000:00").join(address);
    fs::create_dir_all(&dev).unwrap();
    write(&dev.join("class"), class);
    write(&dev.join("vendor"), "0x8086");
    write(&dev.join("device"), "0x1572");
    write(&dev.join("subsystem_vendor"), "0x8086");
    write(&dev.join("subsystem_device"), "0x0001");
    write(&dev.join("numa_node"), "0");
    if let Some(iface) = iface {
      fs::create_dir_all(dev.join("net").join(iface)).unwrap();
    }

    let link = root.join(SYS_BUS_PCI_DEVICES).join(address);
    fs::create_dir_all(link.parent().unwrap()).unwrap();
    std::os::unix::fs::symlink(&dev, &link).unwrap();
    dev
  }

  #[test]
  fn scan_keeps_only_network_class_devices() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    fake_pci_device(root, "0000:8a:00.0", "0x020000", Some("eth1"));
    fake_pci_device(root, "0000:8b:00.0", "0x030000", None);

    let probe = SysfsPciProbe::new(root);
    let devices = probe.scan().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].address, "0000:8a:00.0");
    assert_eq!(devices[0].interface.as_deref(), Some("eth1"));
    assert_eq!(devices[0].vendor, "0x8086");
    assert_eq!(devices[0].numa_node, Some(0));
    assert_eq!(devices[0].pci_root.as_deref(), Some("pci0000:00"));
  }

  #[test]
  fn scan_tolerates_missing_interface() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let dev = fake_pci_device(root, "0000:8a:00.0", "0x020000", None);
    write(&dev.join("sriov_totalvfs"), "8");
    write(&dev.join("sriov_numvfs"), "2");
    fs::create_dir_all(dev.join("infiniband/mlx5_0")).unwrap();

    let probe = SysfsPciProbe::new(root);
    let devices = probe.scan().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].interface, None);
    assert_eq!(devices[0].sriov_total_vfs, Some(8));
    assert_eq!(devices[0].sriov_num_vfs, Some(2));
    assert_eq!(devices[0].rdma_device.as_deref(), Some("mlx5_0"));
  }

  #[test]
  fn scan_fails_without_pci_bus() {
    let tmp = tempfile::tempdir().unwrap();
    let probe = SysfsPciProbe::new(tmp.path());
    assert!(matches!(probe.scan(), Err(SysfsError::Enumerate { .. })));
  }

  #[test]
  fn virtual_devices_are_detected_by_prefix_dir() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join(SYS_VIRTUAL_NET).join("veth0")).unwrap();

    let probe = SysfsPciProbe::new(root);
    assert!(probe.is_virtual("veth0"));
    assert!(!probe.is_virtual("eth1"));
  }

  #[test]
  fn rdma_char_devices_match_on_ibdev() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    write(
      &root.join(SYS_INFINIBAND_VERBS).join("uverbs0/ibdev"),
      "mlx5_0\n",
    );
    write(
      &root.join(SYS_INFINIBAND_VERBS).join("uverbs1/ibdev"),
      "mlx5_1\n",
    );

    let probe = SysfsPciProbe::new(root);
    assert_eq!(
      probe.rdma_char_devices("mlx5_0"),
      vec!["/dev/infiniband/uverbs0".to_string()]
    );
    assert!(probe.rdma_char_devices("mlx5_9").is_empty());
  }
}
