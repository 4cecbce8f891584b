use crate::{
  api::DeviceRequestAllocationResult,
  claims::ClaimStore,
  effector::{Effector, EffectorError},
  inventory::Inventory,
  metrics::{HookMetrics, OUTCOME_FAILED, OUTCOME_NOOP, OUTCOME_SUCCESS},
  podconfig::{PodConfigStore, ValidationErrors},
};
use async_trait::async_trait;
use std::{
  collections::{BTreeSet, HashMap},
  path::PathBuf,
  sync::{Arc, Mutex},
};
use thiserror::Error;
use tokio::{
  sync::{mpsc, oneshot},
  time::Instant,
};
use tracing::{event, Level};

/// Namespace kind carried in a pod sandbox's linux namespace list.
pub const NETWORK_NAMESPACE: &str = "network";

/// Pod sandbox as reported by the container-runtime plugin host. Only the
/// fields the driver consumes are modeled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodSandbox {
  pub id: String,
  pub uid: String,
  pub name: String,
  pub namespace: String,
  pub linux_namespaces: Vec<LinuxNamespace>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinuxNamespace {
  pub kind: String,
  pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Container {
  pub id: String,
  pub name: String,
  pub pod_sandbox_id: String,
}

impl PodSandbox {
  /// `<namespace>/<name>`, the key used in the inventory netns map.
  pub fn key(&self) -> String {
    format!("{}/{}", self.namespace, self.name)
  }

  /// Path of the pod's network namespace; `None` for host-network pods.
  pub fn network_namespace(&self) -> Option<PathBuf> {
    self
      .linux_namespaces
      .iter()
      .find(|ns| ns.kind == NETWORK_NAMESPACE && !ns.path.is_empty())
      .map(|ns| PathBuf::from(&ns.path))
  }
}

/// Character device grant plus the matching device-cgroup rule.
#[derive(Debug, Clone, PartialEq)]
pub struct LinuxDevice {
  pub path: String,
  pub dev_type: String,
  pub major: Option<i64>,
  pub minor: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerAdjustment {
  pub devices: Vec<LinuxDevice>,
  pub cgroup_device_rules: Vec<String>,
}

impl ContainerAdjustment {
  pub fn is_empty(&self) -> bool {
    self.devices.is_empty() && self.cgroup_device_rules.is_empty()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStatus {
  Done,
  Noop,
}

#[derive(Debug, Error)]
pub enum HookError {
  #[error("Device {0:?} is not in the inventory")]
  MissingDevice(String),

  #[error("Device {0:?} has no host interface")]
  MissingInterface(String),

  #[error(transparent)]
  Config(#[from] ValidationErrors),

  #[error(transparent)]
  Effector(#[from] EffectorError),
}

/// The pod-sandbox lifecycle contract consumed from the container-runtime
/// plugin host. The transport (NRI, gRPC) lives outside this crate; events
/// reach the driver through [`dispatch_events`].
#[async_trait]
pub trait PodSandboxHooks: Send + Sync {
  async fn synchronize(
    &self,
    pods: Vec<PodSandbox>,
    containers: Vec<Container>,
  ) -> Result<HookStatus, HookError>;

  async fn run_pod_sandbox(&self, pod: &PodSandbox) -> Result<HookStatus, HookError>;

  async fn stop_pod_sandbox(&self, pod: &PodSandbox) -> Result<HookStatus, HookError>;

  async fn remove_pod_sandbox(&self, pod: &PodSandbox) -> Result<HookStatus, HookError>;

  async fn create_container(
    &self,
    pod: &PodSandbox,
    container: &Container,
  ) -> Result<ContainerAdjustment, HookError>;
}

#[derive(Debug, Clone, PartialEq)]
struct Attachment {
  request: String,
  /// Name the interface carries inside the pod.
  interface: String,
}

/// Resolves pod lifecycle events against the claim and config stores and
/// drives the effector.
pub struct NetworkRuntimeHooks {
  inventory: Inventory,
  claims: Arc<ClaimStore>,
  configs: Arc<PodConfigStore>,
  effector: Arc<Effector>,
  attachments: Mutex<HashMap<String, Vec<Attachment>>>,
}

impl NetworkRuntimeHooks {
  pub fn new(
    inventory: Inventory,
    claims: Arc<ClaimStore>,
    configs: Arc<PodConfigStore>,
    effector: Arc<Effector>,
  ) -> Self {
    Self {
      inventory,
      claims,
      configs,
      effector,
      attachments: Mutex::new(HashMap::new()),
    }
  }

  fn already_attached(&self, pod_uid: &str, request: &str) -> bool {
    self
      .attachments
      .lock()
      .unwrap()
      .get(pod_uid)
      .map(|attachments| attachments.iter().any(|a| a.request == request))
      .unwrap_or(false)
  }

  fn record_attachment(&self, pod_uid: &str, attachment: Attachment) {
    self
      .attachments
      .lock()
      .unwrap()
      .entry(pod_uid.to_string())
      .or_default()
      .push(attachment);
  }

  async fn attach_result(
    &self,
    pod: &PodSandbox,
    netns: &PathBuf,
    result: &DeviceRequestAllocationResult,
  ) -> Result<(), HookError> {
    if self.already_attached(&pod.uid, &result.request) {
      return Ok(());
    }

    let device = self
      .inventory
      .get_device(&result.device)
      .ok_or_else(|| HookError::MissingDevice(result.device.clone()))?;
    let host_if = device
      .interface_name()
      .map(String::from)
      .ok_or_else(|| HookError::MissingInterface(result.device.clone()))?;

    let config = self
      .configs
      .get_entry(&pod.uid, &result.request)
      .unwrap_or_default();
    let desired = config.config.compile()?;
    let rdma_device = device.rdma_device().map(String::from);

    self
      .effector
      .attach(&host_if, rdma_device.as_deref(), netns, &desired)
      .await?;

    let interface = desired.name.unwrap_or(host_if);
    event!(
      target: "netdev-dra-manager",
      Level::INFO,
      pod = %pod.key(),
      device = %result.device,
      interface = %interface,
      "Attached device to pod"
    );
    self.record_attachment(
      &pod.uid,
      Attachment {
        request: result.request.clone(),
        interface,
      },
    );

    Ok(())
  }
}

#[async_trait]
impl PodSandboxHooks for NetworkRuntimeHooks {
  /// Re-learn the netns of every running pod after a restart.
  async fn synchronize(
    &self,
    pods: Vec<PodSandbox>,
    _containers: Vec<Container>,
  ) -> Result<HookStatus, HookError> {
    let mut seen = 0;
    for pod in &pods {
      if let Some(netns) = pod.network_namespace() {
        self.inventory.add_pod_netns(&pod.key(), netns);
        seen += 1;
      }
    }

    self.inventory.sync();
    if seen == 0 {
      return Ok(HookStatus::Noop);
    }

    Ok(HookStatus::Done)
  }

  /// Attach every device allocated to the pod. Per-device failures do not
  /// stop the remaining devices; the first error is returned and already
  /// attached devices stay attached (stop-pod-sandbox cleans up).
  async fn run_pod_sandbox(&self, pod: &PodSandbox) -> Result<HookStatus, HookError> {
    let netns = match pod.network_namespace() {
      Some(netns) => netns,
      // host-network pod
      None => return Ok(HookStatus::Noop),
    };

    self.inventory.add_pod_netns(&pod.key(), netns.clone());

    let claims = self.claims.get_by_pod_uid(&pod.uid);
    if claims.is_empty() {
      return Ok(HookStatus::Noop);
    }

    let mut first_error = None;
    for claim in &claims {
      for result in &claim.results {
        if let Err(error) = self.attach_result(pod, &netns, result).await {
          event!(
            target: "netdev-dra-manager",
            Level::ERROR,
            pod = %pod.key(),
            device = %result.device,
            %error,
            "Failed to attach device"
          );
          if first_error.is_none() {
            first_error = Some(error);
          }
        }
      }
    }

    match first_error {
      None => Ok(HookStatus::Done),
      Some(error) => Err(error),
    }
  }

  /// Detach everything previously attached and forget the pod's namespace.
  async fn stop_pod_sandbox(&self, pod: &PodSandbox) -> Result<HookStatus, HookError> {
    let netns = pod
      .network_namespace()
      .or_else(|| self.inventory.pod_netns(&pod.key()));

    let attachments = self.attachments.lock().unwrap().remove(&pod.uid);
    let result = match (netns, attachments) {
      (Some(netns), Some(attachments)) if !attachments.is_empty() => {
        let mut first_error = None;
        for attachment in &attachments {
          if let Err(error) = self.effector.detach(&netns, &attachment.interface).await {
            event!(
              target: "netdev-dra-manager",
              Level::ERROR,
              pod = %pod.key(),
              interface = %attachment.interface,
              %error,
              "Failed to detach device"
            );
            if first_error.is_none() {
              first_error = Some(error);
            }
          }
        }

        self.effector.forget_namespace(&netns).await;
        match first_error {
          None => Ok(HookStatus::Done),
          Some(error) => Err(error.into()),
        }
      }
      _ => Ok(HookStatus::Noop),
    };

    self.inventory.remove_pod_netns(&pod.key());
    self.inventory.sync();
    result
  }

  async fn remove_pod_sandbox(&self, pod: &PodSandbox) -> Result<HookStatus, HookError> {
    self.attachments.lock().unwrap().remove(&pod.uid);
    match self.configs.drain(&pod.uid) {
      Some(_) => Ok(HookStatus::Done),
      None => Ok(HookStatus::Noop),
    }
  }

  /// Grant every RDMA character device any of the pod's interfaces needs,
  /// deduplicated by path across interfaces.
  async fn create_container(
    &self,
    pod: &PodSandbox,
    _container: &Container,
  ) -> Result<ContainerAdjustment, HookError> {
    let configs = match self.configs.get(&pod.uid) {
      Some(configs) => configs,
      None => return Ok(ContainerAdjustment::default()),
    };

    let paths: BTreeSet<String> = configs
      .values()
      .flat_map(|config| config.rdma_devices.iter().cloned())
      .collect();

    let mut adjustment = ContainerAdjustment::default();
    for path in paths {
      let numbers = device_numbers(&path);
      adjustment
        .cgroup_device_rules
        .push(cgroup_device_rule(numbers));
      adjustment.devices.push(LinuxDevice {
        path,
        dev_type: "c".to_string(),
        major: numbers.map(|(major, _)| major),
        minor: numbers.map(|(_, minor)| minor),
      });
    }

    Ok(adjustment)
  }
}

/// Major/minor of a character device, when it exists on this host.
fn device_numbers(path: &str) -> Option<(i64, i64)> {
  let stat = nix::sys::stat::stat(path).ok()?;
  let rdev = stat.st_rdev;
  // glibc encoding of dev_t
  let major = ((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff);
  let minor = (rdev & 0xff) | ((rdev >> 12) & !0xff);
  Some((major as i64, minor as i64))
}

fn cgroup_device_rule(numbers: Option<(i64, i64)>) -> String {
  match numbers {
    Some((major, minor)) => format!("c {}:{} rwm", major, minor),
    None => "c *:* rwm".to_string(),
  }
}

/// Events from the external plugin host, one channel message per hook
/// invocation. `CreateContainer` answers through its reply channel.
#[derive(Debug)]
pub enum RuntimeEvent {
  Synchronize {
    pods: Vec<PodSandbox>,
    containers: Vec<Container>,
  },
  RunPodSandbox {
    pod: PodSandbox,
  },
  StopPodSandbox {
    pod: PodSandbox,
  },
  RemovePodSandbox {
    pod: PodSandbox,
  },
  CreateContainer {
    pod: PodSandbox,
    container: Container,
    reply: oneshot::Sender<Result<ContainerAdjustment, HookError>>,
  },
}

/// Wraps every hook in a metrics recorder capturing latency and outcome.
pub struct RecordedHooks<T> {
  inner: T,
  metrics: HookMetrics,
}

impl<T: PodSandboxHooks> RecordedHooks<T> {
  pub fn new(inner: T, metrics: HookMetrics) -> Self {
    Self { inner, metrics }
  }

  fn outcome_of(result: &Result<HookStatus, HookError>) -> &'static str {
    match result {
      Ok(HookStatus::Done) => OUTCOME_SUCCESS,
      Ok(HookStatus::Noop) => OUTCOME_NOOP,
      Err(_) => OUTCOME_FAILED,
    }
  }
}

#[async_trait]
impl<T: PodSandboxHooks> PodSandboxHooks for RecordedHooks<T> {
  async fn synchronize(
    &self,
    pods: Vec<PodSandbox>,
    containers: Vec<Container>,
  ) -> Result<HookStatus, HookError> {
    let start = Instant::now();
    let result = self.inner.synchronize(pods, containers).await;
    self
      .metrics
      .record("Synchronize", Self::outcome_of(&result), start.elapsed());
    result
  }

  async fn run_pod_sandbox(&self, pod: &PodSandbox) -> Result<HookStatus, HookError> {
    let start = Instant::now();
    let result = self.inner.run_pod_sandbox(pod).await;
    self
      .metrics
      .record("RunPodSandbox", Self::outcome_of(&result), start.elapsed());
    result
  }

  async fn stop_pod_sandbox(&self, pod: &PodSandbox) -> Result<HookStatus, HookError> {
    let start = Instant::now();
    let result = self.inner.stop_pod_sandbox(pod).await;
    self
      .metrics
      .record("StopPodSandbox", Self::outcome_of(&result), start.elapsed());
    result
  }

  async fn remove_pod_sandbox(&self, pod: &PodSandbox) -> Result<HookStatus, HookError> {
    let start = Instant::now();
    let result = self.inner.remove_pod_sandbox(pod).await;
    self
      .metrics
      .record("RemovePodSandbox", Self::outcome_of(&result), start.elapsed());
    result
  }

  async fn create_container(
    &self,
    pod: &PodSandbox,
    container: &Container,
  ) -> Result<ContainerAdjustment, HookError> {
    let start = Instant::now();
    let result = self.inner.create_container(pod, container).await;
    let outcome = match &result {
      Ok(adjustment) if adjustment.is_empty() => OUTCOME_NOOP,
      Ok(_) => OUTCOME_SUCCESS,
      Err(_) => OUTCOME_FAILED,
    };
    self
      .metrics
      .record("CreateContainer", outcome, start.elapsed());
    result
  }
}

/// Drains runtime events into hook calls, one at a time, until the sender
/// side closes.
pub async fn dispatch_events(
  hooks: Arc<dyn PodSandboxHooks>,
  mut events: mpsc::Receiver<RuntimeEvent>,
) {
  while let Some(event) = events.recv().await {
    match event {
      RuntimeEvent::Synchronize { pods, containers } => {
        if let Err(error) = hooks.synchronize(pods, containers).await {
          event!(target: "netdev-dra-manager", Level::ERROR, %error, "Synchronize failed");
        }
      }
      RuntimeEvent::RunPodSandbox { pod } => {
        if let Err(error) = hooks.run_pod_sandbox(&pod).await {
          event!(target: "netdev-dra-manager", Level::ERROR, pod = %pod.key(), %error, "RunPodSandbox failed");
        }
      }
      RuntimeEvent::StopPodSandbox { pod } => {
        if let Err(error) = hooks.stop_pod_sandbox(&pod).await {
          event!(target: "netdev-dra-manager", Level::ERROR, pod = %pod.key(), %error, "StopPodSandbox failed");
        }
      }
      RuntimeEvent::RemovePodSandbox { pod } => {
        if let Err(error) = hooks.remove_pod_sandbox(&pod).await {
          event!(target: "netdev-dra-manager", Level::ERROR, pod = %pod.key(), %error, "RemovePodSandbox failed");
        }
      }
      RuntimeEvent::CreateContainer {
        pod,
        container,
        reply,
      } => {
        let result = hooks.create_container(&pod, &container).await;
        let _ = reply.send(result);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::netlink::HandleCache;
  use crate::podconfig::PodConfig;
  use crate::sysfs::{PciDeviceInfo, PciProbe, SysfsError};

  struct EmptyProbe;

  impl PciProbe for EmptyProbe {
    fn scan(&self) -> Result<Vec<PciDeviceInfo>, SysfsError> {
      Ok(Vec::new())
    }

    fn is_virtual(&self, _interface: &str) -> bool {
      false
    }

    fn rdma_char_devices(&self, _rdma_device: &str) -> Vec<String> {
      Vec::new()
    }
  }

  fn hooks() -> (NetworkRuntimeHooks, Arc<PodConfigStore>, Arc<ClaimStore>) {
    let netlink = crate::netlink::NetlinkHandle::new().unwrap();
    let (inventory, _runner, _rx) = crate::inventory::new(Arc::new(EmptyProbe), netlink, None);
    let claims = Arc::new(ClaimStore::new());
    let configs = Arc::new(PodConfigStore::new());
    let effector = Arc::new(Effector::new(Arc::new(HandleCache::new().unwrap())));
    (
      NetworkRuntimeHooks::new(inventory, claims.clone(), configs.clone(), effector),
      configs,
      claims,
    )
  }

  fn pod(uid: &str, netns: Option<&str>) -> PodSandbox {
    PodSandbox {
      id: format!("sandbox-{}", uid),
      uid: uid.to_string(),
      name: "workload".to_string(),
      namespace: "team-a".to_string(),
      linux_namespaces: netns
        .map(|path| {
          vec![LinuxNamespace {
            kind: NETWORK_NAMESPACE.to_string(),
            path: path.to_string(),
          }]
        })
        .unwrap_or_default(),
    }
  }

  #[tokio::test]
  async fn host_network_pod_is_a_noop() {
    let (hooks, _configs, _claims) = hooks();
    let status = hooks.run_pod_sandbox(&pod("pod-1", None)).await.unwrap();
    assert_eq!(status, HookStatus::Noop);
  }

  #[tokio::test]
  async fn pod_without_claims_is_a_noop() {
    let (hooks, _configs, _claims) = hooks();
    let status = hooks
      .run_pod_sandbox(&pod("pod-1", Some("/run/netns/pod1")))
      .await
      .unwrap();
    assert_eq!(status, HookStatus::Noop);
  }

  #[tokio::test]
  async fn stop_without_attachments_is_a_noop() {
    let (hooks, _configs, _claims) = hooks();
    let status = hooks
      .stop_pod_sandbox(&pod("pod-1", Some("/run/netns/pod1")))
      .await
      .unwrap();
    assert_eq!(status, HookStatus::Noop);
  }

  #[tokio::test]
  async fn create_container_deduplicates_char_devices() {
    let (hooks, configs, _claims) = hooks();

    configs.set(
      "pod-1",
      "nic0",
      PodConfig {
        rdma_devices: vec!["/dev/infiniband/uverbs0".to_string()],
        ..Default::default()
      },
    );
    configs.set(
      "pod-1",
      "nic1",
      PodConfig {
        rdma_devices: vec![
          "/dev/infiniband/uverbs0".to_string(),
          "/dev/infiniband/uverbs1".to_string(),
        ],
        ..Default::default()
      },
    );

    let pod = pod("pod-1", Some("/run/netns/pod1"));
    let container = Container::default();
    let adjustment = hooks.create_container(&pod, &container).await.unwrap();

    assert_eq!(adjustment.devices.len(), 2);
    let paths: Vec<&str> = adjustment
      .devices
      .iter()
      .map(|device| device.path.as_str())
      .collect();
    assert_eq!(
      paths,
      vec!["/dev/infiniband/uverbs0", "/dev/infiniband/uverbs1"]
    );
    assert_eq!(adjustment.cgroup_device_rules.len(), 2);
  }

  #[tokio::test]
  async fn create_container_without_configs_is_empty() {
    let (hooks, _configs, _claims) = hooks();
    let pod = pod("pod-1", Some("/run/netns/pod1"));
    let adjustment = hooks
      .create_container(&pod, &Container::default())
      .await
      .unwrap();
    assert!(adjustment.is_empty());
  }

  #[tokio::test]
  async fn remove_pod_sandbox_drains_configs() {
    let (hooks, configs, _claims) = hooks();
    configs.set("pod-1", "nic0", PodConfig::default());

    let status = hooks
      .remove_pod_sandbox(&pod("pod-1", None))
      .await
      .unwrap();
    assert_eq!(status, HookStatus::Done);
    assert!(configs.get("pod-1").is_none());

    let status = hooks
      .remove_pod_sandbox(&pod("pod-1", None))
      .await
      .unwrap();
    assert_eq!(status, HookStatus::Noop);
  }

  #[test]
  fn network_namespace_resolution() {
    assert_eq!(pod("u", None).network_namespace(), None);
    assert_eq!(
      pod("u", Some("/run/netns/x")).network_namespace(),
      Some(PathBuf::from("/run/netns/x"))
    );
  }

  #[test]
  fn cgroup_rules_fall_back_to_wildcard() {
    assert_eq!(cgroup_device_rule(Some((231, 64))), "c 231:64 rwm");
    assert_eq!(cgroup_device_rule(None), "c *:* rwm");
  }
}
