use crate::{
  api::KubeClaimReader,
  claims::ClaimStore,
  cloud,
  config::Config,
  dra::NetworkDraPlugin,
  effector::Effector,
  inventory,
  metrics::HookMetrics,
  netlink::{HandleCache, NetlinkHandle},
  podconfig::PodConfigStore,
  publisher::{KubeSliceStore, Publisher},
  runtime::{self, NetworkRuntimeHooks, PodSandboxHooks, RecordedHooks},
  selector::DeviceSelector,
  sysfs::{PciProbe, SysfsPciProbe},
};
use anyhow::{Context, Result};
use futures::{pin_mut, select, FutureExt, StreamExt};
use kubelet_draplugin_proto::v1beta1::KubeletDraPluginV1Beta1;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook_tokio::Signals;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{event, Level};

pub async fn run(config: Config) -> Result<()> {
  let node_name = node_name(&config)?;
  event!(target: "netdev-dra-manager", Level::INFO, driver = %config.driver_name, node = %node_name, "Starting netdev DRA manager");

  let selector = config
    .selector
    .as_deref()
    .map(DeviceSelector::compile)
    .transpose()
    .context("invalid device selector expression")?;

  let client = kube::Client::try_default()
    .await
    .context("failed to create Kubernetes client")?;

  let cloud_instance = match &config.cloud_provider {
    None => None,
    Some(name) => fetch_cloud_metadata(name).await,
  };

  let probe: Arc<dyn PciProbe> = Arc::new(SysfsPciProbe::default());
  let inventory_netlink =
    NetlinkHandle::new().context("failed to open the root netlink handle")?;
  let (inventory, inventory_runner, notifications) =
    inventory::new(probe.clone(), inventory_netlink, cloud_instance);

  let claim_store = Arc::new(ClaimStore::new());
  let config_store = Arc::new(PodConfigStore::new());
  let effector = Arc::new(Effector::new(Arc::new(
    HandleCache::new().context("failed to open the effector netlink handle")?,
  )));

  let registry = prometheus::Registry::new();
  let hook_metrics = HookMetrics::new(&registry).context("failed to register hook metrics")?;
  let hooks: Arc<dyn PodSandboxHooks> = Arc::new(RecordedHooks::new(
    NetworkRuntimeHooks::new(
      inventory.clone(),
      claim_store.clone(),
      config_store.clone(),
      effector,
    ),
    hook_metrics,
  ));

  // The container-runtime transport is hosted outside this crate; it feeds
  // pod lifecycle events through this channel.
  let (runtime_events, event_rx) = mpsc::channel(16);
  let dispatcher = tokio::spawn(runtime::dispatch_events(hooks, event_rx));

  let reader = Arc::new(KubeClaimReader::new(client.clone()));
  let plugin = NetworkDraPlugin::new(
    &config.driver_name,
    claim_store,
    config_store,
    inventory.clone(),
    reader,
    probe,
  );

  // Failing to set up the kubelet sockets is fatal.
  let (plugin_server, registration_server) = KubeletDraPluginV1Beta1::new(plugin)
    .start(
      &config.driver_name,
      &config.kubelet_plugins_dir,
      &config.kubelet_registry_dir,
    )
    .await
    .context("failed to serve the kubelet plugin sockets")?;

  let slice_store = Arc::new(KubeSliceStore::new(client, &config.driver_name));
  let publisher = Publisher::new(&config.driver_name, &node_name, selector, slice_store);

  let inventory_task = tokio::spawn(inventory_runner.run()).fuse();
  let publisher_task =
    tokio::spawn(async move { publisher.publish_resources(notifications).await });
  pin_mut!(inventory_task);

  // SIGHUP nudges the inventory; everything else ends the process.
  let signal_stream = Signals::new([SIGHUP, SIGINT, SIGQUIT, SIGTERM])
    .context("failed to register signal handlers")?
    .fuse();
  pin_mut!(signal_stream);

  let exit = loop {
    select! {
      signal = signal_stream.next() => match signal {
        None => {
          event!(target: "netdev-dra-manager", Level::ERROR, "Signal stream stopped, shutting down");
          break Ok(());
        }
        Some(SIGHUP) => {
          event!(target: "netdev-dra-manager", Level::INFO, "Received SIGHUP, requesting inventory refresh");
          inventory.sync();
        }
        Some(signal) => {
          event!(target: "netdev-dra-manager", Level::INFO, "Received signal {}, shutting down", signal_name(signal));
          break Ok(());
        }
      },

      result = inventory_task => {
        break match result {
          Ok(Ok(())) => Ok(()),
          Ok(Err(error)) => Err(error).context("inventory loop failed"),
          Err(error) => Err(error).context("inventory loop panicked"),
        };
      }
    }
  };

  // Teardown: stop accepting kubelet calls, then let in-flight runtime work
  // drain before returning.
  publisher_task.abort();
  if let Err(error) = registration_server.abort().await {
    event!(target: "netdev-dra-manager", Level::WARN, %error, "Registration server shut down with an error");
  }
  if let Err(error) = plugin_server.abort().await {
    event!(target: "netdev-dra-manager", Level::WARN, %error, "Plugin server shut down with an error");
  }

  drop(runtime_events);
  let _ = dispatcher.await;

  exit
}

fn signal_name(signal: i32) -> &'static str {
  match signal {
    SIGTERM => "SIGTERM",
    SIGINT => "SIGINT",
    SIGQUIT => "SIGQUIT",
    SIGHUP => "SIGHUP",
    _ => "unknown signal",
  }
}

fn node_name(config: &Config) -> Result<String> {
  if let Some(name) = &config.node_name {
    return Ok(name.clone());
  }

  if let Ok(name) = std::env::var("NODE_NAME") {
    if !name.is_empty() {
      return Ok(name);
    }
  }

  let hostname = nix::unistd::gethostname().context("failed to read the hostname")?;
  hostname
    .into_string()
    .map_err(|_| anyhow::anyhow!("hostname is not valid UTF-8"))
}

async fn fetch_cloud_metadata(provider_name: &str) -> Option<cloud::CloudInstance> {
  let provider = match cloud::provider_for(provider_name) {
    Ok(provider) => provider,
    Err(error) => {
      event!(target: "netdev-dra-manager", Level::WARN, %error, "Ignoring cloud provider configuration");
      return None;
    }
  };

  match cloud::fetch_with_retries(provider.as_ref()).await {
    Ok(instance) => {
      event!(
        target: "netdev-dra-manager",
        Level::INFO,
        provider = provider.name(),
        instance_type = %instance.instance_type,
        nics = instance.nics.len(),
        "Fetched instance metadata"
      );
      Some(instance)
    }
    Err(error) => {
      event!(target: "netdev-dra-manager", Level::WARN, %error, "Continuing without cloud attributes");
      None
    }
  }
}
