mod proto;
mod types;

use async_trait::async_trait;
use hyper::Server;
use std::{
  fs,
  os::unix::fs::DirBuilderExt,
  path::{Path, PathBuf},
  sync::Arc,
};
use thiserror::Error;
use tokio::io;
use tracing::{event, span, Instrument, Level, Span};

pub use types::*;

use crate::{
  server::KubeletPluginServer,
  transport::{Svc, UnixSocketListener},
};

/// Plugin type reported to the kubelet pluginwatcher.
pub const DRA_PLUGIN_TYPE: &str = "DRAPlugin";

/// Means current version of the API supported by kubelet.
pub const VERSION: &str = "v1beta1";

/// The directory the kubelet expects plugin sockets to live in. Only
/// privileged pods have access to this path.
pub const KUBELET_PLUGINS_PATH: &str = "/var/lib/kubelet/plugins/";

/// The directory watched by the kubelet pluginwatcher for registration
/// sockets.
pub const KUBELET_PLUGINS_REGISTRY_PATH: &str = "/var/lib/kubelet/plugins_registry/";

/// Name of the plugin service socket inside the per-driver directory.
pub const PLUGIN_SOCKET_NAME: &str = "dra.sock";

#[async_trait]
pub trait DraPlugin: Send + Sync + 'static {
  /// NodePrepareResources prepares several ResourceClaims for use on the
  /// node. Failures for individual claims are reported inside the result;
  /// only transport-level problems fail the whole call.
  async fn prepare_resource_claims(
    &self,
    claims: Vec<ClaimRef>,
  ) -> Result<PrepareResults, tonic::Status>;

  /// NodeUnprepareResources is the inverse of NodePrepareResources. The same
  /// per-claim error rules apply.
  async fn unprepare_resource_claims(
    &self,
    claims: Vec<ClaimRef>,
  ) -> Result<UnprepareResults, tonic::Status>;
}

pub struct KubeletDraPluginV1Beta1<T: DraPlugin>(Arc<T>);

impl<T: DraPlugin> KubeletDraPluginV1Beta1<T> {
  pub fn new(plugin: T) -> Self {
    Self(Arc::new(plugin))
  }
}

impl<T: DraPlugin> Clone for KubeletDraPluginV1Beta1<T> {
  fn clone(&self) -> Self {
    Self(self.0.clone())
  }
}

#[async_trait]
impl<T: DraPlugin> proto::dra_plugin_server::DraPlugin for KubeletDraPluginV1Beta1<T> {
  async fn node_prepare_resources(
    &self,
    request: tonic::Request<proto::NodePrepareResourcesRequest>,
  ) -> Result<tonic::Response<proto::NodePrepareResourcesResponse>, tonic::Status> {
    let claims = request
      .into_inner()
      .claims
      .into_iter()
      .map(ClaimRef::from)
      .collect();

    let results = self.0.prepare_resource_claims(claims).await?;
    Ok(tonic::Response::new(results.into()))
  }

  async fn node_unprepare_resources(
    &self,
    request: tonic::Request<proto::NodeUnprepareResourcesRequest>,
  ) -> Result<tonic::Response<proto::NodeUnprepareResourcesResponse>, tonic::Status> {
    let claims = request
      .into_inner()
      .claims
      .into_iter()
      .map(ClaimRef::from)
      .collect();

    let results = self.0.unprepare_resource_claims(claims).await?;
    Ok(tonic::Response::new(results.into()))
  }
}

/// Answers the kubelet pluginwatcher on the registration socket, pointing it
/// at the plugin service socket.
struct PluginRegistrar {
  plugin_name: String,
  endpoint: String,
}

#[async_trait]
impl proto::registration_server::Registration for PluginRegistrar {
  async fn get_info(
    &self,
    _: tonic::Request<proto::InfoRequest>,
  ) -> Result<tonic::Response<proto::PluginInfo>, tonic::Status> {
    Ok(tonic::Response::new(proto::PluginInfo {
      r#type: DRA_PLUGIN_TYPE.into(),
      name: self.plugin_name.clone(),
      endpoint: self.endpoint.clone(),
      supported_versions: vec![VERSION.into()],
    }))
  }

  async fn notify_registration_status(
    &self,
    request: tonic::Request<proto::RegistrationStatus>,
  ) -> Result<tonic::Response<proto::RegistrationStatusResponse>, tonic::Status> {
    let status = request.into_inner();
    if status.plugin_registered {
      event!(target: "kubelet-draplugin", Level::INFO, plugin = %self.plugin_name, "Registered with kubelet");
    } else {
      event!(target: "kubelet-draplugin", Level::ERROR, plugin = %self.plugin_name, error = %status.error, "Kubelet rejected plugin registration");
    }

    Ok(tonic::Response::new(proto::RegistrationStatusResponse {}))
  }
}

impl<T: DraPlugin> KubeletDraPluginV1Beta1<T> {
  /// Serve the DRA plugin socket under `<plugins_dir>/<driver_name>/` (the
  /// directory is created mode 0750) and a pluginwatcher registration socket
  /// under `registry_dir`. Both servers run until aborted.
  pub async fn start(
    self,
    driver_name: impl Into<String>,
    plugins_dir: impl AsRef<Path>,
    registry_dir: impl AsRef<Path>,
  ) -> Result<(KubeletPluginServer, KubeletPluginServer), ConnectionError> {
    let driver_name: String = driver_name.into();
    let span = span!(Level::INFO, "draplugin-v1beta1", driver = &*driver_name);

    self
      ._start(driver_name, plugins_dir.as_ref(), registry_dir.as_ref())
      .instrument(span)
      .await
  }

  async fn _start(
    self,
    driver_name: String,
    plugins_dir: &Path,
    registry_dir: &Path,
  ) -> Result<(KubeletPluginServer, KubeletPluginServer), ConnectionError> {
    let socket_dir = plugins_dir.join(&driver_name);
    fs::DirBuilder::new()
      .recursive(true)
      .mode(0o750)
      .create(&socket_dir)?;

    let plugin_socket = socket_dir.join(PLUGIN_SOCKET_NAME);
    remove_stale_socket(&plugin_socket)?;

    let plugin_service = proto::dra_plugin_server::DraPluginServer::new(self);
    let plugin_server = serve(plugin_socket.clone(), plugin_service)?;

    let registration_socket = registry_dir.join(format!("{}-reg.sock", driver_name));
    remove_stale_socket(&registration_socket)?;

    let registrar = PluginRegistrar {
      plugin_name: driver_name,
      endpoint: plugin_socket.to_string_lossy().into_owned(),
    };
    let registration_service = proto::registration_server::RegistrationServer::new(registrar);
    let registration_server = serve(registration_socket, registration_service)?;

    Ok((plugin_server, registration_server))
  }
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
  match fs::remove_file(path) {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e),
  }
}

fn serve<S>(socket_path: PathBuf, service: S) -> Result<KubeletPluginServer, ConnectionError>
where
  S: tower::Service<
      hyper::Request<hyper::Body>,
      Response = hyper::Response<tonic::body::BoxBody>,
      Error = std::convert::Infallible,
    > + Clone
    + Send
    + 'static,
  S::Future: Send + 'static,
{
  let socket_listener = UnixSocketListener::bind(&socket_path)?;

  event!(target: "kubelet-draplugin", Level::DEBUG, socket = %socket_path.display(), "Serving plugin socket");
  let server = Server::builder(socket_listener)
    .http2_only(true)
    .serve(Svc::new(service, Some(Span::current())));

  Ok(KubeletPluginServer::start(socket_path, move |signal| {
    tokio::spawn(server.with_graceful_shutdown(signal))
  }))
}

#[derive(Debug, Error)]
pub enum ConnectionError {
  #[error(transparent)]
  Transport(#[from] tonic::transport::Error),

  #[error(transparent)]
  Io(#[from] io::Error),

  #[error(transparent)]
  Join(#[from] tokio::task::JoinError),
}
