/// A grpc stream-identifier for a resource claim, as handed to the plugin by
/// the kubelet. The claim body is read from the API server by the plugin.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Claim {
  /// The UID of the Resource claim (ResourceClaim.meta.UUID).
  #[prost(string, tag = "1")]
  pub uid: ::prost::alloc::string::String,
  /// The namespace of the Resource claim.
  #[prost(string, tag = "2")]
  pub namespace: ::prost::alloc::string::String,
  /// The name of the Resource claim (ResourceClaim.meta.Name).
  #[prost(string, tag = "3")]
  pub name: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodePrepareResourcesRequest {
  /// The list of ResourceClaims that are to be prepared.
  #[prost(message, repeated, tag = "1")]
  pub claims: ::prost::alloc::vec::Vec<Claim>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodePrepareResourcesResponse {
  /// The ResourceClaims for which preparation was done
  /// or attempted, with claim_uid as key.
  #[prost(map = "string, message", tag = "1")]
  pub claims:
    ::std::collections::HashMap<::prost::alloc::string::String, NodePrepareResourceResponse>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodePrepareResourceResponse {
  /// These are the additional devices that kubelet must
  /// make available via the container runtime. A claim
  /// may have multiple requests and each request may have
  /// multiple devices.
  #[prost(message, repeated, tag = "1")]
  pub devices: ::prost::alloc::vec::Vec<Device>,
  /// If non-empty, preparing the ResourceClaim failed.
  /// Devices are ignored in that case.
  #[prost(string, tag = "2")]
  pub error: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Device {
  /// The name of the request in the claim that this device is associated with.
  #[prost(string, tag = "1")]
  pub request_name: ::prost::alloc::string::String,
  /// The pool which contains the device.
  #[prost(string, tag = "2")]
  pub pool_name: ::prost::alloc::string::String,
  /// The device name within its pool.
  #[prost(string, tag = "3")]
  pub device_name: ::prost::alloc::string::String,
  /// The CDI device IDs to pass on to the runtime, may be empty.
  #[prost(string, repeated, tag = "4")]
  pub cdi_device_ids: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeUnprepareResourcesRequest {
  /// The list of ResourceClaims that are to be unprepared.
  #[prost(message, repeated, tag = "1")]
  pub claims: ::prost::alloc::vec::Vec<Claim>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeUnprepareResourcesResponse {
  /// The ResourceClaims for which preparation was reverted.
  /// The same rules as for NodePrepareResourcesResponse.claims
  /// apply.
  #[prost(map = "string, message", tag = "1")]
  pub claims:
    ::std::collections::HashMap<::prost::alloc::string::String, NodeUnprepareResourceResponse>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeUnprepareResourceResponse {
  /// If non-empty, unpreparing the ResourceClaim failed.
  #[prost(string, tag = "1")]
  pub error: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InfoRequest {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PluginInfo {
  /// Type of the Plugin. DRAPlugin for dynamic resource allocation plugins.
  #[prost(string, tag = "1")]
  pub r#type: ::prost::alloc::string::String,
  /// Plugin name that uniquely identifies the plugin for the given plugin type.
  #[prost(string, tag = "2")]
  pub name: ::prost::alloc::string::String,
  /// Optional endpoint location. If found set by Kubelet component,
  /// Kubelet component will use this endpoint for specific requests.
  #[prost(string, tag = "3")]
  pub endpoint: ::prost::alloc::string::String,
  /// Plugin service API versions the plugin supports.
  #[prost(string, repeated, tag = "4")]
  pub supported_versions: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}
/// RegistrationStatus is the message sent from Kubelet pluginwatcher to the plugin
/// for notification on registration status.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegistrationStatus {
  /// True if plugin gets registered successfully at Kubelet.
  #[prost(bool, tag = "1")]
  pub plugin_registered: bool,
  /// Error message in case plugin fails to register, empty string otherwise.
  #[prost(string, tag = "2")]
  pub error: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegistrationStatusResponse {}
/// Generated server implementations.
pub mod dra_plugin_server {
  #![allow(unused_variables, dead_code, missing_docs, clippy::let_unit_value)]
  use tonic::codegen::*;
  /// Generated trait containing gRPC methods that should be implemented for use with DraPluginServer.
  #[async_trait]
  pub trait DraPlugin: Send + Sync + 'static {
    /// NodePrepareResources prepares several ResourceClaims
    /// for use on the node. If an error is returned, the
    /// response is ignored. Failures for individual claims
    /// can be reported inside the response.
    async fn node_prepare_resources(
      &self,
      request: tonic::Request<super::NodePrepareResourcesRequest>,
    ) -> std::result::Result<tonic::Response<super::NodePrepareResourcesResponse>, tonic::Status>;
    /// NodeUnprepareResources is the inverse of NodePrepareResources.
    /// The same error handling rules apply.
    async fn node_unprepare_resources(
      &self,
      request: tonic::Request<super::NodeUnprepareResourcesRequest>,
    ) -> std::result::Result<tonic::Response<super::NodeUnprepareResourcesResponse>, tonic::Status>;
  }
  /// DRAPlugin is the service advertised by DRA drivers to the kubelet.
  #[derive(Debug)]
  pub struct DraPluginServer<T: DraPlugin> {
    inner: _Inner<T>,
    accept_compression_encodings: EnabledCompressionEncodings,
    send_compression_encodings: EnabledCompressionEncodings,
    max_decoding_message_size: Option<usize>,
    max_encoding_message_size: Option<usize>,
  }
  struct _Inner<T>(Arc<T>);
  impl<T: DraPlugin> DraPluginServer<T> {
    pub fn new(inner: T) -> Self {
      Self::from_arc(Arc::new(inner))
    }
    pub fn from_arc(inner: Arc<T>) -> Self {
      let inner = _Inner(inner);
      Self {
        inner,
        accept_compression_encodings: Default::default(),
        send_compression_encodings: Default::default(),
        max_decoding_message_size: None,
        max_encoding_message_size: None,
      }
    }
    pub fn with_interceptor<F>(inner: T, interceptor: F) -> InterceptedService<Self, F>
    where
      F: tonic::service::Interceptor,
    {
      InterceptedService::new(Self::new(inner), interceptor)
    }
    /// Enable decompressing requests with the given encoding.
    #[must_use]
    pub fn accept_compressed(mut self, encoding: CompressionEncoding) -> Self {
      self.accept_compression_encodings.enable(encoding);
      self
    }
    /// Compress responses with the given encoding, if the client supports it.
    #[must_use]
    pub fn send_compressed(mut self, encoding: CompressionEncoding) -> Self {
      self.send_compression_encodings.enable(encoding);
      self
    }
    /// Limits the maximum size of a decoded message.
    ///
    /// Default: `4MB`
    #[must_use]
    pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
      self.max_decoding_message_size = Some(limit);
      self
    }
    /// Limits the maximum size of an encoded message.
    ///
    /// Default: `usize::MAX`
    #[must_use]
    pub fn max_encoding_message_size(mut self, limit: usize) -> Self {
      self.max_encoding_message_size = Some(limit);
      self
    }
  }
  impl<T, B> tonic::codegen::Service<http::Request<B>> for DraPluginServer<T>
  where
    T: DraPlugin,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
  {
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
      Poll::Ready(Ok(()))
    }
    fn call(&mut self, req: http::Request<B>) -> Self::Future {
      let inner = self.inner.clone();
      match req.uri().path() {
        "/v1beta1.DRAPlugin/NodePrepareResources" => {
          #[allow(non_camel_case_types)]
          struct NodePrepareResourcesSvc<T: DraPlugin>(pub Arc<T>);
          impl<T: DraPlugin> tonic::server::UnaryService<super::NodePrepareResourcesRequest>
            for NodePrepareResourcesSvc<T>
          {
            type Response = super::NodePrepareResourcesResponse;
            type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
            fn call(
              &mut self,
              request: tonic::Request<super::NodePrepareResourcesRequest>,
            ) -> Self::Future {
              let inner = Arc::clone(&self.0);
              let fut =
                async move { <T as DraPlugin>::node_prepare_resources(&inner, request).await };
              Box::pin(fut)
            }
          }
          let accept_compression_encodings = self.accept_compression_encodings;
          let send_compression_encodings = self.send_compression_encodings;
          let max_decoding_message_size = self.max_decoding_message_size;
          let max_encoding_message_size = self.max_encoding_message_size;
          let inner = self.inner.clone();
          let fut = async move {
            let inner = inner.0;
            let method = NodePrepareResourcesSvc(inner);
            let codec = tonic::codec::ProstCodec::default();
            let mut grpc = tonic::server::Grpc::new(codec)
              .apply_compression_config(accept_compression_encodings, send_compression_encodings)
              .apply_max_message_size_config(max_decoding_message_size, max_encoding_message_size);
            let res = grpc.unary(method, req).await;
            Ok(res)
          };
          Box::pin(fut)
        }
        "/v1beta1.DRAPlugin/NodeUnprepareResources" => {
          #[allow(non_camel_case_types)]
          struct NodeUnprepareResourcesSvc<T: DraPlugin>(pub Arc<T>);
          impl<T: DraPlugin> tonic::server::UnaryService<super::NodeUnprepareResourcesRequest>
            for NodeUnprepareResourcesSvc<T>
          {
            type Response = super::NodeUnprepareResourcesResponse;
            type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
            fn call(
              &mut self,
              request: tonic::Request<super::NodeUnprepareResourcesRequest>,
            ) -> Self::Future {
              let inner = Arc::clone(&self.0);
              let fut =
                async move { <T as DraPlugin>::node_unprepare_resources(&inner, request).await };
              Box::pin(fut)
            }
          }
          let accept_compression_encodings = self.accept_compression_encodings;
          let send_compression_encodings = self.send_compression_encodings;
          let max_decoding_message_size = self.max_decoding_message_size;
          let max_encoding_message_size = self.max_encoding_message_size;
          let inner = self.inner.clone();
          let fut = async move {
            let inner = inner.0;
            let method = NodeUnprepareResourcesSvc(inner);
            let codec = tonic::codec::ProstCodec::default();
            let mut grpc = tonic::server::Grpc::new(codec)
              .apply_compression_config(accept_compression_encodings, send_compression_encodings)
              .apply_max_message_size_config(max_decoding_message_size, max_encoding_message_size);
            let res = grpc.unary(method, req).await;
            Ok(res)
          };
          Box::pin(fut)
        }
        _ => Box::pin(async move {
          Ok(
            http::Response::builder()
              .status(200)
              .header("grpc-status", "12")
              .header("content-type", "application/grpc")
              .body(empty_body())
              .unwrap(),
          )
        }),
      }
    }
  }
  impl<T: DraPlugin> Clone for DraPluginServer<T> {
    fn clone(&self) -> Self {
      let inner = self.inner.clone();
      Self {
        inner,
        accept_compression_encodings: self.accept_compression_encodings,
        send_compression_encodings: self.send_compression_encodings,
        max_decoding_message_size: self.max_decoding_message_size,
        max_encoding_message_size: self.max_encoding_message_size,
      }
    }
  }
  impl<T: DraPlugin> Clone for _Inner<T> {
    fn clone(&self) -> Self {
      Self(Arc::clone(&self.0))
    }
  }
  impl<T: std::fmt::Debug> std::fmt::Debug for _Inner<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      write!(f, "{:?}", self.0)
    }
  }
  impl<T: DraPlugin> tonic::server::NamedService for DraPluginServer<T> {
    const NAME: &'static str = "v1beta1.DRAPlugin";
  }
}
/// Generated server implementations.
pub mod registration_server {
  #![allow(unused_variables, dead_code, missing_docs, clippy::let_unit_value)]
  use tonic::codegen::*;
  /// Generated trait containing gRPC methods that should be implemented for use with RegistrationServer.
  #[async_trait]
  pub trait Registration: Send + Sync + 'static {
    async fn get_info(
      &self,
      request: tonic::Request<super::InfoRequest>,
    ) -> std::result::Result<tonic::Response<super::PluginInfo>, tonic::Status>;
    async fn notify_registration_status(
      &self,
      request: tonic::Request<super::RegistrationStatus>,
    ) -> std::result::Result<tonic::Response<super::RegistrationStatusResponse>, tonic::Status>;
  }
  /// Registration is the service advertised by a plugin and consumed by the
  /// kubelet pluginwatcher; only after GetInfo succeeds does the kubelet start
  /// talking to the plugin service itself.
  #[derive(Debug)]
  pub struct RegistrationServer<T: Registration> {
    inner: _Inner<T>,
    accept_compression_encodings: EnabledCompressionEncodings,
    send_compression_encodings: EnabledCompressionEncodings,
    max_decoding_message_size: Option<usize>,
    max_encoding_message_size: Option<usize>,
  }
  struct _Inner<T>(Arc<T>);
  impl<T: Registration> RegistrationServer<T> {
    pub fn new(inner: T) -> Self {
      Self::from_arc(Arc::new(inner))
    }
    pub fn from_arc(inner: Arc<T>) -> Self {
      let inner = _Inner(inner);
      Self {
        inner,
        accept_compression_encodings: Default::default(),
        send_compression_encodings: Default::default(),
        max_decoding_message_size: None,
        max_encoding_message_size: None,
      }
    }
    pub fn with_interceptor<F>(inner: T, interceptor: F) -> InterceptedService<Self, F>
    where
      F: tonic::service::Interceptor,
    {
      InterceptedService::new(Self::new(inner), interceptor)
    }
    /// Enable decompressing requests with the given encoding.
    #[must_use]
    pub fn accept_compressed(mut self, encoding: CompressionEncoding) -> Self {
      self.accept_compression_encodings.enable(encoding);
      self
    }
    /// Compress responses with the given encoding, if the client supports it.
    #[must_use]
    pub fn send_compressed(mut self, encoding: CompressionEncoding) -> Self {
      self.send_compression_encodings.enable(encoding);
      self
    }
    /// Limits the maximum size of a decoded message.
    ///
    /// Default: `4MB`
    #[must_use]
    pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
      self.max_decoding_message_size = Some(limit);
      self
    }
    /// Limits the maximum size of an encoded message.
    ///
    /// Default: `usize::MAX`
    #[must_use]
    pub fn max_encoding_message_size(mut self, limit: usize) -> Self {
      self.max_encoding_message_size = Some(limit);
      self
    }
  }
  impl<T, B> tonic::codegen::Service<http::Request<B>> for RegistrationServer<T>
  where
    T: Registration,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
  {
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
      Poll::Ready(Ok(()))
    }
    fn call(&mut self, req: http::Request<B>) -> Self::Future {
      let inner = self.inner.clone();
      match req.uri().path() {
        "/v1beta1.Registration/GetInfo" => {
          #[allow(non_camel_case_types)]
          struct GetInfoSvc<T: Registration>(pub Arc<T>);
          impl<T: Registration> tonic::server::UnaryService<super::InfoRequest> for GetInfoSvc<T> {
            type Response = super::PluginInfo;
            type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
            fn call(&mut self, request: tonic::Request<super::InfoRequest>) -> Self::Future {
              let inner = Arc::clone(&self.0);
              let fut = async move { <T as Registration>::get_info(&inner, request).await };
              Box::pin(fut)
            }
          }
          let accept_compression_encodings = self.accept_compression_encodings;
          let send_compression_encodings = self.send_compression_encodings;
          let max_decoding_message_size = self.max_decoding_message_size;
          let max_encoding_message_size = self.max_encoding_message_size;
          let inner = self.inner.clone();
          let fut = async move {
            let inner = inner.0;
            let method = GetInfoSvc(inner);
            let codec = tonic::codec::ProstCodec::default();
            let mut grpc = tonic::server::Grpc::new(codec)
              .apply_compression_config(accept_compression_encodings, send_compression_encodings)
              .apply_max_message_size_config(max_decoding_message_size, max_encoding_message_size);
            let res = grpc.unary(method, req).await;
            Ok(res)
          };
          Box::pin(fut)
        }
        "/v1beta1.Registration/NotifyRegistrationStatus" => {
          #[allow(non_camel_case_types)]
          struct NotifyRegistrationStatusSvc<T: Registration>(pub Arc<T>);
          impl<T: Registration> tonic::server::UnaryService<super::RegistrationStatus>
            for NotifyRegistrationStatusSvc<T>
          {
            type Response = super::RegistrationStatusResponse;
            type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
            fn call(&mut self, request: tonic::Request<super::RegistrationStatus>) -> Self::Future {
              let inner = Arc::clone(&self.0);
              let fut = async move {
                <T as Registration>::notify_registration_status(&inner, request).await
              };
              Box::pin(fut)
            }
          }
          let accept_compression_encodings = self.accept_compression_encodings;
          let send_compression_encodings = self.send_compression_encodings;
          let max_decoding_message_size = self.max_decoding_message_size;
          let max_encoding_message_size = self.max_encoding_message_size;
          let inner = self.inner.clone();
          let fut = async move {
            let inner = inner.0;
            let method = NotifyRegistrationStatusSvc(inner);
            let codec = tonic::codec::ProstCodec::default();
            let mut grpc = tonic::server::Grpc::new(codec)
              .apply_compression_config(accept_compression_encodings, send_compression_encodings)
              .apply_max_message_size_config(max_decoding_message_size, max_encoding_message_size);
            let res = grpc.unary(method, req).await;
            Ok(res)
          };
          Box::pin(fut)
        }
        _ => Box::pin(async move {
          Ok(
            http::Response::builder()
              .status(200)
              .header("grpc-status", "12")
              .header("content-type", "application/grpc")
              .body(empty_body())
              .unwrap(),
          )
        }),
      }
    }
  }
  impl<T: Registration> Clone for RegistrationServer<T> {
    fn clone(&self) -> Self {
      let inner = self.inner.clone();
      Self {
        inner,
        accept_compression_encodings: self.accept_compression_encodings,
        send_compression_encodings: self.send_compression_encodings,
        max_decoding_message_size: self.max_decoding_message_size,
        max_encoding_message_size: self.max_encoding_message_size,
      }
    }
  }
  impl<T: Registration> Clone for _Inner<T> {
    fn clone(&self) -> Self {
      Self(Arc::clone(&self.0))
    }
  }
  impl<T: std::fmt::Debug> std::fmt::Debug for _Inner<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      write!(f, "{:?}", self.0)
    }
  }
  impl<T: Registration> tonic::server::NamedService for RegistrationServer<T> {
    const NAME: &'static str = "v1beta1.Registration";
  }
}
