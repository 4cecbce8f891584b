use futures::{
  future::{Fuse, FusedFuture},
  FutureExt,
};
use pin_project::pin_project;
use std::{
  fmt,
  future::Future,
  panic,
  path::PathBuf,
  pin::Pin,
  task::{Context, Poll},
};
use tokio::{
  sync::oneshot::{self, Sender},
  task::JoinHandle,
};

#[pin_project]
pub struct Signal(#[pin] oneshot::Receiver<()>);

impl Future for Signal {
  type Output = ();

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    match self.project().0.poll(cx) {
      Poll::Pending => Poll::Pending,
      Poll::Ready(_) => Poll::Ready(()),
    }
  }
}

/// A unix-socket gRPC server spawned onto the runtime. Dropping the handle
/// does not stop the server; call [`KubeletPluginServer::abort`] to shut it
/// down and remove the socket file.
pub struct KubeletPluginServer {
  abort_channel: Sender<()>,
  handle: Fuse<JoinHandle<hyper::Result<()>>>,
  socket_path: PathBuf,
}

impl fmt::Debug for KubeletPluginServer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct(stringify!(KubeletPluginServer))
      .field("socket_path", &self.socket_path)
      .finish_non_exhaustive()
  }
}

impl KubeletPluginServer {
  pub(crate) fn start(
    socket_path: PathBuf,
    f: impl FnOnce(Signal) -> JoinHandle<hyper::Result<()>>,
  ) -> Self {
    let (abort_channel, receiver) = oneshot::channel::<()>();
    let handle = f(Signal(receiver)).fuse();

    Self {
      abort_channel,
      handle,
      socket_path,
    }
  }

  pub fn socket_path(&self) -> &PathBuf {
    &self.socket_path
  }

  pub async fn abort(self) -> hyper::Result<()> {
    if self.is_terminated() {
      return Ok(());
    }

    let _ = self.abort_channel.send(());

    let result = match self.handle.await {
      Ok(result) => result,
      Err(e) if e.is_cancelled() => unreachable!(),
      Err(e) => panic::resume_unwind(e.into_panic()),
    };

    let _ = tokio::fs::remove_file(&self.socket_path).await;
    result
  }

  pub fn is_terminated(&self) -> bool {
    self.handle.is_terminated()
  }
}

impl Future for KubeletPluginServer {
  type Output = hyper::Result<()>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    match self.get_mut().handle.poll_unpin(cx) {
      Poll::Pending => Poll::Pending,
      Poll::Ready(result) => match result {
        Ok(result) => Poll::Ready(result),
        Err(e) if e.is_cancelled() => unreachable!(),
        Err(e) => panic::resume_unwind(e.into_panic()),
      },
    }
  }
}

impl FusedFuture for KubeletPluginServer {
  fn is_terminated(&self) -> bool {
    self.is_terminated()
  }
}
