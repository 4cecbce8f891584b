use nix::sched::{setns, CloneFlags};
use std::{
  fs::File,
  io,
  os::unix::io::AsRawFd,
  path::{Path, PathBuf},
  process,
};
use thiserror::Error;
use tracing::{event, Level};

const CURRENT_NETNS: &str = "/proc/self/ns/net";

#[derive(Debug, Error)]
pub enum NetnsError {
  #[error("Failed to open network namespace {path:?}")]
  Open {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("Failed to switch to network namespace {path:?}: {source}")]
  Enter {
    path: PathBuf,
    #[source]
    source: nix::Error,
  },

  #[error("Background task failed: {0}")]
  Join(#[from] tokio::task::JoinError),
}

impl NetnsError {
  pub fn is_not_found(&self) -> bool {
    matches!(
      self,
      NetnsError::Open { source, .. } if source.kind() == io::ErrorKind::NotFound
    )
  }
}

/// Switches the calling OS thread into a target network namespace and back
/// when dropped. The guard must only live on a thread that is not shared with
/// the async executor; see [`enter`].
#[derive(Debug)]
pub struct NetnsGuard {
  original: File,
}

impl NetnsGuard {
  pub fn new(path: &Path) -> Result<Self, NetnsError> {
    let original = File::open(CURRENT_NETNS).map_err(|source| NetnsError::Open {
      path: CURRENT_NETNS.into(),
      source,
    })?;
    let target = File::open(path).map_err(|source| NetnsError::Open {
      path: path.to_owned(),
      source,
    })?;

    setns(target.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(|source| NetnsError::Enter {
      path: path.to_owned(),
      source,
    })?;

    Ok(Self { original })
  }
}

impl Drop for NetnsGuard {
  fn drop(&mut self) {
    // A thread that cannot be restored must never return to the blocking
    // pool: every later task scheduled onto it would silently run in the
    // wrong namespace.
    if let Err(error) = setns(self.original.as_raw_fd(), CloneFlags::CLONE_NEWNET) {
      event!(target: "netdev-dra-manager", Level::ERROR, ?error, "Failed to restore the original network namespace, aborting");
      process::abort();
    }
  }
}

/// Run `f` with the OS thread switched into the namespace at `path`. The
/// closure executes on a dedicated blocking thread, so it holds the thread
/// for the whole namespace window and cannot yield while switched.
pub async fn enter<F, T>(path: impl Into<PathBuf>, f: F) -> Result<T, NetnsError>
where
  F: FnOnce() -> T + Send + 'static,
  T: Send + 'static,
{
  let path = path.into();
  tokio::task::spawn_blocking(move || {
    let _guard = NetnsGuard::new(&path)?;
    Ok(f())
  })
  .await?
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_namespace_is_reported_as_not_found() {
    let error = NetnsGuard::new(Path::new("/proc/self/ns/does-not-exist")).unwrap_err();
    assert!(error.is_not_found());
  }

  #[tokio::test]
  async fn enter_surfaces_open_errors() {
    let result = enter("/proc/self/ns/does-not-exist", || ()).await;
    assert!(matches!(result, Err(NetnsError::Open { .. })));
  }
}
