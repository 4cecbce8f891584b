use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::{fs, io};
use tracing::{event, Level};

fn default_driver_name() -> String {
  "netdev.dra.dev".to_string()
}

fn default_plugins_dir() -> PathBuf {
  PathBuf::from("/var/lib/kubelet/plugins")
}

fn default_registry_dir() -> PathBuf {
  PathBuf::from("/var/lib/kubelet/plugins_registry")
}

/// Process configuration. Read exactly once at startup; there is no reload
/// path.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Config {
  /// DNS-style driver name; also the attribute domain published to the
  /// scheduler and the name the kubelet registers the plugin under.
  #[serde(default = "default_driver_name")]
  pub driver_name: String,

  /// Defaults to the NODE_NAME environment variable.
  #[serde(default)]
  pub node_name: Option<String>,

  /// CEL expression deciding which devices are published, evaluated per
  /// device over `device.attributes`. Absent means every device.
  #[serde(default)]
  pub selector: Option<String>,

  /// Cloud metadata provider (`gce`). Absent disables the metadata probe.
  #[serde(default)]
  pub cloud_provider: Option<String>,

  #[serde(default = "default_plugins_dir")]
  pub kubelet_plugins_dir: PathBuf,

  #[serde(default = "default_registry_dir")]
  pub kubelet_registry_dir: PathBuf,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      driver_name: default_driver_name(),
      node_name: None,
      selector: None,
      cloud_provider: None,
      kubelet_plugins_dir: default_plugins_dir(),
      kubelet_registry_dir: default_registry_dir(),
    }
  }
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ConfigFormat {
  Json,
  Yaml,
  Toml,
  Auto,
}

/// What `Auto` resolves to; never `Auto` itself.
enum ResolvedFormat {
  Json,
  Yaml,
  Toml,
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("Cannot infer a config format for {0:?} (expected a json, yaml or toml extension)")]
  UnknownExtension(PathBuf),

  #[error("Failed to parse config file as JSON")]
  Json(#[from] serde_json::Error),

  #[error("Failed to parse config file as YAML")]
  Yaml(#[from] serde_yaml::Error),

  #[error("Failed to parse config file as TOML")]
  Toml(#[from] toml::de::Error),

  #[error(transparent)]
  Io(#[from] io::Error),
}

impl ConfigFormat {
  /// Explicit formats win; `Auto` goes by the file extension.
  fn resolve(self, path: &Path) -> Result<ResolvedFormat, ConfigError> {
    match self {
      ConfigFormat::Json => Ok(ResolvedFormat::Json),
      ConfigFormat::Yaml => Ok(ResolvedFormat::Yaml),
      ConfigFormat::Toml => Ok(ResolvedFormat::Toml),
      ConfigFormat::Auto => match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(ResolvedFormat::Json),
        Some("yaml") | Some("yml") => Ok(ResolvedFormat::Yaml),
        Some("toml") => Ok(ResolvedFormat::Toml),
        _ => Err(ConfigError::UnknownExtension(path.to_owned())),
      },
    }
  }
}

impl Config {
  pub async fn read(
    path: impl AsRef<Path>,
    format: ConfigFormat,
  ) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let format = format.resolve(path)?;
    let content = fs::read(path).await?;

    let result = match format {
      ResolvedFormat::Json => serde_json::from_slice(&content).map_err(ConfigError::from),
      ResolvedFormat::Yaml => serde_yaml::from_slice(&content).map_err(ConfigError::from),
      ResolvedFormat::Toml => toml::from_slice(&content).map_err(ConfigError::from),
    };

    match result {
      Ok(config) => {
        event!(target: "netdev-dra-manager", Level::INFO, ?config, "Loaded configuration");
        Ok(config)
      }
      Err(error) => {
        event!(target: "netdev-dra-manager", Level::ERROR, path = %path.display(), ?error, "Failed to read config file");
        Err(error)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn defaults_are_sensible() {
    let config: Config = serde_yaml::from_str("{}").unwrap();
    assert_eq!(config.driver_name, "netdev.dra.dev");
    assert_eq!(
      config.kubelet_plugins_dir,
      PathBuf::from("/var/lib/kubelet/plugins")
    );
    assert!(config.selector.is_none());
  }

  #[test]
  fn camel_case_fields() {
    let config: Config = serde_yaml::from_str(
      "driverName: net.example.com\nnodeName: node-1\nselector: 'device.attributes[\"rdma\"]'\n",
    )
    .unwrap();
    assert_eq!(config.driver_name, "net.example.com");
    assert_eq!(config.node_name.as_deref(), Some("node-1"));
    assert!(config.selector.is_some());
  }

  #[tokio::test]
  async fn auto_goes_by_the_extension() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(file, "driverName: net.example.com").unwrap();

    let config = Config::read(file.path(), ConfigFormat::Auto).await.unwrap();
    assert_eq!(config.driver_name, "net.example.com");
  }

  #[tokio::test]
  async fn auto_rejects_unknown_extensions() {
    let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
    let error = Config::read(file.path(), ConfigFormat::Auto)
      .await
      .unwrap_err();
    assert!(matches!(error, ConfigError::UnknownExtension(_)));
  }

  #[tokio::test]
  async fn explicit_format_overrides_the_extension() {
    let mut file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
    writeln!(file, "{{\"driverName\": \"net.example.com\"}}").unwrap();

    let config = Config::read(file.path(), ConfigFormat::Json).await.unwrap();
    assert_eq!(config.driver_name, "net.example.com");
  }
}
