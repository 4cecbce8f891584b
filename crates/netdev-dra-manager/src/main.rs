use anyhow::Result;
use clap::Clap;
use std::path::PathBuf;
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

use crate::config::Config;

mod api;
mod app;
mod claims;
mod cloud;
mod config;
mod device;
mod dra;
mod effector;
mod ethtool;
mod inventory;
mod metrics;
mod netlink;
mod netns;
mod podconfig;
mod publisher;
mod runtime;
mod selector;
mod string;
mod sysfs;

#[derive(Clap, Debug, PartialEq, Clone, Copy)]
enum LogFormat {
  Pretty,
  Json,
}

#[derive(Clap, Debug, PartialEq, Clone, Copy)]
enum ConfigFormat {
  Json,
  Yaml,
  Toml,
  Auto,
}

impl From<ConfigFormat> for config::ConfigFormat {
  fn from(value: ConfigFormat) -> Self {
    match value {
      ConfigFormat::Json => config::ConfigFormat::Json,
      ConfigFormat::Yaml => config::ConfigFormat::Yaml,
      ConfigFormat::Toml => config::ConfigFormat::Toml,
      ConfigFormat::Auto => config::ConfigFormat::Auto,
    }
  }
}

#[derive(Clap, Debug)]
struct App {
  /// Log output format
  #[clap(
    arg_enum,
    long = "log-format",
    short = 'f',
    env = "LOG_FORMAT",
    default_value = "pretty"
  )]
  log_format: LogFormat,

  /// Config file format
  #[clap(
    arg_enum,
    long = "config-format",
    short = 't',
    env = "CONFIG_FILE_FORMAT",
    default_value = "auto"
  )]
  config_format: ConfigFormat,

  /// Configuration file path; built-in defaults apply when omitted
  #[clap(long = "config", short = 'c', env = "CONFIG_FILE")]
  config_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
  let app = App::parse();
  let filter = EnvFilter::from_default_env()
    // Set the base level when not matched by other directives to INFO.
    .add_directive(tracing::Level::INFO.into());

  match app.log_format {
    LogFormat::Pretty => {
      tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    LogFormat::Json => {
      tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(false)
        .with_span_list(false)
        .init();
    }
  }

  let config = match &app.config_file {
    Some(path) => Config::read(path, app.config_format.into()).await?,
    None => {
      event!(target: "netdev-dra-manager", Level::DEBUG, "No config file given, using defaults");
      Config::default()
    }
  };

  app::run(config).await
}
