use std::fs::read_to_string;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Maps {
    ///
    /// Filesystem path of the pinned `endpoints_to_service_map` hash table.
    ///
    /// The map is expected to already be pinned on a bpffs-like filesystem
    /// by whatever loads the kernel datapath program; this agent only opens
    /// it, it never creates or unpins it.
    ///
    #[serde(default = "Maps::endpoints_to_service_path")]
    pub endpoints_to_service_path: PathBuf,
}

impl Maps {
    fn endpoints_to_service_path() -> PathBuf {
        PathBuf::from("/sys/fs/bpf/endpoints_to_service_map")
    }
}

impl Default for Maps {
    fn default() -> Self {
        Self {
            endpoints_to_service_path: Self::endpoints_to_service_path(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Watch {
    ///
    /// Periodic re-sync cadence asked of the cluster collaborator's
    /// informers, in seconds.
    ///
    #[serde(default = "Watch::resync_period_secs")]
    pub resync_period_secs: u64,
    ///
    /// How often the (non-core) status task logs cache sizes, in seconds.
    ///
    #[serde(default = "Watch::status_interval_secs")]
    pub status_interval_secs: u64,
}

impl Watch {
    fn resync_period_secs() -> u64 {
        10
    }

    fn status_interval_secs() -> u64 {
        30
    }
}

impl Default for Watch {
    fn default() -> Self {
        Self {
            resync_period_secs: Self::resync_period_secs(),
            status_interval_secs: Self::status_interval_secs(),
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub maps: Maps,
    #[serde(default)]
    pub watch: Watch,
    #[serde(default)]
    pub log: Log,
    /// Explicit kubeconfig path. `None` falls through to the
    /// home-directory default, then in-cluster discovery.
    #[serde(skip)]
    pub kubeconfig: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Explicit path to a kubeconfig file.
    ///
    /// When absent, the home-directory default (`~/.kube/config`) is tried,
    /// then in-cluster service-account discovery.
    ///
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    ///
    /// Optional path to a json5 configuration file controlling map paths,
    /// resync cadence and log level. Falls back to built-in defaults when
    /// absent.
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    ///
    /// Loads configuration from the command line and, if given, a json5
    /// config file; unspecified fields fall back to their defaults.
    ///
    pub fn load() -> Result<Self> {
        let cli = Cli::parse();

        let mut config: Config = match &cli.config {
            Some(path) => serde_json5::from_str(&read_to_string(path)?)?,
            None => Config::default(),
        };

        config.kubeconfig = cli.kubeconfig;
        Ok(config)
    }
}
