//! Configuration for the device agent.
//!
//! Sources, lowest precedence first: built-in defaults, the optional
//! `--config` file (YAML or TOML), `EDGE_DEVICE_*` environment variables,
//! explicit command-line flags.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use ::config::{Environment, File};
use clap::Parser;
use flotta_id::{DeviceId, IdError};
use serde::Deserialize;
use thiserror::Error;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "EDGE_DEVICE";

/// Command-line flags.
#[derive(Debug, Default, Parser)]
#[command(name = "device-agent", version, about = "Edge device workload agent")]
pub struct Cli {
    /// YAML or TOML file whose keys match the environment variable names.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Root CA PEM bundle.
    #[arg(long = "ca-root", value_name = "PATH")]
    pub ca_root: Option<PathBuf>,

    /// Client certificate PEM.
    #[arg(long = "cert-file", value_name = "PATH")]
    pub cert_file: Option<PathBuf>,

    /// Client private key PEM.
    #[arg(long = "key", value_name = "PATH")]
    pub key: Option<PathBuf>,

    /// Control plane base URL.
    #[arg(long, value_name = "URL")]
    pub server: Option<String>,

    #[arg(long = "log-level")]
    pub log_level: Option<String>,

    /// Namespace requested at enrolment.
    #[arg(long)]
    pub namespace: Option<String>,

    /// Overrides the machine identity.
    #[arg(long = "device-id")]
    pub device_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid device id: {0}")]
    DeviceId(#[from] IdError),
}

/// Merged settings before validation.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(alias = "LOG_LEVEL")]
    log_level: Option<String>,
    #[serde(alias = "CA_ROOT")]
    ca_root: Option<String>,
    #[serde(alias = "CERT", alias = "cert_file")]
    cert: Option<String>,
    #[serde(alias = "KEY", alias = "key_file")]
    key: Option<String>,
    #[serde(alias = "SERVER")]
    server: Option<String>,
    #[serde(alias = "NAMESPACE")]
    namespace: Option<String>,
    #[serde(alias = "DEVICE_ID")]
    device_id: Option<String>,
    #[serde(alias = "GRACEFUL_SHUTDOWN")]
    graceful_shutdown: Option<String>,
    #[serde(alias = "HEARTBEAT_PERIOD")]
    heartbeat_period: Option<String>,
    #[serde(alias = "ROOT_SLICE")]
    root_slice: Option<String>,
    #[serde(alias = "CGROUP_ROOT")]
    cgroup_root: Option<String>,
    #[serde(alias = "REQUEST_TIMEOUT")]
    request_timeout: Option<String>,
    #[serde(alias = "STOP_TIMEOUT")]
    stop_timeout: Option<String>,
}

/// Device agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub ca_root: PathBuf,

    /// Where the client certificate lives. Without it, a registered
    /// certificate is kept in memory only.
    pub cert_file: Option<PathBuf>,

    pub key_file: Option<PathBuf>,

    /// Control plane base URL.
    pub server: String,

    /// Namespace requested at enrolment.
    pub namespace: String,

    pub device_id: DeviceId,

    /// Bound on waiting for tasks at shutdown.
    pub graceful_shutdown: Duration,

    /// Initial heartbeat period; the control plane may change it.
    pub heartbeat_period: Duration,

    /// Prefix for resource slice names.
    pub root_slice: String,

    pub cgroup_root: PathBuf,

    /// Bound on control plane and runtime calls.
    pub request_timeout: Duration,

    pub stop_timeout: Duration,
}

impl Config {
    /// Merge every source and validate the result.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        Self::load_with_env(cli, None)
    }

    /// Like [`Config::load`], reading environment variables from `env`
    /// instead of the process environment when given.
    pub fn load_with_env(
        cli: &Cli,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = &cli.config {
            builder = builder.add_source(File::from(path.as_path()).required(true));
        }

        builder = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).source(env))
            .set_override_option("log_level", cli.log_level.clone())?
            .set_override_option("ca_root", path_string(&cli.ca_root))?
            .set_override_option("cert", path_string(&cli.cert_file))?
            .set_override_option("key", path_string(&cli.key))?
            .set_override_option("server", cli.server.clone())?
            .set_override_option("namespace", cli.namespace.clone())?
            .set_override_option("device_id", cli.device_id.clone())?;

        let raw: RawConfig = builder.build()?.try_deserialize()?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let ca_root = non_empty(raw.ca_root).ok_or(ConfigError::Missing("CA_ROOT"))?;
        let server = non_empty(raw.server).ok_or(ConfigError::Missing("SERVER"))?;
        if !(server.starts_with("http://") || server.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                key: "SERVER",
                value: server,
                reason: "expected an http:// or https:// URL".to_string(),
            });
        }

        let device_id = DeviceId::resolve(non_empty(raw.device_id).as_deref())?;

        Ok(Self {
            log_level: non_empty(raw.log_level).unwrap_or_else(|| "info".to_string()),
            ca_root: PathBuf::from(ca_root),
            cert_file: non_empty(raw.cert).map(PathBuf::from),
            key_file: non_empty(raw.key).map(PathBuf::from),
            server,
            namespace: non_empty(raw.namespace).unwrap_or_else(|| "default".to_string()),
            device_id,
            graceful_shutdown: duration_setting(
                "GRACEFUL_SHUTDOWN",
                raw.graceful_shutdown,
                Duration::from_secs(5),
            )?,
            heartbeat_period: positive_duration_setting(
                "HEARTBEAT_PERIOD",
                raw.heartbeat_period,
                Duration::from_secs(1),
            )?,
            root_slice: non_empty(raw.root_slice).unwrap_or_else(|| "flotta".to_string()),
            cgroup_root: non_empty(raw.cgroup_root)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/sys/fs/cgroup")),
            request_timeout: positive_duration_setting(
                "REQUEST_TIMEOUT",
                raw.request_timeout,
                Duration::from_secs(2),
            )?,
            stop_timeout: positive_duration_setting(
                "STOP_TIMEOUT",
                raw.stop_timeout,
                Duration::from_secs(5),
            )?,
        })
    }
}

fn path_string(path: &Option<PathBuf>) -> Option<String> {
    path.as_ref().map(|p| p.display().to_string())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn duration_setting(
    key: &'static str,
    value: Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match non_empty(value) {
        None => Ok(default),
        Some(value) => parse_duration(&value).ok_or_else(|| ConfigError::Invalid {
            key,
            value,
            reason: "expected a duration such as 500ms, 5s, 2m, 1h or 1m30s".to_string(),
        }),
    }
}

/// Like `duration_setting`, but zero is rejected.
fn positive_duration_setting(
    key: &'static str,
    value: Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let duration = duration_setting(key, value.clone(), default)?;
    if duration.is_zero() {
        return Err(ConfigError::Invalid {
            key,
            value: value.unwrap_or_default(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(duration)
}

/// Parse `500ms`, `5s`, `2m`, `1h`, combinations like `1m30s`, or a bare
/// number of seconds.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(secs) = input.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit())?;
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let part = match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60)?),
            "h" => Duration::from_secs(value.checked_mul(3600)?),
            _ => return None,
        };
        total = total.checked_add(part)?;
    }
    Some(total)
}
