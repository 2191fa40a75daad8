//! Service configuration.
//!
//! Embedding applications can drive the service from a TOML file: worker
//! count and CPU affinity, listeners (with optional TLS identities), and
//! logging.

use crate::error::ServiceError;
use crate::tls::TlsIdentity;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Worker thread configuration.
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Listeners to start.
    #[serde(default)]
    pub listener: Vec<ListenerConfig>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ServiceConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ServiceError> {
        toml::from_str(raw).map_err(|e| ServiceError::Config(e.to_string()))
    }
}

/// Worker thread configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkersConfig {
    /// Number of loop workers (default: number of CPUs).
    pub threads: Option<usize>,

    /// CPU cores to pin workers to, Linux list syntax (e.g. "0-3,6-8").
    pub cpu_affinity: Option<String>,
}

impl WorkersConfig {
    /// Resolved worker count: explicit setting, else the affinity list
    /// length, else available parallelism.
    pub fn threads(&self) -> usize {
        if let Some(threads) = self.threads {
            return threads;
        }
        if let Some(cpus) = self.cpu_list()
            && !cpus.is_empty()
        {
            return cpus.len();
        }
        std::thread::available_parallelism().map_or(1, |n| n.get())
    }

    /// Parsed affinity list; `None` when unset or malformed (malformed
    /// lists are logged and ignored rather than refusing to start).
    pub fn cpu_list(&self) -> Option<Vec<usize>> {
        let raw = self.cpu_affinity.as_deref()?;
        match parse_cpu_list(raw) {
            Ok(cpus) => Some(cpus),
            Err(e) => {
                tracing::warn!(cpu_affinity = raw, error = %e, "ignoring bad affinity list");
                None
            }
        }
    }
}

/// Parse a Linux-style CPU list: comma-separated ids or inclusive ranges.
fn parse_cpu_list(raw: &str) -> Result<Vec<usize>, String> {
    let mut cpus = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((start, end)) => {
                let start: usize = start
                    .trim()
                    .parse()
                    .map_err(|_| format!("bad range start in '{part}'"))?;
                let end: usize = end
                    .trim()
                    .parse()
                    .map_err(|_| format!("bad range end in '{part}'"))?;
                if end < start {
                    return Err(format!("descending range '{part}'"));
                }
                cpus.extend(start..=end);
            }
            None => {
                cpus.push(part.parse().map_err(|_| format!("bad cpu id '{part}'"))?);
            }
        }
    }
    Ok(cpus)
}

/// One listener.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// Address to bind (e.g. "0.0.0.0:7000" or "[::]:7000").
    pub address: SocketAddr,

    /// Per-session receive buffer cap (e.g. "256KB"); sessions exceeding
    /// it are disconnected.
    #[serde(
        default = "default_max_recv_buffer",
        deserialize_with = "deserialize_size"
    )]
    pub max_recv_buffer: usize,

    /// TLS identity; plaintext when absent.
    pub tls: Option<TlsFilesConfig>,
}

impl ListenerConfig {
    pub fn tls_identity(&self) -> Option<TlsIdentity> {
        self.tls.as_ref().map(|t| TlsIdentity {
            certificate: t.certificate.clone(),
            private_key: t.private_key.clone(),
        })
    }
}

/// PEM file paths for a listener's TLS identity.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsFilesConfig {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

fn default_max_recv_buffer() -> usize {
    1024 * 1024
}

/// Accept integer byte counts or strings with a KB/MB/GB suffix.
fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Int(u64),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Int(n) => Ok(n as usize),
        SizeValue::String(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

fn parse_size(raw: &str) -> Result<usize, String> {
    let s = raw.trim();
    let (digits, multiplier) = if let Some(prefix) = s.strip_suffix("GB") {
        (prefix, 1024 * 1024 * 1024)
    } else if let Some(prefix) = s.strip_suffix("MB") {
        (prefix, 1024 * 1024)
    } else if let Some(prefix) = s.strip_suffix("KB") {
        (prefix, 1024)
    } else if let Some(prefix) = s.strip_suffix('B') {
        (prefix, 1)
    } else {
        (s, 1)
    };

    digits
        .trim()
        .parse::<usize>()
        .map(|n| n * multiplier)
        .map_err(|_| format!("invalid size '{raw}'"))
}

/// Logging output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Logging configuration consumed by [`crate::logging::init`].
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter directive when RUST_LOG is unset (e.g. "info",
    /// "tcp_service=debug").
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include the event's module path.
    #[serde(default = "default_true")]
    pub target: bool,

    /// Include thread names (loop-0, listen, connector).
    #[serde(default = "default_true")]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: true,
            thread_names: true,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}
