//! Gateway configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/tg-gateway/gateway.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `[subscriber]` with `token` or `token_file`
//! - At least one `[[ports]]` entry
//!
//! # Token file format
//! Raw token string on a single line; trimmed on read.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tg_wire::ProtocolFamily;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub schema_version: u32,
    /// The raw subscriber token (resolved from `token` or `token_file`).
    pub subscriber_token: String,
    pub limits: Limits,
    /// Bind address for the stats endpoint; `None` disables it.
    pub stats_bind: Option<String>,
    pub ports: Vec<PortConfig>,
}

#[derive(Debug, Clone)]
pub struct Limits {
    pub idle_timeout: Duration,
    pub max_connections_per_port: usize,
}

/// What a configured listener port speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortFamily {
    /// Ruptela framed-records, FM/Pro5 variant.
    RuptelaFm,
    /// Ruptela framed-records, ECO5 variant (same wire format).
    RuptelaEco,
    /// Jimi JM-LL301 (GT06-style).
    Jimi,
    /// Log-only bypass: frames are hex-dumped, never answered.
    Bypass,
}

impl PortFamily {
    /// The wire family used for frame reassembly, when the port is not a
    /// bypass port.
    pub fn wire_family(self) -> Option<ProtocolFamily> {
        match self {
            PortFamily::RuptelaFm | PortFamily::RuptelaEco => Some(ProtocolFamily::Ruptela),
            PortFamily::Jimi => Some(ProtocolFamily::Jimi),
            PortFamily::Bypass => None,
        }
    }

    /// Tag used in logs, stats, and the fix `protocol` field.
    pub fn tag(self) -> &'static str {
        match self {
            PortFamily::RuptelaFm => "ruptela-fm",
            PortFamily::RuptelaEco => "ruptela-eco",
            PortFamily::Jimi => "jimi",
            PortFamily::Bypass => "bypass",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortConfig {
    pub port: u16,
    pub family: PortFamily,
    /// Western-deployment policy: force decoded longitudes negative.
    /// Meaningful for Jimi ports only.
    pub hemisphere_west: bool,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    subscriber: Option<RawSubscriber>,
    limits: Option<RawLimits>,
    stats_http: Option<RawStatsHttp>,
    ports: Option<Vec<RawPort>>,
}

#[derive(Debug, Deserialize)]
struct RawSubscriber {
    token: Option<String>,
    token_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLimits {
    idle_timeout_secs: Option<u64>,
    max_connections_per_port: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawStatsHttp {
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPort {
    port: Option<u16>,
    family: Option<String>,
    hemisphere_west: Option<bool>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("config invalid: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tg-gateway/gateway.toml";

/// Load gateway config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load gateway config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<GatewayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    match raw.schema_version {
        Some(1) => {}
        Some(v) => {
            return Err(ConfigError::Invalid(format!(
                "unsupported schema_version {v}, expected 1"
            )))
        }
        None => return Err(ConfigError::Invalid("schema_version is required".into())),
    }

    let subscriber = raw
        .subscriber
        .ok_or_else(|| ConfigError::Invalid("[subscriber] section is required".into()))?;
    let subscriber_token = resolve_token(&subscriber)?;

    let limits = raw.limits.unwrap_or(RawLimits {
        idle_timeout_secs: None,
        max_connections_per_port: None,
    });
    let limits = Limits {
        idle_timeout: Duration::from_secs(limits.idle_timeout_secs.unwrap_or(300)),
        max_connections_per_port: limits.max_connections_per_port.unwrap_or(100),
    };
    if limits.max_connections_per_port == 0 {
        return Err(ConfigError::Invalid(
            "max_connections_per_port must be at least 1".into(),
        ));
    }

    let stats_bind = raw.stats_http.and_then(|s| s.bind);

    let raw_ports = raw
        .ports
        .ok_or_else(|| ConfigError::Invalid("at least one [[ports]] entry is required".into()))?;
    if raw_ports.is_empty() {
        return Err(ConfigError::Invalid(
            "at least one [[ports]] entry is required".into(),
        ));
    }
    let mut ports = Vec::with_capacity(raw_ports.len());
    for (i, p) in raw_ports.iter().enumerate() {
        let port = p
            .port
            .ok_or_else(|| ConfigError::Invalid(format!("ports[{i}]: port is required")))?;
        let family = match p.family.as_deref() {
            Some("ruptela-fm") => PortFamily::RuptelaFm,
            Some("ruptela-eco") => PortFamily::RuptelaEco,
            Some("jimi") => PortFamily::Jimi,
            Some("bypass") => PortFamily::Bypass,
            Some(other) => {
                return Err(ConfigError::Invalid(format!(
                    "ports[{i}]: unknown family '{other}'"
                )))
            }
            None => {
                return Err(ConfigError::Invalid(format!(
                    "ports[{i}]: family is required"
                )))
            }
        };
        if ports.iter().any(|q: &PortConfig| q.port == port) {
            return Err(ConfigError::Invalid(format!(
                "ports[{i}]: port {port} configured twice"
            )));
        }
        ports.push(PortConfig {
            port,
            family,
            hemisphere_west: p.hemisphere_west.unwrap_or(false),
        });
    }

    Ok(GatewayConfig {
        schema_version: 1,
        subscriber_token,
        limits,
        stats_bind,
        ports,
    })
}

fn resolve_token(raw: &RawSubscriber) -> Result<String, ConfigError> {
    if let Some(path) = &raw.token_file {
        let token = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("reading token file '{path}': {e}")))?;
        let token = token.trim().to_owned();
        if token.is_empty() {
            return Err(ConfigError::Invalid(format!("token file '{path}' is empty")));
        }
        return Ok(token);
    }
    match &raw.token {
        Some(t) if !t.trim().is_empty() => Ok(t.trim().to_owned()),
        _ => Err(ConfigError::Invalid(
            "[subscriber] needs token or token_file".into(),
        )),
    }
}
