#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fs,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    diagnostics::DEFAULT_DIAGNOSTIC_CAPACITY,
    format::{DEFAULT_FORMAT_TOKEN, FormatPlanConfig, FormatResolver},
    process::{DEFAULT_EXTRACTOR_BIN, DEFAULT_KILL_GRACE, DEFAULT_MAX_EXTRACTIONS},
    relay::{DEFAULT_BUFFER_CHUNKS, DEFAULT_CHUNK_SIZE},
    security::normalize_origin,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_NEWTUBE_PORT: u16 = 8080;
pub const DEFAULT_NEWTUBE_HOST: &str = "127.0.0.1";
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

const HOST_KEY: &str = "NEWTUBE_HOST";
const PORT_KEY: &str = "NEWTUBE_PORT";
const CONFIG_KEY: &str = "NEWTUBE_CONFIG";
const EXTRACTOR_KEY: &str = "NEWTUBE_EXTRACTOR_BIN";
const MAX_EXTRACTIONS_KEY: &str = "NEWTUBE_MAX_EXTRACTIONS";
const DEFAULT_FORMAT_KEY: &str = "NEWTUBE_DEFAULT_FORMAT";
const PROBE_TIMEOUT_KEY: &str = "NEWTUBE_PROBE_TIMEOUT_SECS";
const KILL_GRACE_KEY: &str = "NEWTUBE_KILL_GRACE_MS";
const ALLOWED_ORIGINS_KEY: &str = "NEWTUBE_ALLOWED_ORIGINS";

/// Everything the gateway needs at runtime, resolved once at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_host: IpAddr,
    pub port: u16,
    pub extractor_bin: PathBuf,
    pub max_extractions: usize,
    pub default_format: String,
    pub probe_timeout: Duration,
    pub kill_grace: Duration,
    pub diagnostic_capacity: usize,
    pub relay_chunk_size: usize,
    pub relay_buffer_chunks: usize,
    /// Normalized CORS origins. Empty means any origin may call the gateway.
    pub allowed_origins: Vec<String>,
    pub formats: Vec<FormatPlanConfig>,
}

impl GatewayConfig {
    /// Resolver for the configured plans. Fails when the default token does
    /// not name one of them.
    pub fn format_resolver(&self) -> Result<FormatResolver> {
        let resolver = FormatResolver::with_custom(&self.formats)?;
        if !resolver.is_recognized(&self.default_format) {
            bail!(
                "default format '{}' is not a known format token",
                self.default_format
            );
        }
        Ok(resolver)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_host: IpAddr::from([127, 0, 0, 1]),
            port: DEFAULT_NEWTUBE_PORT,
            extractor_bin: PathBuf::from(DEFAULT_EXTRACTOR_BIN),
            max_extractions: DEFAULT_MAX_EXTRACTIONS,
            default_format: DEFAULT_FORMAT_TOKEN.to_string(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            kill_grace: DEFAULT_KILL_GRACE,
            diagnostic_capacity: DEFAULT_DIAGNOSTIC_CAPACITY,
            relay_chunk_size: DEFAULT_CHUNK_SIZE,
            relay_buffer_chunks: DEFAULT_BUFFER_CHUNKS,
            allowed_origins: Vec::new(),
            formats: Vec::new(),
        }
    }
}

/// Optional TOML config file. Every key is optional; `[[formats]]` tables add
/// or replace extraction plans.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub extractor: Option<PathBuf>,
    pub max_extractions: Option<usize>,
    pub default_format: Option<String>,
    pub probe_timeout_secs: Option<u64>,
    pub kill_grace_ms: Option<u64>,
    pub diagnostic_capacity: Option<usize>,
    pub relay_chunk_size: Option<usize>,
    pub relay_buffer_chunks: Option<usize>,
    pub allowed_origins: Vec<String>,
    pub formats: Vec<FormatPlanConfig>,
}

/// Values coming from the command line; they win over every other source.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub extractor_bin: Option<PathBuf>,
    pub max_extractions: Option<usize>,
    pub config_path: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

/// Resolves the configuration with precedence CLI > process env > `.env`
/// file > TOML file > defaults.
pub fn resolve_gateway_config(overrides: ConfigOverrides) -> Result<GatewayConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    let config_path = overrides
        .config_path
        .clone()
        .or_else(|| lookup_value(CONFIG_KEY, &file_vars, &env_var_string).map(PathBuf::from));
    let file_config = match config_path {
        Some(path) => read_config_file(&path)?,
        None => FileConfig::default(),
    };
    build_gateway_config_with_overrides(&file_vars, env_var_string, file_config, overrides)
}

pub fn read_config_file(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("Parsing {}", path.display()))
}

#[cfg(test)]
fn build_gateway_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<GatewayConfig> {
    build_gateway_config_with_overrides(
        file_vars,
        env_lookup,
        FileConfig::default(),
        ConfigOverrides::default(),
    )
}

fn build_gateway_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    file_config: FileConfig,
    overrides: ConfigOverrides,
) -> Result<GatewayConfig> {
    let defaults = GatewayConfig::default();

    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup_value(HOST_KEY, file_vars, &env_lookup))
        .or(file_config.host)
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_NEWTUBE_HOST.to_string());
    let listen_host = parse_host(&host)?;

    let port = overrides
        .port
        .or_else(|| lookup_parsed(PORT_KEY, file_vars, &env_lookup))
        .or(file_config.port)
        .unwrap_or(defaults.port);

    let extractor_bin = overrides
        .extractor_bin
        .or_else(|| lookup_value(EXTRACTOR_KEY, file_vars, &env_lookup).map(PathBuf::from))
        .or(file_config.extractor)
        .unwrap_or(defaults.extractor_bin);

    let max_extractions = overrides
        .max_extractions
        .or_else(|| lookup_parsed(MAX_EXTRACTIONS_KEY, file_vars, &env_lookup))
        .or(file_config.max_extractions)
        .unwrap_or(defaults.max_extractions);

    let default_format = lookup_value(DEFAULT_FORMAT_KEY, file_vars, &env_lookup)
        .or(file_config.default_format)
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty())
        .unwrap_or(defaults.default_format);

    let probe_timeout = lookup_parsed(PROBE_TIMEOUT_KEY, file_vars, &env_lookup)
        .or(file_config.probe_timeout_secs)
        .map(Duration::from_secs)
        .unwrap_or(defaults.probe_timeout);

    let kill_grace = lookup_parsed(KILL_GRACE_KEY, file_vars, &env_lookup)
        .or(file_config.kill_grace_ms)
        .map(Duration::from_millis)
        .unwrap_or(defaults.kill_grace);

    let allowed_origins = match lookup_value(ALLOWED_ORIGINS_KEY, file_vars, &env_lookup) {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect(),
        None => file_config.allowed_origins,
    };
    let allowed_origins = allowed_origins
        .iter()
        .map(|origin| normalize_origin(origin))
        .collect::<Result<Vec<_>>>()?;

    let config = GatewayConfig {
        listen_host,
        port,
        extractor_bin,
        max_extractions,
        default_format,
        probe_timeout,
        kill_grace,
        diagnostic_capacity: file_config
            .diagnostic_capacity
            .unwrap_or(defaults.diagnostic_capacity),
        relay_chunk_size: file_config
            .relay_chunk_size
            .unwrap_or(defaults.relay_chunk_size),
        relay_buffer_chunks: file_config
            .relay_buffer_chunks
            .unwrap_or(defaults.relay_buffer_chunks),
        allowed_origins,
        formats: file_config.formats,
    };
    validate(&config)?;
    Ok(config)
}

fn validate(config: &GatewayConfig) -> Result<()> {
    if config.max_extractions == 0 {
        bail!("max_extractions must be at least 1");
    }
    if config.relay_chunk_size == 0 {
        bail!("relay_chunk_size must be at least 1 byte");
    }
    if config.relay_buffer_chunks == 0 {
        bail!("relay_buffer_chunks must be at least 1");
    }
    if config.probe_timeout.is_zero() {
        bail!("probe timeout must be greater than zero");
    }
    if config.extractor_bin.as_os_str().is_empty() {
        bail!("extractor binary path is empty");
    }
    Ok(())
}

pub fn parse_host(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .map_err(|_| anyhow!("expected a valid IPv4 or IPv6 address for --host/NEWTUBE_HOST, got '{value}'"))
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

/// Like [`lookup_value`], dropping values that do not parse so the next
/// source (or the default) applies.
fn lookup_parsed<T: std::str::FromStr>(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<T> {
    lookup_value(key, file_vars, env_lookup).and_then(|value| value.trim().parse::<T>().ok())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
