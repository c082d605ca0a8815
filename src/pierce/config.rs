use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context;
use serde::Deserialize;

/// Bounds on the per-mapping tunnel pool size.
pub const MIN_TUNNEL_COUNT: usize = 1;
pub const MAX_TUNNEL_COUNT: usize = 5;

/// A service address, optionally carrying the public access port it maps
/// to: `host:port[:access_port]`. The access port defaults to the service
/// port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetAddress {
    pub host: String,
    pub port: u16,
    pub port2: u16,
}

impl NetAddress {
    pub fn dial_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NetAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split(':');
        let host = parts.next().unwrap_or_default().trim().to_string();
        if host.is_empty() {
            anyhow::bail!("address {s:?}: missing host");
        }
        let port = parse_port(
            parts
                .next()
                .with_context(|| format!("address {s:?}: missing port"))?,
        )?;
        let port2 = match parts.next() {
            Some(p) => parse_port(p)?,
            None => port,
        };
        if parts.next().is_some() {
            anyhow::bail!("address {s:?}: expected host:port[:access_port]");
        }
        Ok(NetAddress { host, port, port2 })
    }
}

fn parse_port(s: &str) -> anyhow::Result<u16> {
    let port: u16 = s
        .trim()
        .parse()
        .with_context(|| format!("invalid port {s:?}"))?;
    if port == 0 {
        anyhow::bail!("port must be 1-65535");
    }
    Ok(port)
}

/// Parse an access-port range written `min-max`. The range is exclusive of
/// both bounds and must contain at least one usable port.
pub fn parse_port_range(s: &str) -> anyhow::Result<(u16, u16)> {
    let (min, max) = s
        .trim()
        .split_once('-')
        .with_context(|| format!("port range {s:?}: expected min-max"))?;
    let min = parse_port(min)?;
    let max = parse_port(max)?;
    if max.saturating_sub(min) < 2 {
        anyhow::bail!("port range {s:?} has no usable port (bounds are exclusive)");
    }
    Ok((min, max))
}

/// Relay-side configuration, owned by the tunnel registry for the process
/// lifetime.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub key: String,
    pub port: u16,
    pub min_access_port: u16,
    pub max_access_port: u16,
}

impl ServerConfig {
    pub fn new(
        key: impl Into<String>,
        port: u16,
        min_access_port: u16,
        max_access_port: u16,
    ) -> anyhow::Result<Self> {
        let key = key.into().trim().to_string();
        if key.is_empty() {
            anyhow::bail!("server: key is required");
        }
        if port == 0 {
            anyhow::bail!("server: listen port is required");
        }
        if max_access_port.saturating_sub(min_access_port) < 2 {
            anyhow::bail!("server: access-port range has no usable port");
        }
        Ok(ServerConfig {
            key,
            port,
            min_access_port,
            max_access_port,
        })
    }

    /// Whether an access port lies strictly inside the allowed range.
    pub fn port_in_range(&self, port: u32) -> bool {
        port > u32::from(self.min_access_port) && port < u32::from(self.max_access_port)
    }
}

/// Client-side configuration, owned by the tunnel maintainer for the
/// process lifetime.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub key: String,
    pub server_addr: NetAddress,
    pub locals: Vec<NetAddress>,
    pub tunnel_count: usize,
}

impl ClientConfig {
    pub fn new(
        key: impl Into<String>,
        server_addr: NetAddress,
        locals: Vec<NetAddress>,
        tunnel_count: usize,
    ) -> anyhow::Result<Self> {
        let key = key.into().trim().to_string();
        if key.is_empty() {
            anyhow::bail!("client: key is required");
        }
        if locals.is_empty() {
            anyhow::bail!("client: at least one local mapping is required");
        }
        Ok(ClientConfig {
            key,
            server_addr,
            locals,
            tunnel_count: tunnel_count.clamp(MIN_TUNNEL_COUNT, MAX_TUNNEL_COUNT),
        })
    }

    /// The mapping advertised under `access_port`, if any.
    pub fn local(&self, access_port: u32) -> Option<&NetAddress> {
        self.locals
            .iter()
            .find(|a| u32::from(a.port2) == access_port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

/// On-disk configuration: `[logging]` plus a `[server]` and/or `[client]`
/// section, in TOML or YAML by extension.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub logging: LoggingConfig,
    pub server: Option<ServerSection>,
    pub client: Option<ClientSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub key: String,
    pub port: Option<u16>,
    pub access_port_range: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub key: String,
    pub server_addr: String,
    pub locals: Vec<String>,
    pub tunnel_count: Option<usize>,
}

/// Flag > `PIERCE_CONFIG` env > `./pierce.{toml,yaml,yml}`. `None` means
/// flags alone must carry the configuration.
pub fn resolve_config_path(flag: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(p) = flag {
        return Some(p);
    }
    if let Some(p) = std::env::var_os("PIERCE_CONFIG") {
        if !p.is_empty() {
            return Some(PathBuf::from(p));
        }
    }
    ["pierce.toml", "pierce.yaml", "pierce.yml"]
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
}

pub fn load_file(path: &Path) -> anyhow::Result<FileConfig> {
    let data = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "toml" => toml::from_str(&data).with_context(|| format!("parse toml {}", path.display())),
        "yaml" | "yml" => {
            serde_yaml::from_str(&data).with_context(|| format!("parse yaml {}", path.display()))
        }
        _ => anyhow::bail!(
            "config: unsupported extension {ext:?} (expected .toml or .yaml/.yml)"
        ),
    }
}

/// CLI flag values that override the file sections.
#[derive(Debug, Clone, Default)]
pub struct ServerOverrides {
    pub key: Option<String>,
    pub port: Option<u16>,
    pub access_ports: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ClientOverrides {
    pub key: Option<String>,
    pub server_addr: Option<String>,
    pub locals: Vec<String>,
    pub tunnel_count: Option<usize>,
}

pub fn server_config(
    section: Option<ServerSection>,
    overrides: ServerOverrides,
) -> anyhow::Result<ServerConfig> {
    let section = section.unwrap_or_default();
    let key = overrides.key.unwrap_or(section.key);
    let port = overrides
        .port
        .or(section.port)
        .context("server: listen port is required (--port or [server] port)")?;
    let range = match overrides.access_ports {
        Some(r) => r,
        None => section.access_port_range,
    };
    if range.trim().is_empty() {
        anyhow::bail!("server: access-port range is required (--access-ports or [server] access_port_range)");
    }
    let (min, max) = parse_port_range(&range)?;
    ServerConfig::new(key, port, min, max)
}

pub fn client_config(
    section: Option<ClientSection>,
    overrides: ClientOverrides,
) -> anyhow::Result<ClientConfig> {
    let section = section.unwrap_or_default();
    let key = overrides.key.unwrap_or(section.key);
    let server_addr = match overrides.server_addr {
        Some(a) => a,
        None => section.server_addr,
    };
    if server_addr.trim().is_empty() {
        anyhow::bail!("client: relay address is required (--server or [client] server_addr)");
    }
    let server_addr: NetAddress = server_addr.parse()?;

    let raw_locals = if overrides.locals.is_empty() {
        section.locals
    } else {
        overrides.locals
    };
    let locals = raw_locals
        .iter()
        .map(|s| s.parse::<NetAddress>())
        .collect::<anyhow::Result<Vec<_>>>()?;

    let tunnel_count = overrides
        .tunnel_count
        .or(section.tunnel_count)
        .unwrap_or(MIN_TUNNEL_COUNT);
    ClientConfig::new(key, server_addr, locals, tunnel_count)
}
