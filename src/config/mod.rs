//! Rig configuration: the entity list plus the proxy descriptors the
//! commander injects into the fuzzer entity (`connections`,
//! `tcp_redirections`).

use crate::error::{ProxyError, Result};
use serde::de::{self, Deserializer};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

/// Port of an entity as seen by the proxy. `-1` in the YAML file (or a
/// missing `port`) means the entity picks an ephemeral port at runtime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PortBinding {
    Static(u16),
    #[default]
    Dynamic,
}

impl PortBinding {
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            -1 => Some(PortBinding::Dynamic),
            0..=65535 => Some(PortBinding::Static(raw as u16)),
            _ => None,
        }
    }

    pub fn is_dynamic(self) -> bool {
        matches!(self, PortBinding::Dynamic)
    }

    pub fn as_static(self) -> Option<u16> {
        match self {
            PortBinding::Static(port) => Some(port),
            PortBinding::Dynamic => None,
        }
    }
}

impl fmt::Display for PortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortBinding::Static(port) => write!(f, "{port}"),
            PortBinding::Dynamic => f.write_str("dynamic"),
        }
    }
}

impl<'de> Deserialize<'de> for PortBinding {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        PortBinding::from_raw(raw).ok_or_else(|| {
            de::Error::custom(format!("port {raw} out of range (expected -1 or 0..=65535)"))
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
    Fuzzer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct GeneralConfig {
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub log_dir: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub docker_network_name: String,
    #[serde(default)]
    pub subnet: String,
    #[serde(default)]
    pub gateway: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Destination {
    pub ip: String,
    #[serde(default)]
    pub port: PortBinding,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ConnectTo {
    pub ip: String,
    pub port: u16,
}

/// One UDP pairing between entity A and entity B, relayed through four
/// proxy-side ports.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct UdpConnectionConfig {
    #[serde(rename = "entityA_ip")]
    pub entity_a_ip: Ipv4Addr,
    #[serde(rename = "entityA_port", default)]
    pub entity_a_port: PortBinding,
    #[serde(rename = "entityA_proxy_port_recv")]
    pub entity_a_proxy_port_recv: u16,
    #[serde(rename = "entityA_proxy_port_send")]
    pub entity_a_proxy_port_send: u16,
    #[serde(rename = "entityB_ip")]
    pub entity_b_ip: Ipv4Addr,
    #[serde(rename = "entityB_port", default)]
    pub entity_b_port: PortBinding,
    #[serde(rename = "entityB_proxy_port_recv")]
    pub entity_b_proxy_port_recv: u16,
    #[serde(rename = "entityB_proxy_port_send")]
    pub entity_b_proxy_port_send: u16,
}

impl UdpConnectionConfig {
    pub fn proxy_ports(&self) -> [u16; 4] {
        [
            self.entity_a_proxy_port_recv,
            self.entity_a_proxy_port_send,
            self.entity_b_proxy_port_recv,
            self.entity_b_proxy_port_send,
        ]
    }
}

/// Static 1:1 TCP mapping: clients connecting to `proxy_port` are relayed
/// to `server_ip:server_port`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct TcpRedirection {
    pub server_ip: Ipv4Addr,
    pub server_port: u16,
    pub proxy_port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
struct RawEntity {
    role: Role,
    #[serde(default)]
    protocol: Option<Protocol>,
    ip: String,
    #[serde(default)]
    port: PortBinding,
    #[serde(default)]
    fuzzed: bool,
    #[serde(default)]
    binary_path: String,
    #[serde(default)]
    exec_with: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    destinations: Vec<Destination>,
    #[serde(default)]
    connect_to: Option<ConnectTo>,
    #[serde(default)]
    connections: Vec<UdpConnectionConfig>,
    #[serde(default)]
    tcp_redirections: Vec<TcpRedirection>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityConfig {
    pub name: String,
    pub role: Role,
    pub protocol: Option<Protocol>,
    pub ip: String,
    pub port: PortBinding,
    pub fuzzed: bool,
    pub binary_path: String,
    pub exec_with: String,
    pub args: Vec<String>,
    pub destinations: Vec<Destination>,
    pub connect_to: Option<ConnectTo>,
    pub connections: Vec<UdpConnectionConfig>,
    pub tcp_redirections: Vec<TcpRedirection>,
}

impl EntityConfig {
    fn from_raw(name: String, raw: RawEntity) -> Self {
        Self {
            name,
            role: raw.role,
            protocol: raw.protocol,
            ip: raw.ip,
            port: raw.port,
            fuzzed: raw.fuzzed,
            binary_path: raw.binary_path,
            exec_with: raw.exec_with,
            args: raw.args,
            destinations: raw.destinations,
            connect_to: raw.connect_to,
            connections: raw.connections,
            tcp_redirections: raw.tcp_redirections,
        }
    }
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    general: Option<GeneralConfig>,
    #[serde(default)]
    network: Option<NetworkConfig>,
    #[serde(default)]
    entities: serde_yaml::Mapping,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    pub general: GeneralConfig,
    pub network: NetworkConfig,
    pub entities: Vec<EntityConfig>,
}

impl ProxyConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|error| ProxyError::io(format!("reading {}", path.display()), error))?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(text)
            .map_err(|error| ProxyError::config(format!("invalid YAML: {error}")))?;

        let mut entities = Vec::with_capacity(raw.entities.len());
        for (key, value) in raw.entities {
            let name = key
                .as_str()
                .ok_or_else(|| ProxyError::config(format!("entity key {key:?} is not a string")))?
                .to_string();
            let entity: RawEntity = serde_yaml::from_value(value)
                .map_err(|error| ProxyError::config(format!("entity '{name}': {error}")))?;
            entities.push(EntityConfig::from_raw(name, entity));
        }

        Ok(Self {
            general: raw.general.unwrap_or_default(),
            network: raw.network.unwrap_or_default(),
            entities,
        })
    }

    /// Checks the proxy-side descriptors: every proxy port must be non-zero
    /// and used exactly once across UDP connections and TCP redirections.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let mut claim = |port: u16, owner: &str| -> Result<()> {
            if port == 0 {
                return Err(ProxyError::config(format!("{owner}: proxy port 0 is not allowed")));
            }
            if !seen.insert(port) {
                return Err(ProxyError::config(format!(
                    "{owner}: proxy port {port} is used more than once"
                )));
            }
            Ok(())
        };

        for entity in &self.entities {
            for (idx, connection) in entity.connections.iter().enumerate() {
                let owner = format!("entity '{}' connection #{idx}", entity.name);
                for port in connection.proxy_ports() {
                    claim(port, &owner)?;
                }
            }
            for (idx, redirection) in entity.tcp_redirections.iter().enumerate() {
                let owner = format!("entity '{}' tcp redirection #{idx}", entity.name);
                if redirection.server_port == 0 {
                    return Err(ProxyError::config(format!("{owner}: server port 0 is not allowed")));
                }
                claim(redirection.proxy_port, &owner)?;
            }
        }
        Ok(())
    }

    pub fn entities(&self) -> &[EntityConfig] {
        &self.entities
    }

    pub fn entities_at<'a>(&'a self, ip: &'a str) -> impl Iterator<Item = &'a EntityConfig> + 'a {
        self.entities.iter().filter(move |entity| entity.ip == ip)
    }

    pub fn fuzzer(&self) -> Option<&EntityConfig> {
        self.entities
            .iter()
            .find(|entity| entity.role == Role::Fuzzer)
    }

    pub fn entities_with_protocol(
        &self,
        protocol: Protocol,
    ) -> impl Iterator<Item = &EntityConfig> + '_ {
        self.entities
            .iter()
            .filter(move |entity| entity.protocol == Some(protocol))
    }

    pub fn udp_connections(&self) -> Vec<UdpConnectionConfig> {
        self.entities
            .iter()
            .flat_map(|entity| entity.connections.iter().cloned())
            .collect()
    }

    pub fn tcp_redirections(&self) -> Vec<TcpRedirection> {
        self.entities
            .iter()
            .flat_map(|entity| entity.tcp_redirections.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests;
