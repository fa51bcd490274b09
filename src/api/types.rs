//! Control-plane data model
//!
//! These types describe the authoritative state fetched from the remote
//! control plane and the telemetry reported back to it.
//!
//! # Type Hierarchy
//!
//! - [`NodeDescriptor`] - The managed node's listener configuration
//! - [`RelayNodeDescriptor`] - Detour upstream used when the node relays traffic
//! - [`UserRecord`] - One user's credentials and limits; compared by full value
//! - [`DetectionRule`] - Pattern flagged by the engine's detection feature
//! - Reports: [`NodeStatus`], [`UserTraffic`], [`OnlineUser`], [`DetectionResult`]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Supported proxy protocol kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NodeType {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    /// Shadowsocks tunneled over a plaintext relay: served by a pair of
    /// listeners, the second being a pass-through on `port + 1`
    ShadowsocksPlugin,
    /// Pass-through listener forwarding to a fixed destination
    DokodemoDoor,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Vmess => "Vmess",
            NodeType::Vless => "Vless",
            NodeType::Trojan => "Trojan",
            NodeType::Shadowsocks => "Shadowsocks",
            NodeType::ShadowsocksPlugin => "Shadowsocks-Plugin",
            NodeType::DokodemoDoor => "dokodemo-door",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Vmess" | "V2ray" => Ok(NodeType::Vmess),
            "Vless" => Ok(NodeType::Vless),
            "Trojan" => Ok(NodeType::Trojan),
            "Shadowsocks" => Ok(NodeType::Shadowsocks),
            "Shadowsocks-Plugin" => Ok(NodeType::ShadowsocksPlugin),
            "dokodemo-door" => Ok(NodeType::DokodemoDoor),
            other => Err(Error::UnsupportedProtocol(other.to_string())),
        }
    }
}

impl TryFrom<String> for NodeType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeType> for String {
    fn from(value: NodeType) -> Self {
        value.as_str().to_string()
    }
}

/// Stream transport carried by a listener or upstream
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Ws,
    Grpc,
    H2,
    Quic,
    Kcp,
    HttpUpgrade,
}

/// How the node's TLS certificate is obtained
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertMode {
    #[default]
    #[serde(alias = "")]
    None,
    /// Operator-provided certificate files, never renewed here
    File,
    /// Locally issued self-signed certificate
    #[serde(rename = "self")]
    SelfSigned,
    /// ACME HTTP-01
    Http,
    /// ACME DNS-01
    Dns,
    /// ACME TLS-ALPN-01
    Tls,
}

impl CertMode {
    /// Modes for which the renewal task has work to do
    pub fn is_renewable(&self) -> bool {
        matches!(
            self,
            CertMode::SelfSigned | CertMode::Http | CertMode::Dns | CertMode::Tls
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CertMode::None => "none",
            CertMode::File => "file",
            CertMode::SelfSigned => "self",
            CertMode::Http => "http",
            CertMode::Dns => "dns",
            CertMode::Tls => "tls",
        }
    }
}

/// Fallback destination for Vless/Trojan listeners
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Fallback {
    pub sni: String,
    pub alpn: String,
    pub path: String,
    pub dest: String,
    pub xver: u64,
}

/// Remote name server pushed by the control plane
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NameServer {
    pub address: String,
    pub port: Option<u16>,
    pub domains: Vec<String>,
    pub expect_ips: Vec<String>,
    pub skip_fallback: bool,
}

/// The managed node's listener configuration
///
/// Compared by full structural equality: any difference triggers a
/// teardown-then-rebuild of the node's engine resources.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_type: NodeType,
    pub node_id: u32,
    pub port: u16,
    /// Node-wide speed limit in bytes per second (0 = unlimited)
    #[serde(default)]
    pub speed_limit: u64,
    #[serde(default)]
    pub alter_id: u16,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub header: Option<serde_json::Value>,
    #[serde(default)]
    pub enable_tls: bool,
    #[serde(default)]
    pub tls_type: String,
    #[serde(default)]
    pub cert_mode: CertMode,
    #[serde(default)]
    pub cert_domain: String,
    #[serde(default)]
    pub reject_unknown_sni: bool,
    #[serde(default)]
    pub cipher_method: String,
    #[serde(default)]
    pub server_key: String,
    #[serde(default)]
    pub sniffing: bool,
    #[serde(default)]
    pub flow: String,
    #[serde(default)]
    pub proxy_protocol: bool,
    #[serde(default)]
    pub listen_ip: String,
    #[serde(default)]
    pub relay: bool,
    #[serde(default)]
    pub relay_node_id: u32,
    #[serde(default)]
    pub enable_fallback: bool,
    #[serde(default)]
    pub fallbacks: Vec<Fallback>,
    #[serde(default)]
    pub domain_strategy: String,
    #[serde(default)]
    pub send_ip: String,
    #[serde(default)]
    pub enable_dns: bool,
    #[serde(default)]
    pub name_servers: Vec<NameServer>,
}

impl NodeDescriptor {
    /// Minimal descriptor for a node kind; remaining fields take defaults
    pub fn new(node_type: NodeType, port: u16, node_id: u32) -> Self {
        Self {
            node_type,
            node_id,
            port,
            speed_limit: 0,
            alter_id: 0,
            transport: Transport::Tcp,
            host: String::new(),
            path: String::new(),
            service_name: String::new(),
            header: None,
            enable_tls: false,
            tls_type: String::new(),
            cert_mode: CertMode::None,
            cert_domain: String::new(),
            reject_unknown_sni: false,
            cipher_method: String::new(),
            server_key: String::new(),
            sniffing: false,
            flow: String::new(),
            proxy_protocol: false,
            listen_ip: String::new(),
            relay: false,
            relay_node_id: 0,
            enable_fallback: false,
            fallbacks: Vec::new(),
            domain_strategy: String::new(),
            send_ip: String::new(),
            enable_dns: false,
            name_servers: Vec::new(),
        }
    }
}

/// Detour upstream configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelayNodeDescriptor {
    pub node_type: NodeType,
    pub node_id: u32,
    pub port: u16,
    pub address: String,
    #[serde(default)]
    pub alter_id: u16,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub header: Option<serde_json::Value>,
    #[serde(default)]
    pub enable_tls: bool,
    #[serde(default)]
    pub tls_type: String,
    #[serde(default)]
    pub allow_insecure: bool,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub cipher_method: String,
    #[serde(default)]
    pub server_key: String,
    #[serde(default)]
    pub flow: String,
    #[serde(default)]
    pub domain_strategy: String,
    #[serde(default)]
    pub send_ip: String,
}

impl RelayNodeDescriptor {
    pub fn new(node_type: NodeType, address: impl Into<String>, port: u16, node_id: u32) -> Self {
        Self {
            node_type,
            node_id,
            port,
            address: address.into(),
            alter_id: 0,
            transport: Transport::Tcp,
            host: String::new(),
            path: String::new(),
            service_name: String::new(),
            header: None,
            enable_tls: false,
            tls_type: String::new(),
            allow_insecure: false,
            fingerprint: String::new(),
            cipher_method: String::new(),
            server_key: String::new(),
            flow: String::new(),
            domain_strategy: String::new(),
            send_ip: String::new(),
        }
    }
}

/// One user as known to the control plane
///
/// Identity is the whole record: a change to any field (including the speed
/// limit) makes the user a different element, which the controller applies as
/// a removal followed by an addition. `uid` participates in equality so two
/// distinct users never collapse into one.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserRecord {
    pub uid: u32,
    pub email: String,
    #[serde(default)]
    pub passwd: String,
    #[serde(default)]
    pub speed_limit: u64,
    #[serde(default)]
    pub device_limit: u32,
    #[serde(default)]
    pub uuid: String,
}

/// Traffic pattern flagged by the engine's detection feature
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionRule {
    pub id: u32,
    pub pattern: String,
}

/// Ordered detection rules bound to a node tag
pub type RuleSet = Vec<DetectionRule>;

/// Host vitals, percentages in 0..=100
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub cpu: f64,
    pub mem: f64,
    pub disk: f64,
    pub uptime: u64,
}

/// Per-user traffic since the last confirmed report
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTraffic {
    pub uid: u32,
    pub email: String,
    pub upload: u64,
    pub download: u64,
}

/// A device currently connected as a user
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OnlineUser {
    pub uid: u32,
    pub ip: String,
}

/// A detection rule hit attributed to a user
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DetectionResult {
    pub uid: u32,
    pub rule_id: u32,
}

/// Identity of the control-plane client, safe to log
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClientIdentity {
    pub api_host: String,
    pub node_id: u32,
}
