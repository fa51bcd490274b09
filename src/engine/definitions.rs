//! Engine-ready resource definitions produced by the resource binder

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::api::{CertMode, Fallback, NameServer, Transport};
use crate::controller::tags::Tag;
use crate::error::Error;

/// Shadowsocks cipher methods accepted by the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum CipherMethod {
    Aes128Gcm,
    Aes256Gcm,
    Chacha20IetfPoly1305,
    Xchacha20IetfPoly1305,
    None,
    Aead2022Blake3Aes128Gcm,
    Aead2022Blake3Aes256Gcm,
    Aead2022Blake3Chacha20Poly1305,
}

impl CipherMethod {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Aes128Gcm => "aes-128-gcm",
            Self::Aes256Gcm => "aes-256-gcm",
            Self::Chacha20IetfPoly1305 => "chacha20-ietf-poly1305",
            Self::Xchacha20IetfPoly1305 => "xchacha20-ietf-poly1305",
            Self::None => "none",
            Self::Aead2022Blake3Aes128Gcm => "2022-blake3-aes-128-gcm",
            Self::Aead2022Blake3Aes256Gcm => "2022-blake3-aes-256-gcm",
            Self::Aead2022Blake3Chacha20Poly1305 => "2022-blake3-chacha20-poly1305",
        }
    }

    /// Check if this is a Shadowsocks 2022 cipher
    pub const fn is_aead_2022(&self) -> bool {
        matches!(
            self,
            Self::Aead2022Blake3Aes128Gcm
                | Self::Aead2022Blake3Aes256Gcm
                | Self::Aead2022Blake3Chacha20Poly1305
        )
    }

    /// Pre-shared key length in bytes for 2022 ciphers
    pub const fn key_len(&self) -> Option<usize> {
        match self {
            Self::Aead2022Blake3Aes128Gcm => Some(16),
            Self::Aead2022Blake3Aes256Gcm | Self::Aead2022Blake3Chacha20Poly1305 => Some(32),
            _ => None,
        }
    }
}

impl fmt::Display for CipherMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CipherMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aes-128-gcm" => Ok(Self::Aes128Gcm),
            "aes-256-gcm" => Ok(Self::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Ok(Self::Chacha20IetfPoly1305),
            "xchacha20-ietf-poly1305" | "xchacha20-poly1305" => Ok(Self::Xchacha20IetfPoly1305),
            "none" | "plain" => Ok(Self::None),
            "2022-blake3-aes-128-gcm" => Ok(Self::Aead2022Blake3Aes128Gcm),
            "2022-blake3-aes-256-gcm" => Ok(Self::Aead2022Blake3Aes256Gcm),
            "2022-blake3-chacha20-poly1305" => Ok(Self::Aead2022Blake3Chacha20Poly1305),
            other => Err(Error::InvalidDescriptor(format!(
                "unknown cipher method: {}",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Security {
    None,
    Tls {
        server_name: String,
        cert_mode: CertMode,
        reject_unknown_sni: bool,
        allow_insecure: bool,
        fingerprint: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StreamSettings {
    pub transport: Transport,
    pub security: Security,
    pub host: String,
    pub path: String,
    pub service_name: String,
    pub header: Option<serde_json::Value>,
    pub accept_proxy_protocol: bool,
}

impl StreamSettings {
    /// Plain TCP without TLS
    pub fn plain() -> Self {
        Self {
            transport: Transport::Tcp,
            security: Security::None,
            host: String::new(),
            path: String::new(),
            service_name: String::new(),
            header: None,
            accept_proxy_protocol: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum InboundProtocol {
    Vmess,
    Vless {
        fallbacks: Vec<Fallback>,
    },
    Trojan {
        fallbacks: Vec<Fallback>,
    },
    Shadowsocks {
        method: CipherMethod,
        /// Inbound-level key, only for 2022 ciphers
        server_key: Option<String>,
    },
    DokodemoDoor {
        address: String,
        port: u16,
    },
}

/// Listener definition keyed by a node tag
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InboundDefinition {
    pub tag: Tag,
    pub listen: String,
    pub port: u16,
    pub protocol: InboundProtocol,
    pub stream: StreamSettings,
    pub sniffing: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum OutboundProtocol {
    /// Direct egress
    Freedom { domain_strategy: String },
    Vmess {
        address: String,
        port: u16,
        uuid: String,
        alter_id: u16,
    },
    Vless {
        address: String,
        port: u16,
        uuid: String,
        flow: String,
    },
    Trojan {
        address: String,
        port: u16,
        password: String,
    },
    Shadowsocks {
        address: String,
        port: u16,
        method: CipherMethod,
        password: String,
    },
}

/// Upstream definition keyed by a node tag or relay user tag
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OutboundDefinition {
    pub tag: Tag,
    pub send_through: Option<String>,
    pub protocol: OutboundProtocol,
    pub stream: Option<StreamSettings>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Account {
    Vmess { uuid: String, alter_id: u16 },
    Vless { uuid: String, flow: String },
    Trojan { password: String },
    Shadowsocks { method: CipherMethod, password: String },
}

/// Per-user protocol credential keyed by a user tag
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UserCredential {
    pub tag: Tag,
    pub email: String,
    pub account: Account,
}

/// Rate-limiter entry for one user
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UserLimit {
    pub tag: Tag,
    pub uid: u32,
    pub speed_limit: u64,
    pub device_limit: u32,
}

/// Resolver configuration registered with the engine
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DnsConfig {
    pub servers: Vec<NameServer>,
    pub hosts: BTreeMap<String, String>,
    pub client_ip: Option<String>,
    pub tag: Option<String>,
    pub query_strategy: Option<String>,
    pub disable_cache: bool,
    pub disable_fallback: bool,
    pub disable_fallback_if_match: bool,
}

/// Reference to one engine traffic counter and the value read from it
///
/// Resetting through a handle subtracts the read value, so traffic counted
/// after the read survives the reset.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterHandle {
    pub(crate) name: String,
    pub(crate) read: u64,
}

impl CounterHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read(&self) -> u64 {
        self.read
    }
}

/// Cumulative counters for one user tag
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrafficCounters {
    pub upload: u64,
    pub download: u64,
    pub uplink: Option<CounterHandle>,
    pub downlink: Option<CounterHandle>,
}

impl TrafficCounters {
    pub fn is_idle(&self) -> bool {
        self.upload == 0 && self.download == 0
    }

    pub fn handles(&self) -> impl Iterator<Item = &CounterHandle> {
        self.uplink.iter().chain(self.downlink.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_parsing_is_case_insensitive() {
        assert_eq!(
            "2022-BLAKE3-AES-128-GCM".parse::<CipherMethod>().unwrap(),
            CipherMethod::Aead2022Blake3Aes128Gcm
        );
        assert_eq!(
            "chacha20-ietf-poly1305".parse::<CipherMethod>().unwrap(),
            CipherMethod::Chacha20IetfPoly1305
        );
        assert!("rc4-md5".parse::<CipherMethod>().is_err());
    }

    #[test]
    fn test_2022_family() {
        assert!(CipherMethod::Aead2022Blake3Aes256Gcm.is_aead_2022());
        assert_eq!(CipherMethod::Aead2022Blake3Aes128Gcm.key_len(), Some(16));
        assert_eq!(CipherMethod::Aead2022Blake3Chacha20Poly1305.key_len(), Some(32));
        assert!(!CipherMethod::Aes256Gcm.is_aead_2022());
        assert_eq!(CipherMethod::Aes256Gcm.key_len(), None);
    }
}
