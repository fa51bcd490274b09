//! Resource binder
//!
//! Translates control-plane descriptors into engine-ready definitions. The
//! protocol kind is resolved once into a closed enum carrying the fields that
//! kind requires, so a descriptor missing one of them fails here instead of
//! producing a partial resource.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use super::tags::{relay_user_tag, secondary_tag, user_tag, Tag};
use crate::api::{Fallback, NameServer, NodeDescriptor, NodeType, RelayNodeDescriptor, UserRecord};
use crate::config::{ControllerConfig, DnsSettings};
use crate::engine::{
    Account, CipherMethod, DnsConfig, InboundDefinition, InboundProtocol, OutboundDefinition,
    OutboundProtocol, Security, StreamSettings, UserCredential, UserLimit,
};
use crate::error::{Error, Result};

const DEFAULT_DOMAIN_STRATEGY: &str = "AsIs";
const LOOPBACK: &str = "127.0.0.1";

/// Shadowsocks parameters shared by plain and plugin nodes
#[derive(Clone, Debug, PartialEq)]
pub struct ShadowsocksParams {
    pub method: CipherMethod,
    /// Present exactly when `method` is a 2022 cipher
    pub server_key: Option<String>,
}

impl ShadowsocksParams {
    fn parse(kind: NodeType, cipher_method: &str, server_key: &str) -> Result<Self> {
        if cipher_method.is_empty() {
            return Err(Error::MissingField {
                kind: kind.to_string(),
                field: "cipher_method",
            });
        }
        let method: CipherMethod = cipher_method.parse()?;
        let server_key = if method.is_aead_2022() {
            if server_key.is_empty() {
                return Err(Error::MissingField {
                    kind: kind.to_string(),
                    field: "server_key",
                });
            }
            Some(server_key.to_string())
        } else {
            None
        };
        Ok(Self { method, server_key })
    }

    /// Per-user secret installed into the engine
    fn user_password(&self, user: &UserRecord) -> Result<String> {
        if self.method.is_aead_2022() {
            derive_user_key(&user.passwd, self.method)
        } else {
            Ok(user.passwd.clone())
        }
    }
}

/// Protocol kinds a node may serve
#[derive(Clone, Debug, PartialEq)]
pub enum NodeProtocol {
    Vmess { alter_id: u16 },
    Vless { flow: String },
    Trojan,
    Shadowsocks(ShadowsocksParams),
    /// Shadowsocks on the node port plus a pass-through on `port + 1`
    ShadowsocksPlugin(ShadowsocksParams),
}

impl NodeProtocol {
    pub fn from_descriptor(node: &NodeDescriptor) -> Result<Self> {
        match node.node_type {
            NodeType::Vmess => Ok(Self::Vmess {
                alter_id: node.alter_id,
            }),
            NodeType::Vless => Ok(Self::Vless {
                flow: node.flow.clone(),
            }),
            NodeType::Trojan => Ok(Self::Trojan),
            NodeType::Shadowsocks => Ok(Self::Shadowsocks(ShadowsocksParams::parse(
                node.node_type,
                &node.cipher_method,
                &node.server_key,
            )?)),
            NodeType::ShadowsocksPlugin => Ok(Self::ShadowsocksPlugin(
                ShadowsocksParams::parse(node.node_type, &node.cipher_method, &node.server_key)?,
            )),
            // Only ever built as the secondary listener of a plugin node
            NodeType::DokodemoDoor => Err(Error::UnsupportedProtocol(
                node.node_type.to_string(),
            )),
        }
    }
}

/// Protocol kinds a relay upstream may speak
#[derive(Clone, Debug, PartialEq)]
pub enum RelayProtocol {
    Vmess { alter_id: u16 },
    Vless { flow: String },
    Trojan,
    Shadowsocks(ShadowsocksParams),
}

impl RelayProtocol {
    pub fn from_descriptor(relay: &RelayNodeDescriptor) -> Result<Self> {
        if relay.address.is_empty() {
            return Err(Error::MissingField {
                kind: relay.node_type.to_string(),
                field: "address",
            });
        }
        match relay.node_type {
            NodeType::Vmess => Ok(Self::Vmess {
                alter_id: relay.alter_id,
            }),
            NodeType::Vless => Ok(Self::Vless {
                flow: relay.flow.clone(),
            }),
            NodeType::Trojan => Ok(Self::Trojan),
            NodeType::Shadowsocks => Ok(Self::Shadowsocks(ShadowsocksParams::parse(
                relay.node_type,
                &relay.cipher_method,
                &relay.server_key,
            )?)),
            NodeType::ShadowsocksPlugin | NodeType::DokodemoDoor => Err(
                Error::UnsupportedProtocol(format!("{} relay", relay.node_type)),
            ),
        }
    }
}

/// Listener and upstream definitions for one node, in apply order
#[derive(Clone, Debug, PartialEq)]
pub struct NodeResources {
    pub inbounds: Vec<InboundDefinition>,
    pub outbounds: Vec<OutboundDefinition>,
}

/// One user's detour: the outbound and the user tag routed to it
#[derive(Clone, Debug, PartialEq)]
pub struct RelayBinding {
    pub outbound: OutboundDefinition,
    pub user_tag: Tag,
}

/// Derive the Shadowsocks 2022 per-user key from a stored secret.
///
/// The key is the standard base64 of the secret's first `key_len` bytes.
pub fn derive_user_key(passwd: &str, method: CipherMethod) -> Result<String> {
    let key_len = method.key_len().ok_or_else(|| {
        Error::InvalidDescriptor(format!("{} does not use derived user keys", method))
    })?;
    if passwd.len() < key_len {
        return Err(Error::InvalidDescriptor(format!(
            "{} requires a user secret of at least {} bytes, got {}",
            method,
            key_len,
            passwd.len()
        )));
    }
    Ok(STANDARD.encode(&passwd.as_bytes()[..key_len]))
}

/// Engine tags owned by a node: its own tag plus the pass-through tag of a
/// plugin node
pub fn node_resource_tags(node: &NodeDescriptor, node_tag: &Tag) -> Vec<Tag> {
    let mut tags = vec![node_tag.clone()];
    if node.node_type == NodeType::ShadowsocksPlugin {
        tags.push(secondary_tag(node_tag));
    }
    tags
}

fn or_default<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() {
        default
    } else {
        value
    }
}

fn node_stream(node: &NodeDescriptor) -> StreamSettings {
    let security = if node.enable_tls {
        Security::Tls {
            server_name: node.cert_domain.clone(),
            cert_mode: node.cert_mode,
            reject_unknown_sni: node.reject_unknown_sni,
            allow_insecure: false,
            fingerprint: String::new(),
        }
    } else {
        Security::None
    };
    StreamSettings {
        transport: node.transport,
        security,
        host: node.host.clone(),
        path: node.path.clone(),
        service_name: node.service_name.clone(),
        header: node.header.clone(),
        accept_proxy_protocol: node.proxy_protocol,
    }
}

fn node_fallbacks(node: &NodeDescriptor) -> Vec<Fallback> {
    if node.enable_fallback {
        node.fallbacks.clone()
    } else {
        Vec::new()
    }
}

fn freedom(node: &NodeDescriptor, tag: Tag, defaults: &ControllerConfig) -> OutboundDefinition {
    OutboundDefinition {
        tag,
        send_through: Some(or_default(&node.send_ip, &defaults.send_ip).to_string()),
        protocol: OutboundProtocol::Freedom {
            domain_strategy: or_default(&node.domain_strategy, DEFAULT_DOMAIN_STRATEGY)
                .to_string(),
        },
        stream: None,
    }
}

/// Bind a node descriptor to its listener(s) and direct outbound(s)
pub fn bind_node(
    node: &NodeDescriptor,
    node_tag: &Tag,
    defaults: &ControllerConfig,
) -> Result<NodeResources> {
    let protocol = NodeProtocol::from_descriptor(node)?;
    let listen = or_default(&node.listen_ip, &defaults.listen_ip).to_string();

    let inbound = |tag: Tag, port: u16, protocol: InboundProtocol, stream: StreamSettings| {
        InboundDefinition {
            tag,
            listen: listen.clone(),
            port,
            protocol,
            stream,
            sniffing: node.sniffing,
        }
    };

    match protocol {
        NodeProtocol::Vmess { .. } => Ok(NodeResources {
            inbounds: vec![inbound(
                node_tag.clone(),
                node.port,
                InboundProtocol::Vmess,
                node_stream(node),
            )],
            outbounds: vec![freedom(node, node_tag.clone(), defaults)],
        }),
        NodeProtocol::Vless { .. } => Ok(NodeResources {
            inbounds: vec![inbound(
                node_tag.clone(),
                node.port,
                InboundProtocol::Vless {
                    fallbacks: node_fallbacks(node),
                },
                node_stream(node),
            )],
            outbounds: vec![freedom(node, node_tag.clone(), defaults)],
        }),
        NodeProtocol::Trojan => Ok(NodeResources {
            inbounds: vec![inbound(
                node_tag.clone(),
                node.port,
                InboundProtocol::Trojan {
                    fallbacks: node_fallbacks(node),
                },
                node_stream(node),
            )],
            outbounds: vec![freedom(node, node_tag.clone(), defaults)],
        }),
        NodeProtocol::Shadowsocks(params) => Ok(NodeResources {
            inbounds: vec![inbound(
                node_tag.clone(),
                node.port,
                InboundProtocol::Shadowsocks {
                    method: params.method,
                    server_key: params.server_key,
                },
                node_stream(node),
            )],
            outbounds: vec![freedom(node, node_tag.clone(), defaults)],
        }),
        NodeProtocol::ShadowsocksPlugin(params) => {
            let secondary_port = node.port.checked_add(1).ok_or_else(|| {
                Error::InvalidDescriptor(format!(
                    "port {} leaves no room for the pass-through listener",
                    node.port
                ))
            })?;
            let secondary = secondary_tag(node_tag);

            let mut plain = StreamSettings::plain();
            plain.accept_proxy_protocol = node.proxy_protocol;

            Ok(NodeResources {
                inbounds: vec![
                    inbound(
                        node_tag.clone(),
                        node.port,
                        InboundProtocol::Shadowsocks {
                            method: params.method,
                            server_key: params.server_key,
                        },
                        plain,
                    ),
                    inbound(
                        secondary.clone(),
                        secondary_port,
                        InboundProtocol::DokodemoDoor {
                            address: LOOPBACK.to_string(),
                            port: node.port,
                        },
                        node_stream(node),
                    ),
                ],
                outbounds: vec![
                    freedom(node, node_tag.clone(), defaults),
                    freedom(node, secondary, defaults),
                ],
            })
        }
    }
}

fn require<'a>(user: &UserRecord, kind: &str, field: &'static str, value: &'a str) -> Result<&'a str> {
    if value.is_empty() {
        return Err(Error::MissingField {
            kind: format!("{} user {}", kind, user.uid),
            field,
        });
    }
    Ok(value)
}

/// Bind one user to a credential under the node tag
pub fn bind_credential(
    protocol: &NodeProtocol,
    node_tag: &Tag,
    user: &UserRecord,
) -> Result<UserCredential> {
    let account = match protocol {
        NodeProtocol::Vmess { alter_id } => Account::Vmess {
            uuid: require(user, "Vmess", "uuid", &user.uuid)?.to_string(),
            alter_id: *alter_id,
        },
        NodeProtocol::Vless { flow } => Account::Vless {
            uuid: require(user, "Vless", "uuid", &user.uuid)?.to_string(),
            flow: flow.clone(),
        },
        NodeProtocol::Trojan => Account::Trojan {
            password: require(user, "Trojan", "uuid", &user.uuid)?.to_string(),
        },
        NodeProtocol::Shadowsocks(params) | NodeProtocol::ShadowsocksPlugin(params) => {
            require(user, "Shadowsocks", "passwd", &user.passwd)?;
            Account::Shadowsocks {
                method: params.method,
                password: params.user_password(user)?,
            }
        }
    };
    Ok(UserCredential {
        tag: user_tag(node_tag, user),
        email: user.email.clone(),
        account,
    })
}

/// Secret a user presents to the relay upstream.
///
/// 2022 ciphers take `server_key:user_key`; other methods use the stored
/// secret unmodified.
pub fn relay_password(protocol: &RelayProtocol, user: &UserRecord) -> Result<String> {
    match protocol {
        RelayProtocol::Shadowsocks(params) => match &params.server_key {
            Some(server_key) => Ok(format!(
                "{}:{}",
                server_key,
                derive_user_key(&user.passwd, params.method)?
            )),
            None => Ok(user.passwd.clone()),
        },
        _ => Ok(user.passwd.clone()),
    }
}

fn relay_stream(relay: &RelayNodeDescriptor) -> StreamSettings {
    let security = if relay.enable_tls {
        Security::Tls {
            server_name: relay.host.clone(),
            cert_mode: Default::default(),
            reject_unknown_sni: false,
            allow_insecure: relay.allow_insecure,
            fingerprint: relay.fingerprint.clone(),
        }
    } else {
        Security::None
    };
    StreamSettings {
        transport: relay.transport,
        security,
        host: relay.host.clone(),
        path: relay.path.clone(),
        service_name: relay.service_name.clone(),
        header: relay.header.clone(),
        accept_proxy_protocol: false,
    }
}

/// Bind one user's detour outbound and the routing rule feeding it
#[allow(clippy::too_many_arguments)]
pub fn bind_relay_user(
    relay: &RelayNodeDescriptor,
    protocol: &RelayProtocol,
    relay_tag: &Tag,
    node_tag: &Tag,
    user: &UserRecord,
    password: String,
    defaults: &ControllerConfig,
) -> Result<RelayBinding> {
    let address = relay.address.clone();
    let port = relay.port;
    let outbound_protocol = match protocol {
        RelayProtocol::Vmess { alter_id } => OutboundProtocol::Vmess {
            address,
            port,
            uuid: require(user, "Vmess", "uuid", &user.uuid)?.to_string(),
            alter_id: *alter_id,
        },
        RelayProtocol::Vless { flow } => OutboundProtocol::Vless {
            address,
            port,
            uuid: require(user, "Vless", "uuid", &user.uuid)?.to_string(),
            flow: flow.clone(),
        },
        RelayProtocol::Trojan => OutboundProtocol::Trojan {
            address,
            port,
            password: require(user, "Trojan", "uuid", &user.uuid)?.to_string(),
        },
        RelayProtocol::Shadowsocks(params) => OutboundProtocol::Shadowsocks {
            address,
            port,
            method: params.method,
            password,
        },
    };

    Ok(RelayBinding {
        outbound: OutboundDefinition {
            tag: relay_user_tag(relay_tag, user.uid),
            send_through: Some(or_default(&relay.send_ip, &defaults.send_ip).to_string()),
            protocol: outbound_protocol,
            stream: Some(relay_stream(relay)),
        },
        user_tag: user_tag(node_tag, user),
    })
}

pub fn bind_limit(node_tag: &Tag, user: &UserRecord) -> UserLimit {
    UserLimit {
        tag: user_tag(node_tag, user),
        uid: user.uid,
        speed_limit: user.speed_limit,
        device_limit: user.device_limit,
    }
}

pub fn bind_limits<'a>(
    node_tag: &Tag,
    users: impl IntoIterator<Item = &'a UserRecord>,
) -> Vec<UserLimit> {
    users.into_iter().map(|u| bind_limit(node_tag, u)).collect()
}

/// Local resolver settings with the node's remote name servers appended
pub fn bind_dns(local: &DnsSettings, node: &NodeDescriptor) -> DnsConfig {
    let servers = local
        .servers
        .iter()
        .map(|address| NameServer {
            address: address.clone(),
            ..Default::default()
        })
        .chain(node.name_servers.iter().cloned())
        .collect();
    DnsConfig {
        servers,
        hosts: local.hosts.clone(),
        client_ip: local.client_ip.clone(),
        tag: local.tag.clone(),
        query_strategy: local.query_strategy.clone(),
        disable_cache: local.disable_cache,
        disable_fallback: local.disable_fallback,
        disable_fallback_if_match: local.disable_fallback_if_match,
    }
}
