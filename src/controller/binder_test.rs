//! Tests for the resource binder
//!
//! Covers listener shapes per protocol kind, the Shadowsocks-Plugin listener
//! pair, credential derivation and relay bindings.

#[cfg(test)]
mod tests {
    use super::super::binder::*;
    use super::super::tags::{node_tag, relay_tag, Tag};
    use crate::api::{
        CertMode, Fallback, NameServer, NodeDescriptor, NodeType, RelayNodeDescriptor, Transport,
        UserRecord,
    };
    use crate::config::{ControllerConfig, DnsSettings};
    use crate::engine::{
        Account, CipherMethod, InboundProtocol, OutboundProtocol, Security,
    };
    use crate::error::Error;

    fn user(uid: u32) -> UserRecord {
        UserRecord {
            uid,
            email: format!("user{}@example.com", uid),
            passwd: "0123456789abcdef0123456789abcdef".to_string(),
            speed_limit: 1000,
            device_limit: 3,
            uuid: format!("00000000-0000-0000-0000-00000000000{}", uid),
        }
    }

    fn shadowsocks(kind: NodeType, method: &str) -> NodeDescriptor {
        let mut node = NodeDescriptor::new(kind, 8388, 4);
        node.cipher_method = method.to_string();
        node
    }

    #[test]
    fn test_vmess_node_binds_listener_and_direct_outbound() {
        let mut node = NodeDescriptor::new(NodeType::Vmess, 443, 7);
        node.transport = Transport::Ws;
        node.path = "/ws".to_string();
        node.enable_tls = true;
        node.cert_mode = CertMode::Dns;
        node.cert_domain = "node.example.com".to_string();
        let tag = node_tag(&node);

        let resources = bind_node(&node, &tag, &ControllerConfig::default()).unwrap();
        assert_eq!(resources.inbounds.len(), 1);
        assert_eq!(resources.outbounds.len(), 1);

        let inbound = &resources.inbounds[0];
        assert_eq!(inbound.tag, tag);
        assert_eq!(inbound.listen, "0.0.0.0");
        assert_eq!(inbound.port, 443);
        assert_eq!(inbound.protocol, InboundProtocol::Vmess);
        assert_eq!(inbound.stream.transport, Transport::Ws);
        assert_eq!(inbound.stream.path, "/ws");
        assert!(matches!(
            inbound.stream.security,
            Security::Tls { ref server_name, cert_mode: CertMode::Dns, .. } if server_name == "node.example.com"
        ));

        let outbound = &resources.outbounds[0];
        assert_eq!(outbound.tag, tag);
        assert_eq!(outbound.send_through.as_deref(), Some("0.0.0.0"));
        assert_eq!(
            outbound.protocol,
            OutboundProtocol::Freedom {
                domain_strategy: "AsIs".to_string()
            }
        );
    }

    #[test]
    fn test_descriptor_addresses_override_defaults() {
        let mut node = NodeDescriptor::new(NodeType::Trojan, 443, 1);
        node.listen_ip = "::".to_string();
        node.send_ip = "198.51.100.7".to_string();
        node.domain_strategy = "UseIPv4".to_string();
        let resources = bind_node(&node, &node_tag(&node), &ControllerConfig::default()).unwrap();
        assert_eq!(resources.inbounds[0].listen, "::");
        assert_eq!(
            resources.outbounds[0].send_through.as_deref(),
            Some("198.51.100.7")
        );
        assert_eq!(
            resources.outbounds[0].protocol,
            OutboundProtocol::Freedom {
                domain_strategy: "UseIPv4".to_string()
            }
        );
    }

    #[test]
    fn test_fallbacks_only_when_enabled() {
        let mut node = NodeDescriptor::new(NodeType::Vless, 443, 2);
        node.fallbacks = vec![Fallback {
            dest: "80".to_string(),
            ..Default::default()
        }];
        let tag = node_tag(&node);
        let defaults = ControllerConfig::default();

        let resources = bind_node(&node, &tag, &defaults).unwrap();
        assert_eq!(
            resources.inbounds[0].protocol,
            InboundProtocol::Vless { fallbacks: vec![] }
        );

        node.enable_fallback = true;
        let resources = bind_node(&node, &tag, &defaults).unwrap();
        assert!(matches!(
            &resources.inbounds[0].protocol,
            InboundProtocol::Vless { fallbacks } if fallbacks.len() == 1
        ));
    }

    #[test]
    fn test_shadowsocks_plugin_binds_listener_pair() {
        let mut node = shadowsocks(NodeType::ShadowsocksPlugin, "aes-256-gcm");
        node.transport = Transport::Ws;
        node.enable_tls = true;
        let tag = node_tag(&node);

        let resources = bind_node(&node, &tag, &ControllerConfig::default()).unwrap();
        assert_eq!(resources.inbounds.len(), 2);
        assert_eq!(resources.outbounds.len(), 2);

        let primary = &resources.inbounds[0];
        assert_eq!(primary.tag, tag);
        assert_eq!(primary.port, 8388);
        assert_eq!(primary.stream.transport, Transport::Tcp);
        assert_eq!(primary.stream.security, Security::None);
        assert!(matches!(primary.protocol, InboundProtocol::Shadowsocks { .. }));

        let secondary = &resources.inbounds[1];
        assert_eq!(
            secondary.tag.as_str(),
            "dokodemo-door_Shadowsocks-Plugin_8388_4+1"
        );
        assert_eq!(secondary.port, 8389);
        assert_eq!(secondary.stream.transport, Transport::Ws);
        assert!(matches!(secondary.stream.security, Security::Tls { .. }));
        assert_eq!(
            secondary.protocol,
            InboundProtocol::DokodemoDoor {
                address: "127.0.0.1".to_string(),
                port: 8388
            }
        );
        assert_eq!(resources.outbounds[1].tag, secondary.tag);

        assert_eq!(
            node_resource_tags(&node, &tag),
            vec![tag.clone(), secondary.tag.clone()]
        );
    }

    #[test]
    fn test_plugin_on_last_port_is_invalid() {
        let mut node = shadowsocks(NodeType::ShadowsocksPlugin, "aes-128-gcm");
        node.port = u16::MAX;
        let err = bind_node(&node, &node_tag(&node), &ControllerConfig::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidDescriptor(_)));
    }

    #[test]
    fn test_required_fields_are_enforced() {
        let node = shadowsocks(NodeType::Shadowsocks, "");
        let err = NodeProtocol::from_descriptor(&node).unwrap_err();
        assert!(matches!(err, Error::MissingField { field: "cipher_method", .. }));

        let node = shadowsocks(NodeType::Shadowsocks, "2022-blake3-aes-128-gcm");
        let err = NodeProtocol::from_descriptor(&node).unwrap_err();
        assert!(matches!(err, Error::MissingField { field: "server_key", .. }));

        let node = NodeDescriptor::new(NodeType::DokodemoDoor, 10000, 1);
        let err = bind_node(&node, &node_tag(&node), &ControllerConfig::default()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedProtocol(_)));
    }

    #[test]
    fn test_credentials_per_protocol() {
        let node_tag = Tag::new("node");
        let u = user(1);

        let vmess = bind_credential(&NodeProtocol::Vmess { alter_id: 2 }, &node_tag, &u).unwrap();
        assert_eq!(vmess.tag.as_str(), "node|user1@example.com|1");
        assert_eq!(
            vmess.account,
            Account::Vmess {
                uuid: u.uuid.clone(),
                alter_id: 2
            }
        );

        let trojan = bind_credential(&NodeProtocol::Trojan, &node_tag, &u).unwrap();
        assert_eq!(
            trojan.account,
            Account::Trojan {
                password: u.uuid.clone()
            }
        );

        let mut no_uuid = u.clone();
        no_uuid.uuid.clear();
        let err = bind_credential(
            &NodeProtocol::Vless {
                flow: String::new(),
            },
            &node_tag,
            &no_uuid,
        )
        .unwrap_err();
        assert!(matches!(err, Error::MissingField { field: "uuid", .. }));
    }

    #[test]
    fn test_shadowsocks_credentials() {
        let node_tag = Tag::new("node");
        let u = user(1);

        let plain = NodeProtocol::from_descriptor(&shadowsocks(NodeType::Shadowsocks, "aes-256-gcm"))
            .unwrap();
        let cred = bind_credential(&plain, &node_tag, &u).unwrap();
        assert_eq!(
            cred.account,
            Account::Shadowsocks {
                method: CipherMethod::Aes256Gcm,
                password: u.passwd.clone()
            }
        );

        let mut node = shadowsocks(NodeType::Shadowsocks, "2022-blake3-aes-128-gcm");
        node.server_key = "c2VydmVyLWtleS0xMjM0NQ==".to_string();
        let aead = NodeProtocol::from_descriptor(&node).unwrap();
        let cred = bind_credential(&aead, &node_tag, &u).unwrap();
        assert_eq!(
            cred.account,
            Account::Shadowsocks {
                method: CipherMethod::Aead2022Blake3Aes128Gcm,
                password: "MDEyMzQ1Njc4OWFiY2RlZg==".to_string()
            }
        );
    }

    #[test]
    fn test_derive_user_key() {
        let secret = "0123456789abcdef0123456789abcdef";
        assert_eq!(
            derive_user_key(secret, CipherMethod::Aead2022Blake3Aes128Gcm).unwrap(),
            "MDEyMzQ1Njc4OWFiY2RlZg=="
        );
        assert_eq!(
            derive_user_key(secret, CipherMethod::Aead2022Blake3Aes256Gcm).unwrap(),
            "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY="
        );
        assert!(derive_user_key("short", CipherMethod::Aead2022Blake3Aes128Gcm).is_err());
        assert!(derive_user_key(secret, CipherMethod::Aes128Gcm).is_err());
    }

    #[test]
    fn test_relay_password() {
        let mut relay = RelayNodeDescriptor::new(NodeType::Shadowsocks, "relay.example.com", 443, 9);
        relay.cipher_method = "2022-blake3-aes-128-gcm".to_string();
        relay.server_key = "SERVER".to_string();
        let protocol = RelayProtocol::from_descriptor(&relay).unwrap();
        assert_eq!(
            relay_password(&protocol, &user(1)).unwrap(),
            "SERVER:MDEyMzQ1Njc4OWFiY2RlZg=="
        );

        let mut short = user(2);
        short.passwd = "tiny".to_string();
        assert!(relay_password(&protocol, &short).is_err());

        relay.cipher_method = "chacha20-ietf-poly1305".to_string();
        let protocol = RelayProtocol::from_descriptor(&relay).unwrap();
        assert_eq!(relay_password(&protocol, &short).unwrap(), "tiny");
    }

    #[test]
    fn test_relay_binding() {
        let mut relay = RelayNodeDescriptor::new(NodeType::Vless, "relay.example.com", 443, 9);
        relay.enable_tls = true;
        relay.host = "relay.example.com".to_string();
        relay.fingerprint = "chrome".to_string();
        let protocol = RelayProtocol::from_descriptor(&relay).unwrap();
        let r_tag = relay_tag(&relay);
        let n_tag = Tag::new("Vless_443_2");
        let u = user(5);

        let binding = bind_relay_user(
            &relay,
            &protocol,
            &r_tag,
            &n_tag,
            &u,
            relay_password(&protocol, &u).unwrap(),
            &ControllerConfig::default(),
        )
        .unwrap();

        assert_eq!(binding.outbound.tag.as_str(), "Relay_Vless_443_9_5");
        assert_eq!(binding.user_tag.as_str(), "Vless_443_2|user5@example.com|5");
        assert!(matches!(
            &binding.outbound.protocol,
            OutboundProtocol::Vless { address, port: 443, uuid, .. }
                if address == "relay.example.com" && *uuid == u.uuid
        ));
        let stream = binding.outbound.stream.unwrap();
        assert!(matches!(
            stream.security,
            Security::Tls { ref fingerprint, .. } if fingerprint == "chrome"
        ));
    }

    #[test]
    fn test_relay_rejects_pseudo_protocols() {
        let relay = RelayNodeDescriptor::new(NodeType::ShadowsocksPlugin, "relay.example.com", 443, 9);
        assert!(matches!(
            RelayProtocol::from_descriptor(&relay),
            Err(Error::UnsupportedProtocol(_))
        ));

        let relay = RelayNodeDescriptor::new(NodeType::Trojan, "", 443, 9);
        assert!(matches!(
            RelayProtocol::from_descriptor(&relay),
            Err(Error::MissingField { field: "address", .. })
        ));
    }

    #[test]
    fn test_limits() {
        let n_tag = Tag::new("node");
        let users = vec![user(1), user(2)];
        let limits = bind_limits(&n_tag, &users);
        assert_eq!(limits.len(), 2);
        assert_eq!(limits[1].uid, 2);
        assert_eq!(limits[1].speed_limit, 1000);
        assert_eq!(limits[1].device_limit, 3);
        assert_eq!(limits[1].tag.as_str(), "node|user2@example.com|2");
    }

    #[test]
    fn test_dns_keeps_local_servers_and_appends_remote() {
        let local = DnsSettings {
            servers: vec!["1.1.1.1".to_string()],
            query_strategy: Some("UseIPv4".to_string()),
            ..Default::default()
        };
        let mut node = NodeDescriptor::new(NodeType::Vmess, 443, 7);
        node.name_servers = vec![NameServer {
            address: "8.8.8.8".to_string(),
            domains: vec!["geosite:google".to_string()],
            ..Default::default()
        }];

        let dns = bind_dns(&local, &node);
        let addresses: Vec<&str> = dns.servers.iter().map(|s| s.address.as_str()).collect();
        assert_eq!(addresses, vec!["1.1.1.1", "8.8.8.8"]);
        assert_eq!(dns.servers[1].domains, vec!["geosite:google"]);
        assert_eq!(dns.query_strategy.as_deref(), Some("UseIPv4"));
    }
}
