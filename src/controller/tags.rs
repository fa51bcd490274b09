//! Deterministic resource naming
//!
//! Tags are the only cross-reference between the controller and the engine.
//! Distinct inputs that name distinct engine resources must produce distinct
//! tags; every builder here is pure.

use std::borrow::Borrow;
use std::fmt;

use serde::Serialize;

use crate::api::{NodeDescriptor, RelayNodeDescriptor, UserRecord};

const RELAY_PREFIX: &str = "Relay";
const SECONDARY_PREFIX: &str = "dokodemo-door";

/// Opaque engine resource name
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Tag(String);

impl Tag {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Tag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Tag {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// `{kind}_{port}_{node_id}`, e.g. `Vmess_443_7`
pub fn node_tag(node: &NodeDescriptor) -> Tag {
    Tag(format!("{}_{}_{}", node.node_type, node.port, node.node_id))
}

/// `Relay_{kind}_{port}_{node_id}` of the detour upstream
pub fn relay_tag(relay: &RelayNodeDescriptor) -> Tag {
    Tag(format!(
        "{}_{}_{}_{}",
        RELAY_PREFIX, relay.node_type, relay.port, relay.node_id
    ))
}

/// Tag of the pass-through listener paired with a Shadowsocks-Plugin node
pub fn secondary_tag(node_tag: &Tag) -> Tag {
    Tag(format!("{}_{}+1", SECONDARY_PREFIX, node_tag))
}

/// `{node_tag}|{email}|{uid}`
pub fn user_tag(node_tag: &Tag, user: &UserRecord) -> Tag {
    Tag(format!("{}|{}|{}", node_tag, user.email, user.uid))
}

/// Names the per-user relay outbound; the login is deliberately not part of it
pub fn relay_user_tag(relay_tag: &Tag, uid: u32) -> Tag {
    Tag(format!("{}_{}", relay_tag, uid))
}
