//! Control-plane interface, data model and HTTP client

pub mod client;
pub mod http;
pub mod types;

pub use client::ControlPlane;
pub use http::HttpControlPlane;
pub use types::{
    CertMode, ClientIdentity, DetectionResult, DetectionRule, Fallback, NameServer,
    NodeDescriptor, NodeStatus, NodeType, OnlineUser, RelayNodeDescriptor, RuleSet, Transport,
    UserRecord, UserTraffic,
};
