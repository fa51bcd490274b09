//! JSON-over-HTTP control-plane client

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument};

use super::client::ControlPlane;
use super::types::{
    ClientIdentity, DetectionResult, NodeDescriptor, NodeStatus, OnlineUser, RelayNodeDescriptor,
    RuleSet, UserRecord, UserTraffic,
};
use crate::config::ApiConfig;
use crate::error::{Error, Result};

/// Control-plane client speaking JSON over HTTP
///
/// GET endpoints live under `{host}/api/v1/node/` and authenticate with the
/// `node_id` and `key` query parameters; reports are POSTed as JSON bodies.
pub struct HttpControlPlane {
    client: Client,
    host: String,
    node_id: u32,
    key: String,
    users_etag: Mutex<Option<String>>,
}

impl HttpControlPlane {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(Error::HttpError)?;

        Ok(Self {
            client,
            host: config.host.trim_end_matches('/').to_string(),
            node_id: config.node_id,
            key: config.key.clone(),
            users_etag: Mutex::new(None),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/api/v1/node/{}", self.host, endpoint)
    }

    fn get(&self, endpoint: &str) -> RequestBuilder {
        self.client
            .get(self.url(endpoint))
            .query(&[("node_id", self.node_id.to_string()), ("key", self.key.clone())])
    }

    fn post<T: Serialize + ?Sized>(&self, endpoint: &str, body: &T) -> RequestBuilder {
        self.client
            .post(self.url(endpoint))
            .query(&[("node_id", self.node_id.to_string()), ("key", self.key.clone())])
            .json(body)
    }

    async fn fetch<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let response = check_status(self.get(endpoint).send().await?).await?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn submit<T: Serialize + ?Sized>(&self, endpoint: &str, body: &T) -> Result<()> {
        check_status(self.post(endpoint, body).send().await?).await?;
        Ok(())
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(Error::ControlPlaneError {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    fn describe(&self) -> ClientIdentity {
        ClientIdentity {
            api_host: self.host.clone(),
            node_id: self.node_id,
        }
    }

    #[instrument(skip(self), fields(node_id = self.node_id))]
    async fn get_node_info(&self) -> Result<NodeDescriptor> {
        self.fetch("info").await
    }

    #[instrument(skip(self), fields(node_id = self.node_id))]
    async fn get_relay_node_info(&self) -> Result<RelayNodeDescriptor> {
        self.fetch("relay").await
    }

    #[instrument(skip(self), fields(node_id = self.node_id))]
    async fn get_user_list(&self) -> Result<Vec<UserRecord>> {
        let etag = self
            .users_etag
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let mut request = self.get("users");
        if let Some(tag) = &etag {
            request = request.header(IF_NONE_MATCH, tag.as_str());
        }

        let response = request.send().await?;
        if response.status() == StatusCode::NOT_MODIFIED {
            debug!("User list not modified");
            return Err(Error::UsersUnchanged);
        }
        let response = check_status(response).await?;

        let new_etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response.bytes().await?;
        let users: Vec<UserRecord> = serde_json::from_slice(&body)?;

        // Only remember the tag once the body parsed, so a bad payload is refetched
        *self
            .users_etag
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = new_etag;
        Ok(users)
    }

    #[instrument(skip(self), fields(node_id = self.node_id))]
    async fn get_node_rule(&self) -> Result<RuleSet> {
        self.fetch("rules").await
    }

    async fn report_node_status(&self, status: &NodeStatus) -> Result<()> {
        self.submit("status", status).await
    }

    async fn report_user_traffic(&self, traffic: &[UserTraffic]) -> Result<()> {
        self.submit("traffic", traffic).await
    }

    async fn report_node_online_users(&self, online: &[OnlineUser]) -> Result<()> {
        self.submit("online", online).await
    }

    async fn report_illegal(&self, detections: &[DetectionResult]) -> Result<()> {
        self.submit("illegal", detections).await
    }
}
