use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ConfigurationError, DependencyError, ServiceError};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(rename = "Uris", default)]
    pub uris: Option<Vec<String>>,
    #[serde(rename = "Username", default)]
    pub username: Option<String>,
    #[serde(rename = "Password", default)]
    pub password: Option<String>,
    #[serde(rename = "Ttl", default)]
    pub ttl: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GetIceServerConfigOutput {
    #[serde(rename = "IceServerList", default)]
    pub ice_server_list: Option<Vec<IceServer>>,
}

/// One entry of a peer connection's ICE configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

pub fn stun_url(region: &str) -> String {
    format!("stun:stun.kinesisvideo.{region}.amazonaws.com:443")
}

/// Cloud signaling-config service, addressed through the channel's HTTPS
/// endpoint.
#[async_trait]
pub trait SignalingConfigService: Send + Sync {
    async fn get_ice_server_config(
        &self,
        channel_arn: &str,
        https_endpoint: &str,
    ) -> Result<Option<GetIceServerConfigOutput>, ServiceError>;
}

/// Regional STUN first, then every returned server that has URIs.
pub fn build_ice_servers(
    region: &str,
    response: Option<GetIceServerConfigOutput>,
) -> Result<Vec<IceServerConfig>, DependencyError> {
    let list = response
        .and_then(|output| output.ice_server_list)
        .ok_or(DependencyError::IceServersResponseMissing)?;

    let mut servers = vec![IceServerConfig::stun(stun_url(region))];
    servers.extend(list.into_iter().filter_map(|server| {
        let urls = server.uris.filter(|uris| !uris.is_empty())?;
        Some(IceServerConfig {
            urls,
            username: server.username,
            credential: server.password,
        })
    }));
    Ok(servers)
}

pub struct IceServerResolver {
    service: Arc<dyn SignalingConfigService>,
    channel_arn: String,
    region: String,
    cancel: CancellationToken,
}

impl IceServerResolver {
    pub fn new(
        service: Arc<dyn SignalingConfigService>,
        channel_arn: &str,
        region: &str,
    ) -> Result<Self, ConfigurationError> {
        if channel_arn.trim().is_empty() {
            return Err(ConfigurationError::ChannelArnMissing);
        }
        Ok(Self {
            service,
            channel_arn: channel_arn.to_string(),
            region: region.to_string(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// `Ok(None)` when cancelled before the result arrived.
    pub async fn resolve(
        &self,
        https_endpoint: &str,
    ) -> Result<Option<Vec<IceServerConfig>>, DependencyError> {
        let request = self
            .service
            .get_ice_server_config(&self.channel_arn, https_endpoint);
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(None),
            response = request => response,
        };
        if self.cancel.is_cancelled() {
            return Ok(None);
        }

        let response = response.map_err(|err| {
            warn!(channel_arn = %self.channel_arn, error = %err, "ice server request failed");
            DependencyError::IceServers(err.to_string())
        })?;
        let servers = build_ice_servers(&self.region, response).map_err(|err| {
            warn!(channel_arn = %self.channel_arn, error = %err, "ice server response invalid");
            err
        })?;
        debug!(channel_arn = %self.channel_arn, count = servers.len(), "resolved ice servers");
        Ok(Some(servers))
    }
}
