use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ConfigurationError, DependencyError, ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChannelRole {
    Master,
    Viewer,
}

impl ChannelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelRole::Master => "MASTER",
            ChannelRole::Viewer => "VIEWER",
        }
    }
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRole::Master => f.write_str("master"),
            ChannelRole::Viewer => f.write_str("viewer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChannelProtocol {
    Wss,
    Https,
}

impl ChannelProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelProtocol::Wss => "WSS",
            ChannelProtocol::Https => "HTTPS",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceEndpoint {
    #[serde(rename = "Protocol", default)]
    pub protocol: Option<String>,
    #[serde(rename = "ResourceEndpoint", default)]
    pub resource_endpoint: Option<String>,
}

impl ResourceEndpoint {
    pub fn new(protocol: &str, endpoint: &str) -> Self {
        Self {
            protocol: Some(protocol.to_string()),
            resource_endpoint: Some(endpoint.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GetSignalingChannelEndpointOutput {
    #[serde(rename = "ResourceEndpointList", default)]
    pub resource_endpoint_list: Option<Vec<ResourceEndpoint>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingChannelEndpoints {
    pub wss: String,
    pub https: String,
}

/// Cloud video-channel service.
#[async_trait]
pub trait ChannelService: Send + Sync {
    async fn get_signaling_channel_endpoint(
        &self,
        channel_arn: &str,
        role: ChannelRole,
        protocols: &[ChannelProtocol],
    ) -> Result<GetSignalingChannelEndpointOutput, ServiceError>;

    /// Server time minus local time, in milliseconds.
    fn system_clock_offset_ms(&self) -> i64 {
        0
    }
}

/// Maps the protocol-tagged endpoint list into named slots. Unknown
/// protocols are ignored.
pub fn map_signaling_channel_endpoints(
    output: GetSignalingChannelEndpointOutput,
) -> Result<SignalingChannelEndpoints, DependencyError> {
    let list = output
        .resource_endpoint_list
        .ok_or(DependencyError::ResourceEndpointListMissing)?;

    let mut wss = None;
    let mut https = None;
    for entry in list {
        let (Some(protocol), Some(endpoint)) = (entry.protocol, entry.resource_endpoint) else {
            continue;
        };
        match protocol.to_ascii_uppercase().as_str() {
            "WSS" => wss = Some(endpoint),
            "HTTPS" => https = Some(endpoint),
            other => debug!(protocol = other, "ignoring signaling endpoint"),
        }
    }

    Ok(SignalingChannelEndpoints {
        wss: wss.ok_or(DependencyError::EndpointMissing("WSS"))?,
        https: https.ok_or(DependencyError::EndpointMissing("HTTPS"))?,
    })
}

pub struct SignalingEndpointResolver {
    service: Arc<dyn ChannelService>,
    channel_arn: String,
    role: ChannelRole,
    cancel: CancellationToken,
}

impl SignalingEndpointResolver {
    /// Fails fast on an empty channel ARN.
    pub fn new(
        service: Arc<dyn ChannelService>,
        channel_arn: &str,
        role: ChannelRole,
    ) -> Result<Self, ConfigurationError> {
        if channel_arn.trim().is_empty() {
            return Err(ConfigurationError::ChannelArnMissing);
        }
        Ok(Self {
            service,
            channel_arn: channel_arn.to_string(),
            role,
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
    pub async fn resolve(&self) -> Result<Option<SignalingChannelEndpoints>, DependencyError> {
        let request = self.service.get_signaling_channel_endpoint(
            &self.channel_arn,
            self.role,
            &[ChannelProtocol::Wss, ChannelProtocol::Https],
        );
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(None),
            response = request => response,
        };
        if self.cancel.is_cancelled() {
            return Ok(None);
        }

        let output = response.map_err(|err| {
            warn!(channel_arn = %self.channel_arn, role = %self.role, error = %err, "signaling endpoint request failed");
            DependencyError::Endpoints(err.to_string())
        })?;
        let endpoints = map_signaling_channel_endpoints(output).map_err(|err| {
            warn!(channel_arn = %self.channel_arn, role = %self.role, error = %err, "signaling endpoint response invalid");
            err
        })?;
        debug!(channel_arn = %self.channel_arn, wss = %endpoints.wss, https = %endpoints.https, "resolved signaling endpoints");
        Ok(Some(endpoints))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockChannelService;

    fn output(entries: Vec<ResourceEndpoint>) -> GetSignalingChannelEndpointOutput {
        GetSignalingChannelEndpointOutput {
            resource_endpoint_list: Some(entries),
        }
    }

    #[test]
    fn maps_known_protocols_and_ignores_others() {
        let endpoints = map_signaling_channel_endpoints(output(vec![
            ResourceEndpoint::new("WEBRTC", "webrtc://ignored"),
            ResourceEndpoint::new("HTTPS", "https://h"),
            ResourceEndpoint::default(),
            ResourceEndpoint::new("WSS", "wss://w"),
        ]))
        .expect("mapped");
        assert_eq!(endpoints.wss, "wss://w");
        assert_eq!(endpoints.https, "https://h");
    }

    #[test]
    fn missing_list_is_an_error() {
        let err = map_signaling_channel_endpoints(GetSignalingChannelEndpointOutput::default())
            .expect_err("missing list");
        assert_eq!(err, DependencyError::ResourceEndpointListMissing);
    }

    #[test]
    fn empty_channel_arn_fails_synchronously() {
        let service = Arc::new(MockChannelService::new());
        let err = SignalingEndpointResolver::new(service.clone(), "", ChannelRole::Master)
            .err()
            .expect("configuration error");
        assert_eq!(err, ConfigurationError::ChannelArnMissing);
        assert_eq!(service.calls(), 0);
    }

    #[test]
    fn deserializes_service_shape() {
        let parsed: GetSignalingChannelEndpointOutput = serde_json::from_str(
            r#"{"ResourceEndpointList":[{"Protocol":"WSS","ResourceEndpoint":"wss://w"}]}"#,
        )
        .expect("json");
        assert_eq!(
            parsed.resource_endpoint_list,
            Some(vec![ResourceEndpoint::new("WSS", "wss://w")])
        );
    }

    #[tokio::test]
    async fn resolves_with_requested_role_and_protocols() {
        let service = Arc::new(MockChannelService::new());
        let resolver =
            SignalingEndpointResolver::new(service.clone(), "arn:x", ChannelRole::Viewer)
                .expect("resolver");

        let endpoints = resolver.resolve().await.expect("resolve").expect("live");

        assert_eq!(endpoints.wss, MockChannelService::WSS);
        let requests = service.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "arn:x");
        assert_eq!(requests[0].1, ChannelRole::Viewer);
    }

    #[tokio::test]
    async fn service_failure_becomes_dependency_error() {
        let service = Arc::new(MockChannelService::failing(ServiceError::Transport(
            "boom".into(),
        )));
        let resolver = SignalingEndpointResolver::new(service, "arn:x", ChannelRole::Master)
            .expect("resolver");

        let err = resolver.resolve().await.expect_err("failure");
        assert!(matches!(err, DependencyError::Endpoints(message) if message.contains("boom")));
    }

    #[tokio::test]
    async fn cancelled_resolution_is_discarded() {
        let service = Arc::new(MockChannelService::new());
        let gate = service.hold();
        let resolver = Arc::new(
            SignalingEndpointResolver::new(service.clone(), "arn:x", ChannelRole::Master)
                .expect("resolver"),
        );

        let pending = {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.resolve().await })
        };
        service.wait_for_calls(1).await;
        resolver.cancel();
        gate.release();

        let result = pending.await.expect("join").expect("resolve");
        assert!(result.is_none());
    }
}
