//! Control plane clients: Kinesis Video for endpoint discovery and the
//! signaling channel's HTTPS endpoint for ICE server configuration.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, DATE};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use kinesis_webrtc::endpoints::{
    ChannelProtocol, ChannelRole, ChannelService, GetSignalingChannelEndpointOutput,
};
use kinesis_webrtc::ice::{GetIceServerConfigOutput, SignalingConfigService};
use kinesis_webrtc::{Credentials, ServiceError};

use crate::sigv4::{sign_request, SigningParams};

const JSON: &str = "application/json";

pub fn kinesis_video_endpoint(region: &str) -> String {
    format!("https://kinesisvideo.{region}.amazonaws.com")
}

/// Difference between the service clock and ours, learned from response
/// `Date` headers and applied to every signature.
#[derive(Debug, Clone, Default)]
pub struct ClockOffset(Arc<AtomicI64>);

impl ClockOffset {
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    fn observe(&self, response: &Response) {
        let Some(date) = response
            .headers()
            .get(DATE)
            .and_then(|value| value.to_str().ok())
        else {
            return;
        };
        match DateTime::parse_from_rfc2822(date) {
            Ok(server) => {
                let offset = server.with_timezone(&Utc) - Utc::now();
                self.0.store(offset.num_milliseconds(), Ordering::Relaxed);
            }
            Err(err) => debug!(date, error = %err, "ignoring unparseable Date header"),
        }
    }
}

#[derive(Clone)]
struct Signer {
    http: Client,
    region: String,
    credentials: Credentials,
    clock: ClockOffset,
}

impl Signer {
    async fn post_json<T: DeserializeOwned>(&self, url: &str, body: &Value) -> Result<T, ServiceError> {
        let url = Url::parse(url)
            .map_err(|err| ServiceError::Transport(format!("invalid url {url}: {err}")))?;
        let payload =
            serde_json::to_vec(body).map_err(|err| ServiceError::Transport(err.to_string()))?;
        let params = SigningParams::now(&self.credentials, &self.region, self.clock.get());
        let signed = sign_request("POST", &url, &[("content-type", JSON)], &payload, &params)?;

        let mut request = self
            .http
            .post(url.clone())
            .header(CONTENT_TYPE, JSON)
            .header("x-amz-date", &signed.amz_date)
            .header(AUTHORIZATION, &signed.authorization)
            .body(payload);
        if let Some(token) = &signed.security_token {
            request = request.header("x-amz-security-token", token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| ServiceError::Transport(err.to_string()))?;
        self.clock.observe(&response);

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(url = %url, status = status.as_u16(), "kinesis video request rejected");
            return Err(ServiceError::Http {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|err| ServiceError::Decode(err.to_string()))
    }
}

/// `GetSignalingChannelEndpoint` against the regional Kinesis Video API.
#[derive(Clone)]
pub struct KinesisVideoClient {
    signer: Signer,
    endpoint: String,
}

impl KinesisVideoClient {
    pub fn new(region: impl Into<String>, credentials: Credentials) -> Self {
        let region = region.into();
        Self {
            endpoint: kinesis_video_endpoint(&region),
            signer: Signer {
                http: Client::new(),
                region,
                credentials,
                clock: ClockOffset::default(),
            },
        }
    }

    /// Points the client somewhere other than the regional endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    pub fn clock_offset(&self) -> ClockOffset {
        self.signer.clock.clone()
    }

    /// A signaling-config client sharing credentials and clock offset.
    pub fn signaling_channels(&self) -> SignalingChannelsClient {
        SignalingChannelsClient {
            signer: self.signer.clone(),
            client_id: None,
        }
    }
}

#[async_trait]
impl ChannelService for KinesisVideoClient {
    async fn get_signaling_channel_endpoint(
        &self,
        channel_arn: &str,
        role: ChannelRole,
        protocols: &[ChannelProtocol],
    ) -> Result<GetSignalingChannelEndpointOutput, ServiceError> {
        let protocols: Vec<&str> = protocols.iter().map(ChannelProtocol::as_str).collect();
        let body = json!({
            "ChannelARN": channel_arn,
            "SingleMasterChannelEndpointConfiguration": {
                "Protocols": protocols,
                "Role": role.as_str(),
            },
        });
        debug!(channel_arn, role = %role, "requesting signaling channel endpoints");
        self.signer
            .post_json(&format!("{}/getSignalingChannelEndpoint", self.endpoint), &body)
            .await
    }

    fn system_clock_offset_ms(&self) -> i64 {
        self.signer.clock.get()
    }
}

/// `GetIceServerConfig` against a channel's HTTPS endpoint.
#[derive(Clone)]
pub struct SignalingChannelsClient {
    signer: Signer,
    client_id: Option<String>,
}

impl SignalingChannelsClient {
    pub fn new(region: impl Into<String>, credentials: Credentials) -> Self {
        KinesisVideoClient::new(region, credentials).signaling_channels()
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

#[async_trait]
impl SignalingConfigService for SignalingChannelsClient {
    async fn get_ice_server_config(
        &self,
        channel_arn: &str,
        https_endpoint: &str,
    ) -> Result<Option<GetIceServerConfigOutput>, ServiceError> {
        let mut body = json!({
            "ChannelARN": channel_arn,
            "Service": "TURN",
        });
        if let Some(client_id) = &self.client_id {
            body["ClientId"] = Value::from(client_id.as_str());
        }
        debug!(channel_arn, https_endpoint, "requesting ice server config");
        let url = format!(
            "{}/v1/get-ice-server-config",
            https_endpoint.trim_end_matches('/')
        );
        self.signer.post_json(&url, &body).await.map(Some)
    }
}
