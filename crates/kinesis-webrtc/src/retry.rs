//! Opt-in retry for the two cloud lookups. Controllers never retry on their
//! own; wrap a service in one of these decorators before handing it over.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::warn;

use crate::endpoints::{
    ChannelProtocol, ChannelRole, ChannelService, GetSignalingChannelEndpointOutput,
};
use crate::error::ServiceError;
use crate::ice::{GetIceServerConfigOutput, SignalingConfigService};

const DEFAULT_STEP: Duration = Duration::from_secs(4);

/// Linear backoff: the wait before retry `n` (zero based) is `(n + 1) * step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub step: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            step: DEFAULT_STEP,
        }
    }

    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    pub fn delay(&self, retry: u32) -> Duration {
        self.step.saturating_mul(retry.saturating_add(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Runs `operation` once plus up to `policy.attempts` retries and returns
/// the first success or the last error.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, label: &str, mut operation: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut retry = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if retry < policy.attempts => {
                let delay = policy.delay(retry);
                warn!(operation = label, retry, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                sleep(delay).await;
                retry += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

pub struct RetryingChannelService {
    inner: Arc<dyn ChannelService>,
    policy: RetryPolicy,
}

impl RetryingChannelService {
    pub fn new(inner: Arc<dyn ChannelService>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl ChannelService for RetryingChannelService {
    async fn get_signaling_channel_endpoint(
        &self,
        channel_arn: &str,
        role: ChannelRole,
        protocols: &[ChannelProtocol],
    ) -> Result<GetSignalingChannelEndpointOutput, ServiceError> {
        retry(self.policy, "get_signaling_channel_endpoint", || {
            self.inner
                .get_signaling_channel_endpoint(channel_arn, role, protocols)
        })
        .await
    }

    fn system_clock_offset_ms(&self) -> i64 {
        self.inner.system_clock_offset_ms()
    }
}

pub struct RetryingSignalingConfigService {
    inner: Arc<dyn SignalingConfigService>,
    policy: RetryPolicy,
}

impl RetryingSignalingConfigService {
    pub fn new(inner: Arc<dyn SignalingConfigService>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl SignalingConfigService for RetryingSignalingConfigService {
    async fn get_ice_server_config(
        &self,
        channel_arn: &str,
        https_endpoint: &str,
    ) -> Result<Option<GetIceServerConfigOutput>, ServiceError> {
        retry(self.policy, "get_ice_server_config", || {
            self.inner.get_ice_server_config(channel_arn, https_endpoint)
        })
        .await
    }
}
