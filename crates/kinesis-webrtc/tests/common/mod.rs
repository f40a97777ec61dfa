#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use kinesis_webrtc::{Credentials, MasterConfig, MediaConstraints, ViewerConfig};

pub const CHANNEL_ARN: &str = "arn:aws:kinesisvideo:us-west-2:123456789012:channel/test/1";
pub const REGION: &str = "us-west-2";
pub const WAIT: Duration = Duration::from_secs(5);

pub fn credentials() -> Credentials {
    Credentials::new("AKIDEXAMPLE", "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY")
}

pub fn master_config() -> MasterConfig {
    MasterConfig::new(CHANNEL_ARN, REGION, credentials())
}

pub fn viewer_config() -> ViewerConfig {
    ViewerConfig::new(CHANNEL_ARN, REGION, credentials()).with_media(MediaConstraints::audio_video())
}

/// Fails the test if `future` does not finish within [`WAIT`].
pub async fn within<T>(what: &str, future: impl Future<Output = T>) -> T {
    match timeout(WAIT, future).await {
        Ok(value) => value,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

/// Polls `condition` until it holds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    within(what, async {
        while !condition() {
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await
}

/// Lets queued controller events drain before asserting that nothing
/// happened.
pub async fn settle() {
    sleep(Duration::from_millis(50)).await;
}
