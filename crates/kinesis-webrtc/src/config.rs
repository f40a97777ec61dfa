use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
}

/// What the local capture device should provide.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaConstraints {
    #[serde(default)]
    pub audio: bool,
    #[serde(default)]
    pub video: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_constraints: Option<VideoConstraints>,
}

impl MediaConstraints {
    pub fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
            video_constraints: None,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    /// Neither audio nor video requested; no platform call is needed.
    pub fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }
}

fn default_master_media() -> MediaConstraints {
    MediaConstraints::audio_video()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterConfig {
    pub channel_arn: String,
    pub region: String,
    pub credentials: Credentials,
    #[serde(default = "default_master_media")]
    pub media: MediaConstraints,
    #[serde(default)]
    pub debug: bool,
}

impl MasterConfig {
    pub fn new(
        channel_arn: impl Into<String>,
        region: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            channel_arn: channel_arn.into(),
            region: region.into(),
            credentials,
            media: default_master_media(),
            debug: false,
        }
    }

    pub fn with_media(mut self, media: MediaConstraints) -> Self {
        self.media = media;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_channel(&self.channel_arn, &self.region)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewerConfig {
    pub channel_arn: String,
    pub region: String,
    pub credentials: Credentials,
    /// `None` (or no audio and no video) makes the viewer receive-only.
    #[serde(default)]
    pub media: Option<MediaConstraints>,
    /// Generated when absent.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub debug: bool,
}

impl ViewerConfig {
    pub fn new(
        channel_arn: impl Into<String>,
        region: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            channel_arn: channel_arn.into(),
            region: region.into(),
            credentials,
            media: None,
            client_id: None,
            debug: false,
        }
    }

    pub fn with_media(mut self, media: MediaConstraints) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn viewer_only(&self) -> bool {
        self.media.as_ref().map_or(true, MediaConstraints::is_empty)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_channel(&self.channel_arn, &self.region)
    }
}

fn validate_channel(channel_arn: &str, region: &str) -> Result<(), ConfigurationError> {
    if channel_arn.trim().is_empty() {
        return Err(ConfigurationError::ChannelArnMissing);
    }
    if region.trim().is_empty() {
        return Err(ConfigurationError::RegionMissing);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials::new("AKID", "secret").with_session_token("token")
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let rendered = format!("{:?}", creds());
        assert!(rendered.contains("AKID"));
        assert!(!rendered.contains("secret\""));
        assert!(!rendered.contains("token\""));
    }

    #[test]
    fn master_defaults_to_audio_and_video() {
        let config: MasterConfig = serde_json::from_value(serde_json::json!({
            "channel_arn": "arn:x",
            "region": "us-west-2",
            "credentials": {"access_key_id": "a", "secret_access_key": "b"}
        }))
        .expect("config");
        assert_eq!(config.media, MediaConstraints::audio_video());
        assert!(!config.debug);
    }

    #[test]
    fn viewer_without_media_is_viewer_only() {
        let config = ViewerConfig::new("arn:x", "us-west-2", creds());
        assert!(config.viewer_only());
        assert!(config.clone().with_media(MediaConstraints::none()).viewer_only());
        assert!(!config.with_media(MediaConstraints::audio_video()).viewer_only());
    }

    #[test]
    fn empty_channel_arn_is_rejected() {
        let config = MasterConfig::new("  ", "us-west-2", creds());
        assert_eq!(config.validate(), Err(ConfigurationError::ChannelArnMissing));
        let config = ViewerConfig::new("arn:x", "", creds());
        assert_eq!(config.validate(), Err(ConfigurationError::RegionMissing));
    }
}
