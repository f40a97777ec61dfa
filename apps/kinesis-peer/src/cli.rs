use clap::{Args, Parser, Subcommand};

use kinesis_webrtc::Credentials;

#[derive(Parser, Debug)]
#[command(name = "kinesis-peer")]
#[command(about = "Join a Kinesis Video signaling channel as master or viewer")]
pub struct Cli {
    #[command(flatten)]
    pub channel: ChannelArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct ChannelArgs {
    /// Signaling channel ARN
    #[arg(long, env = "KVS_CHANNEL_ARN")]
    pub channel_arn: String,

    #[arg(long, env = "AWS_REGION", default_value = "us-west-2")]
    pub region: String,

    #[arg(long, env = "AWS_ACCESS_KEY_ID")]
    pub access_key_id: String,

    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub secret_access_key: String,

    #[arg(long, env = "AWS_SESSION_TOKEN", hide_env_values = true)]
    pub session_token: Option<String>,

    /// Retries for the endpoint and ICE server lookups
    #[arg(long, default_value_t = 0)]
    pub retries: u32,

    /// Log every signaling and peer event
    #[arg(long)]
    pub debug: bool,
}

impl ChannelArgs {
    pub fn credentials(&self) -> Credentials {
        let credentials = Credentials::new(&self.access_key_id, &self.secret_access_key);
        match &self.session_token {
            Some(token) if !token.is_empty() => credentials.with_session_token(token),
            _ => credentials,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Accept viewers until interrupted
    Master,
    /// Connect to the channel's master and receive its media
    Viewer {
        /// Client id announced to the master (random when omitted)
        #[arg(long)]
        client_id: Option<String>,
    },
}
