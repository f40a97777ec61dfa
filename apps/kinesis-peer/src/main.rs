mod cli;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use kinesis_aws::aws_services;
use kinesis_webrtc::media::MediaDevices;
use kinesis_webrtc::rtc::webrtc_rs::WebRtcPeerConnectionFactory;
use kinesis_webrtc::{
    start_master, start_viewer, MasterConfig, MasterPhase, MasterState, MediaConstraints,
    MediaError, MediaStream, RetryPolicy, SessionServices, ViewerConfig, ViewerPhase, ViewerState,
};

use crate::cli::{ChannelArgs, Cli, Commands};

/// This binary has no capture pipeline; it relays nothing of its own.
struct NoCaptureDevices;

#[async_trait]
impl MediaDevices for NoCaptureDevices {
    async fn get_user_media(
        &self,
        _constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        Err(MediaError::NotFound(
            "kinesis-peer does not capture local media".into(),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.channel.debug)?;
    match cli.command {
        Commands::Master => run_master(cli.channel).await,
        Commands::Viewer { client_id } => run_viewer(cli.channel, client_id).await,
    }
}

fn init_tracing(debug: bool) -> Result<()> {
    let fallback = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| anyhow!(err))
}

fn services(channel: &ChannelArgs, client_id: Option<&str>) -> Result<SessionServices> {
    let peer_connections =
        WebRtcPeerConnectionFactory::new().context("failed to initialise webrtc")?;
    Ok(aws_services(
        &channel.region,
        channel.credentials(),
        client_id,
        RetryPolicy::new(channel.retries),
        Arc::new(peer_connections),
        Arc::new(NoCaptureDevices),
    ))
}

async fn run_master(channel: ChannelArgs) -> Result<()> {
    let config = MasterConfig::new(&channel.channel_arn, &channel.region, channel.credentials())
        .with_media(MediaConstraints::none())
        .with_debug(channel.debug);
    let session = start_master(config, services(&channel, None)?)
        .context("invalid master configuration")?;
    info!(channel_arn = %channel.channel_arn, "master started");

    let outcome = watch_until_interrupted(session.subscribe(), report_master).await;
    session.dispose().await;
    outcome
}

async fn run_viewer(channel: ChannelArgs, client_id: Option<String>) -> Result<()> {
    let mut config = ViewerConfig::new(&channel.channel_arn, &channel.region, channel.credentials())
        .with_debug(channel.debug);
    let client_id = client_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    config = config.with_client_id(&client_id);
    let session = start_viewer(config, services(&channel, Some(&client_id))?)
        .context("invalid viewer configuration")?;
    info!(channel_arn = %channel.channel_arn, client_id = session.client_id(), "viewer started");

    let outcome = watch_until_interrupted(session.subscribe(), report_viewer).await;
    session.dispose().await;
    outcome
}

/// Runs until ctrl-c, the controller stops, or `report` returns an error.
async fn watch_until_interrupted<S: Clone>(
    mut updates: watch::Receiver<S>,
    mut report: impl FnMut(&S, Option<&S>) -> Result<()>,
) -> Result<()> {
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut previous: Option<S> = None;
    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal.context("failed to listen for ctrl-c")?;
                info!("interrupted; shutting down");
                return Ok(());
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    warn!("session stopped");
                    return Ok(());
                }
                let current = updates.borrow_and_update().clone();
                report(&current, previous.as_ref())?;
                previous = Some(current);
            }
        }
    }
}

fn report_master(current: &MasterState, previous: Option<&MasterState>) -> Result<()> {
    if previous.map(|state| state.phase) != Some(current.phase) {
        info!(phase = ?current.phase, "master phase");
    }
    if current.is_open && !previous.is_some_and(|state| state.is_open) {
        info!("signaling channel open");
    }
    let ids = |state: &MasterState| -> Vec<String> {
        state.peers.iter().map(|peer| peer.id.clone()).collect()
    };
    let peers = ids(current);
    if previous.map(ids).as_ref() != Some(&peers) {
        info!(?peers, "active viewers");
    }
    if current.phase == MasterPhase::Failed {
        if let Some(err) = &current.error {
            return Err(anyhow!(err.clone()).context("master failed"));
        }
    }
    Ok(())
}

fn report_viewer(current: &ViewerState, previous: Option<&ViewerState>) -> Result<()> {
    if previous.map(|state| state.phase) != Some(current.phase) {
        info!(phase = ?current.phase, "viewer phase");
    }
    let tracks = |state: &ViewerState| {
        state
            .peer
            .media
            .as_ref()
            .map_or(0, |stream| stream.tracks().len())
    };
    if previous.map(tracks) != Some(tracks(current)) {
        info!(tracks = tracks(current), "remote media");
    }
    if current.phase == ViewerPhase::Failed {
        if let Some(err) = &current.error {
            return Err(anyhow!(err.clone()).context("viewer failed"));
        }
    }
    Ok(())
}
