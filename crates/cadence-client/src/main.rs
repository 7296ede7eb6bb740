use std::sync::Arc;

use anyhow::{Context, Result};
use cadence_core::{Client, HttpResponder};
use cadence_gateway::bootstrap::fetch_gateway;
use cadence_models::Snowflake;
use cadence_voice::{spawn_http_source, spawn_pcm_reader, ItemOutcome, VoiceHandle};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    init_tracing(args.log_json);

    let config = config::Config::load(&args.config)?;
    if config.gateway.token.is_empty() {
        anyhow::bail!("no token configured; set gateway.token or CADENCE_TOKEN");
    }

    let http = reqwest::Client::new();
    let gateway_url = match &config.gateway.url {
        Some(url) => url.clone(),
        None => {
            fetch_gateway(&http, &config.gateway.api_base, &config.gateway.token)
                .await
                .context("gateway url lookup failed")?
                .url
        }
    };

    let responder = Arc::new(HttpResponder::new(http.clone(), config.gateway.api_base.clone()));
    let client = Client::start(config.client_settings(&gateway_url), responder, None);
    let user_id = client.wait_ready().await?;
    tracing::info!(%user_id, "ready");

    if let Some((guild_id, channel_id)) = args.join {
        let voice = client.join_voice(guild_id, channel_id).await?;
        if let Some(source) = args.play.clone() {
            let http = http.clone();
            tokio::spawn(play(voice, http, source, user_id));
        }
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
        }
        _ = client.closed() => {
            tracing::warn!("gateway connection ended");
        }
    }
    client.shutdown().await?;
    Ok(())
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cadence=info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn play(voice: VoiceHandle, http: reqwest::Client, source: String, user_id: Snowflake) {
    let pipeline = voice.pipeline();
    let mut completions = pipeline.subscribe();
    let input = pipeline.input();

    let feeder = if source.starts_with("http://") || source.starts_with("https://") {
        spawn_http_source(http, source.clone(), input, Some(user_id))
    } else {
        match tokio::fs::File::open(&source).await {
            Ok(file) => spawn_pcm_reader(file, input, Some(user_id)),
            Err(e) => {
                tracing::error!(%source, error = %e, "cannot open audio file");
                return;
            }
        }
    };
    pipeline.play();

    match completions.recv().await {
        Ok(done) => match done.outcome {
            ItemOutcome::Finished => tracing::info!(%source, "playback finished"),
            ItemOutcome::Failed(reason) => tracing::warn!(%source, %reason, "playback failed"),
            ItemOutcome::Cancelled => tracing::info!(%source, "playback cancelled"),
        },
        Err(e) => tracing::warn!(error = %e, "completion stream closed"),
    }
    if let Ok(Err(e)) = feeder.await {
        tracing::warn!(%source, error = %e, "audio source error");
    }
}
