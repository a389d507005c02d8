//! voxgate - answer phone calls with an LLM
//!
//! A SIP endpoint that routes each call to a device persona, listens through
//! an audio fork, and answers through a query bridge around the LLM CLI.

mod bridge;
mod calling;
mod config;
mod conversation;
mod error;
mod fork;
mod notify;
mod sip;
mod speech;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bridge::client::HttpBridgeClient;
use crate::bridge::runner::CliRunner;
use crate::bridge::{
    AskRequest, BridgeSettings, MemorySessionStore, QueryBackend, QueryOptions, QuerySessionBridge,
};
use crate::calling::controller::CallController;
use crate::calling::media::{HttpMediaLayer, MediaLayer};
use crate::calling::routing::DeviceRouter;
use crate::config::{BridgeMode, Config};
use crate::conversation::{voice_line, Collaborators, ConversationEngine, ConversationSettings};
use crate::fork::ForkRegistry;
use crate::notify::{NoopNotifier, Notifier, WebhookNotifier};
use crate::sip::SipServer;
use crate::speech::{HttpSynthesizer, HttpTranscriber};

#[derive(Parser)]
#[command(name = "voxgate")]
#[command(about = "SIP voice gateway for an LLM assistant", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer calls: SIP listener, audio fork listener and query bridge
    Serve,

    /// Run only the query bridge HTTP API
    Bridge {
        /// Listen address (overrides bridge.listen)
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Send one prompt through the query bridge
    Ask {
        /// What the caller said
        prompt: String,

        /// Call UUID to keep a session under
        #[arg(long)]
        call_id: Option<String>,
    },

    /// Print an SDP offer with its video section removed
    StripSdp {
        /// File holding the SDP
        file: PathBuf,
    },

    /// Show the device routing table
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => {
            serve(config).await?;
        }
        Commands::Bridge { listen } => {
            let listen = listen.unwrap_or_else(|| config.bridge.listen.clone());
            run_bridge(&config, &listen).await?;
        }
        Commands::Ask { prompt, call_id } => {
            ask(&config, prompt, call_id).await?;
        }
        Commands::StripSdp { file } => {
            let sdp = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            print!("{}", calling::sdp::strip_video(&sdp));
        }
        Commands::Devices => {
            print_devices(&config);
        }
    }

    Ok(())
}

fn build_bridge(config: &Config) -> Arc<QuerySessionBridge> {
    let runner = CliRunner::new(config.bridge.command.clone(), config.bridge.timeout());
    Arc::new(QuerySessionBridge::new(
        Arc::new(MemorySessionStore::new()),
        Arc::new(runner),
        BridgeSettings {
            max_turns: config.bridge.max_turns,
            model: config.bridge.model.clone(),
        },
    ))
}

fn build_notifier(config: &Config) -> Result<Arc<dyn Notifier>> {
    Ok(match config.notify.webhook_url {
        Some(ref url) => Arc::new(WebhookNotifier::new(
            url,
            Duration::from_secs(config.notify.timeout_secs),
        )?),
        None => Arc::new(NoopNotifier),
    })
}

/// Cancel `shutdown` on Ctrl+C.
fn shutdown_on_ctrl_c(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutting down...");
        shutdown.cancel();
    });
}

async fn serve(config: Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<Result<()>>> = Vec::new();

    let media: Arc<dyn MediaLayer> = Arc::new(
        HttpMediaLayer::new(&config.media.api_url).context("Failed to set up media client")?,
    );
    let forks = Arc::new(ForkRegistry::new(
        &config.fork.public_url,
        config.fork.connect_timeout(),
    ));

    let brain: Arc<dyn QueryBackend> = match config.bridge.mode {
        BridgeMode::Local => {
            let bridge = build_bridge(&config);
            let listener = TcpListener::bind(&config.bridge.listen)
                .await
                .with_context(|| format!("Failed to bind bridge on {}", config.bridge.listen))?;
            tasks.push(tokio::spawn(bridge::server::serve(
                listener,
                bridge.clone(),
                shutdown.clone(),
            )));
            bridge
        }
        BridgeMode::Remote => {
            tracing::info!("Using remote query bridge at {}", config.bridge.url);
            Arc::new(HttpBridgeClient::new(&config.bridge.url, config.bridge.timeout())?)
        }
    };

    let notifier = build_notifier(&config)?;
    let engine = ConversationEngine::new(
        Collaborators {
            media: media.clone(),
            forks: forks.clone(),
            stt: Arc::new(HttpTranscriber::new(config.stt.clone())),
            tts: Arc::new(HttpSynthesizer::new(config.tts.clone())),
            brain,
            notifier: notifier.clone(),
        },
        ConversationSettings::from(&config.conversation),
    );
    let router = DeviceRouter::new(config.devices.clone(), config.default_device.clone());
    tracing::info!("Routing {} device(s)", router.devices().len());
    let controller = Arc::new(CallController::new(
        router,
        media,
        engine,
        notifier,
        &config.dtmf_hooks,
    ));

    let fork_listener = TcpListener::bind(&config.fork.listen)
        .await
        .with_context(|| format!("Failed to bind fork listener on {}", config.fork.listen))?;
    tasks.push(tokio::spawn(fork::server::run(
        fork_listener,
        forks,
        shutdown.clone(),
    )));

    let sip_socket = UdpSocket::bind(&config.sip.bind)
        .await
        .with_context(|| format!("Failed to bind SIP on {}", config.sip.bind))?;
    let sip = Arc::new(SipServer::new(
        sip_socket,
        controller,
        config.sip.public_host.as_deref(),
    )?);
    tasks.push(tokio::spawn(sip.run(shutdown.clone())));

    shutdown_on_ctrl_c(shutdown.clone());
    shutdown.cancelled().await;

    for task in tasks {
        match task.await {
            Ok(Err(e)) => tracing::error!("{:#}", e),
            Err(e) => tracing::error!("Task panicked: {}", e),
            Ok(Ok(())) => {}
        }
    }
    Ok(())
}

async fn run_bridge(config: &Config, listen: &str) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind bridge on {}", listen))?;
    let shutdown = CancellationToken::new();
    shutdown_on_ctrl_c(shutdown.clone());
    bridge::server::serve(listener, build_bridge(config), shutdown).await
}

async fn ask(config: &Config, prompt: String, call_id: Option<String>) -> Result<()> {
    let text = match config.bridge.mode {
        BridgeMode::Local => {
            let bridge = build_bridge(config);
            let opts = QueryOptions {
                call_id,
                device_prompt: None,
            };
            let response = bridge.query(&prompt, &opts).await?;
            tracing::info!(
                "Answered in {} ms (session {:?}, cost {:?})",
                response.duration_ms,
                response.session_id,
                response.cost_usd
            );
            response.text
        }
        BridgeMode::Remote => {
            let client = HttpBridgeClient::new(&config.bridge.url, config.bridge.timeout())?;
            let health = client.health().await?;
            tracing::debug!(
                "Bridge {} ({} active sessions, model {})",
                health.status,
                health.active_session_count,
                health.model
            );
            let response = client
                .ask(AskRequest {
                    prompt,
                    call_id,
                    device_prompt: None,
                })
                .await;
            tracing::info!("Answered in {} ms", response.duration_ms);
            response.response
        }
    };

    println!("{}", text);
    println!();
    println!("Spoken: {}", voice_line::extract(&text));
    Ok(())
}

fn print_devices(config: &Config) {
    let router = DeviceRouter::new(config.devices.clone(), config.default_device.clone());
    println!("{:<12} {:<20} {:<10} PROMPT", "EXTENSION", "NAME", "VOICE");
    for device in router.devices() {
        println!(
            "{:<12} {:<20} {:<10} {}",
            device.id,
            device.name,
            device.voice,
            if device.prompt.is_some() { "yes" } else { "-" }
        );
    }
    let default = router.default_profile();
    println!();
    println!(
        "Unmatched extensions go to '{}' (voice {}){}",
        default.name,
        default.voice,
        if router.devices().iter().any(|d| router.is_default(d)) {
            ", which is also in the table"
        } else {
            ""
        }
    );
}
