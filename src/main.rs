//! realtime-probe - command line probe for the ULMS realtime core
//!
//! Sends single RPC requests over MQTT and follows presence sessions, using
//! the same configuration file as applications embedding the library.

use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use ulms_realtime::config::SdkConfig;
use ulms_realtime::observability::{init_default_logging, metrics};
use ulms_realtime::presence::{ConnectOptions, PresenceSession, SessionEvent, SessionEventKind};
use ulms_realtime::retry::reject_by_timeout;
use ulms_realtime::rpc::{Labels, RpcService};
use ulms_realtime::token::{HttpTokenConfig, HttpTokenProvider, StaticTokenProvider, TokenProvider};
use ulms_realtime::transport::mqtt::MqttClient;
use ulms_realtime::transport::ws::TungsteniteConnector;

type ProbeResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Probe for ULMS realtime services
#[derive(Parser)]
#[command(name = "realtime-probe")]
#[command(about = "Exercise ULMS RPC and presence endpoints from the command line")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Static access token
    #[arg(long, env = "ULMS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Base URL of the token endpoint, used when no static token is given
    #[arg(long, env = "ULMS_TOKEN_URL")]
    token_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one request and print the response
    Rpc {
        /// Inbound topic (responses arrive here)
        #[arg(long)]
        topic_in: String,
        /// Outbound topic (requests are published here)
        #[arg(long)]
        topic_out: String,
        /// Method name
        #[arg(long)]
        method: String,
        /// JSON parameters
        #[arg(long, default_value = "{}")]
        params: String,
        /// Give up after this many milliseconds
        #[arg(long, default_value_t = 10_000)]
        timeout_ms: u64,
        /// `app_label` attached to the request
        #[arg(long)]
        app_label: Option<String>,
    },
    /// Open a presence session and print its events until it ends
    Presence {
        #[arg(long)]
        agent_label: Option<String>,
        #[arg(long)]
        classroom_id: Option<String>,
    },
    /// Validate the configuration file
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting realtime-probe v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match &cli.command {
        Commands::Config { show } => handle_config_command(&config, *show),
        Commands::Rpc {
            topic_in,
            topic_out,
            method,
            params,
            timeout_ms,
            app_label,
        } => {
            let request = RpcRequest {
                topic_in,
                topic_out,
                method,
                params,
                timeout: Duration::from_millis(*timeout_ms),
                app_label: app_label.as_deref(),
            };
            match token_provider(&cli) {
                Ok(tokens) => run_rpc(&config, tokens, request).await,
                Err(e) => Err(e),
            }
        }
        Commands::Presence {
            agent_label,
            classroom_id,
        } => match token_provider(&cli) {
            Ok(tokens) => {
                run_presence(&config, tokens, agent_label.clone(), classroom_id.clone()).await
            }
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    match serde_json::to_string(&metrics().get_metrics()) {
        Ok(snapshot) => info!(metrics = %snapshot, "Probe finished"),
        Err(e) => warn!("Failed to serialize metrics: {}", e),
    }
}

fn load_configuration(config_path: &Option<PathBuf>) -> ProbeResult<SdkConfig> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(SdkConfig::load_from_file(path)?);
    }

    for path_str in ["realtime.toml", "config/realtime.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(SdkConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create realtime.toml".into())
}

fn token_provider(cli: &Cli) -> ProbeResult<Arc<dyn TokenProvider>> {
    if let Some(token) = &cli.token {
        return Ok(Arc::new(StaticTokenProvider::new(token.clone())));
    }
    if let Some(url) = &cli.token_url {
        return Ok(Arc::new(HttpTokenProvider::new(HttpTokenConfig::new(url.clone()))?));
    }
    Err("A token is required: pass --token or --token-url".into())
}

fn handle_config_command(config: &SdkConfig, show: bool) -> ProbeResult<()> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

struct RpcRequest<'a> {
    topic_in: &'a str,
    topic_out: &'a str,
    method: &'a str,
    params: &'a str,
    timeout: Duration,
    app_label: Option<&'a str>,
}

async fn run_rpc(
    config: &SdkConfig,
    tokens: Arc<dyn TokenProvider>,
    request: RpcRequest<'_>,
) -> ProbeResult<()> {
    let params: Value = serde_json::from_str(request.params)?;

    let client = Arc::new(MqttClient::with_backoff(
        config.mqtt.clone(),
        config.backoff.clone(),
        tokens,
    ));
    client.connect().await?;

    let rpc = RpcService::builder(Arc::clone(&client), request.topic_in, request.topic_out)
        .wire_names(config.wire.rpc.clone())
        .build()?;
    if let Some(label) = request.app_label {
        rpc.set_labels(Labels::new().app_label(label));
    }

    let outcome = reject_by_timeout(
        rpc.send(request.method, params),
        request.timeout,
        Some(request.method),
    )
    .await;

    rpc.destroy().await;
    client.disconnect().await?;

    let response = outcome??;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn run_presence(
    config: &SdkConfig,
    tokens: Arc<dyn TokenProvider>,
    agent_label: Option<String>,
    classroom_id: Option<String>,
) -> ProbeResult<()> {
    let section = config
        .presence
        .as_ref()
        .ok_or("The configuration has no [presence] section")?;
    let options = ConnectOptions::new(
        agent_label
            .or_else(|| section.agent_label.clone())
            .ok_or("agent_label is required")?,
        classroom_id
            .or_else(|| section.classroom_id.clone())
            .ok_or("classroom_id is required")?,
    );

    let session = PresenceSession::new(
        section.url.clone(),
        tokens,
        Arc::new(TungsteniteConnector::new()),
        config.wire.presence.clone(),
    );
    session.on(SessionEventKind::Connect, |_| info!("Presence transport connected"));
    session.on(SessionEventKind::Event, |event| {
        if let SessionEvent::Event(frame) = event {
            println!("{frame}");
        }
    });

    session.connect(options).await?;
    let disconnected = session.disconnected();

    tokio::select! {
        reason = disconnected => {
            let reason = reason.unwrap_or_else(|reason| reason);
            warn!(%reason, "Presence session ended");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, disconnecting");
            session.disconnect();
        }
    }

    Ok(())
}
