/*!
 * Mailbox CLI
 *
 * `mailbox run <agent-id>` starts a long-running mailbox service for an
 * agent: connects to the log server, recovers any pending messages left
 * by a prior crashed incarnation, then consumes new messages until
 * Ctrl+C. `mailbox send <sender> <recipient>` is a one-shot producer
 * for scripting and manual testing.
 *
 * Both subcommands share the same Redis connection flags; `run` also
 * exposes `/health`, `/ready` and `/metrics` over HTTP for operators.
 */

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::signal;
use tracing::info;

use mailbox_core::{MailboxConfig, MailboxMessage, MailboxService};

#[derive(Parser, Debug)]
#[command(author, version, about = "Durable inter-agent mailbox over a Redis-streams log", long_about = None)]
struct Cli {
    /// Redis host
    #[arg(long, global = true, default_value = "localhost")]
    redis_host: String,

    /// Redis port
    #[arg(long, global = true, default_value_t = 6379)]
    redis_port: u16,

    /// Redis password
    #[arg(long, global = true)]
    redis_password: Option<String>,

    /// Redis logical database index
    #[arg(long, global = true, default_value_t = 0)]
    redis_db: i64,

    /// Prefix prepended to every inbox stream key
    #[arg(long, global = true, default_value = "beast:mailbox")]
    stream_prefix: String,

    /// Emit debug-level logs
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a mailbox service, consuming messages until Ctrl+C.
    Run {
        /// Agent identifier for this instance
        agent_id: String,

        /// Maximum approximate length of the inbox stream
        #[arg(long, default_value_t = 1000)]
        maxlen: usize,

        /// Seconds between consumer-loop poll cycles
        #[arg(long, default_value_t = 2.0)]
        poll_interval: f64,

        /// Print every received message to the log instead of discarding it
        #[arg(long)]
        echo: bool,

        /// Skip pending-message recovery on startup
        #[arg(long)]
        no_recovery: bool,

        /// Port to serve /health, /ready and /metrics on
        #[arg(long, default_value_t = 8090)]
        health_port: u16,
    },
    /// Send a single message and exit.
    Send {
        /// Sender agent id
        sender: String,

        /// Recipient agent id
        recipient: String,

        /// Plain-text message body, wrapped as `{"message": ...}`
        #[arg(long, default_value = "hello")]
        message: String,

        /// JSON object payload; overrides --message when set
        #[arg(long)]
        json: Option<String>,

        /// Message classification
        #[arg(long, default_value = "direct_message")]
        message_type: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    mailbox_common::init_tracing();

    let cli = Cli::parse();

    let config = MailboxConfig {
        host: cli.redis_host,
        port: cli.redis_port,
        password: cli.redis_password,
        db: cli.redis_db,
        stream_prefix: cli.stream_prefix,
        ..MailboxConfig::default()
    };

    match cli.command {
        Command::Run {
            agent_id,
            maxlen,
            poll_interval,
            echo,
            no_recovery,
            health_port,
        } => {
            let config = MailboxConfig {
                max_stream_length: maxlen,
                poll_interval_secs: poll_interval,
                enable_recovery: !no_recovery,
                ..config
            };
            run(agent_id, config, echo, health_port).await
        }
        Command::Send {
            sender,
            recipient,
            message,
            json,
            message_type,
        } => send(sender, recipient, message, json, message_type, config).await,
    }
}

async fn run(agent_id: String, config: MailboxConfig, echo: bool, health_port: u16) -> Result<()> {
    let mut service = MailboxService::new(agent_id.clone(), config);

    if echo {
        service.register_handler(Arc::new(move |message: MailboxMessage| {
            Box::pin(async move {
                info!(
                    sender = %message.sender,
                    recipient = %message.recipient,
                    message_type = %message.message_type,
                    payload = %serde_json::Value::Object(message.payload.clone()),
                    "mailbox message received"
                );
                Ok::<(), anyhow::Error>(())
            })
        }));
    }

    service.start().await.context("failed to start mailbox service")?;
    info!(agent = %agent_id, "mailbox service is running, press Ctrl+C to stop");

    let ready = Arc::new(AtomicBool::new(true));
    let health_handle = tokio::spawn(serve_health(health_port, ready.clone()));

    signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received, stopping mailbox service");

    ready.store(false, Ordering::SeqCst);
    health_handle.abort();
    service.stop().await;
    info!("mailbox service stopped");
    Ok(())
}

async fn send(
    sender: String,
    recipient: String,
    message: String,
    json: Option<String>,
    message_type: String,
    config: MailboxConfig,
) -> Result<()> {
    let payload: Map<String, Value> = match json {
        Some(raw) => match serde_json::from_str::<Value>(&raw).context("--json must be valid JSON")? {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        },
        None => {
            let mut map = Map::new();
            map.insert("message".to_string(), Value::String(message));
            map
        }
    };

    let mut service = MailboxService::new(sender.clone(), config);
    let message_id = service
        .send_message(recipient.clone(), payload, Some(message_type), None)
        .await
        .context("failed to send message")?;
    service.stop().await;

    info!(sender = %sender, recipient = %recipient, message_id = %message_id, "message sent");
    Ok(())
}

async fn serve_health(port: u16, ready: Arc<AtomicBool>) {
    let app = axum::Router::new()
        .route("/health", axum::routing::get(|| async { "ok" }))
        .route(
            "/ready",
            axum::routing::get(move || {
                let ready = ready.clone();
                async move {
                    if ready.load(Ordering::SeqCst) {
                        (axum::http::StatusCode::OK, "ready")
                    } else {
                        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "stopping")
                    }
                }
            }),
        )
        .route("/metrics", axum::routing::get(metrics_handler));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, "failed to bind health server");
            return;
        }
    };
    info!(addr = %addr, "health server listening");
    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!(error = %err, "health server stopped unexpectedly");
    }
}

async fn metrics_handler() -> Result<String, (axum::http::StatusCode, String)> {
    mailbox_core::metrics::render_metrics()
        .map_err(|e| (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
