//! CLI for Bicameral
//!
//! Subcommands:
//! - `serve`: run a broker (WebSocket server over a local `sled` log)
//! - `send`: publish one message as an agent
//! - `listen`: print messages addressed to an agent as they arrive
//! - `history`: show the most recent messages of the log
//! - `sync`: replicate between the local and the remote broker until Ctrl-C
//! - `status`: probe every configured broker

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use bicameral::broker::message::Message;
use bicameral::broker::{Broker, LogBroker};
use bicameral::client::{ConnectionResolver, MessageBus};
use bicameral::config::{Settings, load_config};
use bicameral::persistence::OverflowStore;
use bicameral::sync::SyncDaemon;
use bicameral::transport::{WsConnector, start_websocket_server};
use bicameral::utils::logging;
use bicameral::{Error, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "bicameral", version, about = "Local-first message bus for collaborating agents")]
struct Cli {
    /// Configuration file (default: config/default.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a broker server
    Serve,
    /// Send a message as AGENT
    Send {
        agent: String,
        #[arg(value_name = "TYPE")]
        kind: String,
        content: String,
        /// Recipient agent, or "all"
        #[arg(long, default_value = "all")]
        to: String,
    },
    /// Print incoming messages for AGENT until Ctrl-C
    Listen {
        agent: String,
        /// Only show messages of this type
        #[arg(long = "type", value_name = "TYPE")]
        kind: Option<String>,
    },
    /// Show recent messages, most recent first
    History {
        #[arg(long, default_value_t = 20)]
        count: usize,
    },
    /// Run the sync daemon until Ctrl-C
    Sync,
    /// Check every configured broker
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let result = match load_config(cli.config.as_deref()) {
        Ok(settings) => run(cli.command, settings).await,
        Err(e) => Err(Error::from(e)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, settings: Settings) -> Result<()> {
    match command {
        Command::Serve => run_server(&settings).await,
        Command::Send {
            agent,
            kind,
            content,
            to,
        } => {
            let bus = message_bus(&settings, Some(&agent));
            let id = bus.send(&to, &kind, &content).await?;
            println!("sent {id} to {to}");
            Ok(())
        }
        Command::Listen { agent, kind } => run_listener(&settings, &agent, kind).await,
        Command::History { count } => {
            let bus = message_bus(&settings, None);
            for message in bus.history(count).await? {
                print_message(&message);
            }
            Ok(())
        }
        Command::Sync => run_sync(&settings).await,
        Command::Status => {
            report_status(&settings).await;
            Ok(())
        }
    }
}

fn message_bus(settings: &Settings, agent: Option<&str>) -> MessageBus {
    let mut bus_settings = settings.bus.clone();
    if let Some(agent) = agent {
        bus_settings.agent = agent.to_string();
    }
    let resolver = ConnectionResolver::new(
        settings.endpoints(),
        Arc::new(WsConnector),
        bus_settings.probe_timeout(),
    );
    MessageBus::new(bus_settings, resolver)
}

fn print_message(message: &Message) {
    println!(
        "[{}] {} → {} ({}): {}",
        message.timestamp(),
        message.sender(),
        message.recipient(),
        message.kind(),
        message.content()
    );
}

async fn run_server(settings: &Settings) -> Result<()> {
    let server = &settings.server;
    let broker = Arc::new(Broker::open(&server.data_path)?);
    let listener = TcpListener::bind((server.host.as_str(), server.port)).await?;
    info!(data_path = %server.data_path.display(), "broker log opened");

    tokio::select! {
        _ = start_websocket_server(listener, broker.clone(), server.credential.clone()) => {
            error!("WebSocket server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    broker.persistence().flush()?;
    Ok(())
}

async fn run_listener(settings: &Settings, agent: &str, kind: Option<String>) -> Result<()> {
    let bus = message_bus(settings, Some(agent));
    let retry = settings.bus.poll_interval();

    loop {
        let filter = kind.clone();
        let mut subscription = match bus
            .subscribe(move |m: &Message| filter.as_deref().is_none_or(|k| m.kind() == k))
            .await
        {
            Ok(subscription) => subscription,
            Err(e) if e.is_connection_error() => {
                warn!("cannot subscribe yet: {e}");
                if wait_or_interrupt(retry).await {
                    return Ok(());
                }
                continue;
            }
            Err(e) => return Err(e),
        };
        println!("listening as {agent} (Ctrl-C to stop)");

        loop {
            tokio::select! {
                next = subscription.next() => match next {
                    Ok(Some(message)) => print_message(&message),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("subscription lost: {e}");
                        break;
                    }
                },
                _ = tokio::signal::ctrl_c() => return Ok(()),
            }
        }
    }
}

/// `true` when interrupted.
async fn wait_or_interrupt(delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = tokio::signal::ctrl_c() => true,
    }
}

async fn run_sync(settings: &Settings) -> Result<()> {
    let mut daemon = SyncDaemon::from_settings(settings, Arc::new(WsConnector));
    let stop = daemon.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, stopping sync daemon.");
            stop.stop();
        }
    });

    daemon.run().await;
    Ok(())
}

async fn report_status(settings: &Settings) {
    let log_key = settings.bus.log_key.as_str();

    for endpoint in settings.endpoints() {
        let label = endpoint.to_string();
        let resolver = ConnectionResolver::new(
            vec![endpoint],
            Arc::new(WsConnector),
            settings.bus.probe_timeout(),
        );
        match resolver.resolve().await {
            Ok(conn) => match conn.broker.len(log_key).await {
                Ok(count) => println!("{label}: online ({count} messages)"),
                Err(e) => println!("{label}: online, log unreadable ({e})"),
            },
            Err(_) => println!("{label}: offline"),
        }
    }
    if settings.remote.is_none() {
        println!("remote: not configured (local-only mode)");
    }

    let overflow = OverflowStore::new(&settings.bus.overflow_path);
    match overflow.load() {
        Ok(queued) => println!(
            "overflow {}: {} messages",
            overflow.path().display(),
            queued.len()
        ),
        Err(e) => println!("overflow {}: unreadable ({e})", overflow.path().display()),
    }
}
