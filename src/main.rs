mod attendd_paths;
mod config;
mod daemon_log;
mod domain;
mod registry;
mod rpc;
mod sessiond;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::AttendanceConfig;
use domain::{AttendanceError, Coordinates, CreateSessionRequest, RedeemRequest};
use serde::Serialize;
use sessiond::rpc_client::{read_port_file, AttendanceClient};
use sessiond::rpc_subscription::{RpcSubscription, SubscriptionEvent};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Git SHA this binary was built from, stamped by build.rs.
pub const BUILD_SHA: &str = env!("ATTENDD_GIT_SHA");

/// Environment variable holding the tracing filter.
const LOG_ENV: &str = "ATTENDD_LOG";

#[derive(Parser)]
#[command(name = "attendd")]
#[command(about = "Live attendance sessions with one-time QR credentials")]
#[command(version)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground
    Serve {
        /// Config file (defaults to ~/.attendd/config.yaml when present)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Check that the daemon is up
    Health,
    /// Start a new attendance session
    Create {
        #[arg(long)]
        owner: String,
        #[arg(long = "class")]
        class_id: String,
        #[arg(long, default_value = "")]
        section: String,
        /// Explicit session id (generated when omitted)
        #[arg(long)]
        session_id: Option<String>,
        /// Geofence center latitude
        #[arg(long, requires = "lng", allow_hyphen_values = true)]
        lat: Option<f64>,
        /// Geofence center longitude
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lng: Option<f64>,
    },
    /// Print a session snapshot
    Show { session_id: String },
    /// End a session (idempotent)
    End { session_id: String },
    /// Issue a fresh one-time credential and print its payload
    Issue { session_id: String },
    /// Redeem a credential payload on behalf of a device
    Redeem {
        session_id: String,
        #[arg(long)]
        payload: String,
        #[arg(long)]
        device: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        ip: Option<String>,
        #[arg(long, requires = "lng", allow_hyphen_values = true)]
        lat: Option<f64>,
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lng: Option<f64>,
    },
    /// Advisory check whether a device may redeem in a session
    Precheck { session_id: String, device: String },
    /// Check whether a credential nonce was already consumed
    Used {
        session_id: String,
        credential_id: String,
    },
    /// Print redemption statistics for a session
    Stats { session_id: String },
    /// List a session's redemptions in commit order
    Devices { session_id: String },
    /// Stream a session's events as JSON lines
    Watch {
        session_id: String,
        /// Replay buffered events after this sequence number
        #[arg(long)]
        since: Option<u64>,
    },
    /// Ask the daemon to stop
    Stop,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn location(lat: Option<f64>, lng: Option<f64>) -> Option<Coordinates> {
    match (lat, lng) {
        (Some(lat), Some(lng)) => Some(Coordinates::new(lat, lng)),
        _ => None,
    }
}

async fn connect() -> Result<AttendanceClient> {
    AttendanceClient::connect().await
}

async fn watch(session_id: &str, since: Option<u64>) -> Result<()> {
    let port_info = read_port_file(&attendd_paths::port_path()?)?;
    let mut subscription = RpcSubscription::connect(port_info, session_id, since).await?;

    if since.is_some() && !subscription.replayed() {
        eprintln!("requested events are no longer buffered; starting from the snapshot");
    }
    eprintln!(
        "watching {} as subscriber {} from #{}",
        session_id,
        subscription.subscriber_id(),
        subscription.subscribed_at()
    );
    match subscription.snapshot() {
        Some(snapshot) => print_json(snapshot)?,
        None => eprintln!("session {} does not exist yet; waiting", session_id),
    }

    loop {
        tokio::select! {
            event = subscription.recv() => match event {
                Some(SubscriptionEvent::Event(envelope)) => {
                    println!("{}", serde_json::to_string(&envelope)?);
                }
                Some(SubscriptionEvent::DaemonStopping) => {
                    eprintln!("daemon stopping");
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                subscription.unsubscribe().await?;
                break;
            }
        }
    }
    Ok(())
}

/// Prints a domain error the way client commands print results.
fn print_domain_error(err: &AttendanceError) -> Result<()> {
    print_json(&serde_json::json!({
        "error": err.reason_code(),
        "kind": err.kind(),
        "status": err.status_code(),
        "message": err.to_string(),
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match run(cli.command).await {
        Ok(()) => Ok(()),
        Err(err) => match err.downcast_ref::<AttendanceError>() {
            Some(domain_err) => {
                print_domain_error(domain_err)?;
                std::process::exit(1);
            }
            None => Err(err),
        },
    }
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Serve { config } => {
            let config = AttendanceConfig::resolve(config.as_deref())
                .context("Failed to load attendd configuration")?;
            sessiond::rpc_server::run_daemon(config).await
        }
        Command::Watch { session_id, since } => watch(&session_id, since).await,
        Command::Health => print_json(&connect().await?.health().await?),
        Command::Create {
            owner,
            class_id,
            section,
            session_id,
            lat,
            lng,
        } => {
            let request = CreateSessionRequest {
                session_id,
                owner_id: owner,
                class_id,
                section,
                geofence_center: location(lat, lng),
            };
            print_json(&connect().await?.create_session(request).await?)
        }
        Command::Show { session_id } => {
            print_json(&connect().await?.get_session(&session_id).await?)
        }
        Command::End { session_id } => {
            print_json(&connect().await?.end_session(&session_id).await?)
        }
        Command::Issue { session_id } => {
            print_json(&connect().await?.issue_credential(&session_id).await?)
        }
        Command::Redeem {
            session_id,
            payload,
            device,
            subject,
            ip,
            lat,
            lng,
        } => {
            let request = RedeemRequest {
                session_id,
                credential_payload: payload,
                device_id: device,
                subject_id: subject,
                reported_ip: ip,
                reported_location: location(lat, lng),
            };
            print_json(&connect().await?.redeem(request).await?)
        }
        Command::Precheck { session_id, device } => {
            print_json(&connect().await?.precheck(&session_id, &device).await?)
        }
        Command::Used {
            session_id,
            credential_id,
        } => {
            let used = connect()
                .await?
                .credential_used(&session_id, &credential_id)
                .await?;
            print_json(&serde_json::json!({ "isUsed": used }))
        }
        Command::Stats { session_id } => {
            print_json(&connect().await?.session_stats(&session_id).await?)
        }
        Command::Devices { session_id } => {
            print_json(&connect().await?.session_devices(&session_id).await?)
        }
        Command::Stop => {
            connect().await?.shutdown().await?;
            eprintln!("attendd stopping");
            Ok(())
        }
    }
}
