//! Standalone broker process: parse CLI flags, initialize logging, run
//! `ydl_broker::serve` until a shutdown signal arrives.

use std::env;
use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;

use clap::{Arg, Command};
use tracing::info;
use tracing_subscriber::EnvFilter;
use ydl_protocol::DEFAULT_BIND_ADDR;

fn validate_bind_addr(value: &str) -> Result<IpAddr, String> {
    value.parse::<IpAddr>().map_err(|_| "invalid bind address".to_owned())
}

fn validate_port_value(value: &str) -> Result<u16, String> {
    value.parse::<u16>().map_err(|_| "invalid port number".to_owned())
}

#[tokio::main]
async fn main() -> ExitCode {
    let log_level = env::var("RUST_LOG")
        .or_else(|_| env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let matches = Command::new("YDL Broker")
        .version(env!("CARGO_PKG_VERSION"))
        .about("A publish/subscribe message broker")
        .arg(
            Arg::new("bind_addr")
                .help("The address to bind the broker's listening socket to")
                .long("bind-addr")
                .value_parser(validate_bind_addr)
                .default_value(DEFAULT_BIND_ADDR),
        )
        .arg(
            Arg::new("port")
                .help("The TCP port to bind the broker's listening socket to")
                .short('p')
                .long("port")
                .value_parser(validate_port_value)
                .default_value("5001"),
        )
        .get_matches();

    let bind_addr = *matches
        .get_one::<IpAddr>("bind_addr")
        .expect("bind_addr has a default");
    let port = *matches.get_one::<u16>("port").expect("port has a default");
    let addr = SocketAddr::from((bind_addr, port));

    tokio::select! {
        result = ydl_broker::serve(addr) => {
            if let Err(e) = result {
                eprintln!("FATAL: {e}");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        () = shutdown_signal() => {
            info!("shutting down");
            ExitCode::SUCCESS
        }
    }
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C"); },
        _ = terminate => { info!("received SIGTERM"); },
    }
}
