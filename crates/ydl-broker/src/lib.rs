//! The YDL broker: accepts TCP connections, maintains the channel
//! subscription table, and fans out every published message to the
//! current subscribers of its channel.
//!
//! `serve` is both the standalone server's accept loop and the
//! embeddable routine described in §4.4 — an embedder runs it in its own
//! background task exactly as the teacher embeds `axum::serve` in
//! `server::build_router`'s caller.

pub mod connection;
pub mod table;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

pub use table::Table;

/// The broker's listening socket could not be bound. Fatal at startup,
/// surfaced to whoever embedded `serve` (§6, §7).
#[derive(Debug, thiserror::Error)]
#[error("failed to bind broker listener on {addr}: {source}")]
pub struct BindError {
    addr: SocketAddr,
    #[source]
    source: std::io::Error,
}

/// Accept connections on `addr` forever, routing published messages to
/// subscribers. Individual connection failures are logged and never
/// terminate the server (§4.2).
///
/// Only returns (with `Err`) if the listener cannot be bound.
pub async fn serve(addr: SocketAddr) -> Result<(), BindError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| BindError { addr, source })?;
    info!(%addr, "broker listening");

    let table = Arc::new(Table::new());
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let table = table.clone();
                tokio::spawn(async move {
                    connection::handle(stream, peer, table).await;
                });
            }
            Err(e) => {
                // Transient accept failures (e.g. the OS file descriptor
                // table is full) never bring the broker down.
                error!(error = %e, "failed to accept a connection");
            }
        }
    }
}
