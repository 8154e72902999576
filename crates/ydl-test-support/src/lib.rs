//! Shared test utilities for the broker/client integration suite.
//!
//! Generalizes the teacher's `rt-test-utils` (`MockWsServer`/`MockWsClient`)
//! from a mock WebSocket handshake fixture into a real in-process broker plus
//! a thin wire-level client, since this system's tests need to exercise the
//! actual framing codec rather than stand in for it.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use ydl_broker::{connection, Table};
use ydl_protocol::{CodecError, Message, YdlCodec};

/// Start a real broker bound to an OS-assigned port and return its address.
/// The broker runs for the lifetime of the test process; there is no
/// handle to stop it, matching the teacher's `MockWsServer::start` (tests
/// rely on process teardown, not explicit shutdown).
pub async fn spawn_broker() -> SocketAddr {
    let (addr, _handle) = spawn_stoppable_broker_at("127.0.0.1:0").await;
    addr
}

/// A handle to an in-process broker that can be shut down mid-test, for
/// scenarios that exercise client reconnection across a broker restart
/// (spec.md's S5). Stopping drops the listener and every connection the
/// broker has accepted so far, so subscribers observe the disconnect
/// immediately rather than waiting on an idle keepalive.
pub struct BrokerHandle {
    accept_task: JoinHandle<()>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl BrokerHandle {
    pub fn stop(&self) {
        self.accept_task.abort();
        for handle in self.connections.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

/// Start a stoppable broker on an OS-assigned port.
pub async fn spawn_stoppable_broker() -> (SocketAddr, BrokerHandle) {
    spawn_stoppable_broker_at("127.0.0.1:0").await
}

/// Start (or restart, after a prior [`BrokerHandle::stop`]) a stoppable
/// broker bound to a specific address.
pub async fn spawn_stoppable_broker_at(addr: impl tokio::net::ToSocketAddrs) -> (SocketAddr, BrokerHandle) {
    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind the test broker's listening socket");
    let addr = listener.local_addr().expect("listener has a local address");
    let table = Arc::new(Table::new());
    let connections: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
    let connections_for_loop = connections.clone();
    let accept_task = tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => continue,
            };
            let table = table.clone();
            let handle = tokio::spawn(async move {
                connection::handle(stream, peer, table).await;
            });
            connections_for_loop.lock().unwrap().push(handle);
        }
    });
    (addr, BrokerHandle { accept_task, connections })
}

/// A bare wire-level connection to a broker, for tests that need to drive
/// the framing protocol directly rather than through `ydl-client`'s
/// reconnecting state machine (e.g. malformed-frame and handshake-timeout
/// scenarios).
pub struct RawClient {
    framed: Framed<TcpStream, YdlCodec>,
}

impl RawClient {
    /// Connect and immediately declare `channels` via the subscription
    /// frame.
    pub async fn connect(addr: SocketAddr, channels: &[&str]) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let mut framed = Framed::new(stream, YdlCodec);
        let subscribe = Message::subscribe(channels.iter().map(|c| c.to_string()));
        framed
            .send(subscribe)
            .await
            .expect("subscribing on a fresh connection cannot fail to encode");
        Ok(RawClient { framed })
    }

    pub async fn send(&mut self, message: Message) -> Result<(), CodecError> {
        self.framed.send(message).await
    }

    pub async fn recv(&mut self) -> Option<Result<Message, CodecError>> {
        self.framed.next().await
    }

    /// Write a raw, already-length-prefixed byte slice directly to the
    /// socket, bypassing the codec entirely (for malformed-frame tests).
    pub async fn write_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.framed.get_mut().write_all(bytes).await
    }
}
