//! The YDL client: a cheaply-cloneable handle that hides connection
//! management from the hosting process behind `send`/`receive`.
//!
//! Reconnection is driven by a background supervisor task, in the idiom of
//! the teacher's `UplinkSession` (`forwarder::uplink`): a small state
//! machine that dials, performs the subscription handshake, and on any
//! transport failure backs off and tries again — invisibly to callers of
//! `send`/`receive` (§4.3, §9 "Blocking reconnection in the client").
//!
//! "Blocking" is realized as `async fn` that `.await`s until done, since
//! the teacher's entire stack (and this one) is `tokio`-async; callers
//! block their own task, not an OS thread (see SPEC_FULL.md §4.3).

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

pub use ydl_protocol::{EncodeError, Message};
use ydl_protocol::{YdlCodec, DEFAULT_PORT};

/// Initial and maximum reconnect backoff (§4.3: "recommend 200 ms - 1 s").
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Depth of the queue of already-received messages awaiting a `receive()`
/// call (§3 "a bounded or unbounded inbound queue").
const INBOUND_QUEUE_CAPACITY: usize = 1024;

/// `send` failed before a frame ever reached a live transport.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("channel {0:?} is reserved for the subscription handshake and cannot be published to")]
    ReservedChannel(String),
    #[error("client has been closed")]
    Closed,
}

/// A client method was invoked after explicit teardown.
#[derive(Debug, thiserror::Error)]
#[error("client has been closed")]
pub struct ClosedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Down,
    Up,
    Closed,
}

struct Inner {
    addr: SocketAddr,
    channels: Vec<String>,
    writer: Mutex<Option<FramedWrite<OwnedWriteHalf, YdlCodec>>>,
    link: watch::Sender<LinkState>,
    force_reconnect: Notify,
    inbound_tx: Mutex<Option<mpsc::Sender<Message>>>,
    inbound_rx: Mutex<mpsc::Receiver<Message>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    id: u64,
}

fn next_client_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// A handle to one connection to the broker. Cloning a `Client` shares the
/// same underlying connection and inbound queue (useful for handing
/// `send`/`receive` access to different parts of a host process).
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Connect to the broker at `addr` (default `127.0.0.1:5001`),
    /// declaring interest in `channels`. Blocks until the initial
    /// connection is established and the subscription frame has been
    /// sent; never fails on connection refusal, retrying indefinitely
    /// with bounded backoff instead (§4.3).
    pub async fn connect(
        channels: impl IntoIterator<Item = impl Into<String>>,
        addr: Option<SocketAddr>,
    ) -> Client {
        let channels: Vec<String> = channels.into_iter().map(Into::into).collect();
        let addr = addr.unwrap_or_else(|| SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)));
        let (link_tx, mut link_rx) = watch::channel(LinkState::Down);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);

        let inner = Arc::new(Inner {
            addr,
            channels,
            writer: Mutex::new(None),
            link: link_tx,
            force_reconnect: Notify::new(),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx: Mutex::new(inbound_rx),
            supervisor: Mutex::new(None),
            id: next_client_id(),
        });

        let supervised = inner.clone();
        let handle = tokio::spawn(async move { supervise(supervised).await });
        *inner.supervisor.lock().await = Some(handle);

        // Block until the first connection + handshake succeeds.
        let _ = link_rx.wait_for(|state| *state == LinkState::Up).await;

        Client { inner }
    }

    /// Encode and send one message. Never surfaces a transport error: on
    /// failure the client reconnects, re-declares its subscriptions, and
    /// retries the send exactly once per successful reconnection until it
    /// succeeds (§4.3). Returns [`SendError`] only for a local encode
    /// failure, a reserved-channel violation, or an explicitly closed
    /// client.
    pub async fn send<T: Serialize>(
        &self,
        channel: impl Into<String>,
        payload: Vec<T>,
    ) -> Result<(), SendError> {
        let message = Message::try_new(channel, payload)?;
        if message.is_reserved() {
            return Err(SendError::ReservedChannel(message.channel().to_owned()));
        }
        self.send_message(message).await
    }

    async fn send_message(&self, message: Message) -> Result<(), SendError> {
        loop {
            let mut rx = self.inner.link.subscribe();
            match *rx.borrow() {
                LinkState::Closed => return Err(SendError::Closed),
                LinkState::Down => {
                    let _ = rx.wait_for(|state| *state != LinkState::Down).await;
                    continue;
                }
                LinkState::Up => {
                    let mut guard = self.inner.writer.lock().await;
                    let Some(writer) = guard.as_mut() else {
                        // Race: supervisor is mid-reconnect. Loop and wait.
                        drop(guard);
                        continue;
                    };
                    match writer.send(message.clone()).await {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            debug!(client = self.inner.id, error = %e, "send failed, will reconnect");
                            *guard = None;
                            drop(guard);
                            self.inner.force_reconnect.notify_one();
                        }
                    }
                }
            }
        }
    }

    /// Return the next message addressed to any subscribed channel,
    /// blocking until one is available. Messages that arrived before this
    /// call are delivered first, in FIFO order (§4.3). Fails with
    /// [`ClosedError`] only after explicit teardown, once the queue has
    /// fully drained.
    pub async fn receive(&self) -> Result<Message, ClosedError> {
        let mut rx = self.inner.inbound_rx.lock().await;
        rx.recv().await.ok_or(ClosedError)
    }

    /// Tear the client down. Any `receive()` racing this call returns its
    /// last queued message (if any) before failing with [`ClosedError`].
    pub async fn close(&self) {
        let _ = self.inner.link.send(LinkState::Closed);
        if let Some(handle) = self.inner.supervisor.lock().await.take() {
            handle.abort();
        }
        *self.inner.writer.lock().await = None;
        *self.inner.inbound_tx.lock().await = None;
    }

    /// The channels this client declared at construction.
    pub fn channels(&self) -> &[String] {
        &self.inner.channels
    }
}

/// Background reconnection state machine: dial, handshake, read until
/// failure, back off, repeat. Runs for the client's whole lifetime.
async fn supervise(inner: Arc<Inner>) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if *inner.link.borrow() == LinkState::Closed {
            return;
        }
        match dial_and_handshake(&inner).await {
            Ok((read_half, writer)) => {
                backoff = INITIAL_BACKOFF;
                *inner.writer.lock().await = Some(writer);
                info!(client = inner.id, addr = %inner.addr, "connected");
                let _ = inner.link.send(LinkState::Up);

                read_until_failure(&inner, read_half).await;

                if *inner.link.borrow() == LinkState::Closed {
                    return;
                }
                *inner.writer.lock().await = None;
                let _ = inner.link.send(LinkState::Down);
            }
            Err(e) => {
                warn!(client = inner.id, addr = %inner.addr, error = %e, "connect failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

async fn dial_and_handshake(
    inner: &Inner,
) -> std::io::Result<(OwnedReadHalf, FramedWrite<OwnedWriteHalf, YdlCodec>)> {
    let stream = TcpStream::connect(inner.addr).await?;
    let (read_half, write_half) = stream.into_split();
    let mut writer = FramedWrite::new(write_half, YdlCodec);
    writer
        .send(Message::subscribe(inner.channels.clone()))
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    Ok((read_half, writer))
}

/// Forward frames into the inbound queue until the connection fails,
/// until the queue itself is gone (client closed), or until a failed
/// `send` nudges us to drop this connection and reconnect.
async fn read_until_failure(inner: &Inner, read_half: OwnedReadHalf) {
    let mut reader = FramedRead::new(read_half, YdlCodec);
    let tx = match inner.inbound_tx.lock().await.clone() {
        Some(tx) => tx,
        None => return, // closed concurrently
    };
    loop {
        tokio::select! {
            biased;
            _ = inner.force_reconnect.notified() => return,
            frame = reader.next() => match frame {
                Some(Ok(message)) => {
                    if tx.send(message).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    debug!(client = inner.id, error = %e, "read failed");
                    return;
                }
                None => return, // broker closed the connection
            },
        }
    }
}
