//! Per-connection state machine: `HANDSHAKING -> ACTIVE -> CLOSED`.
//!
//! Generalizes the teacher's `local_fanout::serve_consumer` writer task,
//! split into an independent reader half (the publish loop) and writer half
//! (the per-subscriber outbound queue drain), coordinated by a `oneshot`
//! "stop" signal so a failure on either half tears down the other —
//! mirroring the `tokio::select! { biased; ... }` pattern the teacher uses
//! to race a shutdown signal against socket I/O in
//! `receiver::session::run_session_loop`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};
use ydl_protocol::{Message, YdlCodec};

use crate::table::{self, Table, SUBSCRIBER_QUEUE_CAPACITY};

/// How long to wait for the subscription declaration frame before dropping
/// a connection that never sends one (§4.2: "a small window").
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Drive one accepted TCP connection through its whole lifecycle. Never
/// panics and never propagates an error — every failure just ends this
/// connection's task; the broker logs and continues (§4.2, §7).
pub async fn handle(stream: TcpStream, peer: SocketAddr, table: Arc<Table>) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, YdlCodec);
    let writer = FramedWrite::new(write_half, YdlCodec);

    let channels = match handshake(&mut reader).await {
        Ok(channels) => channels,
        Err(reason) => {
            debug!(%peer, reason = %reason, "connection dropped before completing handshake");
            return;
        }
    };
    info!(%peer, channels = ?channels, "connection active");

    let id = table::allocate_id();
    let (tx, rx) = mpsc::channel::<Message>(SUBSCRIBER_QUEUE_CAPACITY);
    table.register(id, &channels, tx);

    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let writer_task = tokio::spawn(run_writer(writer, rx, stop_tx));

    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            frame = reader.next() => match frame {
                Some(Ok(frame)) if frame.is_reserved() => {
                    warn!(%peer, "ignoring re-declared subscription frame from an active connection");
                }
                Some(Ok(frame)) => fan_out(&table, &frame),
                Some(Err(e)) => {
                    debug!(%peer, error = %e, "closing connection after a malformed frame");
                    break;
                }
                None => break, // peer closed cleanly (EOF)
            },
        }
    }

    // De-registration on entry to CLOSED (§4.2 state machine). Idempotent:
    // fan_out may already have evicted this id via an overflow disconnect.
    table.deregister_everywhere(id);
    drop(reader);
    let _ = writer_task.await;
    info!(%peer, "connection closed");
}

/// Read the first frame and require it to be a subscription declaration.
async fn handshake(reader: &mut FramedRead<OwnedReadHalf, YdlCodec>) -> Result<Vec<String>, String> {
    let first = timeout(HANDSHAKE_TIMEOUT, reader.next())
        .await
        .map_err(|_| "handshake timed out".to_owned())?
        .ok_or_else(|| "connection closed before sending a subscription frame".to_owned())?
        .map_err(|e| format!("malformed handshake frame: {e}"))?;

    first
        .as_subscription()
        .ok_or_else(|| "first frame was not a subscription declaration".to_owned())
}

/// Drain a subscriber's outbound queue into its socket until the queue
/// closes (normal de-registration) or the write fails, then signal `stop`
/// so the matching reader loop tears down too.
async fn run_writer(
    mut writer: FramedWrite<OwnedWriteHalf, YdlCodec>,
    mut rx: mpsc::Receiver<Message>,
    stop: oneshot::Sender<()>,
) {
    while let Some(message) = rx.recv().await {
        if writer.send(message).await.is_err() {
            break;
        }
    }
    let _ = stop.send(());
}

/// Forward a publish to every current subscriber of its channel. A
/// subscriber whose queue is full is disconnected rather than allowed to
/// stall the others (§4.2 backpressure policy, realization (a)). The
/// disconnect removes that subscriber from every channel it declared, not
/// just the one the overflow happened to be observed on — a subscriber on
/// `{A,B}` overflowing while we're only looking at `A` must still lose its
/// registration on `B`, or its writer task (and socket) never closes.
fn fan_out(table: &Table, message: &Message) {
    for (id, tx) in table.subscribers_of(message.channel()) {
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(message.clone()) {
            warn!(
                subscriber = id,
                channel = message.channel(),
                "subscriber queue full, disconnecting"
            );
            table.deregister_everywhere(id);
        }
        // A `Closed` error here just means that subscriber already tore
        // itself down through some other path; nothing left to do.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use ydl_protocol::{decode_stream, encode};

    async fn connect_and_subscribe(addr: SocketAddr, channels: &[&str]) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let sub = Message::subscribe(channels.iter().map(|c| c.to_string()));
        write_frame(&mut stream, &sub).await;
        stream
    }

    async fn write_frame(stream: &mut TcpStream, message: &Message) {
        let bytes = encode(message).unwrap();
        let mut framed = Vec::with_capacity(4 + bytes.len());
        framed.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        framed.extend_from_slice(&bytes);
        stream.write_all(&framed).await.unwrap();
    }

    async fn read_one_message(stream: &mut TcpStream) -> Message {
        let mut buf = vec![0u8; 4096];
        loop {
            let n = stream.read(&mut buf[..]).await.unwrap();
            assert!(n > 0, "connection closed before a message arrived");
            let (messages, _leftover) = decode_stream(&buf[..n]).unwrap();
            if let Some(message) = messages.into_iter().next() {
                return message;
            }
        }
    }

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber_of_the_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let table = Arc::new(Table::new());
        let table_for_accept = table.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = listener.accept().await.unwrap();
                tokio::spawn(handle(stream, peer, table_for_accept.clone()));
            }
        });

        let mut a1 = connect_and_subscribe(addr, &["x"]).await;
        let mut a2 = connect_and_subscribe(addr, &["x"]).await;
        let mut publisher = connect_and_subscribe(addr, &[]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        write_frame(&mut publisher, &Message::try_new("x", vec!["hi"]).unwrap()).await;

        let m1 = read_one_message(&mut a1).await;
        let m2 = read_one_message(&mut a2).await;
        assert_eq!(m1.channel(), "x");
        assert_eq!(m2.channel(), "x");
    }

    #[tokio::test]
    async fn self_delivery_is_symmetric() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let table = Arc::new(Table::new());
        let table_for_accept = table.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = listener.accept().await.unwrap();
                tokio::spawn(handle(stream, peer, table_for_accept.clone()));
            }
        });

        let mut client = connect_and_subscribe(addr, &["cheese"]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        write_frame(&mut client, &Message::try_new("cheese", vec![1]).unwrap()).await;

        let received = read_one_message(&mut client).await;
        assert_eq!(received.channel(), "cheese");
    }

    #[tokio::test]
    async fn malformed_frame_only_closes_the_offending_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let table = Arc::new(Table::new());
        let table_for_accept = table.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = listener.accept().await.unwrap();
                tokio::spawn(handle(stream, peer, table_for_accept.clone()));
            }
        });

        let mut bad = connect_and_subscribe(addr, &[]).await;
        let mut a = connect_and_subscribe(addr, &["a"]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Not an array root: well-formed length prefix, malformed payload shape.
        let payload = serde_json::to_vec(&serde_json::json!({"oops": true})).unwrap();
        let mut framed = Vec::new();
        framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        framed.extend_from_slice(&payload);
        bad.write_all(&framed).await.unwrap();

        // The other connection still works end-to-end.
        write_frame(&mut a, &Message::try_new("a", vec![1]).unwrap()).await;
        let received = read_one_message(&mut a).await;
        assert_eq!(received.channel(), "a");

        // The bad connection is closed by the broker.
        let mut buf = [0u8; 8];
        let n = bad.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "broker should have closed the malformed connection");
    }
}
