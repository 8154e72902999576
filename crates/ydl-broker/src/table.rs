//! The broker's subscription table: channel name -> currently connected
//! subscribers of that channel.
//!
//! Generalizes the teacher's single-topic broadcast registry
//! (`forwarder::local_fanout::FanoutServer`) to a per-channel map of
//! bounded per-subscriber queues, since a connection's subscription set is
//! per-channel rather than "every consumer gets everything".

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use ydl_protocol::Message;

/// Per-subscriber outbound queue capacity. A subscriber that falls this far
/// behind is disconnected rather than allowed to stall delivery to others
/// (see §4.2 backpressure policy).
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Opaque identity for one active connection, used as the key under each
/// channel it subscribes to.
pub type SubscriberId = u64;

fn next_subscriber_id() -> SubscriberId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// The routing table's guarded state: the channel -> subscriber map used
/// for fan-out, plus each subscriber's own declared channel set, so that
/// a disconnect triggered from any single channel (e.g. an overflow on
/// just one of a subscriber's several channels) can still remove that
/// subscriber everywhere, not just on the channel that triggered it.
#[derive(Default)]
struct Inner {
    channels: HashMap<String, HashMap<SubscriberId, mpsc::Sender<Message>>>,
    subscriptions: HashMap<SubscriberId, Vec<String>>,
}

/// The routing table: `channel -> (subscriber id -> outbound sender)`.
///
/// Lookup and fan-out are O(S) for S subscribers of the target channel.
/// All access is serialized behind a single mutex, per §5 ("simplest,
/// adequate at this scale").
#[derive(Default)]
pub struct Table {
    inner: Mutex<Inner>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh subscriber id and its outbound channel under every
    /// channel it declared. Entries are created lazily.
    pub fn register(
        &self,
        id: SubscriberId,
        channels: &[String],
        tx: mpsc::Sender<Message>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        for channel in channels {
            inner
                .channels
                .entry(channel.clone())
                .or_default()
                .insert(id, tx.clone());
        }
        inner.subscriptions.insert(id, channels.to_vec());
    }

    /// Remove a subscriber from every channel it declared, looking its
    /// declared set up internally rather than trusting the caller to
    /// supply it. Safe to call more than once (e.g. both on transport
    /// error and on overflow-triggered disconnect) — later calls are a
    /// no-op. This is what makes a slow-subscriber disconnect complete: a
    /// subscriber on `{A,B}` that overflows while `fan_out` is only
    /// looking at `A` is still dropped from `B`, because `B` comes from
    /// the subscriber's own recorded declaration, not from whichever
    /// channel happened to trigger the disconnect.
    pub fn deregister_everywhere(&self, id: SubscriberId) {
        let mut inner = self.inner.lock().unwrap();
        let Some(channels) = inner.subscriptions.remove(&id) else {
            return;
        };
        for channel in &channels {
            if let Some(subscribers) = inner.channels.get_mut(channel) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    inner.channels.remove(channel);
                }
            }
        }
    }

    /// Snapshot the current subscribers of `channel`. Cloning the senders
    /// out of the lock lets fan-out proceed without holding the table
    /// mutex across per-subscriber sends.
    pub fn subscribers_of(&self, channel: &str) -> Vec<(SubscriberId, mpsc::Sender<Message>)> {
        let inner = self.inner.lock().unwrap();
        inner
            .channels
            .get(channel)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .map(|(id, tx)| (*id, tx.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Allocate a fresh subscriber id for a newly-handshaked connection.
pub fn allocate_id() -> SubscriberId {
    next_subscriber_id()
}
