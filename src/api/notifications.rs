//
// WebSocket fanout for QR login status
//
// Live desktop subscribers are indexed in a fixed number of shards, each
// behind its own lock, keyed by `hash(token) mod N`. A bounded outbound
// queue feeds one writer pump per connection; overflow evicts the
// connection. A sweeper closes connections older than the maximum age, and
// shutdown drains every shard.
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use rocket::Route;
use rocket_ws as ws;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

pub fn routes() -> Vec<Route> {
    routes![ws_qr_login]
}

const SHARD_COUNT: usize = 8;
const MAX_CONNECTIONS: usize = 1000;
const OUTBOUND_QUEUE: usize = 256;
const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_DEADLINE: Duration = Duration::from_secs(60);
const MAX_CONNECTION_AGE: Duration = Duration::from_secs(5 * 60);

pub static WS_QR_SUBSCRIBERS: Lazy<Arc<QrSubscribers>> = Lazy::new(|| Arc::new(QrSubscribers::new()));

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Value>,
    connected_at: Instant,
}

pub struct QrSubscribers {
    shards: Vec<Mutex<HashMap<String, Subscriber>>>,
    total: AtomicUsize,
    next_id: AtomicU64,
}

impl QrSubscribers {
    fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            total: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
        }
    }

    fn shard_for(&self, token: &str) -> &Mutex<HashMap<String, Subscriber>> {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Registers a subscriber for a token, replacing any prior subscriber
    /// for the same token (its queue closes, ending its pump). Fails when
    /// the global connection cap is reached. Returns the subscriber id the
    /// pump hands back at unregister time.
    async fn register(&self, token: &str) -> Option<(u64, mpsc::Receiver<Value>)> {
        if self.total.fetch_add(1, Ordering::SeqCst) >= MAX_CONNECTIONS {
            self.total.fetch_sub(1, Ordering::SeqCst);
            warn!("Rejecting WebSocket connection: connection cap reached");
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let mut shard = self.shard_for(token).lock().await;
        shard.insert(
            token.to_string(),
            Subscriber {
                id,
                tx,
                connected_at: Instant::now(),
            },
        );
        Some((id, rx))
    }

    /// Drops the map entry when it still belongs to the leaving connection;
    /// a replaced connection must not tear down its replacement. The
    /// connection count is decremented by the leaving pump either way.
    async fn unregister(&self, token: &str, id: u64) {
        let mut shard = self.shard_for(token).lock().await;
        if let Some(sub) = shard.get(token) {
            if sub.id == id {
                shard.remove(token);
            }
        }
        drop(shard);
        self.total.fetch_sub(1, Ordering::SeqCst);
    }

    /// Enqueues a status message for the token's subscriber. Nobody
    /// listening is a no-op; a full queue evicts the subscriber.
    pub async fn notify(&self, token: &str, status: &str, extra: Option<Value>) {
        let mut message = json!({
            "type": "status",
            "status": status,
        });
        if let Some(extra) = extra {
            if let Some(obj) = extra.as_object() {
                for (k, v) in obj {
                    message[k.as_str()] = v.clone();
                }
            }
        }

        let mut shard = self.shard_for(token).lock().await;
        if let Some(sub) = shard.get(token) {
            match sub.tx.try_send(message) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("WebSocket queue overflow, evicting subscriber");
                    shard.remove(token);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    shard.remove(token);
                }
            }
        }
    }

    /// Closes connections older than the maximum age.
    pub async fn sweep(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock().await;
            shard.retain(|_, sub| sub.connected_at.elapsed() < MAX_CONNECTION_AGE);
        }
    }

    /// Graceful drain: every queue closes, every pump sends a close frame
    /// and exits, and the pumps bring the counter back to zero.
    pub async fn shutdown(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock().await;
            shard.clear();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

/// Periodic sweep of over-age connections; exits on shutdown.
pub async fn start_sweeper(shutdown: rocket::Shutdown) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                WS_QR_SUBSCRIBERS.sweep().await;
            }
            _ = shutdown.clone() => break,
        }
    }
}

/// Shutdown hook: drain all shards.
pub async fn ws_shutdown() {
    WS_QR_SUBSCRIBERS.shutdown().await;
}

#[get("/qr-login?<token>")]
fn ws_qr_login(token: String, ws: ws::WebSocket) -> ws::Channel<'static> {
    use futures::{SinkExt, StreamExt};

    ws.channel(move |mut stream| {
        Box::pin(async move {
            let (sub_id, mut rx) = match WS_QR_SUBSCRIBERS.register(&token).await {
                Some(sub) => sub,
                None => {
                    let _unused = stream.send(ws::Message::Close(None)).await;
                    return Ok(());
                }
            };

            let mut ping_interval = tokio::time::interval(PING_INTERVAL);
            ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_pong = Instant::now();

            loop {
                tokio::select! {
                    // Writer pump: outbound queue drained in order.
                    outbound = rx.recv() => {
                        match outbound {
                            Some(message) => {
                                if stream.send(ws::Message::Text(message.to_string())).await.is_err() {
                                    break;
                                }
                            }
                            // Queue closed: evicted, replaced or draining.
                            None => break,
                        }
                    }

                    inbound = stream.next() => {
                        match inbound {
                            Some(Ok(ws::Message::Pong(_))) => {
                                last_pong = Instant::now();
                            }
                            Some(Ok(ws::Message::Ping(payload))) => {
                                if stream.send(ws::Message::Pong(payload)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(ws::Message::Close(_))) | None | Some(Err(_)) => break,
                            // Inbound data frames are ignored; this socket
                            // only pushes status.
                            Some(Ok(_)) => {}
                        }
                    }

                    _ = ping_interval.tick() => {
                        if last_pong.elapsed() > PONG_DEADLINE {
                            info!("Closing WebSocket: pong deadline passed");
                            break;
                        }
                        if stream.send(ws::Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }

            let _unused = stream.send(ws::Message::Close(None)).await;
            WS_QR_SUBSCRIBERS.unregister(&token, sub_id).await;

            Ok(())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rocket::async_test]
    async fn test_register_notify_and_receive_in_order() {
        let subs = QrSubscribers::new();
        let (id, mut rx) = subs.register("tok-1").await.unwrap();

        subs.notify("tok-1", "scanned", None).await;
        subs.notify("tok-1", "confirmed", Some(json!({"sessionToken": "s1"}))).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first["type"], "status");
        assert_eq!(first["status"], "scanned");

        let second = rx.recv().await.unwrap();
        assert_eq!(second["status"], "confirmed");
        assert_eq!(second["sessionToken"], "s1");

        subs.unregister("tok-1", id).await;
        assert_eq!(subs.connection_count(), 0);
    }

    #[rocket::async_test]
    async fn test_notify_without_subscriber_is_noop() {
        let subs = QrSubscribers::new();
        subs.notify("nobody", "scanned", None).await;
    }

    #[rocket::async_test]
    async fn test_replacement_closes_previous_subscriber() {
        let subs = QrSubscribers::new();
        let (old_id, mut old_rx) = subs.register("tok-2").await.unwrap();
        let (new_id, mut new_rx) = subs.register("tok-2").await.unwrap();

        // The old queue is closed by the replacement.
        assert!(old_rx.recv().await.is_none());

        subs.notify("tok-2", "scanned", None).await;
        assert_eq!(new_rx.recv().await.unwrap()["status"], "scanned");

        // The old pump leaving must not remove the new subscriber's entry.
        subs.unregister("tok-2", old_id).await;
        subs.notify("tok-2", "confirmed", None).await;
        assert_eq!(new_rx.recv().await.unwrap()["status"], "confirmed");

        subs.unregister("tok-2", new_id).await;
        assert_eq!(subs.connection_count(), 0);
    }

    #[rocket::async_test]
    async fn test_queue_overflow_evicts_subscriber() {
        let subs = QrSubscribers::new();
        let (_id, rx) = subs.register("tok-3").await.unwrap();

        for _ in 0..=OUTBOUND_QUEUE {
            subs.notify("tok-3", "scanned", None).await;
        }

        // The subscriber map entry is gone; the receiver sees the close
        // after draining its backlog.
        let shard = subs.shard_for("tok-3").lock().await;
        assert!(!shard.contains_key("tok-3"));
        drop(shard);
        drop(rx);
    }

    #[rocket::async_test]
    async fn test_connection_cap() {
        let subs = QrSubscribers::new();
        let mut receivers = Vec::new();
        for i in 0..MAX_CONNECTIONS {
            receivers.push(subs.register(&format!("tok-{i}")).await.unwrap());
        }
        assert_eq!(receivers.len(), MAX_CONNECTIONS);
        assert!(subs.register("one-too-many").await.is_none());
        assert_eq!(subs.connection_count(), MAX_CONNECTIONS);
    }

    #[rocket::async_test]
    async fn test_shutdown_drains_all_shards() {
        let subs = QrSubscribers::new();
        let (id_a, mut rx_a) = subs.register("tok-a").await.unwrap();
        let (id_b, mut rx_b) = subs.register("tok-b").await.unwrap();

        subs.shutdown().await;

        assert!(rx_a.recv().await.is_none());
        assert!(rx_b.recv().await.is_none());

        // Pumps decrement on their way out.
        subs.unregister("tok-a", id_a).await;
        subs.unregister("tok-b", id_b).await;
        assert_eq!(subs.connection_count(), 0);
    }
}
