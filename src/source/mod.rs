//! Telemetry stream adapters.
//!
//! One [`SourceConnection`] drives each WebSocket subscription. The per-source
//! behaviour is only the projection of the decoded entity map, supplied by a
//! [`SourceKind`]; connect, decode, forward and reconnect are shared.
//!
//! Connections use `TCP_NODELAY` and `write_buffer_size: 0` so close frames and
//! pongs go out immediately.

pub mod overtake;
pub mod tire_cliff;
pub mod undercut;

use std::sync::Arc;
use std::sync::atomic::Ordering::Relaxed;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_tls_with_config};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DecodeError, Error, Result};
use crate::metrics::SourceMetrics;
use crate::types::{EntityValues, MY_CAR, REVISION_FIELD, Snapshot, SourceId};

pub use overtake::Overtake;
pub use tire_cliff::TireCliff;
pub use undercut::Undercut;

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const INITIAL_BACKOFF_MS: u64 = 1_000;
pub(crate) const MAX_BACKOFF_MS: u64 = 30_000;

/// Longest payload prefix echoed into decode-error logs.
const PAYLOAD_HEAD: usize = 200;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Per-source decode strategy.
pub trait SourceKind: Send + Sync + 'static {
    const ID: SourceId;

    /// Reduce the message's entity fields (revision already removed) to this
    /// source's entity map.
    fn project(&self, fields: Map<String, Value>) -> std::result::Result<EntityValues, DecodeError>;
}

/// Parse one raw frame into a snapshot: the revision field travels alongside
/// the entities, never inside them.
pub fn decode<K: SourceKind>(kind: &K, raw: &str) -> std::result::Result<Snapshot, DecodeError> {
    let Value::Object(mut fields) = serde_json::from_str::<Value>(raw)? else {
        return Err(DecodeError::NotObject);
    };
    let revision = fields
        .remove(REVISION_FIELD)
        .and_then(|v| v.as_u64())
        .ok_or(DecodeError::Revision {
            field: REVISION_FIELD,
        })?;
    Ok(Snapshot {
        entities: kind.project(fields)?,
        revision,
    })
}

/// Projection shared by the single-car sources: keep only the [`MY_CAR`] entry.
pub(crate) fn project_my_car<T: DeserializeOwned>(
    mut fields: Map<String, Value>,
) -> std::result::Result<T, DecodeError> {
    let entry = fields
        .remove(MY_CAR)
        .ok_or(DecodeError::MissingEntity { key: MY_CAR })?;
    Ok(serde_json::from_value(entry)?)
}

/// WebSocket config optimized for low-latency reads.
#[must_use]
pub fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.write_buffer_size = 0; // Flush every frame immediately.
    config
}

/// Sleep with exponential backoff. Returns `false` if cancelled during sleep.
pub(crate) async fn backoff_sleep(
    backoff_ms: &mut u64,
    source: SourceId,
    cancel: &CancellationToken,
) -> bool {
    info!(source = source.as_str(), backoff_ms = *backoff_ms, "reconnecting");
    tokio::select! {
        () = cancel.cancelled() => return false,
        () = tokio::time::sleep(Duration::from_millis(*backoff_ms)) => {}
    }
    *backoff_ms = (*backoff_ms * 2).min(MAX_BACKOFF_MS);
    true
}

/// Prefix of `text` cut on a char boundary.
fn payload_head(text: &str) -> &str {
    let mut end = text.len().min(PAYLOAD_HEAD);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Why the read loop stopped.
enum Pump {
    Cancelled,
    StreamEnded,
    ReceiverGone,
}

/// One live subscription, parameterized by its [`SourceKind`].
pub struct SourceConnection<K> {
    kind: K,
    endpoint: String,
    metrics: Arc<SourceMetrics>,
    reconnect: bool,
}

impl<K: SourceKind> SourceConnection<K> {
    pub fn new(kind: K, endpoint: impl Into<String>, metrics: Arc<SourceMetrics>) -> Self {
        Self {
            kind,
            endpoint: endpoint.into(),
            metrics,
            reconnect: true,
        }
    }

    /// Whether a dropped link is re-established. The initial subscription is
    /// never retried.
    #[must_use]
    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.reconnect = enabled;
        self
    }

    /// Decode one raw message for this source.
    pub fn decode(&self, raw: &str) -> std::result::Result<Snapshot, DecodeError> {
        decode(&self.kind, raw)
    }

    /// Start the subscription. Snapshots go to `sender` until the handle is
    /// closed or dropped, or `parent` is cancelled.
    pub fn open(self, sender: mpsc::Sender<Snapshot>, parent: &CancellationToken) -> SourceHandle {
        let cancel = parent.child_token();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let result = self.run(sender, cancel).await;
                if let Err(e) = &result {
                    error!(source = K::ID.as_str(), error = %e, "source stopped");
                }
                result
            }
        });
        SourceHandle {
            source: K::ID,
            cancel,
            task: Some(task),
        }
    }

    async fn run(self, sender: mpsc::Sender<Snapshot>, cancel: CancellationToken) -> Result<()> {
        let source = K::ID.as_str();
        let mut backoff_ms = INITIAL_BACKOFF_MS;
        let mut subscribed = false;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            info!(source, endpoint = %self.endpoint, "connecting");

            let connect_fut =
                connect_async_tls_with_config(self.endpoint.as_str(), Some(ws_config()), true, None);
            let attempt = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                r = tokio::time::timeout(CONNECT_TIMEOUT, connect_fut) => r,
            };

            let failure = match attempt {
                Ok(Ok((mut ws, _))) => {
                    info!(source, "connected");
                    subscribed = true;
                    backoff_ms = INITIAL_BACKOFF_MS;
                    self.metrics.connected.store(true, Relaxed);

                    let outcome = self.pump(&mut ws, &sender, &cancel).await;
                    self.metrics.connected.store(false, Relaxed);

                    match outcome {
                        Pump::Cancelled => {
                            let _ = ws.close(None).await;
                            info!(source, "closed");
                            return Ok(());
                        }
                        Pump::ReceiverGone => {
                            let _ = ws.close(None).await;
                            info!(source, "aggregator gone, closing");
                            return Ok(());
                        }
                        Pump::StreamEnded => None,
                    }
                }
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("connection timed out".to_string()),
            };

            if let Some(reason) = failure {
                self.metrics.errors.fetch_add(1, Relaxed);
                if !subscribed {
                    return Err(Error::Subscribe {
                        stream: K::ID,
                        endpoint: self.endpoint.clone(),
                        reason,
                    });
                }
                error!(source, %reason, "connection failed");
            }

            if !self.reconnect {
                info!(source, "reconnect disabled, source stopped");
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Ok(());
            }

            self.metrics.reconnections.fetch_add(1, Relaxed);
            if !backoff_sleep(&mut backoff_ms, K::ID, &cancel).await {
                return Ok(());
            }
        }
    }

    /// Read frames until the stream ends, the aggregator goes away, or we are
    /// cancelled. A bad frame is logged and skipped.
    async fn pump(
        &self,
        ws: &mut WsStream,
        sender: &mpsc::Sender<Snapshot>,
        cancel: &CancellationToken,
    ) -> Pump {
        let source = K::ID.as_str();
        loop {
            let msg = tokio::select! {
                () = cancel.cancelled() => return Pump::Cancelled,
                msg = ws.next() => msg,
            };

            let text = match msg {
                Some(Ok(Message::Text(t))) => t,
                Some(Ok(Message::Binary(b))) => match String::from_utf8(b) {
                    Ok(t) => t,
                    Err(_) => {
                        self.metrics.errors.fetch_add(1, Relaxed);
                        warn!(source, "non-UTF-8 binary frame, skipping");
                        continue;
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    info!(source, ?frame, "close frame received");
                    continue;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.metrics.errors.fetch_add(1, Relaxed);
                    warn!(source, error = %e, "ws error");
                    return Pump::StreamEnded;
                }
                None => {
                    warn!(source, "stream ended");
                    return Pump::StreamEnded;
                }
            };

            let t0 = Instant::now();
            let snapshot = match self.decode(&text) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    self.metrics.errors.fetch_add(1, Relaxed);
                    warn!(
                        source,
                        error = %e,
                        payload_head = payload_head(&text),
                        "decode error, message skipped"
                    );
                    continue;
                }
            };
            self.metrics.decode_latency.record(t0.elapsed());
            self.metrics.messages.fetch_add(1, Relaxed);
            debug!(source, revision = snapshot.revision, "snapshot decoded");

            if sender.send(snapshot).await.is_err() {
                return Pump::ReceiverGone;
            }
        }
    }
}

/// Owned subscription. Closing is idempotent and also happens on drop.
pub struct SourceHandle {
    source: SourceId,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl SourceHandle {
    #[must_use]
    pub fn source(&self) -> SourceId {
        self.source
    }

    /// Release the subscription. Safe to call any number of times.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Wait for the connection task. Returns the subscription error, if any.
    pub async fn join(mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => task.await?,
            None => Ok(()),
        }
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
