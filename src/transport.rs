//! §4.H Transport Adapter: a single byte-level interface regardless of the
//! underlying transport. Adapters move opaque bytes; they never parse
//! payloads (that's `troparcel_crdt::encode`'s job).
use std::path::PathBuf;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Connecting,
    Connected,
    Disconnected,
}

/// Inbound events a transport hands to the engine.
pub enum TransportEvent {
    Update(Vec<u8>),
    Status(Status),
}

#[async_trait::async_trait]
pub trait TransportAdapter: Send + Sync {
    async fn connect(&mut self, state_vector: Vec<u8>) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError>;
    async fn send(&mut self, update: Vec<u8>) -> Result<(), TransportError>;
    async fn disconnect(&mut self);
    /// Releases any resources beyond `disconnect` (e.g. watcher handles).
    async fn destroy(&mut self);
}

/// §7: exponential reconnect backoff, capped at 60s, with `consecutive_errors`
/// clamped so it can never overflow across a long-lived connection.
pub struct Backoff {
    base: Duration,
    cap: Duration,
    consecutive_errors: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(60),
            consecutive_errors: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1).min(32);
        let factor = 1u64 << self.consecutive_errors.min(7);
        (self.base * factor as u32).min(self.cap)
    }

    pub fn reset(&mut self) {
        self.consecutive_errors = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// WebSocket transport: full duplex, FIFO within the connection, per-room
/// shared bearer token (§4.H). The socket is split into a read half driven
/// by a background task that forwards frames into the engine's event
/// channel, and a write half driven by a second task reading from
/// `outbound` so `send` never has to borrow the socket directly.
pub struct WebSocketTransport {
    url: String,
    token: Option<String>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
}

impl WebSocketTransport {
    pub fn new(url: String, token: Option<String>) -> Self {
        Self { url, token, outbound: None }
    }
}

#[async_trait::async_trait]
impl TransportAdapter for WebSocketTransport {
    async fn connect(&mut self, _state_vector: Vec<u8>) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        let mut url = self.url.clone();
        if let Some(token) = &self.token {
            let sep = if url.contains('?') { '&' } else { '?' };
            url.push(sep);
            url.push_str("token=");
            url.push_str(token);
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|err| TransportError::Http(err.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        self.outbound = Some(outbound_tx);

        let _ = event_tx.send(TransportEvent::Status(Status::Connected));

        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if write.send(msg).await.is_err() {
                    return;
                }
            }
        });

        let read_events = event_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Binary(bytes)) => {
                        if read_events.send(TransportEvent::Update(bytes)).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            let _ = read_events.send(TransportEvent::Status(Status::Disconnected));
        });

        Ok(event_rx)
    }

    async fn send(&mut self, update: Vec<u8>) -> Result<(), TransportError> {
        match &self.outbound {
            Some(tx) => tx.send(Message::Binary(update)).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn disconnect(&mut self) {
        self.outbound = None;
    }

    async fn destroy(&mut self) {
        self.outbound = None;
    }
}

/// File transport: a shared directory, polled for new update files. Each
/// update is written as its own file so concurrent writers never
/// interleave; ordering is eventual, not FIFO (§4.H).
pub struct FileTransport {
    dir: PathBuf,
    poll_interval: Duration,
}

impl FileTransport {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            poll_interval: Duration::from_secs(2),
        }
    }
}

#[async_trait::async_trait]
impl TransportAdapter for FileTransport {
    async fn connect(&mut self, _state_vector: Vec<u8>) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TransportEvent::Status(Status::Connected));
        let dir = self.dir.clone();
        let interval = self.poll_interval;
        tokio::spawn(async move {
            let mut seen = std::collections::HashSet::new();
            loop {
                if let Ok(mut entries) = tokio::fs::read_dir(&dir).await {
                    while let Ok(Some(entry)) = entries.next_entry().await {
                        let name = entry.file_name().to_string_lossy().to_string();
                        if seen.insert(name.clone()) {
                            if let Ok(bytes) = tokio::fs::read(entry.path()).await {
                                if tx.send(TransportEvent::Update(bytes)).is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });
        Ok(rx)
    }

    async fn send(&mut self, update: Vec<u8>) -> Result<(), TransportError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let filename = format!("{}.update", uuid_like());
        tokio::fs::write(self.dir.join(filename), update).await?;
        Ok(())
    }

    async fn disconnect(&mut self) {}

    async fn destroy(&mut self) {}
}

/// Snapshot transport: periodic HTTP GET/PUT of the full encoded state.
/// Coarse, eventual ordering (§4.H).
pub struct SnapshotTransport {
    url: String,
    auth: Option<String>,
    client: reqwest::Client,
}

impl SnapshotTransport {
    pub fn new(url: String, auth: Option<String>) -> Self {
        Self {
            url,
            auth,
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait::async_trait]
impl TransportAdapter for SnapshotTransport {
    async fn connect(&mut self, _state_vector: Vec<u8>) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        let response = self
            .request(self.client.get(&self.url))
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TransportEvent::Status(Status::Connected));
        if !bytes.is_empty() {
            let _ = tx.send(TransportEvent::Update(bytes.to_vec()));
        }
        Ok(rx)
    }

    async fn send(&mut self, update: Vec<u8>) -> Result<(), TransportError> {
        self.request(self.client.put(&self.url))
            .body(update)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(())
    }

    async fn disconnect(&mut self) {}

    async fn destroy(&mut self) {}
}

fn uuid_like() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped_at_60s() {
        let mut backoff = Backoff::new();
        let mut last = Duration::from_millis(0);
        for _ in 0..40 {
            last = backoff.next_delay();
            assert!(last <= Duration::from_secs(60));
        }
        assert_eq!(last, Duration::from_secs(60));
    }

    #[test]
    fn backoff_resets() {
        let mut backoff = Backoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.consecutive_errors, 0);
    }
}
