//! Driver-facing SSE session manager.
//!
//! Grounded directly on the `SessionManager`/`handle_sse`/`CleanupStream`
//! shape used for MCP Streamable HTTP transports: one broadcast channel
//! per driver transport, a stream that yields a `connected` event then
//! drains the channel, and a `Drop` impl that spawns the cleanup task
//! (Drop itself can't await).

use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use axum::response::sse::Event;
use futures_core::Stream;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::session::SessionRegistry;

pub const SSE_KEEP_ALIVE_SECS: u64 = 30;
const PER_TRANSPORT_CHANNEL_CAPACITY: usize = 128;

#[derive(Clone)]
pub struct SessionManager {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<String>>>>,
    sessions: Arc<SessionRegistry>,
}

impl SessionManager {
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self { channels: Arc::new(RwLock::new(HashMap::new())), sessions }
    }

    /// Open a new driver stream. Allocates a fresh `transportId` and
    /// registers it with the session registry.
    pub async fn open(&self) -> (String, broadcast::Receiver<String>) {
        let transport_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = broadcast::channel(PER_TRANSPORT_CHANNEL_CAPACITY);
        self.channels.write().await.insert(transport_id.clone(), tx);
        self.sessions.touch_transport(&transport_id).await;
        debug!(transport_id = %transport_id, "opened driver SSE stream");
        (transport_id, rx)
    }

    /// Remove a transport's channel. Idempotent.
    pub async fn close(&self, transport_id: &str) {
        self.channels.write().await.remove(transport_id);
        debug!(transport_id = %transport_id, "closed driver SSE stream");
    }

    pub async fn send_to(&self, transport_id: &str, message: &str) -> bool {
        match self.channels.read().await.get(transport_id) {
            Some(tx) => tx.send(message.to_string()).is_ok(),
            None => false,
        }
    }

    pub async fn is_open(&self, transport_id: &str) -> bool {
        self.channels.read().await.contains_key(transport_id)
    }

    pub async fn stream_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

/// Build the SSE byte-stream for a newly opened transport, wrapped so the
/// session registry's cascade-close fires on stream drop after the
/// configured idle grace period.
pub fn build_stream(
    manager: SessionManager,
    transport_id: String,
    mut rx: broadcast::Receiver<String>,
    idle_grace: Duration,
) -> CleanupStream<impl Stream<Item = Result<Event, Infallible>>> {
    let stream_transport_id = transport_id.clone();
    let inner = async_stream::stream! {
        yield Ok::<_, Infallible>(Event::default()
            .event("connected")
            .data(format!(r#"{{"transportId":"{}"}}"#, stream_transport_id)));

        loop {
            match rx.recv().await {
                Ok(message) => {
                    yield Ok(Event::default().event("message").data(message));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(transport_id = %stream_transport_id, lagged = n, "driver SSE client lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    CleanupStream { inner: Box::pin(inner), manager, transport_id, idle_grace }
}

/// Stream wrapper that tears down the transport's session binding on
/// drop, after waiting `idle_grace` in case of a fast reconnect.
pub struct CleanupStream<S> {
    inner: Pin<Box<S>>,
    manager: SessionManager,
    transport_id: String,
    idle_grace: Duration,
}

impl<S: Stream<Item = Result<Event, Infallible>>> Stream for CleanupStream<S> {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<S> Drop for CleanupStream<S> {
    fn drop(&mut self) {
        let manager = self.manager.clone();
        let transport_id = self.transport_id.clone();
        let idle_grace = self.idle_grace;
        tokio::spawn(async move {
            manager.close(&transport_id).await;
            tokio::time::sleep(idle_grace).await;
            // Reconnects within the grace period re-touch the transport
            // under a new id (SSE streams don't resume), so by the time
            // we get here any binding still present is genuinely idle.
            if let Some(session_id) = manager.sessions.drop_transport(&transport_id).await {
                manager.sessions.drop_session(&session_id).await;
                debug!(transport_id = %transport_id, session_id = %session_id, "cascade-closed idle automation session");
            }
        });
    }
}
