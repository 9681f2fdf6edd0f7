//! Request correlator: issues request ids, holds pending futures with
//! timeout, enforces the bounded queue, and sweeps stale entries.
//!
//! The periodic sweep follows a janitor interval-loop idiom
//! (`tokio::time::interval` plus a logged pass summary), generalized from
//! filesystem housekeeping to in-memory pending-request housekeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{oneshot, Mutex};
use tokio::time::interval;
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::protocol::Frame;

pub const MAX_PENDING: usize = 50;
pub const GLOBAL_REQUEST_CAP: Duration = Duration::from_secs(60);
pub const STALE_TIMEOUT: Duration = Duration::from_secs(60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(15);
const PENDING_WARNING_THRESHOLD: usize = 5;

/// Who a pending request is routed to — used to reject the right subset
/// on a peer disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    Controller,
    PageAgent(String),
    PeerBridge(String),
}

struct PendingRequest {
    route: RouteTarget,
    embedded_epoch_ms: u64,
    timeout: Duration,
    deadline: std::time::Instant,
    completion: oneshot::Sender<Result<Frame, BridgeError>>,
}

fn now_epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Holds every in-flight request awaiting a `response` frame.
pub struct RequestCorrelator {
    pending: Mutex<HashMap<String, PendingRequest>>,
    counter: AtomicU64,
    max_pending: usize,
    stale_timeout: Duration,
    global_request_cap: Duration,
}

impl RequestCorrelator {
    /// Build with the compile-time defaults (`MAX_PENDING`,
    /// `STALE_TIMEOUT`, `GLOBAL_REQUEST_CAP`).
    pub fn new() -> Self {
        Self::with_limits(MAX_PENDING, STALE_TIMEOUT, GLOBAL_REQUEST_CAP)
    }

    /// Build with configured limits (`BridgeConfig::max_pending`,
    /// `stale_timeout()`, `global_request_cap()`).
    pub fn with_limits(max_pending: usize, stale_timeout: Duration, global_request_cap: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            max_pending,
            stale_timeout,
            global_request_cap,
        }
    }

    fn mint_id(&self, background: bool) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let prefix = if background { "bg" } else { "req" };
        format!("{prefix}_{seq}_{}", now_epoch_ms())
    }

    /// Register a new pending request, evicting the oldest (by embedded
    /// epoch) if the table is already at the configured pending limit.
    /// Arms a timer for `min(callerTimeout, globalRequestCap)` that
    /// rejects with `Timeout` if nothing resolves it first. Returns the
    /// minted request id and a receiver that resolves on completion.
    pub async fn issue(
        self: &Arc<Self>,
        route: RouteTarget,
        caller_timeout: Option<Duration>,
        background: bool,
    ) -> (String, oneshot::Receiver<Result<Frame, BridgeError>>) {
        let request_id = self.mint_id(background);
        let timeout = caller_timeout.map(|t| t.min(self.global_request_cap)).unwrap_or(self.global_request_cap);
        let (tx, rx) = oneshot::channel();

        let mut pending = self.pending.lock().await;
        if pending.len() >= self.max_pending {
            if let Some(oldest_id) = pending
                .iter()
                .min_by_key(|(_, p)| p.embedded_epoch_ms)
                .map(|(id, _)| id.clone())
            {
                if let Some(evicted) = pending.remove(&oldest_id) {
                    let _ = evicted.completion.send(Err(BridgeError::BackPressure(
                        "pending-request queue full; evicted oldest".into(),
                    )));
                    debug!(evicted = %oldest_id, "pending queue full, evicted oldest");
                }
            }
        }

        pending.insert(
            request_id.clone(),
            PendingRequest {
                route,
                embedded_epoch_ms: now_epoch_ms(),
                timeout,
                deadline: std::time::Instant::now() + timeout,
                completion: tx,
            },
        );

        if pending.len() > PENDING_WARNING_THRESHOLD {
            warn!(pending = pending.len(), "pending-request table above warning threshold");
        }
        drop(pending);

        let correlator = Arc::clone(self);
        let timer_id = request_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            correlator.reject_if_still_pending(&timer_id, timeout).await;
        });

        (request_id, rx)
    }

    /// Fired by each request's own timer once its deadline has passed; a
    /// no-op if the request already resolved, was evicted, or was swept.
    async fn reject_if_still_pending(&self, request_id: &str, timeout: Duration) {
        let mut pending = self.pending.lock().await;
        if let Some(p) = pending.remove(request_id) {
            let _ = p.completion.send(Err(BridgeError::Timeout(timeout)));
        }
    }

    /// Resolve a pending request by id with the inbound `response` frame.
    /// Silently drops if the id is unknown (late arrival after timeout).
    pub async fn resolve(&self, request_id: &str, frame: Frame) {
        let mut pending = self.pending.lock().await;
        if let Some(p) = pending.remove(request_id) {
            let result = if frame.success.unwrap_or(true) {
                Ok(frame)
            } else if frame.error_kind.as_deref() == Some("routeFailure") {
                Err(BridgeError::RouteFailure(frame.error.unwrap_or_else(|| "no route to session".into())))
            } else {
                Err(BridgeError::OperationFailed(frame.error.unwrap_or_else(|| "unknown error".into())))
            };
            let _ = p.completion.send(result);
        }
    }

    /// Reject every pending request routed to `route` (peer disconnect).
    pub async fn reject_route(&self, route: &RouteTarget, reason: &str) {
        let mut pending = self.pending.lock().await;
        let dead: Vec<String> =
            pending.iter().filter(|(_, p)| &p.route == route).map(|(id, _)| id.clone()).collect();
        for id in dead {
            if let Some(p) = pending.remove(&id) {
                let _ = p.completion.send(Err(BridgeError::PeerGone(reason.to_string())));
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// One stale sweep pass: a backstop behind the per-request timer
    /// armed in [`Self::issue`]. Rejects two distinct cases: a request
    /// past its own deadline (`Timeout`, in case its timer task hasn't
    /// run yet) and a request merely older than the configured stale
    /// threshold regardless of deadline (`Staleness`, per §7). Returns
    /// the number rejected.
    pub async fn sweep_stale(&self) -> usize {
        let now = std::time::Instant::now();
        let now_epoch = now_epoch_ms();
        let mut pending = self.pending.lock().await;
        let expired: Vec<String> = pending
            .iter()
            .filter(|(_, p)| {
                now >= p.deadline
                    || now_epoch.saturating_sub(p.embedded_epoch_ms) > self.stale_timeout.as_millis() as u64
            })
            .map(|(id, _)| id.clone())
            .collect();
        let count = expired.len();
        for id in expired {
            if let Some(p) = pending.remove(&id) {
                let err = if now >= p.deadline { BridgeError::Timeout(p.timeout) } else { BridgeError::Staleness };
                let _ = p.completion.send(Err(err));
            }
        }
        count
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the periodic stale-sweep background task. Runs every
/// `sweep_interval` (`BridgeConfig::sweep_interval()`, [`SWEEP_INTERVAL`]
/// by default) until `cancel` fires.
pub fn spawn_sweeper(
    correlator: Arc<RequestCorrelator>,
    sweep_interval: Duration,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(sweep_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let rejected = correlator.sweep_stale().await;
                    if rejected > 0 {
                        debug!(rejected, "stale-request sweep pass");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn evicts_oldest_past_max_pending() {
        let c = Arc::new(RequestCorrelator::new());
        let mut receivers = Vec::new();
        for _ in 0..MAX_PENDING {
            let (_, rx) = c.issue(RouteTarget::Controller, None, false).await;
            receivers.push(rx);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(c.len().await, MAX_PENDING);

        let (_, rx_new) = c.issue(RouteTarget::Controller, None, false).await;
        assert_eq!(c.len().await, MAX_PENDING);

        let first = receivers.remove(0);
        let result = first.await.unwrap();
        assert!(matches!(result, Err(BridgeError::BackPressure(_))));
        drop(rx_new);
    }

    #[tokio::test]
    async fn resolve_exactly_once() {
        let c = Arc::new(RequestCorrelator::new());
        let (id, rx) = c.issue(RouteTarget::Controller, None, false).await;
        c.resolve(&id, Frame::response_ok(id.clone(), serde_json::json!({"ok": true}))).await;
        let result = rx.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(c.len().await, 0);
    }

    #[tokio::test]
    async fn operation_failure_is_distinct_from_peer_gone() {
        let c = Arc::new(RequestCorrelator::new());
        let (id, rx) = c.issue(RouteTarget::PageAgent("s1".into()), None, false).await;
        c.resolve(&id, Frame::response_err(id.clone(), "element not found")).await;
        match rx.await.unwrap() {
            Err(BridgeError::OperationFailed(msg)) => assert_eq!(msg, "element not found"),
            other => panic!("expected OperationFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn route_failure_marked_frame_resolves_as_route_failure() {
        let c = Arc::new(RequestCorrelator::new());
        let (id, rx) = c.issue(RouteTarget::PeerBridge("inst-b".into()), None, false).await;
        c.resolve(&id, Frame::route_failure_err(id.clone(), "no route to session 'session_x'")).await;
        assert!(matches!(rx.await.unwrap(), Err(BridgeError::RouteFailure(_))));
    }

    #[tokio::test]
    async fn disconnect_rejects_routed_pendings() {
        let c = Arc::new(RequestCorrelator::new());
        let (_, rx_a) = c.issue(RouteTarget::PageAgent("s1".into()), None, false).await;
        let (_, rx_b) = c.issue(RouteTarget::PageAgent("s2".into()), None, false).await;
        c.reject_route(&RouteTarget::PageAgent("s1".into()), "peer disconnected").await;
        assert!(matches!(rx_a.await.unwrap(), Err(BridgeError::PeerGone(_))));
        assert_eq!(c.len().await, 1);
        drop(rx_b);
    }

    #[tokio::test]
    async fn request_id_format() {
        let c = Arc::new(RequestCorrelator::new());
        let (id, _rx) = c.issue(RouteTarget::Controller, None, false).await;
        assert!(id.starts_with("req_"));
        let (bg_id, _rx2) = c.issue(RouteTarget::Controller, None, true).await;
        assert!(bg_id.starts_with("bg_"));
    }

    #[tokio::test]
    async fn per_request_timer_rejects_with_timeout() {
        let c = Arc::new(RequestCorrelator::with_limits(MAX_PENDING, STALE_TIMEOUT, Duration::from_millis(50)));
        let (_, rx) = c.issue(RouteTarget::Controller, None, false).await;
        match rx.await.unwrap() {
            Err(BridgeError::Timeout(d)) => assert_eq!(d, Duration::from_millis(50)),
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert_eq!(c.len().await, 0);
    }

    #[tokio::test]
    async fn sweep_stale_distinguishes_timeout_from_staleness() {
        // Bypass `issue`'s own timer task and plant two pending entries
        // directly, so the two branches of `sweep_stale` can be exercised
        // independently of each other's timing.
        let c = RequestCorrelator::with_limits(MAX_PENDING, Duration::from_millis(10), Duration::from_secs(60));
        let (tx_timeout, rx_timeout) = oneshot::channel();
        let (tx_stale, rx_stale) = oneshot::channel();
        {
            let mut pending = c.pending.lock().await;
            // Deadline already passed, but issued just now — too young to
            // trip the stale-age check on its own.
            pending.insert(
                "req_timeout".into(),
                PendingRequest {
                    route: RouteTarget::Controller,
                    embedded_epoch_ms: now_epoch_ms(),
                    timeout: Duration::from_secs(30),
                    deadline: std::time::Instant::now() - Duration::from_millis(1),
                    completion: tx_timeout,
                },
            );
            // Deadline far in the future, but old enough to trip the
            // stale-age check on its own.
            pending.insert(
                "req_stale".into(),
                PendingRequest {
                    route: RouteTarget::Controller,
                    embedded_epoch_ms: now_epoch_ms().saturating_sub(50),
                    timeout: Duration::from_secs(30),
                    deadline: std::time::Instant::now() + Duration::from_secs(30),
                    completion: tx_stale,
                },
            );
        }

        let rejected = c.sweep_stale().await;
        assert_eq!(rejected, 2);
        assert!(matches!(rx_timeout.await.unwrap(), Err(BridgeError::Timeout(_))));
        assert!(matches!(rx_stale.await.unwrap(), Err(BridgeError::Staleness)));
    }
}
