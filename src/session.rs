//! Session registry: the bijective mapping between driver transport
//! sessions and automation (browser) sessions.
//!
//! In-memory only — no on-disk persistence, since the bridge collapses
//! all state on exit.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{BridgeError, BridgeResult};

#[derive(Debug, Clone)]
pub struct DriverSession {
    pub transport_id: String,
    pub browser_session_id: Option<String>,
    pub created_at: u64,
}

#[derive(Debug, Clone)]
pub struct TabInfo {
    pub handle: String,
    pub url: String,
    pub title: String,
    pub created_at: u64,
}

#[derive(Debug, Clone)]
pub struct AutomationSession {
    pub id: String,
    pub window_handle: Option<String>,
    pub active_tab_handle: Option<String>,
    pub tabs: Vec<TabInfo>,
    pub created_at: u64,
}

impl AutomationSession {
    fn new(id: String) -> Self {
        Self {
            id,
            window_handle: None,
            active_tab_handle: None,
            tabs: Vec::new(),
            created_at: now_secs(),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn new_session_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("session_{}", &hex[..8])
}

#[derive(Default)]
struct Inner {
    drivers: HashMap<String, DriverSession>,
    sessions: HashMap<String, AutomationSession>,
}

/// Maps driver transport ids to browser automation sessions. At most one
/// `browserSessionId` per `transportId`; the mapping is bijective on the
/// live set.
pub struct SessionRegistry {
    inner: RwLock<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self { inner: RwLock::new(Inner::default()) }
    }

    /// Register a driver transport, creating it if unseen.
    pub async fn touch_transport(&self, transport_id: &str) {
        let mut inner = self.inner.write().await;
        inner.drivers.entry(transport_id.to_string()).or_insert_with(|| DriverSession {
            transport_id: transport_id.to_string(),
            browser_session_id: None,
            created_at: now_secs(),
        });
    }

    /// Create (or return the existing) automation session bound to
    /// `transport_id`. Idempotent: a second call for the same transport
    /// returns the same `browserSessionId`.
    pub async fn new_browser_session(&self, transport_id: &str) -> BridgeResult<String> {
        let mut inner = self.inner.write().await;
        if let Some(driver) = inner.drivers.get(transport_id) {
            if let Some(existing) = &driver.browser_session_id {
                return Ok(existing.clone());
            }
        } else {
            return Err(BridgeError::PayloadInvalid(format!(
                "unknown transport '{transport_id}'"
            )));
        }

        let sid = new_session_id();
        inner.sessions.insert(sid.clone(), AutomationSession::new(sid.clone()));
        if let Some(driver) = inner.drivers.get_mut(transport_id) {
            driver.browser_session_id = Some(sid.clone());
        }
        Ok(sid)
    }

    pub async fn lookup_by_transport(&self, transport_id: &str) -> Option<String> {
        self.inner.read().await.drivers.get(transport_id).and_then(|d| d.browser_session_id.clone())
    }

    /// Resolve a transport to its bound session, or `NoSession`.
    pub async fn session_or_error(&self, transport_id: &str) -> BridgeResult<String> {
        self.lookup_by_transport(transport_id).await.ok_or(BridgeError::NoSession)
    }

    /// Drop the transport's binding. Idempotent. Returns the automation
    /// session id it was bound to, if any, so the caller can cascade a
    /// session close.
    pub async fn drop_transport(&self, transport_id: &str) -> Option<String> {
        let mut inner = self.inner.write().await;
        let driver = inner.drivers.remove(transport_id)?;
        driver.browser_session_id
    }

    pub async fn drop_session(&self, session_id: &str) {
        let mut inner = self.inner.write().await;
        inner.sessions.remove(session_id);
        for driver in inner.drivers.values_mut() {
            if driver.browser_session_id.as_deref() == Some(session_id) {
                driver.browser_session_id = None;
            }
        }
    }

    pub async fn get_session(&self, session_id: &str) -> Option<AutomationSession> {
        self.inner.read().await.sessions.get(session_id).cloned()
    }

    pub async fn update_session<F: FnOnce(&mut AutomationSession)>(&self, session_id: &str, f: F) {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.sessions.get_mut(session_id) {
            f(session);
        }
    }

    pub async fn active_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Reverse lookup: which transport currently owns `session_id`, if
    /// any. Used to route controller-originated events (e.g.
    /// `dialog_opened`) back to the owning driver by strict session
    /// ownership.
    pub async fn transport_for_session(&self, session_id: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .drivers
            .values()
            .find(|d| d.browser_session_id.as_deref() == Some(session_id))
            .map(|d| d.transport_id.clone())
    }

    pub async fn list_bindings(&self) -> Vec<(String, Option<String>)> {
        self.inner
            .read()
            .await
            .drivers
            .values()
            .map(|d| (d.transport_id.clone(), d.browser_session_id.clone()))
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_is_idempotent_per_transport() {
        let reg = SessionRegistry::new();
        reg.touch_transport("t1").await;
        let a = reg.new_browser_session("t1").await.unwrap();
        let b = reg.new_browser_session("t1").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn session_or_error_before_create() {
        let reg = SessionRegistry::new();
        reg.touch_transport("t1").await;
        assert!(matches!(reg.session_or_error("t1").await, Err(BridgeError::NoSession)));
    }

    #[tokio::test]
    async fn session_or_error_stable_after_create() {
        let reg = SessionRegistry::new();
        reg.touch_transport("t1").await;
        let sid = reg.new_browser_session("t1").await.unwrap();
        assert_eq!(reg.session_or_error("t1").await.unwrap(), sid);
        assert_eq!(reg.session_or_error("t1").await.unwrap(), sid);
    }

    #[tokio::test]
    async fn drop_transport_is_idempotent() {
        let reg = SessionRegistry::new();
        reg.touch_transport("t1").await;
        reg.new_browser_session("t1").await.unwrap();
        assert!(reg.drop_transport("t1").await.is_some());
        assert!(reg.drop_transport("t1").await.is_none());
    }
}
