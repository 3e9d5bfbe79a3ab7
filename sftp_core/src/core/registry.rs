use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{broadcast, Mutex};

use crate::config::SessionConfig;
use crate::connections::errors::SftpError;
use crate::connections::transport::TransportFactory;
use crate::core::session::{wait_terminal, Session, SessionStatus};
use crate::events::LifecycleEvent;
use crate::storage::profile::ConnectionProfile;

/// Per-profile slot. Opening locks the slot, so concurrent opens of the same
/// profile queue up behind the first one instead of dialing twice.
type Slot = Arc<Mutex<Option<Arc<Session>>>>;

/// Tracks live sessions, at most one per profile id.
///
/// Like the connection manager it grew out of, the state is an
/// `Arc<Mutex<HashMap>>`, so clones share one table. The outer lock only
/// guards the profile → slot mapping and is never held across a connect.
#[derive(Clone)]
pub struct ConnectionRegistry {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    factory: Arc<dyn TransportFactory>,
    config: SessionConfig,
    events: broadcast::Sender<LifecycleEvent>,
}

impl ConnectionRegistry {
    pub fn new(factory: Arc<dyn TransportFactory>, config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            factory,
            config,
            events,
        }
    }

    /// Return the open session for `profile`, connecting one if needed.
    pub async fn open(&self, profile: &ConnectionProfile) -> Result<Arc<Session>, SftpError> {
        let slot = {
            let mut map = self.slots.lock().await;
            map.entry(profile.id.clone()).or_default().clone()
        };

        let mut current = slot.lock().await;
        if let Some(session) = current.as_ref() {
            if !session.status().is_terminal() {
                debug!("reusing session for profile {}", profile.id);
                return Ok(session.clone());
            }
            debug!("replacing {:?} session for profile {}", session.status(), profile.id);
        }

        let transport = self.factory.create(profile);
        match Session::connect(profile.clone(), transport, self.config.clone()).await {
            Ok(session) => {
                *current = Some(session.clone());
                drop(current);
                info!("profile {} connected", profile.id);
                let _ = self.events.send(LifecycleEvent::Connected {
                    profile_id: profile.id.clone(),
                });
                self.watch(slot, session.clone());
                Ok(session)
            }
            Err(e) => {
                *current = None;
                drop(current);
                let _ = self.events.send(LifecycleEvent::Failed {
                    profile_id: profile.id.clone(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// The open session for a profile, if any.
    pub async fn get(&self, profile_id: &str) -> Option<Arc<Session>> {
        let slot = self.slots.lock().await.get(profile_id).cloned()?;
        let current = slot.lock().await;
        let session = current
            .as_ref()
            .filter(|session| session.status().is_open())
            .cloned();
        session
    }

    /// Close the session of one profile. Returns `false` if there was none.
    pub async fn close(&self, profile_id: &str) -> bool {
        let Some(slot) = self.slots.lock().await.get(profile_id).cloned() else {
            return false;
        };
        let session = slot.lock().await.take();
        match session {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let slots: Vec<Slot> = self.slots.lock().await.values().cloned().collect();
        for slot in slots {
            let session = slot.lock().await.take();
            if let Some(session) = session {
                session.close().await;
            }
        }
        info!("all sessions closed");
    }

    /// Subscribe to lifecycle events of every profile.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the live sessions.
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        let slots: Vec<Slot> = self.slots.lock().await.values().cloned().collect();
        let mut out = Vec::new();
        for slot in slots {
            if let Some(session) = slot.lock().await.as_ref() {
                if session.status().is_open() {
                    out.push(session.clone());
                }
            }
        }
        out
    }

    /// Emit Disconnected/Failed once the session ends and free its slot.
    fn watch(&self, slot: Slot, session: Arc<Session>) {
        let events = self.events.clone();
        let mut status_rx = session.status_watch();
        let profile_id = session.profile_id().to_string();
        let weak = Arc::downgrade(&session);
        drop(session);

        tokio::spawn(async move {
            let status = wait_terminal(&mut status_rx).await;
            let ended = weak.upgrade();
            let failure = ended.as_ref().and_then(|s| s.failure());
            {
                let mut current = slot.lock().await;
                let ours = match (current.as_ref(), ended.as_ref()) {
                    (Some(held), Some(ended)) => Arc::ptr_eq(held, ended),
                    _ => false,
                };
                if ours {
                    *current = None;
                }
            }
            drop(ended);

            let event = match status {
                SessionStatus::Failed => {
                    let reason = failure
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "session failed".into());
                    warn!("profile {} session failed: {}", profile_id, reason);
                    LifecycleEvent::Failed { profile_id, reason }
                }
                _ => {
                    info!("profile {} disconnected", profile_id);
                    LifecycleEvent::Disconnected { profile_id }
                }
            };
            let _ = events.send(event);
        });
    }
}
