//! Registry of authenticated sessions.
//!
//! Maps session ids to each session's outbox. The registry never owns a
//! session: dropping an entry only closes the outbox, and a session removes
//! its own entry when it ends. Deliveries never write to a transport
//! directly; the owning session drains its outbox onto its channel.

use chatgate_core::Envelope;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// A registered, authenticated session.
#[derive(Debug, Clone)]
struct Member {
    user_id: String,
    outbox: mpsc::Sender<Envelope>,
    registered_at: Instant,
}

/// Listing entry for a registered session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberInfo {
    pub session_id: String,
    pub user_id: String,
    pub connected_secs: u64,
}

/// Outcome of a fan-out delivery.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Recipients whose outbox accepted the envelope.
    pub delivered: usize,
    /// Recipients that were closed or had a full outbox.
    pub dropped: usize,
}

/// Process-wide table of authenticated, connected sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    members: RwLock<HashMap<String, Member>>,
}

impl SessionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated session's outbox under its id.
    pub async fn register(&self, session_id: &str, user_id: &str, outbox: mpsc::Sender<Envelope>) {
        let member = Member {
            user_id: user_id.to_string(),
            outbox,
            registered_at: Instant::now(),
        };
        let replaced = self
            .members
            .write()
            .await
            .insert(session_id.to_string(), member)
            .is_some();
        if replaced {
            warn!(session_id = %session_id, "session id registered twice, replacing entry");
        }
        info!(session_id = %session_id, user_id = %user_id, "session registered");
    }

    /// Remove a session. Returns whether it was registered.
    pub async fn unregister(&self, session_id: &str) -> bool {
        let removed = self.members.write().await.remove(session_id).is_some();
        if removed {
            debug!(session_id = %session_id, "session unregistered");
        }
        removed
    }

    /// Deliver to one session. Returns `false` if it is not registered or
    /// cannot accept the envelope.
    pub async fn send(&self, session_id: &str, envelope: Envelope) -> bool {
        let outbox = match self.members.read().await.get(session_id) {
            Some(member) => member.outbox.clone(),
            None => return false,
        };
        match outbox.try_send(envelope) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(session_id = %session_id, "outbox full, dropping envelope");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.evict(&[session_id.to_string()]).await;
                false
            }
        }
    }

    /// Deliver to every registered session.
    pub async fn broadcast(&self, envelope: &Envelope) -> BroadcastReport {
        self.fan_out(None, envelope).await
    }

    /// Deliver to every registered session except `sender`.
    pub async fn broadcast_except(&self, sender: &str, envelope: &Envelope) -> BroadcastReport {
        self.fan_out(Some(sender), envelope).await
    }

    async fn fan_out(&self, except: Option<&str>, envelope: &Envelope) -> BroadcastReport {
        // Snapshot recipients, then deliver without holding the lock.
        let recipients: Vec<(String, mpsc::Sender<Envelope>)> = {
            let members = self.members.read().await;
            members
                .iter()
                .filter(|(id, _)| Some(id.as_str()) != except)
                .map(|(id, m)| (id.clone(), m.outbox.clone()))
                .collect()
        };

        let mut report = BroadcastReport::default();
        let mut stale = Vec::new();
        for (id, outbox) in recipients {
            match outbox.try_send(envelope.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(session_id = %id, "outbox full, skipping recipient");
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(session_id = %id, "recipient closed during broadcast");
                    report.dropped += 1;
                    stale.push(id);
                }
            }
        }

        if !stale.is_empty() {
            self.evict(&stale).await;
        }

        debug!(
            msg_type = %envelope.msg_type,
            delivered = report.delivered,
            dropped = report.dropped,
            "broadcast complete"
        );
        report
    }

    /// Drop entries whose outbox has closed.
    async fn evict(&self, ids: &[String]) {
        let mut members = self.members.write().await;
        for id in ids {
            if members.get(id).is_some_and(|m| m.outbox.is_closed()) {
                members.remove(id);
                info!(session_id = %id, "evicted closed session");
            }
        }
    }

    /// Whether a session id is registered.
    pub async fn contains(&self, session_id: &str) -> bool {
        self.members.read().await.contains_key(session_id)
    }

    /// Number of registered sessions.
    pub async fn count(&self) -> usize {
        self.members.read().await.len()
    }

    /// List all registered sessions.
    pub async fn list(&self) -> Vec<MemberInfo> {
        let members = self.members.read().await;
        let mut list: Vec<MemberInfo> = members
            .iter()
            .map(|(id, m)| MemberInfo {
                session_id: id.clone(),
                user_id: m.user_id.clone(),
                connected_secs: m.registered_at.elapsed().as_secs(),
            })
            .collect();
        list.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        list
    }

    /// Remove every entry. Each session sees its outbox close and shuts down.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<String> = self.members.write().await.drain().map(|(id, _)| id).collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "closed all registered sessions");
        }
        drained.len()
    }
}
