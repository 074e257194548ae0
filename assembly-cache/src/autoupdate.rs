//! Fan-out of committed change batches to connected sessions.
//!
//! Every batch is restricted once per distinct user and the resulting
//! message is shared (`Arc`) by all sessions of that user. Sends are
//! non-blocking: a session whose queue is full or closed is disconnected
//! and never delays the others. Such a client reconnects with its last
//! change id and catches up through `get_data_since`.
//!
//! Stats are tracked via atomics so `dispatch` takes only the read side of
//! the session registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::element::{no_delete_on_restriction, strip_internal_fields, Element, ElementId};
use crate::restriction::{RestrictionEngine, UserId};

/// A delta (or full dataset when `all_data`) as sent to clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoupdateMessage {
    pub changed: BTreeMap<String, Vec<Element>>,
    pub deleted: Vec<ElementId>,
    pub from_change_id: u64,
    pub to_change_id: u64,
    pub all_data: bool,
}

impl AutoupdateMessage {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }

    /// Number of changed elements over all collections.
    pub fn changed_count(&self) -> usize {
        self.changed.values().map(Vec::len).sum()
    }
}

/// Restrict a set of touched elements for `user` and split them into
/// changed and deleted. `user == None` returns the raw data.
pub(crate) fn restrict_changes<'a>(
    elements: impl IntoIterator<Item = (&'a ElementId, &'a Option<Element>)>,
    user: Option<UserId>,
    restrictions: &RestrictionEngine,
    computed_at: u64,
) -> (BTreeMap<String, Vec<Element>>, Vec<ElementId>) {
    let mut changed: BTreeMap<String, Vec<Element>> = BTreeMap::new();
    let mut deleted = Vec::new();

    for (element_id, data) in elements {
        let Some(element) = data else {
            deleted.push(element_id.clone());
            continue;
        };
        let visible = match user {
            None => Some(element.clone()),
            Some(user_id) => restrictions.restrict(element_id, element, user_id, computed_at),
        };
        match visible {
            Some(visible) => changed
                .entry(element_id.collection().to_string())
                .or_default()
                .push(strip_internal_fields(visible)),
            None if no_delete_on_restriction(element) => {}
            None => deleted.push(element_id.clone()),
        }
    }
    (changed, deleted)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("session queue is full")]
    Full,
    #[error("session is closed")]
    Closed,
}

/// Outbound side of one connected client.
pub trait SessionTransport: Send + Sync {
    /// Queue a message without waiting.
    fn send(&self, message: Arc<AutoupdateMessage>) -> Result<(), SendError>;

    /// Called once when the dispatcher drops the session.
    fn on_disconnect(&self);
}

/// Transport backed by a bounded mpsc channel.
///
/// `on_disconnect` drops the sender, so the receiver drains what is queued
/// and then yields `None`.
pub struct ChannelTransport {
    sender: Mutex<Option<mpsc::Sender<Arc<AutoupdateMessage>>>>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Arc<AutoupdateMessage>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender: Mutex::new(Some(sender)),
            },
            receiver,
        )
    }
}

impl SessionTransport for ChannelTransport {
    fn send(&self, message: Arc<AutoupdateMessage>) -> Result<(), SendError> {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        match sender.as_ref() {
            Some(sender) => sender.try_send(message).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendError::Full,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            }),
            None => Err(SendError::Closed),
        }
    }

    fn on_disconnect(&self) {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

/// Statistics for monitoring dispatch health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub batches_dispatched: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_sessions: usize,
}

struct Session {
    user_id: UserId,
    transport: Arc<dyn SessionTransport>,
}

#[derive(Default)]
struct AtomicDispatchStats {
    batches_dispatched: AtomicU64,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Registry of sessions plus the fan-out itself.
#[derive(Default)]
pub struct AutoupdateDispatcher {
    sessions: RwLock<HashMap<Uuid, Session>>,
    stats: AtomicDispatchStats,
}

impl AutoupdateDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and return its id.
    pub fn connect(&self, user_id: UserId, transport: Arc<dyn SessionTransport>) -> Uuid {
        let session_id = Uuid::new_v4();
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id, Session { user_id, transport });
        log::debug!("Session {session_id} connected for user {user_id}");
        session_id
    }

    /// Remove a session and notify its transport. Returns false if unknown.
    pub fn disconnect(&self, session_id: &Uuid) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        match removed {
            Some(session) => {
                session.transport.on_disconnect();
                log::debug!("Session {session_id} of user {} disconnected", session.user_id);
                true
            }
            None => false,
        }
    }

    pub fn disconnect_all(&self) {
        let sessions: Vec<Session> = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in &sessions {
            session.transport.on_disconnect();
        }
        if !sessions.is_empty() {
            log::info!("Disconnected {} autoupdate sessions", sessions.len());
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn has_session(&self, session_id: &Uuid) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(session_id)
    }

    /// Deliver batch `change_id` to every session, restricted per user.
    pub fn dispatch(
        &self,
        change_id: u64,
        batch: &[(ElementId, Option<Element>)],
        restrictions: &RestrictionEngine,
    ) {
        self.stats.batches_dispatched.fetch_add(1, Ordering::Relaxed);
        let mut failed = Vec::new();
        {
            let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            let mut per_user: HashMap<UserId, Option<Arc<AutoupdateMessage>>> = HashMap::new();

            for (session_id, session) in sessions.iter() {
                let message = per_user
                    .entry(session.user_id)
                    .or_insert_with(|| {
                        let (changed, deleted) = restrict_changes(
                            batch.iter().map(|(id, data)| (id, data)),
                            Some(session.user_id),
                            restrictions,
                            change_id,
                        );
                        let message = AutoupdateMessage {
                            changed,
                            deleted,
                            from_change_id: change_id.saturating_sub(1),
                            to_change_id: change_id,
                            all_data: false,
                        };
                        (!message.is_empty()).then(|| Arc::new(message))
                    })
                    .clone();

                let Some(message) = message else { continue };
                match session.transport.send(message) {
                    Ok(()) => {
                        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                        log::warn!("Dropping session {session_id} of user {}: {e}", session.user_id);
                        failed.push(*session_id);
                    }
                }
            }
        }

        for session_id in failed {
            self.disconnect(&session_id);
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            batches_dispatched: self.stats.batches_dispatched.load(Ordering::Relaxed),
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_sessions: self.session_count(),
        }
    }
}
