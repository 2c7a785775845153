use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::protocol::{ActiveUser, CollaborationEvent, EventKind, InboundEvent};
use crate::transport::{EventRouter, HandlerId};

/// Frame kinds the reconciler folds into presence
pub const PRESENCE_KINDS: [EventKind; 8] = [
    EventKind::UserJoined,
    EventKind::UserLeft,
    EventKind::ActiveUsers,
    EventKind::CursorPosition,
    EventKind::SelectionChange,
    EventKind::TypingStart,
    EventKind::TypingStop,
    EventKind::Error,
];

/// Last known cursor of a remote session
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub position: Option<JsonValue>,
}

/// Last known selection of a remote session
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSelection {
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub selection: Option<JsonValue>,
}

/// Presence of one room, keyed by session id
///
/// A session removed from `active_users` is removed from the other maps in
/// the same step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceSnapshot {
    /// Arrival order, unique by `session_id`
    pub active_users: Vec<ActiveUser>,
    pub is_typing: HashMap<String, bool>,
    pub cursors: HashMap<String, RemoteCursor>,
    pub selections: HashMap<String, RemoteSelection>,
    pub error: Option<String>,
}

impl PresenceSnapshot {
    /// Fold one event into the snapshot; returns whether anything changed
    pub fn apply(&mut self, event: &InboundEvent) -> bool {
        match event {
            InboundEvent::UserJoined(event) => self.user_joined(event),
            InboundEvent::UserLeft(event) => match event.session_id.as_deref() {
                Some(session_id) => self.remove_session(session_id),
                None => false,
            },
            InboundEvent::ActiveUsers(users) => {
                // Authoritative resync: replace, never merge
                self.active_users = dedup_sessions(users);
                true
            }
            InboundEvent::CursorPosition(event) => {
                let Some(session_id) = event.session_id.clone() else {
                    return false;
                };
                self.cursors.insert(
                    session_id,
                    RemoteCursor {
                        user_id: event.user_id.clone(),
                        user_name: event.user_name.clone(),
                        position: event.position.clone(),
                    },
                );
                true
            }
            InboundEvent::SelectionChange(event) => {
                let Some(session_id) = event.session_id.clone() else {
                    return false;
                };
                self.selections.insert(
                    session_id,
                    RemoteSelection {
                        user_id: event.user_id.clone(),
                        user_name: event.user_name.clone(),
                        selection: event.selection.clone(),
                    },
                );
                true
            }
            InboundEvent::TypingStart(event) => self.set_typing(event, true),
            InboundEvent::TypingStop(event) => self.set_typing(event, false),
            InboundEvent::Error(error) => {
                self.error = Some(error.description().to_string());
                true
            }
            InboundEvent::ContentChange(_)
            | InboundEvent::ContentSaved(_)
            | InboundEvent::Notification(_)
            | InboundEvent::Pong => false,
        }
    }

    pub fn contains_session(&self, session_id: &str) -> bool {
        self.active_users
            .iter()
            .any(|user| user.session_id == session_id)
    }

    /// Remove every trace of a session; returns whether it was known
    pub fn remove_session(&mut self, session_id: &str) -> bool {
        let before = self.active_users.len();
        self.active_users.retain(|user| user.session_id != session_id);
        let typing = self.is_typing.remove(session_id).is_some();
        let cursor = self.cursors.remove(session_id).is_some();
        let selection = self.selections.remove(session_id).is_some();
        before != self.active_users.len() || typing || cursor || selection
    }

    /// Drop all presence, keeping the error; returns whether anything was held
    pub fn clear_presence(&mut self) -> bool {
        let held = !(self.active_users.is_empty()
            && self.is_typing.is_empty()
            && self.cursors.is_empty()
            && self.selections.is_empty());
        self.active_users.clear();
        self.is_typing.clear();
        self.cursors.clear();
        self.selections.clear();
        held
    }

    /// Active users other than `local_user_id`
    pub fn active_users_excluding(&self, local_user_id: &str) -> Vec<ActiveUser> {
        self.active_users
            .iter()
            .filter(|user| user.user_id != local_user_id)
            .cloned()
            .collect()
    }

    /// Active users currently typing, other than `local_user_id`
    pub fn typing_users_excluding(&self, local_user_id: &str) -> Vec<ActiveUser> {
        self.active_users
            .iter()
            .filter(|user| user.user_id != local_user_id)
            .filter(|user| self.is_typing.get(&user.session_id).copied().unwrap_or(false))
            .cloned()
            .collect()
    }

    fn user_joined(&mut self, event: &CollaborationEvent) -> bool {
        let Some(session_id) = event.session_id.clone() else {
            debug!("Ignoring user_joined without session_id");
            return false;
        };
        if self.contains_session(&session_id) {
            return false;
        }

        self.active_users.push(ActiveUser {
            user_id: event.user_id.clone().unwrap_or_default(),
            user_name: event.user_name.clone().unwrap_or_default(),
            session_id,
            last_seen: event
                .timestamp
                .clone()
                .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
        });
        true
    }

    fn set_typing(&mut self, event: &CollaborationEvent, typing: bool) -> bool {
        let Some(session_id) = event.session_id.clone() else {
            return false;
        };
        self.is_typing.insert(session_id, typing) != Some(typing)
    }
}

fn dedup_sessions(users: &[ActiveUser]) -> Vec<ActiveUser> {
    let mut unique: Vec<ActiveUser> = Vec::with_capacity(users.len());
    for user in users {
        if !unique.iter().any(|u| u.session_id == user.session_id) {
            unique.push(user.clone());
        }
    }
    unique
}

/// Folds room events into a [`PresenceSnapshot`] and publishes it
///
/// The reconciler is the only writer of the snapshot; everybody else reads
/// clones or watches it through [`PresenceReconciler::subscribe`].
#[derive(Debug)]
pub struct PresenceReconciler {
    local_user_id: String,
    state: watch::Sender<PresenceSnapshot>,
}

impl PresenceReconciler {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        let (state, _) = watch::channel(PresenceSnapshot::default());
        Self {
            local_user_id: local_user_id.into(),
            state,
        }
    }

    /// Id of the user this client is signed in as
    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Fold one event into the snapshot
    pub fn apply(&self, event: &InboundEvent) {
        self.state.send_if_modified(|snapshot| snapshot.apply(event));
    }

    /// Register handlers for every presence event on `router`
    pub fn attach(self: &Arc<Self>, router: &EventRouter) -> Vec<(EventKind, HandlerId)> {
        PRESENCE_KINDS
            .into_iter()
            .map(|kind| {
                let reconciler = self.clone();
                let id = router.on(kind, move |event| reconciler.apply(event));
                (kind, id)
            })
            .collect()
    }

    /// Drop all presence (teardown), keeping the error
    pub fn clear(&self) {
        self.state.send_if_modified(PresenceSnapshot::clear_presence);
    }

    /// Drop all presence and the error
    pub fn reset(&self) {
        self.state.send_replace(PresenceSnapshot::default());
    }

    pub fn set_error(&self, error: Option<String>) {
        self.state.send_if_modified(|snapshot| {
            if snapshot.error == error {
                return false;
            }
            snapshot.error = error;
            true
        });
    }

    pub fn error(&self) -> Option<String> {
        self.state.borrow().error.clone()
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        self.state.borrow().clone()
    }

    /// Read the current snapshot without cloning it
    pub fn with_snapshot<R>(&self, read: impl FnOnce(&PresenceSnapshot) -> R) -> R {
        read(&self.state.borrow())
    }

    /// Watch the snapshot for changes
    pub fn subscribe(&self) -> watch::Receiver<PresenceSnapshot> {
        self.state.subscribe()
    }

    /// Remote participants; the local user is never listed
    pub fn active_users_list(&self) -> Vec<ActiveUser> {
        self.state
            .borrow()
            .active_users_excluding(&self.local_user_id)
    }

    /// Remote participants that are typing
    pub fn typing_users(&self) -> Vec<ActiveUser> {
        self.state
            .borrow()
            .typing_users_excluding(&self.local_user_id)
    }
}
