use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::CollabConfig;
use crate::presence::PresenceReconciler;
use crate::protocol::{ActiveUser, CollaborationEvent, EventKind, InboundEvent, ResourceIdentity};
use crate::session::ResourceSession;
use crate::transport::{ConnectionState, EventRouter, HandlerId};
use crate::CollabResult;

/// Error recorded when a room cannot be joined
pub const JOIN_FAILED: &str = "Failed to connect to collaboration service";

/// Consumer-facing view of a room
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceView {
    pub is_connected: bool,
    pub error: Option<String>,
    pub active_users_list: Vec<ActiveUser>,
    pub typing_users: Vec<ActiveUser>,
}

/// A [`ResourceSession`] with presence reconciled against it
///
/// Content listeners registered on the room survive switching rooms; they
/// are kept apart from the session's router, which is cleared on leave.
/// Presence is dropped whenever the connection is lost, including when
/// reconnection gives up.
pub struct CollaborationRoom {
    session: ResourceSession,
    presence: Arc<PresenceReconciler>,
    content: Arc<EventRouter>,
    attached: Mutex<Vec<(EventKind, HandlerId)>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl CollaborationRoom {
    pub fn new(config: CollabConfig, local_user_id: impl Into<String>) -> Self {
        Self {
            session: ResourceSession::new(config),
            presence: Arc::new(PresenceReconciler::new(local_user_id)),
            content: Arc::new(EventRouter::new()),
            attached: Mutex::new(Vec::new()),
            watcher: Mutex::new(None),
        }
    }

    /// Join a room with fresh presence, leaving the current one first
    pub async fn join(&self, identity: ResourceIdentity, token: &str) -> CollabResult<()> {
        self.leave();
        self.presence.reset();
        self.attach();
        self.watch_connection();

        match self.session.join(identity, token).await {
            Ok(()) => {
                self.presence.set_error(None);
                Ok(())
            }
            Err(e) => {
                self.presence.set_error(Some(JOIN_FAILED.to_string()));
                Err(e)
            }
        }
    }

    /// Leave the current room and drop its presence
    pub fn leave(&self) {
        self.detach();
        self.session.leave();
        self.presence.clear();
    }

    pub fn current(&self) -> Option<ResourceIdentity> {
        self.session.current()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn view(&self) -> PresenceView {
        let is_connected = self.is_connected();
        let local_user_id = self.presence.local_user_id();
        self.presence.with_snapshot(|snapshot| PresenceView {
            is_connected,
            error: snapshot.error.clone(),
            active_users_list: snapshot.active_users_excluding(local_user_id),
            typing_users: snapshot.typing_users_excluding(local_user_id),
        })
    }

    pub fn presence(&self) -> &Arc<PresenceReconciler> {
        &self.presence
    }

    pub fn session(&self) -> &ResourceSession {
        &self.session
    }

    pub fn send_content_change(&self, changes: Vec<JsonValue>, version: Option<u64>) {
        if self.is_connected() {
            self.session.send_content_change(changes, version);
        }
    }

    pub fn send_cursor_position(&self, position: JsonValue) {
        if self.is_connected() {
            self.session.send_cursor_position(position);
        }
    }

    pub fn send_selection(&self, selection: JsonValue) {
        if self.is_connected() {
            self.session.send_selection(selection);
        }
    }

    pub fn save_content(&self, content: JsonValue, version: Option<u64>) {
        if self.is_connected() {
            self.session.save_content(content, version);
        }
    }

    pub fn start_typing(&self) {
        if self.is_connected() {
            self.session.start_typing();
        }
    }

    pub fn stop_typing(&self) {
        if self.is_connected() {
            self.session.stop_typing();
        }
    }

    /// Listen for remote edits in whichever room is joined
    pub fn on_content_change<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&CollaborationEvent) + Send + Sync + 'static,
    {
        self.on_content(EventKind::ContentChange, handler)
    }

    /// Listen for save confirmations in whichever room is joined
    pub fn on_save<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&CollaborationEvent) + Send + Sync + 'static,
    {
        self.on_content(EventKind::ContentSaved, handler)
    }

    pub fn off_content_change(&self, id: HandlerId) -> bool {
        self.content.off(EventKind::ContentChange, id)
    }

    pub fn off_save(&self, id: HandlerId) -> bool {
        self.content.off(EventKind::ContentSaved, id)
    }

    fn on_content<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&CollaborationEvent) + Send + Sync + 'static,
    {
        self.content.on(kind, move |event| {
            if let Some(payload) = event.collaboration() {
                handler(payload);
            }
        })
    }

    fn attach(&self) {
        let router = self.session.router();
        let mut attached = self.presence.attach(router);

        for kind in [EventKind::ContentChange, EventKind::ContentSaved] {
            let content = self.content.clone();
            let id = router.on(kind, move |event: &InboundEvent| content.emit(event));
            attached.push((kind, id));
        }

        debug!("Attached {} room handlers", attached.len());
        *self.attached.lock().unwrap_or_else(PoisonError::into_inner) = attached;
    }

    /// Drop presence whenever the connection is lost
    fn watch_connection(&self) {
        let mut states = self.session.connection().state_changes();
        let presence = self.presence.clone();
        let watcher = tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                if matches!(
                    state,
                    ConnectionState::Reconnecting { .. } | ConnectionState::Failed
                ) {
                    info!("Connection lost ({:?}), clearing presence", state);
                    presence.clear();
                }
            }
        });

        let previous = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(watcher);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn detach(&self) {
        if let Some(watcher) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }

        let router = self.session.router();
        let attached =
            std::mem::take(&mut *self.attached.lock().unwrap_or_else(PoisonError::into_inner));
        for (kind, id) in attached {
            router.off(kind, id);
        }
    }
}

impl Drop for CollaborationRoom {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::protocol::ResourceType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_test::assert_err;

    fn room() -> CollaborationRoom {
        CollaborationRoom::new(CollabConfig::default(), "me")
    }

    #[test]
    fn test_view_of_fresh_room() {
        let view = room().view();
        assert!(!view.is_connected);
        assert!(view.error.is_none());
        assert!(view.active_users_list.is_empty());
        assert!(view.typing_users.is_empty());
    }

    #[test]
    fn test_attached_handlers_feed_presence() {
        let room = room();
        room.attach();

        let router = room.session().router();
        router.dispatch_text(r#"{"type":"user_joined","session_id":"s1","user_id":"other"}"#);
        router.dispatch_text(r#"{"type":"user_joined","session_id":"s2","user_id":"me"}"#);
        router.dispatch_text(r#"{"type":"typing_start","session_id":"s1","user_id":"other"}"#);

        let view = room.view();
        assert_eq!(view.active_users_list.len(), 1);
        assert_eq!(view.active_users_list[0].user_id, "other");
        assert_eq!(view.typing_users.len(), 1);
    }

    #[test]
    fn test_view_matches_snapshot() {
        let room = room();
        room.attach();

        let router = room.session().router();
        router.dispatch_text(r#"{"type":"user_joined","session_id":"s1","user_id":"other"}"#);
        router.dispatch_text(r#"{"type":"typing_start","session_id":"s1","user_id":"other"}"#);
        router.dispatch_text(r#"{"type":"error","message":"Unknown message type"}"#);

        let view = room.view();
        let snapshot = room.presence().snapshot();
        assert_eq!(view.error, snapshot.error);
        assert_eq!(view.active_users_list, snapshot.active_users_excluding("me"));
        assert_eq!(view.typing_users, snapshot.typing_users_excluding("me"));
        assert_eq!(view.typing_users.len(), 1);
    }

    #[test]
    fn test_content_listeners_survive_leave() {
        let room = room();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        room.on_content_change(move |event| {
            assert_eq!(event.changes.as_ref().map(Vec::len), Some(1));
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        room.attach();
        room.session()
            .router()
            .dispatch_text(r#"{"type":"content_change","changes":[{"insert":"a"}]}"#);
        room.leave();
        room.attach();
        room.session()
            .router()
            .dispatch_text(r#"{"type":"content_change","changes":[{"insert":"b"}]}"#);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reattach_does_not_duplicate_handlers() {
        let room = room();
        room.attach();
        room.detach();
        room.attach();

        let router = room.session().router();
        assert_eq!(router.handler_count(EventKind::UserJoined), 1);
        assert_eq!(router.handler_count(EventKind::ContentChange), 1);
    }

    #[tokio::test]
    async fn test_failed_join_records_error() {
        let config = CollabConfig::new("ws://127.0.0.1:1").with_reconnect(ReconnectPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(10),
        });
        let room = CollaborationRoom::new(config, "me");
        let identity = ResourceIdentity::new("w1", ResourceType::Page, "p1");

        assert_err!(room.join(identity.clone(), "secret").await);
        assert_eq!(room.view().error.as_deref(), Some(JOIN_FAILED));
        assert!(room.current().is_none());

        // A second failed join leaves exactly one set of handlers behind
        assert_err!(room.join(identity, "secret").await);
        assert_eq!(
            room.session().router().handler_count(EventKind::UserJoined),
            1
        );
    }
}
