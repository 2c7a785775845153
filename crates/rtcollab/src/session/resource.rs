use serde_json::Value as JsonValue;
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

use crate::config::CollabConfig;
use crate::protocol::{
    ActiveUser, CollaborationEvent, ErrorEvent, EventKind, InboundEvent, OutboundMessage,
    ResourceIdentity, ResourceType,
};
use crate::transport::{ConnectionManager, EventRouter, HandlerId};
use crate::CollabResult;

/// A connection scoped to one collaboration room
///
/// At most one room is joined at a time: joining another room tears the
/// current one down first.
pub struct ResourceSession {
    connection: ConnectionManager,
    current: Mutex<Option<ResourceIdentity>>,
}

impl ResourceSession {
    /// Create a session that is not joined to any room
    pub fn new(config: CollabConfig) -> Self {
        Self {
            connection: ConnectionManager::new(config),
            current: Mutex::new(None),
        }
    }

    /// Join a room, leaving the current one first
    pub async fn join(&self, identity: ResourceIdentity, token: &str) -> CollabResult<()> {
        self.leave();

        let path = identity.room_path();
        self.set_current(Some(identity.clone()));

        match self.connection.connect(&path, Some(token)).await {
            Ok(()) => {
                info!("Joined collaboration room {}", identity);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to join collaboration room {}: {}", identity, e);
                self.set_current(None);
                Err(e)
            }
        }
    }

    /// Join a room given its parts
    pub async fn join_resource(
        &self,
        workspace_id: &str,
        resource_type: ResourceType,
        resource_id: &str,
        token: &str,
    ) -> CollabResult<()> {
        self.join(
            ResourceIdentity::new(workspace_id, resource_type, resource_id),
            token,
        )
        .await
    }

    /// Disconnect from the current room; a no-op when not joined
    pub fn leave(&self) {
        let Some(identity) = self.take_current() else {
            return;
        };
        self.connection.disconnect();
        info!("Left collaboration room {}", identity);
    }

    /// The room this session is joined to
    pub fn current(&self) -> Option<ResourceIdentity> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn router(&self) -> &EventRouter {
        self.connection.router()
    }

    fn set_current(&self, identity: Option<ResourceIdentity>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = identity;
    }

    fn take_current(&self) -> Option<ResourceIdentity> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    // Send-side vocabulary

    /// Broadcast an opaque list of edits
    pub fn send_content_change(&self, changes: Vec<JsonValue>, version: Option<u64>) {
        self.connection
            .send_message(&OutboundMessage::ContentChange { changes, version });
    }

    pub fn send_cursor_position(&self, position: JsonValue) {
        self.connection
            .send_message(&OutboundMessage::CursorPosition { position });
    }

    pub fn send_selection(&self, selection: JsonValue) {
        self.connection
            .send_message(&OutboundMessage::SelectionChange { selection });
    }

    /// Ask the server to persist the content
    pub fn save_content(&self, content: JsonValue, version: Option<u64>) {
        self.connection
            .send_message(&OutboundMessage::SaveContent { content, version });
    }

    pub fn start_typing(&self) {
        self.connection.send_message(&OutboundMessage::TypingStart {});
    }

    pub fn stop_typing(&self) {
        self.connection.send_message(&OutboundMessage::TypingStop {});
    }

    // Receive-side vocabulary

    pub fn on_content_change<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&CollaborationEvent) + Send + Sync + 'static,
    {
        self.on_collaboration(EventKind::ContentChange, handler)
    }

    pub fn on_cursor_position<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&CollaborationEvent) + Send + Sync + 'static,
    {
        self.on_collaboration(EventKind::CursorPosition, handler)
    }

    pub fn on_selection_change<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&CollaborationEvent) + Send + Sync + 'static,
    {
        self.on_collaboration(EventKind::SelectionChange, handler)
    }

    pub fn on_user_joined<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&CollaborationEvent) + Send + Sync + 'static,
    {
        self.on_collaboration(EventKind::UserJoined, handler)
    }

    pub fn on_user_left<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&CollaborationEvent) + Send + Sync + 'static,
    {
        self.on_collaboration(EventKind::UserLeft, handler)
    }

    /// Subscribe to full presence snapshots pushed by the server
    pub fn on_active_users<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&[ActiveUser]) + Send + Sync + 'static,
    {
        self.router().on(EventKind::ActiveUsers, move |event| {
            if let InboundEvent::ActiveUsers(users) = event {
                handler(users);
            }
        })
    }

    pub fn on_typing_start<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&CollaborationEvent) + Send + Sync + 'static,
    {
        self.on_collaboration(EventKind::TypingStart, handler)
    }

    pub fn on_typing_stop<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&CollaborationEvent) + Send + Sync + 'static,
    {
        self.on_collaboration(EventKind::TypingStop, handler)
    }

    pub fn on_content_saved<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&CollaborationEvent) + Send + Sync + 'static,
    {
        self.on_collaboration(EventKind::ContentSaved, handler)
    }

    /// Subscribe to server `error` frames and transport errors
    pub fn on_error<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        self.router().on(EventKind::Error, move |event| {
            if let InboundEvent::Error(error) = event {
                handler(error);
            }
        })
    }

    /// Remove a handler registered through one of the `on_*` methods
    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        self.router().off(kind, id)
    }

    fn on_collaboration<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&CollaborationEvent) + Send + Sync + 'static,
    {
        self.router().on(kind, move |event| {
            if let Some(payload) = event.collaboration() {
                handler(payload);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_new_session_is_not_joined() {
        let session = ResourceSession::new(CollabConfig::default());
        assert!(session.current().is_none());
        assert!(!session.is_connected());
    }

    #[test]
    fn test_leave_when_not_joined_is_noop() {
        let session = ResourceSession::new(CollabConfig::default());
        session.on_user_joined(|_| {});
        session.leave();
        // Nothing was torn down, so listeners survive
        assert_eq!(session.router().handler_count(EventKind::UserJoined), 1);
    }

    #[test]
    fn test_send_vocabulary_is_noop_when_disconnected() {
        let session = ResourceSession::new(CollabConfig::default());
        session.send_content_change(vec![json!({"insert": "x"})], Some(1));
        session.send_cursor_position(json!({"line": 1}));
        session.send_selection(json!({"from": 0, "to": 2}));
        session.save_content(json!("body"), None);
        session.start_typing();
        session.stop_typing();
        assert!(!session.is_connected());
    }

    #[test]
    fn test_typed_subscriptions_filter_by_kind() {
        let session = ResourceSession::new(CollabConfig::default());
        let cursors = Arc::new(AtomicUsize::new(0));
        let snapshots = Arc::new(AtomicUsize::new(0));

        let cursors_clone = cursors.clone();
        session.on_cursor_position(move |event| {
            assert_eq!(event.session_id.as_deref(), Some("s1"));
            cursors_clone.fetch_add(1, Ordering::SeqCst);
        });
        let snapshots_clone = snapshots.clone();
        session.on_active_users(move |users| {
            snapshots_clone.fetch_add(users.len(), Ordering::SeqCst);
        });

        let router = session.router();
        router.dispatch_text(
            r#"{"type":"cursor_position","session_id":"s1","position":{"line":3}}"#,
        );
        router.dispatch_text(r#"{"type":"selection_change","session_id":"s1"}"#);
        router.dispatch_text(
            r#"{"type":"active_users","users":[{"user_id":"u1","session_id":"s1"},{"user_id":"u2","session_id":"s2"}]}"#,
        );

        assert_eq!(cursors.load(Ordering::SeqCst), 1);
        assert_eq!(snapshots.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_join_keeps_no_params() {
        let session = ResourceSession::new(CollabConfig::new("ws://127.0.0.1:1"));
        let identity = ResourceIdentity::new("w1", ResourceType::Page, "p1");

        assert!(session.join(identity, "secret").await.is_err());
        assert!(session.current().is_none());
        assert!(session.connection().params().is_none());

        session.leave();
        assert!(session.connection().params().is_none());
    }

    #[test]
    fn test_off_removes_typed_subscription() {
        let session = ResourceSession::new(CollabConfig::default());
        let id = session.on_error(|_| {});
        assert!(session.off(EventKind::Error, id));
        assert_eq!(session.router().handler_count(EventKind::Error), 0);
    }
}
