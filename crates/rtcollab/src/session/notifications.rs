use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use crate::config::CollabConfig;
use crate::protocol::{ErrorEvent, EventKind, InboundEvent, Notification, OutboundMessage};
use crate::transport::{ConnectionManager, HandlerId};
use crate::CollabResult;

/// Endpoint path of the user-scoped notification channel
pub const NOTIFICATIONS_PATH: &str = "ws/notifications/";

/// Push-notification connection for the signed-in user
///
/// Owns its own [`ConnectionManager`], independent of any room. The most
/// recent notifications are buffered, newest first.
pub struct NotificationChannel {
    connection: ConnectionManager,
    recent: Arc<Mutex<VecDeque<Notification>>>,
    recorder: Mutex<Option<HandlerId>>,
}

impl NotificationChannel {
    pub fn new(config: CollabConfig) -> Self {
        Self {
            connection: ConnectionManager::new(config),
            recent: Arc::new(Mutex::new(VecDeque::new())),
            recorder: Mutex::new(None),
        }
    }

    /// Connect to the notification channel
    pub async fn connect(&self, token: &str) -> CollabResult<()> {
        self.install_recorder();
        self.connection.connect(NOTIFICATIONS_PATH, Some(token)).await?;
        info!("Notification channel connected");
        Ok(())
    }

    /// Disconnect, dropping every listener and the buffered notifications
    pub fn disconnect(&self) {
        self.connection.disconnect();
        *self.recorder.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.clear_recent();
    }

    /// Tell the server a notification has been read
    pub fn mark_as_read(&self, notification_id: impl Into<String>) {
        self.connection.send_message(&OutboundMessage::MarkRead {
            notification_id: notification_id.into(),
        });
    }

    pub fn on_notification<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.connection
            .router()
            .on(EventKind::Notification, move |event| {
                if let InboundEvent::Notification(notification) = event {
                    handler(notification);
                }
            })
    }

    pub fn on_error<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        self.connection.router().on(EventKind::Error, move |event| {
            if let InboundEvent::Error(error) = event {
                handler(error);
            }
        })
    }

    /// Recently received notifications, newest first
    pub fn recent(&self) -> Vec<Notification> {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear_recent(&self) {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Register the handler that fills the recent buffer, replacing a
    /// previous registration
    fn install_recorder(&self) {
        let router = self.connection.router();
        let mut recorder = self.recorder.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = recorder.take() {
            router.off(EventKind::Notification, id);
        }

        let capacity = self.connection.config().recent_notifications;
        let recent = self.recent.clone();
        let id = router.on(EventKind::Notification, move |event| {
            let InboundEvent::Notification(notification) = event else {
                return;
            };
            debug!("Received notification {:?}", notification.id);
            let mut recent = recent.lock().unwrap_or_else(PoisonError::into_inner);
            recent.push_front(notification.clone());
            recent.truncate(capacity);
        });
        *recorder = Some(id);
    }
}
