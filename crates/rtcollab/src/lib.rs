//! # rtcollab - Real-time Collaboration Transport
//!
//! Client-side transport for collaborative editing over WebSockets.
//!
//! A [`ConnectionManager`] owns one socket with heartbeat and bounded
//! reconnection, and dispatches inbound frames through an [`EventRouter`].
//! [`ResourceSession`] scopes a connection to one collaboration room,
//! [`NotificationChannel`] carries per-user push notifications, and
//! [`PresenceReconciler`] folds room events into who is present, typing and
//! where their cursors are.

pub mod config;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use config::{CollabConfig, ReconnectPolicy};
pub use error::{CollabError, CollabResult};
pub use presence::{CollaborationRoom, PresenceReconciler, PresenceSnapshot, PresenceView};
pub use protocol::{
    ActiveUser, CollaborationEvent, ErrorEvent, EventKind, Frame, InboundEvent, InboundFrame,
    Notification, OutboundMessage, ResourceIdentity, ResourceType,
};
pub use session::ResourceSession;
pub use transport::{ConnectionManager, ConnectionState, EventRouter, HandlerId};

#[cfg(feature = "notifications")]
pub use session::NotificationChannel;
