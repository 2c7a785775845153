//! Presence of the participants of one room.

pub mod reconciler;
pub mod room;

pub use reconciler::{PresenceReconciler, PresenceSnapshot, RemoteCursor, RemoteSelection};
pub use room::{CollaborationRoom, PresenceView};
