use dashmap::DashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::protocol::{EventKind, InboundEvent, InboundFrame};

/// Identifies a registered handler so it can be removed again
pub type HandlerId = Uuid;

type EventHandler = Arc<dyn Fn(&InboundEvent) + Send + Sync>;
type FrameHandler = Arc<dyn Fn(&InboundFrame) + Send + Sync>;

/// Typed publish/subscribe registry for inbound frames
///
/// Typed handlers are keyed by [`EventKind`] and receive the decoded
/// [`InboundEvent`]. Wildcard handlers receive every frame, including frame
/// types without a typed meaning. Handlers run in registration order and a
/// panicking handler never prevents the next one from running.
#[derive(Default)]
pub struct EventRouter {
    handlers: DashMap<EventKind, Vec<(HandlerId, EventHandler)>>,
    wildcard: RwLock<Vec<(HandlerId, FrameHandler)>>,
}

impl EventRouter {
    /// Create an empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        debug!("Registered handler {} for '{}'", id, kind);
        id
    }

    /// Register a handler that receives every inbound frame
    pub fn on_any<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&InboundFrame) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.wildcard
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove one handler for `kind`
    ///
    /// Returns true if the handler was registered.
    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        let Some(mut entry) = self.handlers.get_mut(&kind) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|(handler_id, _)| *handler_id != id);
        before != entry.len()
    }

    /// Remove every handler for `kind`
    pub fn off_all(&self, kind: EventKind) {
        self.handlers.remove(&kind);
    }

    /// Remove one wildcard handler
    pub fn off_any(&self, id: HandlerId) -> bool {
        let mut wildcard = self.wildcard.write().unwrap_or_else(PoisonError::into_inner);
        let before = wildcard.len();
        wildcard.retain(|(handler_id, _)| *handler_id != id);
        before != wildcard.len()
    }

    /// Remove all handlers
    pub fn clear(&self) {
        self.handlers.clear();
        self.wildcard
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of handlers registered for `kind`
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map(|entry| entry.len()).unwrap_or(0)
    }

    /// Number of wildcard handlers
    pub fn wildcard_count(&self) -> usize {
        self.wildcard
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Parse a text frame and dispatch it
    ///
    /// Malformed frames are logged and dropped. Returns whether the frame
    /// was dispatched.
    pub fn dispatch_text(&self, text: &str) -> bool {
        match InboundFrame::parse(text) {
            Ok(frame) => {
                self.dispatch(&frame);
                true
            }
            Err(e) => {
                warn!("Dropping malformed WebSocket frame: {}", e);
                false
            }
        }
    }

    /// Dispatch a frame to its typed handlers, then to every wildcard handler
    pub fn dispatch(&self, frame: &InboundFrame) {
        match InboundEvent::from_frame(frame) {
            Ok(Some(event)) => self.emit(&event),
            Ok(None) => debug!("No typed meaning for frame type '{}'", frame.kind),
            Err(e) => warn!("Failed to decode '{}' frame payload: {}", frame.kind, e),
        }

        let wildcard: Vec<FrameHandler> = self
            .wildcard
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in wildcard {
            if catch_unwind(AssertUnwindSafe(|| handler(frame))).is_err() {
                error!("Wildcard handler panicked on '{}' frame", frame.kind);
            }
        }
    }

    /// Deliver an event to the typed handlers of its kind
    ///
    /// Used for inbound frames and for events raised locally by the
    /// transport, such as read errors.
    pub fn emit(&self, event: &InboundEvent) {
        let kind = event.kind();
        // Clone the list so handlers may (un)register while we iterate
        let handlers: Vec<EventHandler> = self
            .handlers
            .get(&kind)
            .map(|entry| entry.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!("Handler for '{}' panicked", kind);
            }
        }
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("kinds", &self.handlers.len())
            .field("wildcard", &self.wildcard_count())
            .finish()
    }
}
