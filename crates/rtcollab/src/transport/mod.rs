pub mod connection;
pub mod reconnect;
pub mod router;

pub use connection::{ConnectionManager, ConnectionParams};
pub use reconnect::{transition, ConnectionEvent, ConnectionState, RetryAction, Transition};
pub use router::{EventRouter, HandlerId};
