pub mod resource;

#[cfg(feature = "notifications")]
pub mod notifications;

pub use resource::ResourceSession;

#[cfg(feature = "notifications")]
pub use notifications::NotificationChannel;
