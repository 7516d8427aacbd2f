//! Background token renewal and the events it publishes.

pub mod events;
pub mod scheduler;

pub use events::{ReauthReason, SessionEvent};
pub use scheduler::{RefreshSettings, SchedulerStatus, TokenRefreshScheduler};
