//! Resilient conversation streaming.
//!
//! [`ConversationStreamClient`] owns one session at a time and drives it
//! from a single task: stream events, reconnect timers, reachability
//! changes and caller commands are all handled there, in order.
//! [`ConnectivityPresenter`] turns reachability and reconnect status into
//! the banner or overlay the user sees.

pub mod backoff;
pub mod client;
pub mod monitor;
pub mod presenter;
pub mod reconnect;

pub use backoff::BackoffPolicy;
pub use client::{ClientDeps, ClientNotification, ConversationStreamClient, FatalError};
pub use monitor::{ConnectionType, NetworkMonitor, NetworkStatus};
pub use presenter::{
    spawn_presenter, ConnectivityHandle, ConnectivityPresenter, ConnectivityStatus,
    ConnectivityView,
};
pub use reconnect::{
    ControllerSnapshot, ReconnectController, ReconnectPhase, RetryPlan, RetryState, WaitReason,
};
