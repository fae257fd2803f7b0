//! User-facing connectivity state.
//!
//! [`ConnectivityPresenter`] is a pure function of reachability, the
//! reconnect snapshot and the clock. Elapsed time escalates the overlay
//! message; the final stage and its retry button follow the controller's
//! `auto_retry` flag alone.

use std::time::Duration;

use serde::Serialize;
use stride_settings::ConnectivitySettings;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::monitor::NetworkStatus;
use crate::reconnect::{ControllerSnapshot, ReconnectPhase};

pub const MESSAGE_RECONNECTING: &str = "Reconnecting...";
pub const MESSAGE_STILL_TRYING: &str = "Still trying to reconnect...";
pub const MESSAGE_TAKING_LONGER: &str = "Connection is taking longer than usual...";
pub const MESSAGE_UNABLE: &str = "Unable to reconnect";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityStatus {
    #[default]
    Online,
    Offline,
    Reconnecting,
    BackOnline,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum ConnectivityView {
    #[default]
    Hidden,
    OfflineBanner,
    ReconnectingOverlay {
        message: &'static str,
        show_retry_button: bool,
    },
    BackOnlineBanner {
        auto_dismiss_after: Duration,
    },
}

impl ConnectivityView {
    pub fn status(&self) -> ConnectivityStatus {
        match self {
            Self::Hidden => ConnectivityStatus::Online,
            Self::OfflineBanner => ConnectivityStatus::Offline,
            Self::ReconnectingOverlay { .. } => ConnectivityStatus::Reconnecting,
            Self::BackOnlineBanner { .. } => ConnectivityStatus::BackOnline,
        }
    }
}

pub struct ConnectivityPresenter {
    medium: Duration,
    long: Duration,
    back_online_display: Duration,
    view: ConnectivityView,
    /// Offline or reconnecting has been shown since the last recovery.
    in_episode: bool,
    /// While set, the back-online banner is visible.
    banner_until: Option<Instant>,
    /// Recoveries before this instant do not show the banner again.
    quiet_until: Option<Instant>,
}

impl ConnectivityPresenter {
    pub fn new(settings: &ConnectivitySettings) -> Self {
        Self {
            medium: Duration::from_millis(settings.medium_threshold_ms),
            long: Duration::from_millis(settings.long_threshold_ms),
            back_online_display: Duration::from_millis(settings.back_online_display_ms),
            view: ConnectivityView::Hidden,
            in_episode: false,
            banner_until: None,
            quiet_until: None,
        }
    }

    pub fn view(&self) -> &ConnectivityView {
        &self.view
    }

    /// Overlay message while auto-retry is still running.
    pub fn message_for(&self, elapsed: Duration) -> &'static str {
        if elapsed >= self.long {
            MESSAGE_TAKING_LONGER
        } else if elapsed >= self.medium {
            MESSAGE_STILL_TRYING
        } else {
            MESSAGE_RECONNECTING
        }
    }

    /// Recompute the view. Returns the new view when it changed.
    pub fn update(
        &mut self,
        network: &NetworkStatus,
        controller: &ControllerSnapshot,
        now: Instant,
    ) -> Option<ConnectivityView> {
        let next = self.derive(network, controller, now);
        if next == self.view {
            return None;
        }
        debug!(from = ?self.view, to = ?next, "connectivity view changed");
        self.view = next.clone();
        Some(next)
    }

    fn derive(
        &mut self,
        network: &NetworkStatus,
        controller: &ControllerSnapshot,
        now: Instant,
    ) -> ConnectivityView {
        if !network.reachable {
            self.in_episode = true;
            self.banner_until = None;
            return ConnectivityView::OfflineBanner;
        }

        if controller.is_reconnecting() {
            self.in_episode = true;
            self.banner_until = None;
            if !controller.auto_retry {
                return ConnectivityView::ReconnectingOverlay {
                    message: MESSAGE_UNABLE,
                    show_retry_button: true,
                };
            }
            let elapsed = controller.disconnected_for(now).unwrap_or_default();
            return ConnectivityView::ReconnectingOverlay {
                message: self.message_for(elapsed),
                show_retry_button: false,
            };
        }

        let recovered = matches!(
            controller.phase,
            ReconnectPhase::Streaming | ReconnectPhase::Idle | ReconnectPhase::Connecting
        );
        if self.in_episode {
            self.in_episode = false;
            let flapping = self.quiet_until.is_some_and(|quiet| now < quiet);
            if recovered && !flapping {
                let until = now + self.back_online_display;
                self.banner_until = Some(until);
                self.quiet_until = Some(until);
                return ConnectivityView::BackOnlineBanner {
                    auto_dismiss_after: self.back_online_display,
                };
            }
            return ConnectivityView::Hidden;
        }

        match self.banner_until {
            Some(until) if now < until => ConnectivityView::BackOnlineBanner {
                auto_dismiss_after: self.back_online_display,
            },
            _ => {
                self.banner_until = None;
                ConnectivityView::Hidden
            }
        }
    }

    /// Next instant the view changes without new input.
    pub fn next_wakeup(&self, controller: &ControllerSnapshot, now: Instant) -> Option<Instant> {
        if let Some(until) = self.banner_until {
            return Some(until);
        }
        if !matches!(self.view, ConnectivityView::ReconnectingOverlay { .. }) {
            return None;
        }
        let since = controller.retry.disconnected_since?;
        [self.medium, self.long]
            .into_iter()
            .map(|threshold| since + threshold)
            .find(|at| *at > now)
    }
}

/// Running presenter: publishes the view and derived status.
pub struct ConnectivityHandle {
    view: watch::Receiver<ConnectivityView>,
    status: watch::Receiver<ConnectivityStatus>,
    task: JoinHandle<()>,
}

impl ConnectivityHandle {
    pub fn view(&self) -> watch::Receiver<ConnectivityView> {
        self.view.clone()
    }

    pub fn status(&self) -> watch::Receiver<ConnectivityStatus> {
        self.status.clone()
    }
}

impl Drop for ConnectivityHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawn the presenter loop. Must be called inside a tokio runtime.
pub fn spawn_presenter(
    settings: &ConnectivitySettings,
    network: watch::Receiver<NetworkStatus>,
    controller: watch::Receiver<ControllerSnapshot>,
) -> ConnectivityHandle {
    let (view_tx, view_rx) = watch::channel(ConnectivityView::Hidden);
    let (status_tx, status_rx) = watch::channel(ConnectivityStatus::Online);
    let presenter = ConnectivityPresenter::new(settings);
    let task = tokio::spawn(run_presenter(presenter, network, controller, view_tx, status_tx));
    ConnectivityHandle {
        view: view_rx,
        status: status_rx,
        task,
    }
}

async fn run_presenter(
    mut presenter: ConnectivityPresenter,
    mut network: watch::Receiver<NetworkStatus>,
    mut controller: watch::Receiver<ControllerSnapshot>,
    view_tx: watch::Sender<ConnectivityView>,
    status_tx: watch::Sender<ConnectivityStatus>,
) {
    loop {
        let now = Instant::now();
        let net = *network.borrow_and_update();
        let snapshot = *controller.borrow_and_update();

        if let Some(view) = presenter.update(&net, &snapshot, now) {
            let status = view.status();
            view_tx.send_replace(view);
            let changed = status_tx.send_if_modified(|current| {
                let changed = *current != status;
                *current = status;
                changed
            });
            if changed {
                info!(status = ?status, "connectivity status changed");
            }
        }

        let wakeup = presenter.next_wakeup(&snapshot, now);
        tokio::select! {
            changed = network.changed() => if changed.is_err() { break },
            changed = controller.changed() => if changed.is_err() { break },
            _ = sleep_until_opt(wakeup) => {}
        }
    }
    debug!("connectivity presenter exiting");
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
