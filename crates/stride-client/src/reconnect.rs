//! Reconnect state machine.
//!
//! ```text
//! idle → connecting → streaming → disconnected → backoffWait → connecting …
//!                                                     ↘ abandoned (fatal)
//! ```
//!
//! The controller performs no IO and owns no timers. The conversation
//! driver feeds it transport outcomes, reachability changes and the
//! current time, then acts on the returned decisions. Every transition is
//! published as a [`ControllerSnapshot`] for the presenter.

use std::sync::Arc;
use std::time::Duration;

use stride_core::StreamErrorReason;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;

/// What a backoff wait is waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitReason {
    Timer,
    /// The device is offline; resume when reachability returns.
    Network,
    /// Auto-retry gave up; only an explicit retry continues.
    Manual,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReconnectPhase {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Disconnected,
    BackoffWait(WaitReason),
    Abandoned,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
    pub disconnected_since: Option<Instant>,
    pub next_retry_at: Option<Instant>,
}

/// Published view of the controller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControllerSnapshot {
    pub phase: ReconnectPhase,
    pub retry: RetryState,
    pub auto_retry: bool,
    pub fatal_count: u32,
}

impl ControllerSnapshot {
    /// Time since the link was lost, if it currently is.
    pub fn disconnected_for(&self, now: Instant) -> Option<Duration> {
        self.retry
            .disconnected_since
            .map(|since| now.saturating_duration_since(since))
    }

    /// True while the session is between a lost link and a recovered one.
    pub fn is_reconnecting(&self) -> bool {
        match self.phase {
            ReconnectPhase::Disconnected | ReconnectPhase::BackoffWait(_) => true,
            ReconnectPhase::Connecting => self.retry.disconnected_since.is_some(),
            _ => false,
        }
    }
}

/// Outcome of a lost connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryPlan {
    At(Instant, Duration),
    AwaitNetwork,
    AwaitManual,
}

pub struct ReconnectController {
    policy: BackoffPolicy,
    final_threshold: Duration,
    phase: ReconnectPhase,
    retry: RetryState,
    waits_at_cap: u32,
    /// A rate-limit wait ends past the give-up point. It and the attempt
    /// that follows run to completion before auto-retry stops.
    mandated_wait: bool,
    auth_refresh_used: bool,
    fatal_count: u32,
    status: Arc<watch::Sender<ControllerSnapshot>>,
}

impl ReconnectController {
    pub fn new(
        policy: BackoffPolicy,
        final_threshold: Duration,
        status: Arc<watch::Sender<ControllerSnapshot>>,
    ) -> Self {
        let controller = Self {
            policy,
            final_threshold,
            phase: ReconnectPhase::Idle,
            retry: RetryState::default(),
            waits_at_cap: 0,
            mandated_wait: false,
            auth_refresh_used: false,
            fatal_count: 0,
            status,
        };
        controller.publish();
        controller
    }

    pub fn phase(&self) -> ReconnectPhase {
        self.phase
    }

    pub fn retry_state(&self) -> RetryState {
        self.retry
    }

    pub fn auto_retry(&self) -> bool {
        !matches!(
            self.phase,
            ReconnectPhase::BackoffWait(WaitReason::Manual) | ReconnectPhase::Abandoned
        )
    }

    pub fn fatal_count(&self) -> u32 {
        self.fatal_count
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            phase: self.phase,
            retry: self.retry,
            auto_retry: self.auto_retry(),
            fatal_count: self.fatal_count,
        }
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.status.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn transition(&mut self, phase: ReconnectPhase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, attempt = self.retry.attempt, "reconnect transition");
            self.phase = phase;
        }
        self.publish();
    }

    fn reset_retry(&mut self) {
        self.retry = RetryState::default();
        self.waits_at_cap = 0;
        self.mandated_wait = false;
    }

    /// Instant at which auto-retry stops, unless a server-mandated wait
    /// is still pending.
    fn give_up_at(&self) -> Option<Instant> {
        if self.mandated_wait {
            return None;
        }
        self.retry.disconnected_since.map(|since| since + self.final_threshold)
    }

    /// Session start. Offline devices wait for reachability instead of
    /// attempting a doomed handshake. Returns whether to connect now.
    pub fn start(&mut self, reachable: bool, now: Instant) -> bool {
        self.reset_retry();
        if reachable {
            self.transition(ReconnectPhase::Connecting);
            true
        } else {
            self.retry.disconnected_since = Some(now);
            self.transition(ReconnectPhase::BackoffWait(WaitReason::Network));
            false
        }
    }

    /// A fresh request (e.g. a newly sent message) replaces whatever is live.
    pub fn begin_attempt(&mut self) {
        self.transition(ReconnectPhase::Connecting);
    }

    pub fn handshake_succeeded(&mut self) {
        if self.retry.attempt > 0 {
            info!(attempts = self.retry.attempt, "stream reconnected");
        }
        self.reset_retry();
        self.transition(ReconnectPhase::Streaming);
    }

    /// The stream delivered data; the auth refresh budget is restored.
    pub fn record_progress(&mut self) {
        self.auth_refresh_used = false;
    }

    /// Graceful end of the reply stream.
    pub fn stream_ended(&mut self) {
        self.reset_retry();
        self.fatal_count = 0;
        self.auth_refresh_used = false;
        self.transition(ReconnectPhase::Idle);
    }

    pub fn stop(&mut self) {
        self.reset_retry();
        self.transition(ReconnectPhase::Idle);
    }

    /// A transient failure ended the current attempt or stream.
    pub fn connection_lost(
        &mut self,
        reason: &StreamErrorReason,
        now: Instant,
        reachable: bool,
    ) -> RetryPlan {
        self.transition(ReconnectPhase::Disconnected);
        let since = *self.retry.disconnected_since.get_or_insert(now);
        self.retry.attempt += 1;
        self.retry.next_retry_at = None;
        self.mandated_wait = false;

        if !reachable {
            info!(attempt = self.retry.attempt, error = %reason, "device offline, waiting for reachability");
            self.transition(ReconnectPhase::BackoffWait(WaitReason::Network));
            return RetryPlan::AwaitNetwork;
        }

        let elapsed = now.saturating_duration_since(since);
        if self.waits_at_cap >= self.policy.max_attempts_at_cap || elapsed >= self.final_threshold {
            warn!(
                attempt = self.retry.attempt,
                elapsed_ms = elapsed.as_millis() as u64,
                "auto-retry exhausted, waiting for manual retry"
            );
            self.transition(ReconnectPhase::BackoffWait(WaitReason::Manual));
            return RetryPlan::AwaitManual;
        }

        let delay = self.policy.delay_for(self.retry.attempt, reason);
        if self.policy.is_capped(delay) {
            self.waits_at_cap += 1;
        }
        let at = now + delay;
        self.retry.next_retry_at = Some(at);
        if matches!(reason, StreamErrorReason::RateLimited { .. })
            && at > since + self.final_threshold
        {
            info!(delay_ms = delay.as_millis() as u64, "rate-limit wait extends past the give-up point");
            self.mandated_wait = true;
        }
        warn!(
            attempt = self.retry.attempt,
            delay_ms = delay.as_millis() as u64,
            kind = reason.error_kind(),
            error = %reason,
            "stream lost, retrying after backoff"
        );
        self.transition(ReconnectPhase::BackoffWait(WaitReason::Timer));
        RetryPlan::At(at, delay)
    }

    /// Instant at which the current wait or reconnect attempt ends, by
    /// retry or by giving up.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.phase {
            ReconnectPhase::BackoffWait(WaitReason::Timer) => {
                match (self.retry.next_retry_at, self.give_up_at()) {
                    (Some(retry), Some(give_up)) => Some(retry.min(give_up)),
                    (retry, give_up) => retry.or(give_up),
                }
            }
            ReconnectPhase::Connecting => self.give_up_at(),
            _ => None,
        }
    }

    /// Returns whether to connect now. When auto-retry stops during a
    /// reconnect attempt the caller must cancel that attempt.
    pub fn deadline_reached(&mut self, now: Instant) -> bool {
        let waiting = self.phase == ReconnectPhase::BackoffWait(WaitReason::Timer);
        if !waiting && self.phase != ReconnectPhase::Connecting {
            return false;
        }
        if self.give_up_at().is_some_and(|at| now >= at) {
            warn!(attempt = self.retry.attempt, phase = ?self.phase, "disconnected past final threshold, auto-retry stopped");
            self.retry.next_retry_at = None;
            self.transition(ReconnectPhase::BackoffWait(WaitReason::Manual));
            return false;
        }
        if !waiting {
            return false;
        }
        match self.retry.next_retry_at {
            Some(at) if at <= now => {
                self.retry.next_retry_at = None;
                self.transition(ReconnectPhase::Connecting);
                true
            }
            _ => false,
        }
    }

    /// Reachability lost. Returns whether a live attempt must be torn down.
    pub fn network_lost(&mut self, now: Instant) -> bool {
        match self.phase {
            ReconnectPhase::Connecting | ReconnectPhase::Streaming => {
                let _ = self.connection_lost(
                    &StreamErrorReason::Network("device offline".into()),
                    now,
                    false,
                );
                true
            }
            ReconnectPhase::BackoffWait(WaitReason::Timer) => {
                self.retry.next_retry_at = None;
                self.mandated_wait = false;
                self.transition(ReconnectPhase::BackoffWait(WaitReason::Network));
                false
            }
            _ => false,
        }
    }

    /// Park an idle session until the device is back online.
    pub fn await_network(&mut self, now: Instant) {
        if matches!(
            self.phase,
            ReconnectPhase::Idle | ReconnectPhase::Disconnected | ReconnectPhase::BackoffWait(_)
        ) {
            self.retry.disconnected_since.get_or_insert(now);
            self.retry.next_retry_at = None;
            self.transition(ReconnectPhase::BackoffWait(WaitReason::Network));
        }
    }

    /// Reachability regained. Returns whether to connect now.
    pub fn network_restored(&mut self, now: Instant) -> bool {
        if self.phase != ReconnectPhase::BackoffWait(WaitReason::Network) {
            return false;
        }
        info!(attempt = self.retry.attempt, "device back online, reconnecting");
        self.retry.attempt = 0;
        self.waits_at_cap = 0;
        self.mandated_wait = false;
        self.retry.disconnected_since = Some(now);
        self.transition(ReconnectPhase::Connecting);
        true
    }

    /// Explicit user retry. Restarts the auto-retry budget. Returns whether
    /// to connect now.
    pub fn manual_retry(&mut self, reachable: bool, now: Instant) -> bool {
        match self.phase {
            ReconnectPhase::Connecting | ReconnectPhase::Streaming => return false,
            _ if !reachable => {
                info!(phase = ?self.phase, "manual retry while offline, waiting for reachability");
                self.reset_retry();
                self.auth_refresh_used = false;
                self.retry.disconnected_since = Some(now);
                self.transition(ReconnectPhase::BackoffWait(WaitReason::Network));
                return false;
            }
            _ => {}
        }
        info!(phase = ?self.phase, "manual retry");
        let was_disconnected = self.retry.disconnected_since.is_some();
        self.reset_retry();
        if was_disconnected {
            self.retry.disconnected_since = Some(now);
        }
        self.auth_refresh_used = false;
        self.transition(ReconnectPhase::Connecting);
        true
    }

    /// Claim the single token refresh allowed before the next retry.
    pub fn try_auth_refresh(&mut self, now: Instant) -> bool {
        if self.auth_refresh_used {
            return false;
        }
        self.auth_refresh_used = true;
        self.retry.disconnected_since.get_or_insert(now);
        self.transition(ReconnectPhase::Disconnected);
        true
    }

    /// The token was refreshed; retry immediately.
    pub fn auth_refreshed(&mut self) {
        if self.phase == ReconnectPhase::Disconnected {
            self.transition(ReconnectPhase::Connecting);
        }
    }

    /// Fatal failure. Auto-retry stops until an explicit retry. Returns the
    /// number of fatal failures since the last clean stream end.
    pub fn abandon(&mut self, reason: &StreamErrorReason) -> u32 {
        self.fatal_count += 1;
        error!(
            kind = reason.error_kind(),
            error = %reason,
            fatal_count = self.fatal_count,
            "stream abandoned"
        );
        self.reset_retry();
        self.transition(ReconnectPhase::Abandoned);
        self.fatal_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FINAL: Duration = Duration::from_secs(30);

    fn controller() -> (ReconnectController, watch::Receiver<ControllerSnapshot>) {
        let (tx, rx) = watch::channel(ControllerSnapshot::default());
        (
            ReconnectController::new(BackoffPolicy::default(), FINAL, Arc::new(tx)),
            rx,
        )
    }

    fn network() -> StreamErrorReason {
        StreamErrorReason::Network("reset".into())
    }

    #[tokio::test]
    async fn start_online_connects() {
        let (mut c, rx) = controller();
        assert!(c.start(true, Instant::now()));
        assert_eq!(rx.borrow().phase, ReconnectPhase::Connecting);
        c.handshake_succeeded();
        assert_eq!(c.phase(), ReconnectPhase::Streaming);
        assert_eq!(c.retry_state(), RetryState::default());
    }

    #[tokio::test]
    async fn start_offline_waits_for_network() {
        let (mut c, _rx) = controller();
        let now = Instant::now();
        assert!(!c.start(false, now));
        assert_eq!(c.phase(), ReconnectPhase::BackoffWait(WaitReason::Network));
        assert!(c.network_restored(now));
        assert_eq!(c.phase(), ReconnectPhase::Connecting);
    }

    #[tokio::test]
    async fn lost_connection_backs_off_with_growing_delay() {
        let (mut c, _rx) = controller();
        let t0 = Instant::now();
        c.start(true, t0);
        c.handshake_succeeded();

        let plan = c.connection_lost(&network(), t0, true);
        assert_eq!(plan, RetryPlan::At(t0 + Duration::from_secs(1), Duration::from_secs(1)));
        assert_eq!(c.retry_state().attempt, 1);
        assert_eq!(c.retry_state().disconnected_since, Some(t0));
        assert_eq!(c.next_deadline(), Some(t0 + Duration::from_secs(1)));

        let t1 = t0 + Duration::from_secs(1);
        assert!(c.deadline_reached(t1));
        assert_eq!(c.phase(), ReconnectPhase::Connecting);

        let plan = c.connection_lost(&network(), t1, true);
        assert_eq!(plan, RetryPlan::At(t1 + Duration::from_secs(2), Duration::from_secs(2)));
        // The episode start is kept across attempts.
        assert_eq!(c.retry_state().disconnected_since, Some(t0));
    }

    #[tokio::test]
    async fn deadline_not_reached_early() {
        let (mut c, _rx) = controller();
        let t0 = Instant::now();
        c.start(true, t0);
        c.connection_lost(&network(), t0, true);
        assert!(!c.deadline_reached(t0 + Duration::from_millis(500)));
        assert_eq!(c.phase(), ReconnectPhase::BackoffWait(WaitReason::Timer));
    }

    #[tokio::test]
    async fn gives_up_after_waits_at_cap() {
        let (tx, _rx) = watch::channel(ControllerSnapshot::default());
        // Long final threshold so only the cap rule applies.
        let mut c = ReconnectController::new(BackoffPolicy::default(), Duration::from_secs(3600), Arc::new(tx));
        let mut now = Instant::now();
        c.start(true, now);

        let mut delays = Vec::new();
        loop {
            match c.connection_lost(&network(), now, true) {
                RetryPlan::At(at, delay) => {
                    delays.push(delay.as_secs());
                    now = at;
                    assert!(c.deadline_reached(now));
                }
                RetryPlan::AwaitManual => break,
                RetryPlan::AwaitNetwork => unreachable!(),
            }
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 8, 8]);
        assert!(!c.auto_retry());
        assert_eq!(c.phase(), ReconnectPhase::BackoffWait(WaitReason::Manual));
        assert_eq!(c.next_deadline(), None);
    }

    #[tokio::test]
    async fn gives_up_at_final_threshold_during_wait() {
        let (mut c, rx) = controller();
        let t0 = Instant::now();
        c.start(true, t0);
        c.connection_lost(&network(), t0, true);

        // Pretend the retries kept failing until the wait spans the threshold.
        let late = t0 + Duration::from_secs(29);
        assert!(c.deadline_reached(t0 + Duration::from_secs(1)));
        let RetryPlan::At(_, _) = c.connection_lost(&network(), late, true) else {
            panic!("expected a timer wait");
        };
        assert_eq!(c.next_deadline(), Some(t0 + FINAL));
        assert!(!c.deadline_reached(t0 + FINAL));
        assert_eq!(c.phase(), ReconnectPhase::BackoffWait(WaitReason::Manual));
        let snapshot = *rx.borrow();
        assert!(!snapshot.auto_retry);
        assert_eq!(snapshot.disconnected_for(t0 + FINAL), Some(FINAL));
    }

    #[tokio::test]
    async fn reconnect_attempt_stops_at_final_threshold() {
        let (mut c, rx) = controller();
        let t0 = Instant::now();
        c.start(true, t0);
        c.handshake_succeeded();
        c.connection_lost(&network(), t0, true);
        assert!(c.deadline_reached(t0 + Duration::from_secs(1)));
        assert_eq!(c.phase(), ReconnectPhase::Connecting);
        assert_eq!(c.next_deadline(), Some(t0 + FINAL));

        assert!(!c.deadline_reached(t0 + Duration::from_secs(10)));
        assert_eq!(c.phase(), ReconnectPhase::Connecting);

        assert!(!c.deadline_reached(t0 + FINAL));
        assert_eq!(c.phase(), ReconnectPhase::BackoffWait(WaitReason::Manual));
        assert!(!rx.borrow().auto_retry);
        assert!(c.manual_retry(true, t0 + Duration::from_secs(31)));
    }

    #[tokio::test]
    async fn first_connect_has_no_give_up_deadline() {
        let (mut c, _rx) = controller();
        c.start(true, Instant::now());
        assert_eq!(c.next_deadline(), None);
    }

    #[tokio::test]
    async fn server_retry_after_outlasts_final_threshold() {
        let (mut c, rx) = controller();
        let t0 = Instant::now();
        c.start(true, t0);
        c.handshake_succeeded();
        let retry_after = Duration::from_secs(45);
        let plan = c.connection_lost(
            &StreamErrorReason::RateLimited {
                retry_after: Some(retry_after),
            },
            t0,
            true,
        );
        assert_eq!(plan, RetryPlan::At(t0 + retry_after, retry_after));
        assert_eq!(c.next_deadline(), Some(t0 + retry_after));

        assert!(!c.deadline_reached(t0 + FINAL));
        assert_eq!(c.phase(), ReconnectPhase::BackoffWait(WaitReason::Timer));
        assert!(rx.borrow().auto_retry);

        assert!(c.deadline_reached(t0 + retry_after));
        assert_eq!(c.phase(), ReconnectPhase::Connecting);
        // The mandated attempt is bounded by the handshake timeout alone.
        assert_eq!(c.next_deadline(), None);

        let later = t0 + Duration::from_secs(50);
        assert_eq!(c.connection_lost(&network(), later, true), RetryPlan::AwaitManual);
        assert!(!c.auto_retry());
    }

    #[tokio::test]
    async fn manual_retry_restarts_budget() {
        let (mut c, _rx) = controller();
        let t0 = Instant::now();
        c.start(true, t0);
        c.connection_lost(&network(), t0, true);
        assert!(c.deadline_reached(t0 + Duration::from_secs(1)));
        assert_eq!(c.connection_lost(&network(), t0 + FINAL, true), RetryPlan::AwaitManual);
        assert!(!c.auto_retry());

        let later = t0 + Duration::from_secs(40);
        assert!(c.manual_retry(true, later));
        assert_eq!(c.phase(), ReconnectPhase::Connecting);
        assert_eq!(c.retry_state().attempt, 0);
        assert_eq!(c.retry_state().disconnected_since, Some(later));
        assert!(c.auto_retry());
    }

    #[tokio::test]
    async fn manual_retry_offline_waits_for_network() {
        let (mut c, _rx) = controller();
        let now = Instant::now();
        c.start(true, now);
        c.abandon(&StreamErrorReason::MalformedFrame("x".into()));
        assert!(!c.manual_retry(false, now));
        assert_eq!(c.phase(), ReconnectPhase::BackoffWait(WaitReason::Network));
        assert!(c.network_restored(now));
    }

    #[tokio::test]
    async fn network_loss_mid_stream_waits_for_reachability() {
        let (mut c, _rx) = controller();
        let now = Instant::now();
        c.start(true, now);
        c.handshake_succeeded();
        assert!(c.network_lost(now));
        assert_eq!(c.phase(), ReconnectPhase::BackoffWait(WaitReason::Network));
        assert_eq!(c.next_deadline(), None);
        assert!(c.network_restored(now + Duration::from_secs(60)));
        assert_eq!(c.retry_state().attempt, 0);
    }

    #[tokio::test]
    async fn network_loss_during_timer_wait_switches_reason() {
        let (mut c, _rx) = controller();
        let now = Instant::now();
        c.start(true, now);
        c.connection_lost(&network(), now, true);
        assert!(!c.network_lost(now));
        assert_eq!(c.phase(), ReconnectPhase::BackoffWait(WaitReason::Network));
        assert_eq!(c.retry_state().next_retry_at, None);
    }

    #[tokio::test]
    async fn auth_refresh_allowed_once() {
        let (mut c, _rx) = controller();
        let now = Instant::now();
        c.start(true, now);
        assert!(c.try_auth_refresh(now));
        assert_eq!(c.phase(), ReconnectPhase::Disconnected);
        c.auth_refreshed();
        assert_eq!(c.phase(), ReconnectPhase::Connecting);
        assert!(!c.try_auth_refresh(now));

        c.record_progress();
        assert!(c.try_auth_refresh(now));
    }

    #[tokio::test]
    async fn fatal_count_resets_on_clean_end() {
        let (mut c, _rx) = controller();
        let fatal = StreamErrorReason::MalformedFrame("bad".into());
        assert_eq!(c.abandon(&fatal), 1);
        assert!(c.manual_retry(true, Instant::now()));
        assert_eq!(c.abandon(&fatal), 2);
        assert!(!c.auto_retry());
        c.manual_retry(true, Instant::now());
        c.handshake_succeeded();
        c.stream_ended();
        assert_eq!(c.fatal_count(), 0);
        assert_eq!(c.phase(), ReconnectPhase::Idle);
    }

    #[tokio::test]
    async fn rate_limit_uses_longer_wait() {
        let (mut c, _rx) = controller();
        let now = Instant::now();
        c.start(true, now);
        let plan = c.connection_lost(&StreamErrorReason::RateLimited { retry_after: None }, now, true);
        assert_eq!(plan, RetryPlan::At(now + Duration::from_secs(10), Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn snapshot_reports_reconnecting() {
        let (mut c, rx) = controller();
        let now = Instant::now();
        c.start(true, now);
        assert!(!rx.borrow().is_reconnecting());
        c.handshake_succeeded();
        c.connection_lost(&network(), now, true);
        assert!(rx.borrow().is_reconnecting());
        assert!(c.deadline_reached(now + Duration::from_secs(1)));
        assert!(rx.borrow().is_reconnecting());
        c.handshake_succeeded();
        assert!(!rx.borrow().is_reconnecting());
    }
}
