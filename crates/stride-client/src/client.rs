//! Conversation session orchestration.
//!
//! One driver task per session owns the [`SessionState`], the reconnect
//! controller, the live stream handle and the save debouncer. The public
//! [`ConversationStreamClient`] talks to it over a command channel, so
//! state is never shared across tasks and at most one transport handle is
//! live at a time.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use secrecy::SecretString;
use stride_core::{
    Applied, ClientError, Message, MessageId, MessagePart, SessionId, SessionPhase,
    SessionState, StreamErrorReason, StreamEvent,
};
use stride_settings::{StrideSettings, MAX_FATAL_RETRIES_BEFORE_ESCALATION};
use stride_store::{ProgressStore, ProgressWriter, SaveDebouncer, SaveDecision};
use stride_transport::{AuthError, OpenRequest, StreamHandle, StreamTransport, TokenSupplier};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::backoff::BackoffPolicy;
use crate::monitor::{NetworkMonitor, NetworkStatus};
use crate::presenter::{spawn_presenter, ConnectivityHandle, ConnectivityStatus, ConnectivityView};
use crate::reconnect::{ControllerSnapshot, ReconnectController, ReconnectPhase};

const NOTIFICATION_CAPACITY: usize = 256;

/// Collaborators injected into the client.
#[derive(Clone)]
pub struct ClientDeps {
    pub transport: Arc<dyn StreamTransport>,
    pub tokens: Arc<dyn TokenSupplier>,
    pub store: ProgressStore,
    pub network: NetworkMonitor,
    pub settings: StrideSettings,
}

/// Unrecoverable failure of the current stream. Auto-retry has stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FatalError {
    pub kind: &'static str,
    pub message: String,
    /// Fatal failures since the last cleanly ended stream.
    pub fatal_count: u32,
    /// Offer escalation (e.g. contact support) instead of another retry.
    pub escalate: bool,
}

/// Events for the rendering layer. Transient connection trouble is never
/// reported here, only through connectivity status.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientNotification {
    PartReceived {
        message_id: MessageId,
        part_index: usize,
        part: MessagePart,
    },
    MessageComplete {
        message_id: MessageId,
    },
    /// Queued user messages reached the server.
    PendingFlushed {
        message_ids: Vec<MessageId>,
    },
    Fatal(FatalError),
    StreamEnded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ShutdownMode {
    Stop,
    Discard,
    Finish,
}

enum Command {
    Send(Message),
    Retry,
    Snapshot(oneshot::Sender<SessionState>),
    Shutdown(ShutdownMode, oneshot::Sender<()>),
}

struct RunningSession {
    session_id: SessionId,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

/// Resumable conversation session exposed to the rendering layer.
pub struct ConversationStreamClient {
    deps: ClientDeps,
    controller: Arc<watch::Sender<ControllerSnapshot>>,
    notifications: broadcast::Sender<ClientNotification>,
    presenter: ConnectivityHandle,
    session: Mutex<Option<RunningSession>>,
}

impl ConversationStreamClient {
    /// Must be called inside a tokio runtime.
    pub fn new(deps: ClientDeps) -> Self {
        let (controller, _) = watch::channel(ControllerSnapshot::default());
        let controller = Arc::new(controller);
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let presenter = spawn_presenter(
            &deps.settings.connectivity,
            deps.network.subscribe(),
            controller.subscribe(),
        );
        Self {
            deps,
            controller,
            notifications,
            presenter,
            session: Mutex::new(None),
        }
    }

    /// Resume the persisted session or create a fresh one, then connect.
    /// Returns without waiting for the handshake.
    pub fn start(&self, session_id: SessionId) -> Result<(), ClientError> {
        if session_id.is_empty() {
            return Err(ClientError::EmptySessionId);
        }
        let mut guard = self.session.lock();
        if guard.as_ref().is_some_and(|s| !s.task.is_finished()) {
            return Err(ClientError::AlreadyStarted);
        }

        let (commands, rx) = mpsc::unbounded_channel();
        let driver = Driver::new(&self.deps, self.controller.clone(), self.notifications.clone());
        let span = info_span!("conversation", session_id = %session_id);
        let task = tokio::spawn(driver.run(session_id.clone(), rx).instrument(span));
        *guard = Some(RunningSession {
            session_id,
            commands,
            task,
        });
        Ok(())
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.lock().as_ref().map(|s| s.session_id.clone())
    }

    /// Append a user message and request a reply. Offline, the message is
    /// persisted as pending and sent once reachability returns.
    pub fn send(&self, text: impl Into<String>) -> Result<MessageId, ClientError> {
        let message = Message::user_text(text, Utc::now());
        let id = message.id.clone();
        self.command(Command::Send(message))?;
        Ok(id)
    }

    /// Manual retry after auto-retry gave up or a fatal error.
    pub fn retry(&self) -> Result<(), ClientError> {
        self.command(Command::Retry)
    }

    pub async fn snapshot(&self) -> Result<SessionState, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Snapshot(tx))?;
        rx.await.map_err(|_| ClientError::Stopped)
    }

    /// Cancel the stream and persist the session before returning.
    pub async fn stop(&self) -> Result<(), ClientError> {
        self.shutdown(ShutdownMode::Stop).await
    }

    /// Stop and delete the persisted session.
    pub async fn discard(&self) -> Result<(), ClientError> {
        self.shutdown(ShutdownMode::Discard).await
    }

    /// Mark the conversation completed; its persisted state is removed.
    pub async fn finish(&self) -> Result<(), ClientError> {
        self.shutdown(ShutdownMode::Finish).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientNotification> {
        self.notifications.subscribe()
    }

    /// Reconnect controller state.
    pub fn status(&self) -> watch::Receiver<ControllerSnapshot> {
        self.controller.subscribe()
    }

    pub fn connectivity(&self) -> watch::Receiver<ConnectivityView> {
        self.presenter.view()
    }

    pub fn connectivity_status(&self) -> watch::Receiver<ConnectivityStatus> {
        self.presenter.status()
    }

    fn command(&self, command: Command) -> Result<(), ClientError> {
        let guard = self.session.lock();
        let session = guard.as_ref().ok_or(ClientError::NotStarted)?;
        session
            .commands
            .send(command)
            .map_err(|_| ClientError::Stopped)
    }

    async fn shutdown(&self, mode: ShutdownMode) -> Result<(), ClientError> {
        let session = self.session.lock().take().ok_or(ClientError::NotStarted)?;
        let (tx, rx) = oneshot::channel();
        session
            .commands
            .send(Command::Shutdown(mode, tx))
            .map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)?;
        let _ = session.task.await;
        Ok(())
    }
}

enum ConnectOutcome {
    Opened(StreamHandle),
    Failed(StreamErrorReason),
    TimedOut(Duration),
}

struct Driver {
    transport: Arc<dyn StreamTransport>,
    tokens: Arc<dyn TokenSupplier>,
    store: ProgressStore,
    writer: ProgressWriter,
    network: NetworkMonitor,
    controller: ReconnectController,
    debouncer: SaveDebouncer,
    notifications: broadcast::Sender<ClientNotification>,
    reorder_window: usize,
    handshake_timeout: Duration,
    state: SessionState,
    connect: Option<BoxFuture<'static, ConnectOutcome>>,
    refresh: Option<BoxFuture<'static, Result<SecretString, AuthError>>>,
    handle: Option<StreamHandle>,
    /// Pending user messages carried by the current attempt.
    in_flight: Vec<MessageId>,
}

impl Driver {
    fn new(
        deps: &ClientDeps,
        status: Arc<watch::Sender<ControllerSnapshot>>,
        notifications: broadcast::Sender<ClientNotification>,
    ) -> Self {
        let settings = &deps.settings;
        let controller = ReconnectController::new(
            BackoffPolicy::from_settings(&settings.reconnect),
            Duration::from_millis(settings.connectivity.final_threshold_ms),
            status,
        );
        Self {
            transport: deps.transport.clone(),
            tokens: deps.tokens.clone(),
            writer: deps.store.spawn_writer(),
            store: deps.store.clone(),
            network: deps.network.clone(),
            controller,
            debouncer: SaveDebouncer::new(
                settings.persistence.debounce_deltas,
                settings.persistence.debounce_interval(),
            ),
            notifications,
            reorder_window: settings.stream.reorder_window,
            handshake_timeout: settings.transport.handshake_timeout(),
            state: SessionState::new(SessionId::from_raw("")),
            connect: None,
            refresh: None,
            handle: None,
            in_flight: Vec::new(),
        }
    }

    async fn run(mut self, session_id: SessionId, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.state = match self.store.load(&session_id) {
            Some(state) => {
                info!(
                    messages = state.messages.len(),
                    last_seq = state.last_applied_event_seq,
                    pending = state.has_pending_send(),
                    "resuming persisted session"
                );
                state
            }
            None => {
                info!("starting new session");
                SessionState::new(session_id)
            }
        };

        let mut network = self.network.subscribe();
        let reachable = network.borrow_and_update().reachable;
        if self.controller.start(reachable, Instant::now()) {
            self.open_stream();
        }
        let mut watching_network = true;

        loop {
            let retry_at = self.controller.next_deadline();
            let save_at = self.debouncer.deadline();

            tokio::select! {
                biased;

                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("client dropped, stopping session");
                        self.shutdown(ShutdownMode::Stop).await;
                        break;
                    };
                    if let Command::Shutdown(mode, done) = command {
                        self.shutdown(mode).await;
                        let _ = done.send(());
                        break;
                    }
                    self.on_command(command);
                }
                changed = network.changed(), if watching_network => {
                    if changed.is_err() {
                        watching_network = false;
                        continue;
                    }
                    let status = *network.borrow_and_update();
                    self.on_network(status);
                }
                outcome = poll_opt(&mut self.connect) => {
                    self.connect = None;
                    self.on_connect(outcome);
                }
                event = next_event(&mut self.handle) => self.on_event(event),
                refreshed = poll_opt(&mut self.refresh) => {
                    self.refresh = None;
                    self.on_refresh(refreshed);
                }
                _ = sleep_until_opt(retry_at) => {
                    if self.controller.deadline_reached(Instant::now()) {
                        self.open_stream();
                    } else if !self.controller.auto_retry() {
                        self.teardown_stream();
                    }
                }
                _ = sleep_until_opt(save_at) => self.save_now(),
            }
        }
        debug!("conversation driver exiting");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Send(message) => self.on_send(message),
            Command::Retry => {
                if self.controller.manual_retry(self.network.is_reachable(), Instant::now()) {
                    self.open_stream();
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.state.clone());
            }
            Command::Shutdown(..) => {}
        }
    }

    fn on_send(&mut self, message: Message) {
        let id = self.state.push_message(message);
        self.save_now();

        let now = Instant::now();
        let reachable = self.network.is_reachable();
        match self.controller.phase() {
            ReconnectPhase::Abandoned => {
                info!(message_id = %id, "session abandoned, message queued until retry");
            }
            ReconnectPhase::Idle | ReconnectPhase::Connecting | ReconnectPhase::Streaming
                if reachable =>
            {
                self.controller.begin_attempt();
                self.open_stream();
            }
            ReconnectPhase::Idle => {
                info!(message_id = %id, "offline, message queued");
                self.controller.await_network(now);
            }
            ReconnectPhase::Connecting | ReconnectPhase::Streaming => {
                if self.controller.network_lost(now) {
                    self.teardown_stream();
                }
            }
            ReconnectPhase::Disconnected | ReconnectPhase::BackoffWait(_) => {
                if self.controller.manual_retry(reachable, now) {
                    self.open_stream();
                }
            }
        }
    }

    fn on_network(&mut self, status: NetworkStatus) {
        let now = Instant::now();
        if !status.reachable {
            if self.controller.network_lost(now) {
                self.teardown_stream();
            }
        } else if self.controller.network_restored(now) {
            self.open_stream();
        }
    }

    fn on_connect(&mut self, outcome: ConnectOutcome) {
        match outcome {
            ConnectOutcome::Opened(handle) => {
                self.controller.handshake_succeeded();
                self.handle = Some(handle);
                let delivered = std::mem::take(&mut self.in_flight);
                if !delivered.is_empty() {
                    self.state.mark_delivered(&delivered);
                    info!(count = delivered.len(), "pending messages delivered");
                    self.notify(ClientNotification::PendingFlushed {
                        message_ids: delivered,
                    });
                    self.save_now();
                }
            }
            ConnectOutcome::Failed(reason) => self.on_failure(reason),
            ConnectOutcome::TimedOut(after) => self.on_failure(StreamErrorReason::Network(
                format!("handshake timed out after {}ms", after.as_millis()),
            )),
        }
    }

    fn on_event(&mut self, event: Option<StreamEvent>) {
        match event {
            None => {
                self.handle = None;
                self.on_failure(StreamErrorReason::Network("stream ended without terminal event".into()));
            }
            Some(StreamEvent::StreamError { reason }) => {
                self.handle = None;
                self.on_failure(reason);
            }
            Some(StreamEvent::StreamEnd) => {
                self.handle = None;
                let _ = self
                    .state
                    .apply_event(StreamEvent::StreamEnd, self.reorder_window, Utc::now());
                self.controller.stream_ended();
                info!(last_seq = self.state.last_applied_event_seq, "stream ended");
                self.notify(ClientNotification::StreamEnded);
                self.save_now();
            }
            Some(event) => self.apply(event),
        }
    }

    fn apply(&mut self, event: StreamEvent) {
        let applied = self.state.apply_event(event, self.reorder_window, Utc::now());
        if applied.is_empty() {
            return;
        }
        self.controller.record_progress();

        let mut decision = None;
        for change in applied {
            let next = if change.is_text_delta() {
                self.debouncer.record_delta(Instant::now())
            } else {
                self.debouncer.record_boundary()
            };
            if next == SaveDecision::Now {
                decision = Some(SaveDecision::Now);
            }
            match change {
                Applied::PartReceived {
                    message_id,
                    part_index,
                    part,
                    ..
                } => self.notify(ClientNotification::PartReceived {
                    message_id,
                    part_index,
                    part,
                }),
                Applied::MessageComplete { message_id } => {
                    self.notify(ClientNotification::MessageComplete { message_id })
                }
                Applied::GapSkipped { .. } => {}
            }
        }
        if decision == Some(SaveDecision::Now) {
            self.save_now();
        }
    }

    fn on_failure(&mut self, reason: StreamErrorReason) {
        self.teardown_stream();
        let now = Instant::now();
        if reason.is_transient() {
            let _ = self
                .controller
                .connection_lost(&reason, now, self.network.is_reachable());
        } else if matches!(reason, StreamErrorReason::AuthExpired(_))
            && self.controller.try_auth_refresh(now)
        {
            info!("credential expired, refreshing");
            let tokens = self.tokens.clone();
            self.refresh = Some(async move { tokens.refresh().await }.boxed());
        } else {
            self.fatal(&reason);
        }
        if self.debouncer.has_pending() {
            self.save_now();
        }
    }

    fn on_refresh(&mut self, refreshed: Result<SecretString, AuthError>) {
        match refreshed {
            Ok(_) if self.controller.phase() == ReconnectPhase::Disconnected => {
                self.controller.auth_refreshed();
                self.open_stream();
            }
            Ok(_) => debug!(phase = ?self.controller.phase(), "token refreshed, attempt already replaced"),
            Err(err) => {
                warn!(error = %err, "token refresh failed");
                self.fatal(&StreamErrorReason::AuthExpired(err.to_string()));
            }
        }
    }

    fn fatal(&mut self, reason: &StreamErrorReason) {
        let fatal_count = self.controller.abandon(reason);
        self.notify(ClientNotification::Fatal(FatalError {
            kind: reason.error_kind(),
            message: reason.to_string(),
            fatal_count,
            escalate: fatal_count >= MAX_FATAL_RETRIES_BEFORE_ESCALATION,
        }));
        self.save_now();
    }

    /// Replace any live attempt with a new one resuming after the last
    /// applied event. The controller must already be `Connecting`.
    fn open_stream(&mut self) {
        self.teardown_stream();
        let outgoing = self.state.pending_messages();
        self.in_flight = outgoing.iter().map(|m| m.id.clone()).collect();
        let request_seq = self.state.resume_from_seq();
        info!(
            resume_from_seq = request_seq,
            outgoing = outgoing.len(),
            attempt = self.controller.retry_state().attempt,
            "opening stream"
        );

        let transport = self.transport.clone();
        let tokens = self.tokens.clone();
        let session_id = self.state.session_id.clone();
        let timeout = self.handshake_timeout;
        self.connect = Some(
            async move {
                let auth_token = match tokens.current_token().await {
                    Ok(token) => token,
                    Err(err) => return ConnectOutcome::Failed(StreamErrorReason::AuthExpired(err.to_string())),
                };
                let request = OpenRequest {
                    session_id,
                    resume_from_seq: request_seq,
                    auth_token,
                    outgoing,
                };
                match tokio::time::timeout(timeout, transport.open(request)).await {
                    Ok(Ok(handle)) => ConnectOutcome::Opened(handle),
                    Ok(Err(reason)) => ConnectOutcome::Failed(reason),
                    Err(_) => ConnectOutcome::TimedOut(timeout),
                }
            }
            .boxed(),
        );
    }

    fn teardown_stream(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
        self.connect = None;
        self.in_flight.clear();
    }

    fn save_now(&mut self) {
        self.debouncer.saved();
        self.writer.save(self.state.clone());
    }

    fn notify(&self, notification: ClientNotification) {
        let _ = self.notifications.send(notification);
    }

    async fn shutdown(&mut self, mode: ShutdownMode) {
        self.teardown_stream();
        self.refresh = None;
        self.controller.stop();
        match mode {
            ShutdownMode::Stop => self.writer.save(self.state.clone()),
            ShutdownMode::Discard => self.writer.discard(self.state.session_id.clone()),
            ShutdownMode::Finish => {
                self.state.phase = SessionPhase::Completed;
                self.writer.discard(self.state.session_id.clone());
            }
        }
        self.debouncer.saved();
        self.writer.flush().await;
        info!(mode = ?mode, phase = ?self.state.phase, "session closed");
    }
}

async fn poll_opt<T>(future: &mut Option<BoxFuture<'static, T>>) -> T {
    match future {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn next_event(handle: &mut Option<StreamHandle>) -> Option<StreamEvent> {
    match handle {
        Some(handle) => handle.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
