//! Durable conversation progress.
//!
//! [`ProgressStore`] maps one [`SessionState`] to one key in a
//! [`KeyValueStore`]. Saves are best-effort: failures are logged and
//! swallowed so persistence can never interrupt streaming.
//! [`ProgressWriter`] moves the writes onto a background task that applies
//! them in submission order.

use std::sync::Arc;

use stride_core::{SessionId, SessionState};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::kv::KeyValueStore;

#[derive(Clone)]
pub struct ProgressStore {
    kv: Arc<dyn KeyValueStore>,
}

impl ProgressStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub fn key(session_id: &SessionId) -> String {
        format!("session:{session_id}")
    }

    /// Read a persisted session. Unreadable or corrupt entries are logged
    /// and treated as absent so the caller starts fresh.
    pub fn load(&self, session_id: &SessionId) -> Option<SessionState> {
        let raw = match self.kv.get(&Self::key(session_id)) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(%session_id, error = %e, "failed to read session progress");
                return None;
            }
        };
        match serde_json::from_str::<SessionState>(&raw) {
            Ok(state) if state.session_id == *session_id => {
                debug!(%session_id, seq = state.last_applied_event_seq, messages = state.messages.len(), "loaded session progress");
                Some(state)
            }
            Ok(state) => {
                warn!(%session_id, stored = %state.session_id, "persisted progress belongs to another session, ignoring");
                None
            }
            Err(e) => {
                warn!(%session_id, error = %e, "corrupt session progress, ignoring");
                None
            }
        }
    }

    /// Write the session. Returns whether the write landed.
    pub fn save(&self, state: &SessionState) -> bool {
        let session_id = &state.session_id;
        let result = serde_json::to_string(state)
            .map_err(crate::StoreError::from)
            .and_then(|json| self.kv.set(&Self::key(session_id), &json));
        match result {
            Ok(()) => {
                debug!(%session_id, seq = state.last_applied_event_seq, "saved session progress");
                true
            }
            Err(e) => {
                warn!(%session_id, error = %e, "failed to save session progress");
                false
            }
        }
    }

    /// Remove the persisted session. Returns whether the delete landed.
    pub fn discard(&self, session_id: &SessionId) -> bool {
        match self.kv.delete(&Self::key(session_id)) {
            Ok(()) => {
                debug!(%session_id, "discarded session progress");
                true
            }
            Err(e) => {
                warn!(%session_id, error = %e, "failed to discard session progress");
                false
            }
        }
    }

    /// Start the background writer. Must be called inside a tokio runtime.
    pub fn spawn_writer(&self) -> ProgressWriter {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(self.clone(), rx));
        ProgressWriter { tx }
    }
}

enum WriteOp {
    Save(Box<SessionState>),
    Discard(SessionId),
    Flush(oneshot::Sender<()>),
}

/// Non-blocking handle to the background writer. Cloning shares the queue.
#[derive(Clone)]
pub struct ProgressWriter {
    tx: mpsc::UnboundedSender<WriteOp>,
}

impl ProgressWriter {
    /// Enqueue a save of the given snapshot.
    pub fn save(&self, state: SessionState) {
        if self.tx.send(WriteOp::Save(Box::new(state))).is_err() {
            warn!("progress writer stopped, dropping save");
        }
    }

    pub fn discard(&self, session_id: SessionId) {
        if self.tx.send(WriteOp::Discard(session_id)).is_err() {
            warn!("progress writer stopped, dropping discard");
        }
    }

    /// Resolves once every operation enqueued before this call was attempted.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriteOp::Flush(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.await;
    }
}

async fn run_writer(store: ProgressStore, mut rx: mpsc::UnboundedReceiver<WriteOp>) {
    let mut batch = Vec::new();
    while let Some(op) = rx.recv().await {
        batch.push(op);
        while let Ok(op) = rx.try_recv() {
            batch.push(op);
        }

        let ops: Vec<WriteOp> = std::mem::take(&mut batch);
        for (i, op) in ops.iter().enumerate() {
            match op {
                WriteOp::Save(state) => {
                    // A later save of the same session supersedes this one.
                    let superseded = ops[i + 1..].iter().any(|later| {
                        matches!(later, WriteOp::Save(s) if s.session_id == state.session_id)
                    });
                    if !superseded {
                        let _ = store.save(state);
                    }
                }
                WriteOp::Discard(session_id) => {
                    let _ = store.discard(session_id);
                }
                WriteOp::Flush(_) => {}
            }
        }
        for op in ops {
            if let WriteOp::Flush(done) = op {
                let _ = done.send(());
            }
        }
    }
    debug!("progress writer exiting");
}
