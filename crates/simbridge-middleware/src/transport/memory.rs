//! In-process transport.
//!
//! [`MemoryConnector`] records every text frame written through it and lets
//! the caller script connect outcomes and drop live sessions.  It backs the
//! unit tests of the connection, publisher and scheduler, and the CLI's
//! `--dry-run` mode.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use simbridge_types::BridgeError;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Connector, FrameReader, FrameWriter, Session, TransportEvent};

#[derive(Default)]
struct Wire {
    sent: Vec<String>,
    connect_calls: usize,
    closes: usize,
    script: VecDeque<bool>,
    sessions: Vec<mpsc::UnboundedSender<TransportEvent>>,
}

/// Connector whose attempts fail or succeed according to a script.
///
/// Once the script is exhausted every attempt succeeds.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    wire: Arc<Mutex<Wire>>,
}

impl MemoryConnector {
    /// A connector on which every attempt succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector whose first attempts follow `outcomes` (`true` = success).
    pub fn with_script(outcomes: impl IntoIterator<Item = bool>) -> Self {
        let connector = Self::default();
        connector.push_outcomes(outcomes);
        connector
    }

    /// Queue more connect outcomes.
    pub fn push_outcomes(&self, outcomes: impl IntoIterator<Item = bool>) {
        self.wire().script.extend(outcomes);
    }

    /// Inject `event` into the read half of the most recent session, e.g.
    /// [`TransportEvent::Closed`] to simulate the server going away.
    pub fn inject(&self, event: TransportEvent) {
        if let Some(tx) = self.wire().sessions.last() {
            let _ = tx.send(event);
        }
    }

    /// Every text frame written so far, across all sessions, in order.
    pub fn sent(&self) -> Vec<String> {
        self.wire().sent.clone()
    }

    /// Number of connect attempts, successful or not.
    pub fn connect_calls(&self) -> usize {
        self.wire().connect_calls
    }

    /// Number of close frames written.
    pub fn closes(&self) -> usize {
        self.wire().closes
    }

    fn wire(&self) -> MutexGuard<'_, Wire> {
        // A poisoned lock only means a test panicked mid-update; the
        // recorded frames are still the best information available.
        self.wire.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &str) -> Result<Session, BridgeError> {
        let mut wire = self.wire();
        wire.connect_calls += 1;
        if !wire.script.pop_front().unwrap_or(true) {
            return Err(BridgeError::Transport(format!(
                "connect to {endpoint}: connection refused"
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        wire.sessions.push(tx);
        Ok(Session {
            writer: Box::new(MemoryWriter {
                wire: Arc::clone(&self.wire),
            }),
            reader: Box::new(MemoryReader { rx }),
        })
    }
}

struct MemoryWriter {
    wire: Arc<Mutex<Wire>>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send_text(&mut self, text: String) -> Result<(), BridgeError> {
        debug!(bytes = text.len(), "memory transport frame");
        self.wire
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sent
            .push(text);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BridgeError> {
        self.wire.lock().unwrap_or_else(|e| e.into_inner()).closes += 1;
        Ok(())
    }
}

struct MemoryReader {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn next_event(&mut self) -> TransportEvent {
        self.rx.recv().await.unwrap_or(TransportEvent::Closed)
    }
}
