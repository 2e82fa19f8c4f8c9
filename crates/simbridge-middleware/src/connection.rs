//! [`BridgeConnection`] – one persistent, auto-reconnecting rosbridge session.
//!
//! # State machine
//!
//! ```text
//!             connect()                 transport ok
//! Disconnected ─────────▶ Connecting ───────────────▶ Open (generation += 1)
//!      ▲                      │ transport error          │ peer close    │ read/write error
//!      │                      ▼                          ▼               ▼
//!      │                   Faulted ◀──────────────── Disconnected     Faulted
//!      │                                                 ▲
//!      └──────────── close(): Open ─▶ Closing ───────────┘
//! ```
//!
//! Every successful connect opens a new *generation* with its own bounded
//! outbound queue.  [`SessionHandle`]s are tied to the generation that issued
//! them: once that session ends its queue is closed, so a handle can never
//! leak a message into a later session.  [`TopicPublisher`] relies on this to
//! guarantee that an `advertise` precedes every `publish` of a generation.
//!
//! Reconnection is driven by a single supervisor task started with
//! [`BridgeConnection::spawn`], so at most one connect attempt is ever in
//! flight.
//!
//! [`TopicPublisher`]: crate::publisher::TopicPublisher

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use simbridge_types::{BridgeError, ConnectionState};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{EventBus, EventKind};
use crate::codec::{self, Operation};
use crate::transport::{Connector, Session, TransportEvent};

/// Default rosbridge endpoint.
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:9090";

const SOURCE: &str = "simbridge-middleware::connection";

/// How long to wait between connect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// The same delay after every failure or disconnect.
    Fixed(Duration),
    /// `initial * 2^(failures - 1)`, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl ReconnectPolicy {
    /// Delay before the next attempt given the number of consecutive failed
    /// attempts (`0` right after a session ended).
    pub fn delay(&self, failures: u32) -> Duration {
        match *self {
            ReconnectPolicy::Fixed(interval) => interval,
            ReconnectPolicy::Exponential { initial, max } => {
                let shift = failures.saturating_sub(1).min(16);
                initial.saturating_mul(1 << shift).min(max)
            }
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed(Duration::from_secs(1))
    }
}

/// Configuration bundle for [`BridgeConnection`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// `ws://host:port` of the rosbridge server.
    pub endpoint: String,
    pub reconnect: ReconnectPolicy,
    /// Capacity of each generation's outbound queue.
    pub send_buffer: usize,
    /// Upper bound on how long [`BridgeConnection::close`] waits.
    pub close_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            reconnect: ReconnectPolicy::default(),
            send_buffer: 64,
            close_timeout: Duration::from_secs(2),
        }
    }
}

/// Sending half of one connection generation.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    generation: u64,
    tx: mpsc::Sender<String>,
}

impl SessionHandle {
    /// Generation this handle belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue one text frame without waiting.
    ///
    /// # Errors
    ///
    /// * [`BridgeError::Backpressure`] – the outbound queue is full.
    /// * [`BridgeError::NotConnected`] – this generation's session has ended.
    pub fn send(&self, text: String) -> Result<(), BridgeError> {
        self.tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BridgeError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => BridgeError::NotConnected,
        })
    }
}

struct Shared {
    state: ConnectionState,
    generation: u64,
    outbound: Option<mpsc::Sender<String>>,
    /// Set by `close()`; no further sessions are opened.
    closing: bool,
}

enum SessionEnd {
    /// Local shutdown, queue flushed and close frame sent.
    Closed,
    PeerClosed,
    Faulted(String),
}

enum Attempt {
    Opened(Session, mpsc::Receiver<String>, u64),
    Abandoned(Session),
    Failed(BridgeError),
}

/// Owns the transport to one rosbridge endpoint.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use simbridge_middleware::connection::{BridgeConnection, ConnectionConfig};
/// use simbridge_middleware::transport::WsConnector;
///
/// # async fn run() {
/// let connection = BridgeConnection::new(ConnectionConfig::default(), Arc::new(WsConnector));
/// let supervisor = connection.spawn();
/// // ... publish ...
/// connection.close().await;
/// let _ = supervisor.await;
/// # }
/// ```
pub struct BridgeConnection {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    bus: EventBus,
}

impl BridgeConnection {
    /// Create a connection in the `Disconnected` state.
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        Self::with_bus(config, connector, EventBus::default())
    }

    /// Like [`new`][Self::new], reporting state changes on `bus`.
    pub fn with_bus(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        bus: EventBus,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            connector,
            shared: Mutex::new(Shared {
                state: ConnectionState::Disconnected,
                generation: 0,
                outbound: None,
                closing: false,
            }),
            state_tx,
            shutdown_tx,
            bus,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Number of sessions opened so far.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Observe state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Make one connect attempt.
    ///
    /// Returns the generation of the session that is open afterwards.
    ///
    /// # Errors
    ///
    /// * [`BridgeError::Transport`] – the attempt failed; the state is `Faulted`.
    /// * [`BridgeError::ConnectInProgress`] – another attempt is in flight.
    /// * [`BridgeError::Closed`] – [`close`][Self::close] has been called.
    pub async fn connect(self: &Arc<Self>) -> Result<u64, BridgeError> {
        {
            let mut shared = self.lock();
            if shared.closing {
                return Err(BridgeError::Closed);
            }
            match shared.state {
                ConnectionState::Open => return Ok(shared.generation),
                ConnectionState::Connecting | ConnectionState::Closing => {
                    return Err(BridgeError::ConnectInProgress);
                }
                ConnectionState::Disconnected | ConnectionState::Faulted => {
                    self.transition(&mut shared, ConnectionState::Connecting);
                }
            }
        }

        let result = self.connector.connect(&self.config.endpoint).await;

        let attempt = {
            let mut shared = self.lock();
            match result {
                Ok(session) if shared.closing => {
                    self.transition(&mut shared, ConnectionState::Disconnected);
                    Attempt::Abandoned(session)
                }
                Ok(session) => {
                    let (tx, rx) = mpsc::channel(self.config.send_buffer.max(1));
                    shared.generation += 1;
                    shared.outbound = Some(tx);
                    self.transition(&mut shared, ConnectionState::Open);
                    Attempt::Opened(session, rx, shared.generation)
                }
                Err(e) => {
                    let to = if shared.closing {
                        ConnectionState::Disconnected
                    } else {
                        ConnectionState::Faulted
                    };
                    self.transition(&mut shared, to);
                    Attempt::Failed(e)
                }
            }
        };

        match attempt {
            Attempt::Opened(session, rx, generation) => {
                info!(endpoint = %self.config.endpoint, generation, "connected to rosbridge");
                tokio::spawn(Arc::clone(self).pump(session, rx, generation));
                Ok(generation)
            }
            Attempt::Abandoned(mut session) => {
                let _ = session.writer.close().await;
                Err(BridgeError::Closed)
            }
            Attempt::Failed(e) => {
                warn!(endpoint = %self.config.endpoint, error = %e, "rosbridge connect failed");
                Err(e)
            }
        }
    }

    /// Snapshot the sending half of the live generation.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotConnected`] unless the state is `Open`.
    pub fn session(&self) -> Result<SessionHandle, BridgeError> {
        let shared = self.lock();
        match (&shared.outbound, shared.state) {
            (Some(tx), ConnectionState::Open) => Ok(SessionHandle {
                generation: shared.generation,
                tx: tx.clone(),
            }),
            _ => Err(BridgeError::NotConnected),
        }
    }

    /// Queue one text frame on the live session without waiting.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotConnected`] unless `Open`;
    /// [`BridgeError::Backpressure`] when the outbound queue is full.
    pub fn send(&self, text: String) -> Result<(), BridgeError> {
        self.session()?.send(text)
    }

    /// Start the reconnect supervisor.  It connects immediately, reconnects
    /// per the [`ReconnectPolicy`] and stops after [`close`][Self::close].
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).supervise())
    }

    /// Gracefully shut the connection down.
    ///
    /// Queued frames are flushed and a close frame is sent.  Safe to call in
    /// any state and more than once; afterwards the connection stays
    /// `Disconnected`.
    pub async fn close(&self) {
        {
            let mut shared = self.lock();
            shared.closing = true;
            match shared.state {
                ConnectionState::Open => {
                    shared.outbound = None;
                    self.transition(&mut shared, ConnectionState::Closing);
                }
                ConnectionState::Faulted => {
                    self.transition(&mut shared, ConnectionState::Disconnected);
                }
                ConnectionState::Disconnected
                | ConnectionState::Connecting
                | ConnectionState::Closing => {}
            }
        }
        self.shutdown_tx.send_replace(true);

        let mut state_rx = self.state_tx.subscribe();
        let settled = tokio::time::timeout(
            self.config.close_timeout,
            wait_for_state(&mut state_rx, |s| s == ConnectionState::Disconnected),
        )
        .await;

        if settled.is_err() {
            warn!(endpoint = %self.config.endpoint, "close timed out; abandoning session");
            let mut shared = self.lock();
            shared.outbound = None;
            self.transition(&mut shared, ConnectionState::Disconnected);
        }
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    async fn supervise(self: Arc<Self>) {
        let mut state_rx = self.state_tx.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut failures: u32 = 0;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            match self.connect().await {
                Ok(_) => {
                    failures = 0;
                    tokio::select! {
                        _ = wait_for_state(&mut state_rx, |s| {
                            matches!(s, ConnectionState::Disconnected | ConnectionState::Faulted)
                        }) => {}
                        _ = shutdown_requested(&mut shutdown_rx) => break,
                    }
                }
                Err(BridgeError::Closed) => break,
                Err(_) => failures = failures.saturating_add(1),
            }

            let delay = self.config.reconnect.delay(failures);
            debug!(delay_ms = delay.as_millis() as u64, failures, "scheduling reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(&mut shutdown_rx) => break,
            }
        }
        debug!(endpoint = %self.config.endpoint, "reconnect supervisor stopped");
    }

    async fn pump(
        self: Arc<Self>,
        session: Session,
        mut outbound: mpsc::Receiver<String>,
        generation: u64,
    ) {
        let Session {
            mut writer,
            mut reader,
        } = session;
        let session_id = Uuid::new_v4();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        debug!(%session_id, generation, "session pump started");

        let end = loop {
            tokio::select! {
                biased;
                message = outbound.recv() => match message {
                    Some(text) => {
                        if let Err(e) = writer.send_text(text).await {
                            break SessionEnd::Faulted(e.to_string());
                        }
                    }
                    // Every sender is gone: close() dropped the live one.
                    None => {
                        let _ = writer.close().await;
                        break SessionEnd::Closed;
                    }
                },
                event = reader.next_event() => match event {
                    TransportEvent::Text(text) => self.observe_inbound(&text),
                    TransportEvent::Closed => break SessionEnd::PeerClosed,
                    TransportEvent::Error(e) => break SessionEnd::Faulted(e),
                },
                _ = shutdown_requested(&mut shutdown_rx) => {
                    outbound.close();
                    while let Ok(text) = outbound.try_recv() {
                        if writer.send_text(text).await.is_err() {
                            break;
                        }
                    }
                    let _ = writer.close().await;
                    break SessionEnd::Closed;
                }
            }
        };

        self.finish_session(generation, session_id, end);
    }

    fn finish_session(&self, generation: u64, session_id: Uuid, end: SessionEnd) {
        let mut shared = self.lock();
        if shared.generation != generation {
            return;
        }
        shared.outbound = None;
        let to = match &end {
            SessionEnd::Faulted(_) if !shared.closing => ConnectionState::Faulted,
            _ => ConnectionState::Disconnected,
        };
        self.transition(&mut shared, to);
        drop(shared);

        match end {
            SessionEnd::Closed => info!(%session_id, generation, "rosbridge session closed"),
            SessionEnd::PeerClosed => {
                warn!(%session_id, generation, "rosbridge closed the session")
            }
            SessionEnd::Faulted(error) => {
                warn!(%session_id, generation, %error, "rosbridge session failed")
            }
        }
    }

    fn observe_inbound(&self, text: &str) {
        match codec::decode_operation(text) {
            Ok(Operation::Status { level, msg }) if level == "error" || level == "warning" => {
                warn!(endpoint = %self.config.endpoint, %level, %msg, "rosbridge status");
            }
            Ok(op) => debug!(?op, "inbound rosbridge operation"),
            Err(e) => debug!(error = %e, "undecodable inbound frame"),
        }
    }

    fn transition(&self, shared: &mut Shared, to: ConnectionState) {
        let from = shared.state;
        if from == to {
            return;
        }
        shared.state = to;
        self.state_tx.send_replace(to);
        debug!(%from, %to, generation = shared.generation, "connection state");
        self.bus.emit_kind(
            SOURCE,
            EventKind::ConnectionState {
                state: to,
                generation: shared.generation,
            },
        );
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        // The guarded section never panics; recover the data regardless.
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn wait_for_state(
    rx: &mut watch::Receiver<ConnectionState>,
    predicate: impl FnMut(ConnectionState) -> bool,
) {
    let mut predicate = predicate;
    let _ = rx.wait_for(|s| predicate(*s)).await;
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryConnector;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            endpoint: "memory://test".to_string(),
            ..ConnectionConfig::default()
        }
    }

    async fn wait_until(connection: &BridgeConnection, want: ConnectionState) {
        let mut rx = connection.subscribe_state();
        tokio::time::timeout(Duration::from_secs(60), wait_for_state(&mut rx, |s| s == want))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {want}"));
    }

    #[test]
    fn fixed_policy_is_constant() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(7), Duration::from_secs(1));
    }

    #[test]
    fn exponential_policy_doubles_and_caps() {
        let policy = ReconnectPolicy::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(10), Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn send_before_connect_is_not_connected() {
        let connection = BridgeConnection::new(config(), Arc::new(MemoryConnector::new()));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connection.send("x".to_string()), Err(BridgeError::NotConnected));
        assert!(connection.session().is_err());
    }

    #[tokio::test]
    async fn connect_opens_generation_one_and_delivers_frames() {
        let connector = MemoryConnector::new();
        let connection = BridgeConnection::new(config(), Arc::new(connector.clone()));

        assert_eq!(connection.connect().await, Ok(1));
        assert_eq!(connection.state(), ConnectionState::Open);
        // Connecting again while open is a no-op.
        assert_eq!(connection.connect().await, Ok(1));

        connection.send("a".to_string()).unwrap();
        connection.send("b".to_string()).unwrap();
        connection.close().await;

        assert_eq!(connector.sent(), vec!["a", "b"]);
        assert_eq!(connector.closes(), 1);
        assert_eq!(connector.connect_calls(), 1);
    }

    #[tokio::test]
    async fn failed_connect_faults_without_bumping_generation() {
        let connector = MemoryConnector::with_script([false]);
        let connection = BridgeConnection::new(config(), Arc::new(connector));

        assert!(matches!(connection.connect().await, Err(BridgeError::Transport(_))));
        assert_eq!(connection.state(), ConnectionState::Faulted);
        assert_eq!(connection.generation(), 0);

        assert_eq!(connection.connect().await, Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_converges_after_repeated_failures() {
        let connector = MemoryConnector::with_script([false, false, false, true]);
        let connection = BridgeConnection::new(config(), Arc::new(connector.clone()));
        let supervisor = connection.spawn();

        wait_until(&connection, ConnectionState::Open).await;
        assert_eq!(connection.generation(), 1);
        assert_eq!(connector.connect_calls(), 4);

        connection.close().await;
        supervisor.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn peer_close_triggers_reconnect_with_new_generation() {
        let connector = MemoryConnector::new();
        let connection = BridgeConnection::new(config(), Arc::new(connector.clone()));
        let supervisor = connection.spawn();
        wait_until(&connection, ConnectionState::Open).await;
        let stale = connection.session().unwrap();

        connector.inject(TransportEvent::Closed);
        wait_until(&connection, ConnectionState::Disconnected).await;
        assert!(connection.session().is_err());

        wait_until(&connection, ConnectionState::Open).await;
        assert_eq!(connection.generation(), 2);

        // A handle from generation 1 cannot reach generation 2.
        assert_eq!(stale.send("late".to_string()), Err(BridgeError::NotConnected));
        assert!(connector.sent().is_empty());

        connection.close().await;
        supervisor.await.unwrap();
    }

    #[tokio::test]
    async fn transport_error_faults_the_session() {
        let connector = MemoryConnector::new();
        let connection = BridgeConnection::new(config(), Arc::new(connector.clone()));
        connection.connect().await.unwrap();

        connector.inject(TransportEvent::Error("reset by peer".to_string()));
        wait_until(&connection, ConnectionState::Faulted).await;
        assert_eq!(connection.send("x".to_string()), Err(BridgeError::NotConnected));
    }

    #[tokio::test]
    async fn inbound_frames_keep_the_session_open() {
        let connector = MemoryConnector::new();
        let connection = BridgeConnection::new(config(), Arc::new(connector.clone()));
        connection.connect().await.unwrap();

        connector.inject(TransportEvent::Text(
            r#"{"op":"status","level":"error","msg":"bad type"}"#.to_string(),
        ));
        connector.inject(TransportEvent::Text("garbage".to_string()));
        tokio::task::yield_now().await;

        assert_eq!(connection.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn full_queue_reports_backpressure() {
        let connection = BridgeConnection::new(
            ConnectionConfig {
                send_buffer: 1,
                ..config()
            },
            Arc::new(MemoryConnector::new()),
        );
        connection.connect().await.unwrap();

        // The pump has not run yet on this single-threaded runtime.
        connection.send("first".to_string()).unwrap();
        assert_eq!(connection.send("second".to_string()), Err(BridgeError::Backpressure));
    }

    #[tokio::test]
    async fn close_is_idempotent_in_every_state() {
        let connector = MemoryConnector::new();
        let connection = BridgeConnection::new(config(), Arc::new(connector.clone()));

        connection.close().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        // No new sessions after close.
        assert_eq!(connection.connect().await, Err(BridgeError::Closed));
        connection.close().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connector.connect_calls(), 0);
    }

    #[tokio::test]
    async fn close_from_open_passes_through_closing() {
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let connection = BridgeConnection::with_bus(
            config(),
            Arc::new(MemoryConnector::new()),
            bus.clone(),
        );
        connection.connect().await.unwrap();
        connection.close().await;
        connection.close().await;

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EventKind::ConnectionState { state, .. } = event.kind {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Open,
                ConnectionState::Closing,
                ConnectionState::Disconnected,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_while_faulted_stops_supervisor() {
        let connector = MemoryConnector::with_script(std::iter::repeat(false).take(1000));
        let connection = BridgeConnection::new(config(), Arc::new(connector.clone()));
        let supervisor = connection.spawn();

        wait_until(&connection, ConnectionState::Faulted).await;
        connection.close().await;
        supervisor.await.unwrap();

        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connection.generation(), 0);
    }
}
