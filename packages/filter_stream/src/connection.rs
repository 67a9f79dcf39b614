//! Lifecycle of the single shared transport.
//!
//! A [`Connection`] wraps exactly one transport and is never reused: every
//! reconnect closes the current instance and creates a new one with the next
//! generation number. The helper task behind a connection reports back to the
//! owning event loop over a channel, tagged with that generation, so reports
//! from superseded connections can be told apart and dropped.
//!
//! A new connection's helper task does not open its transport until the
//! previous helper task has finished closing, so two transports are never
//! open at the same time even when closing takes a round trip.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerAddress;
use crate::error::{Result, StreamError};
use crate::filter::Filter;
use crate::transport::Transport;
use crate::wire::encode_filter_set;

/// State of one connection instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Outcome of `Connection::connect`, delivered exactly once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    Failed(StreamError),
}

/// Reports from a connection's helper task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connect attempt resolved.
    Outcome {
        generation: u64,
        outcome: ConnectOutcome,
    },
    /// An inbound text frame.
    Frame { generation: u64, text: String },
    /// A connected transport went away (unplanned disconnect).
    Lost {
        generation: u64,
        reason: Option<String>,
    },
}

impl ConnectionEvent {
    pub fn generation(&self) -> u64 {
        match self {
            Self::Outcome { generation, .. }
            | Self::Frame { generation, .. }
            | Self::Lost { generation, .. } => *generation,
        }
    }
}

/// One transport instance: `Disconnected -> Connecting -> Connected -> Disconnected`.
pub struct Connection {
    generation: u64,
    url: String,
    state: ConnectionState,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Connection {
    fn new(generation: u64, url: String) -> Self {
        Self {
            generation,
            url,
            state: ConnectionState::Disconnected,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Start opening the transport without waiting for it.
    ///
    /// The result arrives on `events` as a single [`ConnectionEvent::Outcome`];
    /// after `Connected`, inbound frames follow, and finally a `Lost` event if
    /// the remote side goes away before [`Connection::close`] is called.
    ///
    /// `previous` is the helper task of the connection this one replaces;
    /// the transport is only opened once it has finished.
    fn connect(
        &mut self,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        connect_timeout: Option<Duration>,
        previous: Option<JoinHandle<()>>,
    ) {
        if self.state != ConnectionState::Disconnected || self.cancel.is_cancelled() {
            return;
        }
        self.state = ConnectionState::Connecting;

        let generation = self.generation;
        let url = self.url.clone();
        let cancel = self.cancel.clone();

        self.task = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(e) = previous.await {
                    warn!(generation, error = %e, "previous connection task failed");
                }
            }
            if cancel.is_cancelled() {
                debug!(generation, "connect attempt abandoned");
                return;
            }

            let opened = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(generation, "connect attempt abandoned");
                    return;
                }
                opened = open(transport.as_ref(), &url, connect_timeout) => opened,
            };

            let mut conn = match opened {
                Ok(conn) => conn,
                Err(error) => {
                    let _ = events.send(ConnectionEvent::Outcome {
                        generation,
                        outcome: ConnectOutcome::Failed(error),
                    });
                    return;
                }
            };
            if cancel.is_cancelled() {
                conn.close().await;
                return;
            }
            let _ = events.send(ConnectionEvent::Outcome {
                generation,
                outcome: ConnectOutcome::Connected,
            });

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        conn.close().await;
                        debug!(generation, "transport closed");
                        return;
                    }
                    frame = conn.next_frame() => match frame {
                        Some(Ok(text)) => {
                            if events.send(ConnectionEvent::Frame { generation, text }).is_err() {
                                conn.close().await;
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            let _ = events.send(ConnectionEvent::Lost {
                                generation,
                                reason: Some(e.to_string()),
                            });
                            return;
                        }
                        None => {
                            let _ = events.send(ConnectionEvent::Lost {
                                generation,
                                reason: None,
                            });
                            return;
                        }
                    }
                }
            }
        }));
    }

    /// Close the transport (or abandon the attempt). Idempotent.
    ///
    /// Only signals the helper task; the transport is closed once it
    /// observes the cancellation.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.state = ConnectionState::Disconnected;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn open(
    transport: &dyn Transport,
    url: &str,
    connect_timeout: Option<Duration>,
) -> Result<Box<dyn crate::transport::TransportConnection>> {
    match connect_timeout {
        Some(limit) => tokio::time::timeout(limit, transport.open(url))
            .await
            .unwrap_or_else(|_| {
                Err(StreamError::Transport(format!(
                    "connect timed out after {}s",
                    limit.as_secs_f64()
                )))
            }),
        None => transport.open(url).await,
    }
}

/// Owns the live [`Connection`] exclusively.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    address: ServerAddress,
    connect_timeout: Option<Duration>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    current: Option<Connection>,
    /// Helper task of the most recently retired connection.
    retired: Option<JoinHandle<()>>,
    next_generation: u64,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        address: ServerAddress,
        connect_timeout: Option<Duration>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            transport,
            address,
            connect_timeout,
            events,
            current: None,
            retired: None,
            next_generation: 1,
        }
    }

    /// Replace the live connection with one targeting `filters`.
    ///
    /// The previous connection (or in-flight attempt) is closed first, so at
    /// most one transport is ever open. With an empty filter set nothing is
    /// opened and `Ok(None)` is returned; otherwise the new generation.
    pub fn reconnect(&mut self, filters: &[Filter]) -> Result<Option<u64>> {
        self.close();
        if filters.is_empty() {
            debug!("filter set empty, not connecting");
            return Ok(None);
        }

        let encoded = encode_filter_set(filters)?;
        let url = self.address.connection_url(&encoded);
        let generation = self.next_generation;
        self.next_generation += 1;

        info!(
            generation,
            filters = filters.len(),
            server = %self.address.base_url(),
            "opening shared connection"
        );
        let mut conn = Connection::new(generation, url);
        conn.connect(
            self.transport.clone(),
            self.events.clone(),
            self.connect_timeout,
            self.retired.take(),
        );
        self.current = Some(conn);
        Ok(Some(generation))
    }

    /// Close the live connection, if any. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut conn) = self.current.take() {
            debug!(generation = conn.generation(), "closing shared connection");
            conn.close();
            self.retire(conn);
        }
    }

    fn retire(&mut self, mut conn: Connection) {
        if let Some(task) = conn.task.take() {
            self.retired = Some(task);
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.current
            .as_ref()
            .map_or(ConnectionState::Disconnected, Connection::state)
    }

    pub fn current(&self) -> Option<&Connection> {
        self.current.as_ref()
    }

    /// Fold a helper-task report into the live connection's state.
    ///
    /// Returns `None` for reports from connections that have since been
    /// replaced or closed.
    pub fn accept(&mut self, event: ConnectionEvent) -> Option<ConnectionEvent> {
        let conn = self.current.as_mut()?;
        if conn.generation != event.generation() {
            debug!(
                stale = event.generation(),
                live = conn.generation,
                "ignoring event from superseded connection"
            );
            return None;
        }

        match &event {
            ConnectionEvent::Outcome {
                outcome: ConnectOutcome::Connected,
                ..
            } => conn.state = ConnectionState::Connected,
            ConnectionEvent::Outcome {
                outcome: ConnectOutcome::Failed(error),
                ..
            } => {
                warn!(generation = conn.generation, error = %error, "connect attempt failed");
                if let Some(conn) = self.current.take() {
                    self.retire(conn);
                }
            }
            ConnectionEvent::Lost { reason, .. } => {
                warn!(
                    generation = conn.generation,
                    reason = reason.as_deref().unwrap_or("closed by server"),
                    "shared connection lost"
                );
                if let Some(conn) = self.current.take() {
                    self.retire(conn);
                }
            }
            ConnectionEvent::Frame { .. } => {}
        }
        Some(event)
    }
}
