//! The streaming client service: one event loop owning the filter registry,
//! the shared connection and the retry sequence.
//!
//! Widgets talk to it through a cloneable [`StreamClientHandle`]. Every
//! registry mutation, transport report and retry timer is processed on the
//! same task, one at a time, so the filter set needs no locking and callbacks
//! may freely call back into the handle.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::connection::{ConnectOutcome, ConnectionEvent, ConnectionManager};
use crate::dispatch::{InboundBatch, route};
use crate::error::{Result, StreamError};
use crate::filter::{Filter, SubscriberId};
use crate::registry::{Callback, FilterRegistry};
use crate::retry::{RetryPolicy, RetryState, RetryStep};
use crate::transport::{Transport, WsTransport};

/// Connection status as seen by subscribers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No filters registered, nothing to connect for.
    Idle,
    Connecting,
    Connected,
    /// Recovering from an unplanned disconnect.
    Reconnecting { attempt: u32 },
    /// No transport is open. `exhausted` is set when the retry budget ran out.
    Disconnected { exhausted: bool },
    /// The client has shut down.
    Closed,
}

enum Command {
    Add {
        filter: Filter,
        callback: Callback,
        reply: oneshot::Sender<Result<()>>,
    },
    Remove {
        id: SubscriberId,
    },
    Filters {
        reply: oneshot::Sender<Vec<Filter>>,
    },
}

/// Resolves once with the outcome of the reconnect a registration triggered.
///
/// Dropping it does not undo the registration.
#[must_use = "a Registration resolves to the connect outcome; drop it explicitly to ignore"]
pub struct Registration {
    id: SubscriberId,
    outcome: oneshot::Receiver<Result<()>>,
}

impl Registration {
    pub fn id(&self) -> &SubscriberId {
        &self.id
    }
}

impl Future for Registration {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.outcome)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(StreamError::Closed)))
    }
}

/// Cloneable handle used by widgets to register and remove filters.
#[derive(Clone)]
pub struct StreamClientHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl StreamClientHandle {
    /// Register `filter_json` under `id`, replacing any previous registration.
    ///
    /// Fails synchronously with `MalformedFilterJson` if the document is not
    /// a JSON object; nothing is registered in that case.
    pub fn add_filter<F>(
        &self,
        id: impl Into<SubscriberId>,
        filter_json: &str,
        on_message: F,
    ) -> Result<Registration>
    where
        F: Fn(&InboundBatch) + Send + Sync + 'static,
    {
        let id = id.into();
        let filter = Filter::parse(&id, filter_json)?;
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Add {
                filter,
                callback: Arc::new(on_message),
                reply,
            })
            .map_err(|_| StreamError::Closed)?;
        Ok(Registration { id, outcome })
    }

    /// Register under a freshly generated subscriber id.
    pub fn register<F>(&self, filter_json: &str, on_message: F) -> Result<Registration>
    where
        F: Fn(&InboundBatch) + Send + Sync + 'static,
    {
        self.add_filter(SubscriberId::generate(), filter_json, on_message)
    }

    /// Register and receive batches on a channel instead of a callback.
    pub fn subscribe(
        &self,
        filter_json: &str,
    ) -> Result<(Registration, mpsc::UnboundedReceiver<InboundBatch>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let registration = self.register(filter_json, move |batch| {
            let _ = tx.send(batch.clone());
        })?;
        Ok((registration, rx))
    }

    /// Remove a registration. Unknown ids are ignored.
    pub fn remove_filter(&self, id: &SubscriberId) {
        let _ = self.commands.send(Command::Remove { id: id.clone() });
    }

    pub fn unregister(&self, id: &SubscriberId) {
        self.remove_filter(id);
    }

    /// Snapshot of the registered filters, as they would be sent on the wire.
    pub async fn filters(&self) -> Result<Vec<Filter>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Filters { reply })
            .map_err(|_| StreamError::Closed)?;
        rx.await.map_err(|_| StreamError::Closed)
    }

    /// Watch connection status changes.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }
}

/// The running service. Construct once, hand out [`StreamClientHandle`]s,
/// and call [`StreamClient::shutdown`] to tear down.
pub struct StreamClient {
    handle: StreamClientHandle,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl StreamClient {
    /// Start the client over a WebSocket transport.
    pub fn connect(config: ClientConfig) -> Self {
        Self::start(config, Arc::new(WsTransport))
    }

    /// Start the client over an arbitrary transport. Must be called inside a
    /// tokio runtime.
    pub fn start(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Idle);
        let cancel = CancellationToken::new();

        let actor = ClientActor {
            registry: FilterRegistry::new(),
            connections: ConnectionManager::new(
                transport,
                config.address.clone(),
                config.connect_timeout,
                events_tx,
            ),
            retry_policy: config.retry,
            retry: None,
            waiters: Vec::new(),
            status: status_tx,
        };
        let task = tokio::spawn(actor.run(commands_rx, events_rx, cancel.clone()));

        info!(server = %config.address.base_url(), "stream client started");
        Self {
            handle: StreamClientHandle {
                commands: commands_tx,
                status: status_rx,
            },
            cancel,
            task,
        }
    }

    pub fn handle(&self) -> StreamClientHandle {
        self.handle.clone()
    }

    /// Close the connection, cancel any retry sequence and stop the event loop.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "stream client task failed");
        }
    }
}

struct ClientActor {
    registry: FilterRegistry,
    connections: ConnectionManager,
    retry_policy: RetryPolicy,
    retry: Option<RetryState>,
    /// Registrations waiting on the outcome of the current connect attempt.
    waiters: Vec<oneshot::Sender<Result<()>>>,
    status: watch::Sender<ConnectionStatus>,
}

impl ClientActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let resume_at = self.retry.as_ref().and_then(RetryState::resume_at);
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
                _ = sleep_until(resume_at) => self.resume_retry(),
            }
        }
        self.teardown();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Add {
                filter,
                callback,
                reply,
            } => {
                self.registry.insert(filter, callback);
                self.waiters.push(reply);
                self.filters_changed();
            }
            Command::Remove { id } => {
                if !self.registry.remove(&id) {
                    debug!(subscriber = %id, "remove of unknown subscriber ignored");
                    return;
                }
                self.filters_changed();
            }
            Command::Filters { reply } => {
                let _ = reply.send(self.registry.filters());
            }
        }
    }

    fn handle_event(&mut self, event: ConnectionEvent) {
        let Some(event) = self.connections.accept(event) else {
            return;
        };
        match event {
            ConnectionEvent::Outcome {
                outcome: ConnectOutcome::Connected,
                generation,
            } => {
                if let Some(retry) = self.retry.take() {
                    info!(generation, attempts = retry.attempts(), "reconnected");
                } else {
                    info!(generation, "connected");
                }
                self.set_status(ConnectionStatus::Connected);
                self.resolve_waiters(Ok(()));
            }
            ConnectionEvent::Outcome {
                outcome: ConnectOutcome::Failed(error),
                ..
            } => self.attempt_failed(error),
            ConnectionEvent::Frame { text, .. } => self.deliver(&text),
            ConnectionEvent::Lost { .. } => self.unplanned_disconnect(),
        }
    }

    /// Registry changed: reconnect immediately with the new set, superseding
    /// any pending retry wait.
    fn filters_changed(&mut self) {
        if self.registry.is_empty() {
            self.connections.close();
            if self.retry.take().is_some() {
                info!("filter set emptied, retry sequence cancelled");
            }
            self.set_status(ConnectionStatus::Idle);
            self.resolve_waiters(Ok(()));
            return;
        }

        match self.retry.as_mut().and_then(RetryState::start_attempt) {
            Some(attempt) => self.set_status(ConnectionStatus::Reconnecting { attempt }),
            None => {
                self.retry = None;
                self.set_status(ConnectionStatus::Connecting);
            }
        }
        self.open();
    }

    fn unplanned_disconnect(&mut self) {
        if self.registry.is_empty() {
            self.set_status(ConnectionStatus::Idle);
            return;
        }
        info!(
            max_attempts = self.retry_policy.max_attempts,
            delay_secs = self.retry_policy.delay.as_secs_f64(),
            "connection lost, starting retry sequence"
        );
        self.retry = Some(self.retry_policy.start());
        self.resume_retry();
    }

    /// Run the next attempt of the retry sequence.
    fn resume_retry(&mut self) {
        let Some(retry) = self.retry.as_mut() else {
            return;
        };
        if self.registry.is_empty() {
            self.retry = None;
            self.set_status(ConnectionStatus::Idle);
            return;
        }
        match retry.start_attempt() {
            Some(attempt) => {
                info!(attempt, "reconnect attempt");
                self.set_status(ConnectionStatus::Reconnecting { attempt });
                self.open();
            }
            None => self.give_up(),
        }
    }

    fn open(&mut self) {
        let filters = self.registry.filters();
        match self.connections.reconnect(&filters) {
            Ok(Some(_)) => {}
            Ok(None) => {
                self.set_status(ConnectionStatus::Idle);
                self.resolve_waiters(Ok(()));
            }
            Err(error) => self.attempt_failed(error),
        }
    }

    fn attempt_failed(&mut self, error: StreamError) {
        self.resolve_waiters(Err(error.clone()));

        let Some(retry) = self.retry.as_mut() else {
            warn!(error = %error, "connect failed");
            self.set_status(ConnectionStatus::Disconnected { exhausted: false });
            return;
        };
        match retry.attempt_failed(Instant::now()) {
            RetryStep::Wait(_) => {
                warn!(
                    attempt = retry.attempts(),
                    error = %error,
                    "reconnect attempt failed, waiting before the next one"
                );
            }
            RetryStep::Exhausted => self.give_up(),
        }
    }

    fn give_up(&mut self) {
        let attempts = self.retry.take().map_or(0, |r| r.attempts());
        error!(attempts, "retry budget exhausted, staying disconnected");
        self.set_status(ConnectionStatus::Disconnected { exhausted: true });
    }

    fn deliver(&self, text: &str) {
        let routed = InboundBatch::parse(text).and_then(|batch| {
            let target = route(&self.registry, &batch)?;
            Ok(target.map(|(id, callback)| (id, callback, batch)))
        });
        match routed {
            Ok(Some((id, callback, batch))) => {
                debug!(subscriber = %id, entities = batch.data.len(), "dispatching batch");
                callback(&batch);
            }
            Ok(None) => {}
            Err(error) => warn!(error = %error, "dropping inbound batch"),
        }
    }

    fn resolve_waiters(&mut self, result: Result<()>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn teardown(&mut self) {
        self.connections.close();
        self.retry = None;
        self.registry.clear();
        self.resolve_waiters(Err(StreamError::Closed));
        self.set_status(ConnectionStatus::Closed);
        info!("stream client stopped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
