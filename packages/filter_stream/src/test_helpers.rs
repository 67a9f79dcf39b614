//! Scripted in-memory transport for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{Result, StreamError};
use crate::transport::{Transport, TransportConnection};

/// How the next `open` call behaves.
#[derive(Clone, Copy, Debug)]
pub(crate) enum MockOpen {
    Accept,
    Refuse,
    /// Never resolves; the attempt can only be abandoned.
    Hang,
}

enum MockFrame {
    Text(String),
    Error(String),
    Close,
}

#[derive(Default)]
struct MockState {
    script: VecDeque<MockOpen>,
    refuse_all: bool,
    close_delay: Option<Duration>,
    opened: Vec<(String, Instant)>,
    /// Accepted connections the client had not yet closed, at each `open`.
    live_at_open: Vec<usize>,
    remotes: Vec<MockRemote>,
}

#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue behaviours for the next `open` calls. Unscripted calls accept.
    pub(crate) fn script(&self, steps: impl IntoIterator<Item = MockOpen>) {
        self.state.lock().unwrap().script.extend(steps);
    }

    /// Refuse every unscripted `open` call while set.
    pub(crate) fn refuse_all(&self, refuse: bool) {
        self.state.lock().unwrap().refuse_all = refuse;
    }

    /// Make every connection accepted from now on take `delay` to close.
    pub(crate) fn slow_close(&self, delay: Duration) {
        self.state.lock().unwrap().close_delay = Some(delay);
    }

    /// For each `open` call, how many earlier connections were still open.
    pub(crate) fn live_at_open(&self) -> Vec<usize> {
        self.state.lock().unwrap().live_at_open.clone()
    }

    pub(crate) fn open_count(&self) -> usize {
        self.state.lock().unwrap().opened.len()
    }

    pub(crate) fn opened_urls(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.opened.iter().map(|(url, _)| url.clone()).collect()
    }

    /// When each `open` call happened.
    pub(crate) fn open_times(&self) -> Vec<Instant> {
        let state = self.state.lock().unwrap();
        state.opened.iter().map(|(_, at)| *at).collect()
    }

    /// Server-side ends of every accepted connection, oldest first.
    pub(crate) fn remotes(&self) -> Vec<MockRemote> {
        self.state.lock().unwrap().remotes.clone()
    }

    pub(crate) fn latest(&self) -> MockRemote {
        self.remotes()
            .pop()
            .expect("no connection has been accepted")
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, url: &str) -> Result<Box<dyn TransportConnection>> {
        let step = {
            let mut state = self.state.lock().unwrap();
            state.opened.push((url.to_string(), Instant::now()));
            let live = state.remotes.iter().filter(|r| !r.is_closed()).count();
            state.live_at_open.push(live);
            let step = match state.script.pop_front() {
                Some(step) => step,
                None if state.refuse_all => MockOpen::Refuse,
                None => MockOpen::Accept,
            };
            (step, state.close_delay)
        };
        let (step, close_delay) = step;

        match step {
            MockOpen::Accept => {
                let (tx, rx) = mpsc::unbounded_channel();
                let closed = Arc::new(AtomicBool::new(false));
                let remote = MockRemote {
                    frames: tx,
                    closed: closed.clone(),
                };
                self.state.lock().unwrap().remotes.push(remote);
                Ok(Box::new(MockConnection {
                    frames: rx,
                    closed,
                    close_delay,
                }))
            }
            MockOpen::Refuse => Err(StreamError::Transport("connection refused".into())),
            MockOpen::Hang => std::future::pending().await,
        }
    }
}

/// The server side of one mock connection.
#[derive(Clone)]
pub(crate) struct MockRemote {
    frames: mpsc::UnboundedSender<MockFrame>,
    closed: Arc<AtomicBool>,
}

impl MockRemote {
    pub(crate) fn send_text(&self, text: &str) {
        let _ = self.frames.send(MockFrame::Text(text.to_string()));
    }

    pub(crate) fn send_json(&self, value: serde_json::Value) {
        self.send_text(&value.to_string());
    }

    /// Fail the transport from the server side.
    pub(crate) fn fail(&self, reason: &str) {
        let _ = self.frames.send(MockFrame::Error(reason.to_string()));
    }

    /// Close the connection from the server side.
    pub(crate) fn hang_up(&self) {
        let _ = self.frames.send(MockFrame::Close);
    }

    /// Whether the client closed this connection.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MockConnection {
    frames: mpsc::UnboundedReceiver<MockFrame>,
    closed: Arc<AtomicBool>,
    close_delay: Option<Duration>,
}

#[async_trait]
impl TransportConnection for MockConnection {
    async fn next_frame(&mut self) -> Option<Result<String>> {
        match self.frames.recv().await? {
            MockFrame::Text(text) => Some(Ok(text)),
            MockFrame::Error(reason) => Some(Err(StreamError::Transport(reason))),
            MockFrame::Close => None,
        }
    }

    async fn close(&mut self) {
        if let Some(delay) = self.close_delay {
            tokio::time::sleep(delay).await;
        }
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Yield to spawned tasks until `condition` holds. Does not advance a paused clock.
pub(crate) async fn settle(condition: impl Fn() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached while settling");
}
