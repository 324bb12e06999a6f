//! Single-task event loop driving a [`ConnectionPool`].
//!
//! Every pool mutation happens on the loop task. Transports, directory
//! queries, timers and callers reach the pool by sending a [`LoopEvent`]
//! through a [`Reactor`] handle; nothing ever calls into the pool from
//! another task.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use nsqlink_protocol::LookupResponse;

use crate::connection::Connection;
use crate::discovery::LookupError;
use crate::pool::{ConnectionPool, PoolError};
use crate::types::{ConnectionStatus, Lifecycle};

/// Work the pool schedules on its own loop.
#[derive(Debug, Clone)]
pub enum Task {
    /// Issue one directory query.
    QueryLookupd(String),
    /// Close every link and cancel discovery timers.
    Teardown,
    /// Verify that a removed link really reached `Disconnected`.
    ConfirmDisconnected(Connection),
}

/// An input to the event loop.
pub enum LoopEvent {
    /// A task queued with [`Reactor::queue_in_loop`].
    Deferred(Task),
    /// A task fired by a [`Reactor::run_every`] timer.
    Timer(Task),
    /// A link reported a status change. `status` is the value reported,
    /// which the link may have moved past by the time the loop sees it.
    Status {
        conn: Connection,
        status: ConnectionStatus,
    },
    /// A directory query finished.
    Lookup {
        url: String,
        result: Result<LookupResponse, LookupError>,
    },
    /// A caller request, executed against the pool on the loop.
    Call(Box<dyn FnOnce(&mut ConnectionPool) + Send>),
}

/// Cloneable handle for scheduling work on the event loop.
#[derive(Clone)]
pub struct Reactor {
    tx: mpsc::UnboundedSender<LoopEvent>,
}

impl Reactor {
    /// Creates a reactor and the receiving end the [`EventLoop`] consumes.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LoopEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Sends an event to the loop. Fails once the loop has stopped.
    pub fn send(&self, event: LoopEvent) -> Result<(), PoolError> {
        self.tx.send(event).map_err(|_| PoolError::LoopStopped)
    }

    /// Sends an event, dropping it if the loop has stopped.
    pub fn notify(&self, event: LoopEvent) {
        if self.tx.send(event).is_err() {
            trace!("event loop stopped, dropping event");
        }
    }

    /// Queues `task` behind everything already pending. Never runs inline.
    pub fn queue_in_loop(&self, task: Task) {
        self.notify(LoopEvent::Deferred(task));
    }

    /// Runs `task` on the loop every `interval`, starting one interval from
    /// now, until the returned handle is cancelled or dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run_every(&self, interval: Duration, task: Task) -> TimerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip immediate first tick.

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if tx.send(LoopEvent::Timer(task.clone())).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        TimerHandle { cancel }
    }
}

/// Cancelable handle to a periodic task. Cancelling twice is harmless.
#[derive(Debug)]
pub struct TimerHandle {
    cancel: CancellationToken,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Owns a pool and feeds it events until it is drained.
pub struct EventLoop {
    pool: ConnectionPool,
    events: mpsc::UnboundedReceiver<LoopEvent>,
}

impl EventLoop {
    /// Wraps a pool with the receiver returned by [`Reactor::new`].
    pub fn new(pool: ConnectionPool, events: mpsc::UnboundedReceiver<LoopEvent>) -> Self {
        Self { pool, events }
    }

    /// Returns a caller handle for the wrapped pool.
    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            reactor: self.pool.reactor().clone(),
        }
    }

    /// Processes events until the pool has been closed and drained.
    ///
    /// Returns the pool so callers can inspect its final state.
    pub async fn run(mut self) -> ConnectionPool {
        info!(mode = ?self.pool.mode(), "event loop started");
        while let Some(event) = self.events.recv().await {
            self.pool.handle_event(event);
            if self.pool.is_drained() {
                break;
            }
        }
        debug!(lifecycle = ?self.pool.lifecycle(), "event loop stopped");
        self.pool
    }
}

/// Caller-side handle to a pool running on an [`EventLoop`].
///
/// Every method enqueues work on the loop; none of them touch pool state
/// directly.
#[derive(Clone)]
pub struct PoolHandle {
    reactor: Reactor,
}

impl PoolHandle {
    fn call<F>(&self, f: F) -> Result<(), PoolError>
    where
        F: FnOnce(&mut ConnectionPool) + Send + 'static,
    {
        self.reactor.send(LoopEvent::Call(Box::new(f)))
    }

    /// Connects to one broker `host:port`.
    pub fn connect_to(&self, address: &str) -> Result<(), PoolError> {
        let address = address.to_string();
        self.call(move |pool| pool.connect_to(&address))
    }

    /// Connects to a comma-separated list of brokers.
    pub fn connect_to_many(&self, addresses: &str) -> Result<(), PoolError> {
        let addresses = addresses.to_string();
        self.call(move |pool| pool.connect_to_many(&addresses))
    }

    /// Starts polling a directory URL.
    pub fn connect_to_lookupd(&self, url: &str) -> Result<(), PoolError> {
        let url = url.to_string();
        self.call(move |pool| pool.connect_to_lookupd(&url))
    }

    /// Starts polling a comma-separated list of directory URLs.
    pub fn connect_to_lookupds(&self, urls: &str) -> Result<(), PoolError> {
        let urls = urls.to_string();
        self.call(move |pool| pool.connect_to_lookupds(&urls))
    }

    /// Publishes one message through the next ready link.
    pub async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<(), PoolError> {
        let (tx, rx) = oneshot::channel();
        let topic = topic.to_string();
        self.call(move |pool| {
            let _ = tx.send(pool.publish(&topic, body));
        })?;
        rx.await.map_err(|_| PoolError::LoopStopped)?
    }

    /// Returns the pool lifecycle as seen by the loop.
    pub async fn lifecycle(&self) -> Result<Lifecycle, PoolError> {
        let (tx, rx) = oneshot::channel();
        self.call(move |pool| {
            let _ = tx.send(pool.lifecycle());
        })?;
        rx.await.map_err(|_| PoolError::LoopStopped)
    }

    /// Requests a graceful close.
    pub fn close(&self) -> Result<(), PoolError> {
        self.call(|pool| pool.close())
    }
}
