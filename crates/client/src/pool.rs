//! Connection pool orchestrating broker links.
//!
//! Links live in a single arena keyed by address. Each entry is either
//! connecting or active, so an address is never in both subsets; `active`
//! additionally records the order in which links came up.

use std::collections::HashMap;

use tracing::{debug, error, info, warn};

use nsqlink_protocol::address::split_list;

use crate::connection::Connection;
use crate::discovery::Directory;
use crate::reactor::{LoopEvent, Reactor, Task, TimerHandle};
use crate::transport::{Transport, TransportError};
use crate::types::{
    CloseCallback, ConnectionStatus, Lifecycle, MessageCallback, Mode, PoolConfig, ReadyCallback,
};

/// Errors surfaced to pool callers.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("publishing requires a producer pool")]
    NotProducer,

    #[error("no connection is ready to publish")]
    NoReadyConnection,

    #[error("pool is closing")]
    Closing,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("event loop stopped")]
    LoopStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Membership {
    Connecting,
    Active,
}

pub(crate) struct Entry {
    pub(crate) conn: Connection,
    pub(crate) membership: Membership,
}

/// Pool of broker links for one producer or consumer.
///
/// Owned by one task: drive it from a single [`EventLoop`](crate::EventLoop)
/// (or, in tests, by calling [`handle_event`](Self::handle_event) directly).
pub struct ConnectionPool {
    pub(crate) mode: Mode,
    pub(crate) config: PoolConfig,
    pub(crate) reactor: Reactor,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) directory: Box<dyn Directory>,
    /// Every tracked link, keyed by address.
    pub(crate) links: HashMap<String, Entry>,
    /// Addresses of active links, oldest first.
    pub(crate) active: Vec<String>,
    pub(crate) closing: bool,
    pub(crate) closed: bool,
    pub(crate) teardown_done: bool,
    /// Tasks queued on the reactor that have not run yet.
    pub(crate) deferred: usize,
    /// Periodic directory queries, one per URL.
    pub(crate) lookupd_timers: Vec<(String, TimerHandle)>,
    next_id: u64,
    next_publish: usize,
    on_message: Option<MessageCallback>,
    on_ready: Option<ReadyCallback>,
    on_close: Option<CloseCallback>,
}

impl ConnectionPool {
    /// Creates an empty pool.
    pub fn new(
        mode: Mode,
        config: PoolConfig,
        reactor: Reactor,
        transport: Box<dyn Transport>,
        directory: Box<dyn Directory>,
    ) -> Self {
        Self {
            mode,
            config,
            reactor,
            transport,
            directory,
            links: HashMap::new(),
            active: Vec::new(),
            closing: false,
            closed: false,
            teardown_done: false,
            deferred: 0,
            lookupd_timers: Vec::new(),
            next_id: 0,
            next_publish: 0,
            on_message: None,
            on_ready: None,
            on_close: None,
        }
    }

    /// Sets the message callback handed to every link created afterwards.
    pub fn set_message_callback(&mut self, cb: MessageCallback) {
        self.on_message = Some(cb);
    }

    /// Sets the callback fired when a producer link becomes ready.
    pub fn set_ready_callback(&mut self, cb: ReadyCallback) {
        self.on_ready = Some(cb);
    }

    /// Sets the callback fired when the last link is removed.
    ///
    /// It fires only on a removal that leaves the pool empty. Closing a pool
    /// that already has no links does not fire it.
    pub fn set_close_callback(&mut self, cb: CloseCallback) {
        self.on_close = Some(cb);
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if self.closed {
            Lifecycle::Closed
        } else if self.closing {
            Lifecycle::Closing
        } else {
            Lifecycle::Open
        }
    }

    /// True once a close has fully played out and nothing is left to run.
    pub fn is_drained(&self) -> bool {
        self.closing && self.teardown_done && self.links.is_empty() && self.deferred == 0
    }

    /// True if `address` is tracked as connecting or active.
    pub fn is_known_address(&self, address: &str) -> bool {
        self.links.contains_key(address)
    }

    /// Returns the link tracked for `address`.
    pub fn connection(&self, address: &str) -> Option<Connection> {
        self.links.get(address).map(|e| e.conn.clone())
    }

    /// Addresses still connecting, sorted.
    pub fn connecting_addresses(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self
            .links
            .iter()
            .filter(|(_, e)| e.membership == Membership::Connecting)
            .map(|(a, _)| a.clone())
            .collect();
        addrs.sort();
        addrs
    }

    /// Addresses of active links in the order they came up.
    pub fn active_addresses(&self) -> Vec<String> {
        self.active.clone()
    }

    /// Number of tracked links.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Starts a link to `address` unless it is already known.
    pub fn connect_to(&mut self, address: &str) {
        if self.closing {
            warn!(addr = %address, "pool is closing, not connecting");
            return;
        }
        if self.is_known_address(address) {
            debug!(addr = %address, "address already known");
            return;
        }

        self.next_id += 1;
        let conn = Connection::new(self.next_id, address);
        self.links.insert(
            address.to_string(),
            Entry {
                conn: conn.clone(),
                membership: Membership::Connecting,
            },
        );

        info!(addr = %address, id = conn.id(), "connecting to broker");
        self.transport.connect(&conn, self.on_message.clone());
    }

    /// Connects to every address in a comma-separated list.
    pub fn connect_to_many(&mut self, addresses: &str) {
        for addr in split_list(addresses) {
            self.connect_to(&addr);
        }
    }

    /// Requests a graceful close.
    ///
    /// Discovery timers stop right away. Closing the links is deferred to the
    /// next loop iteration: a transport may report `Disconnected` while we
    /// iterate, and that report mutates the very sets being walked.
    pub fn close(&mut self) {
        if self.closing {
            debug!("close already requested");
            return;
        }
        info!(connections = self.links.len(), "closing connection pool");
        self.closing = true;
        for (_, timer) in &self.lookupd_timers {
            timer.cancel();
        }
        self.defer(Task::Teardown);
    }

    /// Publishes one message through the next ready link (round-robin).
    pub fn publish(&mut self, topic: &str, body: Vec<u8>) -> Result<(), PoolError> {
        if self.mode.is_consumer() {
            return Err(PoolError::NotProducer);
        }
        if self.closing {
            return Err(PoolError::Closing);
        }

        let n = self.active.len();
        for offset in 0..n {
            let idx = (self.next_publish + offset) % n;
            let Some(conn) = self.links.get(&self.active[idx]).map(|e| e.conn.clone()) else {
                continue;
            };
            if conn.is_ready() {
                self.next_publish = idx + 1;
                self.transport.publish(&conn, topic, body)?;
                return Ok(());
            }
        }
        Err(PoolError::NoReadyConnection)
    }

    /// Applies one loop event.
    pub fn handle_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Deferred(task) => {
                self.deferred = self.deferred.saturating_sub(1);
                self.run_task(task);
            }
            LoopEvent::Timer(task) => self.run_task(task),
            LoopEvent::Status { conn, status } => self.on_connection_event(&conn, status),
            LoopEvent::Lookup { url, result } => self.on_lookup_result(&url, result),
            LoopEvent::Call(f) => f(self),
        }
    }

    fn run_task(&mut self, task: Task) {
        match task {
            Task::QueryLookupd(url) => self.query_lookupd(&url),
            Task::Teardown => self.teardown(),
            Task::ConfirmDisconnected(conn) => confirm_disconnected(&conn),
        }
    }

    /// Queues a task for the next loop iteration.
    pub(crate) fn defer(&mut self, task: Task) {
        self.deferred += 1;
        self.reactor.queue_in_loop(task);
    }

    /// Dispatches a status change reported for `conn`.
    ///
    /// `status` is the value the transport reported. Reports can queue up
    /// behind each other, so the shared status cell may already be further
    /// along. Each report is handled by the status it carries.
    pub fn on_connection_event(&mut self, conn: &Connection, status: ConnectionStatus) {
        let address = conn.address();

        let membership = match self.links.get(address) {
            Some(entry) if entry.conn.id() == conn.id() => entry.membership,
            Some(entry) => {
                debug!(
                    addr = %address,
                    stale_id = conn.id(),
                    current_id = entry.conn.id(),
                    ?status,
                    "ignoring stale status report"
                );
                return;
            }
            None => {
                debug!(addr = %address, id = conn.id(), ?status, "status report for untracked link");
                return;
            }
        };

        debug!(addr = %address, id = conn.id(), ?status, ?membership, "connection status changed");

        match status {
            ConnectionStatus::Connected | ConnectionStatus::Ready => {
                if membership == Membership::Active {
                    // A consumer reaching Ready after the subscribe ack, or a
                    // repeated report.
                    return;
                }
                if self.closing {
                    debug!(addr = %address, ?status, "pool is closing, not promoting");
                    return;
                }
                if conn.is_connecting() || conn.is_disconnected() {
                    // Its next report is already queued behind this one.
                    debug!(addr = %address, ?status, "link dropped before report was handled");
                    return;
                }
                self.promote(address);
                self.on_established(conn, status);
            }
            ConnectionStatus::Connecting => {
                if membership == Membership::Active {
                    self.demote(address);
                }
            }
            ConnectionStatus::Disconnected => self.remove(conn),
        }
    }

    fn promote(&mut self, address: &str) {
        if let Some(entry) = self.links.get_mut(address) {
            entry.membership = Membership::Active;
            self.active.push(address.to_string());
        }
    }

    /// Moves an active link back to connecting while its transport reconnects.
    fn demote(&mut self, address: &str) {
        if let Some(entry) = self.links.get_mut(address) {
            entry.membership = Membership::Connecting;
        }
        self.active.retain(|a| a != address);
        info!(addr = %address, "connection lost, reconnecting");
    }

    fn on_established(&mut self, conn: &Connection, status: ConnectionStatus) {
        match (&self.mode, status) {
            (Mode::Consumer { topic, channel }, ConnectionStatus::Connected) => {
                info!(addr = %conn.address(), %topic, %channel, "subscribing");
                self.transport.subscribe(conn, topic, channel);
            }
            (Mode::Producer, ConnectionStatus::Connected) => {
                if !conn.mark_ready() {
                    // Dropped since promotion; the Connecting report demotes it.
                    debug!(addr = %conn.address(), status = ?conn.status(), "link lost before ready");
                    return;
                }
                info!(addr = %conn.address(), "ready to publish");
                if let Some(cb) = self.on_ready.as_mut() {
                    cb(conn);
                }
            }
            (Mode::Producer, ConnectionStatus::Ready) => {
                error!(addr = %conn.address(), "producer link reported Ready before Connected");
                debug_assert!(false, "producer link reported Ready before Connected");
            }
            // Consumer already subscribed when first seen.
            _ => {}
        }
    }

    fn remove(&mut self, conn: &Connection) {
        let address = conn.address();
        self.links.remove(address);
        self.active.retain(|a| a != address);
        debug!(addr = %address, id = conn.id(), remaining = self.links.len(), "connection removed");

        if self.links.is_empty() {
            if self.closing {
                self.closed = true;
                info!("all connections closed");
            }
            if let Some(cb) = self.on_close.take() {
                cb();
            }
        }

        // Let every transition queued for this iteration settle first.
        self.defer(Task::ConfirmDisconnected(conn.clone()));
    }

    /// Closes every link and drops the discovery timers.
    fn teardown(&mut self) {
        let links: Vec<Connection> = self.links.values().map(|e| e.conn.clone()).collect();
        debug!(connections = links.len(), "tearing down connections");
        for conn in &links {
            self.transport.close(conn);
        }

        for (_, timer) in self.lookupd_timers.drain(..) {
            timer.cancel();
        }
        self.teardown_done = true;
    }
}

fn confirm_disconnected(conn: &Connection) {
    if !conn.is_disconnected() {
        error!(
            addr = %conn.address(),
            id = conn.id(),
            status = ?conn.status(),
            "removed connection is not disconnected"
        );
    }
    debug_assert!(conn.is_disconnected(), "removed connection is not disconnected");
}
