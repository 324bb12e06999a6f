//! Broker transport: the capability the pool uses to drive links.

mod link;

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use nsqlink_protocol::{Command, ProtocolError};

use crate::connection::Connection;
use crate::reactor::Reactor;
use crate::types::{MessageCallback, PoolConfig};

use link::{LinkCommand, LinkContext, run_link};

/// Errors from the transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("timed out")]
    Timeout,

    #[error("broker rejected handshake: {0}")]
    Rejected(String),

    #[error("no link for {0}")]
    NoLink(String),

    #[error("link to {0} has stopped")]
    LinkStopped(String),
}

/// Operations the pool needs from a broker transport.
///
/// Every method returns immediately. Status changes are written to the
/// [`Connection`] and reported back to the pool's event loop as
/// [`LoopEvent::Status`](crate::LoopEvent::Status), carrying the status
/// being reported, never by calling into the pool.
pub trait Transport: Send {
    /// Starts connecting `conn`. Delivered messages go to `on_message`.
    fn connect(&mut self, conn: &Connection, on_message: Option<MessageCallback>);

    /// Subscribes an established link; the ack promotes it to `Ready`.
    fn subscribe(&mut self, conn: &Connection, topic: &str, channel: &str);

    /// Publishes one message over `conn`.
    fn publish(&mut self, conn: &Connection, topic: &str, body: Vec<u8>) -> Result<(), TransportError>;

    /// Starts a clean close; the link ends by reporting `Disconnected`.
    fn close(&mut self, conn: &Connection);
}

struct LinkHandle {
    commands: mpsc::UnboundedSender<LinkCommand>,
    task: JoinHandle<()>,
}

/// TCP transport running one tokio task per link.
pub struct TcpTransport {
    reactor: Reactor,
    config: PoolConfig,
    links: HashMap<u64, LinkHandle>,
}

impl TcpTransport {
    pub fn new(reactor: Reactor, config: PoolConfig) -> Self {
        Self {
            reactor,
            config,
            links: HashMap::new(),
        }
    }

    fn send(&self, conn: &Connection, cmd: LinkCommand) -> Result<(), TransportError> {
        let link = self
            .links
            .get(&conn.id())
            .ok_or_else(|| TransportError::NoLink(conn.address().to_string()))?;
        link.commands
            .send(cmd)
            .map_err(|_| TransportError::LinkStopped(conn.address().to_string()))
    }

    /// Forgets links whose task has ended.
    fn prune(&mut self) {
        self.links.retain(|_, link| !link.task.is_finished());
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, conn: &Connection, on_message: Option<MessageCallback>) {
        self.prune();

        let (commands, rx) = mpsc::unbounded_channel();
        let ctx = LinkContext {
            reactor: self.reactor.clone(),
            config: self.config.clone(),
            on_message,
        };
        let task = tokio::spawn(run_link(conn.clone(), ctx, rx));
        self.links.insert(conn.id(), LinkHandle { commands, task });
    }

    fn subscribe(&mut self, conn: &Connection, topic: &str, channel: &str) {
        let cmd = LinkCommand::Subscribe {
            topic: topic.to_string(),
            channel: channel.to_string(),
        };
        if let Err(e) = self.send(conn, cmd) {
            debug!(addr = %conn.address(), error = %e, "subscribe not delivered");
        }
    }

    fn publish(&mut self, conn: &Connection, topic: &str, body: Vec<u8>) -> Result<(), TransportError> {
        let cmd = Command::publish(topic, body)?;
        self.send(conn, LinkCommand::Send(cmd))
    }

    fn close(&mut self, conn: &Connection) {
        self.prune();
        if let Err(e) = self.send(conn, LinkCommand::Close) {
            debug!(addr = %conn.address(), error = %e, "close not delivered");
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        for link in self.links.values() {
            link.task.abort();
        }
    }
}
