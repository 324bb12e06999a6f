//! Recording fakes for the transport and directory collaborators.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::discovery::Directory;
use crate::pool::ConnectionPool;
use crate::reactor::LoopEvent;
use crate::transport::{Transport, TransportError};
use crate::types::MessageCallback;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Connect(String),
    Subscribe(String, String, String),
    Publish(String, String, Vec<u8>),
    Close(String),
}

#[derive(Clone, Default)]
pub(crate) struct FakeTransport {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl FakeTransport {
    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Transport for FakeTransport {
    fn connect(&mut self, conn: &Connection, _on_message: Option<MessageCallback>) {
        self.record(Call::Connect(conn.address().to_string()));
    }

    fn subscribe(&mut self, conn: &Connection, topic: &str, channel: &str) {
        self.record(Call::Subscribe(
            conn.address().to_string(),
            topic.to_string(),
            channel.to_string(),
        ));
    }

    fn publish(&mut self, conn: &Connection, topic: &str, body: Vec<u8>) -> Result<(), TransportError> {
        self.record(Call::Publish(conn.address().to_string(), topic.to_string(), body));
        Ok(())
    }

    fn close(&mut self, conn: &Connection) {
        self.record(Call::Close(conn.address().to_string()));
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeDirectory {
    queries: Arc<Mutex<Vec<String>>>,
}

impl FakeDirectory {
    pub(crate) fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

impl Directory for FakeDirectory {
    fn query(&self, url: &str) {
        self.queries.lock().unwrap().push(url.to_string());
    }
}

/// Feeds every event already queued on the reactor to the pool.
pub(crate) fn pump(pool: &mut ConnectionPool, rx: &mut mpsc::UnboundedReceiver<LoopEvent>) {
    while let Ok(event) = rx.try_recv() {
        pool.handle_event(event);
    }
}
