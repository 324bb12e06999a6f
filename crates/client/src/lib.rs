//! Connection pool for producers and consumers talking to a set of brokers.
//!
//! Brokers are added directly by address or discovered through directory
//! (lookupd) endpoints. All pool state lives on a single [`EventLoop`] task;
//! transports and directory queries report back to it through a [`Reactor`].

pub mod connection;
mod discovery;
pub mod pool;
pub mod reactor;
#[cfg(test)]
mod testing;
pub mod transport;
pub mod types;

pub use connection::Connection;
pub use discovery::{Directory, HttpDirectory, LookupError};
pub use pool::{ConnectionPool, PoolError};
pub use reactor::{EventLoop, LoopEvent, PoolHandle, Reactor, Task, TimerHandle};
pub use transport::{TcpTransport, Transport, TransportError};
pub use types::{
    CloseCallback, ConnectionStatus, Lifecycle, MessageCallback, Mode, PoolConfig,
    ReadyCallback, ReconnectConfig,
};
