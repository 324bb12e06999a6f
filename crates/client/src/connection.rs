//! Shared handle to a single broker link.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::types::ConnectionStatus;

/// A logical link to one broker address.
///
/// Cheap to clone: the pool and the transport hold handles to the same
/// status cell. The cell holds the latest status; the pool dispatches on the
/// status carried by each report, since the cell may already be further
/// along. Each link gets a pool-unique id; a report carrying an id the pool
/// no longer tracks for that address is stale.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    address: String,
    status: AtomicU8,
}

impl Connection {
    /// Creates a link handle in `Connecting` status.
    pub fn new(id: u64, address: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                address: address.into(),
                status: AtomicU8::new(ConnectionStatus::Connecting as u8),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The broker `host:port`.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.inner.status.load(Ordering::Acquire))
    }

    /// Stores a new status and returns the previous one.
    pub fn set_status(&self, status: ConnectionStatus) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.inner.status.swap(status as u8, Ordering::AcqRel))
    }

    /// Moves an established link to `Ready`.
    ///
    /// Fails, leaving the status alone, if the link has since dropped back to
    /// `Connecting` or gone `Disconnected`.
    pub fn mark_ready(&self) -> bool {
        self.inner
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                match ConnectionStatus::from_u8(raw) {
                    ConnectionStatus::Connected | ConnectionStatus::Ready => {
                        Some(ConnectionStatus::Ready as u8)
                    }
                    ConnectionStatus::Connecting | ConnectionStatus::Disconnected => None,
                }
            })
            .is_ok()
    }

    pub fn is_connecting(&self) -> bool {
        self.status() == ConnectionStatus::Connecting
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn is_ready(&self) -> bool {
        self.status() == ConnectionStatus::Ready
    }

    pub fn is_disconnected(&self) -> bool {
        self.status() == ConnectionStatus::Disconnected
    }

    /// True when both handles point at the same link.
    pub fn same_link(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .field("status", &self.status())
            .finish()
    }
}
