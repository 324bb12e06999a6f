//! Directory service (lookupd) response types.

use serde::{Deserialize, Serialize};

use crate::constants::LOOKUP_STATUS_OK;

/// Envelope returned by a directory `lookup` query.
///
/// `status_code` is independent of the HTTP status: a 200 HTTP response can
/// still carry a failing payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupResponse {
    pub status_code: i64,
    #[serde(default)]
    pub status_txt: String,
    #[serde(default)]
    pub data: Option<LookupData>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LookupData {
    #[serde(default)]
    pub producers: Vec<Producer>,
}

/// A broker advertised by the directory service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Producer {
    pub broadcast_address: String,
    pub tcp_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Producer {
    /// Returns the `host:port` the client connects to.
    pub fn tcp_address(&self) -> String {
        format!("{}:{}", self.broadcast_address, self.tcp_port)
    }
}

impl LookupResponse {
    /// True when the payload reports success.
    pub fn is_ok(&self) -> bool {
        self.status_code == LOOKUP_STATUS_OK
    }

    /// Parses a response body.
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// Returns the advertised TCP addresses in response order.
    pub fn producer_addresses(&self) -> Vec<String> {
        self.data
            .as_ref()
            .map(|d| d.producers.iter().map(Producer::tcp_address).collect())
            .unwrap_or_default()
    }
}
