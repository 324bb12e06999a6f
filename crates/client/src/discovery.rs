//! Directory (lookupd) discovery for [`ConnectionPool`].
//!
//! The poller only ever adds brokers. An address that disappears from a
//! later response keeps its link.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use nsqlink_protocol::LookupResponse;
use nsqlink_protocol::address::split_list;

use crate::pool::ConnectionPool;
use crate::reactor::{LoopEvent, Reactor, Task};

/// Errors from a single directory query.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("lookupd returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Issues directory queries on behalf of the pool.
///
/// Implementations must not block: the result is delivered later as a
/// [`LoopEvent::Lookup`].
pub trait Directory: Send {
    fn query(&self, url: &str);
}

/// Directory client backed by `reqwest`.
pub struct HttpDirectory {
    http: reqwest::Client,
    reactor: Reactor,
}

impl HttpDirectory {
    /// Creates a client whose requests time out after `timeout`.
    pub fn new(reactor: Reactor, timeout: Duration) -> Result<Self, LookupError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, reactor })
    }
}

impl Directory for HttpDirectory {
    fn query(&self, url: &str) {
        let http = self.http.clone();
        let reactor = self.reactor.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            let result = fetch(&http, &url).await;
            reactor.notify(LoopEvent::Lookup { url, result });
        });
    }
}

/// Performs one GET against a directory URL and parses the envelope.
pub(crate) async fn fetch(http: &reqwest::Client, url: &str) -> Result<LookupResponse, LookupError> {
    let resp = http.get(url).send().await?;
    let status = resp.status();

    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(LookupError::Status {
            status: status.as_u16(),
            body,
        });
    }

    let body = resp.bytes().await?;
    Ok(LookupResponse::from_slice(&body)?)
}

impl ConnectionPool {
    /// Queries `url` now, then again every configured interval until close.
    pub fn connect_to_lookupd(&mut self, url: &str) {
        if self.closing {
            warn!(url = %url, "pool is closing, not polling lookupd");
            return;
        }
        if self.lookupd_timers.iter().any(|(u, _)| u == url) {
            debug!(url = %url, "lookupd already polled");
            return;
        }

        self.query_lookupd(url);

        let interval = self.config.lookupd_interval();
        let timer = self
            .reactor
            .run_every(interval, Task::QueryLookupd(url.to_string()));
        self.lookupd_timers.push((url.to_string(), timer));
        info!(url = %url, interval_secs = interval.as_secs(), "polling lookupd");
    }

    /// Polls every URL in a comma-separated list.
    pub fn connect_to_lookupds(&mut self, urls: &str) {
        for url in split_list(urls) {
            self.connect_to_lookupd(&url);
        }
    }

    /// Directory URLs currently being polled.
    pub fn lookupd_urls(&self) -> Vec<String> {
        self.lookupd_timers.iter().map(|(u, _)| u.clone()).collect()
    }

    pub(crate) fn query_lookupd(&mut self, url: &str) {
        if self.closing {
            return;
        }
        debug!(url = %url, "querying lookupd");
        self.directory.query(url);
    }

    /// Connects to every newly advertised broker in a directory response.
    ///
    /// Failures are logged and otherwise ignored; the next periodic query
    /// is the retry.
    pub fn on_lookup_result(&mut self, url: &str, result: Result<LookupResponse, LookupError>) {
        if self.closing {
            debug!(url = %url, "pool closing, ignoring lookupd response");
            return;
        }

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                error!(url = %url, error = %e, "lookupd query failed, will retry later");
                return;
            }
        };

        if !resp.is_ok() {
            error!(
                url = %url,
                status_code = resp.status_code,
                status_txt = %resp.status_txt,
                "lookupd reported failure, will retry later"
            );
            return;
        }

        let addrs = resp.producer_addresses();
        info!(url = %url, producers = addrs.len(), "lookupd response OK");
        for addr in addrs {
            if !self.is_known_address(&addr) {
                self.connect_to(&addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, FakeDirectory, FakeTransport, pump};
    use crate::types::{ConnectionStatus, Mode, PoolConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const URL: &str = "http://127.0.0.1:4161/lookup?topic=orders";

    fn lookup_ok(producers: &[(&str, u16)]) -> Result<LookupResponse, LookupError> {
        let producers: Vec<serde_json::Value> = producers
            .iter()
            .map(|(host, port)| serde_json::json!({"broadcast_address": host, "tcp_port": port}))
            .collect();
        let body = serde_json::json!({
            "status_code": 200,
            "status_txt": "OK",
            "data": {"producers": producers}
        });
        Ok(serde_json::from_value(body).unwrap())
    }

    fn pool() -> (
        ConnectionPool,
        FakeTransport,
        FakeDirectory,
        tokio::sync::mpsc::UnboundedReceiver<LoopEvent>,
    ) {
        let (reactor, rx) = Reactor::new();
        let transport = FakeTransport::default();
        let directory = FakeDirectory::default();
        let pool = ConnectionPool::new(
            Mode::consumer("orders", "billing").unwrap(),
            PoolConfig::default(),
            reactor,
            Box::new(transport.clone()),
            Box::new(directory.clone()),
        );
        (pool, transport, directory, rx)
    }

    #[test]
    fn new_producers_are_connected_known_ones_skipped() {
        let (mut pool, transport, _dir, _rx) = pool();
        pool.connect_to("x:4150");
        let x = pool.connection("x:4150").unwrap();
        x.set_status(ConnectionStatus::Connected);
        pool.on_connection_event(&x, ConnectionStatus::Connected);

        pool.on_lookup_result(URL, lookup_ok(&[("x", 4150), ("y", 4150)]));

        let connects: Vec<Call> = transport
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Connect(_)))
            .collect();
        assert_eq!(
            connects,
            vec![Call::Connect("x:4150".into()), Call::Connect("y:4150".into())]
        );
    }

    #[test]
    fn discovery_never_removes() {
        let (mut pool, transport, _dir, _rx) = pool();
        pool.on_lookup_result(URL, lookup_ok(&[("a", 4150), ("b", 4150)]));
        pool.on_lookup_result(URL, lookup_ok(&[("a", 4150)]));

        assert_eq!(pool.connecting_addresses(), vec!["a:4150", "b:4150"]);
        assert_eq!(transport.count(|c| matches!(c, Call::Connect(_))), 2);
        assert_eq!(transport.count(|c| matches!(c, Call::Close(_))), 0);
    }

    #[test]
    fn failures_are_ignored() {
        let (mut pool, transport, _dir, _rx) = pool();
        pool.on_lookup_result(
            URL,
            Err(LookupError::Status {
                status: 500,
                body: "boom".into(),
            }),
        );
        let bad = serde_json::from_str::<LookupResponse>("{").unwrap_err();
        pool.on_lookup_result(URL, Err(LookupError::Json(bad)));
        pool.on_lookup_result(
            URL,
            Ok(LookupResponse {
                status_code: 500,
                status_txt: "INVALID_ARG_TOPIC".into(),
                data: None,
            }),
        );

        assert!(pool.is_empty());
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn responses_after_close_are_ignored() {
        let (mut pool, transport, _dir, mut rx) = pool();
        pool.close();
        pump(&mut pool, &mut rx);
        pool.on_lookup_result(URL, lookup_ok(&[("a", 4150)]));
        assert!(pool.is_empty());
        assert!(transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn polls_immediately_then_periodically_until_close() {
        let (mut pool, _transport, directory, mut rx) = pool();
        pool.connect_to_lookupd(URL);
        pool.connect_to_lookupd(URL);
        assert_eq!(directory.queries(), vec![URL.to_string()]);
        assert_eq!(pool.lookupd_urls(), vec![URL.to_string()]);

        tokio::time::sleep(Duration::from_secs(31)).await;
        pump(&mut pool, &mut rx);
        assert_eq!(directory.queries().len(), 2);

        pool.close();
        pump(&mut pool, &mut rx);
        assert!(pool.lookupd_urls().is_empty());

        tokio::time::sleep(Duration::from_secs(120)).await;
        pump(&mut pool, &mut rx);
        assert_eq!(directory.queries().len(), 2);
    }

    /// Starts a one-shot HTTP server answering with `status` and `body`.
    async fn mock_server(status: u16, body: &str) -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = format!("http://127.0.0.1:{port}/lookup?topic=orders");
        let body = body.to_string();

        let handle = tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = vec![0u8; 8192];
                let _ = stream.read(&mut buf).await;

                let resp = format!(
                    "HTTP/1.1 {status} Status\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(resp.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        (url, handle)
    }

    #[tokio::test]
    async fn fetch_parses_envelope() {
        let (url, handle) = mock_server(
            200,
            r#"{"status_code":200,"status_txt":"OK","data":{"producers":[{"broadcast_address":"a","tcp_port":4150}]}}"#,
        )
        .await;

        let http = reqwest::Client::new();
        let resp = fetch(&http, &url).await.unwrap();
        assert!(resp.is_ok());
        assert_eq!(resp.producer_addresses(), vec!["a:4150"]);

        handle.abort();
    }

    #[tokio::test]
    async fn fetch_reports_http_status() {
        let (url, handle) = mock_server(404, r#"{"message":"TOPIC_NOT_FOUND"}"#).await;

        let http = reqwest::Client::new();
        let err = fetch(&http, &url).await.unwrap_err();
        assert!(matches!(err, LookupError::Status { status: 404, .. }));

        handle.abort();
    }

    #[tokio::test]
    async fn fetch_reports_malformed_body() {
        let (url, handle) = mock_server(200, "not json").await;

        let http = reqwest::Client::new();
        let err = fetch(&http, &url).await.unwrap_err();
        assert!(matches!(err, LookupError::Json(_)));

        handle.abort();
    }

    #[tokio::test]
    async fn http_directory_delivers_result_to_loop() {
        let (url, handle) = mock_server(
            200,
            r#"{"status_code":200,"status_txt":"OK","data":{"producers":[]}}"#,
        )
        .await;

        let (reactor, mut rx) = Reactor::new();
        let directory = HttpDirectory::new(reactor, Duration::from_secs(2)).unwrap();
        directory.query(&url);

        match rx.recv().await {
            Some(LoopEvent::Lookup { url: got, result }) => {
                assert_eq!(got, url);
                assert!(result.unwrap().producer_addresses().is_empty());
            }
            _ => panic!("expected lookup event"),
        }

        handle.abort();
    }
}
