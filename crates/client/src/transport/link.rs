//! Per-broker link task: dial, handshake, frame pump, reconnect.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use nsqlink_protocol::constants::{CLOSE_WAIT, MAGIC_V2};
use nsqlink_protocol::{Command, Frame};

use crate::connection::Connection;
use crate::reactor::{LoopEvent, Reactor};
use crate::transport::TransportError;
use crate::types::{ConnectionStatus, MessageCallback, PoolConfig};

/// Upper bound on TCP connect plus IDENTIFY round-trip.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for `CLOSE_WAIT` after sending `CLS`.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Requests from the transport to a link task.
#[derive(Debug)]
pub(crate) enum LinkCommand {
    Subscribe { topic: String, channel: String },
    Send(Command),
    Close,
}

/// Everything a link task needs besides its connection.
#[derive(Clone)]
pub(crate) struct LinkContext {
    pub(crate) reactor: Reactor,
    pub(crate) config: PoolConfig,
    pub(crate) on_message: Option<MessageCallback>,
}

enum SessionEnd {
    /// Closed on request; do not reconnect.
    Closed,
    /// Dropped unexpectedly; reconnect after backoff.
    Lost(String),
}

/// Stores `status` and tells the pool, unless nothing changed.
fn report(conn: &Connection, ctx: &LinkContext, status: ConnectionStatus) {
    if conn.set_status(status) != status {
        ctx.reactor.notify(LoopEvent::Status {
            conn: conn.clone(),
            status,
        });
    }
}

/// Runs one link until it is closed, reconnecting with backoff in between.
///
/// Reports `Connected` after each successful handshake, `Connecting` while
/// re-dialing and `Disconnected` exactly once, on the way out.
pub(crate) async fn run_link(
    conn: Connection,
    ctx: LinkContext,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
) {
    let addr = conn.address().to_string();
    let mut attempt: u32 = 0;

    loop {
        let dialed = {
            let dial = open(&addr, &ctx);
            tokio::pin!(dial);
            loop {
                tokio::select! {
                    res = &mut dial => break Some(res),
                    cmd = commands.recv() => match cmd {
                        Some(LinkCommand::Close) | None => break None,
                        Some(cmd) => debug!(addr = %addr, ?cmd, "link not established, dropping command"),
                    },
                }
            }
        };
        let Some(dialed) = dialed else {
            break;
        };

        match dialed {
            Ok((stream, buf)) => {
                attempt = 0;
                info!(addr = %addr, "connected to broker");
                report(&conn, &ctx, ConnectionStatus::Connected);
                match session(stream, buf, &conn, &ctx, &mut commands).await {
                    SessionEnd::Closed => break,
                    SessionEnd::Lost(reason) => warn!(addr = %addr, %reason, "connection lost"),
                }
            }
            Err(e) => warn!(addr = %addr, error = %e, attempt, "connect failed"),
        }

        report(&conn, &ctx, ConnectionStatus::Connecting);
        attempt = attempt.saturating_add(1);
        let delay = ctx.config.reconnect.delay_for_attempt(attempt);
        debug!(addr = %addr, attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
        if !wait_or_close(&mut commands, delay).await {
            break;
        }
    }

    report(&conn, &ctx, ConnectionStatus::Disconnected);
    info!(addr = %addr, "link closed");
}

/// Sleeps for `delay`. Returns `false` if a close arrived meanwhile.
async fn wait_or_close(commands: &mut mpsc::UnboundedReceiver<LinkCommand>, delay: Duration) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            () = &mut sleep => return true,
            cmd = commands.recv() => match cmd {
                Some(LinkCommand::Close) | None => return false,
                Some(cmd) => trace!(?cmd, "reconnecting, dropping command"),
            },
        }
    }
}

/// Dials the broker and performs the protocol handshake.
///
/// Returns the stream and any bytes read past the handshake.
async fn open(addr: &str, ctx: &LinkContext) -> Result<(TcpStream, Vec<u8>), TransportError> {
    let mut stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)??;
    stream.set_nodelay(true)?;
    stream.write_all(MAGIC_V2).await?;

    let mut buf = Vec::new();
    if let Some(client_id) = &ctx.config.client_id {
        let identify = Command::identify(&serde_json::json!({
            "client_id": client_id,
            "feature_negotiation": false,
        }))?;
        stream.write_all(&identify.to_bytes()).await?;

        let frame = tokio::time::timeout(DIAL_TIMEOUT, read_frame(&mut stream, &mut buf))
            .await
            .map_err(|_| TransportError::Timeout)??;
        match frame {
            ok if ok.is_ok() => {}
            Frame::Error(body) => {
                return Err(TransportError::Rejected(String::from_utf8_lossy(&body).into_owned()));
            }
            other => {
                return Err(TransportError::Rejected(format!(
                    "unexpected IDENTIFY reply: {other:?}"
                )));
            }
        }
    }

    Ok((stream, buf))
}

async fn read_frame(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Result<Frame, TransportError> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some((frame, used)) = Frame::decode(buf)? {
            buf.drain(..used);
            return Ok(frame);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Pumps frames and commands over an established stream.
async fn session(
    stream: TcpStream,
    mut buf: Vec<u8>,
    conn: &Connection,
    ctx: &LinkContext,
    commands: &mut mpsc::UnboundedReceiver<LinkCommand>,
) -> SessionEnd {
    let (mut reader, mut writer) = stream.into_split();
    let heartbeat_timeout = ctx.config.heartbeat_timeout();

    // Any inbound bytes push the deadline out; brokers heartbeat well within it.
    let deadline = tokio::time::sleep(heartbeat_timeout);
    tokio::pin!(deadline);

    let mut subscribing = false;
    let mut closing = false;
    let mut chunk = [0u8; 8192];

    loop {
        loop {
            let (frame, used) = match Frame::decode(&buf) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => break,
                Err(e) => return SessionEnd::Lost(e.to_string()),
            };
            buf.drain(..used);

            let reply = match frame {
                Frame::Response(body) if body == CLOSE_WAIT => return SessionEnd::Closed,
                heartbeat if heartbeat.is_heartbeat() => {
                    trace!(addr = %conn.address(), "heartbeat");
                    Some(Command::Nop)
                }
                ok if ok.is_ok() => {
                    if subscribing {
                        subscribing = false;
                        report(conn, ctx, ConnectionStatus::Ready);
                        Some(Command::Rdy(ctx.config.rdy_count))
                    } else {
                        None
                    }
                }
                Frame::Response(body) => {
                    debug!(addr = %conn.address(), body = %String::from_utf8_lossy(&body), "response");
                    None
                }
                Frame::Error(body) => {
                    let text = String::from_utf8_lossy(&body).into_owned();
                    if subscribing {
                        return SessionEnd::Lost(format!("subscribe rejected: {text}"));
                    }
                    warn!(addr = %conn.address(), error = %text, "broker error");
                    None
                }
                Frame::Message(msg) => {
                    let finish = match &ctx.on_message {
                        Some(cb) => cb(&msg),
                        None => {
                            warn!(addr = %conn.address(), id = %msg.id_str(), "no message callback, requeueing");
                            false
                        }
                    };
                    Some(if finish {
                        Command::Fin(msg.id)
                    } else {
                        Command::Req {
                            id: msg.id,
                            timeout_ms: 0,
                        }
                    })
                }
            };

            if let Some(cmd) = reply {
                if let Err(e) = writer.write_all(&cmd.to_bytes()).await {
                    return lost_or_closed(closing, e.to_string());
                }
            }
        }

        tokio::select! {
            () = &mut deadline => {
                return lost_or_closed(closing, "heartbeat timeout".into());
            }

            cmd = commands.recv(), if !closing => {
                let cmd = match cmd {
                    None => return SessionEnd::Closed,
                    Some(LinkCommand::Close) => {
                        closing = true;
                        deadline.as_mut().reset(tokio::time::Instant::now() + CLOSE_TIMEOUT);
                        Command::Cls
                    }
                    Some(LinkCommand::Subscribe { topic, channel }) => {
                        match Command::sub(&topic, &channel) {
                            Ok(cmd) => {
                                subscribing = true;
                                cmd
                            }
                            Err(e) => {
                                error!(addr = %conn.address(), error = %e, "cannot subscribe");
                                continue;
                            }
                        }
                    }
                    Some(LinkCommand::Send(cmd)) => cmd,
                };
                trace!(addr = %conn.address(), cmd = cmd.name(), "sending");
                if let Err(e) = writer.write_all(&cmd.to_bytes()).await {
                    return lost_or_closed(closing, e.to_string());
                }
            }

            n = reader.read(&mut chunk) => match n {
                Ok(0) => return lost_or_closed(closing, "connection closed by broker".into()),
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if !closing {
                        deadline.as_mut().reset(tokio::time::Instant::now() + heartbeat_timeout);
                    }
                }
                Err(e) => return lost_or_closed(closing, e.to_string()),
            },
        }
    }
}

fn lost_or_closed(closing: bool, reason: String) -> SessionEnd {
    if closing {
        SessionEnd::Closed
    } else {
        SessionEnd::Lost(reason)
    }
}
