//! Wires the pool, transport and directory client together.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use nsqlink_client::{
    Connection, ConnectionPool, EventLoop, HttpDirectory, Mode, PoolError, PoolHandle, Reactor,
    TcpTransport,
};
use nsqlink_protocol::Message;
use nsqlink_protocol::command::validate_name;

use crate::config::{Config, TailMode};

/// How long to wait for links to close after shutdown is requested.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between publish attempts while no broker is ready yet.
const PUBLISH_RETRY_DELAY: Duration = Duration::from_millis(200);
const PUBLISH_RETRIES: u32 = 50;

/// Runs the tail until ctrl-c (or end of stdin when publishing).
pub async fn run(config: Config) -> anyhow::Result<()> {
    let mode = match config.mode {
        TailMode::Consume => Mode::consumer(&config.topic, &config.channel)?,
        TailMode::Publish => {
            validate_name(&config.topic)?;
            Mode::Producer
        }
    };

    let (reactor, events) = Reactor::new();
    let transport = TcpTransport::new(reactor.clone(), config.pool.clone());
    let directory = HttpDirectory::new(reactor.clone(), config.pool.lookupd_timeout())?;
    let mut pool = ConnectionPool::new(
        mode,
        config.pool.clone(),
        reactor,
        Box::new(transport),
        Box::new(directory),
    );

    let received = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&received);
    pool.set_message_callback(Arc::new(move |msg: &Message| {
        counter.fetch_add(1, Ordering::Relaxed);
        let mut out = std::io::stdout().lock();
        // A closed stdout is not worth requeueing the message for.
        let _ = out.write_all(&msg.body);
        let _ = out.write_all(b"\n");
        true
    }));
    pool.set_ready_callback(Box::new(|conn: &Connection| {
        info!(addr = %conn.address(), "broker ready for publishing");
    }));
    pool.set_close_callback(Box::new(|| info!("all broker connections closed")));

    let event_loop = EventLoop::new(pool, events);
    let handle = event_loop.handle();
    let runner = tokio::spawn(event_loop.run());

    for addr in &config.nsqd_addresses {
        handle.connect_to(addr)?;
    }
    for url in &config.lookupd_urls {
        handle.connect_to_lookupd(url)?;
    }

    match config.mode {
        TailMode::Consume => tokio::signal::ctrl_c().await?,
        TailMode::Publish => {
            tokio::select! {
                res = publish_lines(&handle, &config.topic) => res?,
                res = tokio::signal::ctrl_c() => res?,
            }
        }
    }

    info!("shutting down");
    handle.close()?;
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, runner).await {
        Ok(pool) => {
            let pool = pool?;
            info!(
                lifecycle = ?pool.lifecycle(),
                received = received.load(Ordering::Relaxed),
                "connection pool drained"
            );
        }
        Err(_) => warn!(timeout_secs = SHUTDOWN_TIMEOUT.as_secs(), "pool did not drain in time"),
    }
    Ok(())
}

/// Publishes every stdin line, waiting for a ready broker when needed.
async fn publish_lines(handle: &PoolHandle, topic: &str) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sent: u64 = 0;

    while let Some(line) = lines.next_line().await? {
        let mut attempt = 0;
        loop {
            match handle.publish(topic, line.clone().into_bytes()).await {
                Ok(()) => {
                    sent += 1;
                    break;
                }
                Err(PoolError::NoReadyConnection) if attempt < PUBLISH_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(PUBLISH_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    info!(sent, "stdin closed");
    Ok(())
}
