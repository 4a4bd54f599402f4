//! The TCP listener and the per-connection request loop.
//!
//! Every accepted connection gets its own task running a small state machine:
//! wait for a line (bounded by the idle timeout), parse it, execute it on a
//! separate task (bounded by the command timeout), write exactly one reply,
//! repeat. Parse and domain failures are answered with an `ER` line and keep
//! the connection open; an idle timeout, a read failure, end of stream or
//! server shutdown close it.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    io::{AsyncWrite, BufReader},
    net::{TcpListener, TcpStream},
    select,
    sync::watch,
    task::{JoinError, JoinSet},
    time::timeout,
};
use tracing::{debug, error, warn};

use crate::{
    dispatcher::{Dispatcher, Reply},
    gate::CommitGate,
    protocol::ParsedCommand,
    wire::{is_line_too_long, read_line, write_line, LineTooLong},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// How long a single command may run before the client is told `ER timeout`.
    pub command: Duration,
    /// How long a connection may sit without sending a line.
    pub idle: Duration,
}

pub struct Server {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    timeouts: Timeouts,
}

impl Server {
    pub fn new(listener: TcpListener, dispatcher: Dispatcher, timeouts: Timeouts) -> Self {
        Self {
            listener,
            dispatcher: Arc::new(dispatcher),
            timeouts,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves, then closes every live
    /// connection and waits for their tasks to finish.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            dispatcher,
            timeouts,
        } = self;
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &dispatcher, timeouts, &stop_rx, &mut connections);
                }
                Some(finished) = connections.join_next() => log_connection_exit(finished),
            }
        }

        drop(listener);
        let _ = stop_tx.send(true);
        debug!(open = connections.len(), "closing open connections");
        while let Some(finished) = connections.join_next().await {
            log_connection_exit(finished);
        }

        Ok(())
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    dispatcher: &Arc<Dispatcher>,
    timeouts: Timeouts,
    stop: &watch::Receiver<bool>,
    connections: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => {
            let dispatcher = Arc::clone(dispatcher);
            let stop = stop.clone();
            connections.spawn(async move {
                debug!(peer = %peer, "client connected");
                if let Err(err) = handle_connection(stream, dispatcher, timeouts, stop).await {
                    debug!(peer = %peer, error = ?err, "client connection closed with error");
                } else {
                    debug!(peer = %peer, "client disconnected");
                }
            });
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn log_connection_exit(finished: Result<(), JoinError>) {
    if let Err(err) = finished {
        if err.is_panic() {
            error!(error = ?err, "connection task panicked");
        }
    }
}

/// Resolves once the server asks connections to close, or once the server
/// itself is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

async fn handle_connection(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
    timeouts: Timeouts,
    mut stop: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let line = select! {
            _ = stop_requested(&mut stop) => break,
            read = timeout(timeouts.idle, read_line(&mut reader)) => match read {
                Err(_) => {
                    let _ = send_reply(&mut writer, &Reply::idle_timeout(), &mut stop).await;
                    break;
                }
                Ok(Ok(Some(line))) => Ok(line),
                Ok(Ok(None)) => break,
                Ok(Err(err)) if is_line_too_long(&err) => Err(LineTooLong),
                Ok(Err(err)) => return Err(err),
            },
        };

        let reply = match line.map(|line| ParsedCommand::parse(&line)) {
            Err(too_long) => Reply::error(too_long),
            Ok(Err(err)) => Reply::error(err),
            Ok(Ok(parsed)) => {
                match execute(&dispatcher, parsed, timeouts.command, &mut stop).await {
                    Some(reply) => reply,
                    None => break,
                }
            }
        };
        if !send_reply(&mut writer, &reply, &mut stop).await? {
            break;
        }
    }

    Ok(())
}

/// Writes one reply line. Returns `Ok(false)` without finishing the write
/// when the server shuts down first, so a client that stopped reading cannot
/// hold up shutdown.
async fn send_reply<W>(
    writer: &mut W,
    reply: &Reply,
    stop: &mut watch::Receiver<bool>,
) -> std::io::Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let line = reply.to_string();
    select! {
        _ = stop_requested(stop) => Ok(false),
        written = write_line(writer, &line) => written.map(|()| true),
    }
}

/// Runs one command on its own task, bounded by `limit`.
///
/// Returns `None` when the server is shutting down and the connection should
/// close without a reply.
async fn execute(
    dispatcher: &Arc<Dispatcher>,
    parsed: ParsedCommand,
    limit: Duration,
    stop: &mut watch::Receiver<bool>,
) -> Option<Reply> {
    let gate = CommitGate::new();
    let mut task = tokio::spawn({
        let dispatcher = Arc::clone(dispatcher);
        let gate = gate.clone();
        async move { dispatcher.execute(parsed, &gate).await }
    });

    select! {
        _ = stop_requested(stop) => {
            if gate.abandon() {
                task.abort();
            }
            None
        }
        outcome = timeout(limit, &mut task) => Some(match outcome {
            Ok(joined) => reply_from(joined),
            Err(_) if gate.abandon() => {
                task.abort();
                Reply::timeout()
            }
            // Already committing: the change will land, so report it.
            Err(_) => reply_from(task.await),
        }),
    }
}

fn reply_from(joined: Result<Reply, JoinError>) -> Reply {
    joined.unwrap_or_else(|err| {
        error!(error = ?err, "command task failed");
        Reply::internal_error()
    })
}
