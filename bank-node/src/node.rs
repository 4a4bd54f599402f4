//! Start/stop control over a running bank node.
//!
//! The controller owns the listener task and keeps the [`Bank`] alive across
//! restarts, so stopping and starting again with the same address and state
//! file serves the same table without reloading it.

use std::{net::SocketAddr, sync::Arc};

use thiserror::Error;
use tokio::{
    net::TcpListener,
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{error, warn};

use crate::{
    bank::Bank,
    config::{ConfigError, NodeConfig},
    dispatcher::Dispatcher,
    events::Events,
    forward::Forwarder,
    server::{Server, Timeouts},
    snapshot::SnapshotStore,
};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node is already running")]
    AlreadyRunning,
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

struct Running {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    running: Option<Running>,
    bank: Option<Arc<Bank>>,
}

pub struct NodeController {
    events: Events,
    state: Mutex<State>,
}

impl NodeController {
    pub fn new(events: Events) -> Self {
        Self {
            events,
            state: Mutex::new(State::default()),
        }
    }

    pub fn events(&self) -> &Events {
        &self.events
    }

    /// Binds the listener and starts serving. Returns the bound address, which
    /// matters when the configured port is 0.
    pub async fn start(&self, config: &NodeConfig) -> Result<SocketAddr, NodeError> {
        config.validate()?;

        let mut state = self.state.lock().await;
        if state.running.is_some() {
            return Err(NodeError::AlreadyRunning);
        }

        let bind_addr = SocketAddr::new(config.bind, config.port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| NodeError::Bind {
                addr: bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| NodeError::Bind {
            addr: bind_addr,
            source,
        })?;

        let bank = match state.bank.take() {
            Some(bank) if reusable(&bank, config) => bank,
            _ => Arc::new(Bank::open(
                config.address.clone(),
                SnapshotStore::new(config.state_path.clone()),
                self.events.clone(),
            )),
        };
        state.bank = Some(Arc::clone(&bank));

        let forwarder = Forwarder::new(config.port, config.forward_timeout())
            .serving(local_addr, &config.address);
        let timeouts = Timeouts {
            command: config.command_timeout(),
            idle: config.idle_timeout(),
        };
        let server = Server::new(listener, Dispatcher::new(bank, forwarder), timeouts);

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let stopped = async {
                let _ = shutdown_rx.await;
            };
            if let Err(err) = server.run_until(stopped).await {
                error!(error = ?err, "server exited with error");
            }
        });

        state.running = Some(Running {
            local_addr,
            shutdown,
            task,
        });
        self.events.info(
            "SERVER",
            format!("bank {} listening on {local_addr}", config.address),
        );
        Ok(local_addr)
    }

    /// Stops accepting, closes every connection and waits for the server task.
    /// Does nothing when the node is not running.
    pub async fn stop(&self) {
        let Some(running) = self.state.lock().await.running.take() else {
            return;
        };

        let _ = running.shutdown.send(());
        if let Err(err) = running.task.await {
            warn!(error = ?err, "server task did not finish cleanly");
        }
        self.events.info(
            "SERVER",
            format!("stopped listening on {}", running.local_addr),
        );
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running.is_some()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state
            .lock()
            .await
            .running
            .as_ref()
            .map(|running| running.local_addr)
    }

    /// The bank served by the most recent start, if any.
    pub async fn bank(&self) -> Option<Arc<Bank>> {
        self.state.lock().await.bank.clone()
    }
}

fn reusable(bank: &Bank, config: &NodeConfig) -> bool {
    bank.address() == config.address && bank.snapshot_path() == config.state_path.as_path()
}
