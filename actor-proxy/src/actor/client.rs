//! Bus client actor: owns the socket connection to the daemon
//!
//! Forwards outgoing [`BusMessage`]s as JSON lines and parses incoming lines
//! back into messages. A lost connection is retried after a fixed delay;
//! connectivity is published on a `watch` channel.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::Actor;
use crate::types::BusMessage;

/// Delay before reconnecting after a failure
const RECONNECT_DELAY: Duration = Duration::from_millis(250);

/// Start a daemon when none is listening
#[derive(Debug, Clone)]
pub struct AutoStart {
    pub options: crate::Options,
    pub idle_timeout_secs: u64,
}

/// Actor that manages the daemon connection and message transport
struct ClientActor {
    /// Messages to write to the daemon
    inbound_rx: mpsc::Receiver<BusMessage>,

    /// Messages read from the daemon
    outbound_tx: mpsc::Sender<BusMessage>,

    socket_path: PathBuf,

    /// Name announced to the daemon
    identity: String,

    auto_start: Option<AutoStart>,

    connected: watch::Sender<bool>,
}

impl Actor for ClientActor {
    async fn run(mut self) {
        loop {
            if self.outbound_tx.is_closed() {
                info!("outbound channel closed, shutting down client actor");
                break;
            }
            if self.inbound_rx.is_closed() {
                info!("inbound channel closed, shutting down client actor");
                break;
            }

            let result = self.connect_and_run().await;
            self.connected.send_replace(false);

            match result {
                Ok(()) => {
                    info!("client actor {} completed normally", self.identity);
                    break;
                }
                Err(e) => {
                    debug!("client actor {} error: {e:#}", self.identity);
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        _ = self.outbound_tx.closed() => {}
                    }
                }
            }
        }
    }
}

impl ClientActor {
    async fn connect(&self) -> Result<UnixStream> {
        let error = match UnixStream::connect(&self.socket_path).await {
            Ok(stream) => return Ok(stream),
            Err(e) => e,
        };
        let Some(auto_start) = &self.auto_start else {
            return Err(error).with_context(|| {
                format!("failed to connect to daemon at {}", self.socket_path.display())
            });
        };

        info!("no daemon at {}, starting one", self.socket_path.display());
        crate::daemon::spawn_daemon_process(
            &self.socket_path,
            auto_start.idle_timeout_secs,
            &auto_start.options,
        )
        .await?;
        UnixStream::connect(&self.socket_path).await.with_context(|| {
            format!("failed to connect to new daemon at {}", self.socket_path.display())
        })
    }

    /// Returns `Ok` when the inbound channel closes, `Err` when the connection is lost.
    async fn connect_and_run(&mut self) -> Result<()> {
        let stream = self.connect().await?;
        info!("{} connected to daemon at {}", self.identity, self.socket_path.display());

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        write_half
            .write_all(format!("#identify:{}\n", self.identity).as_bytes())
            .await
            .context("failed to send identify command")?;
        write_half.flush().await?;
        self.connected.send_replace(true);

        loop {
            tokio::select! {
                result = reader.read_line(&mut line) => {
                    match result {
                        Ok(0) => anyhow::bail!("daemon closed the connection"),
                        Ok(_) => {
                            let text = line.trim();
                            if !text.is_empty() {
                                match serde_json::from_str::<BusMessage>(text) {
                                    Ok(message) => {
                                        if self.outbound_tx.send(message).await.is_err() {
                                            info!("outbound channel closed");
                                            return Ok(());
                                        }
                                    }
                                    Err(e) => warn!("failed to parse message from daemon: {e} - {text}"),
                                }
                            }
                            line.clear();
                        }
                        Err(e) => return Err(e).context("error reading from daemon"),
                    }
                }

                message = self.inbound_rx.recv() => {
                    let Some(message) = message else {
                        info!("inbound channel closed");
                        return Ok(());
                    };
                    match serde_json::to_string(&message) {
                        Ok(json) => {
                            write_half
                                .write_all(format!("{json}\n").as_bytes())
                                .await
                                .context("failed to write to daemon")?;
                        }
                        Err(e) => error!("failed to serialize message: {e}"),
                    }
                }
            }
        }
    }
}

/// Channels of a running client actor
pub struct ClientHandle {
    /// Messages to broadcast on the bus
    pub to_bus: mpsc::Sender<BusMessage>,

    /// Messages received from the bus, including our own
    pub from_bus: mpsc::Receiver<BusMessage>,

    pub connected: watch::Receiver<bool>,

    pub task: JoinHandle<()>,
}

/// Spawn a client connection to the daemon listening on `socket_path`.
pub fn spawn_client(socket_path: PathBuf, identity: &str, auto_start: Option<AutoStart>) -> ClientHandle {
    let (inbound_tx, inbound_rx) = mpsc::channel(32);
    let (outbound_tx, outbound_rx) = mpsc::channel(32);
    let (connected_tx, connected_rx) = watch::channel(false);

    let actor = ClientActor {
        inbound_rx,
        outbound_tx,
        socket_path,
        identity: identity.to_string(),
        auto_start,
        connected: connected_tx,
    };
    let task = actor.spawn();

    ClientHandle {
        to_bus: inbound_tx,
        from_bus: outbound_rx,
        connected: connected_rx,
        task,
    }
}
