//! Transport over the message bus daemon
//!
//! `start` spawns a client actor for the socket and a dispatch actor on top of
//! it; `stop` tears both down. The connection is shared by every proxy holding
//! this transport.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{CommandRequest, ReplyFuture, Transport, with_time_limit};
use crate::actor::{AutoStart, DispatchHandle, spawn_client};
use crate::error::{ProxyError, Result};
use crate::service::ActorService;

/// How long `start` waits for the daemon connection
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct BusConnection {
    dispatch: DispatchHandle,
    client_task: JoinHandle<()>,
    connected: watch::Receiver<bool>,
}

/// A named connection to the bus daemon
pub struct BusTransport {
    name: String,
    socket_path: PathBuf,
    auto_start: Option<AutoStart>,
    connect_timeout: Duration,
    connection: Mutex<Option<BusConnection>>,

    /// Services answered on this connection; re-served after every restart
    services: Mutex<Vec<Arc<ActorService>>>,
}

impl BusTransport {
    pub fn new(name: impl Into<String>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            socket_path: socket_path.into(),
            auto_start: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connection: Mutex::new(None),
            services: Mutex::new(Vec::new()),
        }
    }

    /// Spawn a daemon when none is listening on the socket.
    pub fn with_auto_start(mut self, auto_start: AutoStart) -> Self {
        self.auto_start = Some(auto_start);
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Answer commands addressed to `service` on this connection.
    pub async fn serve(&self, service: ActorService) -> Result<()> {
        let service = Arc::new(service);
        self.lock_services().push(service.clone());
        match self.dispatch() {
            Some(dispatch) => dispatch.serve(service).await,
            None => Ok(()),
        }
    }

    pub async fn withdraw(&self, actor: &str) -> Result<()> {
        self.lock_services().retain(|service| service.name() != actor);
        match self.dispatch() {
            Some(dispatch) => dispatch.withdraw(actor).await,
            None => Ok(()),
        }
    }

    fn dispatch(&self) -> Option<DispatchHandle> {
        self.lock_connection()
            .as_ref()
            .map(|connection| connection.dispatch.clone())
    }

    fn lock_connection(&self) -> MutexGuard<'_, Option<BusConnection>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_services(&self) -> MutexGuard<'_, Vec<Arc<ActorService>>> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for BusTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.lock_connection()
            .as_ref()
            .is_some_and(|connection| *connection.connected.borrow())
    }

    async fn start(&self) -> Result<()> {
        let (mut connected, fresh) = {
            let mut guard = self.lock_connection();
            match guard.as_ref() {
                Some(connection) => (connection.connected.clone(), None),
                None => {
                    info!("{}: connecting to bus at {}", self.name, self.socket_path.display());
                    let client = spawn_client(self.socket_path.clone(), &self.name, self.auto_start.clone());
                    let dispatch = DispatchHandle::new(client.from_bus, client.to_bus, &self.name);
                    let connected = client.connected.clone();
                    *guard = Some(BusConnection {
                        dispatch: dispatch.clone(),
                        client_task: client.task,
                        connected: client.connected,
                    });
                    (connected, Some(dispatch))
                }
            }
        };

        if let Some(dispatch) = fresh {
            let services = self.lock_services().clone();
            for service in services {
                dispatch.serve(service).await?;
            }
        }

        let up = async move { connected.wait_for(|up| *up).await.map(|_| ()) };
        match tokio::time::timeout(self.connect_timeout, up).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ProxyError::ChannelClosed),
            Err(_) => {
                // The client actor keeps retrying in the background.
                warn!("{}: bus at {} not reachable yet", self.name, self.socket_path.display());
                Err(ProxyError::NotConnected)
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        let Some(connection) = self.lock_connection().take() else {
            return Ok(());
        };
        info!("{}: disconnecting from bus", self.name);

        drop(connection.dispatch);
        connection.client_task.abort();
        if let Err(e) = connection.client_task.await {
            if !e.is_cancelled() {
                return Err(ProxyError::Transport(format!("client actor failed: {e}")));
            }
        }
        Ok(())
    }

    async fn send_command(&self, request: CommandRequest) -> Result<ReplyFuture> {
        if !self.is_connected() {
            return Err(ProxyError::NotConnected);
        }
        let dispatch = self.dispatch().ok_or(ProxyError::NotConnected)?;

        let command_line = request.command_line();
        debug!("{} -> {}: {command_line}", self.name, request.actor);
        let reply_rx = dispatch
            .send_command(&request.actor, command_line, request.callback.clone())
            .await?;

        Ok(with_time_limit(&request, async move {
            reply_rx.await.map_err(|_| ProxyError::ChannelClosed)
        }))
    }
}
