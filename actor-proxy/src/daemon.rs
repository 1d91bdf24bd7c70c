//! Message bus daemon
//!
//! A Unix domain socket broker: every line a client writes is rebroadcast to
//! all connected clients, the sender included. Clients exchange JSON encoded
//! [`BusMessage`](crate::types::BusMessage)s through it. Lines starting with
//! `#` are daemon commands and are not broadcast.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{Barrier, broadcast};
use tokio::time::{Duration, Instant, interval};
use tracing::{debug, error, info};

/// How often the daemon checks for idleness
const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Spawn the daemon as a detached process unless one already answers on `socket_path`.
///
/// Waits until the new daemon reports `DAEMON_READY` on its stdout.
pub async fn spawn_daemon_process(
    socket_path: &Path,
    idle_timeout_secs: u64,
    options: &crate::Options,
) -> Result<()> {
    use std::process::{Command, Stdio};

    if UnixStream::connect(socket_path).await.is_ok() {
        info!("bus daemon already running at {}", socket_path.display());
        return Ok(());
    }

    let current_exe = std::env::current_exe().context("failed to get current executable path")?;

    let mut cmd = Command::new(&current_exe);
    cmd.arg("daemon")
        .arg("--socket")
        .arg(socket_path)
        .arg("--idle-timeout")
        .arg(idle_timeout_secs.to_string());
    options.reproduce(&mut cmd);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd.spawn().context("failed to spawn daemon process")?;
    info!("spawned bus daemon process with PID {}", child.id());

    let stdout = child
        .stdout
        .take()
        .context("failed to capture daemon stdout")?;

    let ready = tokio::time::timeout(
        Duration::from_secs(10),
        tokio::task::spawn_blocking(move || -> Result<()> {
            use std::io::{BufRead, BufReader};
            for line in BufReader::new(stdout).lines() {
                if line?.trim() == "DAEMON_READY" {
                    return Ok(());
                }
            }
            anyhow::bail!("daemon process ended without sending DAEMON_READY")
        }),
    )
    .await
    .context("timeout waiting for daemon readiness")?;

    ready.context("daemon readiness task failed")??;
    info!("bus daemon confirmed ready");
    Ok(())
}

/// Claim `socket_path` and run the bus until it has been idle for `idle_timeout_secs`
/// or the process receives SIGINT/SIGTERM.
///
/// A socket file left behind by a dead daemon is removed and claimed again;
/// a live daemon on the same path makes this fail.
pub async fn run_daemon(
    socket_path: &Path,
    idle_timeout_secs: u64,
    ready_barrier: Option<Arc<Barrier>>,
) -> Result<()> {
    info!("daemon: attempting to claim socket {}", socket_path.display());
    let listener = claim_socket(socket_path).await?;

    info!(
        "daemon: bus started on {} with {idle_timeout_secs}s idle timeout",
        socket_path.display()
    );
    println!("DAEMON_READY");

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => info!("daemon: received SIGINT, shutting down"),
                        _ = sigterm.recv() => info!("daemon: received SIGTERM, shutting down"),
                    }
                }
                Err(e) => {
                    error!("daemon: cannot listen for SIGTERM: {e}");
                    let _ = ctrl_c.await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
    };

    let result = run_message_bus(
        listener,
        Duration::from_secs(idle_timeout_secs),
        ready_barrier,
        shutdown,
    )
    .await;

    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("failed to remove socket {}", socket_path.display()))?;
        info!("daemon: cleaned up socket {}", socket_path.display());
    }

    info!("daemon: shutdown complete");
    result
}

async fn claim_socket(socket_path: &Path) -> Result<tokio::net::UnixListener> {
    use std::os::unix::net::UnixListener;

    let listener = match UnixListener::bind(socket_path) {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            if UnixStream::connect(socket_path).await.is_ok() {
                error!("daemon: another daemon is already running on {}", socket_path.display());
                return Err(e).with_context(|| {
                    format!("failed to claim socket {}", socket_path.display())
                });
            }
            info!("daemon: removing stale socket {}", socket_path.display());
            std::fs::remove_file(socket_path)
                .with_context(|| format!("failed to remove stale socket {}", socket_path.display()))?;
            UnixListener::bind(socket_path)
                .with_context(|| format!("failed to claim socket {}", socket_path.display()))?
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to claim socket {}", socket_path.display()));
        }
    };

    info!("daemon: claimed socket {}", socket_path.display());
    listener.set_nonblocking(true)?;
    Ok(tokio::net::UnixListener::from_std(listener)?)
}

/// Accept clients and relay their lines until idle or `shutdown` completes.
async fn run_message_bus(
    listener: tokio::net::UnixListener,
    idle_timeout: Duration,
    ready_barrier: Option<Arc<Barrier>>,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    if let Some(barrier) = ready_barrier {
        barrier.wait().await;
    }

    let (tx, _rx) = broadcast::channel::<String>(1000);

    let mut clients: HashMap<usize, tokio::task::JoinHandle<()>> = HashMap::new();
    let mut next_client_id = 0;
    let mut last_activity = Instant::now();
    let mut idle_check = interval(IDLE_CHECK_INTERVAL);

    let mut shutdown = std::pin::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let client_id = next_client_id;
                        next_client_id += 1;
                        info!("daemon: client {client_id} connected");
                        last_activity = Instant::now();

                        let handle = tokio::spawn(handle_client(client_id, stream, tx.clone(), tx.subscribe()));
                        clients.insert(client_id, handle);
                    }
                    Err(e) => error!("daemon: failed to accept client connection: {e}"),
                }
            }

            _ = idle_check.tick() => {
                clients.retain(|client_id, handle| {
                    if handle.is_finished() {
                        info!("daemon: client {client_id} disconnected");
                        false
                    } else {
                        true
                    }
                });

                if !clients.is_empty() {
                    last_activity = Instant::now();
                } else if last_activity.elapsed() >= idle_timeout {
                    info!(
                        "daemon: no clients for {:.1}s, shutting down",
                        last_activity.elapsed().as_secs_f64()
                    );
                    break;
                }
            }

            _ = &mut shutdown => break,
        }
    }

    for (client_id, handle) in clients {
        debug!("daemon: terminating client {client_id}");
        handle.abort();
    }
    Ok(())
}

/// Relay lines between one client and the broadcast channel
async fn handle_client(
    client_id: usize,
    mut stream: UnixStream,
    tx: broadcast::Sender<String>,
    mut rx: broadcast::Receiver<String>,
) {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut identity = format!("client-{client_id}");

    loop {
        tokio::select! {
            result = reader.read_line(&mut line) => {
                match result {
                    Ok(0) => {
                        info!("daemon: {identity} disconnected (EOF)");
                        break;
                    }
                    Ok(_) => {
                        let message = line.trim();
                        if let Some(name) = message.strip_prefix("#identify:") {
                            info!("daemon: client {client_id} identifies as {name}");
                            identity = name.to_string();
                        } else if message.starts_with('#') {
                            debug!("daemon: ignoring unknown command from {identity}: {message}");
                        } else if !message.is_empty() {
                            debug!("daemon: {identity} sent: {message}");
                            if let Err(e) = tx.send(message.to_string()) {
                                error!("daemon: failed to broadcast message from {identity}: {e}");
                            }
                        }
                        line.clear();
                    }
                    Err(e) => {
                        error!("daemon: error reading from {identity}: {e}");
                        break;
                    }
                }
            }

            result = rx.recv() => {
                match result {
                    Ok(message) => {
                        let message = format!("{message}\n");
                        if let Err(e) = writer.write_all(message.as_bytes()).await {
                            error!("daemon: failed to send message to {identity}: {e}");
                            break;
                        }
                        if let Err(e) = writer.flush().await {
                            error!("daemon: failed to flush message to {identity}: {e}");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("daemon: {identity} lagged, skipped {skipped} messages");
                    }
                }
            }
        }
    }

    debug!("daemon: handler for {identity} finished");
}

/// Socket path for a daemon prefix, or the explicit path when one is given
pub fn resolve_socket_path(socket: Option<PathBuf>, prefix: &str) -> PathBuf {
    socket.unwrap_or_else(|| crate::constants::bus_socket_path(prefix))
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::time::timeout;

    async fn start_daemon(dir: &tempfile::TempDir, idle_timeout_secs: u64) -> (PathBuf, tokio::task::JoinHandle<Result<()>>) {
        let socket_path = dir.path().join("bus.sock");
        let ready = Arc::new(Barrier::new(2));
        let handle = tokio::spawn({
            let socket_path = socket_path.clone();
            let ready = ready.clone();
            async move { run_daemon(&socket_path, idle_timeout_secs, Some(ready)).await }
        });
        ready.wait().await;
        (socket_path, handle)
    }

    #[tokio::test]
    async fn test_daemon_message_broadcasting() {
        let _ = tracing_subscriber::fmt::try_init();
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, daemon) = start_daemon(&dir, 30).await;

        let mut sender = UnixStream::connect(&socket_path).await.unwrap();
        let receiver = UnixStream::connect(&socket_path).await.unwrap();
        sender.write_all(b"#identify:sender\n").await.unwrap();

        // Let the daemon subscribe both clients before broadcasting.
        tokio::time::sleep(Duration::from_millis(50)).await;
        sender.write_all(b"{\"hello\": 1}\n").await.unwrap();

        let mut reader = BufReader::new(receiver);
        let mut line = String::new();
        timeout(Duration::from_secs(2), reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.trim(), "{\"hello\": 1}");

        daemon.abort();
    }

    #[tokio::test]
    async fn test_second_daemon_fails_to_claim_socket() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, daemon) = start_daemon(&dir, 30).await;

        let second = run_daemon(&socket_path, 30, None).await;
        assert!(second.is_err(), "second daemon should not claim a live socket");

        daemon.abort();
    }

    #[tokio::test]
    async fn test_stale_socket_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("bus.sock");
        drop(std::os::unix::net::UnixListener::bind(&socket_path).unwrap());
        assert!(socket_path.exists());

        let listener = claim_socket(&socket_path).await.unwrap();
        assert!(UnixStream::connect(&socket_path).await.is_ok());
        drop(listener);
    }

    #[tokio::test]
    async fn test_idle_daemon_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, daemon) = start_daemon(&dir, 0).await;

        let result = timeout(Duration::from_secs(5), daemon).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(!socket_path.exists());
    }
}
