//! In-process transport
//!
//! Routes commands straight to [`ActorService`]s registered on a [`LocalBus`].
//! Services can come and go at run time, which makes actor availability easy
//! to model in tests and embedded setups.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::task::AbortHandle;
use tracing::debug;

use super::{CommandRequest, ReplyFuture, Transport, with_time_limit};
use crate::error::{ProxyError, Result};
use crate::service::{ActorService, ReplyWriter};
use crate::types::{CommandStatus, ReplyEvent};

/// Registry of in-process actors
#[derive(Clone, Default, Debug)]
pub struct LocalBus {
    services: Arc<Mutex<HashMap<String, Arc<ActorService>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `service` reachable under its name, replacing any previous one.
    pub fn register(&self, service: ActorService) {
        debug!("local bus: registering {}", service.name());
        self.lock().insert(service.name().to_string(), Arc::new(service));
    }

    pub fn unregister(&self, actor: &str) -> bool {
        debug!("local bus: unregistering {actor}");
        self.lock().remove(actor).is_some()
    }

    pub fn is_registered(&self, actor: &str) -> bool {
        self.lock().contains_key(actor)
    }

    /// A new connection to this bus, initially disconnected
    pub fn transport(&self, name: impl Into<String>) -> LocalTransport {
        LocalTransport {
            name: name.into(),
            bus: self.clone(),
            connected: AtomicBool::new(false),
        }
    }

    fn service(&self, actor: &str) -> Option<Arc<ActorService>> {
        self.lock().get(actor).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ActorService>>> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A connection to a [`LocalBus`]
#[derive(Debug)]
pub struct LocalTransport {
    name: String,
    bus: LocalBus,
    connected: AtomicBool,
}

impl LocalTransport {
    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn start(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send_command(&self, request: CommandRequest) -> Result<ReplyFuture> {
        if !self.is_connected() {
            return Err(ProxyError::NotConnected);
        }
        let service = self
            .bus
            .service(&request.actor)
            .ok_or_else(|| ProxyError::ActorNotReachable {
                actor: request.actor.clone(),
            })?;

        let command_line = request.command_line();
        debug!("{} -> {}: {command_line}", self.name, request.actor);

        let writer = {
            let request = request.clone();
            let actor = service.name().to_string();
            ReplyWriter::new(move |message| {
                request.notify(&ReplyEvent {
                    sender: actor.clone(),
                    status: CommandStatus::Running,
                    message,
                })
            })
        };

        let execution = tokio::spawn({
            let request = request.clone();
            async move {
                let reply = service.execute(&command_line, writer).await;
                request.notify(&ReplyEvent {
                    sender: reply.origin.clone(),
                    status: reply.status(),
                    message: reply.message.clone(),
                });
                reply
            }
        });

        let abort = AbortOnDrop(execution.abort_handle());
        Ok(with_time_limit(&request, async move {
            let _abort = abort;
            execution
                .await
                .map_err(|e| ProxyError::Transport(format!("command task failed: {e}")))
        }))
    }
}

/// Cancels the command task once nobody waits for its reply.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ReplyCallback;
    use std::time::Duration;

    #[tokio::test]
    async fn test_connectivity_and_reachability() {
        let bus = LocalBus::new();
        let transport = bus.transport("tester");

        assert!(matches!(
            transport.send_command(CommandRequest::new("proto", "ping")).await,
            Err(ProxyError::NotConnected)
        ));

        transport.start().await.unwrap();
        assert!(transport.is_connected());
        assert!(matches!(
            transport.send_command(CommandRequest::new("proto", "ping")).await,
            Err(ProxyError::ActorNotReachable { .. })
        ));

        bus.register(ActorService::new("proto"));
        let reply = transport
            .send_command(CommandRequest::new("proto", "ping"))
            .await
            .unwrap()
            .await
            .unwrap();
        assert_eq!(reply.message["text"], "Pong.");

        assert!(bus.unregister("proto"));
        transport.stop().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_final_reply_reaches_callback() {
        let bus = LocalBus::new();
        bus.register(ActorService::new("proto"));
        let transport = bus.transport("tester");
        transport.start().await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let callback: ReplyCallback = {
            let seen = seen.clone();
            Arc::new(move |event: &ReplyEvent| seen.lock().unwrap().push(event.clone()))
        };
        let request = CommandRequest::new("proto", "version")
            .with_callback(Some(callback))
            .with_time_limit(Some(Duration::from_secs(1)));

        transport.send_command(request).await.unwrap().await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, CommandStatus::Done);
        assert_eq!(seen[0].sender, "proto");
    }

    #[tokio::test]
    async fn test_timed_out_command_is_cancelled() {
        let (running_tx, running_rx) = tokio::sync::oneshot::channel::<()>();
        let running_tx = Arc::new(Mutex::new(Some(running_tx)));

        let bus = LocalBus::new();
        bus.register(ActorService::new("proto").command("hang", move |_ctx| {
            let running_tx = running_tx.lock().unwrap().take();
            async move {
                let _running_tx = running_tx;
                tokio::time::sleep(Duration::from_secs(60)).await;
                crate::service::CommandResult::Ok(crate::types::Payload::new())
            }
        }));
        let transport = bus.transport("tester");
        transport.start().await.unwrap();

        let request = CommandRequest::new("proto", "hang")
            .with_time_limit(Some(Duration::from_millis(20)));
        let reply = transport.send_command(request).await.unwrap().await;
        assert!(matches!(reply, Err(ProxyError::Timeout { .. })));

        // The handler future is dropped with its task, closing the channel.
        let closed = tokio::time::timeout(Duration::from_secs(1), running_rx).await;
        assert!(matches!(closed, Ok(Err(_))));
    }
}
