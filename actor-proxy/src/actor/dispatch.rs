//! Bus dispatch actor: message router for one bus connection
//!
//! Correlates replies with the commands that asked for them and runs the
//! commands addressed to actors served on this connection.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::Actor;
use crate::error::{ProxyError, Result};
use crate::service::{ActorService, ReplyWriter};
use crate::transport::ReplyCallback;
use crate::types::{
    BusMessage, BusMessageType, CommandPayload, CommandReply, CommandStatus, ReplyEvent,
    ReplyPayload,
};

/// Where to deliver the replies to one command
struct PendingReply {
    callback: Option<ReplyCallback>,
    reply_tx: oneshot::Sender<CommandReply>,
}

enum DispatchRequest {
    /// Send a message and, if `pending` is set, route its replies.
    Send {
        message: BusMessage,
        pending: Option<PendingReply>,
    },

    /// Answer commands addressed to `service` from now on.
    Serve { service: Arc<ActorService> },

    Withdraw { actor: String },
}

/// A [Tokio actor][] that owns the pending replies of one connection.
///
/// [Tokio actor]: https://ryhl.io/blog/actors-with-tokio/
struct DispatchActor {
    /// Actor terminates when this channel is closed.
    request_rx: mpsc::Receiver<DispatchRequest>,

    /// Incoming messages from the bus client
    client_rx: mpsc::Receiver<BusMessage>,

    /// Outgoing messages to the bus client
    client_tx: mpsc::Sender<BusMessage>,

    /// Identity when sending messages
    sender: String,

    /// Key is the `id` of the command whose replies we expect.
    ///
    /// A caller that gave up drops its receiver; such entries are pruned after
    /// every event.
    pending_replies: HashMap<String, PendingReply>,

    services: HashMap<String, Arc<ActorService>>,
}

impl Actor for DispatchActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    match request {
                        Some(DispatchRequest::Send { message, pending }) => {
                            if let Some(pending) = pending {
                                self.pending_replies.insert(message.id.clone(), pending);
                            }
                            if let Err(e) = self.client_tx.send(message).await {
                                error!("failed to send message to client: {e}");
                                break;
                            }
                        }
                        Some(DispatchRequest::Serve { service }) => {
                            info!("{} now serving actor {}", self.sender, service.name());
                            self.services.insert(service.name().to_string(), service);
                        }
                        Some(DispatchRequest::Withdraw { actor }) => {
                            self.services.remove(&actor);
                        }
                        None => {
                            info!("request channel closed, shutting down dispatch actor");
                            break;
                        }
                    }
                }

                message = self.client_rx.recv() => {
                    match message {
                        Some(message) => self.handle_incoming_message(message),
                        None => {
                            info!("client channel closed, shutting down dispatch actor");
                            break;
                        }
                    }
                }
            }

            self.pending_replies
                .retain(|_id, pending| !pending.reply_tx.is_closed());
        }
    }
}

impl DispatchActor {
    fn new(
        request_rx: mpsc::Receiver<DispatchRequest>,
        client_rx: mpsc::Receiver<BusMessage>,
        client_tx: mpsc::Sender<BusMessage>,
        sender: String,
    ) -> Self {
        Self {
            request_rx,
            client_rx,
            client_tx,
            sender,
            pending_replies: HashMap::new(),
            services: HashMap::new(),
        }
    }

    fn handle_incoming_message(&mut self, message: BusMessage) {
        match message.message_type {
            BusMessageType::Reply => self.handle_reply(message),
            BusMessageType::Command => self.handle_command(message),
        }
    }

    fn handle_reply(&mut self, message: BusMessage) {
        let Some(pending) = self.pending_replies.get(&message.id) else {
            return;
        };

        let payload = match ReplyPayload::deserialize(&message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("error parsing reply as a `ReplyPayload`: error={e:?}, payload={:?}", message.payload);
                return;
            }
        };
        debug!(
            "received `{:?}` reply to `{}` from {}",
            payload.status, message.id, payload.actor
        );

        if let Some(callback) = &pending.callback {
            callback(&ReplyEvent {
                sender: payload.actor.clone(),
                status: payload.status,
                message: payload.message.clone(),
            });
        }

        if payload.status.is_done() {
            if let Some(pending) = self.pending_replies.remove(&message.id) {
                let reply = CommandReply {
                    origin: payload.actor,
                    succeeded: !payload.status.did_fail(),
                    message: payload.message,
                };
                if pending.reply_tx.send(reply).is_err() {
                    // The caller may have timed out in the meantime.
                    debug!("could not forward reply to `{}`", message.id);
                }
            }
        }
    }

    fn handle_command(&mut self, message: BusMessage) {
        let command = match CommandPayload::deserialize(&message.payload) {
            Ok(command) => command,
            Err(e) => {
                warn!("malformed command {}: {e}", message.id);
                return;
            }
        };
        let Some(service) = self.services.get(&command.actor).cloned() else {
            return;
        };

        debug!("running `{}` for {} on {}", command.command_line, message.sender, command.actor);
        tokio::spawn(run_command(
            service,
            message.id,
            command.command_line,
            self.sender.clone(),
            self.client_tx.clone(),
        ));
    }
}

/// Execute one command for a served actor and publish its replies in order.
async fn run_command(
    service: Arc<ActorService>,
    id: String,
    command_line: String,
    sender: String,
    client_tx: mpsc::Sender<BusMessage>,
) {
    let actor = service.name().to_string();
    let (running_tx, mut running_rx) = mpsc::unbounded_channel();
    let writer = ReplyWriter::new(move |message| {
        let _ = running_tx.send(message);
    });

    let publish = |status: CommandStatus, message| {
        let payload = ReplyPayload {
            actor: actor.clone(),
            status,
            message,
        };
        BusMessage::new(id.clone(), sender.clone(), &payload)
    };

    let execute = service.execute(&command_line, writer);
    let forward = async {
        while let Some(message) = running_rx.recv().await {
            match publish(CommandStatus::Running, message) {
                Ok(reply) => {
                    if client_tx.send(reply).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("failed to serialize reply: {e}"),
            }
        }
    };
    let (reply, ()) = tokio::join!(execute, forward);

    match publish(reply.status(), reply.message) {
        Ok(message) => {
            if let Err(e) = client_tx.send(message).await {
                error!("failed to send reply to `{command_line}`: {e}");
            }
        }
        Err(e) => error!("failed to serialize reply: {e}"),
    }
}

/// Handle for communicating with the dispatch actor
#[derive(Clone)]
pub struct DispatchHandle {
    actor_tx: mpsc::Sender<DispatchRequest>,

    /// Identity when sending messages
    sender: String,
}

impl DispatchHandle {
    /// Spawn a dispatch actor on top of a bus client's channels.
    pub fn new(
        client_rx: mpsc::Receiver<BusMessage>,
        client_tx: mpsc::Sender<BusMessage>,
        sender: &str,
    ) -> Self {
        let (actor_tx, actor_rx) = mpsc::channel(32);
        DispatchActor::new(actor_rx, client_rx, client_tx, sender.to_string()).spawn();
        Self {
            actor_tx,
            sender: sender.to_string(),
        }
    }

    /// Spawn a dispatch actor talking to a mock client, for tests.
    ///
    /// `mock_fn` receives what the dispatch actor sends and answers on the
    /// second channel.
    pub fn spawn_with_mock<F, Fut>(sender: &str, mock_fn: F) -> Self
    where
        F: FnOnce(mpsc::Receiver<BusMessage>, mpsc::Sender<BusMessage>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (client_tx, client_rx) = mpsc::channel(32);
        let (mock_tx, mock_rx) = mpsc::channel(32);
        tokio::spawn(mock_fn(client_rx, mock_tx));
        Self::new(mock_rx, client_tx, sender)
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Publish a command; the receiver resolves with its final reply.
    pub async fn send_command(
        &self,
        actor: &str,
        command_line: String,
        callback: Option<ReplyCallback>,
    ) -> Result<oneshot::Receiver<CommandReply>> {
        let payload = CommandPayload {
            actor: actor.to_string(),
            command_line,
        };
        let message = BusMessage::new(fresh_message_id(), self.sender.clone(), &payload)?;
        let (reply_tx, reply_rx) = oneshot::channel();

        self.actor_tx
            .send(DispatchRequest::Send {
                message,
                pending: Some(PendingReply { callback, reply_tx }),
            })
            .await
            .map_err(|_| ProxyError::ChannelClosed)?;
        Ok(reply_rx)
    }

    /// Answer commands addressed to `service.name()` on this connection.
    pub async fn serve(&self, service: Arc<ActorService>) -> Result<()> {
        self.actor_tx
            .send(DispatchRequest::Serve { service })
            .await
            .map_err(|_| ProxyError::ChannelClosed)
    }

    pub async fn withdraw(&self, actor: &str) -> Result<()> {
        self.actor_tx
            .send(DispatchRequest::Withdraw {
                actor: actor.to_string(),
            })
            .await
            .map_err(|_| ProxyError::ChannelClosed)
    }
}

fn fresh_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Payload;
    use serde_json::json;
    use std::sync::Mutex;

    fn reply_to(command: &BusMessage, status: CommandStatus, message: serde_json::Value) -> BusMessage {
        let payload = ReplyPayload {
            actor: "proto".to_string(),
            status,
            message: message.as_object().cloned().unwrap_or_default(),
        };
        BusMessage::new(command.id.clone(), "proto-service".to_string(), &payload).unwrap()
    }

    #[tokio::test]
    async fn test_replies_reach_callback_then_resolve() {
        let dispatch = DispatchHandle::spawn_with_mock("tester", |mut rx, tx| async move {
            while let Some(command) = rx.recv().await {
                // Unrelated traffic is ignored.
                let stranger = BusMessage {
                    id: "other".to_string(),
                    ..reply_to(&command, CommandStatus::Done, json!({}))
                };
                tx.send(stranger).await.unwrap();
                tx.send(reply_to(&command, CommandStatus::Running, json!({"step": 1}))).await.unwrap();
                tx.send(reply_to(&command, CommandStatus::Done, json!({"text": "Pong."}))).await.unwrap();
            }
        });

        let events = Arc::new(Mutex::new(Vec::new()));
        let callback: ReplyCallback = {
            let events = events.clone();
            Arc::new(move |event: &ReplyEvent| events.lock().unwrap().push(event.status))
        };

        let reply = dispatch
            .send_command("proto", "ping".to_string(), Some(callback))
            .await
            .unwrap()
            .await
            .unwrap();

        assert!(reply.succeeded);
        assert_eq!(reply.origin, "proto");
        assert_eq!(reply.message["text"], "Pong.");
        assert_eq!(*events.lock().unwrap(), [CommandStatus::Running, CommandStatus::Done]);
    }

    #[tokio::test]
    async fn test_served_actor_answers_commands() {
        // Loop the dispatch actor's output back to itself, like the daemon does.
        let dispatch = DispatchHandle::spawn_with_mock("loopback", |mut rx, tx| async move {
            while let Some(message) = rx.recv().await {
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        async fn status(ctx: crate::service::CommandContext) -> crate::service::CommandResult {
            ctx.write(json!({"progress": 0.5}).as_object().cloned().unwrap());
            Ok(Payload::new())
        }
        dispatch
            .serve(Arc::new(ActorService::new("proto").command("status", status)))
            .await
            .unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let callback: ReplyCallback = {
            let events = events.clone();
            Arc::new(move |event: &ReplyEvent| events.lock().unwrap().push(event.clone()))
        };

        let reply = dispatch
            .send_command("proto", "status".to_string(), Some(callback))
            .await
            .unwrap()
            .await
            .unwrap();
        assert!(reply.succeeded);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, CommandStatus::Running);
        assert_eq!(events[0].message["progress"], 0.5);
        assert_eq!(events[1].status, CommandStatus::Done);

        let failed = dispatch
            .send_command("proto", "missing".to_string(), None)
            .await
            .unwrap()
            .await
            .unwrap();
        assert!(!failed.succeeded);
        assert_eq!(failed.error().unwrap()["exception_type"], "CommandNotFound");
    }
}
