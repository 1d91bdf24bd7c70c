//! Transports carry commands to actors and bring their replies back.
//!
//! A transport is shared: many proxies may hold the same `Arc<dyn Transport>`
//! and any owner may stop and restart it. Connectivity is always queried,
//! never cached.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::{ProxyError, Result};
use crate::types::{CommandReply, ReplyEvent};

pub mod bus;
pub mod local;

pub use bus::BusTransport;
pub use local::{LocalBus, LocalTransport};

/// Receives every reply of a command, intermediate and final.
pub type ReplyCallback = Arc<dyn Fn(&ReplyEvent) + Send + Sync>;

/// Resolves to the final reply of a command
pub type ReplyFuture = BoxFuture<'static, Result<CommandReply>>;

/// One command ready to be sent
#[derive(Clone)]
pub struct CommandRequest {
    pub actor: String,
    pub command: String,

    /// Already encoded argument tokens
    pub args: Vec<String>,

    pub callback: Option<ReplyCallback>,

    /// `None` waits forever
    pub time_limit: Option<Duration>,
}

impl CommandRequest {
    pub fn new(actor: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            command: command.into(),
            args: Vec::new(),
            callback: None,
            time_limit: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_callback(mut self, callback: Option<ReplyCallback>) -> Self {
        self.callback = callback;
        self
    }

    pub fn with_time_limit(mut self, time_limit: Option<Duration>) -> Self {
        self.time_limit = time_limit;
        self
    }

    /// Command name followed by its arguments, space-joined
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub(crate) fn notify(&self, event: &ReplyEvent) {
        if let Some(callback) = &self.callback {
            callback(event);
        }
    }
}

impl fmt::Debug for CommandRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRequest")
            .field("actor", &self.actor)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("callback", &self.callback.is_some())
            .field("time_limit", &self.time_limit)
            .finish()
    }
}

/// Connection to the actors
#[async_trait]
pub trait Transport: Send + Sync {
    /// Name this connection uses as sender on the bus
    fn name(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Connect; no-op when already connected.
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Send a command. The returned future resolves with the final reply;
    /// intermediate replies reach `request.callback` before that.
    async fn send_command(&self, request: CommandRequest) -> Result<ReplyFuture>;
}

/// Bound `reply` by the request's time limit, if any.
pub(crate) fn with_time_limit<F>(request: &CommandRequest, reply: F) -> ReplyFuture
where
    F: Future<Output = Result<CommandReply>> + Send + 'static,
{
    let Some(limit) = request.time_limit else {
        return Box::pin(reply);
    };
    let actor = request.actor.clone();
    let command = request.command.clone();
    Box::pin(async move {
        match tokio::time::timeout(limit, reply).await {
            Ok(reply) => reply,
            Err(_) => Err(ProxyError::Timeout {
                actor,
                command,
                limit,
            }),
        }
    })
}
