//! Errors raised by proxies, the invoker and the unpacker

use std::time::Duration;

use thiserror::Error;

use crate::constants::ERROR_MODULE;
use crate::invoke::InvocationBatch;
use crate::remote_error::{ErrorDescriptor, RemoteError};

/// Errors that can occur while talking to actors or shaping their replies
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Actor {actor} is not reachable")]
    ActorNotReachable { actor: String },

    #[error("Actor {actor} has no command `{command}`")]
    NoSuchCommand { actor: String, command: String },

    #[error("Command `{command}` to {actor} timed out after {limit:?}")]
    Timeout {
        actor: String,
        command: String,
        limit: Duration,
    },

    #[error("Transport connection not established")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Reply channel closed")]
    ChannelClosed,

    #[error("Discovery reply of {actor} has no command list")]
    InvalidDiscoveryReply { actor: String },

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("{} of {} invocations failed", .0.failures(), .0.len())]
    PartialInvoke(InvocationBatch),

    #[error("Unpack keys not found: {0:?}")]
    UnpackKeysNotFound(Vec<String>),

    #[error("Expected {expected} values, got {found}")]
    Arity { expected: usize, found: usize },

    #[error("Invalid command line: {0}")]
    InvalidCommandLine(String),

    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Transient conditions worth retrying: the actor or the bus may come up later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProxyError::ActorNotReachable { .. }
                | ProxyError::Timeout { .. }
                | ProxyError::NotConnected
                | ProxyError::Transport(_)
                | ProxyError::ChannelClosed
        )
    }

    /// Wire description of this error, as stored under `error` in batch entries.
    pub fn to_descriptor(&self) -> ErrorDescriptor {
        let kind = match self {
            ProxyError::Remote(remote) => return remote.to_descriptor(),
            ProxyError::ActorNotReachable { .. } => "ActorNotReachable",
            ProxyError::NoSuchCommand { .. } => "NoSuchCommand",
            ProxyError::Timeout { .. } => "Timeout",
            ProxyError::NotConnected => "NotConnected",
            ProxyError::Transport(_) => "Transport",
            ProxyError::ChannelClosed => "ChannelClosed",
            ProxyError::InvalidDiscoveryReply { .. } => "InvalidDiscoveryReply",
            ProxyError::PartialInvoke(_) => "PartialInvoke",
            ProxyError::UnpackKeysNotFound(_) => "UnpackKeysNotFound",
            ProxyError::Arity { .. } => "Arity",
            ProxyError::InvalidCommandLine(_) => "InvalidCommandLine",
            ProxyError::Serialization(_) => "Serialization",
        };
        ErrorDescriptor::new(kind, self.to_string(), ERROR_MODULE)
    }
}
