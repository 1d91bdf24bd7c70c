//! Remote error descriptors and their reconstruction into local errors
//!
//! A failed command carries an `error` field shaped like
//! `{"exception_type": .., "exception_module": .., "exception_message": ..}`.
//! The [`ErrorRegistry`] turns that description back into a typed local error
//! when the `(module, type)` pair is registered, and into a generic
//! [`RemoteError`] otherwise. Decoding never fails.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::constants::{ERROR_KEY, ERROR_MODULE};
use crate::types::Payload;

/// Structural description of an error raised by an actor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    #[serde(rename = "exception_type")]
    pub kind: String,

    #[serde(rename = "exception_message")]
    pub message: String,

    #[serde(rename = "exception_module")]
    pub source_module: String,
}

impl ErrorDescriptor {
    pub fn new(
        kind: impl Into<String>,
        message: impl Into<String>,
        source_module: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            source_module: source_module.into(),
        }
    }

    /// Describe a local error. The kind is the error's type name without its path.
    pub fn from_error<E: StdError + 'static>(source_module: &str, error: &E) -> Self {
        Self::new(short_type_name::<E>(), error.to_string(), source_module)
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "exception_type": self.kind,
            "exception_message": self.message,
            "exception_module": self.source_module,
        })
    }

    /// The failure payload carrying this descriptor under `error`
    pub fn to_payload(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert(ERROR_KEY.to_string(), self.to_value());
        payload
    }
}

impl From<anyhow::Error> for ErrorDescriptor {
    fn from(error: anyhow::Error) -> Self {
        Self::new(
            short_type_name::<ActorError>(),
            format!("{error:#}"),
            ERROR_MODULE,
        )
    }
}

/// Generic error raised by an actor command
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ActorError(pub String);

impl From<String> for ActorError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// Raised by an actor asked for a command it does not have
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct CommandNotFound(pub String);

impl From<String> for CommandNotFound {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// An error reported by a remote actor, decoded locally
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The error type is registered locally; `error` is the reconstructed value.
    #[error("{error}")]
    Known {
        kind: String,
        module: String,
        error: Box<dyn StdError + Send + Sync>,
    },

    #[error("Unknown exception type {kind}-{message}")]
    UnknownType {
        kind: String,
        module: String,
        message: String,
    },

    #[error("Unknown module type {module}-{kind}:{message}")]
    UnknownModule {
        kind: String,
        module: String,
        message: String,
    },

    /// The `error` field was not a descriptor
    #[error("{0}")]
    Message(String),
}

impl RemoteError {
    pub fn kind(&self) -> Option<&str> {
        match self {
            RemoteError::Known { kind, .. }
            | RemoteError::UnknownType { kind, .. }
            | RemoteError::UnknownModule { kind, .. } => Some(kind),
            RemoteError::Message(_) => None,
        }
    }

    /// Borrow the reconstructed error as a concrete type.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            RemoteError::Known { error, .. } => error.downcast_ref::<E>(),
            _ => None,
        }
    }

    pub fn is<E: StdError + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }

    pub fn to_descriptor(&self) -> ErrorDescriptor {
        match self {
            RemoteError::Known {
                kind,
                module,
                error,
            } => ErrorDescriptor::new(kind.clone(), error.to_string(), module.clone()),
            RemoteError::UnknownType {
                kind,
                module,
                message,
            }
            | RemoteError::UnknownModule {
                kind,
                module,
                message,
            } => ErrorDescriptor::new(kind.clone(), message.clone(), module.clone()),
            RemoteError::Message(message) => {
                ErrorDescriptor::new(short_type_name::<ActorError>(), message.clone(), ERROR_MODULE)
            }
        }
    }
}

/// Builds a local error from the remote message
pub type ErrorConstructor = Arc<dyn Fn(String) -> Box<dyn StdError + Send + Sync> + Send + Sync>;

/// Known remote error types, keyed by module then type name.
#[derive(Clone)]
pub struct ErrorRegistry {
    modules: HashMap<String, HashMap<String, ErrorConstructor>>,
}

impl Default for ErrorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register_type::<ActorError>(ERROR_MODULE)
            .register_type::<CommandNotFound>(ERROR_MODULE);
        registry
    }
}

impl fmt::Debug for ErrorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (module, kinds) in &self.modules {
            let mut kinds: Vec<_> = kinds.keys().collect();
            kinds.sort();
            map.entry(module, &kinds);
        }
        map.finish()
    }
}

impl ErrorRegistry {
    /// A registry without the crate's own error types
    pub fn empty() -> Self {
        Self {
            modules: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        module: &str,
        kind: &str,
        constructor: impl Fn(String) -> Box<dyn StdError + Send + Sync> + Send + Sync + 'static,
    ) -> &mut Self {
        self.modules
            .entry(module.to_string())
            .or_default()
            .insert(kind.to_string(), Arc::new(constructor));
        self
    }

    /// Register an error type under its short type name.
    pub fn register_type<E>(&mut self, module: &str) -> &mut Self
    where
        E: StdError + From<String> + Send + Sync + 'static,
    {
        self.register(module, short_type_name::<E>(), |message| {
            Box::new(E::from(message))
        })
    }

    /// Decode the raw `error` field of a failed reply.
    pub fn decode(&self, error: &Value) -> RemoteError {
        match error {
            Value::Object(_) => match ErrorDescriptor::deserialize(error) {
                Ok(descriptor) => self.resolve(&descriptor),
                Err(_) => RemoteError::Message(error.to_string()),
            },
            Value::String(message) => RemoteError::Message(message.clone()),
            Value::Null => RemoteError::Message("Command failed".to_string()),
            other => RemoteError::Message(other.to_string()),
        }
    }

    pub fn resolve(&self, descriptor: &ErrorDescriptor) -> RemoteError {
        let Some(kinds) = self.modules.get(&descriptor.source_module) else {
            return RemoteError::UnknownModule {
                kind: descriptor.kind.clone(),
                module: descriptor.source_module.clone(),
                message: descriptor.message.clone(),
            };
        };

        match kinds.get(&descriptor.kind) {
            Some(constructor) => RemoteError::Known {
                kind: descriptor.kind.clone(),
                module: descriptor.source_module.clone(),
                error: constructor(descriptor.message.clone()),
            },
            None => RemoteError::UnknownType {
                kind: descriptor.kind.clone(),
                module: descriptor.source_module.clone(),
                message: descriptor.message.clone(),
            },
        }
    }
}

/// `actor_proxy::remote_error::ActorError` -> `ActorError`
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
