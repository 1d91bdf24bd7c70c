//! Concurrent invocation of several commands
//!
//! [`invoke`] drives a set of [`PendingCommand`]s to completion together and
//! returns their outcomes in submission order, each labelled with the actor it
//! was sent to. A failed command never cancels its siblings.

use std::fmt;
use std::future::Future;
use std::ops::Index;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::{BoxFuture, join_all};
use tracing::debug;

use crate::constants::LOCAL_ACTOR;
use crate::error::{ProxyError, Result};
use crate::flatten::flatten;
use crate::reply::Reply;
use crate::types::Payload;
use crate::unpack::{UnpackOptions, Unpacked, unpack, unpack_with};

/// A command that has been (or will be) sent and whose reply is awaited.
#[must_use = "a pending command does nothing unless awaited or invoked"]
pub struct PendingCommand {
    actor: String,
    future: BoxFuture<'static, Result<Reply>>,
}

impl PendingCommand {
    pub fn new(
        actor: impl Into<String>,
        future: impl Future<Output = Result<Reply>> + Send + 'static,
    ) -> Self {
        Self {
            actor: actor.into(),
            future: Box::pin(future),
        }
    }

    /// A pending operation not tied to any actor, tagged `local`.
    pub fn local(future: impl Future<Output = Result<Reply>> + Send + 'static) -> Self {
        Self::new(LOCAL_ACTOR, future)
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }
}

impl fmt::Debug for PendingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCommand")
            .field("actor", &self.actor)
            .finish_non_exhaustive()
    }
}

impl Future for PendingCommand {
    type Output = Result<Reply>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.as_mut().poll(cx)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvokeOptions {
    /// Return failures inside the batch instead of failing the whole call
    pub return_exceptions: bool,
}

impl InvokeOptions {
    pub fn return_exceptions(mut self, return_exceptions: bool) -> Self {
        self.return_exceptions = return_exceptions;
        self
    }
}

/// Run all commands concurrently and fail with [`ProxyError::PartialInvoke`]
/// if any of them failed.
pub async fn invoke<I>(commands: I) -> Result<InvocationBatch>
where
    I: IntoIterator<Item = PendingCommand>,
{
    invoke_with(commands, InvokeOptions::default()).await
}

pub async fn invoke_with<I>(commands: I, options: InvokeOptions) -> Result<InvocationBatch>
where
    I: IntoIterator<Item = PendingCommand>,
{
    let commands: Vec<PendingCommand> = commands.into_iter().collect();
    let actors: Vec<String> = commands.iter().map(|c| c.actor.clone()).collect();
    debug!("invoking {} commands on {actors:?}", commands.len());

    let outcomes = join_all(commands).await;

    let batch = InvocationBatch {
        entries: actors
            .into_iter()
            .zip(outcomes)
            .map(|(actor, outcome)| BatchEntry::from_outcome(actor, outcome))
            .collect(),
    };

    if batch.has_failures() && !options.return_exceptions {
        return Err(ProxyError::PartialInvoke(batch));
    }
    Ok(batch)
}

/// Outcome of one command of a batch
#[derive(Debug)]
pub struct BatchEntry {
    actor: String,
    payload: Payload,
    error: Option<ProxyError>,
}

impl BatchEntry {
    fn from_outcome(actor: String, outcome: Result<Reply>) -> Self {
        match outcome {
            Ok(reply) => Self {
                actor,
                payload: reply.into_payload(),
                error: None,
            },
            Err(error) => Self {
                actor,
                payload: error.to_descriptor().to_payload(),
                error: Some(error),
            },
        }
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Reply payload, or `{"error": <descriptor>}` for a failure
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> Option<&ProxyError> {
        self.error.as_ref()
    }

    pub fn into_result(self) -> Result<Reply> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(Reply::new(self.actor, self.payload)),
        }
    }
}

/// Ordered outcomes of [`invoke`], one per submitted command
#[derive(Debug, Default)]
pub struct InvocationBatch {
    entries: Vec<BatchEntry>,
}

impl InvocationBatch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BatchEntry> {
        self.entries.iter()
    }

    pub fn failures(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_ok()).count()
    }

    pub fn has_failures(&self) -> bool {
        self.entries.iter().any(|e| !e.is_ok())
    }

    pub fn actors(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(BatchEntry::actor)
    }

    pub fn payloads(&self) -> impl Iterator<Item = &Payload> {
        self.entries.iter().map(BatchEntry::payload)
    }

    /// Pairs of actor and payload, in submission order
    pub fn with_actors(&self) -> impl Iterator<Item = (&str, &Payload)> {
        self.entries.iter().map(|e| (e.actor(), e.payload()))
    }

    pub fn unpack(&self, keys: &[&str]) -> Unpacked {
        unpack(self, keys)
    }

    pub fn unpack_with(&self, keys: &[&str], options: UnpackOptions) -> Result<Unpacked> {
        unpack_with(self, keys, options)
    }

    /// Flattened payloads, in submission order
    pub fn flatten(&self) -> Vec<Payload> {
        self.payloads().map(flatten).collect()
    }
}

impl Index<usize> for InvocationBatch {
    type Output = BatchEntry;

    fn index(&self, index: usize) -> &BatchEntry {
        &self.entries[index]
    }
}

impl IntoIterator for InvocationBatch {
    type Item = BatchEntry;
    type IntoIter = std::vec::IntoIter<BatchEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a InvocationBatch {
    type Item = &'a BatchEntry;
    type IntoIter = std::slice::Iter<'a, BatchEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
