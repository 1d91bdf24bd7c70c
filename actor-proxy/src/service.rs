//! Actor side of the protocol: a named set of command handlers.
//!
//! An [`ActorService`] decodes a command line, runs the matching handler and
//! produces the final [`CommandReply`]. Handlers may report progress through
//! their [`ReplyWriter`]; every write becomes a `running` reply.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::debug;

use crate::constants::{COMMANDS_COMMAND, COMMANDS_KEY, ERROR_MODULE};
use crate::encode::{CommandArgs, decode_arguments, split_command_line};
use crate::remote_error::{CommandNotFound, ErrorDescriptor};
use crate::types::{CommandReply, Payload};

/// What a handler returns: the final payload, or a description of the failure
pub type CommandResult = std::result::Result<Payload, ErrorDescriptor>;

type Handler = Arc<dyn Fn(CommandContext) -> BoxFuture<'static, CommandResult> + Send + Sync>;

/// Sink for intermediate replies
#[derive(Clone)]
pub struct ReplyWriter {
    write: Arc<dyn Fn(Payload) + Send + Sync>,
}

impl ReplyWriter {
    pub fn new(write: impl Fn(Payload) + Send + Sync + 'static) -> Self {
        Self {
            write: Arc::new(write),
        }
    }

    /// Discards every write
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    pub fn write(&self, message: Payload) {
        (self.write)(message)
    }
}

impl Default for ReplyWriter {
    fn default() -> Self {
        Self::discard()
    }
}

impl fmt::Debug for ReplyWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReplyWriter")
    }
}

/// Everything a handler gets to see about one invocation
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub actor: String,
    pub command: String,
    pub args: CommandArgs,
    writer: ReplyWriter,
}

impl CommandContext {
    /// Send an intermediate `running` reply.
    pub fn write(&self, message: Payload) {
        self.writer.write(message)
    }
}

/// A named actor and its commands
#[derive(Clone)]
pub struct ActorService {
    name: String,
    version: String,
    commands: BTreeMap<String, Handler>,
}

impl fmt::Debug for ActorService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorService")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("commands", &self.command_names())
            .finish()
    }
}

impl ActorService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            commands: BTreeMap::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Register a command. A handler named like a built-in replaces it.
    pub fn command<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CommandResult> + Send + 'static,
    {
        let boxed: Handler =
            Arc::new(move |ctx| -> BoxFuture<'static, CommandResult> { Box::pin(handler(ctx)) });
        self.commands.insert(name.into(), boxed);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Public command names, sorted, built-ins included
    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = ["ping", "version"]
            .into_iter()
            .map(str::to_string)
            .chain(self.commands.keys().cloned())
            .filter(|name| !name.starts_with("__"))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Run one command line to completion.
    pub async fn execute(&self, command_line: &str, writer: ReplyWriter) -> CommandReply {
        debug!("{} executing `{command_line}`", self.name);

        let tokens = match split_command_line(command_line) {
            Ok(tokens) => tokens,
            Err(e) => return self.fail(e.to_descriptor()),
        };
        let Some((command, args)) = tokens.split_first() else {
            return self.fail(self.not_found(""));
        };

        let ctx = CommandContext {
            actor: self.name.clone(),
            command: command.clone(),
            args: decode_arguments(args),
            writer,
        };

        let result = match self.commands.get(command.as_str()) {
            Some(handler) => handler(ctx).await,
            None => self.builtin(command),
        };

        match result {
            Ok(payload) => CommandReply::success(&self.name, payload),
            Err(descriptor) => self.fail(descriptor),
        }
    }

    fn builtin(&self, command: &str) -> CommandResult {
        let mut payload = Payload::new();
        match command {
            COMMANDS_COMMAND => payload.insert(COMMANDS_KEY.to_string(), json!(self.command_names())),
            "ping" => payload.insert("text".to_string(), json!("Pong.")),
            "version" => payload.insert("version".to_string(), json!(self.version)),
            _ => return Err(self.not_found(command)),
        };
        Ok(payload)
    }

    fn not_found(&self, command: &str) -> ErrorDescriptor {
        ErrorDescriptor::from_error(
            ERROR_MODULE,
            &CommandNotFound(format!("{} has no command `{command}`", self.name)),
        )
    }

    fn fail(&self, descriptor: ErrorDescriptor) -> CommandReply {
        debug!("{} failed: {descriptor:?}", self.name);
        CommandReply::failure(&self.name, descriptor.to_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::Mutex;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    async fn add(ctx: CommandContext) -> CommandResult {
        let sum: f64 = ctx.args.positional.iter().filter_map(Value::as_f64).sum();
        Ok(payload(json!({"sum": sum})))
    }

    async fn progress(ctx: CommandContext) -> CommandResult {
        for step in 0..3 {
            ctx.write(payload(json!({"step": step})));
        }
        Ok(Payload::new())
    }

    async fn broken(_ctx: CommandContext) -> CommandResult {
        Err(anyhow::anyhow!("disk full").into())
    }

    fn service() -> ActorService {
        ActorService::new("proto")
            .with_version("1.2.3")
            .command("add", add)
            .command("progress", progress)
            .command("broken", broken)
    }

    #[tokio::test]
    async fn test_builtins() {
        let service = service();

        let reply = service.execute("__commands", ReplyWriter::discard()).await;
        assert_eq!(
            reply.payload().unwrap(),
            &payload(json!({"help": ["add", "broken", "ping", "progress", "version"]}))
        );

        let reply = service.execute("ping", ReplyWriter::discard()).await;
        assert_eq!(reply.payload().unwrap()["text"], "Pong.");
        assert_eq!(reply.origin, "proto");

        let reply = service.execute("version", ReplyWriter::discard()).await;
        assert_eq!(reply.payload().unwrap()["version"], "1.2.3");
    }

    #[tokio::test]
    async fn test_arguments_are_decoded() {
        let reply = service().execute("add 1 2.5 '3'", ReplyWriter::discard()).await;
        assert_eq!(reply.payload().unwrap()["sum"], 6.5);
    }

    #[tokio::test]
    async fn test_intermediate_replies_go_to_writer() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let writer = ReplyWriter::new({
            let seen = seen.clone();
            move |message| seen.lock().unwrap().push(message)
        });

        let reply = service().execute("progress", writer).await;
        assert!(reply.succeeded);
        assert_eq!(seen.lock().unwrap().len(), 3);
        assert_eq!(seen.lock().unwrap()[2]["step"], 2);
    }

    #[tokio::test]
    async fn test_failures_carry_descriptors() {
        let reply = service().execute("broken", ReplyWriter::discard()).await;
        assert_eq!(
            reply.error().unwrap(),
            &json!({
                "exception_type": "ActorError",
                "exception_message": "disk full",
                "exception_module": "actor_proxy"
            })
        );

        let reply = service().execute("nope 1", ReplyWriter::discard()).await;
        assert_eq!(reply.error().unwrap()["exception_type"], "CommandNotFound");
        assert_eq!(reply.error().unwrap()["exception_message"], "proto has no command `nope`");

        let reply = service().execute("add 'open", ReplyWriter::discard()).await;
        assert_eq!(reply.error().unwrap()["exception_type"], "InvalidCommandLine");
    }
}
