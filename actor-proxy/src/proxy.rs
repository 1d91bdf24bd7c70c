//! Actor proxies
//!
//! A [`Proxy`] stands for one remote actor. Its command table is discovered
//! through the reserved `__commands` command. Until discovery succeeds every
//! call goes straight to the transport, so an actor that is not up yet is not
//! an error at start time.
//!
//! Discovery moves through `Undiscovered -> Discovering -> Ready`. A retryable
//! failure in [`Proxy::start`] hands over to one background task that retries
//! a bounded number of times with a fixed delay. [`Proxy::stop`] cancels that
//! task and waits for it.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants::{
    COMMANDS_COMMAND, COMMANDS_KEY, DEFAULT_DISCOVERY_ATTEMPTS, DEFAULT_DISCOVERY_DELAY_MS,
    DEFAULT_DISCOVERY_TIME_LIMIT_MS, DEFAULT_TIME_LIMIT_SECS,
};
use crate::encode::CommandArgs;
use crate::error::{ProxyError, Result};
use crate::invoke::PendingCommand;
use crate::remote_error::ErrorRegistry;
use crate::reply::Reply;
use crate::transport::{CommandRequest, ReplyCallback, Transport};
use crate::types::{CommandReply, ReplyEvent};

/// Retry budget of background discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Background attempts after the first failed one
    pub attempts: u32,

    /// Pause before every background attempt
    pub delay: Duration,

    /// Time limit of one `__commands` call
    pub time_limit: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_DISCOVERY_ATTEMPTS,
            delay: Duration::from_millis(DEFAULT_DISCOVERY_DELAY_MS),
            time_limit: Duration::from_millis(DEFAULT_DISCOVERY_TIME_LIMIT_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// No command table; calls are dispatched optimistically
    Undiscovered,

    /// A background discovery task is running
    Discovering,

    Ready,
}

/// Per-call settings
#[derive(Clone, Default)]
pub struct CallOptions {
    /// Receives intermediate and final replies
    pub callback: Option<ReplyCallback>,

    /// Overrides the proxy's time limit
    pub time_limit: Option<Duration>,
}

impl CallOptions {
    pub fn callback(mut self, callback: impl Fn(&ReplyEvent) + Send + Sync + 'static) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn time_limit(mut self, time_limit: Duration) -> Self {
        self.time_limit = Some(time_limit);
        self
    }
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("callback", &self.callback.is_some())
            .field("time_limit", &self.time_limit)
            .finish()
    }
}

struct DiscoveryTask {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct ProxyState {
    commands: Option<BTreeSet<String>>,
    discovery_task: Option<DiscoveryTask>,

    /// Bumped for every spawned task so a stale task cannot clear a newer one
    generation: u64,
}

struct ProxyInner {
    actor: String,
    transport: Arc<dyn Transport>,
    errors: Arc<ErrorRegistry>,
    discovery: DiscoveryConfig,

    /// `None` waits forever
    time_limit: Option<Duration>,

    state: Mutex<ProxyState>,
}

/// Local stand-in for one remote actor. Cheap to clone.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("actor", &self.inner.actor)
            .field("transport", &self.inner.transport.name())
            .field("state", &self.state())
            .finish()
    }
}

pub struct ProxyBuilder {
    actor: String,
    transport: Arc<dyn Transport>,
    errors: Arc<ErrorRegistry>,
    discovery: DiscoveryConfig,
    time_limit: Option<Duration>,
}

impl ProxyBuilder {
    /// Registry used to rebuild remote errors
    pub fn errors(mut self, errors: Arc<ErrorRegistry>) -> Self {
        self.errors = errors;
        self
    }

    pub fn discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    /// Default time limit of every call; `None` waits forever.
    pub fn time_limit(mut self, time_limit: Option<Duration>) -> Self {
        self.time_limit = time_limit;
        self
    }

    pub fn build(self) -> Proxy {
        Proxy {
            inner: Arc::new(ProxyInner {
                actor: self.actor,
                transport: self.transport,
                errors: self.errors,
                discovery: self.discovery,
                time_limit: self.time_limit,
                state: Mutex::new(ProxyState::default()),
            }),
        }
    }
}

impl Proxy {
    pub fn new(actor: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self::builder(actor, transport).build()
    }

    pub fn builder(actor: impl Into<String>, transport: Arc<dyn Transport>) -> ProxyBuilder {
        ProxyBuilder {
            actor: actor.into(),
            transport,
            errors: Arc::new(ErrorRegistry::default()),
            discovery: DiscoveryConfig::default(),
            time_limit: Some(Duration::from_secs(DEFAULT_TIME_LIMIT_SECS)),
        }
    }

    pub fn actor(&self) -> &str {
        &self.inner.actor
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Whether the shared transport is connected right now
    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    pub fn state(&self) -> DiscoveryState {
        let state = self.inner.lock();
        if state.discovery_task.is_some() {
            DiscoveryState::Discovering
        } else if state.commands.is_some() {
            DiscoveryState::Ready
        } else {
            DiscoveryState::Undiscovered
        }
    }

    pub fn has_discovery_task(&self) -> bool {
        self.inner.lock().discovery_task.is_some()
    }

    #[cfg(test)]
    fn discovery_generation(&self) -> Option<u64> {
        self.inner
            .lock()
            .discovery_task
            .as_ref()
            .map(|task| task.generation)
    }

    /// Discovered command names, sorted
    pub fn commands(&self) -> Option<Vec<String>> {
        self.inner
            .lock()
            .commands
            .as_ref()
            .map(|commands| commands.iter().cloned().collect())
    }

    /// Connect the transport and discover the actor's commands.
    ///
    /// Never fails: a retryable failure starts background discovery, any other
    /// failure leaves the proxy undiscovered.
    pub async fn start(&self) -> DiscoveryState {
        match self.inner.discover_once().await {
            Ok(commands) => self.inner.install(commands),
            Err(e) if e.is_retryable() => {
                debug!("discovery of {} failed, retrying in background: {e}", self.inner.actor);
                self.inner.schedule_discovery();
            }
            Err(e) => warn!("discovery of {} failed: {e}", self.inner.actor),
        }
        self.state()
    }

    /// Cancel background discovery and wait until it has unwound.
    ///
    /// The transport is shared and stays up.
    pub async fn stop(&self) {
        let task = self.inner.lock().discovery_task.take();
        if let Some(task) = task {
            debug!("cancelling discovery of {}", self.inner.actor);
            task.handle.abort();
            if let Err(e) = task.handle.await {
                if !e.is_cancelled() {
                    warn!("discovery task of {} failed: {e}", self.inner.actor);
                }
            }
        }
    }

    /// A bound command.
    ///
    /// Fails with [`ProxyError::NoSuchCommand`] only when discovery has
    /// completed, no discovery is pending and `name` is not in the table.
    pub fn command(&self, name: &str) -> Result<Command> {
        let state = self.inner.lock();
        if let Some(commands) = &state.commands {
            if !commands.contains(name) && state.discovery_task.is_none() {
                return Err(ProxyError::NoSuchCommand {
                    actor: self.inner.actor.clone(),
                    command: name.to_string(),
                });
            }
        }
        Ok(Command {
            proxy: self.clone(),
            name: name.to_string(),
        })
    }

    /// Send `name` and wait for its final reply.
    pub async fn call_command(&self, name: &str, args: CommandArgs) -> Result<Reply> {
        self.call_command_with(name, args, CallOptions::default())
            .await
    }

    pub async fn call_command_with(
        &self,
        name: &str,
        args: CommandArgs,
        options: CallOptions,
    ) -> Result<Reply> {
        self.call_nowait(name, args, options).await?.await
    }

    /// Send `name` now; the returned handle resolves with the reply.
    pub async fn call_nowait(
        &self,
        name: &str,
        args: CommandArgs,
        options: CallOptions,
    ) -> Result<PendingCommand> {
        let request = self.inner.request(name, &args, options);
        let reply = self.inner.transport.send_command(request).await?;
        let errors = self.inner.errors.clone();
        Ok(PendingCommand::new(self.inner.actor.clone(), async move {
            into_reply(&errors, reply.await?)
        }))
    }

    /// Fire and forget: the reply and any error are dropped.
    pub fn call_nosync(&self, name: &str, args: CommandArgs) {
        let proxy = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = proxy.call_command(&name, args).await {
                debug!("ignored failure of {} {name}: {e}", proxy.actor());
            }
        });
    }

    /// A lazy call, sent only when the handle is first polled. Feed these to
    /// [`invoke`](crate::invoke::invoke).
    pub fn pending(&self, name: &str, args: CommandArgs) -> PendingCommand {
        self.pending_with(name, args, CallOptions::default())
    }

    pub fn pending_with(&self, name: &str, args: CommandArgs, options: CallOptions) -> PendingCommand {
        let proxy = self.clone();
        let name = name.to_string();
        PendingCommand::new(self.inner.actor.clone(), async move {
            proxy.call_command_with(&name, args, options).await
        })
    }
}

impl ProxyInner {
    fn lock(&self) -> MutexGuard<'_, ProxyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request(&self, name: &str, args: &CommandArgs, options: CallOptions) -> CommandRequest {
        CommandRequest::new(&self.actor, name)
            .with_args(args.encode())
            .with_callback(options.callback)
            .with_time_limit(options.time_limit.or(self.time_limit))
    }

    /// One discovery round trip
    async fn discover_once(&self) -> Result<BTreeSet<String>> {
        if !self.transport.is_connected() {
            // The transport keeps connecting on its own; don't hold discovery up.
            tokio::time::timeout(self.discovery.time_limit, self.transport.start())
                .await
                .map_err(|_| ProxyError::NotConnected)??;
        }

        let request = CommandRequest::new(&self.actor, COMMANDS_COMMAND)
            .with_time_limit(Some(self.discovery.time_limit));
        let reply = self.transport.send_command(request).await?.await?;
        let reply = into_reply(&self.errors, reply)?;

        let invalid = || ProxyError::InvalidDiscoveryReply {
            actor: self.actor.clone(),
        };
        let names = reply.get(COMMANDS_KEY).and_then(Value::as_array).ok_or_else(invalid)?;
        names
            .iter()
            .map(|name| name.as_str().map(str::to_string).ok_or_else(invalid))
            .collect()
    }

    fn install(&self, commands: BTreeSet<String>) {
        info!("{}: discovered {} commands", self.actor, commands.len());
        self.lock().commands = Some(commands);
    }

    /// Start background discovery unless it is already running.
    fn schedule_discovery(self: &Arc<Self>) {
        let mut state = self.lock();
        if state
            .discovery_task
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
        {
            return;
        }

        state.generation += 1;
        let generation = state.generation;
        let handle = tokio::spawn(rediscover(Arc::downgrade(self), generation));
        state.discovery_task = Some(DiscoveryTask { generation, handle });
    }

    fn clear_task(&self, generation: u64) {
        let mut state = self.lock();
        if state
            .discovery_task
            .as_ref()
            .is_some_and(|task| task.generation == generation)
        {
            state.discovery_task = None;
        }
    }
}

/// Background discovery loop. Holds only a weak reference so a dropped proxy
/// ends it at the next attempt.
async fn rediscover(inner: Weak<ProxyInner>, generation: u64) {
    let Some((actor, discovery)) = inner.upgrade().map(|i| (i.actor.clone(), i.discovery)) else {
        return;
    };

    for attempt in 1..=discovery.attempts {
        tokio::time::sleep(discovery.delay).await;
        let Some(proxy) = inner.upgrade() else {
            return;
        };

        match proxy.discover_once().await {
            Ok(commands) => {
                proxy.install(commands);
                proxy.clear_task(generation);
                return;
            }
            Err(e) if e.is_retryable() => {
                debug!("discovery of {actor}, attempt {attempt}/{}: {e}", discovery.attempts);
            }
            Err(e) => {
                warn!("discovery of {actor} failed: {e}");
                proxy.clear_task(generation);
                return;
            }
        }
    }

    warn!("giving up discovery of {actor} after {} attempts", discovery.attempts);
    if let Some(proxy) = inner.upgrade() {
        proxy.clear_task(generation);
    }
}

/// Turn a final reply into a [`Reply`] or the error it carries.
fn into_reply(errors: &ErrorRegistry, reply: CommandReply) -> Result<Reply> {
    if reply.succeeded {
        return Ok(Reply::from(reply));
    }
    let error = reply.error().cloned().unwrap_or(Value::Null);
    Err(ProxyError::Remote(errors.decode(&error)))
}

/// A command bound to its proxy
#[derive(Debug, Clone)]
pub struct Command {
    proxy: Proxy,
    name: String,
}

impl Command {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, args: CommandArgs) -> Result<Reply> {
        self.proxy.call_command(&self.name, args).await
    }

    pub async fn call_with(&self, args: CommandArgs, options: CallOptions) -> Result<Reply> {
        self.proxy.call_command_with(&self.name, args, options).await
    }

    pub async fn nowait(&self, args: CommandArgs, options: CallOptions) -> Result<PendingCommand> {
        self.proxy.call_nowait(&self.name, args, options).await
    }

    pub fn nosync(&self, args: CommandArgs) {
        self.proxy.call_nosync(&self.name, args)
    }

    pub fn pending(&self, args: CommandArgs) -> PendingCommand {
        self.proxy.pending(&self.name, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote_error::{CommandNotFound, ErrorDescriptor};
    use crate::service::{ActorService, CommandContext, CommandResult};
    use crate::transport::LocalBus;
    use crate::types::{CommandStatus, Payload};
    use serde_json::json;
    use thiserror::Error;

    #[derive(Debug, Error, PartialEq)]
    #[error("{0}")]
    struct ProtoActorApiError(String);

    impl From<String> for ProtoActorApiError {
        fn from(message: String) -> Self {
            Self(message)
        }
    }

    async fn goto(ctx: CommandContext) -> CommandResult {
        let ra = ctx.args.positional.first().cloned().unwrap_or(json!(0.0));
        let dec = ctx.args.positional.get(1).cloned().unwrap_or(json!(0.0));
        ctx.write(json!({"moving": true}).as_object().cloned().unwrap_or_default());
        Ok(json!({"ra_h": ra, "deg_d": dec}).as_object().cloned().unwrap_or_default())
    }

    async fn err_raise(_ctx: CommandContext) -> CommandResult {
        Err(ErrorDescriptor::from_error("proto.errors", &ProtoActorApiError("boom ...".to_string())))
    }

    fn proto() -> ActorService {
        ActorService::new("proto")
            .command("goto", goto)
            .command("errRaise", err_raise)
    }

    fn fast_discovery(attempts: u32) -> DiscoveryConfig {
        DiscoveryConfig {
            attempts,
            delay: Duration::from_millis(20),
            time_limit: Duration::from_millis(200),
        }
    }

    async fn connected_bus() -> (LocalBus, Arc<dyn Transport>) {
        let bus = LocalBus::new();
        let transport: Arc<dyn Transport> = Arc::new(bus.transport("tester"));
        transport.start().await.unwrap();
        (bus, transport)
    }

    #[tokio::test]
    async fn test_start_discovers_commands() {
        let (bus, transport) = connected_bus().await;
        bus.register(proto());
        let proxy = Proxy::new("proto", transport);

        assert_eq!(proxy.state(), DiscoveryState::Undiscovered);
        assert_eq!(proxy.start().await, DiscoveryState::Ready);
        assert_eq!(
            proxy.commands().unwrap(),
            ["errRaise", "goto", "ping", "version"]
        );
        assert!(!proxy.has_discovery_task());
        assert!(proxy.is_connected());
    }

    #[tokio::test]
    async fn test_call_command_encodes_arguments() {
        let (bus, transport) = connected_bus().await;
        bus.register(proto());
        let proxy = Proxy::new("proto", transport);
        proxy.start().await;

        let events = Arc::new(Mutex::new(Vec::new()));
        let options = CallOptions::default().callback({
            let events = events.clone();
            move |event: &ReplyEvent| events.lock().unwrap().push(event.status)
        });

        let reply = proxy
            .call_command_with("goto", CommandArgs::new().arg(1.5).arg(-20), options)
            .await
            .unwrap();
        assert_eq!(reply.actor(), "proto");
        let [ra, dec] = reply.unpack(&["ra_h", "deg_d"]).into_array::<2>().unwrap();
        assert_eq!((ra, dec), (json!(1.5), json!(-20)));
        assert_eq!(*events.lock().unwrap(), [CommandStatus::Running, CommandStatus::Done]);
    }

    #[tokio::test]
    async fn test_remote_errors_are_rebuilt() {
        let (bus, transport) = connected_bus().await;
        bus.register(proto());

        let mut errors = ErrorRegistry::default();
        errors.register_type::<ProtoActorApiError>("proto.errors");
        let proxy = Proxy::builder("proto", transport.clone())
            .errors(Arc::new(errors))
            .build();

        let error = proxy.call_command("errRaise", CommandArgs::new()).await.unwrap_err();
        let ProxyError::Remote(remote) = &error else {
            panic!("expected a remote error, got {error:?}");
        };
        assert_eq!(
            remote.downcast_ref::<ProtoActorApiError>(),
            Some(&ProtoActorApiError("boom ...".to_string()))
        );

        // Without the registration the error still decodes, generically.
        let plain = Proxy::new("proto", transport);
        let error = plain.call_command("errRaise", CommandArgs::new()).await.unwrap_err();
        assert_eq!(error.to_string(), "Unknown module type proto.errors-ProtoActorApiError:boom ...");

        let error = plain.call_command("nope", CommandArgs::new()).await.unwrap_err();
        let ProxyError::Remote(remote) = &error else {
            panic!("expected a remote error, got {error:?}");
        };
        assert!(remote.is::<CommandNotFound>());
    }

    #[tokio::test]
    async fn test_command_lookup_after_discovery() {
        let (bus, transport) = connected_bus().await;
        bus.register(proto());
        let proxy = Proxy::new("proto", transport);

        // Optimistic before discovery.
        assert!(proxy.command("anything").is_ok());

        proxy.start().await;
        assert!(matches!(
            proxy.command("anything"),
            Err(ProxyError::NoSuchCommand { .. })
        ));

        let ping = proxy.command("ping").unwrap();
        assert_eq!(ping.call(CommandArgs::new()).await.unwrap()["text"], "Pong.");

        let pending = ping.nowait(CommandArgs::new(), CallOptions::default()).await.unwrap();
        assert_eq!(pending.actor(), "proto");
        assert!(pending.await.is_ok());
    }

    #[tokio::test]
    async fn test_discovery_retries_until_actor_appears() {
        let (bus, transport) = connected_bus().await;
        let proxy = Proxy::builder("proto", transport)
            .discovery(fast_discovery(50))
            .build();

        assert_eq!(proxy.start().await, DiscoveryState::Discovering);
        assert!(proxy.has_discovery_task());
        assert!(proxy.command("not-yet-known").is_ok());

        // A second start must not spawn a second loop.
        let generation = proxy.discovery_generation();
        assert!(generation.is_some());
        assert_eq!(proxy.start().await, DiscoveryState::Discovering);
        assert_eq!(proxy.discovery_generation(), generation);

        bus.register(proto());
        tokio::time::timeout(Duration::from_secs(5), async {
            while proxy.has_discovery_task() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(proxy.state(), DiscoveryState::Ready);
        assert!(proxy.commands().unwrap().contains(&"goto".to_string()));
    }

    #[tokio::test]
    async fn test_discovery_gives_up_after_budget() {
        let (_bus, transport) = connected_bus().await;
        let proxy = Proxy::builder("proto", transport)
            .discovery(fast_discovery(3))
            .build();

        assert_eq!(proxy.start().await, DiscoveryState::Discovering);
        tokio::time::timeout(Duration::from_secs(5), async {
            while proxy.has_discovery_task() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(proxy.state(), DiscoveryState::Undiscovered);
        assert!(proxy.commands().is_none());
    }

    #[tokio::test]
    async fn test_stop_cancels_discovery() {
        let (_bus, transport) = connected_bus().await;
        let proxy = Proxy::builder("proto", transport.clone())
            .discovery(DiscoveryConfig {
                delay: Duration::from_secs(60),
                ..fast_discovery(5)
            })
            .build();

        proxy.start().await;
        assert!(proxy.has_discovery_task());

        proxy.stop().await;
        assert!(!proxy.has_discovery_task());
        assert_eq!(proxy.state(), DiscoveryState::Undiscovered);
        assert!(transport.is_connected(), "stopping a proxy leaves the shared transport up");
    }

    #[tokio::test]
    async fn test_unreachable_bus_hands_over_quickly() {
        let dir = tempfile::tempdir().unwrap();
        let transport: Arc<dyn Transport> =
            Arc::new(crate::transport::BusTransport::new("tester", dir.path().join("missing.sock")));
        let proxy = Proxy::builder("proto", transport.clone())
            .discovery(DiscoveryConfig {
                delay: Duration::from_secs(60),
                ..fast_discovery(5)
            })
            .build();

        let started = tokio::time::Instant::now();
        assert_eq!(proxy.start().await, DiscoveryState::Discovering);
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());

        proxy.stop().await;
        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnected_transport_is_retryable() {
        let bus = LocalBus::new();
        bus.register(proto());
        let transport: Arc<dyn Transport> = Arc::new(bus.transport("tester"));
        let proxy = Proxy::new("proto", transport.clone());

        // Discovery starts the transport itself.
        assert_eq!(proxy.start().await, DiscoveryState::Ready);

        transport.stop().await.unwrap();
        let error = proxy.call_command("ping", CommandArgs::new()).await.unwrap_err();
        assert!(matches!(error, ProxyError::NotConnected));
        assert!(error.is_retryable());
        assert!(!proxy.is_connected());
    }

    #[tokio::test]
    async fn test_nosync_fires_and_forgets() {
        let (bus, transport) = connected_bus().await;
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        bus.register(ActorService::new("proto").command("mark", move |ctx: CommandContext| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(ctx.args.positional.clone());
                CommandResult::Ok(Payload::new())
            }
        }));

        let proxy = Proxy::new("proto", transport);
        proxy.call_nosync("mark", CommandArgs::new().arg("x"));
        proxy.call_nosync("missing", CommandArgs::new());

        let seen = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, vec![json!("x")]);
    }
}
