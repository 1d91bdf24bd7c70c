//! actor-proxy command line tool
//!
//! Runs the bus daemon, serves the demo actor, and calls actors on the bus
//! from the shell.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tracing::info;

use actor_proxy::actor::AutoStart;
use actor_proxy::constants::DEFAULT_DAEMON_IDLE_TIMEOUT;
use actor_proxy::encode::decode_arguments;
use actor_proxy::{
    BusTransport, Options, Proxy, ProxyConfig, Transport, UnpackOptions, daemon, demo,
    structured_logging,
};

#[derive(Parser)]
#[command(name = "actor-proxy")]
#[command(about = "Discover and call message bus actors")]
struct Args {
    #[command(flatten)]
    options: Options,

    /// Configuration file (default: actor-proxy.json, then config/actor-proxy.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Parser, Debug)]
struct BusArgs {
    /// Socket filename prefix, overriding the configuration
    #[arg(long)]
    prefix: Option<String>,

    /// Full socket path, overriding the prefix
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Start a daemon if none is running
    #[arg(long)]
    auto_start: bool,

    /// Idle timeout of an auto-started daemon, in seconds
    #[arg(long, default_value_t = DEFAULT_DAEMON_IDLE_TIMEOUT)]
    daemon_idle_timeout: u64,
}

#[derive(Parser, Debug)]
enum Command {
    /// Run the message bus daemon
    Daemon {
        #[command(flatten)]
        bus: BusArgs,

        /// Idle timeout in seconds before auto-shutdown
        #[arg(long, default_value_t = DEFAULT_DAEMON_IDLE_TIMEOUT)]
        idle_timeout: u64,
    },

    /// Call a command and print its reply as JSON
    Call {
        #[command(flatten)]
        bus: BusArgs,

        #[command(flatten)]
        client: ClientArgs,

        /// Print only these keys (wildcards allowed)
        #[arg(long = "unpack", value_name = "KEY")]
        unpack: Vec<String>,

        /// Flatten nested mappings before printing or unpacking
        #[arg(long)]
        flatten: bool,

        /// Require every argument to be valid JSON
        #[arg(long)]
        json_args: bool,

        actor: String,

        command: String,

        /// Command arguments; `--name value` pairs become options
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Discover and print the commands of an actor
    Commands {
        #[command(flatten)]
        bus: BusArgs,

        #[command(flatten)]
        client: ClientArgs,

        actor: String,
    },

    /// Serve the demo actor on the bus until interrupted
    DemoActor {
        #[command(flatten)]
        bus: BusArgs,

        #[command(flatten)]
        client: ClientArgs,

        /// Name the actor answers to
        #[arg(long, default_value = "demo")]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let flush_guard = structured_logging::init_tracing(args.options.dev_log)
        .expect("Failed to initialize logging");

    let config = ProxyConfig::load(args.config.as_deref())?;

    match args.command {
        Command::Daemon { bus, idle_timeout } => {
            let socket_path = bus.socket_path(&config);
            info!(
                "starting bus daemon at {}, idle timeout {idle_timeout}s",
                socket_path.display()
            );
            daemon::run_daemon(&socket_path, idle_timeout, None).await?;
        }
        Command::Call {
            bus,
            client,
            unpack,
            flatten,
            json_args,
            actor,
            command,
            args: tokens,
        } => {
            if json_args {
                for token in &tokens {
                    if !token.starts_with("--") {
                        serde_json::from_str::<Value>(token)
                            .with_context(|| format!("argument `{token}` is not valid JSON"))?;
                    }
                }
            }

            let transport = connect(&bus, &client, &config, &args.options).await?;
            let proxy = build_proxy(&actor, transport.clone(), &config);

            let reply = proxy.call_command(&command, decode_arguments(&tokens)).await;
            transport.stop().await?;
            let reply = reply?;
            let reply = if flatten { reply.flatten() } else { reply };

            let output = if unpack.is_empty() {
                Value::from(reply)
            } else {
                let keys: Vec<&str> = unpack.iter().map(String::as_str).collect();
                reply
                    .unpack_with(&keys, UnpackOptions::new().exception_on_missing_keys(true))?
                    .into()
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Commands { bus, client, actor } => {
            let transport = connect(&bus, &client, &config, &args.options).await?;
            let proxy = build_proxy(&actor, transport.clone(), &config);

            proxy.start().await;
            while proxy.has_discovery_task() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            let commands = proxy.commands();
            transport.stop().await?;

            let commands = commands.with_context(|| format!("could not discover commands of {actor}"))?;
            for command in commands {
                println!("{command}");
            }
        }
        Command::DemoActor { bus, client, name } => {
            let transport = bus_transport(&bus, &client, &config, &args.options);
            transport.serve(demo::demo_service(&name)).await?;
            transport.start().await?;
            info!("serving demo actor `{name}` at {}", transport.socket_path().display());

            tokio::signal::ctrl_c().await?;
            info!("shutting down demo actor `{name}`");
            transport.stop().await?;
        }
    }

    std::mem::drop(flush_guard);
    Ok(())
}

impl BusArgs {
    fn socket_path(&self, config: &ProxyConfig) -> PathBuf {
        let prefix = self.prefix.as_deref().unwrap_or(&config.socket_prefix);
        daemon::resolve_socket_path(self.socket.clone(), prefix)
    }
}

fn bus_transport(
    bus: &BusArgs,
    client: &ClientArgs,
    config: &ProxyConfig,
    options: &Options,
) -> BusTransport {
    let identity = format!("actor-proxy-{}", std::process::id());
    let transport = BusTransport::new(identity, bus.socket_path(config));
    if client.auto_start {
        transport.with_auto_start(AutoStart {
            options: options.clone(),
            idle_timeout_secs: client.daemon_idle_timeout,
        })
    } else {
        transport
    }
}

async fn connect(
    bus: &BusArgs,
    client: &ClientArgs,
    config: &ProxyConfig,
    options: &Options,
) -> Result<Arc<dyn Transport>> {
    let transport = bus_transport(bus, client, config, options);
    transport.start().await.with_context(|| {
        format!("failed to connect to bus at {}", transport.socket_path().display())
    })?;
    Ok(Arc::new(transport))
}

fn build_proxy(actor: &str, transport: Arc<dyn Transport>, config: &ProxyConfig) -> Proxy {
    let mut errors = actor_proxy::ErrorRegistry::default();
    demo::demo_errors(&mut errors);

    Proxy::builder(actor, transport)
        .errors(Arc::new(errors))
        .discovery(config.discovery())
        .time_limit(config.time_limit())
        .build()
}
