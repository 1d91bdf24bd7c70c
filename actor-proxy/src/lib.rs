//! Client-side proxies for message bus actors
//!
//! A [`Proxy`] discovers the commands of a remote actor and calls them over a
//! shared [`Transport`]. Replies come back as [`Reply`] mappings that can be
//! flattened and unpacked; [`invoke`] runs many calls concurrently and keeps
//! their results in submission order.

pub mod actor;
pub mod config;
pub mod constants;
pub mod daemon;
pub mod demo;
pub mod encode;
pub mod error;
pub mod flatten;
pub mod invoke;
pub mod proxy;
pub mod remote_error;
pub mod reply;
pub mod service;
pub mod structured_logging;
pub mod transport;
pub mod types;
pub mod unpack;

pub use crate::main_types::Options;

mod main_types {
    use clap::Parser;
    use std::process::Command;

    #[derive(Parser, Debug, Clone, Default)]
    pub struct Options {
        /// Enable development logging to the default log file
        #[arg(long, global = true)]
        pub dev_log: bool,
    }

    impl Options {
        /// Reproduce these options on a spawned command
        pub fn reproduce(&self, cmd: &mut Command) {
            if self.dev_log {
                cmd.arg("--dev-log");
            }

            if let Ok(rust_log) = std::env::var("RUST_LOG") {
                cmd.env("RUST_LOG", rust_log);
            }
        }
    }
}

pub use config::ProxyConfig;
pub use encode::CommandArgs;
pub use error::{ProxyError, Result};
pub use flatten::flatten;
pub use invoke::{InvocationBatch, InvokeOptions, PendingCommand, invoke, invoke_with};
pub use proxy::{CallOptions, Command, DiscoveryConfig, DiscoveryState, Proxy};
pub use remote_error::{ErrorDescriptor, ErrorRegistry, RemoteError};
pub use reply::Reply;
pub use service::{ActorService, CommandContext, CommandResult};
pub use transport::{BusTransport, LocalBus, LocalTransport, Transport};
pub use unpack::{UnpackOptions, Unpacked, unpack, unpack_with};
