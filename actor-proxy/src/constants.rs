//! Constants and default configuration values used throughout actor-proxy

use std::path::PathBuf;

/// Reserved command every actor answers with its list of commands
pub const COMMANDS_COMMAND: &str = "__commands";

/// Field of the `__commands` reply holding the command names
pub const COMMANDS_KEY: &str = "help";

/// Field under which a failed reply carries its error descriptor
pub const ERROR_KEY: &str = "error";

/// Actor tag for invocations that cannot be traced to a proxy
pub const LOCAL_ACTOR: &str = "local";

/// Separator used when flattening nested reply mappings
pub const FLATTEN_SEPARATOR: &str = ".";

/// Default prefix for bus daemon socket files
pub const BUS_SOCKET_PREFIX: &str = "actor-proxy-bus";

/// Default log file name for development mode
pub const DEV_LOG_FILENAME: &str = "actor-proxy.log";

/// Default idle timeout for the bus daemon in seconds
pub const DEFAULT_DAEMON_IDLE_TIMEOUT: u64 = 30;

/// Default time limit for a single command, in seconds
pub const DEFAULT_TIME_LIMIT_SECS: u64 = 30;

/// Number of discovery attempts made in the background before giving up
pub const DEFAULT_DISCOVERY_ATTEMPTS: u32 = 20;

/// Delay between two discovery attempts, in milliseconds
pub const DEFAULT_DISCOVERY_DELAY_MS: u64 = 1000;

/// Time limit for one discovery attempt, in milliseconds
pub const DEFAULT_DISCOVERY_TIME_LIMIT_MS: u64 = 1000;

/// Module name used for errors raised by this crate
pub const ERROR_MODULE: &str = "actor_proxy";

/// Bus socket path with custom prefix
pub fn bus_socket_path(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}.sock", prefix))
}

/// Development log file path
pub fn dev_log_path() -> PathBuf {
    std::env::temp_dir().join(DEV_LOG_FILENAME)
}
