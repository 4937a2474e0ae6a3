//! CLI definitions for keyrelay.

use clap::{builder::PossibleValuesParser, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Default ALPN protocol identifier.
pub const DEFAULT_ALPN: &str = "keyrelay/1";

/// Parse a duration from a human-readable string.
fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Relay server matching connectors to listeners by public identity.
#[derive(Debug, Parser)]
#[command(name = "keyrelay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level (debug|info|warn|error)
    #[arg(long, global = true, default_value = "info", value_parser = PossibleValuesParser::new(["debug", "info", "warn", "error"]))]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the relay server
    Server(ServerArgs),

    /// Generate or load a client identity and print it
    Identity(IdentityArgs),

    /// Show version information
    Version,
}

/// Arguments for the server subcommand.
#[derive(Debug, Parser)]
pub struct ServerArgs {
    /// QUIC listen address (e.g., :9443)
    #[arg(long)]
    pub listen: String,

    /// TLS certificate file path
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key file path
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// ALPN protocol identifier
    #[arg(long, default_value = DEFAULT_ALPN)]
    pub alpn: String,

    /// QUIC idle timeout
    #[arg(long, value_parser = parse_duration, default_value = "60s")]
    pub idle_timeout: Duration,

    /// Silence after which a listener or tunnel side is dropped
    #[arg(long, value_parser = parse_duration, default_value = "30s")]
    pub keepalive_timeout: Duration,

    /// Interval of liveness and pending-connection checks
    #[arg(long, value_parser = parse_duration, default_value = "1s")]
    pub tick_interval: Duration,

    /// How long a connection may wait for the listener to accept it
    #[arg(long, value_parser = parse_duration, default_value = "15s")]
    pub pending_timeout: Duration,

    /// How long a new stream may take to declare its role
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    pub init_timeout: Duration,

    /// Configuration directory path
    #[arg(long)]
    pub config_dir: Option<PathBuf>,
}

/// Arguments for the identity subcommand.
#[derive(Debug, Parser)]
pub struct IdentityArgs {
    /// Directory holding the identity certificate and key
    #[arg(long)]
    pub dir: Option<PathBuf>,
}

/// Returns the default configuration directory.
///
/// - root (UID=0): `/etc/keyrelay`
/// - others: `~/.keyrelay`
pub fn default_config_dir() -> PathBuf {
    if is_root() {
        PathBuf::from("/etc/keyrelay")
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".keyrelay")
    }
}

/// Check if running as root.
fn is_root() -> bool {
    #[cfg(unix)]
    {
        // SAFETY: getuid() is a simple syscall that returns the real user ID.
        // It has no preconditions and always succeeds.
        unsafe { libc::getuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Build information for version command.
pub struct BuildInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub built: &'static str,
}

impl BuildInfo {
    /// Returns build information from environment variables or defaults.
    pub fn get() -> Self {
        Self {
            version: option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"),
            commit: option_env!("KEYRELAY_COMMIT").unwrap_or("unknown"),
            built: option_env!("KEYRELAY_BUILD_DATE").unwrap_or("unknown"),
        }
    }

    /// Format version output.
    pub fn format(&self) -> String {
        format!(
            "keyrelay version {}\n  commit: {}\n  built:  {}",
            self.version, self.commit, self.built
        )
    }
}
