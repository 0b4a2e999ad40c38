use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::client::Endpoint;
use crate::config::{Config, Scheduling};

/// CLI arguments for the conversion relay
#[derive(Parser, Debug, Clone)]
#[command(
    name = "convert-relay",
    version,
    about = "A socket file-conversion relay",
    long_about = "
convert-relay accepts a file over a socket, offers a menu of target formats
for its extension, and sends back the converted file.

EXAMPLES:
  Run the server (admin socket plus public TCP port):
    convert-relay serve
    convert-relay serve --port 9000 --scheduling serial

  Convert files interactively:
    convert-relay client --host 127.0.0.1 --port 8080
    convert-relay client --admin

  Show the options offered for an extension:
    convert-relay menu png
"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// TOML configuration file
    #[arg(
        short = 'c',
        long = "config",
        value_name = "FILE",
        global = true,
        help = "Configuration file (defaults apply when omitted)"
    )]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[arg(
        short = 'v',
        long = "verbose",
        global = true,
        help = "Enable verbose logging"
    )]
    pub verbose: bool,

    /// Log level
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        default_value_t = LogLevel::Info,
        help = "Set the logging level"
    )]
    pub log_level: LogLevel,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the admin and public listeners
    Serve(ServeArgs),
    /// Convert files interactively against a running server
    Client(ClientArgs),
    /// Print the menu offered for an extension
    Menu {
        #[arg(value_name = "EXTENSION")]
        extension: String,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// Public TCP port
    #[arg(short = 'p', long = "port", value_name = "PORT")]
    pub port: Option<u16>,

    /// Admin Unix socket path
    #[arg(long = "admin-socket", value_name = "PATH")]
    pub admin_socket: Option<PathBuf>,

    /// Public listener scheduling
    #[arg(long = "scheduling", value_enum)]
    pub scheduling: Option<Scheduling>,

    /// Directory for scratch files
    #[arg(long = "scratch-dir", value_name = "DIR")]
    pub scratch_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Connect through the admin socket instead of TCP
    #[arg(long = "admin", conflicts_with_all = ["host", "port"])]
    pub admin: bool,

    #[arg(long = "host", default_value = "127.0.0.1")]
    pub host: String,

    /// Server port (configured port when omitted)
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,
}

/// Log level enumeration
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Show error messages only
    Error,
    /// Show warnings and errors
    Warn,
    /// Show info, warnings, and errors (default)
    Info,
    /// Show debug information
    Debug,
    /// Show all log messages including trace
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl CliArgs {
    /// Initialize logging based on CLI arguments
    pub fn setup_logging(&self) -> Result<()> {
        let level = if self.verbose {
            "debug"
        } else {
            self.log_level.as_str()
        };

        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new(format!(
                        "{}={}",
                        env!("CARGO_PKG_NAME").replace('-', "_"),
                        level
                    ))
                }),
            )
            .with_target(false)
            .with_thread_ids(true)
            .with_level(true)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

        Ok(())
    }

    /// Configuration file (or defaults) with command-line overrides applied
    pub async fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load_from_file(path)
                .await
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
            None => Config::default(),
        };

        if let Command::Serve(overrides) = &self.command {
            overrides.apply(&mut config);
        }

        config.validate().context("Invalid configuration")?;
        debug!("Effective configuration: {:?}", config);
        Ok(config)
    }
}

impl ServeArgs {
    pub fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(path) = &self.admin_socket {
            config.server.admin_socket = path.clone();
        }
        if let Some(scheduling) = self.scheduling {
            config.server.scheduling = scheduling;
        }
        if let Some(dir) = &self.scratch_dir {
            config.server.scratch_dir = Some(dir.clone());
        }
    }
}

impl ClientArgs {
    pub fn endpoint(&self, config: &Config) -> Endpoint {
        if self.admin {
            Endpoint::Unix(config.server.admin_socket.clone())
        } else {
            Endpoint::Tcp {
                host: self.host.clone(),
                port: self.port.unwrap_or(config.server.port),
            }
        }
    }
}

/// Idle limit the client applies to its own reads and writes
pub fn client_io_timeout(config: &Config) -> Option<Duration> {
    config.limits.session_limits().io_timeout
}
