//! Convert Relay
//!
//! A socket file-conversion relay: a client uploads a file, picks a target
//! format from the menu the server offers for its extension, and receives
//! the converted file back on the same connection.

#![warn(rust_2018_idioms)]

pub mod cli;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod listener;
pub mod scratch;
pub mod session;
pub mod wire;

// Re-export commonly used types
pub use client::{ClientSession, Endpoint, InteractiveClient, Outcome};
pub use config::{Config, Scheduling, SessionLimits};
pub use dispatch::{ConversionDescriptor, DispatchTable, Menu};
pub use engine::{ConversionEngine, EngineError};
pub use error::{RelayError, Result};
pub use listener::{AdminLifecycle, AdminListener, PublicListener, RelayServer};
pub use scratch::{ScratchFile, ScratchSpace};
pub use session::{SessionHandler, SessionReport, SessionState};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        AdminLifecycle, ClientSession, Config, ConversionEngine, DispatchTable, EngineError,
        Endpoint, Menu, Outcome, RelayError, RelayServer, Result, Scheduling, ScratchSpace,
        SessionHandler, SessionLimits,
    };

    pub use anyhow::{Context, Result as AnyhowResult};
    pub use tokio;
    pub use tracing::{debug, error, info, warn};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
