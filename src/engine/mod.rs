//! Conversion engines
//!
//! An engine turns the file at `input` into the file at `output`. The
//! session only relies on that contract: on `Ok(())` the output path holds
//! the converted file, on `Err` nothing is sent back but a notice.

pub mod audio;
pub mod document;
pub mod raster;

use std::{ffi::OsStr, fmt, path::Path, process::Stdio};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

pub use self::audio::{AudioCodec, AudioEngine};
pub use self::document::DocumentEngine;
pub use self::raster::{ImageEngine, ImageTarget};
pub use crate::error::EngineError;

/// Capability that converts one file into another
#[async_trait]
pub trait ConversionEngine: Send + Sync + fmt::Debug {
    /// Short name used in logs
    fn name(&self) -> &str;

    async fn convert(&self, input: &Path, output: &Path) -> Result<(), EngineError>;
}

/// Run an external converter to completion.
///
/// Stdin is closed and stderr is captured for the error report. The child
/// is killed if the returned future is dropped, which is how conversion
/// timeouts stop it.
pub(crate) async fn run_process<I, S>(program: &str, args: I) -> Result<(), EngineError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("Running {:?}", command.as_std());

    let output = command.output().await.map_err(|e| EngineError::Launch {
        program: program.to_string(),
        reason: e.to_string(),
    })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(EngineError::ProcessFailed {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
