//! Scratch files for inbound and outbound payloads
//!
//! Every session gets its own pair of files in a shared scratch directory.
//! Names are random and created exclusively, so concurrent sessions never
//! collide. The extension is part of the name because engines key their
//! behaviour off it. A [`ScratchFile`] removes itself when dropped.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use tempfile::{Builder, TempPath};
use tracing::{debug, warn};

use crate::error::ResourceError;

/// Which side of the conversion a scratch file holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScratchRole {
    Input,
    Output,
}

impl ScratchRole {
    fn prefix(self) -> &'static str {
        match self {
            ScratchRole::Input => "input_file_",
            ScratchRole::Output => "output_file_",
        }
    }
}

impl fmt::Display for ScratchRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScratchRole::Input => write!(f, "input"),
            ScratchRole::Output => write!(f, "output"),
        }
    }
}

/// Shared directory that hands out scratch files
#[derive(Debug, Clone)]
pub struct ScratchSpace {
    dir: PathBuf,
}

impl ScratchSpace {
    /// Use `dir` for scratch files, creating it if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ResourceError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| ResourceError::ScratchCreate {
            dir: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    /// Use the system temporary directory
    pub fn system() -> Result<Self, ResourceError> {
        Self::new(std::env::temp_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Allocate an empty file named `<prefix><random>.<extension>`
    pub fn allocate(&self, role: ScratchRole, extension: &str) -> Result<ScratchFile, ResourceError> {
        let suffix = format!(".{extension}");
        let file = Builder::new()
            .prefix(role.prefix())
            .suffix(&suffix)
            .tempfile_in(&self.dir)
            .map_err(|source| ResourceError::ScratchCreate {
                dir: self.dir.clone(),
                source,
            })?;

        let path = file.into_temp_path();
        debug!("Allocated {} scratch file {}", role, path.display());

        Ok(ScratchFile {
            path: Some(path),
            role,
        })
    }
}

/// A scratch file removed on drop
pub struct ScratchFile {
    path: Option<TempPath>,
    role: ScratchRole,
}

impl ScratchFile {
    pub fn path(&self) -> &Path {
        match &self.path {
            Some(path) => &**path,
            None => Path::new(""),
        }
    }

    pub fn role(&self) -> ScratchRole {
        self.role
    }
}

impl fmt::Debug for ScratchFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchFile")
            .field("path", &self.path())
            .field("role", &self.role)
            .finish()
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            debug!("Removing {} scratch file {}", self.role, path.display());
            let shown = path.to_path_buf();
            if let Err(e) = path.close() {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove scratch file {}: {}", shown.display(), e);
                }
            }
        }
    }
}
