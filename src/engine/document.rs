//! ODT / PDF / TXT conversion through a headless office suite
//!
//! The office suite names its output after the input stem and writes it
//! into a directory, so the conversion runs into a private directory next to
//! the output path and the produced file is then moved into place.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{run_process, ConversionEngine, EngineError};

/// Converts documents with a headless office suite
#[derive(Debug, Clone)]
pub struct DocumentEngine {
    program: String,
    filter: String,
}

impl DocumentEngine {
    /// `filter` is the office `--convert-to` argument, e.g. `pdf` or
    /// `pdf:writer_pdf_Export`
    pub fn new(program: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            filter: filter.into(),
        }
    }

    /// Extension of the file the office suite produces
    pub fn produced_extension(&self) -> &str {
        self.filter.split(':').next().unwrap_or(&self.filter)
    }

    /// The user profile lives under `outdir` so concurrent runs never share
    /// a profile lock
    pub fn arguments(&self, input: &Path, outdir: &Path) -> Vec<String> {
        vec![
            format!(
                "-env:UserInstallation=file://{}",
                outdir.join("profile").display()
            ),
            "--headless".to_string(),
            "--convert-to".to_string(),
            self.filter.clone(),
            "--outdir".to_string(),
            outdir.display().to_string(),
            input.display().to_string(),
        ]
    }

    fn produced_path(&self, input: &Path, outdir: &Path) -> PathBuf {
        let stem = input.file_stem().unwrap_or_default();
        outdir
            .join(stem)
            .with_extension(self.produced_extension())
    }
}

#[async_trait]
impl ConversionEngine for DocumentEngine {
    fn name(&self) -> &str {
        &self.filter
    }

    async fn convert(&self, input: &Path, output: &Path) -> Result<(), EngineError> {
        let parent = output.parent().unwrap_or_else(|| Path::new("."));
        let outdir = tempfile::Builder::new()
            .prefix("office_")
            .tempdir_in(parent)?;

        run_process(&self.program, self.arguments(input, outdir.path())).await?;

        let produced = self.produced_path(input, outdir.path());
        if !tokio::fs::try_exists(&produced).await.unwrap_or(false) {
            return Err(EngineError::MissingOutput { path: produced });
        }

        debug!("Moving {} to {}", produced.display(), output.display());
        tokio::fs::rename(&produced, output).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_arguments() {
        let engine = DocumentEngine::new("libreoffice", "pdf:writer_pdf_Export");
        let args = engine.arguments(Path::new("/tmp/input_file_x.txt"), Path::new("/tmp/out"));

        assert_eq!(
            args,
            vec![
                "-env:UserInstallation=file:///tmp/out/profile",
                "--headless",
                "--convert-to",
                "pdf:writer_pdf_Export",
                "--outdir",
                "/tmp/out",
                "/tmp/input_file_x.txt",
            ]
        );
        assert_eq!(engine.produced_extension(), "pdf");
    }

    #[test]
    fn test_each_run_gets_its_own_profile() {
        let engine = DocumentEngine::new("libreoffice", "odt");
        let input = Path::new("/s/input_file_1.pdf");

        let first = engine.arguments(input, Path::new("/s/office_a"));
        let second = engine.arguments(input, Path::new("/s/office_b"));
        assert_ne!(first[0], second[0]);
        assert!(first[0].ends_with("/s/office_a/profile"));
    }

    #[test]
    fn test_produced_path_uses_input_stem() {
        let engine = DocumentEngine::new("libreoffice", "odt");
        let produced = engine.produced_path(Path::new("/s/input_file_ab12.pdf"), Path::new("/s/o"));
        assert_eq!(produced, PathBuf::from("/s/o/input_file_ab12.odt"));
    }

    #[tokio::test]
    async fn test_missing_output_is_an_error() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("input_file_1.odt");
        let output = dir.path().join("output_file_1.pdf");
        std::fs::write(&input, b"doc").unwrap();

        // `true` exits cleanly without writing anything
        let engine = DocumentEngine::new("true", "pdf");
        let result = engine.convert(&input, &output).await;

        assert!(matches!(result, Err(EngineError::MissingOutput { .. })));
        // the private output directory is gone too
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_produced_file_moved_onto_output() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let script = dir.path().join("fake-office");
        // writes "<outdir>/<stem>.txt" the way the office suite does
        std::fs::write(
            &script,
            "#!/bin/sh\nstem=$(basename \"$7\" .odt)\necho converted > \"$6/$stem.txt\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let input = dir.path().join("input_file_2.odt");
        let output = dir.path().join("output_file_2.txt");
        std::fs::write(&input, b"doc").unwrap();
        std::fs::write(&output, b"").unwrap();

        let engine = DocumentEngine::new(script.display().to_string(), "txt");
        engine.convert(&input, &output).await.unwrap();

        assert_eq!(std::fs::read_to_string(&output).unwrap(), "converted\n");
        // script, input and output only
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 3);
    }

    #[tokio::test]
    async fn test_office_failure() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("input_file_3.pdf");
        let output = dir.path().join("output_file_3.odt");

        let result = DocumentEngine::new("false", "odt").convert(&input, &output).await;
        assert!(matches!(result, Err(EngineError::ProcessFailed { .. })));
    }
}
