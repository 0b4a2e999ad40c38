//! Dispatch table: numeric menu options to conversion engines
//!
//! The table is data. Every supported conversion is one [`ConversionRow`];
//! adding a format means adding a row, the session code never changes. The
//! table is built once at start-up and shared read-only by both listeners.

use std::{collections::HashMap, fmt, sync::Arc};

use crate::config::EngineConfig;
use crate::engine::{
    AudioCodec, AudioEngine, ConversionEngine, DocumentEngine, ImageEngine, ImageTarget,
};
use crate::error::ConfigurationError;
use crate::wire::NOTICE_UNSUPPORTED;

/// Which engine family performs a conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Image(ImageTarget),
    Audio(AudioCodec),
    /// Office `--convert-to` filter
    Document { filter: &'static str },
}

/// Static description of one supported conversion
#[derive(Debug, Clone, Copy)]
pub struct ConversionRow {
    pub id: u32,
    pub source_extension: &'static str,
    pub target_extension: &'static str,
    pub description: &'static str,
    pub capability: Capability,
}

const fn row(
    id: u32,
    source_extension: &'static str,
    target_extension: &'static str,
    description: &'static str,
    capability: Capability,
) -> ConversionRow {
    ConversionRow {
        id,
        source_extension,
        target_extension,
        description,
        capability,
    }
}

/// Every conversion the relay offers. Ids are stable.
pub const STANDARD_CONVERSIONS: &[ConversionRow] = &[
    row(1, "aac", "mp3", "AAC to MP3", Capability::Audio(AudioCodec::Mp3)),
    row(2, "aac", "wav", "AAC to WAV", Capability::Audio(AudioCodec::Wav)),
    row(3, "mp3", "aac", "MP3 to AAC", Capability::Audio(AudioCodec::Aac)),
    row(4, "mp3", "wav", "MP3 to WAV", Capability::Audio(AudioCodec::Wav)),
    row(5, "wav", "aac", "WAV to AAC", Capability::Audio(AudioCodec::Aac)),
    row(6, "wav", "mp3", "WAV to MP3", Capability::Audio(AudioCodec::Mp3)),
    row(7, "bmp", "jpeg", "BMP to JPEG", Capability::Image(ImageTarget::Jpeg)),
    row(8, "bmp", "png", "BMP to PNG", Capability::Image(ImageTarget::Png)),
    row(9, "jpeg", "bmp", "JPEG to BMP", Capability::Image(ImageTarget::Bmp)),
    row(10, "jpeg", "png", "JPEG to PNG", Capability::Image(ImageTarget::Png)),
    row(11, "png", "bmp", "PNG to BMP", Capability::Image(ImageTarget::Bmp)),
    row(12, "png", "jpg", "PNG to JPEG", Capability::Image(ImageTarget::Jpeg)),
    row(13, "odt", "pdf", "ODT to PDF", Capability::Document { filter: "pdf" }),
    row(14, "odt", "txt", "ODT to TXT", Capability::Document { filter: "txt" }),
    row(15, "txt", "pdf", "TXT to PDF", Capability::Document { filter: "pdf:writer_pdf_Export" }),
    row(16, "txt", "odt", "TXT to ODT", Capability::Document { filter: "odt" }),
    row(17, "pdf", "odt", "PDF to ODT", Capability::Document { filter: "odt" }),
];

/// Extensions that share another extension's menu
pub const STANDARD_ALIASES: &[(&str, &str)] = &[("jpg", "jpeg")];

/// One resolved conversion
#[derive(Clone)]
pub struct ConversionDescriptor {
    pub id: u32,
    pub source_extension: String,
    pub target_extension: String,
    pub description: String,
    pub engine: Arc<dyn ConversionEngine>,
}

impl fmt::Debug for ConversionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionDescriptor")
            .field("id", &self.id)
            .field("source_extension", &self.source_extension)
            .field("target_extension", &self.target_extension)
            .field("description", &self.description)
            .field("engine", &self.engine.name())
            .finish()
    }
}

/// Lookup by id plus an ordered per-extension index for menus
#[derive(Debug, Default, Clone)]
pub struct DispatchTable {
    by_id: HashMap<u32, ConversionDescriptor>,
    by_extension: HashMap<String, Vec<u32>>,
    aliases: HashMap<String, String>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table of [`STANDARD_CONVERSIONS`] with engines built from `config`
    pub fn standard(config: &EngineConfig) -> Result<Self, ConfigurationError> {
        Self::with_engines(STANDARD_CONVERSIONS, |row| -> Arc<dyn ConversionEngine> {
            match row.capability {
                Capability::Image(target) => {
                    Arc::new(ImageEngine::new(target).with_jpeg_quality(config.jpeg_quality))
                }
                Capability::Audio(codec) => Arc::new(
                    AudioEngine::new(config.ffmpeg.clone(), codec)
                        .with_bitrate(config.audio_bitrate.clone()),
                ),
                Capability::Document { filter } => {
                    Arc::new(DocumentEngine::new(config.office.clone(), filter))
                }
            }
        })
    }

    /// Build a table from `rows`, asking `engine_for` for each row's engine
    pub fn with_engines<F>(rows: &[ConversionRow], mut engine_for: F) -> Result<Self, ConfigurationError>
    where
        F: FnMut(&ConversionRow) -> Arc<dyn ConversionEngine>,
    {
        let mut table = Self::new();
        for row in rows {
            table.insert(ConversionDescriptor {
                id: row.id,
                source_extension: row.source_extension.to_string(),
                target_extension: row.target_extension.to_string(),
                description: row.description.to_string(),
                engine: engine_for(row),
            })?;
        }
        for (alias, canonical) in STANDARD_ALIASES {
            table.alias(alias, canonical);
        }
        Ok(table)
    }

    /// Add a conversion; ids must be unique
    pub fn insert(&mut self, descriptor: ConversionDescriptor) -> Result<(), ConfigurationError> {
        if self.by_id.contains_key(&descriptor.id) {
            return Err(ConfigurationError::DuplicateConversion { id: descriptor.id });
        }

        self.by_extension
            .entry(descriptor.source_extension.to_ascii_lowercase())
            .or_default()
            .push(descriptor.id);
        self.by_id.insert(descriptor.id, descriptor);
        Ok(())
    }

    /// Let `alias` share the menu of `canonical`
    pub fn alias(&mut self, alias: &str, canonical: &str) {
        self.aliases
            .insert(alias.to_ascii_lowercase(), canonical.to_ascii_lowercase());
    }

    fn canonical<'a>(&'a self, extension: &'a str) -> &'a str {
        self.aliases
            .get(extension)
            .map(String::as_str)
            .unwrap_or(extension)
    }

    pub fn lookup(&self, id: u32) -> Option<&ConversionDescriptor> {
        self.by_id.get(&id)
    }

    /// Ids offered for `extension`, in menu order
    pub fn offered(&self, extension: &str) -> &[u32] {
        let extension = extension.to_ascii_lowercase();
        self.by_extension
            .get(self.canonical(&extension))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn menu(&self, extension: &str) -> Menu {
        let entries = self
            .offered(extension)
            .iter()
            .filter_map(|id| self.lookup(*id))
            .map(|descriptor| MenuEntry {
                id: descriptor.id,
                description: descriptor.description.clone(),
            })
            .collect();

        Menu { entries }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// One menu line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuEntry {
    pub id: u32,
    pub description: String,
}

/// Options offered for one extension
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Menu {
    entries: Vec<MenuEntry>,
}

impl Menu {
    pub fn entries(&self) -> &[MenuEntry] {
        &self.entries
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|entry| entry.id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.ids().any(|offered| offered == id)
    }

    pub fn is_supported(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Wire text: `"<id>. <description>\n"` per entry, or the unsupported notice
    pub fn render(&self) -> String {
        if self.entries.is_empty() {
            return NOTICE_UNSUPPORTED.to_string();
        }

        self.entries
            .iter()
            .map(|entry| format!("{}. {}\n", entry.id, entry.description))
            .collect()
    }

    /// Parse menu text received from a server. Lines that are not entries
    /// (such as the unsupported notice) are skipped.
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .filter_map(|line| {
                let (id, description) = line.split_once(". ")?;
                Some(MenuEntry {
                    id: id.trim().parse().ok()?,
                    description: description.trim().to_string(),
                })
            })
            .collect();

        Menu { entries }
    }
}

impl fmt::Display for Menu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
