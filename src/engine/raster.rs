//! BMP / JPEG / PNG re-encoding through the `image` crate

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use async_trait::async_trait;
use image::{codecs::jpeg::JpegEncoder, ImageFormat, ImageReader, RgbImage};
use tracing::debug;

use super::{ConversionEngine, EngineError};

/// Default JPEG encoder quality
pub const DEFAULT_JPEG_QUALITY: u8 = 75;

/// Pixel format an [`ImageEngine`] writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageTarget {
    Bmp,
    Jpeg,
    Png,
}

/// Decodes any supported raster format and re-encodes it as 8-bit RGB
#[derive(Debug, Clone)]
pub struct ImageEngine {
    target: ImageTarget,
    jpeg_quality: u8,
}

impl ImageEngine {
    pub fn new(target: ImageTarget) -> Self {
        Self {
            target,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }
}

#[async_trait]
impl ConversionEngine for ImageEngine {
    fn name(&self) -> &str {
        match self.target {
            ImageTarget::Bmp => "image/bmp",
            ImageTarget::Jpeg => "image/jpeg",
            ImageTarget::Png => "image/png",
        }
    }

    async fn convert(&self, input: &Path, output: &Path) -> Result<(), EngineError> {
        let input = input.to_path_buf();
        let output = output.to_path_buf();
        let target = self.target;
        let quality = self.jpeg_quality;

        tokio::task::spawn_blocking(move || reencode(&input, &output, target, quality))
            .await
            .map_err(|e| EngineError::Task { reason: e.to_string() })?
    }
}

fn reencode(input: &Path, output: &Path, target: ImageTarget, quality: u8) -> Result<(), EngineError> {
    let decoded = ImageReader::open(input)?.with_guessed_format()?.decode()?;
    let pixels: RgbImage = decoded.to_rgb8();
    debug!(
        "Decoded {}x{} image from {}",
        pixels.width(),
        pixels.height(),
        input.display()
    );

    match target {
        ImageTarget::Jpeg => encode_jpeg(&pixels, output, quality),
        ImageTarget::Bmp => Ok(pixels.save_with_format(output, ImageFormat::Bmp)?),
        ImageTarget::Png => Ok(pixels.save_with_format(output, ImageFormat::Png)?),
    }
}

fn encode_jpeg(pixels: &RgbImage, output: &Path, quality: u8) -> Result<(), EngineError> {
    let mut writer = BufWriter::new(File::create(output)?);
    JpegEncoder::new_with_quality(&mut writer, quality).encode_image(pixels)?;
    writer.flush()?;
    Ok(())
}

/// Encode `pixels` as JPEG in memory at the given quality
pub fn jpeg_bytes(pixels: &RgbImage, quality: u8) -> Result<Vec<u8>, EngineError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality).encode_image(pixels)?;
    Ok(buffer)
}
