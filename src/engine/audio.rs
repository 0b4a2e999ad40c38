//! AAC / MP3 / WAV transcoding through an `ffmpeg` subprocess

use std::path::Path;

use async_trait::async_trait;

use super::{run_process, ConversionEngine, EngineError};

/// Default encoder bitrate for lossy targets
pub const DEFAULT_AUDIO_BITRATE: &str = "192k";

/// Codec an [`AudioEngine`] encodes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Aac,
    Mp3,
    Wav,
}

impl AudioCodec {
    fn encoder(self) -> &'static str {
        match self {
            AudioCodec::Aac => "aac",
            AudioCodec::Mp3 => "libmp3lame",
            AudioCodec::Wav => "pcm_s16le",
        }
    }

    fn is_lossy(self) -> bool {
        !matches!(self, AudioCodec::Wav)
    }
}

/// Transcodes audio with an external `ffmpeg`-compatible program
#[derive(Debug, Clone)]
pub struct AudioEngine {
    program: String,
    codec: AudioCodec,
    bitrate: String,
}

impl AudioEngine {
    pub fn new(program: impl Into<String>, codec: AudioCodec) -> Self {
        Self {
            program: program.into(),
            codec,
            bitrate: DEFAULT_AUDIO_BITRATE.to_string(),
        }
    }

    pub fn with_bitrate(mut self, bitrate: impl Into<String>) -> Self {
        self.bitrate = bitrate.into();
        self
    }

    /// Arguments passed to the transcoder, sample rate and channels kept
    pub fn arguments(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-nostdin".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            input.display().to_string(),
            "-vn".to_string(),
            "-c:a".to_string(),
            self.codec.encoder().to_string(),
        ];

        if self.codec.is_lossy() {
            args.push("-b:a".to_string());
            args.push(self.bitrate.clone());
        }

        args.push(output.display().to_string());
        args
    }
}

#[async_trait]
impl ConversionEngine for AudioEngine {
    fn name(&self) -> &str {
        match self.codec {
            AudioCodec::Aac => "audio/aac",
            AudioCodec::Mp3 => "audio/mp3",
            AudioCodec::Wav => "audio/wav",
        }
    }

    async fn convert(&self, input: &Path, output: &Path) -> Result<(), EngineError> {
        run_process(&self.program, self.arguments(input, output)).await
    }
}
