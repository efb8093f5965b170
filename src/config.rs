use std::path::Path;

use anyhow::Context as _;

use crate::foundation::core::Resolution;
use crate::foundation::error::{RenderError, RenderResultT};

/// One audio layer of the final render.
///
/// Tracks play one after another in the order they are listed.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineTrack {
    /// Fetchable source: `http(s)://`, `file://` or a local path. Blank means "no audio".
    #[serde(default)]
    pub audio_url: String,
    /// Linear gain, multiplied by the render's master volume.
    #[serde(default = "default_gain")]
    pub volume: f32,
    /// Seconds dropped from the start of the source.
    #[serde(default)]
    pub trim_start: f64,
    /// Seconds dropped from the end of the source.
    #[serde(default)]
    pub trim_end: f64,
}

impl TimelineTrack {
    pub fn new(audio_url: impl Into<String>) -> Self {
        Self {
            audio_url: audio_url.into(),
            volume: 1.0,
            trim_start: 0.0,
            trim_end: 0.0,
        }
    }

    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }

    pub fn with_trim(mut self, trim_start: f64, trim_end: f64) -> Self {
        self.trim_start = trim_start;
        self.trim_end = trim_end;
        self
    }

    /// `true` when the track names an audio source.
    pub fn has_source(&self) -> bool {
        !self.audio_url.trim().is_empty()
    }

    pub fn validate(&self) -> RenderResultT<()> {
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err(RenderError::validation(format!(
                "track volume must be finite and >= 0 (got {})",
                self.volume
            )));
        }
        for (name, v) in [("trimStart", self.trim_start), ("trimEnd", self.trim_end)] {
            if !v.is_finite() || v < 0.0 {
                return Err(RenderError::validation(format!(
                    "track {name} must be finite and >= 0 (got {v})"
                )));
            }
        }
        Ok(())
    }
}

fn default_gain() -> f32 {
    1.0
}

fn default_loop_count() -> u32 {
    1
}

/// A single render request. Immutable for the duration of the render.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderConfig {
    pub tracks: Vec<TimelineTrack>,
    /// Static image shown for the whole video.
    pub cover_image_url: String,
    #[serde(default)]
    pub resolution: Resolution,
    /// Times the full audio pass repeats back-to-back.
    #[serde(default = "default_loop_count")]
    pub loop_count: u32,
    #[serde(default = "default_gain")]
    pub master_volume: f32,
    /// Used to build the suggested output filename.
    #[serde(default)]
    pub video_title: String,
}

impl RenderConfig {
    pub fn new(cover_image_url: impl Into<String>, tracks: Vec<TimelineTrack>) -> Self {
        Self {
            tracks,
            cover_image_url: cover_image_url.into(),
            resolution: Resolution::default(),
            loop_count: 1,
            master_volume: 1.0,
            video_title: String::new(),
        }
    }

    /// Load a config from a JSON file.
    pub fn from_json_file(path: &Path) -> RenderResultT<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("read render config '{}'", path.display()))?;
        Self::from_json_slice(&bytes)
    }

    pub fn from_json_slice(bytes: &[u8]) -> RenderResultT<Self> {
        let cfg: Self = serde_json::from_slice(bytes)
            .map_err(|e| RenderError::validation(format!("render config JSON: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Structural checks that do not need any I/O.
    ///
    /// Tracks without a source are allowed here; the mixer filters them out.
    pub fn validate(&self) -> RenderResultT<()> {
        if self.loop_count == 0 {
            return Err(RenderError::validation("loopCount must be >= 1"));
        }
        if !self.master_volume.is_finite() || self.master_volume < 0.0 {
            return Err(RenderError::validation(format!(
                "masterVolume must be finite and >= 0 (got {})",
                self.master_volume
            )));
        }
        if self.cover_image_url.trim().is_empty() {
            return Err(RenderError::validation("coverImageUrl must not be empty"));
        }
        for (i, t) in self.tracks.iter().enumerate() {
            t.validate().map_err(|e| match e {
                RenderError::Validation(msg) => {
                    RenderError::validation(format!("track {i}: {msg}"))
                }
                other => other,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "../tests/unit/config.rs"]
mod tests;
