use crate::foundation::error::{RenderError, RenderResultT};

/// Output frame rate used for every render.
pub const FPS: u32 = 30;
/// Target sample rate of the mixed audio (Hz).
pub const MIX_SAMPLE_RATE: u32 = 48_000;
/// Number of channels in the mixed audio (stereo).
pub const MIX_CHANNELS: usize = 2;
/// AAC bitrate for the audio track.
pub const AUDIO_BITRATE: u32 = 192_000;
/// Seconds between forced key frames.
pub const KEY_FRAME_INTERVAL_SEC: f64 = 0.5;

/// Output size in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Aspect ratio `width / height`.
    pub fn aspect(self) -> f64 {
        f64::from(self.width) / f64::from(self.height)
    }
}

/// Render resolution preset.
///
/// Each preset maps to fixed output dimensions and a fixed target video bitrate.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum Resolution {
    /// 1280x720 @ 5 Mbps.
    #[serde(rename = "720p")]
    P720,
    /// 1920x1080 @ 8 Mbps.
    #[default]
    #[serde(rename = "1080p")]
    P1080,
    /// 2560x1440 @ 16 Mbps.
    #[serde(rename = "1440p")]
    P1440,
    /// 3840x2160 @ 35 Mbps.
    #[serde(rename = "4k")]
    K4,
}

impl Resolution {
    /// All presets, smallest first.
    pub const ALL: [Resolution; 4] = [
        Resolution::P720,
        Resolution::P1080,
        Resolution::P1440,
        Resolution::K4,
    ];

    /// Output dimensions for this preset.
    pub fn dimensions(self) -> Dimensions {
        let (width, height) = match self {
            Resolution::P720 => (1280, 720),
            Resolution::P1080 => (1920, 1080),
            Resolution::P1440 => (2560, 1440),
            Resolution::K4 => (3840, 2160),
        };
        Dimensions { width, height }
    }

    /// Target video bitrate in bits per second.
    pub fn video_bitrate(self) -> u32 {
        match self {
            Resolution::P720 => 5_000_000,
            Resolution::P1080 => 8_000_000,
            Resolution::P1440 => 16_000_000,
            Resolution::K4 => 35_000_000,
        }
    }

    /// Stable preset label (`"720p"`, `"1080p"`, `"1440p"`, `"4k"`).
    pub fn label(self) -> &'static str {
        match self {
            Resolution::P720 => "720p",
            Resolution::P1080 => "1080p",
            Resolution::P1440 => "1440p",
            Resolution::K4 => "4k",
        }
    }

    /// Parse a preset label.
    pub fn parse(s: &str) -> RenderResultT<Self> {
        Self::ALL
            .into_iter()
            .find(|r| r.label().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| RenderError::validation(format!("unknown resolution '{s}'")))
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for Resolution {
    type Err = RenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Number of video frames needed to cover `duration_sec` at `fps`.
pub fn total_frames(duration_sec: f64, fps: u32) -> u64 {
    if !duration_sec.is_finite() || duration_sec <= 0.0 {
        return 0;
    }
    (duration_sec * f64::from(fps)).ceil() as u64
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/core.rs"]
mod tests;
