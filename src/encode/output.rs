use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::foundation::core::{
    AUDIO_BITRATE, Dimensions, FPS, KEY_FRAME_INTERVAL_SEC, MIX_CHANNELS, MIX_SAMPLE_RATE,
    Resolution,
};
use crate::foundation::error::{RenderError, RenderResultT};
use crate::raster::VideoFrame;

/// Video codec of the output track.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    Avc,
    Hevc,
}

/// Audio codec of the output track.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    #[default]
    Aac,
    Opus,
}

/// Encoder selection preference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HardwareAcceleration {
    #[default]
    NoPreference,
    PreferHardware,
    PreferSoftware,
}

/// Everything an output needs to open its video and audio tracks.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodeSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub video_codec: VideoCodec,
    /// Bits per second.
    pub video_bitrate: u32,
    pub key_frame_interval_sec: f64,
    pub hardware_acceleration: HardwareAcceleration,
    pub audio_codec: AudioCodec,
    /// Bits per second.
    pub audio_bitrate: u32,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
}

impl EncodeSettings {
    /// Fixed encode parameters for a resolution preset.
    pub fn for_resolution(resolution: Resolution) -> Self {
        let Dimensions { width, height } = resolution.dimensions();
        Self {
            width,
            height,
            fps: FPS,
            video_codec: VideoCodec::Avc,
            video_bitrate: resolution.video_bitrate(),
            key_frame_interval_sec: KEY_FRAME_INTERVAL_SEC,
            hardware_acceleration: HardwareAcceleration::NoPreference,
            audio_codec: AudioCodec::Aac,
            audio_bitrate: AUDIO_BITRATE,
            audio_sample_rate: MIX_SAMPLE_RATE,
            audio_channels: MIX_CHANNELS as u16,
        }
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.width,
            height: self.height,
        }
    }

    /// Key-frame distance in frames (at least 1).
    pub fn key_frame_interval_frames(&self) -> u32 {
        ((self.key_frame_interval_sec * f64::from(self.fps)).round() as u32).max(1)
    }

    pub fn validate(&self) -> RenderResultT<()> {
        if self.width == 0 || self.height == 0 {
            return Err(RenderError::validation(
                "encode width/height must be non-zero",
            ));
        }
        if !self.width.is_multiple_of(2) || !self.height.is_multiple_of(2) {
            // yuv420p output needs even dimensions.
            return Err(RenderError::validation(
                "encode width/height must be even (required for yuv420p mp4 output)",
            ));
        }
        if self.fps == 0 {
            return Err(RenderError::validation("encode fps must be non-zero"));
        }
        if self.video_bitrate == 0 || self.audio_bitrate == 0 {
            return Err(RenderError::validation("encode bitrates must be non-zero"));
        }
        if self.audio_sample_rate == 0 || self.audio_channels == 0 {
            return Err(RenderError::validation(
                "audio sample rate and channel count must be non-zero",
            ));
        }
        if !self.key_frame_interval_sec.is_finite() || self.key_frame_interval_sec <= 0.0 {
            return Err(RenderError::validation(
                "key frame interval must be a positive number of seconds",
            ));
        }
        Ok(())
    }
}

/// One block of planar audio: every channel's samples back-to-back (channel-major).
#[derive(Clone, Debug, PartialEq)]
pub struct AudioBlock {
    pub planar: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
    /// Samples per channel.
    pub frames: usize,
    pub timestamp_sec: f64,
}

impl AudioBlock {
    /// Concatenate channel buffers into one channel-major block.
    pub fn from_channels(channels: &[Vec<f32>], sample_rate: u32, timestamp_sec: f64) -> Self {
        let frames = channels.first().map_or(0, Vec::len);
        let mut planar = Vec::with_capacity(frames * channels.len());
        for ch in channels {
            planar.extend_from_slice(ch);
        }
        Self {
            planar,
            channels: channels.len() as u16,
            sample_rate,
            frames,
            timestamp_sec,
        }
    }

    /// Samples of channel `ch`.
    pub fn channel(&self, ch: usize) -> &[f32] {
        &self.planar[ch * self.frames..(ch + 1) * self.frames]
    }
}

/// A muxed audio+video output that produces an in-memory container.
///
/// Ordering contract: video frames arrive in strictly increasing timestamp order, then one
/// audio block, then `finalize`. `cancel` may be called at any point and is idempotent.
pub trait MediaOutput: Send {
    fn add_video_frame(
        &mut self,
        frame: &VideoFrame,
        timestamp_sec: f64,
        duration_sec: f64,
    ) -> RenderResultT<()>;
    fn add_audio(&mut self, block: AudioBlock) -> RenderResultT<()>;
    /// Flush and close the container, returning its bytes.
    fn finalize(&mut self) -> RenderResultT<Vec<u8>>;
    /// Abandon the output and release its resources.
    fn cancel(&mut self);
    /// A handle that tears this output down from another thread, for when the thread driving
    /// it is stuck inside one of the calls above.
    fn kill_handle(&self) -> Option<KillHandle> {
        None
    }
}

/// Releases an output's external resources without going through its owner.
///
/// Safe to call more than once and while the owner is blocked in the output. Whatever call the
/// owner is stuck in fails soon after.
pub type KillHandle = Arc<dyn Fn() + Send + Sync>;

/// Opens one [`MediaOutput`] per encode session.
pub trait OutputFactory: Send + Sync {
    fn open(&self, settings: &EncodeSettings) -> RenderResultT<Box<dyn MediaOutput>>;
}

/// What an [`InMemoryOutput`] saw, kept after the output itself is gone.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutputRecord {
    pub settings: Option<EncodeSettings>,
    pub frame_timestamps: Vec<f64>,
    pub frame_durations: Vec<f64>,
    pub audio: Option<AudioBlock>,
    pub finalized: bool,
    pub cancelled: bool,
    /// Set when the output's [`KillHandle`] fired.
    pub killed: bool,
}

/// Knobs for [`MemoryOutputFactory`].
#[derive(Clone, Debug, Default)]
pub struct MemoryOutputOpts {
    /// Sleep per video frame (simulates a slow encoder). Cut short by the kill handle.
    pub frame_delay: Duration,
    /// Fail when this frame index is added.
    pub fail_on_frame: Option<u64>,
}

/// Factory for [`InMemoryOutput`]s; keeps every session's [`OutputRecord`].
#[derive(Clone, Debug, Default)]
pub struct MemoryOutputFactory {
    opts: MemoryOutputOpts,
    records: Arc<Mutex<Vec<Arc<Mutex<OutputRecord>>>>>,
}

impl MemoryOutputFactory {
    pub fn new(opts: MemoryOutputOpts) -> Self {
        Self {
            opts,
            records: Arc::default(),
        }
    }

    /// Snapshot of every opened output, oldest first.
    pub fn records(&self) -> Vec<OutputRecord> {
        let Ok(records) = self.records.lock() else {
            return Vec::new();
        };
        records
            .iter()
            .filter_map(|r| r.lock().ok().map(|r| r.clone()))
            .collect()
    }
}

impl OutputFactory for MemoryOutputFactory {
    fn open(&self, settings: &EncodeSettings) -> RenderResultT<Box<dyn MediaOutput>> {
        settings.validate()?;
        let record = Arc::new(Mutex::new(OutputRecord {
            settings: Some(settings.clone()),
            ..OutputRecord::default()
        }));
        self.records
            .lock()
            .map_err(|_| RenderError::encode("memory output registry poisoned"))?
            .push(Arc::clone(&record));
        Ok(Box::new(InMemoryOutput {
            opts: self.opts.clone(),
            record,
            killed: Arc::new(AtomicBool::new(false)),
            frames: 0,
            last_ts: None,
        }))
    }
}

/// Test and debugging output: records calls and emits a small synthetic container.
///
/// The container carries the muxer's handler names so the metadata patcher has something to
/// rewrite.
#[derive(Debug)]
pub struct InMemoryOutput {
    opts: MemoryOutputOpts,
    record: Arc<Mutex<OutputRecord>>,
    killed: Arc<AtomicBool>,
    frames: u64,
    last_ts: Option<f64>,
}

const KILL_POLL: Duration = Duration::from_millis(5);

impl InMemoryOutput {
    fn check_killed(&self) -> RenderResultT<()> {
        if self.killed.load(Ordering::Acquire) {
            return Err(RenderError::encode("memory output was killed"));
        }
        Ok(())
    }

    fn simulate_encode_delay(&self) -> RenderResultT<()> {
        let end = Instant::now() + self.opts.frame_delay;
        loop {
            self.check_killed()?;
            let now = Instant::now();
            if now >= end {
                return Ok(());
            }
            std::thread::sleep(KILL_POLL.min(end - now));
        }
    }

    fn with_record<R>(&self, f: impl FnOnce(&mut OutputRecord) -> R) -> RenderResultT<R> {
        let mut rec = self
            .record
            .lock()
            .map_err(|_| RenderError::encode("memory output record poisoned"))?;
        Ok(f(&mut rec))
    }
}

impl MediaOutput for InMemoryOutput {
    fn add_video_frame(
        &mut self,
        frame: &VideoFrame,
        timestamp_sec: f64,
        duration_sec: f64,
    ) -> RenderResultT<()> {
        self.check_killed()?;
        if self.opts.fail_on_frame == Some(self.frames) {
            return Err(RenderError::encode(format!(
                "injected failure at frame {}",
                self.frames
            )));
        }
        if let Some(last) = self.last_ts
            && timestamp_sec <= last
        {
            return Err(RenderError::encode(
                "memory output received out-of-order frame timestamp",
            ));
        }
        if frame.data.len() != (frame.width as usize) * (frame.height as usize) * 4 {
            return Err(RenderError::validation(
                "frame.data size mismatch with width*height*4",
            ));
        }
        self.simulate_encode_delay()?;
        self.last_ts = Some(timestamp_sec);
        self.frames += 1;
        self.with_record(|r| {
            r.frame_timestamps.push(timestamp_sec);
            r.frame_durations.push(duration_sec);
        })
    }

    fn add_audio(&mut self, block: AudioBlock) -> RenderResultT<()> {
        self.check_killed()?;
        self.with_record(|r| {
            if r.audio.is_some() {
                return Err(RenderError::encode("audio block already added"));
            }
            r.audio = Some(block);
            Ok(())
        })?
    }

    fn finalize(&mut self) -> RenderResultT<Vec<u8>> {
        self.check_killed()?;
        let audio_frames = self.with_record(|r| {
            r.finalized = true;
            r.audio.as_ref().map_or(0, |a| a.frames)
        })?;
        let mut out = Vec::with_capacity(96);
        out.extend_from_slice(b"\0\0\0\x18ftypisom");
        out.extend_from_slice(b"hdlrvide");
        out.extend_from_slice(b"MediabunnyVideoHandler\0");
        out.extend_from_slice(b"hdlrsoun");
        out.extend_from_slice(b"MediabunnySoundHandler\0");
        out.extend_from_slice(&self.frames.to_le_bytes());
        out.extend_from_slice(&(audio_frames as u64).to_le_bytes());
        Ok(out)
    }

    fn cancel(&mut self) {
        let _ = self.with_record(|r| r.cancelled = true);
    }

    fn kill_handle(&self) -> Option<KillHandle> {
        let killed = Arc::clone(&self.killed);
        let record = Arc::clone(&self.record);
        Some(Arc::new(move || {
            killed.store(true, Ordering::Release);
            if let Ok(mut r) = record.lock() {
                r.killed = true;
            }
        }))
    }
}

#[cfg(test)]
#[path = "../../tests/unit/encode/output.rs"]
mod tests;
