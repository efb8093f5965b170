use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::encode::output::{
    AudioBlock, AudioCodec, EncodeSettings, HardwareAcceleration, KillHandle, MediaOutput,
    OutputFactory, VideoCodec,
};
use crate::foundation::error::{RenderError, RenderResultT};
use crate::raster::VideoFrame;

/// Opens [`FfmpegOutput`]s backed by the system `ffmpeg` binary.
#[derive(Clone, Debug)]
pub struct FfmpegOutputFactory {
    program: PathBuf,
}

impl Default for FfmpegOutputFactory {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
        }
    }
}

impl FfmpegOutputFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific `ffmpeg` executable instead of the one on `PATH`.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }
}

impl OutputFactory for FfmpegOutputFactory {
    fn open(&self, settings: &EncodeSettings) -> RenderResultT<Box<dyn MediaOutput>> {
        Ok(Box::new(FfmpegOutput::open(&self.program, settings.clone())?))
    }
}

/// MP4 output that streams raw RGBA frames into an `ffmpeg` video encode, then muxes the audio
/// block in a second pass on `finalize` and reads the finished file back into memory.
///
/// Intermediate files live in a temporary directory removed when the output is dropped. The
/// running `ffmpeg` process sits in a slot shared with the [`KillHandle`], so it can be killed
/// while a write or wait on it is blocked.
pub struct FfmpegOutput {
    program: PathBuf,
    settings: EncodeSettings,
    workdir: tempfile::TempDir,

    child: Arc<Mutex<Option<Child>>>,
    killed: Arc<AtomicBool>,
    stdin: Option<ChildStdin>,
    stderr_drain: Option<StderrDrain>,

    last_ts: Option<f64>,
    audio_path: Option<PathBuf>,
}

impl FfmpegOutput {
    pub fn open(program: &Path, settings: EncodeSettings) -> RenderResultT<Self> {
        settings.validate()?;
        if !is_ffmpeg_available(program) {
            return Err(RenderError::encode(
                "ffmpeg is required for MP4 encoding, but was not found on PATH",
            ));
        }

        let workdir = tempfile::Builder::new()
            .prefix("stillreel-")
            .tempdir()
            .map_err(|e| RenderError::encode(format!("failed to create temp dir: {e}")))?;
        let video_path = workdir.path().join("video.mp4");

        let mut cmd = Command::new(program);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd.args([
            "-y",
            "-loglevel",
            "error",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgba",
            "-s",
            &format!("{}x{}", settings.width, settings.height),
            "-r",
            &settings.fps.to_string(),
            "-i",
            "pipe:0",
            "-an",
            "-c:v",
            video_encoder_name(settings.video_codec, settings.hardware_acceleration),
            "-b:v",
            &settings.video_bitrate.to_string(),
            "-g",
            &settings.key_frame_interval_frames().to_string(),
            "-pix_fmt",
            "yuv420p",
        ])
        .arg(&video_path);

        tracing::debug!(?cmd, "spawning ffmpeg video encode");
        let child = Arc::new(Mutex::new(None));
        let (stdin, stderr_drain) = spawn_tracked(&child, &mut cmd)?;
        let stdin =
            stdin.ok_or_else(|| RenderError::encode("failed to open ffmpeg stdin (unexpected)"))?;

        Ok(Self {
            program: program.to_path_buf(),
            settings,
            workdir,
            child,
            killed: Arc::new(AtomicBool::new(false)),
            stdin: Some(stdin),
            stderr_drain: Some(stderr_drain),
            last_ts: None,
            audio_path: None,
        })
    }

    /// Poll the tracked process until it exits. Fails once the kill handle has fired.
    fn wait_tracked(&self) -> RenderResultT<ExitStatus> {
        loop {
            if self.killed.load(Ordering::Acquire) {
                return Err(RenderError::encode("ffmpeg was killed"));
            }
            {
                let mut slot = lock_child(&self.child);
                let Some(child) = slot.as_mut() else {
                    return Err(RenderError::encode("ffmpeg process is not running"));
                };
                let exited = child.try_wait().map_err(|e| {
                    RenderError::encode(format!("failed to wait for ffmpeg to finish: {e}"))
                })?;
                if let Some(status) = exited {
                    slot.take();
                    return Ok(status);
                }
            }
            std::thread::sleep(CHILD_POLL);
        }
    }

    fn wait_video_encode(&mut self) -> RenderResultT<()> {
        drop(self.stdin.take());
        let drain = self
            .stderr_drain
            .take()
            .ok_or_else(|| RenderError::encode("ffmpeg output already finalized"))?;
        let status = self.wait_tracked();
        let stderr_bytes = join_drain(drain)?;
        let status = status?;

        if !status.success() {
            return Err(RenderError::encode(format!(
                "ffmpeg exited with status {}: {}",
                status,
                String::from_utf8_lossy(&stderr_bytes).trim()
            )));
        }
        Ok(())
    }

    fn mux_audio(&self, video_path: &Path, audio_path: &Path) -> RenderResultT<PathBuf> {
        let out_path = self.workdir.path().join("out.mp4");
        let s = &self.settings;
        let mut cmd = Command::new(&self.program);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .args(["-y", "-loglevel", "error", "-i"])
            .arg(video_path)
            .args([
                "-f",
                "f32le",
                "-ar",
                &s.audio_sample_rate.to_string(),
                "-ac",
                &s.audio_channels.to_string(),
                "-i",
            ])
            .arg(audio_path)
            .args([
                "-map",
                "0:v:0",
                "-map",
                "1:a:0",
                "-c:v",
                "copy",
                "-c:a",
                audio_encoder_name(s.audio_codec),
                "-b:a",
                &s.audio_bitrate.to_string(),
                "-movflags",
                "+faststart",
            ])
            .arg(&out_path);

        tracing::debug!(?cmd, "spawning ffmpeg mux pass");
        let (_, drain) = spawn_tracked(&self.child, &mut cmd)?;
        let status = self.wait_tracked();
        let stderr_bytes = join_drain(drain)?;
        let status = status?;
        if !status.success() {
            return Err(RenderError::encode(format!(
                "ffmpeg mux pass exited with status {}: {}",
                status,
                String::from_utf8_lossy(&stderr_bytes).trim()
            )));
        }
        Ok(out_path)
    }
}

impl MediaOutput for FfmpegOutput {
    fn add_video_frame(
        &mut self,
        frame: &VideoFrame,
        timestamp_sec: f64,
        _duration_sec: f64,
    ) -> RenderResultT<()> {
        // Frame timing is implied by the constant input rate given to ffmpeg.
        if let Some(last) = self.last_ts
            && timestamp_sec <= last
        {
            return Err(RenderError::encode(
                "ffmpeg output received out-of-order frame timestamp",
            ));
        }
        if frame.width != self.settings.width || frame.height != self.settings.height {
            return Err(RenderError::validation(format!(
                "frame size mismatch: got {}x{}, expected {}x{}",
                frame.width, frame.height, self.settings.width, self.settings.height
            )));
        }
        if frame.data.len() != (frame.width as usize) * (frame.height as usize) * 4 {
            return Err(RenderError::validation(
                "frame.data size mismatch with width*height*4",
            ));
        }

        let Some(stdin) = self.stdin.as_mut() else {
            return Err(RenderError::encode("ffmpeg output is already finalized"));
        };
        stdin.write_all(&frame.data).map_err(|e| {
            RenderError::encode(format!("failed to write frame to ffmpeg stdin: {e}"))
        })?;
        self.last_ts = Some(timestamp_sec);
        Ok(())
    }

    fn add_audio(&mut self, block: AudioBlock) -> RenderResultT<()> {
        if self.audio_path.is_some() {
            return Err(RenderError::encode("audio block already added"));
        }
        if block.timestamp_sec != 0.0 {
            return Err(RenderError::encode(
                "ffmpeg output only supports an audio block at timestamp 0",
            ));
        }
        if block.channels != self.settings.audio_channels
            || block.sample_rate != self.settings.audio_sample_rate
        {
            return Err(RenderError::validation(format!(
                "audio block format {} Hz x{} does not match output {} Hz x{}",
                block.sample_rate,
                block.channels,
                self.settings.audio_sample_rate,
                self.settings.audio_channels
            )));
        }

        let path = self.workdir.path().join("audio.f32le");
        let bytes = interleave_f32le(&block);
        std::fs::write(&path, bytes).map_err(|e| {
            RenderError::encode(format!(
                "failed to write audio samples '{}': {e}",
                path.display()
            ))
        })?;
        self.audio_path = Some(path);
        Ok(())
    }

    fn finalize(&mut self) -> RenderResultT<Vec<u8>> {
        self.wait_video_encode()?;
        let video_path = self.workdir.path().join("video.mp4");
        let final_path = match self.audio_path.as_deref() {
            Some(audio_path) => self.mux_audio(&video_path, audio_path)?,
            None => video_path,
        };
        std::fs::read(&final_path).map_err(|e| {
            RenderError::encode(format!(
                "failed to read encoded output '{}': {e}",
                final_path.display()
            ))
        })
    }

    fn cancel(&mut self) {
        drop(self.stdin.take());
        self.killed.store(true, Ordering::Release);
        kill_child(&self.child);
        if let Some(handle) = self.stderr_drain.take() {
            let _ = handle.join();
        }
    }

    fn kill_handle(&self) -> Option<KillHandle> {
        let child = Arc::clone(&self.child);
        let killed = Arc::clone(&self.killed);
        Some(Arc::new(move || {
            killed.store(true, Ordering::Release);
            if kill_child(&child) {
                tracing::warn!("killed ffmpeg process of an unresponsive encode");
            }
        }))
    }
}

impl Drop for FfmpegOutput {
    fn drop(&mut self) {
        self.cancel();
    }
}

type StderrDrain = JoinHandle<std::io::Result<Vec<u8>>>;

const CHILD_POLL: Duration = Duration::from_millis(10);

fn lock_child(slot: &Mutex<Option<Child>>) -> MutexGuard<'_, Option<Child>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Spawn `cmd` into `slot`, draining its stderr on a helper thread.
fn spawn_tracked(
    slot: &Mutex<Option<Child>>,
    cmd: &mut Command,
) -> RenderResultT<(Option<ChildStdin>, StderrDrain)> {
    let mut child = cmd.spawn().map_err(|e| {
        RenderError::encode(format!(
            "failed to spawn ffmpeg (is it installed and on PATH?): {e}"
        ))
    })?;
    let stdin = child.stdin.take();
    let Some(mut stderr) = child.stderr.take() else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(RenderError::encode(
            "failed to open ffmpeg stderr (unexpected)",
        ));
    };
    let drain = std::thread::spawn(move || {
        let mut stderr_bytes = Vec::new();
        stderr.read_to_end(&mut stderr_bytes)?;
        Ok(stderr_bytes)
    });
    *lock_child(slot) = Some(child);
    Ok((stdin, drain))
}

fn join_drain(drain: StderrDrain) -> RenderResultT<Vec<u8>> {
    drain
        .join()
        .map_err(|_| RenderError::encode("ffmpeg stderr drain thread panicked"))?
        .map_err(|e| RenderError::encode(format!("ffmpeg stderr read failed: {e}")))
}

/// Kill and reap whatever process is in `slot`. Returns `true` if there was one.
fn kill_child(slot: &Mutex<Option<Child>>) -> bool {
    let Some(mut child) = lock_child(slot).take() else {
        return false;
    };
    let _ = child.kill();
    let _ = child.wait();
    true
}

fn video_encoder_name(codec: VideoCodec, hw: HardwareAcceleration) -> &'static str {
    let hardware = hw == HardwareAcceleration::PreferHardware && cfg!(target_os = "macos");
    match (codec, hardware) {
        (VideoCodec::Avc, false) => "libx264",
        (VideoCodec::Avc, true) => "h264_videotoolbox",
        (VideoCodec::Hevc, false) => "libx265",
        (VideoCodec::Hevc, true) => "hevc_videotoolbox",
    }
}

fn audio_encoder_name(codec: AudioCodec) -> &'static str {
    match codec {
        AudioCodec::Aac => "aac",
        AudioCodec::Opus => "libopus",
    }
}

/// Channel-major planar block to interleaved little-endian `f32` bytes.
fn interleave_f32le(block: &AudioBlock) -> Vec<u8> {
    let channels = usize::from(block.channels);
    let mut bytes = Vec::with_capacity(block.planar.len() * 4);
    for i in 0..block.frames {
        for ch in 0..channels {
            bytes.extend_from_slice(&block.planar[ch * block.frames + i].to_le_bytes());
        }
    }
    bytes
}

/// Return `true` when `program -version` runs successfully.
pub fn is_ffmpeg_available(program: &Path) -> bool {
    Command::new(program)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Return `true` when `ffmpeg` can be invoked from `PATH`.
pub fn is_ffmpeg_on_path() -> bool {
    is_ffmpeg_available(Path::new("ffmpeg"))
}
