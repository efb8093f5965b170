use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;

use crate::audio::decode::{AudioDecoder, SymphoniaDecoder};
use crate::audio::mix::mix_tracks;
use crate::config::RenderConfig;
use crate::encode::output::{EncodeSettings, OutputFactory};
use crate::fetch::Fetcher;
use crate::foundation::cancel::CancelToken;
use crate::foundation::core::{FPS, Resolution, total_frames};
use crate::foundation::error::{RenderError, RenderResultT};
use crate::patch::patch_metadata;
use crate::raster::load_bitmap;
use crate::worker::{EncodingWorker, StartJob, WorkerCommand, WorkerEvent, WorkerHandle};

pub const MP4_MIME_TYPE: &str = "video/mp4";

/// Builds a fresh decoder for each render.
pub type DecoderFactory = Arc<dyn Fn() -> Box<dyn AudioDecoder> + Send + Sync>;

/// Orchestrator timing knobs.
#[derive(Clone, Debug, PartialEq)]
pub struct RendererOpts {
    pub fps: u32,
    /// Ceiling on waiting for the worker's terminal event.
    pub worker_timeout: Duration,
    /// How long an aborted worker gets to wind down before it is terminated.
    pub abort_grace: Duration,
    /// How often the cancel token is polled while the worker runs.
    pub poll_interval: Duration,
}

impl Default for RendererOpts {
    fn default() -> Self {
        Self {
            fps: FPS,
            worker_timeout: Duration::from_secs(10 * 60),
            abort_grace: Duration::from_millis(500),
            poll_interval: Duration::from_millis(25),
        }
    }
}

/// A finished, patched container ready to be saved or served.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderResult {
    pub data: Vec<u8>,
    /// Suggested download name, e.g. `My_Song_1080p.mp4`.
    pub filename: String,
    pub mime_type: &'static str,
}

/// Turns a [`RenderConfig`] into an MP4: image load, audio mix, then a background encode.
///
/// One worker per call; nothing is pooled or queued here.
pub struct Renderer {
    fetcher: Arc<dyn Fetcher>,
    decoders: DecoderFactory,
    outputs: Arc<dyn OutputFactory>,
    opts: RendererOpts,
}

impl Renderer {
    pub fn new(fetcher: Arc<dyn Fetcher>, outputs: Arc<dyn OutputFactory>) -> Self {
        Self {
            fetcher,
            decoders: Arc::new(|| Box::new(SymphoniaDecoder::new()) as Box<dyn AudioDecoder>),
            outputs,
            opts: RendererOpts::default(),
        }
    }

    pub fn with_decoder_factory(
        mut self,
        factory: impl Fn() -> Box<dyn AudioDecoder> + Send + Sync + 'static,
    ) -> Self {
        self.decoders = Arc::new(factory);
        self
    }

    pub fn with_opts(mut self, opts: RendererOpts) -> Self {
        self.opts = opts;
        self
    }

    pub fn opts(&self) -> &RendererOpts {
        &self.opts
    }

    /// Render `config` to an in-memory MP4.
    ///
    /// `on_progress` receives percentages in `0..=100`, non-decreasing. Settles exactly once:
    /// [`RenderError::Aborted`] when `cancel` fires, [`RenderError::Timeout`] when the worker
    /// hangs, [`RenderError::WorkerCrashed`] when the worker thread dies without reporting.
    #[tracing::instrument(
        skip_all,
        fields(resolution = %config.resolution, tracks = config.tracks.len())
    )]
    pub fn render_video(
        &self,
        config: &RenderConfig,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(u8),
    ) -> RenderResultT<RenderResult> {
        cancel.check()?;
        config.validate()?;
        if self.opts.fps == 0 {
            return Err(RenderError::validation("fps must be non-zero"));
        }

        let cover = self
            .fetcher
            .fetch(&config.cover_image_url)
            .map_err(|f| f.into_render_error("cover image"))?;
        let bitmap = load_bitmap(&cover)?;
        drop(cover);
        tracing::debug!(
            width = bitmap.width(),
            height = bitmap.height(),
            "cover image loaded"
        );
        on_progress(1);

        on_progress(2);
        let mut decoder = (self.decoders)();
        let mixed = mix_tracks(
            &config.tracks,
            config.master_volume,
            config.loop_count,
            cancel,
            self.fetcher.as_ref(),
            decoder.as_mut(),
        )?;
        drop(decoder);
        on_progress(5);
        cancel.check()?;

        let total_frames = total_frames(mixed.duration, self.opts.fps);
        let mut settings = EncodeSettings::for_resolution(config.resolution);
        settings.fps = self.opts.fps;
        settings.validate()?;
        tracing::info!(
            total_frames,
            duration_sec = mixed.duration,
            fps = settings.fps,
            "starting encode"
        );

        let mut worker = EncodingWorker::spawn(Arc::clone(&self.outputs))?;
        worker.post(WorkerCommand::Start(Box::new(StartJob {
            bitmap,
            channels: mixed.channels,
            sample_rate: mixed.sample_rate,
            frame_count: mixed.frame_count,
            settings,
            total_frames,
        })))?;

        let mut data = self.await_worker(&mut worker, cancel, on_progress)?;
        drop(worker);

        let patched = patch_metadata(&mut data);
        tracing::info!(bytes = data.len(), patched, "render complete");
        Ok(RenderResult {
            data,
            filename: output_filename(&config.video_title, config.resolution),
            mime_type: MP4_MIME_TYPE,
        })
    }

    /// Relay worker events until one is terminal, the caller cancels, or time runs out.
    fn await_worker(
        &self,
        worker: &mut WorkerHandle,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(u8),
    ) -> RenderResultT<Vec<u8>> {
        let deadline = Instant::now() + self.opts.worker_timeout;
        loop {
            if cancel.is_cancelled() {
                self.abort_worker(worker);
                return Err(RenderError::Aborted);
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(timeout = ?self.opts.worker_timeout, "worker timed out");
                worker.terminate();
                return Err(RenderError::Timeout(self.opts.worker_timeout));
            }

            match worker.recv_timeout(self.opts.poll_interval.min(deadline - now)) {
                Ok(msg) => match msg.event {
                    WorkerEvent::Progress(pct) => on_progress(pct),
                    WorkerEvent::Complete(data) => return Ok(data),
                    WorkerEvent::Cancelled => return Err(RenderError::Aborted),
                    WorkerEvent::Error(msg) => return Err(RenderError::encode(msg)),
                },
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    let reason = worker
                        .join()
                        .unwrap_or_else(|| "worker exited without a result".to_string());
                    tracing::error!(%reason, "encoding worker crashed");
                    return Err(RenderError::worker_crashed(reason));
                }
            }
        }
    }

    /// Ask the worker to stop, give it the grace period, then terminate it regardless.
    fn abort_worker(&self, worker: &mut WorkerHandle) {
        tracing::info!("render cancelled, aborting worker");
        if worker.post(WorkerCommand::Abort).is_ok() {
            let grace_end = Instant::now() + self.opts.abort_grace;
            loop {
                let now = Instant::now();
                if now >= grace_end {
                    tracing::warn!(grace = ?self.opts.abort_grace, "worker ignored abort");
                    break;
                }
                match worker.recv_timeout(grace_end - now) {
                    Ok(msg) if msg.event.is_terminal() => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
        worker.terminate();
    }
}

/// Download name for a render: title sanitized to `[A-Za-z0-9_]`, then the resolution label.
///
/// Runs of other characters become one `_`, edge underscores are trimmed and an empty result
/// falls back to `video`.
pub fn output_filename(title: &str, resolution: Resolution) -> String {
    let mut stem = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            stem.push(c);
        } else if !stem.ends_with('_') {
            stem.push('_');
        }
    }
    let stem = stem.trim_matches('_');
    let stem = if stem.is_empty() { "video" } else { stem };
    format!("{stem}_{}.mp4", resolution.label())
}

#[cfg(test)]
#[path = "../tests/unit/renderer.rs"]
mod tests;
