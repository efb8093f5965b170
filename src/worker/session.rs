use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::encode::output::{AudioBlock, EncodeSettings, KillHandle, MediaOutput, OutputFactory};
use crate::raster::{Bitmap, VideoFrame, draw_cover};
use crate::worker::{KillSlot, StartJob, WorkerCommand, WorkerEvent, WorkerMessage};

/// Staleness is polled after every this many video frames.
pub(crate) const STALE_CHECK_INTERVAL: u64 = 10;

const PROGRESS_FRAMES_START: u8 = 5;
const PROGRESS_FRAMES_END: u8 = 90;
const PROGRESS_AUDIO: u8 = 92;
const PROGRESS_FINALIZE: u8 = 95;
const PROGRESS_DONE: u8 = 100;

/// Lifecycle of the worker's single encode session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Encoding,
    Finalizing,
    Complete,
    Cancelled,
    Error,
}

/// How a job stopped short of completing.
#[derive(Debug)]
enum JobFailure {
    /// Aborted or superseded by a newer generation.
    Cancelled,
    Failed(String),
}

/// The one active encode inside a worker.
///
/// `generation` only grows. Every staleness check compares the job's own generation against
/// it, so work belonging to a superseded job can never reach a newer job's output.
pub struct RenderSession {
    state: SessionState,
    generation: u64,
    aborted: bool,
    output: Option<Box<dyn MediaOutput>>,
}

impl Default for RenderSession {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            generation: 0,
            aborted: false,
            output: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Supersede whatever is running and return the new generation.
    pub fn begin(&mut self) -> u64 {
        self.cancel_output();
        self.generation += 1;
        self.aborted = false;
        self.state = SessionState::Idle;
        self.generation
    }

    pub fn abort(&mut self) {
        self.aborted = true;
        self.cancel_output();
    }

    /// `true` when work tagged with `generation` must not continue.
    pub fn is_stale(&self, generation: u64) -> bool {
        self.aborted || generation != self.generation
    }

    fn cancel_output(&mut self) {
        if let Some(mut out) = self.output.take() {
            out.cancel();
        }
    }
}

/// Runs on the worker thread: processes commands one at a time and owns the session.
pub(crate) struct WorkerLoop {
    commands: Receiver<WorkerCommand>,
    events: Sender<WorkerMessage>,
    factory: Arc<dyn OutputFactory>,
    /// Kill handle of the output the current job opened, shared with the controller.
    kill: KillSlot,
    session: RenderSession,
    /// A start received while another job was running, already assigned its generation.
    pending: Option<(u64, Box<StartJob>)>,
}

impl WorkerLoop {
    pub(crate) fn new(
        commands: Receiver<WorkerCommand>,
        events: Sender<WorkerMessage>,
        factory: Arc<dyn OutputFactory>,
        kill: KillSlot,
    ) -> Self {
        Self {
            commands,
            events,
            factory,
            kill,
            session: RenderSession::new(),
            pending: None,
        }
    }

    pub(crate) fn run(mut self) {
        loop {
            let (generation, job) = match self.pending.take() {
                Some(p) => p,
                None => match self.commands.recv() {
                    Ok(WorkerCommand::Start(job)) => (self.session.begin(), job),
                    Ok(WorkerCommand::Abort) => {
                        self.session.abort();
                        continue;
                    }
                    Err(_) => break,
                },
            };
            self.run_job(generation, job);
        }
        self.session.cancel_output();
        tracing::debug!("encoding worker exiting");
    }

    fn run_job(&mut self, generation: u64, job: Box<StartJob>) {
        self.session.state = SessionState::Encoding;
        tracing::info!(
            generation,
            total_frames = job.total_frames,
            width = job.settings.width,
            height = job.settings.height,
            "encode started"
        );

        let result = self.encode(generation, job);
        // Nothing left for the controller to kill once the job settles.
        self.arm_kill(None);
        let event = match result {
            Ok(bytes) => {
                self.session.state = SessionState::Complete;
                tracing::info!(generation, bytes = bytes.len(), "encode complete");
                WorkerEvent::Complete(bytes)
            }
            Err(JobFailure::Cancelled) => {
                self.release_failed_output(generation);
                tracing::info!(generation, "encode cancelled");
                WorkerEvent::Cancelled
            }
            Err(JobFailure::Failed(msg)) => {
                self.release_failed_output(generation);
                tracing::warn!(generation, error = %msg, "encode failed");
                WorkerEvent::Error(msg)
            }
        };
        self.emit(generation, event);
    }

    /// Failure path cleanup. Only touches the session if it still belongs to this job.
    fn release_failed_output(&mut self, generation: u64) {
        if generation != self.session.generation {
            return;
        }
        self.session.cancel_output();
        if self.session.state != SessionState::Complete {
            self.session.state = if self.session.aborted {
                SessionState::Cancelled
            } else {
                SessionState::Error
            };
        }
    }

    fn encode(&mut self, generation: u64, job: Box<StartJob>) -> Result<Vec<u8>, JobFailure> {
        let StartJob {
            bitmap,
            channels,
            sample_rate,
            frame_count,
            settings,
            total_frames,
        } = *job;

        // Drawn once; every frame reuses it. The bitmap is released here.
        let frame = draw_bitmap(bitmap, &settings).map_err(JobFailure::Failed)?;

        let output = self
            .factory
            .open(&settings)
            .map_err(|e| JobFailure::Failed(e.to_string()))?;
        self.arm_kill(output.kill_handle());
        self.session.output = Some(output);
        self.check_live(generation)?;

        let fps = f64::from(settings.fps);
        let frame_duration = 1.0 / fps;
        let mut last_pct = None;
        for i in 0..total_frames {
            self.output(generation)?
                .add_video_frame(&frame, i as f64 / fps, frame_duration)
                .map_err(|e| JobFailure::Failed(e.to_string()))?;

            if (i + 1) % STALE_CHECK_INTERVAL == 0 {
                self.check_live(generation)?;
            }

            let pct = frames_progress(i + 1, total_frames);
            if last_pct != Some(pct) {
                last_pct = Some(pct);
                self.emit(generation, WorkerEvent::Progress(pct));
            }
        }
        drop(frame);

        self.check_live(generation)?;
        self.emit(generation, WorkerEvent::Progress(PROGRESS_AUDIO));
        let block = AudioBlock::from_channels(&channels, sample_rate, 0.0);
        drop(channels);
        if block.frames != frame_count {
            return Err(JobFailure::Failed(format!(
                "audio frame count mismatch: header says {frame_count}, channels hold {}",
                block.frames
            )));
        }
        self.output(generation)?
            .add_audio(block)
            .map_err(|e| JobFailure::Failed(e.to_string()))?;

        self.check_live(generation)?;
        self.session.state = SessionState::Finalizing;
        self.emit(generation, WorkerEvent::Progress(PROGRESS_FINALIZE));
        let mut output = self
            .session
            .output
            .take()
            .ok_or(JobFailure::Cancelled)?;
        let bytes = match output.finalize() {
            Ok(b) => b,
            Err(e) => {
                output.cancel();
                return Err(JobFailure::Failed(e.to_string()));
            }
        };
        drop(output);

        self.emit(generation, WorkerEvent::Progress(PROGRESS_DONE));
        Ok(bytes)
    }

    fn output(&mut self, generation: u64) -> Result<&mut Box<dyn MediaOutput>, JobFailure> {
        if self.session.is_stale(generation) {
            return Err(JobFailure::Cancelled);
        }
        self.session.output.as_mut().ok_or(JobFailure::Cancelled)
    }

    /// Process queued commands, then fail with `Cancelled` if this job went stale.
    fn check_live(&mut self, generation: u64) -> Result<(), JobFailure> {
        loop {
            match self.commands.try_recv() {
                Ok(WorkerCommand::Start(job)) => {
                    let next = self.session.begin();
                    tracing::debug!(superseded = generation, next, "start received mid-encode");
                    self.pending = Some((next, job));
                }
                Ok(WorkerCommand::Abort) => self.session.abort(),
                Err(TryRecvError::Empty) => break,
                // The controller is gone; nobody is waiting for this output.
                Err(TryRecvError::Disconnected) => {
                    self.session.abort();
                    break;
                }
            }
        }
        if self.session.is_stale(generation) {
            return Err(JobFailure::Cancelled);
        }
        Ok(())
    }

    fn arm_kill(&self, handle: Option<KillHandle>) {
        *crate::worker::lock_kill_slot(&self.kill) = handle;
    }

    fn emit(&self, generation: u64, event: WorkerEvent) {
        let _ = self.events.send(WorkerMessage { generation, event });
    }
}

fn draw_bitmap(bitmap: Bitmap, settings: &EncodeSettings) -> Result<VideoFrame, String> {
    draw_cover(bitmap, settings.dimensions()).map_err(|e| e.to_string())
}

/// Progress across the frame loop, scaled into 5..=90.
pub(crate) fn frames_progress(done: u64, total: u64) -> u8 {
    if total == 0 {
        return PROGRESS_FRAMES_END;
    }
    let span = u64::from(PROGRESS_FRAMES_END - PROGRESS_FRAMES_START);
    let pct = u64::from(PROGRESS_FRAMES_START) + span * done.min(total) / total;
    pct as u8
}

#[cfg(test)]
#[path = "../../tests/unit/worker/session.rs"]
mod tests;
