//! Background encoding worker.
//!
//! The worker owns one [`RenderSession`] on a dedicated OS thread and talks to its controller
//! over two channels: [`WorkerCommand`]s in, [`WorkerMessage`]s out. Commands are processed in
//! arrival order. A running encode notices new commands only at its poll points (every
//! [`session::STALE_CHECK_INTERVAL`] frames, after the frame loop, and before finalizing).
//!
//! A worker stuck inside its output never reaches a poll point. For that case the worker
//! publishes the open output's [`KillHandle`] to the controller, and [`WorkerHandle::terminate`]
//! fires it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::encode::output::{EncodeSettings, KillHandle, OutputFactory};
use crate::foundation::error::{RenderError, RenderResultT};
use crate::raster::Bitmap;

pub mod session;

pub use session::{RenderSession, SessionState};

/// Everything one encode needs. Sent by value; the sender keeps nothing.
#[derive(Debug)]
pub struct StartJob {
    pub bitmap: Bitmap,
    /// Planar mixed audio, one buffer per channel.
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
    /// Samples per channel.
    pub frame_count: usize,
    pub settings: EncodeSettings,
    pub total_frames: u64,
}

/// Controller to worker.
#[derive(Debug)]
pub enum WorkerCommand {
    /// Begin a new session, superseding any running one.
    Start(Box<StartJob>),
    Abort,
}

/// Worker to controller.
#[derive(Debug, PartialEq)]
pub enum WorkerEvent {
    /// Percent in `0..=100`, non-decreasing within a job.
    Progress(u8),
    Complete(Vec<u8>),
    Cancelled,
    Error(String),
}

impl WorkerEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }
}

/// A [`WorkerEvent`] tagged with the generation of the job that produced it.
#[derive(Debug, PartialEq)]
pub struct WorkerMessage {
    pub generation: u64,
    pub event: WorkerEvent,
}

pub(crate) type KillSlot = Arc<Mutex<Option<KillHandle>>>;

pub(crate) fn lock_kill_slot(slot: &KillSlot) -> MutexGuard<'_, Option<KillHandle>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Spawns encoding workers.
pub struct EncodingWorker;

impl EncodingWorker {
    pub fn spawn(factory: Arc<dyn OutputFactory>) -> RenderResultT<WorkerHandle> {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (evt_tx, evt_rx) = crossbeam_channel::unbounded();
        let kill = KillSlot::default();
        let worker_kill = Arc::clone(&kill);

        let thread = std::thread::Builder::new()
            .name("stillreel-encoder".to_string())
            .spawn(move || session::WorkerLoop::new(cmd_rx, evt_tx, factory, worker_kill).run())
            .map_err(|e| RenderError::worker_crashed(format!("failed to spawn worker: {e}")))?;

        Ok(WorkerHandle {
            commands: Some(cmd_tx),
            events: evt_rx,
            kill,
            thread: Some(thread),
        })
    }
}

/// Controller side of a worker. Dropping it terminates the worker.
pub struct WorkerHandle {
    commands: Option<Sender<WorkerCommand>>,
    events: Receiver<WorkerMessage>,
    kill: KillSlot,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn post(&self, cmd: WorkerCommand) -> RenderResultT<()> {
        let Some(tx) = self.commands.as_ref() else {
            return Err(RenderError::worker_crashed("worker already terminated"));
        };
        tx.send(cmd)
            .map_err(|_| RenderError::worker_crashed("worker is no longer accepting commands"))
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<WorkerMessage, RecvTimeoutError> {
        self.events.recv_timeout(timeout)
    }

    /// Stop the worker without waiting for it.
    ///
    /// Closes the command channel and kills the output of a job still in flight, so a worker
    /// blocked inside the encoder fails out of it, releases its buffers and exits. The thread
    /// is detached.
    pub fn terminate(&mut self) {
        self.commands = None;
        let kill = lock_kill_slot(&self.kill).take();
        if let Some(kill) = kill {
            tracing::warn!("killing in-flight encoder output");
            kill();
        }
        if self.thread.take().is_some() {
            tracing::debug!("encoding worker terminated");
        }
    }

    /// Wait for the worker thread to exit (after [`Self::close`]) and report a panic, if any.
    pub fn join(&mut self) -> Option<String> {
        let handle = self.thread.take()?;
        match handle.join() {
            Ok(()) => None,
            Err(payload) => Some(panic_message(payload.as_ref())),
        }
    }

    /// Close the command channel so an idle worker exits.
    pub fn close(&mut self) {
        self.commands = None;
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker thread panicked".to_string()
    }
}

#[cfg(test)]
#[path = "../../tests/unit/worker/mod.rs"]
mod tests;
