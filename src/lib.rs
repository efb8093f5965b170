//! Stillreel renders a static cover image over mixed audio into an MP4.
//!
//! The pipeline has three stages:
//!
//! - Mix: fetch, decode, trim, resample and loop a playlist of tracks ([`mix_tracks`])
//! - Encode: a background worker draws the cover once and muxes frames + audio ([`worker`])
//! - Patch: rewrite encoder-stamped metadata in place ([`patch_metadata`])
//!
//! [`Renderer::render_video`] ties them together behind one cancellable call.
#![forbid(unsafe_code)]

mod foundation;

/// Audio decode and mixing.
pub mod audio;
pub mod config;
/// Encoder/muxer outputs.
pub mod encode;
pub mod fetch;
pub mod patch;
pub mod raster;
pub mod renderer;
/// Background encoding worker and its message protocol.
pub mod worker;

pub use crate::foundation::cancel::CancelToken;
pub use crate::foundation::core::{
    AUDIO_BITRATE, Dimensions, FPS, KEY_FRAME_INTERVAL_SEC, MIX_CHANNELS, MIX_SAMPLE_RATE,
    Resolution, total_frames,
};
pub use crate::foundation::error::{RenderError, RenderResultT};

pub use crate::audio::decode::{AudioDecoder, DecodedAudio, SymphoniaDecoder};
pub use crate::audio::mix::{MixedAudio, mix_tracks, resample_linear, resampled_length};
pub use crate::config::{RenderConfig, TimelineTrack};
pub use crate::encode::ffmpeg::{FfmpegOutput, FfmpegOutputFactory, is_ffmpeg_on_path};
pub use crate::encode::output::{
    AudioBlock, AudioCodec, EncodeSettings, HardwareAcceleration, KillHandle, MediaOutput,
    MemoryOutputFactory, MemoryOutputOpts, OutputFactory, OutputRecord, VideoCodec,
};
pub use crate::fetch::{FetchFailure, Fetcher, HttpFetcher, MemoryFetcher};
pub use crate::patch::{PATCH_TABLE, patch_metadata};
pub use crate::raster::{Bitmap, VideoFrame, cover_fit_crop, draw_cover, load_bitmap};
pub use crate::renderer::{
    DecoderFactory, MP4_MIME_TYPE, RenderResult, Renderer, RendererOpts, output_filename,
};
pub use crate::worker::{
    EncodingWorker, RenderSession, SessionState, StartJob, WorkerCommand, WorkerEvent,
    WorkerHandle, WorkerMessage,
};
