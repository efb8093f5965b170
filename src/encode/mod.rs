//! Encoding outputs.
//!
//! An output receives the static video frames in timestamp order, one planar audio block, and
//! produces the finished container bytes on `finalize`.

/// `ffmpeg`-based MP4 output (system `ffmpeg`).
pub mod ffmpeg;
/// Output trait, encode settings and the in-memory output.
pub mod output;
