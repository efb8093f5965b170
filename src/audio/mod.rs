//! Audio decoding and the track mixer.

/// Payload decoding into planar PCM.
pub mod decode;
/// Trim, resample, sequence, loop and clip.
pub mod mix;
