use crate::audio::decode::{AudioDecoder, DecodedAudio, extension_hint};
use crate::config::TimelineTrack;
use crate::fetch::Fetcher;
use crate::foundation::cancel::CancelToken;
use crate::foundation::core::{MIX_CHANNELS, MIX_SAMPLE_RATE};
use crate::foundation::error::{RenderError, RenderResultT};

/// Output of the mixer: planar stereo at [`MIX_SAMPLE_RATE`].
///
/// Handed to the encoding worker by value; the sender keeps no reference to the sample memory.
#[derive(Clone, Debug, PartialEq)]
pub struct MixedAudio {
    /// Exactly [`MIX_CHANNELS`] buffers, each `frame_count` samples long.
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
    pub frame_count: usize,
    /// `frame_count / sample_rate`, in seconds.
    pub duration: f64,
}

impl MixedAudio {
    fn from_channels(channels: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        let frame_count = channels.first().map_or(0, Vec::len);
        Self {
            duration: frame_count as f64 / f64::from(sample_rate),
            channels,
            sample_rate,
            frame_count,
        }
    }
}

/// A decoded track ready for mixing.
#[derive(Clone, Debug)]
pub(crate) struct PreparedTrack {
    pub(crate) audio: DecodedAudio,
    /// `track.volume * master_volume`.
    pub(crate) gain: f32,
    pub(crate) trim_start_sec: f64,
    pub(crate) trim_end_sec: f64,
}

/// Fetch, decode, trim, resample and sequence `tracks` into one looped stereo buffer.
///
/// Tracks play back-to-back in list order within one pass, and the whole pass repeats
/// `loop_count` times. Cancellation is only observed before the fetch starts.
#[tracing::instrument(skip_all, fields(tracks = tracks.len(), loop_count = loop_count))]
pub fn mix_tracks(
    tracks: &[TimelineTrack],
    master_volume: f32,
    loop_count: u32,
    cancel: &CancelToken,
    fetcher: &dyn Fetcher,
    decoder: &mut dyn AudioDecoder,
) -> RenderResultT<MixedAudio> {
    let usable: Vec<(usize, &TimelineTrack)> = tracks
        .iter()
        .enumerate()
        .filter(|(_, t)| t.has_source())
        .collect();
    if usable.is_empty() {
        return Err(RenderError::NoUsableTracks);
    }

    cancel.check()?;

    let payloads = fetch_all(&usable, fetcher)?;

    // One decoder, one payload at a time.
    let mut prepared = Vec::with_capacity(payloads.len());
    for ((idx, track), bytes) in usable.iter().zip(payloads) {
        let audio = decoder
            .decode(bytes, extension_hint(&track.audio_url))
            .map_err(|e| {
                RenderError::decode(format!("track {} ({}): {e}", idx + 1, track.audio_url))
            })?;
        tracing::debug!(
            track = idx + 1,
            sample_rate = audio.sample_rate,
            channels = audio.num_channels(),
            duration_sec = audio.duration_sec(),
            "track decoded"
        );
        prepared.push(PreparedTrack {
            audio,
            gain: track.volume * master_volume,
            trim_start_sec: track.trim_start,
            trim_end_sec: track.trim_end,
        });
    }

    let mixed = mix_prepared(&prepared, loop_count)?;
    tracing::info!(
        frames = mixed.frame_count,
        duration_sec = mixed.duration,
        "audio mixed"
    );
    Ok(mixed)
}

fn fetch_all(
    usable: &[(usize, &TimelineTrack)],
    fetcher: &dyn Fetcher,
) -> RenderResultT<Vec<Vec<u8>>> {
    std::thread::scope(|scope| -> RenderResultT<Vec<Vec<u8>>> {
        let handles: Vec<_> = usable
            .iter()
            .map(|&(idx, track)| {
                let url = track.audio_url.as_str();
                (idx, url, scope.spawn(move || fetcher.fetch(url)))
            })
            .collect();

        let mut out = Vec::with_capacity(handles.len());
        for (idx, url, handle) in handles {
            let resource = format!("track {} ({url})", idx + 1);
            let bytes = handle
                .join()
                .map_err(|_| RenderError::fetch(format!("fetch thread for {resource} panicked")))?
                .map_err(|f| f.into_render_error(resource))?;
            out.push(bytes);
        }
        Ok(out)
    })
}

/// Sequence already-decoded tracks into a looped stereo buffer at [`MIX_SAMPLE_RATE`].
pub(crate) fn mix_prepared(
    tracks: &[PreparedTrack],
    loop_count: u32,
) -> RenderResultT<MixedAudio> {
    // (gain, per-output-channel resampled span)
    let mut spans: Vec<(f32, Vec<Vec<f32>>)> = Vec::with_capacity(tracks.len());
    for t in tracks {
        let Some(span) = resample_track(t) else {
            tracing::debug!("track trimmed to zero samples, skipping");
            continue;
        };
        spans.push((t.gain, span));
    }

    let single_pass: usize = spans.iter().map(|(_, s)| s[0].len()).sum();
    let total = single_pass
        .checked_mul(loop_count as usize)
        .ok_or_else(|| RenderError::validation("mixed audio length overflows"))?;
    if total == 0 {
        return Err(RenderError::ZeroDuration);
    }

    let mut out = vec![vec![0.0f32; total]; MIX_CHANNELS];
    for lp in 0..loop_count as usize {
        let mut write_offset = lp * single_pass;
        for (gain, span) in &spans {
            let len = span[0].len();
            for (dst, src) in out.iter_mut().zip(span) {
                for (d, s) in dst[write_offset..write_offset + len].iter_mut().zip(src) {
                    *d += s * gain;
                }
            }
            write_offset += len;
        }
    }

    for ch in &mut out {
        for s in ch.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }
    }

    Ok(MixedAudio::from_channels(out, MIX_SAMPLE_RATE))
}

/// Trim and resample one track into [`MIX_CHANNELS`] spans. `None` when nothing is left.
fn resample_track(t: &PreparedTrack) -> Option<Vec<Vec<f32>>> {
    let audio = &t.audio;
    if audio.is_empty() || audio.sample_rate == 0 || audio.num_channels() == 0 {
        return None;
    }
    let rate = f64::from(audio.sample_rate);
    let trim_start = secs_to_samples(t.trim_start_sec, rate);
    let trim_end = secs_to_samples(t.trim_end_sec, rate);
    let usable = audio.len().saturating_sub(trim_start.saturating_add(trim_end));
    if usable == 0 {
        return None;
    }
    let resampled_len = resampled_length(usable, audio.sample_rate, MIX_SAMPLE_RATE);
    if resampled_len == 0 {
        return None;
    }

    let span = (0..MIX_CHANNELS)
        .map(|ch| {
            // Mono (or narrower) sources repeat their last channel.
            let src = &audio.channels[ch.min(audio.num_channels() - 1)];
            resample_linear(src, trim_start, usable, resampled_len)
        })
        .collect();
    Some(span)
}

fn secs_to_samples(sec: f64, rate: f64) -> usize {
    if !sec.is_finite() || sec <= 0.0 {
        return 0;
    }
    (sec * rate).floor() as usize
}

/// Length of `usable` source samples once converted from `src_rate` to `dst_rate`.
pub fn resampled_length(usable: usize, src_rate: u32, dst_rate: u32) -> usize {
    if src_rate == 0 {
        return 0;
    }
    ((usable as f64) * f64::from(dst_rate) / f64::from(src_rate)).round() as usize
}

/// Linear-interpolation resampler over `src[start .. start + usable]`.
///
/// Destination sample `i` reads source position `start + i * usable / out_len`, blending the
/// floor and ceil neighbours. Indices are clamped to `src`'s bounds.
pub fn resample_linear(src: &[f32], start: usize, usable: usize, out_len: usize) -> Vec<f32> {
    if src.is_empty() || out_len == 0 {
        return Vec::new();
    }
    let last = src.len() - 1;
    let step = usable as f64 / out_len as f64;
    (0..out_len)
        .map(|i| {
            let pos = start as f64 + i as f64 * step;
            let i0 = (pos.floor() as usize).min(last);
            let i1 = (i0 + 1).min(last);
            let frac = (pos - i0 as f64).clamp(0.0, 1.0) as f32;
            let s0 = src[i0];
            let s1 = src[i1];
            s0 + (s1 - s0) * frac
        })
        .collect()
}

#[cfg(test)]
#[path = "../../tests/unit/audio/mix.rs"]
mod tests;
