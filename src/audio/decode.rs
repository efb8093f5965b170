use std::io::Cursor;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::foundation::error::{RenderError, RenderResultT};

/// Planar PCM at the source's native rate.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedAudio {
    pub sample_rate: u32,
    /// One buffer per channel, all the same length.
    pub channels: Vec<Vec<f32>>,
}

impl DecodedAudio {
    /// Samples per channel.
    pub fn len(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Native duration in seconds.
    pub fn duration_sec(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.len() as f64 / f64::from(self.sample_rate)
    }
}

/// Turns a compressed or container-wrapped payload into planar PCM.
///
/// The mixer drives one decoder instance strictly sequentially; implementations do not need to
/// be re-entrant.
pub trait AudioDecoder: Send {
    /// `hint` is a file extension (`"mp3"`, `"wav"`, ..) when one is known.
    fn decode(&mut self, bytes: Vec<u8>, hint: Option<&str>) -> RenderResultT<DecodedAudio>;
}

/// Decoder backed by symphonia's default probe and codec registry.
#[derive(Default)]
pub struct SymphoniaDecoder {
    decoded_payloads: u64,
}

impl SymphoniaDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioDecoder for SymphoniaDecoder {
    fn decode(&mut self, bytes: Vec<u8>, hint: Option<&str>) -> RenderResultT<DecodedAudio> {
        let byte_len = bytes.len();
        let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

        let mut probe_hint = Hint::new();
        if let Some(ext) = hint {
            probe_hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &probe_hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| RenderError::decode(format!("unrecognized audio payload: {e}")))?;
        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| RenderError::decode("payload has no audio track"))?;
        let track_id = track.id;
        let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);

        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| RenderError::decode(format!("unsupported audio codec: {e}")))?;

        let mut channels: Vec<Vec<f32>> = Vec::new();
        let mut sample_buf: Option<SampleBuffer<f32>> = None;

        loop {
            let packet = match format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(SymphoniaError::ResetRequired) => break,
                Err(e) => return Err(RenderError::decode(format!("demux failed: {e}"))),
            };
            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(d) => d,
                // A corrupt packet is dropped; the rest of the stream is still usable.
                Err(SymphoniaError::DecodeError(msg)) => {
                    tracing::warn!(msg, "skipping undecodable audio packet");
                    continue;
                }
                Err(e) => return Err(RenderError::decode(format!("decode failed: {e}"))),
            };

            let spec = *decoded.spec();
            if sample_rate == 0 {
                sample_rate = spec.rate;
            }
            let n_ch = spec.channels.count();
            if n_ch == 0 {
                continue;
            }
            if channels.is_empty() {
                channels = vec![Vec::new(); n_ch];
            }

            let needed = decoded.capacity() * n_ch;
            if sample_buf.as_ref().is_none_or(|b| b.capacity() < needed) {
                sample_buf = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
            }
            let Some(buf) = sample_buf.as_mut() else {
                continue;
            };
            buf.copy_interleaved_ref(decoded);

            for frame in buf.samples().chunks_exact(n_ch) {
                for (ch, plane) in channels.iter_mut().enumerate() {
                    plane.push(frame[ch.min(n_ch - 1)]);
                }
            }
        }

        if sample_rate == 0 {
            return Err(RenderError::decode("audio payload has unknown sample rate"));
        }

        self.decoded_payloads += 1;
        let out = DecodedAudio {
            sample_rate,
            channels,
        };
        tracing::debug!(
            bytes = byte_len,
            sample_rate,
            channels = out.num_channels(),
            frames = out.len(),
            payload = self.decoded_payloads,
            "decoded audio payload"
        );
        Ok(out)
    }
}

/// File extension of a URL or path, ignoring query strings and fragments.
pub fn extension_hint(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.rsplit('/').next().unwrap_or(path);
    let (_, ext) = file.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 {
        return None;
    }
    Some(ext)
}

#[cfg(test)]
#[path = "../../tests/unit/audio/decode.rs"]
mod tests;
