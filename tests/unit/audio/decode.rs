use super::*;

fn wav_bytes(sample_rate: u32, channels: u16, frames: &[i16]) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut w = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &s in frames {
            w.write_sample(s).unwrap();
        }
        w.finalize().unwrap();
    }
    cursor.into_inner()
}

#[test]
fn decodes_stereo_wav_to_planar() {
    // Interleaved L/R: left constant 0.5, right constant -0.5.
    let mut interleaved = Vec::new();
    for _ in 0..1000 {
        interleaved.push(16384i16);
        interleaved.push(-16384i16);
    }
    let bytes = wav_bytes(44_100, 2, &interleaved);

    let mut dec = SymphoniaDecoder::new();
    let audio = dec.decode(bytes, Some("wav")).unwrap();
    assert_eq!(audio.sample_rate, 44_100);
    assert_eq!(audio.num_channels(), 2);
    assert_eq!(audio.len(), 1000);
    assert!(audio.channels[0].iter().all(|s| (s - 0.5).abs() < 1e-3));
    assert!(audio.channels[1].iter().all(|s| (s + 0.5).abs() < 1e-3));
    assert!((audio.duration_sec() - 1000.0 / 44_100.0).abs() < 1e-9);
}

#[test]
fn one_decoder_handles_payloads_sequentially() {
    let mut dec = SymphoniaDecoder::new();
    let a = dec.decode(wav_bytes(8_000, 1, &[0; 800]), None).unwrap();
    let b = dec.decode(wav_bytes(16_000, 1, &[0; 320]), Some("wav")).unwrap();
    assert_eq!((a.sample_rate, a.len()), (8_000, 800));
    assert_eq!((b.sample_rate, b.len()), (16_000, 320));
    assert_eq!(dec.decoded_payloads, 2);
}

#[test]
fn garbage_is_a_decode_error() {
    let mut dec = SymphoniaDecoder::new();
    let err = dec.decode(b"definitely not audio".to_vec(), None).unwrap_err();
    assert!(matches!(err, RenderError::Decode(_)));
}

#[test]
fn extension_hint_ignores_query_and_fragment() {
    assert_eq!(extension_hint("https://cdn/x/song.mp3?token=abc"), Some("mp3"));
    assert_eq!(extension_hint("media/loop.wav#t=3"), Some("wav"));
    assert_eq!(extension_hint("https://cdn/x/stream"), None);
    assert_eq!(extension_hint("https://cdn.example/track"), None);
}
