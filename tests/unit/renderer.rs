use std::io::Cursor;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use super::*;
use crate::config::TimelineTrack;
use crate::encode::output::{
    AudioBlock, KillHandle, MediaOutput, MemoryOutputFactory, MemoryOutputOpts,
};
use crate::fetch::MemoryFetcher;
use crate::raster::VideoFrame;

const COVER: &str = "https://cdn.test/cover.png";
const SONG_A: &str = "https://cdn.test/a.wav";
const SONG_B: &str = "https://cdn.test/b.wav";

fn png(w: u32, h: u32) -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(w, h, image::Rgba([30, 60, 90, 255]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

fn wav(sample_rate: u32, channels: u16, secs: f64, value: i16) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let frames = (secs * f64::from(sample_rate)).round() as usize;
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut w = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for _ in 0..frames * usize::from(channels) {
            w.write_sample(value).unwrap();
        }
        w.finalize().unwrap();
    }
    cursor.into_inner()
}

fn fetcher_with(song_secs: f64) -> Arc<MemoryFetcher> {
    let f = MemoryFetcher::new();
    f.insert(COVER, png(64, 48));
    f.insert(SONG_A, wav(44_100, 2, song_secs, 16_384));
    f.insert(SONG_B, wav(48_000, 1, 0.2, 16_384));
    Arc::new(f)
}

fn config(resolution: Resolution) -> RenderConfig {
    let mut cfg = RenderConfig::new(
        COVER,
        vec![
            TimelineTrack::new(SONG_A),
            TimelineTrack::new(SONG_B).with_volume(0.5),
        ],
    );
    cfg.resolution = resolution;
    cfg.video_title = "My Song!".to_string();
    cfg
}

fn fast_opts() -> RendererOpts {
    RendererOpts {
        worker_timeout: Duration::from_secs(30),
        poll_interval: Duration::from_millis(5),
        ..RendererOpts::default()
    }
}

#[test]
fn renders_patches_and_names_output() {
    let outputs = MemoryOutputFactory::default();
    let renderer = Renderer::new(fetcher_with(0.4), Arc::new(outputs.clone())).with_opts(fast_opts());

    let mut progress = Vec::new();
    let res = renderer
        .render_video(&config(Resolution::P1080), &CancelToken::new(), &mut |p| {
            progress.push(p)
        })
        .unwrap();

    assert_eq!(res.filename, "My_Song_1080p.mp4");
    assert_eq!(res.mime_type, "video/mp4");
    assert!(res.data.windows(13).any(|w| w == b"VideoHandler\0"));
    assert!(!res.data.windows(10).any(|w| w == b"Mediabunny"));

    assert_eq!(&progress[..3], &[1, 2, 5]);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
    assert_eq!(progress.last(), Some(&100));

    let rec = &outputs.records()[0];
    let settings = rec.settings.as_ref().unwrap();
    assert_eq!((settings.width, settings.height), (1920, 1080));
    assert_eq!(settings.video_bitrate, 8_000_000);
    assert_eq!(settings.audio_bitrate, 192_000);

    // 0.4 s + 0.2 s of audio at 30 fps.
    assert_eq!(rec.frame_timestamps.len(), 18);
    let audio = rec.audio.as_ref().unwrap();
    assert_eq!(audio.frames, 19_200 + 9_600);
    assert!((audio.channel(0)[100] - 0.5).abs() < 1e-3);
    // Second track: mono at half volume, on both channels.
    assert!((audio.channel(0)[19_200 + 100] - 0.25).abs() < 1e-3);
    assert!((audio.channel(1)[19_200 + 100] - 0.25).abs() < 1e-3);
}

#[test]
fn cancelled_before_start_touches_nothing() {
    let outputs = MemoryOutputFactory::default();
    let renderer = Renderer::new(fetcher_with(0.4), Arc::new(outputs.clone()));
    let cancel = CancelToken::new();
    cancel.cancel();

    let mut progress = Vec::new();
    let err = renderer
        .render_video(&config(Resolution::P720), &cancel, &mut |p| progress.push(p))
        .unwrap_err();
    assert!(err.is_abort());
    assert!(progress.is_empty());
    assert!(outputs.records().is_empty());
}

#[test]
fn cancel_during_encode_settles_as_aborted() {
    let outputs = MemoryOutputFactory::new(MemoryOutputOpts {
        frame_delay: Duration::from_millis(5),
        ..MemoryOutputOpts::default()
    });
    let renderer =
        Renderer::new(fetcher_with(3.0), Arc::new(outputs.clone())).with_opts(fast_opts());
    let cancel = CancelToken::new();
    let trigger = cancel.clone();

    let err = renderer
        .render_video(&config(Resolution::P720), &cancel, &mut |p| {
            if p > 5 {
                trigger.cancel();
            }
        })
        .unwrap_err();
    assert!(matches!(err, RenderError::Aborted), "{err}");

    let rec = &outputs.records()[0];
    assert!(rec.cancelled);
    assert!(!rec.finalized);
}

#[test]
fn unresponsive_worker_is_terminated_after_grace() {
    let outputs = MemoryOutputFactory::new(MemoryOutputOpts {
        frame_delay: Duration::from_secs(3),
        ..MemoryOutputOpts::default()
    });
    let renderer =
        Renderer::new(fetcher_with(1.0), Arc::new(outputs.clone())).with_opts(RendererOpts {
            abort_grace: Duration::from_millis(50),
            ..fast_opts()
        });
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let opened = outputs.clone();
    std::thread::spawn(move || {
        while opened.records().is_empty() {
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(100));
        trigger.cancel();
    });

    let started = Instant::now();
    let err = renderer
        .render_video(&config(Resolution::P720), &cancel, &mut |_| {})
        .unwrap_err();
    assert!(err.is_abort(), "{err}");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(outputs.records()[0].killed);
}

#[test]
fn hung_worker_times_out() {
    let outputs = MemoryOutputFactory::new(MemoryOutputOpts {
        frame_delay: Duration::from_millis(50),
        ..MemoryOutputOpts::default()
    });
    let renderer = Renderer::new(fetcher_with(2.0), Arc::new(outputs)).with_opts(RendererOpts {
        worker_timeout: Duration::from_millis(100),
        ..fast_opts()
    });

    let err = renderer
        .render_video(&config(Resolution::P720), &CancelToken::new(), &mut |_| {})
        .unwrap_err();
    assert!(matches!(err, RenderError::Timeout(d) if d == Duration::from_millis(100)));
}

#[test]
fn encoder_error_carries_message() {
    let outputs = MemoryOutputFactory::new(MemoryOutputOpts {
        fail_on_frame: Some(2),
        ..MemoryOutputOpts::default()
    });
    let renderer = Renderer::new(fetcher_with(0.4), Arc::new(outputs)).with_opts(fast_opts());

    let err = renderer
        .render_video(&config(Resolution::P720), &CancelToken::new(), &mut |_| {})
        .unwrap_err();
    let RenderError::Encode(msg) = &err else {
        panic!("expected encode error, got {err}");
    };
    assert!(msg.contains("injected failure at frame 2"), "{msg}");
}

struct ExplodingFactory;

struct ExplodingOutput;

impl OutputFactory for ExplodingFactory {
    fn open(&self, _settings: &EncodeSettings) -> RenderResultT<Box<dyn MediaOutput>> {
        Ok(Box::new(ExplodingOutput))
    }
}

impl MediaOutput for ExplodingOutput {
    fn add_video_frame(&mut self, _: &VideoFrame, _: f64, _: f64) -> RenderResultT<()> {
        panic!("encoder exploded");
    }
    fn add_audio(&mut self, _: AudioBlock) -> RenderResultT<()> {
        Ok(())
    }
    fn finalize(&mut self) -> RenderResultT<Vec<u8>> {
        Ok(Vec::new())
    }
    fn cancel(&mut self) {}
}

#[test]
fn worker_panic_is_a_crash_not_an_encode_error() {
    let renderer = Renderer::new(fetcher_with(0.4), Arc::new(ExplodingFactory)).with_opts(fast_opts());
    let err = renderer
        .render_video(&config(Resolution::P720), &CancelToken::new(), &mut |_| {})
        .unwrap_err();
    let RenderError::WorkerCrashed(reason) = &err else {
        panic!("expected crash, got {err}");
    };
    assert!(reason.contains("encoder exploded"), "{reason}");
}

/// Flags shared between a test and the [`HangingOutput`] it drives.
#[derive(Clone, Default)]
struct Hang {
    opened: Arc<AtomicBool>,
    killed: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
}

impl Hang {
    fn wait_for_cancel(&self) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if self.cancelled.load(Ordering::SeqCst) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

impl OutputFactory for Hang {
    fn open(&self, _settings: &EncodeSettings) -> RenderResultT<Box<dyn MediaOutput>> {
        self.opened.store(true, Ordering::SeqCst);
        Ok(Box::new(HangingOutput(self.clone())))
    }
}

/// Blocks in its first frame, ignoring the worker's poll points, until killed.
struct HangingOutput(Hang);

impl MediaOutput for HangingOutput {
    fn add_video_frame(&mut self, _: &VideoFrame, _: f64, _: f64) -> RenderResultT<()> {
        while !self.0.killed.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(2));
        }
        Err(RenderError::encode("encoder killed"))
    }
    fn add_audio(&mut self, _: AudioBlock) -> RenderResultT<()> {
        Ok(())
    }
    fn finalize(&mut self) -> RenderResultT<Vec<u8>> {
        Ok(Vec::new())
    }
    fn cancel(&mut self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
    }
    fn kill_handle(&self) -> Option<KillHandle> {
        let killed = Arc::clone(&self.0.killed);
        Some(Arc::new(move || killed.store(true, Ordering::SeqCst)))
    }
}

#[test]
fn timed_out_encoder_is_killed_and_released() {
    let hang = Hang::default();
    let renderer = Renderer::new(fetcher_with(1.0), Arc::new(hang.clone())).with_opts(RendererOpts {
        worker_timeout: Duration::from_secs(3),
        ..fast_opts()
    });

    let err = renderer
        .render_video(&config(Resolution::P720), &CancelToken::new(), &mut |_| {})
        .unwrap_err();
    assert!(matches!(err, RenderError::Timeout(_)), "{err}");
    assert!(hang.killed.load(Ordering::SeqCst));
    assert!(hang.wait_for_cancel(), "hung output was never released");
}

#[test]
fn ignored_abort_kills_encoder_after_grace() {
    let hang = Hang::default();
    let renderer = Renderer::new(fetcher_with(1.0), Arc::new(hang.clone())).with_opts(RendererOpts {
        abort_grace: Duration::from_millis(50),
        ..fast_opts()
    });
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let opened = Arc::clone(&hang.opened);
    std::thread::spawn(move || {
        while !opened.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(100));
        trigger.cancel();
    });

    let err = renderer
        .render_video(&config(Resolution::P720), &cancel, &mut |_| {})
        .unwrap_err();
    assert!(matches!(err, RenderError::Aborted), "{err}");
    assert!(hang.killed.load(Ordering::SeqCst));
    assert!(hang.wait_for_cancel(), "hung output was never released");
}

#[test]
fn missing_cover_is_a_network_error() {
    let fetcher = MemoryFetcher::new();
    fetcher.insert(SONG_A, wav(44_100, 2, 0.4, 100));
    let renderer = Renderer::new(Arc::new(fetcher), Arc::new(MemoryOutputFactory::default()));

    let err = renderer
        .render_video(&config(Resolution::P720), &CancelToken::new(), &mut |_| {})
        .unwrap_err();
    assert!(
        matches!(&err, RenderError::Network { resource, status: 404 } if resource == "cover image"),
        "{err}"
    );
}

#[test]
fn blank_tracks_are_rejected() {
    let renderer = Renderer::new(fetcher_with(0.4), Arc::new(MemoryOutputFactory::default()));
    let cfg = RenderConfig::new(COVER, vec![TimelineTrack::new(""), TimelineTrack::new("  ")]);
    let err = renderer
        .render_video(&cfg, &CancelToken::new(), &mut |_| {})
        .unwrap_err();
    assert!(matches!(err, RenderError::NoUsableTracks));
}

#[test]
fn custom_decoder_factory_is_used() {
    struct Silence(Arc<Mutex<usize>>);
    impl AudioDecoder for Silence {
        fn decode(
            &mut self,
            _bytes: Vec<u8>,
            _hint: Option<&str>,
        ) -> RenderResultT<crate::audio::decode::DecodedAudio> {
            if let Ok(mut n) = self.0.lock() {
                *n += 1;
            }
            Ok(crate::audio::decode::DecodedAudio {
                sample_rate: 48_000,
                channels: vec![vec![0.0; 4_800]],
            })
        }
    }

    let calls = Arc::new(Mutex::new(0));
    let seen = Arc::clone(&calls);
    let outputs = MemoryOutputFactory::default();
    let renderer = Renderer::new(fetcher_with(0.4), Arc::new(outputs.clone()))
        .with_decoder_factory(move || Box::new(Silence(Arc::clone(&seen))) as Box<dyn AudioDecoder>)
        .with_opts(fast_opts());

    renderer
        .render_video(&config(Resolution::P720), &CancelToken::new(), &mut |_| {})
        .unwrap();
    assert_eq!(*calls.lock().unwrap(), 2);
    // Two 0.1 s tracks.
    assert_eq!(outputs.records()[0].frame_timestamps.len(), 6);
}

#[test]
fn filename_sanitizing() {
    assert_eq!(output_filename("My Song", Resolution::P1080), "My_Song_1080p.mp4");
    assert_eq!(output_filename("  Lo-Fi // Beats!! ", Resolution::K4), "Lo_Fi_Beats_4k.mp4");
    assert_eq!(output_filename("", Resolution::P720), "video_720p.mp4");
    assert_eq!(output_filename("***", Resolution::P1440), "video_1440p.mp4");
    assert_eq!(output_filename("Café", Resolution::P720), "Caf_720p.mp4");
}
