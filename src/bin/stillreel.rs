use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "stillreel", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render a cover image + playlist config to MP4 (requires `ffmpeg` on PATH).
    Render(RenderArgs),
    /// Rewrite encoder handler names in an existing MP4.
    Patch(PatchArgs),
    /// List resolution presets.
    Presets,
}

#[derive(Parser, Debug)]
struct RenderArgs {
    /// Render config JSON.
    #[arg(long)]
    config: PathBuf,

    /// Output MP4 path. Defaults to the sanitized title in the current directory.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Override the config's resolution preset.
    #[arg(long, value_parser = parse_resolution)]
    resolution: Option<stillreel::Resolution>,

    /// Override the config's loop count.
    #[arg(long)]
    loops: Option<u32>,

    /// Override the config's master volume.
    #[arg(long)]
    master_volume: Option<f32>,

    /// ffmpeg executable.
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    /// Give up on the encoder after this many seconds.
    #[arg(long, default_value_t = 600)]
    timeout_secs: u64,
}

#[derive(Parser, Debug)]
struct PatchArgs {
    /// Input MP4.
    #[arg(long = "in")]
    in_path: PathBuf,

    /// Output path. Defaults to patching in place.
    #[arg(long)]
    out: Option<PathBuf>,
}

fn parse_resolution(s: &str) -> Result<stillreel::Resolution, String> {
    stillreel::Resolution::parse(s).map_err(|e| e.to_string())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Render(args) => cmd_render(args),
        Command::Patch(args) => cmd_patch(args),
        Command::Presets => cmd_presets(),
    }
}

fn cmd_render(args: RenderArgs) -> anyhow::Result<()> {
    let mut config = stillreel::RenderConfig::from_json_file(&args.config)?;
    if let Some(r) = args.resolution {
        config.resolution = r;
    }
    if let Some(n) = args.loops {
        config.loop_count = n;
    }
    if let Some(v) = args.master_volume {
        config.master_volume = v;
    }
    config.validate()?;

    if !stillreel::encode::ffmpeg::is_ffmpeg_available(&args.ffmpeg) {
        anyhow::bail!("'{}' not found or not runnable", args.ffmpeg.display());
    }

    let renderer = stillreel::Renderer::new(
        Arc::new(stillreel::HttpFetcher::new()),
        Arc::new(stillreel::FfmpegOutputFactory::new().with_program(&args.ffmpeg)),
    )
    .with_opts(stillreel::RendererOpts {
        worker_timeout: Duration::from_secs(args.timeout_secs),
        ..stillreel::RendererOpts::default()
    });

    let cancel = stillreel::CancelToken::new();
    let mut last_reported = None;
    let result = renderer
        .render_video(&config, &cancel, &mut |pct| {
            let bucket = pct / 10;
            if last_reported != Some(bucket) {
                last_reported = Some(bucket);
                eprintln!("progress {pct}%");
            }
        })
        .with_context(|| format!("render '{}'", args.config.display()))?;

    let out = args.out.unwrap_or_else(|| PathBuf::from(&result.filename));
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir '{}'", parent.display()))?;
    }
    std::fs::write(&out, &result.data)
        .with_context(|| format!("write mp4 '{}'", out.display()))?;

    eprintln!("wrote {} ({} bytes)", out.display(), result.data.len());
    Ok(())
}

fn cmd_patch(args: PatchArgs) -> anyhow::Result<()> {
    let mut data = std::fs::read(&args.in_path)
        .with_context(|| format!("read '{}'", args.in_path.display()))?;
    let applied = stillreel::patch_metadata(&mut data);

    let out = args.out.unwrap_or_else(|| args.in_path.clone());
    std::fs::write(&out, &data).with_context(|| format!("write '{}'", out.display()))?;

    eprintln!(
        "patched {applied} of {} handler names, wrote {}",
        stillreel::PATCH_TABLE.len(),
        out.display()
    );
    Ok(())
}

fn cmd_presets() -> anyhow::Result<()> {
    for r in stillreel::Resolution::ALL {
        let d = r.dimensions();
        println!(
            "{:<6} {}x{}  {} kbps",
            r.label(),
            d.width,
            d.height,
            r.video_bitrate() / 1000
        );
    }
    Ok(())
}
