//! frametap CLI
//!
//! Diagnostic front end for the frame access core: probe stream metadata,
//! extract single frames to PNG, or replay a playback request pattern to
//! check real-time throughput.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use frametap::decoder::hwaccel::detect_hw_accel;
use frametap::{load_settings, probe_stream, DecodeOptions, TimeCode, VideoSession};

#[derive(Parser, Debug)]
#[command(name = "frametap")]
#[command(about = "Timestamp-addressed frame access over an external ffmpeg decoder")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Settings file (JSON with comments)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Disable the hardware decode path
    #[arg(long)]
    no_hwaccel: bool,

    /// Frame cache capacity in entries (0 = derive from resolution)
    #[arg(long, default_value = "0")]
    cache_size: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print stream metadata and available hardware decoders
    Probe { file: PathBuf },

    /// Decode one frame and write it as PNG
    Extract {
        file: PathBuf,

        /// Timestamp in seconds
        #[arg(long, default_value = "0")]
        at: f64,

        /// Output path
        #[arg(short, long, default_value = "frame.png")]
        output: PathBuf,
    },

    /// Replay a sequential playback pattern and report throughput
    Bench {
        file: PathBuf,

        /// Seconds of media to play through
        #[arg(long, default_value = "5.0")]
        seconds: f64,

        /// Playback start position in seconds
        #[arg(long, default_value = "0")]
        start: f64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    let mut options = match &args.settings {
        Some(path) => load_settings(path)
            .with_context(|| format!("reading settings from {}", path.display()))?,
        None => DecodeOptions::default(),
    };
    if args.no_hwaccel {
        options.hardware_decode = false;
    }
    if args.cache_size > 0 {
        options.max_cache_size = args.cache_size;
    }

    match args.command {
        Command::Probe { file } => probe(file).await,
        Command::Extract { file, at, output } => extract(file, at, output, options).await,
        Command::Bench { file, seconds, start } => bench(file, seconds, start, options).await,
    }
}

async fn probe(file: PathBuf) -> anyhow::Result<()> {
    let info = probe_stream(&file).await?;
    println!("{}", file.display());
    println!("  resolution: {}x{}", info.width, info.height);
    println!("  frame rate: {:.3} fps", info.frame_rate);
    println!("  duration:   {}", info.duration);
    let accel = detect_hw_accel();
    if accel.is_empty() {
        println!("  hwaccel:    none detected");
    } else {
        let names: Vec<_> = accel.iter().map(|a| a.as_arg()).collect();
        println!("  hwaccel:    {}", names.join(", "));
    }
    Ok(())
}

async fn extract(
    file: PathBuf,
    at: f64,
    output: PathBuf,
    options: DecodeOptions,
) -> anyhow::Result<()> {
    let session = VideoSession::open(&file, options).await?;
    let frame = session.get_frame(TimeCode::from_secs_f64(at)).await?;
    info!(time = %frame.time(), "decoded frame");

    let rgba = bgra_to_rgba(frame.data());
    let image = image::RgbaImage::from_raw(frame.width(), frame.height(), rgba)
        .ok_or_else(|| anyhow!("frame buffer does not match its geometry"))?;
    image
        .save(&output)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("{} -> {}", frame.time(), output.display());

    session.close().await;
    Ok(())
}

async fn bench(
    file: PathBuf,
    seconds: f64,
    start: f64,
    options: DecodeOptions,
) -> anyhow::Result<()> {
    let session = VideoSession::open(&file, options).await?;
    let fps = session.info().frame_rate;
    let frame_interval = Duration::from_secs_f64(1.0 / fps);
    let total_frames = (seconds * fps) as u32;

    let mut served = 0u32;
    let mut slow = 0u32;
    let began = Instant::now();
    for i in 0..total_frames {
        let t = TimeCode::from_secs_f64(start) + TimeCode::from_frames(i, fps);
        let request_began = Instant::now();
        session.get_frame(t).await?;
        served += 1;
        let elapsed = request_began.elapsed();
        if elapsed > frame_interval {
            slow += 1;
        } else {
            tokio::time::sleep(frame_interval - elapsed).await;
        }
    }
    let wall = began.elapsed().as_secs_f64();

    println!("served {served} frames in {wall:.2}s ({:.1} fps)", served as f64 / wall);
    println!("late frames: {slow}");
    if let Some(buffered) = session.buffered_until() {
        println!("decoded ahead to: {buffered}");
    }

    session.close().await;
    Ok(())
}

/// The pipe carries BGRA; image wants RGBA.
fn bgra_to_rgba(bgra: &[u8]) -> Vec<u8> {
    let mut rgba = bgra.to_vec();
    for px in rgba.chunks_exact_mut(4) {
        px.swap(0, 2);
    }
    rgba
}
