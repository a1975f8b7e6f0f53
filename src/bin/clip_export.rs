use anyhow::{bail, Context, Result};
use cardboard_inspect::recording::{sidecar_path, ClipReader};
use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use image::codecs::jpeg::JpegEncoder;
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "clip-export")]
#[command(about = "Export a recorded clip as individual images with JSON metadata")]
#[command(version)]
struct Args {
    /// Clip file to export
    clip: PathBuf,

    /// Output directory (defaults to <clip>_frames next to the clip)
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value_t = ImageFormat::Png)]
    format: ImageFormat,

    /// JPEG quality (1-100)
    #[arg(long, default_value_t = 90, value_parser = clap::value_parser!(u8).range(1..=100))]
    quality: u8,

    /// Export every Nth frame
    #[arg(long, default_value_t = 1)]
    every: u64,

    #[arg(short, long)]
    debug: bool,
}

#[derive(Serialize)]
struct ExportedFrame {
    index: u64,
    timestamp: String,
    file: String,
}

#[derive(Serialize)]
struct ExportMetadata {
    clip: String,
    fps: f64,
    width: u32,
    height: u32,
    pixel_format: String,
    frames_in_clip: u64,
    frames: Vec<ExportedFrame>,
    /// Sidecar written when the recording was closed, if present
    recording: Option<serde_json::Value>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("clip_export={}", level))),
        )
        .compact()
        .init();

    if args.every == 0 {
        bail!("--every must be at least 1");
    }

    let output = args.output.clone().unwrap_or_else(|| default_output(&args.clip));
    let metadata = export(&args, &output)?;

    let metadata_path = output.join("metadata.json");
    let writer = BufWriter::new(
        File::create(&metadata_path)
            .with_context(|| format!("Failed to create {}", metadata_path.display()))?,
    );
    serde_json::to_writer_pretty(writer, &metadata).context("Failed to write metadata")?;

    info!(
        "Exported {} of {} frames to {}",
        metadata.frames.len(),
        metadata.frames_in_clip,
        output.display()
    );
    Ok(())
}

fn default_output(clip: &Path) -> PathBuf {
    let stem = clip
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "clip".to_string());
    clip.with_file_name(format!("{}_frames", stem))
}

fn export(args: &Args, output: &Path) -> Result<ExportMetadata> {
    let mut reader = ClipReader::open(&args.clip)
        .with_context(|| format!("Failed to open clip {}", args.clip.display()))?;
    let header = *reader.header();
    std::fs::create_dir_all(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;

    info!(
        "Exporting {} ({}x{} {:?} @ {:.2} fps)",
        args.clip.display(),
        header.width,
        header.height,
        header.format,
        header.fps
    );

    let mut frames = Vec::new();
    let mut index = 0u64;
    while let Some(frame) = reader
        .next_frame()
        .with_context(|| format!("Failed to read frame {}", index))?
    {
        if index % args.every == 0 {
            let name = format!("frame_{:06}.{}", index, args.format.extension());
            let path = output.join(&name);
            write_image(&frame.to_image()?, &path, args.format, args.quality)?;
            frames.push(ExportedFrame {
                index,
                timestamp: DateTime::<Utc>::from(frame.timestamp).to_rfc3339(),
                file: name,
            });
        }
        index += 1;
    }

    let recording = match std::fs::read_to_string(sidecar_path(&args.clip)) {
        Ok(text) => match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring unreadable sidecar: {}", e);
                None
            }
        },
        Err(_) => None,
    };

    Ok(ExportMetadata {
        clip: args.clip.display().to_string(),
        fps: header.fps,
        width: header.width,
        height: header.height,
        pixel_format: format!("{:?}", header.format),
        frames_in_clip: index,
        frames,
        recording,
    })
}

fn write_image(image: &image::DynamicImage, path: &Path, format: ImageFormat, quality: u8) -> Result<()> {
    match format {
        ImageFormat::Png => image
            .save_with_format(path, image::ImageFormat::Png)
            .with_context(|| format!("Failed to write {}", path.display())),
        ImageFormat::Jpeg => {
            let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
            let mut encoder = JpegEncoder::new_with_quality(BufWriter::new(file), quality);
            encoder
                .encode_image(&image.to_rgb8())
                .with_context(|| format!("Failed to encode {}", path.display()))
        }
    }
}
