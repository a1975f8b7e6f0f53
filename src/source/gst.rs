//! GStreamer capture backend for V4L2/Aravis cameras, RTSP/HTTP streams and
//! encoded video files.

use super::backend::{BackendRead, CaptureBackend};
use super::settings::{CameraTuning, SourceConfig};
use crate::error::CaptureError;
use crate::frame::{Frame, PixelFormat};
use gstreamer::prelude::*;
use gstreamer::{ClockTime, Pipeline, SeekFlags, State};
use gstreamer_app::AppSink;
use gstreamer_video::VideoInfo;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const PULL_TIMEOUT: Duration = Duration::from_secs(2);
const PREROLL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct GstBackend {
    description: String,
    pipeline: Pipeline,
    appsink: AppSink,
    format: PixelFormat,
    width: u32,
    height: u32,
    fps: Option<f64>,
    duration: Option<ClockTime>,
    position: u64,
}

impl GstBackend {
    pub fn open(config: &SourceConfig, selector: &str) -> Result<Self, CaptureError> {
        gstreamer::init().map_err(|e| open_error(config, format!("Failed to initialize GStreamer: {}", e)))?;

        let format = match config.pixel_format() {
            PixelFormat::Mono8 => PixelFormat::Mono8,
            PixelFormat::Bgr24 => PixelFormat::Bgr24,
            _ => PixelFormat::Rgb24,
        };
        let pipeline_desc = format!(
            "{} ! videoconvert ! video/x-raw,format={} ! \
             appsink name=sink sync=false max-buffers=2 drop={}",
            source_element(config, selector),
            caps_format(format),
            !matches!(config, SourceConfig::File(_))
        );
        debug!("Creating GStreamer capture pipeline for {}", config.display_selector());

        let pipeline = gstreamer::parse::launch(&pipeline_desc)
            .map_err(|e| open_error(config, format!("Failed to create pipeline: {}", e)))?
            .downcast::<Pipeline>()
            .map_err(|_| open_error(config, "Failed to downcast to Pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| open_error(config, "Failed to get appsink element".to_string()))?
            .downcast::<AppSink>()
            .map_err(|_| open_error(config, "Failed to downcast to AppSink".to_string()))?;

        let mut backend = Self {
            description: format!("gstreamer {}", config.display_selector()),
            pipeline,
            appsink,
            format,
            width: 0,
            height: 0,
            fps: None,
            duration: None,
            position: 0,
        };

        // Pause first so caps are negotiated before the first read
        if let Err(e) = backend.pipeline.set_state(State::Paused) {
            backend.shutdown();
            return Err(open_error(config, format!("Failed to pause pipeline: {}", e)));
        }

        let preroll = backend
            .appsink
            .try_pull_preroll(ClockTime::from_nseconds(PREROLL_TIMEOUT.as_nanos() as u64));
        let Some(sample) = preroll else {
            backend.shutdown();
            return Err(open_error(config, "No frames within preroll timeout".to_string()));
        };

        if let Some(info) = sample.caps().and_then(|caps| VideoInfo::from_caps(caps).ok()) {
            backend.width = info.width();
            backend.height = info.height();
            let rate = info.fps();
            if rate.numer() > 0 && rate.denom() > 0 {
                backend.fps = Some(rate.numer() as f64 / rate.denom() as f64);
            }
        }

        if let Err(e) = backend.pipeline.set_state(State::Playing) {
            backend.shutdown();
            return Err(open_error(config, format!("Failed to start pipeline: {}", e)));
        }
        backend.duration = backend.pipeline.query_duration::<ClockTime>();

        info!(
            "Opened {} ({}x{} @ {})",
            backend.description,
            backend.width,
            backend.height,
            backend
                .fps
                .map(|f| format!("{:.2} fps", f))
                .unwrap_or_else(|| "unknown rate".to_string())
        );
        Ok(backend)
    }

    fn frame_from_sample(&self, sample: &gstreamer::Sample) -> Result<Frame, CaptureError> {
        let buffer = sample.buffer().ok_or_else(|| CaptureError::Read {
            details: "No buffer in sample".to_string(),
        })?;
        let map = buffer.map_readable().map_err(|e| CaptureError::Read {
            details: format!("Failed to map buffer: {}", e),
        })?;

        let info = sample.caps().and_then(|caps| VideoInfo::from_caps(caps).ok());
        let (width, height) = info
            .as_ref()
            .map(|i| (i.width(), i.height()))
            .unwrap_or((self.width, self.height));
        let row_bytes = width as usize * self.format.bytes_per_pixel();
        let stride = info
            .as_ref()
            .and_then(|i| i.stride().first().copied())
            .map(|s| s as usize)
            .unwrap_or(row_bytes);

        let data = if stride == row_bytes {
            map.as_slice().to_vec()
        } else {
            let mut packed = Vec::with_capacity(row_bytes * height as usize);
            for row in map.as_slice().chunks(stride).take(height as usize) {
                packed.extend_from_slice(&row[..row_bytes.min(row.len())]);
            }
            packed
        };

        Ok(Frame::new(0, SystemTime::now(), data, width, height, self.format))
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.pipeline.set_state(State::Null) {
            warn!("Failed to stop capture pipeline: {}", e);
        }
    }
}

impl CaptureBackend for GstBackend {
    fn describe(&self) -> String {
        self.description.clone()
    }

    fn read_frame(&mut self) -> Result<BackendRead, CaptureError> {
        let pulled = self
            .appsink
            .try_pull_sample(ClockTime::from_nseconds(PULL_TIMEOUT.as_nanos() as u64));
        let sample = match pulled {
            Some(sample) => sample,
            None if self.appsink.is_eos() => return Ok(BackendRead::EndOfStream),
            None => {
                return Err(CaptureError::Read {
                    details: format!("No frame within {:?}", PULL_TIMEOUT),
                })
            }
        };

        let mut frame = self.frame_from_sample(&sample)?;
        if self.duration.is_some() {
            frame = frame.with_position(self.position);
        }
        self.position += 1;
        Ok(BackendRead::Frame(frame))
    }

    fn seek(&mut self, position: u64) -> Result<(), CaptureError> {
        let (Some(_), Some(fps)) = (self.duration, self.fps) else {
            return Err(CaptureError::Unsupported {
                operation: "seek",
                kind: "live",
            });
        };
        let target = ClockTime::from_nseconds((position as f64 / fps * 1e9) as u64);
        self.pipeline
            .seek_simple(SeekFlags::FLUSH | SeekFlags::ACCURATE, target)
            .map_err(|e| CaptureError::Backend {
                details: format!("Seek to frame {} failed: {}", position, e),
            })?;
        self.position = position;
        Ok(())
    }

    fn position(&self) -> Option<u64> {
        self.duration.map(|_| self.position)
    }

    fn frame_count(&self) -> Option<u64> {
        let duration = self.duration?;
        let fps = self.fps?;
        Some((duration.nseconds() as f64 / 1e9 * fps).round() as u64)
    }

    fn fps(&self) -> Option<f64> {
        self.fps
    }

    fn frame_size(&self) -> Option<(u32, u32)> {
        (self.width > 0 && self.height > 0).then_some((self.width, self.height))
    }

    fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    fn apply_tuning(&mut self, tuning: &CameraTuning) -> Result<(), CaptureError> {
        let Some(source) = self.pipeline.by_name("camera") else {
            debug!("{} has no tunable camera element", self.description);
            return Ok(());
        };

        if source.find_property("exposure").is_some() {
            source.set_property("exposure", tuning.exposure_us);
        }
        if source.find_property("gain").is_some() {
            source.set_property("gain", tuning.gain);
        }
        if source.find_property("exposure-auto").is_some() {
            source.set_property_from_str("exposure-auto", if tuning.auto_exposure { "continuous" } else { "off" });
        }
        if source.find_property("gain-auto").is_some() {
            source.set_property_from_str("gain-auto", if tuning.auto_gain { "continuous" } else { "off" });
        }
        debug!(
            "Applied tuning to {}: exposure {}us gain {}dB",
            self.description, tuning.exposure_us, tuning.gain
        );
        Ok(())
    }
}

impl Drop for GstBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn source_element(config: &SourceConfig, selector: &str) -> String {
    match config {
        SourceConfig::HardwareCamera(camera) => {
            let (width, height) = camera.resolution;
            let source = if let Ok(index) = selector.parse::<u32>() {
                format!("v4l2src name=camera device=/dev/video{}", index)
            } else if selector.starts_with('/') {
                format!("v4l2src name=camera device={}", selector)
            } else {
                format!("aravissrc name=camera camera-name=\"{}\"", selector)
            };
            format!(
                "{} ! video/x-raw,width={},height={},framerate={}/1",
                source,
                width,
                height,
                camera.fps.round().max(1.0) as u32
            )
        }
        SourceConfig::NetworkCamera(_) => format!("uridecodebin uri=\"{}\"", selector),
        SourceConfig::File(_) => format!("filesrc location=\"{}\" ! decodebin", selector),
    }
}

fn caps_format(format: PixelFormat) -> &'static str {
    match format {
        PixelFormat::Mono8 => "GRAY8",
        PixelFormat::Bgr24 => "BGR",
        _ => "RGB",
    }
}

fn open_error(config: &SourceConfig, details: String) -> CaptureError {
    CaptureError::Open {
        source_desc: config.display_selector(),
        details,
    }
}
