use super::settings::{CameraTuning, SourceConfig};
use super::synthetic::{SyntheticBackend, STUB_SCHEME};
use crate::error::CaptureError;
use crate::frame::{Frame, PixelFormat};
use crate::recording::{is_clip_path, ClipReader};
use std::path::Path;
use tracing::{debug, info};

/// Result of a single read from a backend
#[derive(Debug)]
pub enum BackendRead {
    Frame(Frame),
    /// A file reached its last frame
    EndOfStream,
}

/// Device, stream or file handle.
///
/// Every call is made while holding the owning source's lock.
pub trait CaptureBackend: Send {
    fn describe(&self) -> String;

    /// Read the next frame, blocking for hardware devices
    fn read_frame(&mut self) -> Result<BackendRead, CaptureError>;

    fn seek(&mut self, _position: u64) -> Result<(), CaptureError> {
        Err(CaptureError::Unsupported {
            operation: "seek",
            kind: "live",
        })
    }

    /// Index of the next frame for seekable backends
    fn position(&self) -> Option<u64> {
        None
    }

    fn frame_count(&self) -> Option<u64> {
        None
    }

    /// Rate reported by the device or file
    fn fps(&self) -> Option<f64>;

    fn frame_size(&self) -> Option<(u32, u32)>;

    fn pixel_format(&self) -> PixelFormat;

    fn apply_tuning(&mut self, _tuning: &CameraTuning) -> Result<(), CaptureError> {
        debug!("{} does not support camera tuning", self.describe());
        Ok(())
    }
}

/// Opens a backend for a configuration snapshot.
///
/// Implementations release everything they acquired before returning an error.
pub trait BackendOpener: Send + Sync {
    fn open(
        &self,
        config: &SourceConfig,
        path_override: Option<&str>,
    ) -> Result<Box<dyn CaptureBackend>, CaptureError>;
}

/// Dispatches on the selector: `stub://` to the synthetic generator, `.clip`
/// files to the native reader, everything else to GStreamer when available.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackendOpener;

impl BackendOpener for DefaultBackendOpener {
    fn open(
        &self,
        config: &SourceConfig,
        path_override: Option<&str>,
    ) -> Result<Box<dyn CaptureBackend>, CaptureError> {
        let selector = path_override
            .map(str::to_string)
            .unwrap_or_else(|| config.selector());

        if selector.trim().is_empty() {
            return Err(CaptureError::Open {
                source_desc: config.kind().to_string(),
                details: "no device, URL or path configured".to_string(),
            });
        }

        if selector.starts_with(STUB_SCHEME) {
            return Ok(Box::new(SyntheticBackend::open(&selector, config)?));
        }

        if is_clip_path(&selector) {
            return Ok(Box::new(ClipFileBackend::open(Path::new(&selector))?));
        }

        open_native(config, &selector)
    }
}

#[cfg(all(feature = "gstreamer", target_os = "linux"))]
fn open_native(config: &SourceConfig, selector: &str) -> Result<Box<dyn CaptureBackend>, CaptureError> {
    Ok(Box::new(super::gst::GstBackend::open(config, selector)?))
}

#[cfg(not(all(feature = "gstreamer", target_os = "linux")))]
fn open_native(config: &SourceConfig, selector: &str) -> Result<Box<dyn CaptureBackend>, CaptureError> {
    // Keep credentials out of the error message
    let shown = if selector == config.selector() {
        config.display_selector()
    } else {
        selector.to_string()
    };
    Err(CaptureError::Open {
        source_desc: shown,
        details: "no capture backend for this selector; rebuild with the gstreamer feature"
            .to_string(),
    })
}

/// File playback from the native clip container
pub struct ClipFileBackend {
    reader: ClipReader,
}

impl ClipFileBackend {
    pub fn open(path: &Path) -> Result<Self, CaptureError> {
        let reader = ClipReader::open(path).map_err(|e| CaptureError::Open {
            source_desc: path.display().to_string(),
            details: e.to_string(),
        })?;

        info!(
            "Opened clip {} ({} frames, {}x{} @ {:.2} fps)",
            path.display(),
            reader.frame_count(),
            reader.header().width,
            reader.header().height,
            reader.header().fps
        );

        Ok(Self { reader })
    }
}

impl CaptureBackend for ClipFileBackend {
    fn describe(&self) -> String {
        format!("clip {}", self.reader.path().display())
    }

    fn read_frame(&mut self) -> Result<BackendRead, CaptureError> {
        match self.reader.next_frame() {
            Ok(Some(frame)) => Ok(BackendRead::Frame(frame)),
            Ok(None) => Ok(BackendRead::EndOfStream),
            Err(e) => Err(CaptureError::Read {
                details: e.to_string(),
            }),
        }
    }

    fn seek(&mut self, position: u64) -> Result<(), CaptureError> {
        self.reader.seek(position).map_err(|e| CaptureError::Backend {
            details: e.to_string(),
        })
    }

    fn position(&self) -> Option<u64> {
        Some(self.reader.position())
    }

    fn frame_count(&self) -> Option<u64> {
        Some(self.reader.frame_count())
    }

    fn fps(&self) -> Option<f64> {
        let fps = self.reader.header().fps;
        (fps > 0.0).then_some(fps)
    }

    fn frame_size(&self) -> Option<(u32, u32)> {
        let header = self.reader.header();
        Some((header.width, header.height))
    }

    fn pixel_format(&self) -> PixelFormat {
        self.reader.header().format
    }
}
