//! Deterministic frame generator behind `stub://` selectors.
//!
//! `stub://name?frames=N&fps=F&width=W&height=H&fail_every=K&defect_every=D&format=mono|rgb&pace=device|none`
//!
//! With `frames` the generator behaves like a file (bounded, seekable);
//! without it, like a live device. `pace=device` makes reads block for one
//! frame interval the way a hardware grab does (default for hardware cameras).

use super::backend::{BackendRead, CaptureBackend};
use super::settings::{CameraTuning, SourceConfig};
use super::SourceKind;
use crate::error::CaptureError;
use crate::frame::{Frame, PixelFormat};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info};

pub(crate) const STUB_SCHEME: &str = "stub://";

/// Parsed `stub://` selector
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticParams {
    pub name: String,
    /// Bounded length; `None` free-runs
    pub frames: Option<u64>,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Every K-th read fails
    pub fail_every: Option<u64>,
    /// Every D-th frame carries a dark patch
    pub defect_every: Option<u64>,
    /// Reads block for one frame interval
    pub device_paced: bool,
}

impl SyntheticParams {
    /// Parse `selector`, taking unspecified values from `config`
    pub fn parse(selector: &str, config: &SourceConfig) -> Result<Self, CaptureError> {
        let rest = selector
            .strip_prefix(STUB_SCHEME)
            .ok_or_else(|| open_error(selector, "not a stub:// selector"))?;
        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));

        let (width, height) = config.resolution().unwrap_or((64, 48));
        let mut params = Self {
            name: if name.is_empty() { "stub".to_string() } else { name.to_string() },
            frames: None,
            fps: config.fps(),
            width,
            height,
            format: match config.pixel_format() {
                PixelFormat::Mono8 => PixelFormat::Mono8,
                _ => PixelFormat::Rgb24,
            },
            fail_every: None,
            defect_every: None,
            device_paced: config.kind() == SourceKind::HardwareCamera,
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| open_error(selector, &format!("malformed parameter '{}'", pair)))?;
            match key {
                "frames" => params.frames = Some(parse_number(selector, key, value)?),
                "fps" => params.fps = parse_number(selector, key, value)?,
                "width" => params.width = parse_number(selector, key, value)?,
                "height" => params.height = parse_number(selector, key, value)?,
                "fail_every" => params.fail_every = Some(parse_number(selector, key, value)?),
                "defect_every" => params.defect_every = Some(parse_number(selector, key, value)?),
                "format" => {
                    params.format = match value {
                        "mono" | "mono8" => PixelFormat::Mono8,
                        "rgb" | "rgb24" => PixelFormat::Rgb24,
                        "bgr" | "bgr24" => PixelFormat::Bgr24,
                        other => {
                            return Err(open_error(
                                selector,
                                &format!("unsupported format '{}'", other),
                            ))
                        }
                    }
                }
                "pace" => params.device_paced = value == "device",
                other => {
                    return Err(open_error(selector, &format!("unknown parameter '{}'", other)));
                }
            }
        }

        if params.width == 0 || params.height == 0 || !(params.fps > 0.0) {
            return Err(open_error(selector, "width, height and fps must be positive"));
        }
        if params.fail_every == Some(0) || params.defect_every == Some(0) {
            return Err(open_error(selector, "fail_every and defect_every must be positive"));
        }

        Ok(params)
    }
}

/// Generated frame stream
pub struct SyntheticBackend {
    params: SyntheticParams,
    position: u64,
    reads: u64,
    next_due: Option<Instant>,
    tuning: Option<CameraTuning>,
}

impl SyntheticBackend {
    pub fn open(selector: &str, config: &SourceConfig) -> Result<Self, CaptureError> {
        let params = SyntheticParams::parse(selector, config)?;
        info!(
            "Opened synthetic source '{}' ({}x{} {:?} @ {} fps, {})",
            params.name,
            params.width,
            params.height,
            params.format,
            params.fps,
            params
                .frames
                .map(|n| format!("{} frames", n))
                .unwrap_or_else(|| "free-running".to_string())
        );
        Ok(Self {
            params,
            position: 0,
            reads: 0,
            next_due: None,
            tuning: config.tuning().cloned(),
        })
    }

    pub fn params(&self) -> &SyntheticParams {
        &self.params
    }

    fn wait_for_device(&mut self) {
        let interval = Duration::from_secs_f64(1.0 / self.params.fps);
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        // A late consumer does not cause a burst of catch-up frames
        self.next_due = Some(due.max(now) + interval);
    }

    fn render(&self, position: u64) -> Vec<u8> {
        let (width, height) = (self.params.width as u64, self.params.height as u64);
        let defect = self
            .params
            .defect_every
            .map(|every| position % every == every - 1)
            .unwrap_or(false);
        let offset = self
            .tuning
            .as_ref()
            .map(|t| t.brightness.clamp(-100.0, 100.0) as i64)
            .unwrap_or(0);

        let channels = self.params.format.bytes_per_pixel() as u64;
        let mut data = Vec::with_capacity((width * height * channels) as usize);
        for y in 0..height {
            for x in 0..width {
                let in_patch = defect
                    && x >= width / 3
                    && x < 2 * width / 3
                    && y >= height / 3
                    && y < 2 * height / 3;
                let value = if in_patch {
                    5
                } else {
                    let base = (((x + y) / 4 + position * 3) % 160 + 60) as i64;
                    (base + offset).clamp(0, 255) as u8
                };
                for _ in 0..channels {
                    data.push(value);
                }
            }
        }
        data
    }
}

impl CaptureBackend for SyntheticBackend {
    fn describe(&self) -> String {
        format!("synthetic '{}'", self.params.name)
    }

    fn read_frame(&mut self) -> Result<BackendRead, CaptureError> {
        self.reads += 1;

        if let Some(total) = self.params.frames {
            if self.position >= total {
                return Ok(BackendRead::EndOfStream);
            }
        }

        if self.params.device_paced {
            self.wait_for_device();
        }

        if let Some(every) = self.params.fail_every {
            if self.reads % every == 0 {
                return Err(CaptureError::Read {
                    details: format!("synthetic read failure at read {}", self.reads),
                });
            }
        }

        let position = self.position;
        self.position += 1;

        let mut frame = Frame::new(
            position,
            SystemTime::now(),
            self.render(position),
            self.params.width,
            self.params.height,
            self.params.format,
        );
        if self.params.frames.is_some() {
            frame = frame.with_position(position);
        }
        Ok(BackendRead::Frame(frame))
    }

    fn seek(&mut self, position: u64) -> Result<(), CaptureError> {
        let Some(total) = self.params.frames else {
            return Err(CaptureError::Unsupported {
                operation: "seek",
                kind: "live",
            });
        };
        if position > total {
            return Err(CaptureError::Backend {
                details: format!("seek to frame {} past end ({} frames)", position, total),
            });
        }
        self.position = position;
        Ok(())
    }

    fn position(&self) -> Option<u64> {
        self.params.frames.map(|_| self.position)
    }

    fn frame_count(&self) -> Option<u64> {
        self.params.frames
    }

    fn fps(&self) -> Option<f64> {
        Some(self.params.fps)
    }

    fn frame_size(&self) -> Option<(u32, u32)> {
        Some((self.params.width, self.params.height))
    }

    fn pixel_format(&self) -> PixelFormat {
        self.params.format
    }

    fn apply_tuning(&mut self, tuning: &CameraTuning) -> Result<(), CaptureError> {
        debug!(
            "Synthetic '{}' tuning: exposure {}us gain {}dB brightness {}",
            self.params.name, tuning.exposure_us, tuning.gain, tuning.brightness
        );
        self.tuning = Some(tuning.clone());
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(selector: &str, key: &str, value: &str) -> Result<T, CaptureError> {
    value
        .parse()
        .map_err(|_| open_error(selector, &format!("invalid {} '{}'", key, value)))
}

fn open_error(selector: &str, details: &str) -> CaptureError {
    CaptureError::Open {
        source_desc: selector.to_string(),
        details: details.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InspectorConfig;

    fn file_config() -> SourceConfig {
        SourceConfig::from_settings(SourceKind::File, &InspectorConfig::default())
    }

    #[test]
    fn test_parse_parameters() {
        let params = SyntheticParams::parse(
            "stub://belt?frames=10&fps=100&width=8&height=4&fail_every=3&format=mono",
            &file_config(),
        )
        .unwrap();
        assert_eq!(params.name, "belt");
        assert_eq!(params.frames, Some(10));
        assert_eq!(params.fps, 100.0);
        assert_eq!((params.width, params.height), (8, 4));
        assert_eq!(params.fail_every, Some(3));
        assert_eq!(params.format, PixelFormat::Mono8);
        assert!(!params.device_paced);

        assert!(SyntheticParams::parse("stub://x?bogus=1", &file_config()).is_err());
        assert!(SyntheticParams::parse("stub://x?fps=0", &file_config()).is_err());
        assert!(SyntheticParams::parse("stub://x?frames=ten", &file_config()).is_err());
    }

    #[test]
    fn test_hardware_defaults_to_device_pacing() {
        let config = SourceConfig::from_settings(SourceKind::HardwareCamera, &InspectorConfig::default());
        let params = SyntheticParams::parse("stub://cam", &config).unwrap();
        assert!(params.device_paced);
        assert_eq!(params.format, PixelFormat::Mono8);
        assert_eq!((params.width, params.height), (1280, 1024));
    }

    #[test]
    fn test_bounded_stream_and_failures() {
        let mut backend =
            SyntheticBackend::open("stub://f?frames=3&width=4&height=2&fail_every=2", &file_config())
                .unwrap();

        assert!(matches!(backend.read_frame(), Ok(BackendRead::Frame(f)) if f.position == Some(0)));
        assert!(matches!(backend.read_frame(), Err(CaptureError::Read { .. })));
        assert!(matches!(backend.read_frame(), Ok(BackendRead::Frame(f)) if f.position == Some(1)));
        assert!(matches!(backend.read_frame(), Err(CaptureError::Read { .. })));
        assert!(matches!(backend.read_frame(), Ok(BackendRead::Frame(f)) if f.position == Some(2)));
        assert!(matches!(backend.read_frame(), Ok(BackendRead::EndOfStream)));

        backend.seek(0).unwrap();
        assert_eq!(backend.position(), Some(0));
        assert!(backend.seek(4).is_err());
    }

    #[test]
    fn test_defect_patch_is_dark() {
        let mut backend = SyntheticBackend::open(
            "stub://d?frames=2&width=9&height=9&defect_every=2&format=mono",
            &file_config(),
        )
        .unwrap();

        let BackendRead::Frame(clean) = backend.read_frame().unwrap() else {
            panic!("expected frame");
        };
        let BackendRead::Frame(defect) = backend.read_frame().unwrap() else {
            panic!("expected frame");
        };
        assert!(clean.data.iter().all(|&v| v >= 60));
        assert_eq!(defect.data[4 * 9 + 4], 5);
        assert!(defect.validate_size());
    }

    #[test]
    fn test_live_stream_is_not_seekable() {
        let mut backend = SyntheticBackend::open("stub://live?pace=none", &file_config()).unwrap();
        assert!(backend.frame_count().is_none());
        assert!(matches!(
            backend.seek(1),
            Err(CaptureError::Unsupported { .. })
        ));
    }
}
