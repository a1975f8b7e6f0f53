use super::writer::{open_writer, Codec, VideoWriter, WriterParams};
use crate::error::{InspectorError, RecordingError};
use crate::frame::{Frame, PixelFormat};
use crate::preroll::{capacity_for, PrerollBuffer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Parameters for a recording session
#[derive(Debug, Clone)]
pub struct RecordingRequest {
    /// Output file path; the parent directory is created when absent
    pub output_path: PathBuf,
    pub codec: Codec,
    /// Output frame rate; the source rate is used when unset
    pub fps: Option<f64>,
    /// Encoder quality 1-100
    pub quality: u8,
    /// Session is closed automatically after this long
    pub max_duration: Option<Duration>,
}

impl RecordingRequest {
    pub fn new<P: Into<PathBuf>>(output_path: P, codec: Codec) -> Self {
        Self {
            output_path: output_path.into(),
            codec,
            fps: None,
            quality: 80,
            max_duration: None,
        }
    }

    /// Request with a timestamped file name inside `directory`
    pub fn in_directory<P: AsRef<Path>>(directory: P, prefix: &str, codec: Codec) -> Self {
        let name = format!(
            "{}_{}.{}",
            prefix,
            Utc::now().format("%Y%m%d_%H%M%S_%3f"),
            codec.extension()
        );
        Self::new(directory.as_ref().join(name), codec)
    }

    pub fn with_fps(mut self, fps: Option<f64>) -> Self {
        self.fps = fps;
        self
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    /// Zero means unlimited
    pub fn with_max_duration_seconds(mut self, seconds: u32) -> Self {
        self.max_duration = (seconds > 0).then(|| Duration::from_secs(seconds as u64));
        self
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Operator,
    MaxDuration,
    CaptureStopped,
    WriteFailed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            StopReason::Operator => "operator",
            StopReason::MaxDuration => "max duration",
            StopReason::CaptureStopped => "capture stopped",
            StopReason::WriteFailed => "write failed",
        };
        f.write_str(reason)
    }
}

/// Returned when a session opens
#[derive(Debug, Clone)]
pub struct RecordingStarted {
    pub id: Uuid,
    pub path: PathBuf,
    pub preroll_frames: usize,
}

/// Sidecar metadata written next to each recording
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingSummary {
    pub id: Uuid,
    pub path: PathBuf,
    pub codec: Codec,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub preroll_frames: usize,
    pub total_frames: u64,
    pub stop_reason: StopReason,
}

struct RecordingSession {
    id: Uuid,
    writer: Box<dyn VideoWriter>,
    params: WriterParams,
    started_at: SystemTime,
    started: Instant,
    max_duration: Option<Duration>,
    preroll_frames: usize,
}

/// Per-source recorder: a pre-roll buffer that sees every captured frame and
/// an optional writer session.
///
/// Lives under the owning source's lock and is only driven from its capture
/// loop or from calls that hold that lock.
pub struct RecordingSink {
    preroll: PrerollBuffer,
    preroll_seconds: u32,
    session: Option<RecordingSession>,
}

impl RecordingSink {
    /// Sink whose pre-roll holds `preroll_seconds` of footage at `fps`
    pub fn new(preroll_seconds: u32, fps: f64) -> Result<Self, InspectorError> {
        Ok(Self {
            preroll: PrerollBuffer::new(capacity_for(preroll_seconds, fps))?,
            preroll_seconds,
            session: None,
        })
    }

    /// Sink with an explicit pre-roll capacity
    pub fn with_capacity(capacity: usize) -> Result<Self, InspectorError> {
        Ok(Self {
            preroll: PrerollBuffer::new(capacity)?,
            preroll_seconds: 0,
            session: None,
        })
    }

    /// Resize the pre-roll for the rate the backend actually delivers
    pub fn set_source_fps(&mut self, fps: f64) {
        if self.preroll_seconds > 0 {
            self.preroll.resize(capacity_for(self.preroll_seconds, fps));
        }
    }

    /// Feed a captured frame: buffer it and, while a session is open, write it.
    ///
    /// Returns the summary when the session ends because of this frame
    /// (duration limit reached or writer failure).
    pub fn push_frame(&mut self, frame: &Frame) -> Option<RecordingSummary> {
        self.preroll.push(frame.clone());

        let session = self.session.as_mut()?;

        if let Some(limit) = session.max_duration {
            if session.started.elapsed() >= limit {
                info!("Recording {} reached its {:?} limit", session.id, limit);
                return self.close(StopReason::MaxDuration).ok();
            }
        }

        if let Err(e) = session.writer.write(frame) {
            warn!("Recording {} write failed, closing: {}", session.id, e);
            return self.close(StopReason::WriteFailed).ok();
        }

        None
    }

    /// Open a writer sized to the capture's frames and flush the pre-roll into it
    pub fn start(
        &mut self,
        request: &RecordingRequest,
        frame_size: (u32, u32),
        format: PixelFormat,
        source_fps: Option<f64>,
    ) -> Result<RecordingStarted, RecordingError> {
        if self.session.is_some() {
            return Err(RecordingError::AlreadyActive);
        }
        if !request.codec.is_available() {
            return Err(RecordingError::UnsupportedCodec {
                codec: request.codec.to_string(),
            });
        }

        if let Some(parent) = request.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| RecordingError::DirectoryCreation {
                    path: parent.display().to_string(),
                    source: e,
                })?;
            }
        }

        let fps = request
            .fps
            .or(source_fps)
            .filter(|fps| *fps > 0.0)
            .unwrap_or(30.0);
        let params = WriterParams {
            codec: request.codec,
            fps,
            width: frame_size.0,
            height: frame_size.1,
            format,
            quality: request.quality,
        };

        let mut writer = open_writer(&request.output_path, params)?;

        let preroll = self.preroll.snapshot();
        for frame in &preroll {
            if let Err(e) = writer.write(frame) {
                // Close what was opened and discard the partial file
                let _ = writer.finish();
                let _ = std::fs::remove_file(&request.output_path);
                return Err(e);
            }
        }

        let id = Uuid::new_v4();
        info!(
            "Recording {} started at {} ({} pre-roll frames, {} @ {:.2} fps)",
            id,
            request.output_path.display(),
            preroll.len(),
            request.codec,
            fps
        );

        self.session = Some(RecordingSession {
            id,
            writer,
            params,
            started_at: SystemTime::now(),
            started: Instant::now(),
            max_duration: request.max_duration,
            preroll_frames: preroll.len(),
        });

        Ok(RecordingStarted {
            id,
            path: request.output_path.clone(),
            preroll_frames: preroll.len(),
        })
    }

    /// Close the writer, write the sidecar metadata and clear the pre-roll
    pub fn stop(&mut self, reason: StopReason) -> Result<RecordingSummary, RecordingError> {
        if self.session.is_none() {
            return Err(RecordingError::NotActive);
        }
        self.close(reason)
    }

    fn close(&mut self, reason: StopReason) -> Result<RecordingSummary, RecordingError> {
        let session = self.session.take().ok_or(RecordingError::NotActive)?;
        self.preroll.clear();

        let total_frames = session.writer.frames_written();
        let path = session.writer.path().to_path_buf();
        let finished = session.writer.finish();

        let summary = RecordingSummary {
            id: session.id,
            path: path.clone(),
            codec: session.params.codec,
            fps: session.params.fps,
            width: session.params.width,
            height: session.params.height,
            format: session.params.format,
            started_at: DateTime::<Utc>::from(session.started_at),
            ended_at: Utc::now(),
            preroll_frames: session.preroll_frames,
            total_frames,
            stop_reason: reason,
        };

        finished?;

        if let Err(e) = write_sidecar(&summary) {
            warn!("Failed to write metadata for {}: {}", path.display(), e);
        }

        info!(
            "Recording {} stopped ({}): {} frames in {}",
            summary.id,
            reason,
            total_frames,
            path.display()
        );
        Ok(summary)
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn active_path(&self) -> Option<&Path> {
        self.session.as_ref().map(|s| s.writer.path())
    }

    pub fn frames_written(&self) -> u64 {
        self.session
            .as_ref()
            .map(|s| s.writer.frames_written())
            .unwrap_or(0)
    }

    pub fn preroll_len(&self) -> usize {
        self.preroll.len()
    }

    pub fn preroll_capacity(&self) -> usize {
        self.preroll.capacity()
    }

    /// Most recent buffered frame
    pub fn latest_frame(&self) -> Option<&Frame> {
        self.preroll.latest()
    }

    /// Drop buffered frames without touching an open session
    pub fn clear_preroll(&mut self) {
        self.preroll.clear();
    }
}

/// Path of the JSON sidecar for a recording
pub fn sidecar_path(recording: &Path) -> PathBuf {
    let mut name = recording.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

fn write_sidecar(summary: &RecordingSummary) -> Result<(), InspectorError> {
    let json = serde_json::to_string_pretty(summary)?;
    let path = sidecar_path(&summary.path);
    std::fs::write(&path, json)?;
    debug!("Saved metadata to {}", path.display());
    Ok(())
}
