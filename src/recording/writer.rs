use super::clip::{ClipWriter, CLIP_EXTENSION};
use crate::error::RecordingError;
use crate::frame::{Frame, PixelFormat};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Output codec for a recording session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// Native clip container, always available
    Clip,
    /// H.264 in MP4 (gstreamer feature)
    H264,
    /// Motion JPEG in AVI (gstreamer feature)
    Mjpeg,
}

impl Codec {
    pub fn extension(&self) -> &'static str {
        match self {
            Codec::Clip => CLIP_EXTENSION,
            Codec::H264 => "mp4",
            Codec::Mjpeg => "avi",
        }
    }

    /// Whether this build can write the codec
    pub fn is_available(&self) -> bool {
        match self {
            Codec::Clip => true,
            Codec::H264 | Codec::Mjpeg => cfg!(all(feature = "gstreamer", target_os = "linux")),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Codec::Clip => "clip",
            Codec::H264 => "h264",
            Codec::Mjpeg => "mjpeg",
        };
        f.write_str(name)
    }
}

impl FromStr for Codec {
    type Err = RecordingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clip" | "native" => Ok(Codec::Clip),
            "h264" | "avc" | "x264" | "mp4" => Ok(Codec::H264),
            "mjpeg" | "mjpg" | "jpeg" => Ok(Codec::Mjpeg),
            other => Err(RecordingError::UnsupportedCodec {
                codec: other.to_string(),
            }),
        }
    }
}

/// Output parameters fixed when a writer is opened
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriterParams {
    pub codec: Codec,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Encoder quality 1-100
    pub quality: u8,
}

/// Encoder handle owned by an active recording session
pub trait VideoWriter: Send {
    fn write(&mut self, frame: &Frame) -> Result<(), RecordingError>;

    /// Flush and close, returning the written path
    fn finish(self: Box<Self>) -> Result<PathBuf, RecordingError>;

    fn frames_written(&self) -> u64;

    fn path(&self) -> &Path;
}

/// Open a writer for `params` at `path`.
///
/// Nothing is left open when this fails.
pub fn open_writer(path: &Path, params: WriterParams) -> Result<Box<dyn VideoWriter>, RecordingError> {
    match params.codec {
        Codec::Clip => Ok(Box::new(ClipVideoWriter::create(path, params)?)),
        #[cfg(all(feature = "gstreamer", target_os = "linux"))]
        Codec::H264 | Codec::Mjpeg => Ok(Box::new(gst::GstVideoWriter::create(path, params)?)),
        #[cfg(not(all(feature = "gstreamer", target_os = "linux")))]
        codec => Err(RecordingError::UnsupportedCodec {
            codec: codec.to_string(),
        }),
    }
}

/// Writer backed by the native clip container
pub struct ClipVideoWriter {
    inner: ClipWriter,
}

impl ClipVideoWriter {
    pub fn create(path: &Path, params: WriterParams) -> Result<Self, RecordingError> {
        Ok(Self {
            inner: ClipWriter::create(path, params.fps, params.width, params.height, params.format)?,
        })
    }
}

impl VideoWriter for ClipVideoWriter {
    fn write(&mut self, frame: &Frame) -> Result<(), RecordingError> {
        self.inner.append(frame)
    }

    fn finish(self: Box<Self>) -> Result<PathBuf, RecordingError> {
        self.inner.finish()
    }

    fn frames_written(&self) -> u64 {
        self.inner.frame_count() as u64
    }

    fn path(&self) -> &Path {
        self.inner.path()
    }
}

#[cfg(all(feature = "gstreamer", target_os = "linux"))]
mod gst {
    use super::{Codec, VideoWriter, WriterParams};
    use crate::error::RecordingError;
    use crate::frame::{Frame, PixelFormat};
    use gstreamer::prelude::*;
    use gstreamer::Pipeline;
    use gstreamer_app::AppSrc;
    use std::path::{Path, PathBuf};
    use tracing::{debug, info, warn};

    /// GStreamer appsrc encoding pipeline (H.264/MP4 or MJPEG/AVI)
    pub struct GstVideoWriter {
        pipeline: Pipeline,
        appsrc: AppSrc,
        path: PathBuf,
        base_ns: Option<u64>,
        frame_duration_ns: u64,
        frames_written: u64,
    }

    impl GstVideoWriter {
        pub fn create(path: &Path, params: WriterParams) -> Result<Self, RecordingError> {
            let open_error = |details: String| RecordingError::WriterOpen {
                path: path.display().to_string(),
                details,
            };

            gstreamer::init().map_err(|e| open_error(format!("GStreamer init failed: {}", e)))?;

            let fps_num = (params.fps * 1000.0).round().max(1.0) as i32;
            let input = match params.format {
                PixelFormat::Mjpeg => format!(
                    "caps=image/jpeg,width={},height={},framerate={}/1000 ! jpegparse ! jpegdec",
                    params.width, params.height, fps_num
                ),
                raw => {
                    let format = match raw {
                        PixelFormat::Mono8 => "GRAY8",
                        PixelFormat::Bgr24 => "BGR",
                        _ => "RGB",
                    };
                    format!(
                        "caps=video/x-raw,format={},width={},height={},framerate={}/1000",
                        format, params.width, params.height, fps_num
                    )
                }
            };

            let quality = params.quality.clamp(1, 100);
            let output = match params.codec {
                Codec::Mjpeg => format!("jpegenc quality={} ! avimux", quality),
                _ => format!(
                    "video/x-raw,format=I420 ! x264enc speed-preset=ultrafast tune=zerolatency bitrate={} key-int-max=60 ! \
                     h264parse config-interval=1 ! mp4mux faststart=true",
                    (quality as u32) * 100
                ),
            };

            let description = format!(
                "appsrc name=src format=time is-live=true do-timestamp=false {} ! videoconvert ! {} ! filesink location=\"{}\"",
                input,
                output,
                path.to_string_lossy()
            );
            debug!("Recording pipeline: {}", description);

            let pipeline = gstreamer::parse::launch(&description)
                .map_err(|e| open_error(format!("failed to create pipeline: {}", e)))?
                .downcast::<Pipeline>()
                .map_err(|_| open_error("failed to downcast to Pipeline".to_string()))?;

            let appsrc = pipeline
                .by_name("src")
                .ok_or_else(|| open_error("failed to get appsrc element".to_string()))?
                .downcast::<AppSrc>()
                .map_err(|_| open_error("failed to downcast to AppSrc".to_string()))?;

            if let Err(e) = pipeline.set_state(gstreamer::State::Playing) {
                let _ = pipeline.set_state(gstreamer::State::Null);
                return Err(open_error(format!("failed to start pipeline: {}", e)));
            }

            info!("Started {} encoding pipeline for {}", params.codec, path.display());

            Ok(Self {
                pipeline,
                appsrc,
                path: path.to_path_buf(),
                base_ns: None,
                frame_duration_ns: (1_000_000_000.0 / params.fps.max(0.001)) as u64,
                frames_written: 0,
            })
        }
    }

    impl VideoWriter for GstVideoWriter {
        fn write(&mut self, frame: &Frame) -> Result<(), RecordingError> {
            let frame_ns = frame.timestamp_nanos();
            let base = *self.base_ns.get_or_insert(frame_ns);

            let mut buffer = gstreamer::Buffer::from_mut_slice(frame.data.to_vec());
            {
                let buffer_ref = buffer.get_mut().ok_or_else(|| RecordingError::Write {
                    details: "buffer not writable".to_string(),
                })?;
                buffer_ref.set_pts(gstreamer::ClockTime::from_nseconds(frame_ns.saturating_sub(base)));
                buffer_ref.set_duration(gstreamer::ClockTime::from_nseconds(self.frame_duration_ns));
            }

            self.appsrc
                .push_buffer(buffer)
                .map_err(|e| RecordingError::Write {
                    details: format!("failed to push buffer: {:?}", e),
                })?;
            self.frames_written += 1;
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<PathBuf, RecordingError> {
            let this = *self;
            if let Err(e) = this.appsrc.end_of_stream() {
                warn!("Failed to signal EOS: {:?}", e);
            }

            let mut result = Ok(());
            if let Some(bus) = this.pipeline.bus() {
                for msg in bus.iter_timed(gstreamer::ClockTime::from_seconds(30)) {
                    match msg.view() {
                        gstreamer::MessageView::Eos(..) => break,
                        gstreamer::MessageView::Error(err) => {
                            result = Err(RecordingError::Write {
                                details: format!(
                                    "encoding error: {} ({})",
                                    err.error(),
                                    err.debug().unwrap_or_default()
                                ),
                            });
                            break;
                        }
                        _ => {}
                    }
                }
            }

            let _ = this.pipeline.set_state(gstreamer::State::Null);
            result?;

            info!(
                "Closed {} ({} frames)",
                this.path.display(),
                this.frames_written
            );
            Ok(this.path)
        }

        fn frames_written(&self) -> u64 {
            self.frames_written
        }

        fn path(&self) -> &Path {
            &self.path
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_codec_parsing() {
        assert_eq!("clip".parse::<Codec>().unwrap(), Codec::Clip);
        assert_eq!("H264".parse::<Codec>().unwrap(), Codec::H264);
        assert_eq!("mjpg".parse::<Codec>().unwrap(), Codec::Mjpeg);
        assert!(matches!(
            "theora".parse::<Codec>(),
            Err(RecordingError::UnsupportedCodec { .. })
        ));
        assert!(Codec::Clip.is_available());
        assert_eq!(Codec::H264.extension(), "mp4");
    }

    #[test]
    fn test_clip_writer_through_trait() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("out.clip");
        let params = WriterParams {
            codec: Codec::Clip,
            fps: 30.0,
            width: 2,
            height: 2,
            format: PixelFormat::Mono8,
            quality: 80,
        };

        let mut writer = open_writer(&path, params).unwrap();
        let frame = Frame::new(0, std::time::SystemTime::now(), vec![1, 2, 3, 4], 2, 2, PixelFormat::Mono8);
        writer.write(&frame).unwrap();
        assert_eq!(writer.frames_written(), 1);
        assert_eq!(writer.finish().unwrap(), path);
    }

    #[cfg(not(all(feature = "gstreamer", target_os = "linux")))]
    #[test]
    fn test_encoded_codecs_unavailable_without_gstreamer() {
        let temp_dir = TempDir::new().unwrap();
        let params = WriterParams {
            codec: Codec::H264,
            fps: 30.0,
            width: 2,
            height: 2,
            format: PixelFormat::Mono8,
            quality: 80,
        };
        assert!(!Codec::H264.is_available());
        assert!(matches!(
            open_writer(&temp_dir.path().join("out.mp4"), params),
            Err(RecordingError::UnsupportedCodec { .. })
        ));
    }
}
