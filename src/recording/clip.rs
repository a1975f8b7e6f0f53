//! Native clip container.
//!
//! Layout (little endian):
//! - 32 byte header: magic `ICLP`, version, fps in milli-frames per second,
//!   width, height, pixel format code (padded to 4 bytes), frame count,
//!   reserved.
//! - Records of `timestamp_ns: u64, sequence: u64, len: u32, payload`.
//!
//! The frame count is patched on close. Readers index the records on open,
//! so a clip left behind by an interrupted recording is still readable.

use crate::error::RecordingError;
use crate::frame::{Frame, PixelFormat};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

const CLIP_MAGIC: [u8; 4] = *b"ICLP";
const CLIP_VERSION: u32 = 1;
const CLIP_HEADER_SIZE: u64 = 32;
const FRAME_COUNT_OFFSET: u64 = 24;
const RECORD_HEADER_SIZE: u64 = 20;

/// File extension used by the clip container
pub const CLIP_EXTENSION: &str = "clip";

/// Stream parameters stored in the clip header
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipHeader {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Count patched on close (0 for an interrupted recording)
    pub frame_count: u32,
}

impl ClipHeader {
    fn encode(&self) -> [u8; CLIP_HEADER_SIZE as usize] {
        let mut header = [0u8; CLIP_HEADER_SIZE as usize];
        header[0..4].copy_from_slice(&CLIP_MAGIC);
        header[4..8].copy_from_slice(&CLIP_VERSION.to_le_bytes());
        let milli_fps = (self.fps * 1000.0).round().clamp(0.0, u32::MAX as f64) as u32;
        header[8..12].copy_from_slice(&milli_fps.to_le_bytes());
        header[12..16].copy_from_slice(&self.width.to_le_bytes());
        header[16..20].copy_from_slice(&self.height.to_le_bytes());
        header[20] = self.format.code();
        header[24..28].copy_from_slice(&self.frame_count.to_le_bytes());
        header
    }

    fn decode(path: &Path, header: &[u8; CLIP_HEADER_SIZE as usize]) -> Result<Self, RecordingError> {
        if header[0..4] != CLIP_MAGIC {
            return Err(format_error(path, "bad magic number"));
        }

        let version = read_u32(&header[4..8]);
        if version != CLIP_VERSION {
            return Err(format_error(path, &format!("unsupported version {}", version)));
        }

        let format = PixelFormat::from_code(header[20])
            .ok_or_else(|| format_error(path, &format!("unknown pixel format {}", header[20])))?;

        Ok(Self {
            fps: read_u32(&header[8..12]) as f64 / 1000.0,
            width: read_u32(&header[12..16]),
            height: read_u32(&header[16..20]),
            format,
            frame_count: read_u32(&header[24..28]),
        })
    }
}

/// Synchronous clip writer, driven from the capture loop
pub struct ClipWriter {
    file: BufWriter<File>,
    header: ClipHeader,
    path: PathBuf,
    frame_count: u32,
    last_sync: Instant,
}

impl ClipWriter {
    /// Create (or truncate) a clip at `path`
    pub fn create(
        path: &Path,
        fps: f64,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Self, RecordingError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| RecordingError::WriterOpen {
                path: path.display().to_string(),
                details: e.to_string(),
            })?;

        let header = ClipHeader {
            fps,
            width,
            height,
            format,
            frame_count: 0,
        };

        let mut writer = Self {
            file: BufWriter::with_capacity(2_000_000, file),
            header,
            path: path.to_path_buf(),
            frame_count: 0,
            last_sync: Instant::now(),
        };

        writer
            .file
            .write_all(&header.encode())
            .map_err(|e| RecordingError::WriterOpen {
                path: path.display().to_string(),
                details: format!("failed to write header: {}", e),
            })?;

        info!(
            "Created clip {} ({}x{} {:?} @ {:.2} fps)",
            path.display(),
            width,
            height,
            format,
            fps
        );
        Ok(writer)
    }

    /// Append a frame record
    pub fn append(&mut self, frame: &Frame) -> Result<(), RecordingError> {
        if !self.header.format.is_compressed()
            && (frame.width != self.header.width
                || frame.height != self.header.height
                || frame.format != self.header.format)
        {
            return Err(RecordingError::Write {
                details: format!(
                    "frame {} is {}x{} {:?}, clip expects {}x{} {:?}",
                    frame.sequence,
                    frame.width,
                    frame.height,
                    frame.format,
                    self.header.width,
                    self.header.height,
                    self.header.format
                ),
            });
        }

        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE as usize);
        record.extend_from_slice(&frame.timestamp_nanos().to_le_bytes());
        record.extend_from_slice(&frame.sequence.to_le_bytes());
        record.extend_from_slice(&(frame.data.len() as u32).to_le_bytes());

        self.file
            .write_all(&record)
            .and_then(|_| self.file.write_all(&frame.data))
            .map_err(|e| RecordingError::Write {
                details: format!("{}: {}", self.path.display(), e),
            })?;

        self.frame_count += 1;

        // Sync to disk every second so an interrupted recording keeps most of its frames
        if self.last_sync.elapsed() > Duration::from_secs(1) {
            self.sync()?;
        }

        Ok(())
    }

    fn sync(&mut self) -> Result<(), RecordingError> {
        self.file
            .flush()
            .and_then(|_| self.file.get_ref().sync_data())
            .map_err(|e| RecordingError::Write {
                details: format!("failed to sync {}: {}", self.path.display(), e),
            })?;
        self.last_sync = Instant::now();
        debug!("Synced clip {} ({} frames)", self.path.display(), self.frame_count);
        Ok(())
    }

    /// Flush, patch the frame count and close
    pub fn finish(mut self) -> Result<PathBuf, RecordingError> {
        self.file.flush().map_err(|e| RecordingError::Write {
            details: format!("failed to flush {}: {}", self.path.display(), e),
        })?;

        let mut file = self.file.into_inner().map_err(|e| RecordingError::Write {
            details: format!("failed to flush {}: {}", self.path.display(), e.error()),
        })?;

        file.seek(SeekFrom::Start(FRAME_COUNT_OFFSET))
            .and_then(|_| file.write_all(&self.frame_count.to_le_bytes()))
            .and_then(|_| file.sync_all())
            .map_err(|e| RecordingError::Write {
                details: format!("failed to finalize {}: {}", self.path.display(), e),
            })?;

        info!("Closed clip {} ({} frames)", self.path.display(), self.frame_count);
        Ok(self.path)
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Random-access clip reader
pub struct ClipReader {
    file: BufReader<File>,
    header: ClipHeader,
    path: PathBuf,
    /// Byte offset of each record
    index: Vec<u64>,
    cursor: usize,
}

impl ClipReader {
    /// Open a clip, validate its header and index its records
    pub fn open(path: &Path) -> Result<Self, RecordingError> {
        let file = File::open(path).map_err(|e| format_error(path, &e.to_string()))?;
        let file_len = file
            .metadata()
            .map_err(|e| format_error(path, &e.to_string()))?
            .len();
        let mut file = BufReader::new(file);

        let mut raw = [0u8; CLIP_HEADER_SIZE as usize];
        file.read_exact(&mut raw)
            .map_err(|e| format_error(path, &format!("failed to read header: {}", e)))?;
        let header = ClipHeader::decode(path, &raw)?;

        let max_records = file_len.saturating_sub(CLIP_HEADER_SIZE) / RECORD_HEADER_SIZE;
        if u64::from(header.frame_count) > max_records {
            return Err(format_error(
                path,
                &format!(
                    "header lists {} frames but the file can hold at most {}",
                    header.frame_count, max_records
                ),
            ));
        }

        let mut index = Vec::with_capacity(header.frame_count as usize);
        let mut offset = CLIP_HEADER_SIZE;
        let mut record = [0u8; RECORD_HEADER_SIZE as usize];
        while offset + RECORD_HEADER_SIZE <= file_len {
            file.seek(SeekFrom::Start(offset))
                .and_then(|_| file.read_exact(&mut record))
                .map_err(|e| format_error(path, &e.to_string()))?;
            let len = read_u32(&record[16..20]) as u64;
            let next = offset + RECORD_HEADER_SIZE + len;
            if next > file_len {
                warn!(
                    "Clip {} has a truncated record at byte {}, ignoring the tail",
                    path.display(),
                    offset
                );
                break;
            }
            index.push(offset);
            offset = next;
        }

        if header.frame_count != 0 && header.frame_count as usize != index.len() {
            warn!(
                "Clip {} header lists {} frames but {} were found",
                path.display(),
                header.frame_count,
                index.len()
            );
        }

        file.seek(SeekFrom::Start(CLIP_HEADER_SIZE))
            .map_err(|e| format_error(path, &e.to_string()))?;

        debug!("Opened clip {} with {} frames", path.display(), index.len());

        Ok(Self {
            file,
            header,
            path: path.to_path_buf(),
            index,
            cursor: 0,
        })
    }

    pub fn header(&self) -> &ClipHeader {
        &self.header
    }

    /// Number of complete frame records
    pub fn frame_count(&self) -> u64 {
        self.index.len() as u64
    }

    /// Index of the next frame `next_frame` will return
    pub fn position(&self) -> u64 {
        self.cursor as u64
    }

    pub fn seek(&mut self, position: u64) -> Result<(), RecordingError> {
        if position > self.frame_count() {
            return Err(format_error(
                &self.path,
                &format!(
                    "seek to frame {} past end ({} frames)",
                    position,
                    self.frame_count()
                ),
            ));
        }
        self.cursor = position as usize;
        Ok(())
    }

    /// Read the frame at the cursor and advance; `None` at end of clip
    pub fn next_frame(&mut self) -> Result<Option<Frame>, RecordingError> {
        let Some(&offset) = self.index.get(self.cursor) else {
            return Ok(None);
        };

        let mut record = [0u8; RECORD_HEADER_SIZE as usize];
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.read_exact(&mut record))
            .map_err(|e| self.read_error(e))?;

        let timestamp_nanos = u64::from_le_bytes(record[0..8].try_into().unwrap_or([0; 8]));
        let sequence = u64::from_le_bytes(record[8..16].try_into().unwrap_or([0; 8]));
        let len = read_u32(&record[16..20]) as usize;

        let mut data = vec![0u8; len];
        self.file
            .read_exact(&mut data)
            .map_err(|e| self.read_error(e))?;

        let position = self.cursor as u64;
        self.cursor += 1;

        Ok(Some(
            Frame::new(
                sequence,
                SystemTime::UNIX_EPOCH + Duration::from_nanos(timestamp_nanos),
                data,
                self.header.width,
                self.header.height,
                self.header.format,
            )
            .with_position(position),
        ))
    }

    /// Read every remaining frame
    pub fn read_all(&mut self) -> Result<Vec<Frame>, RecordingError> {
        let mut frames = Vec::with_capacity(self.index.len().saturating_sub(self.cursor));
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_error(&self, error: std::io::Error) -> RecordingError {
        if error.kind() == ErrorKind::UnexpectedEof {
            format_error(&self.path, "unexpected end of file")
        } else {
            format_error(&self.path, &error.to_string())
        }
    }
}

/// Whether a selector names a clip file
pub fn is_clip_path(selector: &str) -> bool {
    Path::new(selector)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(CLIP_EXTENSION))
        .unwrap_or(false)
}

/// Find all clip files in a directory, sorted by name
pub fn find_clips(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut clips = Vec::new();
    if !dir.exists() {
        return Ok(clips);
    }

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_clip_path(&path.to_string_lossy()) {
            clips.push(path);
        }
    }
    clips.sort();
    Ok(clips)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn format_error(path: &Path, details: &str) -> RecordingError {
    RecordingError::Format {
        path: path.display().to_string(),
        details: details.to_string(),
    }
}
