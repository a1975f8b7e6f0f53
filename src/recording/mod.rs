mod clip;
mod sink;
mod writer;
#[cfg(test)]
mod tests;

pub use clip::{find_clips, is_clip_path, ClipHeader, ClipReader, ClipWriter, CLIP_EXTENSION};
pub use sink::{
    sidecar_path, RecordingRequest, RecordingSink, RecordingStarted, RecordingSummary, StopReason,
};
pub use writer::{open_writer, ClipVideoWriter, Codec, VideoWriter, WriterParams};
