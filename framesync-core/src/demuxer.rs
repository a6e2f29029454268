//! Demuxer collaborator: container parsing lives behind this trait.

use bytes::Bytes;
use thiserror::Error;

use crate::format::{PixelFormat, Rational, SampleFormat};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DemuxError {
    #[error("Open error: {0}")]
    Open(String),
    #[error("Read error: {0}")]
    Read(String),
    #[error("Seek rejected: {0}")]
    SeekRejected(String),
    #[error("Source disconnected")]
    Disconnected,
    #[error("No such stream: {0}")]
    NoSuchStream(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    Other,
}

/// Per-stream parameters reported by the demuxer on open.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub index: u32,
    pub kind: StreamKind,
    pub time_base: Rational,
    /// Nominal frame rate for video streams
    pub frame_rate: Option<Rational>,
    /// First timestamp in `time_base` units, if the container knows it
    pub start_time: Option<i64>,
    pub width: u32,
    pub height: u32,
    pub pixel_format: Option<PixelFormat>,
    /// Codec reorders frames (B-frames)
    pub has_b_frames: bool,
    /// Every frame is a key frame
    pub intra_only: bool,
    /// Embedded still image such as album cover art
    pub attached_picture: bool,
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: Option<SampleFormat>,
}

impl StreamInfo {
    pub fn video(index: u32, time_base: Rational, frame_rate: Rational, width: u32, height: u32) -> Self {
        Self {
            index,
            kind: StreamKind::Video,
            time_base,
            frame_rate: Some(frame_rate),
            start_time: None,
            width,
            height,
            pixel_format: Some(PixelFormat::Yuv420p),
            has_b_frames: false,
            intra_only: false,
            attached_picture: false,
            sample_rate: 0,
            channels: 0,
            sample_format: None,
        }
    }

    pub fn audio(index: u32, time_base: Rational, sample_rate: u32, channels: u16, format: SampleFormat) -> Self {
        Self {
            index,
            kind: StreamKind::Audio,
            time_base,
            frame_rate: None,
            start_time: None,
            width: 0,
            height: 0,
            pixel_format: None,
            has_b_frames: false,
            intra_only: true,
            attached_picture: false,
            sample_rate,
            channels,
            sample_format: Some(format),
        }
    }

    /// Still-image sources: every position maps to one picture.
    pub fn is_cover_art(&self) -> bool {
        self.attached_picture
            || (self.intra_only
                && self
                    .frame_rate
                    .map(|r| r.num == 90_000 && r.den == 1)
                    .unwrap_or(false))
    }
}

/// A compressed packet as read from the container.
#[derive(Debug, Clone)]
pub struct Packet {
    pub stream_index: u32,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: Option<i64>,
    pub keyframe: bool,
    pub data: Bytes,
}

/// Seek direction hint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekDirection {
    /// Land on the nearest key frame at or before the target
    Backward,
    Any,
}

/// Container reader. One implementation per backend variant, chosen when the
/// producer is built.
pub trait Demuxer: Send {
    /// Streams found at open time
    fn streams(&self) -> &[StreamInfo];

    /// Next packet in file order; `Ok(None)` at end of stream.
    fn read_next_packet(&mut self) -> Result<Option<Packet>, DemuxError>;

    /// Reposition so the next read starts near `timestamp` (in the time base
    /// of `stream_index`).
    fn seek(&mut self, stream_index: u32, timestamp: i64, direction: SeekDirection) -> Result<(), DemuxError>;

    /// Live/pipe sources cannot seek
    fn is_seekable(&self) -> bool {
        true
    }

    /// Backend name for debugging
    fn name(&self) -> &str;
}

pub fn find_stream(streams: &[StreamInfo], index: u32) -> Option<&StreamInfo> {
    streams.iter().find(|s| s.index == index)
}

pub fn first_stream_of(streams: &[StreamInfo], kind: StreamKind) -> Option<&StreamInfo> {
    streams.iter().find(|s| s.kind == kind)
}
