//! # Decoder Collaborators
//!
//! Narrow interfaces to the codec backend. Bitstream decoding, pixel
//! conversion and container parsing all live behind these traits; the
//! decode-sync loops only schedule them.
//!
//! A [`MediaBackend`] bundles one implementation of each and is chosen when
//! the producer is constructed.

use bytes::Bytes;
use thiserror::Error;

use crate::demuxer::{DemuxError, Demuxer, Packet, StreamInfo};
use crate::format::{Image, ImageFormat, PixelFormat, SampleFormat};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Unsupported codec for stream {0}")]
    UnsupportedCodec(u32),
    #[error("Decode failed: {0}")]
    DecodeFailed(String),
    #[error("Decoder rejected input: {0}")]
    InvalidInput(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("Cannot convert {from:?} to {to:?}")]
    Unsupported { from: PixelFormat, to: ImageFormat },
    #[error("Conversion failed: {0}")]
    Failed(String),
}

/// A decoded picture
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub key_frame: bool,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub planes: Vec<Bytes>,
}

/// A decoded block of audio samples
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub pts: Option<i64>,
    pub format: SampleFormat,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: usize,
    /// One plane per channel for planar formats, a single plane otherwise
    pub planes: Vec<Bytes>,
}

/// Result of polling a decoder
#[derive(Debug)]
pub enum Received<F> {
    Frame(F),
    NeedMoreInput,
    EndOfStream,
}

/// Video decoder for one stream
pub trait VideoDecoder: Send {
    /// Feed a packet, or `None` to start draining buffered frames
    fn send(&mut self, packet: Option<&Packet>) -> Result<(), DecodeError>;

    fn receive(&mut self) -> Result<Received<VideoFrame>, DecodeError>;

    /// Drop buffered and reordered frames
    fn flush(&mut self);

    /// Skip decoding of non-reference frames while fast-forwarding
    fn set_skip_nonref(&mut self, _skip: bool) {}

    fn name(&self) -> &str;
}

/// Audio decoder for one stream
pub trait AudioDecoder: Send {
    fn send(&mut self, packet: Option<&Packet>) -> Result<(), DecodeError>;

    fn receive(&mut self) -> Result<Received<AudioFrame>, DecodeError>;

    fn flush(&mut self);

    fn name(&self) -> &str;
}

/// Scaler / pixel converter. Holds no per-stream state.
pub trait ImageConverter: Send + Sync {
    fn convert(&self, frame: &VideoFrame, target: ImageFormat, width: u32, height: u32) -> Result<Image, ConvertError>;
}

/// Backend variant: opens sources and builds decoders for their streams.
pub trait MediaBackend: Send + Sync {
    fn open(&self, source: &str) -> Result<Box<dyn Demuxer>, DemuxError>;

    fn video_decoder(&self, stream: &StreamInfo, threads: usize) -> Result<Box<dyn VideoDecoder>, DecodeError>;

    fn audio_decoder(&self, stream: &StreamInfo) -> Result<Box<dyn AudioDecoder>, DecodeError>;

    fn converter(&self) -> &dyn ImageConverter;

    /// Get backend name for debugging
    fn name(&self) -> &str;
}

/// Interleave planar channel data into `dest`.
pub fn planar_to_interleaved(dest: &mut Vec<u8>, planes: &[Bytes], samples: usize, bytes_per_sample: usize) {
    let channels = planes.len();
    dest.reserve(samples * channels * bytes_per_sample);
    for s in 0..samples {
        let offset = s * bytes_per_sample;
        for plane in planes {
            match plane.get(offset..offset + bytes_per_sample) {
                Some(sample) => dest.extend_from_slice(sample),
                None => dest.extend(std::iter::repeat(0).take(bytes_per_sample)),
            }
        }
    }
}

/// Append an audio frame to an interleaved byte buffer.
pub fn append_interleaved(dest: &mut Vec<u8>, frame: &AudioFrame) {
    let bps = frame.format.bytes_per_sample();
    if frame.format.is_planar() {
        planar_to_interleaved(dest, &frame.planes, frame.samples, bps);
    } else if let Some(plane) = frame.planes.first() {
        let size = (frame.samples * frame.channels as usize * bps).min(plane.len());
        dest.extend_from_slice(&plane[..size]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_planar_to_interleaved() {
        let left = Bytes::from_static(&[1, 0, 2, 0]);
        let right = Bytes::from_static(&[9, 0, 8, 0]);
        let mut out = Vec::new();
        planar_to_interleaved(&mut out, &[left, right], 2, 2);
        assert_eq!(out, vec![1, 0, 9, 0, 2, 0, 8, 0]);
    }

    #[test]
    fn test_append_packed_frame() {
        let frame = AudioFrame {
            pts: Some(0),
            format: SampleFormat::U8,
            sample_rate: 8000,
            channels: 1,
            samples: 3,
            planes: vec![Bytes::from_static(&[10, 20, 30, 40])],
        };
        let mut out = vec![7];
        append_interleaved(&mut out, &frame);
        assert_eq!(out, vec![7, 10, 20, 30]);
    }
}
