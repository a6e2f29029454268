//! # Formats and Output Buffers
//!
//! Pixel and sample formats shared by the decoder collaborators and the
//! decode-sync loops, plus the fully converted outputs handed to callers.
//!
//! Outputs are immutable once built: payloads are `Bytes`, so cloning an
//! output (cache hit, duplicate frame, concealment) never copies pixels.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ============================================================================
// Rational
// ============================================================================

/// Rational number used for time bases and frame rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    /// Floating value, 0.0 for a zero denominator.
    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self::new(25, 1)
    }
}

// ============================================================================
// Pixel Formats
// ============================================================================

/// Pixel format of a decoded picture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Yuv420p,
    Yuv422p,
    Yuv444p,
    Nv12,
    Yuva444p,
    Rgb24,
    Rgba,
    Bgra,
    Argb,
}

impl PixelFormat {
    /// Formats that carry an alpha channel always convert to RGBA.
    pub fn has_alpha(&self) -> bool {
        matches!(self, Self::Yuva444p | Self::Rgba | Self::Bgra | Self::Argb)
    }
}

/// Image format requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageFormat {
    /// Let the producer pick the format closest to the source
    Native,
    Yuv422,
    Yuv420p,
    Rgb24,
    Rgba,
}

/// Pick the output format for a decoded pixel format.
///
/// `Native` requests, and any source with alpha, resolve to the format that
/// loses the least information.
pub fn pick_image_format(requested: ImageFormat, source: PixelFormat) -> ImageFormat {
    if source.has_alpha() {
        return ImageFormat::Rgba;
    }
    match requested {
        ImageFormat::Native => match source {
            PixelFormat::Yuv420p | PixelFormat::Nv12 => ImageFormat::Yuv420p,
            PixelFormat::Yuv422p => ImageFormat::Yuv422,
            PixelFormat::Rgb24 => ImageFormat::Rgb24,
            _ => ImageFormat::Rgba,
        },
        other => other,
    }
}

/// A converted picture, ready for the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

// ============================================================================
// Sample Formats
// ============================================================================

/// Audio sample format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    F32,
    U8Planar,
    S16Planar,
    S32Planar,
    F32Planar,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::U8 | Self::U8Planar => 1,
            Self::S16 | Self::S16Planar => 2,
            Self::S32 | Self::S32Planar | Self::F32 | Self::F32Planar => 4,
        }
    }

    pub fn is_planar(&self) -> bool {
        matches!(
            self,
            Self::U8Planar | Self::S16Planar | Self::S32Planar | Self::F32Planar
        )
    }

    /// Interleaved counterpart of a planar format.
    pub fn packed(&self) -> Self {
        match self {
            Self::U8Planar => Self::U8,
            Self::S16Planar => Self::S16,
            Self::S32Planar => Self::S32,
            Self::F32Planar => Self::F32,
            other => *other,
        }
    }

    /// Byte value that encodes silence. Unsigned 8-bit audio is centred on 0x80.
    pub fn silence_byte(&self) -> u8 {
        match self.packed() {
            Self::U8 => 0x80,
            _ => 0,
        }
    }
}

/// Interleaved audio handed to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBuffer {
    pub format: SampleFormat,
    pub frequency: u32,
    pub channels: u16,
    pub samples: usize,
    pub data: Bytes,
}

impl AudioBuffer {
    /// A buffer of `samples` frames of silence.
    pub fn silence(format: SampleFormat, frequency: u32, channels: u16, samples: usize) -> Self {
        let format = format.packed();
        let size = samples * channels as usize * format.bytes_per_sample();
        Self {
            format,
            frequency,
            channels,
            samples,
            data: Bytes::from(vec![format.silence_byte(); size]),
        }
    }

    /// Same audio in another packed format. Integer widths are rescaled by
    /// shifting; float is clamped to [-1.0, 1.0].
    pub fn to_format(&self, target: SampleFormat) -> AudioBuffer {
        let target = target.packed();
        if target == self.format {
            return self.clone();
        }
        let from = self.format.bytes_per_sample();
        let mut data = Vec::with_capacity(self.data.len() / from * target.bytes_per_sample());
        for chunk in self.data.chunks_exact(from) {
            write_sample(&mut data, target, read_sample(self.format, chunk));
        }
        AudioBuffer {
            format: target,
            frequency: self.frequency,
            channels: self.channels,
            samples: self.samples,
            data: Bytes::from(data),
        }
    }
}

/// Decode one packed sample to full-scale i32
fn read_sample(format: SampleFormat, bytes: &[u8]) -> i32 {
    match format.packed() {
        SampleFormat::U8 => (bytes[0] as i32 - 0x80) << 24,
        SampleFormat::S16 => (i16::from_le_bytes([bytes[0], bytes[1]]) as i32) << 16,
        SampleFormat::S32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        _ => {
            let value = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            (value.clamp(-1.0, 1.0) as f64 * i32::MAX as f64) as i32
        }
    }
}

fn write_sample(dest: &mut Vec<u8>, format: SampleFormat, value: i32) {
    match format.packed() {
        SampleFormat::U8 => dest.push(((value >> 24) + 0x80) as u8),
        SampleFormat::S16 => dest.extend_from_slice(&((value >> 16) as i16).to_le_bytes()),
        SampleFormat::S32 => dest.extend_from_slice(&value.to_le_bytes()),
        _ => dest.extend_from_slice(&((value as f64 / i32::MAX as f64) as f32).to_le_bytes()),
    }
}

// ============================================================================
// Sample Calculator
// ============================================================================

/// Number of samples that lie before frame `position`.
pub fn samples_to_position(fps: f64, frequency: u32, position: i64) -> i64 {
    if fps == 0.0 {
        return 0;
    }
    let rounding = if position < 0 { -0.5 } else { 0.5 };
    (position as f64 * frequency as f64 / fps + rounding) as i64
}

/// Number of samples belonging to frame `position`.
///
/// Cumulative boundaries are rounded independently, so the sum over any run
/// of frames never drifts from the exact sample count.
pub fn frame_samples(fps: f64, frequency: u32, position: i64) -> usize {
    let samples = samples_to_position(fps, frequency, position + 1)
        - samples_to_position(fps, frequency, position);
    samples.max(0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_samples_ntsc_cadence() {
        let fps = 30000.0 / 1001.0;
        let counts: Vec<usize> = (0..5).map(|p| frame_samples(fps, 48000, p)).collect();
        assert_eq!(counts, vec![1602, 1601, 1602, 1601, 1602]);

        let total: usize = (0..30_000).map(|p| frame_samples(fps, 48000, p)).sum();
        assert_eq!(total as i64, samples_to_position(fps, 48000, 30_000));
    }

    #[test]
    fn test_silence_values() {
        let u8_silence = AudioBuffer::silence(SampleFormat::U8, 8000, 1, 4);
        assert_eq!(&u8_silence.data[..], &[0x80; 4]);

        let f32_silence = AudioBuffer::silence(SampleFormat::F32Planar, 48000, 2, 2);
        assert_eq!(f32_silence.format, SampleFormat::F32);
        assert_eq!(f32_silence.data.len(), 16);
        assert!(f32_silence.data.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_sample_conversion() {
        let mut data = Vec::new();
        for value in [0i16, 0x4000, -0x8000] {
            data.extend_from_slice(&value.to_le_bytes());
        }
        let s16 = AudioBuffer {
            format: SampleFormat::S16,
            frequency: 48000,
            channels: 1,
            samples: 3,
            data: Bytes::from(data),
        };

        let unsigned = s16.to_format(SampleFormat::U8);
        assert_eq!(&unsigned.data[..], &[0x80, 0xC0, 0x00]);

        let float = s16.to_format(SampleFormat::F32Planar);
        assert_eq!(float.format, SampleFormat::F32);
        let half = f32::from_le_bytes([float.data[4], float.data[5], float.data[6], float.data[7]]);
        assert!((half - 0.5).abs() < 1e-4);

        let back = float.to_format(SampleFormat::S16);
        assert_eq!(i16::from_le_bytes([back.data[2], back.data[3]]), 0x3FFF);
    }

    #[test]
    fn test_pick_image_format() {
        assert_eq!(
            pick_image_format(ImageFormat::Native, PixelFormat::Yuv420p),
            ImageFormat::Yuv420p
        );
        assert_eq!(
            pick_image_format(ImageFormat::Yuv422, PixelFormat::Bgra),
            ImageFormat::Rgba
        );
        assert_eq!(
            pick_image_format(ImageFormat::Rgb24, PixelFormat::Nv12),
            ImageFormat::Rgb24
        );
    }
}
