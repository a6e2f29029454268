//! # Synthetic Backend
//!
//! Deterministic in-memory implementations of the demuxer, decoder and
//! converter collaborators. Every video payload starts with its display
//! index as a little-endian `i64`, so a converted image tells exactly which
//! frame it came from. Audio payloads count samples, so gaps and repeats are
//! visible too.
//!
//! Used by the test suite and the probe tool.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::decode::{
    AudioDecoder, AudioFrame, ConvertError, DecodeError, ImageConverter, MediaBackend, Received,
    VideoDecoder, VideoFrame,
};
use crate::demuxer::{DemuxError, Demuxer, Packet, SeekDirection, StreamInfo, StreamKind};
use crate::format::{pick_image_format, Image, ImageFormat, Rational, SampleFormat};

const CORRUPT_FLAG: u8 = 0xEE;

// ============================================================================
// Source Description
// ============================================================================

/// Counters shared by every demuxer opened from one source
#[derive(Debug, Default)]
pub struct SyntheticStats {
    reads: AtomicUsize,
    seeks: AtomicUsize,
    opens: AtomicUsize,
    seek_log: Mutex<Vec<(u32, i64)>>,
}

impl SyntheticStats {
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn seeks(&self) -> usize {
        self.seeks.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn seek_log(&self) -> Vec<(u32, i64)> {
        self.seek_log.lock().clone()
    }
}

#[derive(Debug, Clone)]
struct VideoLayout {
    frames: i64,
    time_base: Rational,
    frame_rate: Rational,
    gop: i64,
    b_frames: bool,
    first_pts: i64,
    missing_pts: usize,
    durations: Vec<i64>,
    corrupt: HashSet<i64>,
    cover_art: bool,
}

impl VideoLayout {
    fn ticks_per_frame(&self) -> i64 {
        let num = self.time_base.den * self.frame_rate.den;
        let den = self.time_base.num * self.frame_rate.num;
        if den == 0 {
            1
        } else {
            (num / den).max(1)
        }
    }

    /// Display indexes in decode order
    fn decode_order(&self) -> Vec<i64> {
        if !self.b_frames {
            return (0..self.frames).collect();
        }
        let mut order = Vec::with_capacity(self.frames as usize);
        if self.frames > 0 {
            order.push(0);
        }
        let mut anchor = 3;
        while anchor < self.frames {
            order.extend([anchor, anchor - 2, anchor - 1]);
            anchor += 3;
        }
        for index in (anchor - 2).max(1)..self.frames {
            order.push(index);
        }
        order
    }
}

#[derive(Debug, Clone)]
struct AudioLayout {
    sample_rate: u32,
    channels: u16,
    samples_per_packet: usize,
    format: SampleFormat,
}

/// Builder for a synthetic media source
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    video: Option<VideoLayout>,
    audio: Vec<AudioLayout>,
    audio_seconds: Option<f64>,
    audio_offset: f64,
    seekable: bool,
    reject_seeks: bool,
    disconnect_after: Option<usize>,
    stats: Arc<SyntheticStats>,
}

impl SyntheticSource {
    /// `frames` frames at 25 fps, time base 1/25, a key frame every 12 frames
    pub fn video(frames: i64) -> Self {
        Self {
            video: Some(VideoLayout {
                frames,
                time_base: Rational::new(1, 25),
                frame_rate: Rational::new(25, 1),
                gop: 12,
                b_frames: false,
                first_pts: 0,
                missing_pts: 0,
                durations: Vec::new(),
                corrupt: HashSet::new(),
                cover_art: false,
            }),
            audio: Vec::new(),
            audio_seconds: None,
            audio_offset: 0.0,
            seekable: true,
            reject_seeks: false,
            disconnect_after: None,
            stats: Arc::new(SyntheticStats::default()),
        }
    }

    /// Audio only, lasting `seconds`
    pub fn audio_only(seconds: f64) -> Self {
        let mut source = Self::video(0);
        source.video = None;
        source.audio_seconds = Some(seconds);
        source
    }

    /// Single still picture flagged as cover art
    pub fn cover_art() -> Self {
        let mut source = Self::video(1);
        if let Some(video) = source.video.as_mut() {
            video.cover_art = true;
            video.gop = 1;
        }
        source
    }

    fn video_mut(&mut self) -> &mut VideoLayout {
        self.video.get_or_insert_with(|| VideoLayout {
            frames: 0,
            time_base: Rational::new(1, 25),
            frame_rate: Rational::new(25, 1),
            gop: 12,
            b_frames: false,
            first_pts: 0,
            missing_pts: 0,
            durations: Vec::new(),
            corrupt: HashSet::new(),
            cover_art: false,
        })
    }

    /// Add an interleaved S16 audio track
    pub fn with_audio(self, sample_rate: u32, channels: u16, samples_per_packet: usize) -> Self {
        self.with_audio_format(sample_rate, channels, samples_per_packet, SampleFormat::S16)
    }

    pub fn with_audio_format(mut self, sample_rate: u32, channels: u16, samples_per_packet: usize, format: SampleFormat) -> Self {
        self.audio.push(AudioLayout {
            sample_rate,
            channels,
            samples_per_packet: samples_per_packet.max(1),
            format,
        });
        self
    }

    /// Start every audio track `seconds` late
    pub fn with_audio_offset(mut self, seconds: f64) -> Self {
        self.audio_offset = seconds;
        self
    }

    pub fn with_time_base(mut self, time_base: Rational) -> Self {
        self.video_mut().time_base = time_base;
        self
    }

    pub fn with_frame_rate(mut self, frame_rate: Rational) -> Self {
        self.video_mut().frame_rate = frame_rate;
        self
    }

    pub fn with_gop(mut self, gop: i64) -> Self {
        self.video_mut().gop = gop.max(1);
        self
    }

    /// Reordered stream: I/P anchors every third frame, two B-frames between
    pub fn with_b_frames(mut self) -> Self {
        self.video_mut().b_frames = true;
        self
    }

    /// Offset every video timestamp
    pub fn with_first_pts(mut self, first_pts: i64) -> Self {
        self.video_mut().first_pts = first_pts;
        self
    }

    /// Leave PTS unset on the first `count` video packets
    pub fn with_missing_pts(mut self, count: usize) -> Self {
        self.video_mut().missing_pts = count;
        self
    }

    /// Per-packet durations, cycled
    pub fn with_durations(mut self, durations: Vec<i64>) -> Self {
        self.video_mut().durations = durations;
        self
    }

    /// Frames (display index) whose decode fails
    pub fn with_corrupt_frames<I: IntoIterator<Item = i64>>(mut self, frames: I) -> Self {
        self.video_mut().corrupt.extend(frames);
        self
    }

    pub fn live(mut self) -> Self {
        self.seekable = false;
        self
    }

    pub fn rejecting_seeks(mut self) -> Self {
        self.reject_seeks = true;
        self
    }

    /// Fail every read after `reads` successful ones
    pub fn disconnect_after(mut self, reads: usize) -> Self {
        self.disconnect_after = Some(reads);
        self
    }

    pub fn stats(&self) -> Arc<SyntheticStats> {
        self.stats.clone()
    }

    fn video_index(&self) -> Option<u32> {
        self.video.as_ref().map(|_| 0)
    }

    fn audio_index(&self, track: usize) -> u32 {
        track as u32 + self.video_index().map(|_| 1).unwrap_or(0)
    }

    pub fn streams(&self) -> Vec<StreamInfo> {
        let mut streams = Vec::new();
        if let Some(video) = &self.video {
            let mut info = StreamInfo::video(0, video.time_base, video.frame_rate, 4, 2);
            info.has_b_frames = video.b_frames;
            info.intra_only = video.gop == 1;
            info.attached_picture = video.cover_art;
            streams.push(info);
        }
        for (track, audio) in self.audio.iter().enumerate() {
            streams.push(StreamInfo::audio(
                self.audio_index(track),
                Rational::new(1, audio.sample_rate as i64),
                audio.sample_rate,
                audio.channels,
                audio.format,
            ));
        }
        streams
    }

    fn duration_seconds(&self) -> f64 {
        match (&self.video, self.audio_seconds) {
            (_, Some(seconds)) => seconds,
            (Some(video), None) => video.frames as f64 / video.frame_rate.as_f64(),
            (None, None) => 0.0,
        }
    }

    /// All packets in file order, each with its time in seconds
    fn packets(&self) -> Vec<(f64, Packet)> {
        let mut packets = Vec::new();

        if let Some(video) = &self.video {
            let ticks = video.ticks_per_frame();
            let tb = video.time_base.as_f64();
            for (decode_index, display) in video.decode_order().into_iter().enumerate() {
                let pts = video.first_pts + display * ticks;
                let dts = if video.b_frames {
                    video.first_pts + (decode_index as i64 - 1) * ticks
                } else {
                    pts
                };
                let duration = if video.durations.is_empty() {
                    ticks
                } else {
                    video.durations[decode_index % video.durations.len()]
                };
                let mut data = BytesMut::with_capacity(16);
                data.put_i64_le(display);
                data.put_u8(if video.corrupt.contains(&display) { CORRUPT_FLAG } else { 0 });
                data.put_bytes(0x10, 7);
                packets.push((
                    dts as f64 * tb,
                    Packet {
                        stream_index: 0,
                        pts: (decode_index >= video.missing_pts).then_some(pts),
                        dts: Some(dts),
                        duration: Some(duration),
                        keyframe: display % video.gop == 0,
                        data: data.freeze(),
                    },
                ));
            }
        }

        let seconds = self.duration_seconds();
        for (track, audio) in self.audio.iter().enumerate() {
            let total = (seconds * audio.sample_rate as f64).round() as usize;
            let bps = audio.format.bytes_per_sample();
            let offset = (self.audio_offset * audio.sample_rate as f64).round() as i64;
            let mut start = 0;
            while start < total {
                let samples = audio.samples_per_packet.min(total - start);
                let mut data = BytesMut::with_capacity(samples * audio.channels as usize * bps);
                for s in start..start + samples {
                    for _ in 0..audio.channels {
                        match audio.format.packed() {
                            SampleFormat::U8 => data.put_u8((s % 256) as u8),
                            SampleFormat::S16 => data.put_i16_le(s as i16),
                            SampleFormat::S32 => data.put_i32_le(s as i32),
                            _ => data.put_f32_le(s as f32),
                        }
                    }
                }
                let pts = start as i64 + offset;
                packets.push((
                    pts as f64 / audio.sample_rate as f64,
                    Packet {
                        stream_index: self.audio_index(track),
                        pts: Some(pts),
                        dts: Some(pts),
                        duration: Some(samples as i64),
                        keyframe: true,
                        data: data.freeze(),
                    },
                ));
                start += samples;
            }
        }

        // Audio first at equal times, so a reader meets it before the video
        packets.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| (a.1.stream_index == 0).cmp(&(b.1.stream_index == 0)))
        });
        packets
    }
}

// ============================================================================
// Demuxer
// ============================================================================

pub struct SyntheticDemuxer {
    streams: Vec<StreamInfo>,
    packets: Vec<(f64, Packet)>,
    cursor: usize,
    seekable: bool,
    reject_seeks: bool,
    disconnect_after: Option<usize>,
    reads: usize,
    stats: Arc<SyntheticStats>,
}

impl SyntheticDemuxer {
    pub fn new(source: SyntheticSource) -> Self {
        Self {
            streams: source.streams(),
            packets: source.packets(),
            cursor: 0,
            seekable: source.seekable,
            reject_seeks: source.reject_seeks,
            disconnect_after: source.disconnect_after,
            reads: 0,
            stats: source.stats.clone(),
        }
    }
}

impl Demuxer for SyntheticDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_next_packet(&mut self) -> Result<Option<Packet>, DemuxError> {
        self.stats.reads.fetch_add(1, Ordering::SeqCst);
        if self.disconnect_after.is_some_and(|limit| self.reads >= limit) {
            return Err(DemuxError::Disconnected);
        }
        self.reads += 1;
        let packet = self.packets.get(self.cursor).map(|(_, p)| p.clone());
        if packet.is_some() {
            self.cursor += 1;
        }
        Ok(packet)
    }

    fn seek(&mut self, stream_index: u32, timestamp: i64, direction: SeekDirection) -> Result<(), DemuxError> {
        self.stats.seeks.fetch_add(1, Ordering::SeqCst);
        self.stats.seek_log.lock().push((stream_index, timestamp));
        if !self.seekable || self.reject_seeks {
            return Err(DemuxError::SeekRejected(format!("timestamp {}", timestamp)));
        }

        let stream = self
            .streams
            .iter()
            .find(|s| s.index == stream_index)
            .ok_or(DemuxError::NoSuchStream(stream_index))?;
        let is_video = stream.kind == StreamKind::Video;

        let landing = self
            .packets
            .iter()
            .filter(|(_, p)| p.stream_index == stream_index)
            .filter(|(_, p)| !is_video || direction == SeekDirection::Any || p.keyframe)
            .filter(|(_, p)| p.pts.or(p.dts).unwrap_or(0) <= timestamp)
            .map(|(time, _)| *time)
            .fold(None, |latest: Option<f64>, time| Some(latest.map_or(time, |l| l.max(time))))
            .unwrap_or(0.0);

        self.cursor = self
            .packets
            .iter()
            .position(|(time, _)| *time >= landing)
            .unwrap_or(self.packets.len());
        Ok(())
    }

    fn is_seekable(&self) -> bool {
        self.seekable
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

// ============================================================================
// Decoders
// ============================================================================

pub struct SyntheticVideoDecoder {
    width: u32,
    height: u32,
    reorder_depth: usize,
    pending: Vec<VideoFrame>,
    draining: bool,
}

impl SyntheticVideoDecoder {
    pub fn new(stream: &StreamInfo) -> Self {
        Self {
            width: stream.width,
            height: stream.height,
            reorder_depth: if stream.has_b_frames { 2 } else { 0 },
            pending: Vec::new(),
            draining: false,
        }
    }
}

impl VideoDecoder for SyntheticVideoDecoder {
    fn send(&mut self, packet: Option<&Packet>) -> Result<(), DecodeError> {
        let Some(packet) = packet else {
            self.draining = true;
            return Ok(());
        };
        if packet.data.len() < 9 {
            return Err(DecodeError::InvalidInput("short packet".into()));
        }
        if packet.data[8] == CORRUPT_FLAG {
            return Err(DecodeError::DecodeFailed("corrupt picture".into()));
        }
        self.pending.push(VideoFrame {
            pts: packet.pts,
            dts: packet.dts,
            key_frame: packet.keyframe,
            width: self.width,
            height: self.height,
            pixel_format: crate::format::PixelFormat::Yuv420p,
            planes: vec![packet.data.clone()],
        });
        Ok(())
    }

    fn receive(&mut self) -> Result<Received<VideoFrame>, DecodeError> {
        if self.pending.len() > self.reorder_depth || (self.draining && !self.pending.is_empty()) {
            let next = self
                .pending
                .iter()
                .enumerate()
                .min_by_key(|(_, f)| f.pts.or(f.dts).unwrap_or(i64::MIN))
                .map(|(i, _)| i)
                .unwrap_or(0);
            return Ok(Received::Frame(self.pending.remove(next)));
        }
        if self.draining {
            Ok(Received::EndOfStream)
        } else {
            Ok(Received::NeedMoreInput)
        }
    }

    fn flush(&mut self) {
        self.pending.clear();
        self.draining = false;
    }

    fn name(&self) -> &str {
        "synthetic-video"
    }
}

pub struct SyntheticAudioDecoder {
    format: SampleFormat,
    sample_rate: u32,
    channels: u16,
    pending: Option<AudioFrame>,
    draining: bool,
}

impl SyntheticAudioDecoder {
    pub fn new(stream: &StreamInfo) -> Self {
        Self {
            format: stream.sample_format.unwrap_or(SampleFormat::S16),
            sample_rate: stream.sample_rate,
            channels: stream.channels.max(1),
            pending: None,
            draining: false,
        }
    }

    /// Split interleaved payload into channel planes
    fn planes(&self, data: &Bytes) -> Vec<Bytes> {
        if !self.format.is_planar() {
            return vec![data.clone()];
        }
        let bps = self.format.bytes_per_sample();
        let channels = self.channels as usize;
        let mut planes = vec![BytesMut::new(); channels];
        for (i, sample) in data.chunks_exact(bps).enumerate() {
            planes[i % channels].extend_from_slice(sample);
        }
        planes.into_iter().map(BytesMut::freeze).collect()
    }
}

impl AudioDecoder for SyntheticAudioDecoder {
    fn send(&mut self, packet: Option<&Packet>) -> Result<(), DecodeError> {
        let Some(packet) = packet else {
            self.draining = true;
            return Ok(());
        };
        let frame_bytes = self.channels as usize * self.format.bytes_per_sample();
        self.pending = Some(AudioFrame {
            pts: packet.pts,
            format: self.format,
            sample_rate: self.sample_rate,
            channels: self.channels,
            samples: packet.data.len() / frame_bytes,
            planes: self.planes(&packet.data),
        });
        Ok(())
    }

    fn receive(&mut self) -> Result<Received<AudioFrame>, DecodeError> {
        match self.pending.take() {
            Some(frame) => Ok(Received::Frame(frame)),
            None if self.draining => Ok(Received::EndOfStream),
            None => Ok(Received::NeedMoreInput),
        }
    }

    fn flush(&mut self) {
        self.pending = None;
        self.draining = false;
    }

    fn name(&self) -> &str {
        "synthetic-audio"
    }
}

// ============================================================================
// Converter and Backend
// ============================================================================

/// Copies planes verbatim and labels them with the resolved format
pub struct PassthroughConverter;

impl ImageConverter for PassthroughConverter {
    fn convert(&self, frame: &VideoFrame, target: ImageFormat, width: u32, height: u32) -> Result<Image, ConvertError> {
        let format = pick_image_format(target, frame.pixel_format);
        let data = match frame.planes.as_slice() {
            [single] => single.clone(),
            planes => {
                let mut joined = BytesMut::new();
                for plane in planes {
                    joined.extend_from_slice(plane);
                }
                joined.freeze()
            }
        };
        Ok(Image {
            format,
            width,
            height,
            data,
        })
    }
}

pub struct SyntheticBackend {
    source: SyntheticSource,
    converter: PassthroughConverter,
}

impl SyntheticBackend {
    pub fn new(source: SyntheticSource) -> Self {
        Self {
            source,
            converter: PassthroughConverter,
        }
    }

    pub fn stats(&self) -> Arc<SyntheticStats> {
        self.source.stats()
    }
}

impl MediaBackend for SyntheticBackend {
    fn open(&self, source: &str) -> Result<Box<dyn Demuxer>, DemuxError> {
        self.source.stats.opens.fetch_add(1, Ordering::SeqCst);
        if source.is_empty() {
            return Err(DemuxError::Open("empty source name".into()));
        }
        Ok(Box::new(SyntheticDemuxer::new(self.source.clone())))
    }

    fn video_decoder(&self, stream: &StreamInfo, _threads: usize) -> Result<Box<dyn VideoDecoder>, DecodeError> {
        Ok(Box::new(SyntheticVideoDecoder::new(stream)))
    }

    fn audio_decoder(&self, stream: &StreamInfo) -> Result<Box<dyn AudioDecoder>, DecodeError> {
        Ok(Box::new(SyntheticAudioDecoder::new(stream)))
    }

    fn converter(&self) -> &dyn ImageConverter {
        &self.converter
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

/// Display index stored at the start of a synthetic picture
pub fn frame_index(image: &Image) -> Option<i64> {
    let bytes: [u8; 8] = image.data.get(..8)?.try_into().ok()?;
    Some(i64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_b_frame_decode_order() {
        let source = SyntheticSource::video(8).with_b_frames();
        let order = source.video.as_ref().unwrap().decode_order();
        assert_eq!(order, vec![0, 3, 1, 2, 6, 4, 5, 7]);
    }

    #[test]
    fn test_seek_lands_on_key_frame() {
        let source = SyntheticSource::video(40).with_gop(10);
        let mut demuxer = SyntheticDemuxer::new(source);
        demuxer.seek(0, 25, SeekDirection::Backward).unwrap();
        let packet = demuxer.read_next_packet().unwrap().unwrap();
        assert_eq!(packet.pts, Some(20));
        assert!(packet.keyframe);
    }

    #[test]
    fn test_reorder_decoder_outputs_display_order() {
        let source = SyntheticSource::video(7).with_b_frames();
        let streams = source.streams();
        let mut demuxer = SyntheticDemuxer::new(source);
        let mut decoder = SyntheticVideoDecoder::new(&streams[0]);
        let mut shown = Vec::new();
        while let Some(packet) = demuxer.read_next_packet().unwrap() {
            decoder.send(Some(&packet)).unwrap();
            while let Received::Frame(f) = decoder.receive().unwrap() {
                shown.push(f.pts.unwrap());
            }
        }
        decoder.send(None).unwrap();
        while let Received::Frame(f) = decoder.receive().unwrap() {
            shown.push(f.pts.unwrap());
        }
        assert_eq!(shown, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_audio_precedes_video_at_same_time() {
        let source = SyntheticSource::video(2).with_audio(1000, 1, 40);
        let mut demuxer = SyntheticDemuxer::new(source);
        let first = demuxer.read_next_packet().unwrap().unwrap();
        assert_eq!(first.stream_index, 1);
    }
}
