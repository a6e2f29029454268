// Audio Decode-Sync Loop
// Per-track accumulation buffers, drift correction, silence fill

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::config::ProducerConfig;
use crate::decode::{append_interleaved, AudioDecoder, MediaBackend, Received};
use crate::demuxer::{Packet, StreamInfo};
use crate::format::{frame_samples, AudioBuffer, SampleFormat};
use crate::packet_queue::Popped;
use crate::producer::ProducerError;
use crate::seek::{plan_audio_seek, SeekPlan, POSITION_INITIAL};
use crate::session::{ReadEndAction, Session};

// ============================================================================
// Types
// ============================================================================

/// Drift correction state, live only while correcting
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncState {
    /// A corrective re-seek was issued during this request
    pub is_synchronizing: bool,
    /// Frames the buffer may run ahead before a re-seek
    pub drift_frames: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioStats {
    pub packets_decoded: u64,
    pub decode_errors: u64,
    pub samples_ignored: u64,
    pub resyncs: u64,
    pub silence_samples: u64,
}

/// One selected audio stream and its decoded, interleaved backlog
struct AudioTrack {
    stream: StreamInfo,
    decoder: Box<dyn AudioDecoder>,
    format: SampleFormat,
    channels: u16,
    buffer: Vec<u8>,
    /// Samples still to discard from the front
    ignore: usize,
}

impl AudioTrack {
    fn frame_bytes(&self) -> usize {
        self.channels as usize * self.format.bytes_per_sample()
    }

    fn used(&self) -> usize {
        self.buffer.len() / self.frame_bytes().max(1)
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.ignore = 0;
    }

    /// Drop up to `ignore` samples from the front. Returns how many went.
    fn apply_ignore(&mut self) -> usize {
        let n = self.ignore.min(self.used());
        if n > 0 {
            self.ignore -= n;
            self.buffer.drain(..n * self.frame_bytes());
        }
        n
    }

    fn ready(&self, samples: usize) -> bool {
        self.used() >= samples && self.ignore == 0
    }

    /// Remove up to `samples` from the front
    fn take(&mut self, samples: usize) -> Vec<u8> {
        let n = samples.min(self.used()) * self.frame_bytes();
        self.buffer.drain(..n).collect()
    }
}

enum FillEnd {
    Ready,
    Exhausted,
    Reopen,
    Closed,
}

// ============================================================================
// Audio Loop
// ============================================================================

pub struct AudioLoop {
    session: Arc<Session>,
    tracks: Vec<AudioTrack>,
    config: ProducerConfig,
    /// One past the last delivered application position
    expected: i64,
    seen_generation: u64,
    sync: SyncState,
    needs_reopen: bool,
    stats: AudioStats,
}

impl AudioLoop {
    pub fn new(session: Arc<Session>, backend: &dyn MediaBackend, config: &ProducerConfig) -> Result<Self, ProducerError> {
        let mut tracks = Vec::new();
        for stream in session.audio_streams() {
            let decoder = backend
                .audio_decoder(stream)
                .map_err(|e| ProducerError::Open(format!("audio decoder: {}", e)))?;
            tracks.push(AudioTrack {
                format: stream.sample_format.unwrap_or(SampleFormat::S16).packed(),
                channels: stream.channels.max(1),
                stream: stream.clone(),
                decoder,
                buffer: Vec::new(),
                ignore: 0,
            });
        }
        if tracks.is_empty() {
            return Err(ProducerError::NoAudio);
        }

        let seen_generation = session.queues().generation();
        Ok(Self {
            session,
            tracks,
            expected: POSITION_INITIAL,
            seen_generation,
            sync: SyncState {
                is_synchronizing: false,
                drift_frames: config.audio_drift_frames,
            },
            config: config.clone(),
            needs_reopen: false,
            stats: AudioStats::default(),
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn stats(&self) -> AudioStats {
        self.stats
    }

    pub fn expected(&self) -> i64 {
        self.expected
    }

    pub fn needs_reopen(&self) -> bool {
        self.needs_reopen
    }

    fn sample_rate(&self) -> u32 {
        self.tracks[0].stream.sample_rate
    }

    fn format(&self) -> SampleFormat {
        self.tracks[0].format
    }

    fn total_channels(&self) -> u16 {
        self.tracks.iter().map(|t| t.channels).sum()
    }

    fn multi_track(&self) -> bool {
        self.tracks.len() > 1
    }

    fn anchor_seconds(&self) -> f64 {
        self.session.anchor_seconds().unwrap_or(0.0)
    }

    /// Audio for application `position`. `samples` overrides the count
    /// derived from the output frame rate.
    pub fn get(&mut self, position: i64, samples: Option<usize>) -> Result<AudioBuffer, ProducerError> {
        let fps = self.config.output_fps();
        let rate = self.sample_rate();
        let samples = samples.unwrap_or_else(|| frame_samples(fps, rate, position));
        let real_timecode = position as f64 / fps;

        self.observe_generation();

        let paused = match plan_audio_seek(
            position,
            self.expected,
            self.config.mute_on_pause,
            self.config.seek_threshold(),
            self.session.is_seekable(),
        ) {
            SeekPlan::Paused => true,
            SeekPlan::Seek => {
                // The first seek lands a little early so decoding can settle
                let timecode = if self.expected > 0 {
                    real_timecode
                } else {
                    (real_timecode - self.config.audio_preroll_seconds).max(0.0)
                };
                !self.seek(timecode)
            }
            SeekPlan::Continue => false,
        };

        if paused {
            self.stats.silence_samples += samples as u64;
            return Ok(AudioBuffer::silence(self.format(), rate, self.total_channels(), samples));
        }

        let end = self.fill(position, samples, real_timecode, fps);
        self.sync.is_synchronizing = false;
        match end {
            FillEnd::Closed => return Err(ProducerError::Closed),
            FillEnd::Reopen => self.needs_reopen = true,
            FillEnd::Ready | FillEnd::Exhausted => {}
        }

        let buffer = self.assemble(samples);
        self.expected = position + 1;
        Ok(buffer)
    }

    // ========================================================================
    // Seeking
    // ========================================================================

    /// Seek to `timecode` seconds after the anchor. Returns false when the
    /// demuxer rejected it.
    fn seek(&mut self, timecode: f64) -> bool {
        let absolute = self.anchor_seconds() + timecode;
        tracing::debug!("Audio seek to {:.3}s (expected {})", absolute, self.expected);
        let result = self.session.seek().seek_to_seconds(absolute);
        self.flush_tracks();
        match result {
            Ok(generation) => {
                self.seen_generation = generation;
                true
            }
            Err(_) => false,
        }
    }

    fn flush_tracks(&mut self) {
        for track in &mut self.tracks {
            track.decoder.flush();
            track.clear();
        }
    }

    /// Pick up a reposition made by the video loop. Returns true when the
    /// generation changed.
    fn observe_generation(&mut self) -> bool {
        let generation = self.session.queues().generation();
        if generation == self.seen_generation {
            return false;
        }
        self.seen_generation = generation;
        self.flush_tracks();
        self.expected = match self.session.seek().landing(generation) {
            Some(landing) => {
                let relative = landing.seconds - self.anchor_seconds();
                (relative * self.config.output_fps()).round() as i64
            }
            None => POSITION_INITIAL,
        };
        tracing::debug!("Audio follows reposition (generation {}, expected {})", generation, self.expected);
        true
    }

    // ========================================================================
    // Decoding
    // ========================================================================

    fn ready(&self, samples: usize) -> bool {
        self.tracks.iter().all(|t| t.ready(samples))
    }

    fn fill(&mut self, position: i64, samples: usize, timecode: f64, fps: f64) -> FillEnd {
        let timeout = Duration::from_millis(self.config.read_timeout_ms);

        while !self.ready(samples) {
            let (popped, generation) = self.session.queues().pop_audio(timeout);
            if generation != self.seen_generation && self.observe_generation() {
                if plan_audio_seek(position, self.expected, false, self.config.seek_threshold(), true) == SeekPlan::Seek
                    && !self.seek(timecode)
                {
                    return FillEnd::Exhausted;
                }
                // Without a seek of our own the popped packet is still current
                if generation != self.seen_generation {
                    continue;
                }
            }

            let reason = match popped {
                Popped::Packet(packet) => {
                    if let Some(index) = self.tracks.iter().position(|t| t.stream.index == packet.stream_index) {
                        self.decode_packet(index, &packet, samples, timecode, fps);
                    }
                    continue;
                }
                // Only video pops report gaps
                Popped::Gap => continue,
                Popped::Stopped => return FillEnd::Closed,
                Popped::EndOfStream => "end of stream",
                Popped::Failed(e) => {
                    tracing::warn!("Audio read failed: {}", e);
                    "read error"
                }
                Popped::TimedOut => {
                    tracing::warn!("No audio packet within {:?}", timeout);
                    "read timeout"
                }
            };

            return match self.session.on_read_end(self.config.disconnect, reason) {
                ReadEndAction::Drain => {
                    self.drain();
                    FillEnd::Exhausted
                }
                ReadEndAction::Reopen => FillEnd::Reopen,
            };
        }
        FillEnd::Ready
    }

    fn drain(&mut self) {
        for track in &mut self.tracks {
            if track.decoder.send(None).is_err() {
                continue;
            }
            while let Ok(Received::Frame(frame)) = track.decoder.receive() {
                append_interleaved(&mut track.buffer, &frame);
            }
            track.apply_ignore();
        }
    }

    fn decode_packet(&mut self, index: usize, packet: &Packet, samples: usize, timecode: f64, fps: f64) {
        let seekable = self.session.is_seekable();
        let has_video = self.session.video_stream().is_some();
        let multi_track = self.multi_track();
        let anchor = self.anchor_seconds();
        let track = &mut self.tracks[index];

        let used_before = track.used();
        if let Err(e) = track.decoder.send(Some(packet)) {
            self.stats.decode_errors += 1;
            tracing::warn!("Audio decoding error: {}", e);
            return;
        }

        let mut discarded = true;
        loop {
            match track.decoder.receive() {
                Ok(Received::Frame(frame)) => {
                    append_interleaved(&mut track.buffer, &frame);
                    discarded = false;
                }
                Ok(Received::NeedMoreInput) | Ok(Received::EndOfStream) => break,
                Err(e) => {
                    self.stats.decode_errors += 1;
                    tracing::warn!("Audio decoding error: {}", e);
                    break;
                }
            }
        }
        self.stats.packets_decoded += 1;

        let ignored = track.apply_ignore();
        self.stats.samples_ignored += ignored as u64;

        // Drift check, skipped on live audio-only inputs
        let Some(pts) = packet.pts.filter(|pts| *pts >= 0) else {
            return;
        };
        if discarded || !(seekable || has_video) || track.ignore != 0 || track.used() <= samples / 2 {
            return;
        }

        let rate = track.stream.sample_rate as f64;
        let packet_seconds = pts as f64 * track.stream.time_base.as_f64() - anchor;
        // Time of the first buffered sample
        let buffer_start = packet_seconds - used_before as f64 / rate;
        let buffered_position = (buffer_start * fps).round() as i64;
        let req_position = (timecode * fps).round() as i64;
        tracing::trace!(
            "A pts {} req {} buffered {} used {}",
            pts,
            req_position,
            buffered_position,
            track.used()
        );

        if !seekable && buffered_position <= 0 {
            return;
        }
        if req_position > buffered_position {
            // Behind: discard up to the requested time
            track.ignore = ((timecode - buffer_start) * rate).round().max(0.0) as usize;
            let ignored = track.apply_ignore();
            self.stats.samples_ignored += ignored as u64;
        } else if !multi_track && buffered_position > req_position + self.sync.drift_frames && !self.sync.is_synchronizing {
            // Ahead: back up further and decode forward again
            self.stats.resyncs += 1;
            self.sync.is_synchronizing = true;
            tracing::debug!(
                "Audio ahead by {} frames, re-seeking",
                buffered_position - req_position
            );
            self.seek(timecode - self.config.audio_resync_seconds);
        }
    }

    // ========================================================================
    // Output
    // ========================================================================

    fn assemble(&mut self, samples: usize) -> AudioBuffer {
        let format = self.format();
        let rate = self.sample_rate();
        let channels = self.total_channels();
        let silence = format.silence_byte();
        let bps = format.bytes_per_sample();

        let mut data = Vec::with_capacity(samples * channels as usize * bps);
        if self.multi_track() {
            let taken: Vec<(Vec<u8>, usize)> = self
                .tracks
                .iter_mut()
                .map(|t| (t.take(samples), t.frame_bytes()))
                .collect();
            for s in 0..samples {
                for (bytes, frame_bytes) in &taken {
                    match bytes.get(s * frame_bytes..(s + 1) * frame_bytes) {
                        Some(frame) => data.extend_from_slice(frame),
                        None => data.resize(data.len() + frame_bytes, silence),
                    }
                }
            }
        } else {
            data = self.tracks[0].take(samples);
        }

        let expected = samples * channels as usize * bps;
        if data.len() < expected {
            let missing = (expected - data.len()) / (channels as usize * bps).max(1);
            self.stats.silence_samples += missing as u64;
            data.resize(expected, silence);
        }

        AudioBuffer {
            format,
            frequency: rate,
            channels,
            samples,
            data: Bytes::from(data),
        }
    }
}

#[cfg(all(test, feature = "synthetic"))]
mod tests {
    use super::*;
    use crate::config::StreamSelection;
    use crate::synthetic::{SyntheticBackend, SyntheticSource};

    fn open(source: SyntheticSource, config: ProducerConfig) -> AudioLoop {
        let backend = SyntheticBackend::new(source);
        let session = Arc::new(Session::open(&backend, "test", &config).unwrap());
        AudioLoop::new(session, &backend, &config).unwrap()
    }

    fn audio_only(config: ProducerConfig) -> AudioLoop {
        let config = ProducerConfig {
            video_stream: StreamSelection::None,
            ..config
        };
        open(SyntheticSource::audio_only(4.0).with_audio(48_000, 2, 1920), config)
    }

    fn s16(buffer: &AudioBuffer, sample: usize, channel: usize) -> i16 {
        let offset = (sample * buffer.channels as usize + channel) * 2;
        i16::from_le_bytes([buffer.data[offset], buffer.data[offset + 1]])
    }

    #[test]
    fn test_sequential_frames_are_continuous() {
        let mut audio = audio_only(ProducerConfig::default());
        for p in 0..10 {
            let buffer = audio.get(p, None).unwrap();
            assert_eq!(buffer.samples, 1920);
            assert_eq!(buffer.channels, 2);
            assert_eq!(s16(&buffer, 0, 0), (p * 1920) as i16);
            assert_eq!(s16(&buffer, 1919, 1), (p * 1920 + 1919) as i16);
        }
        assert_eq!(audio.stats().silence_samples, 0);
    }

    #[test]
    fn test_caller_sample_count_carries_remainder() {
        let mut audio = audio_only(ProducerConfig::default());
        let first = audio.get(0, Some(1000)).unwrap();
        assert_eq!(first.samples, 1000);
        let second = audio.get(1, Some(1000)).unwrap();
        assert_eq!(s16(&second, 0, 0), 1000);
    }

    #[test]
    fn test_silence_fill_unsigned() {
        let config = ProducerConfig {
            video_stream: StreamSelection::None,
            ..Default::default()
        };
        let source = SyntheticSource::audio_only(0.1).with_audio_format(8_000, 1, 160, SampleFormat::U8);
        let mut audio = open(source, config);

        audio.get(0, None).unwrap();
        audio.get(1, None).unwrap();
        let tail = audio.get(2, None).unwrap();

        assert_eq!(tail.samples, 320);
        assert_eq!(tail.data.len(), 320);
        assert_eq!(tail.data[1], (641 % 256) as u8);
        assert!(tail.data[160..].iter().all(|b| *b == 0x80));
    }

    #[test]
    fn test_silence_fill_signed() {
        let mut audio = audio_only(ProducerConfig::default());
        let buffer = audio.get(99, None).unwrap();
        assert_eq!(buffer.samples, 1920);
        let buffer = audio.get(100, None).unwrap();
        assert!(buffer.data.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_seek_skips_to_requested_sample() {
        let source = SyntheticSource::video(100).with_gop(10).with_audio(48_000, 2, 1920);
        let mut audio = open(source, ProducerConfig::default());
        let buffer = audio.get(50, None).unwrap();
        assert_eq!(s16(&buffer, 0, 0), 96_000i64 as i16);
        assert!(audio.stats().samples_ignored > 0);
    }

    #[test]
    fn test_mute_on_pause_repeat_is_silent() {
        let mut audio = audio_only(ProducerConfig {
            mute_on_pause: true,
            ..Default::default()
        });
        audio.get(0, None).unwrap();
        let repeat = audio.get(0, None).unwrap();
        assert!(repeat.data.iter().all(|b| *b == 0));
        assert_eq!(audio.expected(), 1);

        let next = audio.get(1, None).unwrap();
        assert_eq!(s16(&next, 0, 0), 1920);
    }

    #[test]
    fn test_repeat_without_mute_replays() {
        let mut audio = audio_only(ProducerConfig::default());
        let first = audio.get(3, None).unwrap();
        let again = audio.get(3, None).unwrap();
        assert_eq!(first.data, again.data);
    }

    #[test]
    fn test_all_tracks_interleaved() {
        let source = SyntheticSource::audio_only(1.0)
            .with_audio(48_000, 2, 1920)
            .with_audio(48_000, 1, 1920);
        let config = ProducerConfig {
            video_stream: StreamSelection::None,
            audio_stream: StreamSelection::All,
            ..Default::default()
        };
        let mut audio = open(source, config);
        let buffer = audio.get(0, None).unwrap();

        assert_eq!(buffer.channels, 3);
        for channel in 0..3 {
            assert_eq!(s16(&buffer, 5, channel), 5);
        }
    }

    #[test]
    fn test_planar_output_is_interleaved() {
        let config = ProducerConfig {
            video_stream: StreamSelection::None,
            ..Default::default()
        };
        let source = SyntheticSource::audio_only(1.0).with_audio_format(48_000, 2, 1920, SampleFormat::S16Planar);
        let mut audio = open(source, config);
        let buffer = audio.get(1, None).unwrap();

        assert_eq!(buffer.format, SampleFormat::S16);
        assert_eq!(s16(&buffer, 7, 0), 1927);
        assert_eq!(s16(&buffer, 7, 1), 1927);
    }

    #[test]
    fn test_late_audio_resyncs_once_per_request() {
        let source = SyntheticSource::video(50).with_audio(48_000, 2, 1920).with_audio_offset(1.0);
        let mut audio = open(source, ProducerConfig::default());
        audio.get(0, None).unwrap();
        assert_eq!(audio.stats().resyncs, 1);
    }
}
