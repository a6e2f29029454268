//! # Producer
//!
//! Caller-facing entry point: "picture for position P", "audio for position
//! P". Owns the lazily opened [`Session`], one decode loop per media type
//! and the output caches.
//!
//! Locking: setup (open/teardown) has its own mutex, separate from the
//! video and audio mutexes, so video and audio can be pulled from two
//! threads at once. A loop lock is always taken before the setup lock.
//! Caches are locked independently and never under the setup lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::audio::{AudioLoop, AudioStats};
use crate::cache::{cache_key, CacheStats, FrameCache};
use crate::conceal::Concealment;
use crate::config::ProducerConfig;
use crate::decode::MediaBackend;
use crate::format::{pick_image_format, AudioBuffer, ImageFormat, PixelFormat, SampleFormat};
use crate::packet_queue::QueueStats;
use crate::session::Session;
use crate::video::{GoodPicture, VideoLoop, VideoOutput, VideoStats};

/// Errors surfaced to callers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProducerError {
    #[error("No picture could be produced for position {0}")]
    NoImage(i64),

    #[error("No audio stream selected")]
    NoAudio,

    #[error("Open failed: {0}")]
    Open(String),

    #[error("Stream selection failed: {0}")]
    NoStream(String),

    #[error("Producer is closed")]
    Closed,
}

/// Diagnostics snapshot
#[derive(Debug, Clone, Default)]
pub struct ProducerStats {
    pub video: Option<VideoStats>,
    pub audio: Option<AudioStats>,
    pub queues: Option<QueueStats>,
    pub image_cache: CacheStats,
    pub audio_cache: CacheStats,
    /// Real seeks issued on the current session
    pub seeks: u64,
    /// Seeks the demuxer refused
    pub seeks_rejected: u64,
    pub opens: u64,
    pub last_good_position: Option<i64>,
    pub variable_rate: Option<bool>,
}

struct VideoState {
    decoder: Option<VideoLoop>,
    conceal: Concealment<GoodPicture>,
    generation: u64,
}

/// What the image cache needs to know about the video stream, readable
/// without the video lock
#[derive(Debug, Clone, Copy)]
struct VideoShape {
    still_image: bool,
    pixel_format: PixelFormat,
}

struct AudioState {
    decoder: Option<AudioLoop>,
    generation: u64,
}

pub struct Producer {
    backend: Arc<dyn MediaBackend>,
    source: String,
    config: RwLock<ProducerConfig>,
    /// Bumped by `invalidate` and `reconfigure`; loops built under an older
    /// value are rebuilt before their next decode
    config_generation: AtomicU64,
    setup: Mutex<Option<Arc<Session>>>,
    video: Mutex<VideoState>,
    video_shape: RwLock<Option<VideoShape>>,
    audio: Mutex<AudioState>,
    image_cache: RwLock<Arc<FrameCache<VideoOutput>>>,
    audio_cache: RwLock<Arc<FrameCache<AudioBuffer>>>,
    opens: AtomicU64,
    closed: AtomicBool,
}

impl Producer {
    /// Create a producer for `source`. Nothing is opened until the first
    /// request.
    pub fn new(backend: Arc<dyn MediaBackend>, source: impl Into<String>, config: ProducerConfig) -> Self {
        let source = source.into();
        tracing::debug!("Producer for {} via {}", source, backend.name());
        Self {
            image_cache: RwLock::new(Arc::new(FrameCache::new(config.cache_size))),
            audio_cache: RwLock::new(Arc::new(FrameCache::new(config.audio_cache_size))),
            backend,
            source,
            config: RwLock::new(config),
            config_generation: AtomicU64::new(0),
            setup: Mutex::new(None),
            video: Mutex::new(VideoState {
                decoder: None,
                conceal: Concealment::new(),
                generation: 0,
            }),
            video_shape: RwLock::new(None),
            audio: Mutex::new(AudioState {
                decoder: None,
                generation: 0,
            }),
            opens: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn config(&self) -> ProducerConfig {
        self.config.read().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ========================================================================
    // Video
    // ========================================================================

    /// Picture for application `position`. The delivered format is in
    /// `output.image.format`.
    pub fn get_video_output(&self, position: i64, format: ImageFormat) -> Result<VideoOutput, ProducerError> {
        if self.is_closed() {
            return Err(ProducerError::Closed);
        }
        let generation = self.config_generation.load(Ordering::Acquire);
        let cache = self.image_cache.read().clone();
        let shape = *self.video_shape.read();
        if let Some(shape) = shape {
            let target = pick_image_format(format, shape.pixel_format);
            if let Some(hit) = cache.get(cache_key(position, shape.still_image)) {
                if hit.image.format == target {
                    tracing::trace!("Image cache hit for {}", position);
                    return Ok(VideoOutput {
                        position,
                        ..(*hit).clone()
                    });
                }
            }
        }

        let (key, output) = self.decode_video(position, format)?;
        // Outputs decoded across an invalidate belong to the old generation
        if !output.concealed && self.config_generation.load(Ordering::Acquire) == generation {
            cache.put(key, Arc::new(output.clone()));
        }
        Ok(output)
    }

    /// Run the video loop under its lock. Returns the cache key with the
    /// output.
    fn decode_video(&self, position: i64, format: ImageFormat) -> Result<(i64, VideoOutput), ProducerError> {
        let mut state = self.video.lock();

        // One retry covers a session torn down by the audio side mid-call
        for _ in 0..2 {
            if self.is_closed() {
                return Err(ProducerError::Closed);
            }
            let session = self.session()?;
            let generation = self.config_generation.load(Ordering::Acquire);
            let config = self.config();

            let VideoState {
                decoder,
                conceal,
                generation: built_for,
            } = &mut *state;
            let stale = decoder
                .as_ref()
                .map_or(true, |d| *built_for != generation || !Arc::ptr_eq(d.session(), &session));
            if stale {
                let video = VideoLoop::new(session.clone(), self.backend.as_ref(), &config)?;
                *self.video_shape.write() = Some(VideoShape {
                    still_image: video.is_still_image(),
                    pixel_format: video.source_pixel_format(),
                });
                *decoder = Some(video);
                *built_for = generation;
            }
            let Some(video) = decoder.as_mut() else {
                return Err(ProducerError::NoStream("video loop unavailable".into()));
            };

            let key = cache_key(position, video.is_still_image());
            let result = video.get(position, format, self.backend.converter(), conceal);
            if video.needs_reopen() {
                *decoder = None;
                self.teardown(&session);
            }

            match result {
                Err(ProducerError::Closed) => continue,
                Err(e) => return Err(e),
                Ok(output) => return Ok((key, output)),
            }
        }
        Err(ProducerError::Closed)
    }

    // ========================================================================
    // Audio
    // ========================================================================

    /// Audio for application `position`, in `format` (the first track's
    /// packed format when `None`). `samples` overrides the count derived
    /// from the output frame rate.
    pub fn get_audio_output(
        &self,
        position: i64,
        format: Option<SampleFormat>,
        samples: Option<usize>,
    ) -> Result<AudioBuffer, ProducerError> {
        let mut state = self.audio.lock();
        let convert = |buffer: AudioBuffer| match format {
            Some(target) => buffer.to_format(target),
            None => buffer,
        };

        for _ in 0..2 {
            if self.is_closed() {
                return Err(ProducerError::Closed);
            }
            let config = self.config();
            // A muted pause depends on the previous request, not only the position
            let cache = (samples.is_none() && !config.mute_on_pause).then(|| self.audio_cache.read().clone());
            if let Some(hit) = cache.as_ref().and_then(|c| c.get(position)) {
                return Ok(convert((*hit).clone()));
            }

            let session = self.session()?;
            let generation = self.config_generation.load(Ordering::Acquire);
            let stale = state
                .decoder
                .as_ref()
                .map_or(true, |d| state.generation != generation || !Arc::ptr_eq(d.session(), &session));
            if stale {
                state.decoder = Some(AudioLoop::new(session.clone(), self.backend.as_ref(), &config)?);
                state.generation = generation;
            }
            let Some(audio) = state.decoder.as_mut() else {
                return Err(ProducerError::NoAudio);
            };

            let result = audio.get(position, samples);
            if audio.needs_reopen() {
                state.decoder = None;
                self.teardown(&session);
            }

            match result {
                Err(ProducerError::Closed) => continue,
                Err(e) => return Err(e),
                Ok(buffer) => {
                    if let Some(cache) = cache {
                        cache.put(position, Arc::new(buffer.clone()));
                    }
                    return Ok(convert(buffer));
                }
            }
        }
        Err(ProducerError::Closed)
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Drop cached output and force both loops to reposition on their next
    /// request.
    pub fn invalidate(&self) {
        self.config_generation.fetch_add(1, Ordering::AcqRel);
        self.image_cache.read().clear();
        self.audio_cache.read().clear();
        tracing::debug!("Producer invalidated");
    }

    /// Replace the configuration. The session is reopened on the next
    /// request so stream selection and clock settings take effect.
    pub fn reconfigure(&self, config: ProducerConfig) {
        let mut video = self.video.lock();
        let mut audio = self.audio.lock();
        video.decoder = None;
        audio.decoder = None;
        self.video_shape.write().take();

        *self.image_cache.write() = Arc::new(FrameCache::new(config.cache_size));
        *self.audio_cache.write() = Arc::new(FrameCache::new(config.audio_cache_size));
        *self.config.write() = config;
        self.config_generation.fetch_add(1, Ordering::AcqRel);

        if let Some(session) = self.setup.lock().take() {
            session.shutdown();
        }
        tracing::debug!("Producer reconfigured");
    }

    /// Stop the prefetch thread and release the source. Later requests
    /// fail with `Closed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wake loops blocked on the queues before waiting for their locks
        if let Some(session) = self.setup.lock().as_ref() {
            session.shutdown();
        }
        let mut video = self.video.lock();
        let mut audio = self.audio.lock();
        video.decoder = None;
        audio.decoder = None;
        self.setup.lock().take();
        self.image_cache.read().clear();
        self.audio_cache.read().clear();
        tracing::info!("Closed {}", self.source);
    }

    pub fn stats(&self) -> ProducerStats {
        let video = self.video.lock();
        let audio = self.audio.lock();
        let session = self.setup.lock().clone();
        ProducerStats {
            video: video.decoder.as_ref().map(|d| d.stats()),
            audio: audio.decoder.as_ref().map(|d| d.stats()),
            queues: session.as_ref().map(|s| s.queue_stats()),
            image_cache: self.image_cache.read().stats(),
            audio_cache: self.audio_cache.read().stats(),
            seeks: session.as_ref().map_or(0, |s| s.seek().seek_count()),
            seeks_rejected: session.as_ref().map_or(0, |s| s.seek().rejected_count()),
            opens: self.opens.load(Ordering::Relaxed),
            last_good_position: video.conceal.last_good_position(),
            variable_rate: video.decoder.as_ref().map(|d| d.clock().is_variable_rate()),
        }
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    fn session(&self) -> Result<Arc<Session>, ProducerError> {
        let mut setup = self.setup.lock();
        if let Some(session) = setup.as_ref() {
            return Ok(session.clone());
        }
        let config = self.config();
        let session = Arc::new(Session::open(self.backend.as_ref(), &self.source, &config)?);
        self.opens.fetch_add(1, Ordering::Relaxed);
        *setup = Some(session.clone());
        Ok(session)
    }

    /// Tear down `stale` if it is still the current session
    fn teardown(&self, stale: &Arc<Session>) {
        let mut setup = self.setup.lock();
        if setup.as_ref().is_some_and(|s| Arc::ptr_eq(s, stale)) {
            tracing::info!("Tearing down session for {}", self.source);
            stale.shutdown();
            *setup = None;
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(all(test, feature = "synthetic"))]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::HashMap;

    use crate::config::{DisconnectPolicy, StreamSelection};
    use crate::format::Rational;
    use crate::synthetic::{frame_index, SyntheticBackend, SyntheticSource};

    fn producer(source: SyntheticSource, config: ProducerConfig) -> Producer {
        Producer::new(Arc::new(SyntheticBackend::new(source)), "synthetic", config)
    }

    fn uncached() -> ProducerConfig {
        ProducerConfig {
            cache_size: 0,
            audio_cache_size: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_position_correctness() {
        let producer = producer(SyntheticSource::video(40), uncached());
        for p in 0..40 {
            let out = producer.get_video_output(p, ImageFormat::Native).unwrap();
            assert_eq!(out.frame_position, p);
            assert_eq!(frame_index(&out.image), Some(p));
            assert_eq!(out.image.format, ImageFormat::Yuv420p);
        }
    }

    #[test]
    fn test_repeat_is_idempotent() {
        for config in [uncached(), ProducerConfig::default()] {
            let producer = producer(SyntheticSource::video(30), config);
            producer.get_video_output(10, ImageFormat::Native).unwrap();
            let first = producer.get_video_output(11, ImageFormat::Native).unwrap();
            let second = producer.get_video_output(11, ImageFormat::Native).unwrap();
            assert_eq!(first.image.data, second.image.data);
            assert_eq!(first.frame_position, second.frame_position);
        }
    }

    #[test]
    fn test_cache_serves_lookback() {
        let producer = producer(SyntheticSource::video(30), ProducerConfig::default());
        for p in 0..5 {
            producer.get_video_output(p, ImageFormat::Native).unwrap();
        }
        let seeks = producer.stats().seeks;
        let out = producer.get_video_output(2, ImageFormat::Native).unwrap();
        assert_eq!(frame_index(&out.image), Some(2));
        assert_eq!(producer.stats().seeks, seeks);
        assert_eq!(producer.stats().image_cache.hits, 1);
    }

    #[test]
    fn test_cache_hit_skips_video_lock() {
        let producer = Arc::new(producer(SyntheticSource::video(30), ProducerConfig::default()));
        for p in 0..3 {
            producer.get_video_output(p, ImageFormat::Native).unwrap();
        }

        let _busy = producer.video.lock();
        let (tx, rx) = std::sync::mpsc::channel();
        {
            let producer = producer.clone();
            std::thread::spawn(move || {
                let hit = producer.get_video_output(1, ImageFormat::Native);
                let _ = tx.send(hit.map(|out| frame_index(&out.image)));
            });
        }
        let hit = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        assert_eq!(hit.unwrap(), Some(1));
    }

    #[test]
    fn test_concealment_is_monotonic() {
        let config = ProducerConfig {
            decode_error_limit: 0,
            seek_threshold: 10,
            ..uncached()
        };
        let source = SyntheticSource::video(60).with_gop(6).with_corrupt_frames([7, 8, 20, 41]);
        let producer = producer(source, config);

        let mut last_good = None;
        let mut outputs: HashMap<i64, Bytes> = HashMap::new();
        for p in [0, 1, 7, 8, 9, 20, 21, 14, 41, 42, 30] {
            let out = producer.get_video_output(p, ImageFormat::Native).unwrap();
            let good = producer.stats().last_good_position;
            assert!(good >= last_good);
            if out.concealed {
                assert_eq!(good, last_good);
                assert_eq!(Some(&out.image.data), outputs.get(&good.unwrap()));
            } else {
                outputs.insert(out.frame_position, out.image.data.clone());
            }
            last_good = good;
        }
        assert_eq!(last_good, Some(42));
    }

    #[test]
    fn test_seek_threshold_boundary() {
        let threshold = ProducerConfig::default().seek_threshold;
        let source = SyntheticSource::video(400).with_gop(10);

        let near = producer(source.clone(), uncached());
        near.get_video_output(0, ImageFormat::Native).unwrap();
        let seeks = near.stats().seeks;
        // Cursor expects 1: request threshold - 1 frames ahead of it
        near.get_video_output(1 + threshold - 1, ImageFormat::Native).unwrap();
        assert_eq!(near.stats().seeks, seeks);

        let far = producer(source, uncached());
        far.get_video_output(0, ImageFormat::Native).unwrap();
        let seeks = far.stats().seeks;
        let out = far.get_video_output(1 + threshold + 1, ImageFormat::Native).unwrap();
        assert_eq!(far.stats().seeks, seeks + 1);
        assert_eq!(out.frame_position, 1 + threshold + 1);
    }

    #[test]
    fn test_audio_silence_fill() {
        let config = ProducerConfig {
            video_stream: StreamSelection::None,
            ..Default::default()
        };
        let source = SyntheticSource::audio_only(0.1).with_audio_format(8_000, 1, 160, SampleFormat::U8);
        let producer = producer(source, config);

        let buffer = producer.get_audio_output(2, None, Some(400)).unwrap();
        assert_eq!(buffer.samples, 400);
        assert_eq!(buffer.data.len(), 400);
        assert!(buffer.data[160..].iter().all(|b| *b == 0x80));

        let float = producer.get_audio_output(5, Some(SampleFormat::F32), None).unwrap();
        assert_eq!(float.format, SampleFormat::F32);
        assert!(float.data.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_rejected_seeks_still_deliver() {
        let source = SyntheticSource::video(200).rejecting_seeks();
        let producer = producer(source, uncached());

        let mut last_good = None;
        for p in [30, 10, 150] {
            let out = producer.get_video_output(p, ImageFormat::Native).unwrap();
            assert!(!out.concealed);
            assert!(out.frame_position >= p);
            let good = producer.stats().last_good_position;
            assert!(good >= last_good);
            last_good = good;
        }
        // Reading simply carried on past the backward request
        assert_eq!(last_good, Some(150));
        let stats = producer.stats();
        assert_eq!(stats.seeks, 0);
        assert_eq!(stats.seeks_rejected, 3);
    }

    #[test]
    fn test_audio_without_video_requests() {
        let config = ProducerConfig {
            read_timeout_ms: 200,
            ..uncached()
        };
        let producer = producer(SyntheticSource::video(1000).with_audio(48_000, 2, 1920), config);
        for p in 0..400i64 {
            let buffer = producer.get_audio_output(p, None, None).unwrap();
            let first = i16::from_le_bytes([buffer.data[0], buffer.data[1]]);
            assert_eq!(first, (p * 1920) as i16, "position {}", p);
        }
        let queues = producer.stats().queues.unwrap();
        assert!(queues.video_overrun_dropped > 0);
        assert!(queues.max_video_depth <= ProducerConfig::default().audio_starve_video_cap);

        // Video picks up with a seek of its own
        let out = producer.get_video_output(400, ImageFormat::Native).unwrap();
        assert_eq!(frame_index(&out.image), Some(400));
        assert!(!out.concealed);
    }

    #[test]
    fn test_audio_only_reads_ahead_boundedly() {
        let source = SyntheticSource::audio_only(600.0).with_audio(48_000, 2, 1920);
        let producer = producer(source, uncached());
        producer.get_audio_output(0, None, None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));

        let cap = ProducerConfig::default().audio_starve_video_cap;
        let session = producer.setup.lock().clone().unwrap();
        assert!(session.queues().audio_len() <= cap);
        // Ten minutes of source is 15000 packets
        assert!(producer.stats().queues.unwrap().audio_enqueued < 1_000);
    }

    #[test]
    fn test_audio_cache_and_repeat() {
        let producer = producer(SyntheticSource::video(50).with_audio(48_000, 2, 1920), ProducerConfig::default());
        let first = producer.get_audio_output(4, None, None).unwrap();
        let again = producer.get_audio_output(4, None, None).unwrap();
        assert_eq!(first, again);
        assert_eq!(producer.stats().audio_cache.hits, 1);
    }

    #[test]
    fn test_no_audio_stream() {
        let producer = producer(SyntheticSource::video(5), ProducerConfig::default());
        assert_eq!(producer.get_audio_output(0, None, None).unwrap_err(), ProducerError::NoAudio);
        assert!(producer.get_video_output(0, ImageFormat::Native).is_ok());
    }

    #[test]
    fn test_open_failure() {
        let producer = Producer::new(
            Arc::new(SyntheticBackend::new(SyntheticSource::video(5))),
            "",
            ProducerConfig::default(),
        );
        assert!(matches!(
            producer.get_video_output(0, ImageFormat::Native),
            Err(ProducerError::Open(_))
        ));
    }

    #[test]
    fn test_variable_rate_detected() {
        let source = SyntheticSource::video(30)
            .with_time_base(Rational::new(1, 1000))
            .with_durations(vec![40, 33, 50, 40, 20]);
        let producer = producer(source, uncached());
        producer.get_video_output(0, ImageFormat::Native).unwrap();
        assert_eq!(producer.stats().variable_rate, Some(true));

        let constant = self::producer(SyntheticSource::video(30), uncached());
        constant.get_video_output(0, ImageFormat::Native).unwrap();
        assert_eq!(constant.stats().variable_rate, Some(false));
    }

    #[test]
    fn test_live_disconnect_reopens() {
        let config = ProducerConfig {
            disconnect: DisconnectPolicy::Reconnect,
            read_timeout_ms: 1_000,
            ..uncached()
        };
        let source = SyntheticSource::video(50).live().disconnect_after(5);
        let stats = source.stats();
        let producer = producer(source, config);

        for p in 0..5 {
            let out = producer.get_video_output(p, ImageFormat::Native).unwrap();
            assert!(!out.concealed);
        }
        let lost = producer.get_video_output(5, ImageFormat::Native).unwrap();
        assert!(lost.concealed);
        assert_eq!(frame_index(&lost.image), Some(4));
        assert_eq!(stats.opens(), 1);

        producer.get_video_output(6, ImageFormat::Native).unwrap();
        assert_eq!(stats.opens(), 2);
    }

    #[test]
    fn test_invalidate_forces_seek() {
        let producer = producer(SyntheticSource::video(30).with_gop(5), ProducerConfig::default());
        producer.get_video_output(12, ImageFormat::Native).unwrap();
        let seeks = producer.stats().seeks;

        producer.invalidate();
        assert_eq!(producer.stats().image_cache.entries, 0);
        let out = producer.get_video_output(12, ImageFormat::Native).unwrap();
        assert_eq!(frame_index(&out.image), Some(12));
        assert_eq!(producer.stats().seeks, seeks + 1);
    }

    #[test]
    fn test_reconfigure_output_rate() {
        let producer = producer(SyntheticSource::video(60), ProducerConfig::default());
        assert_eq!(frame_index(&producer.get_video_output(10, ImageFormat::Native).unwrap().image), Some(10));

        producer.reconfigure(ProducerConfig {
            output_fps: Rational::new(50, 1),
            ..Default::default()
        });
        let out = producer.get_video_output(10, ImageFormat::Native).unwrap();
        assert_eq!(frame_index(&out.image), Some(5));
        assert_eq!(producer.stats().opens, 2);
    }

    #[test]
    fn test_video_and_audio_from_two_threads() {
        let producer = Arc::new(producer(
            SyntheticSource::video(100).with_audio(48_000, 2, 1920),
            ProducerConfig::default(),
        ));

        let audio = {
            let producer = producer.clone();
            std::thread::spawn(move || {
                (0..50)
                    .map(|p| producer.get_audio_output(p, None, None).map(|b| b.samples))
                    .collect::<Result<Vec<_>, _>>()
            })
        };
        for p in 0..50 {
            let out = producer.get_video_output(p, ImageFormat::Native).unwrap();
            assert_eq!(frame_index(&out.image), Some(p));
        }
        let samples = audio.join().unwrap().unwrap();
        assert!(samples.iter().all(|n| *n == 1920));
    }

    #[test]
    fn test_closed_producer() {
        let producer = producer(SyntheticSource::video(10), ProducerConfig::default());
        producer.get_video_output(0, ImageFormat::Native).unwrap();
        producer.close();
        assert_eq!(
            producer.get_video_output(1, ImageFormat::Native).unwrap_err(),
            ProducerError::Closed
        );
        assert_eq!(producer.get_audio_output(0, None, None).unwrap_err(), ProducerError::Closed);
    }
}
