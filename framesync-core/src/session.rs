//! An open source: demuxer, selected streams, anchored clock, packet queues
//! and the prefetch thread feeding them.
//!
//! A session is built lazily on the first request and torn down whole on
//! reopen or close. Decode loops hold an `Arc<Session>` and rebuild
//! themselves when the producer swaps it.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::{AnchorScan, StreamClock};
use crate::config::{DisconnectPolicy, ProducerConfig, StreamSelection};
use crate::decode::MediaBackend;
use crate::demuxer::{find_stream, first_stream_of, Demuxer, SeekDirection, StreamInfo, StreamKind};
use crate::packet_queue::{PacketQueues, QueueStats, Routing};
use crate::prefetch::{Prefetcher, SharedDemuxer};
use crate::producer::ProducerError;
use crate::seek::SeekController;

pub struct Session {
    source: String,
    video: Option<StreamInfo>,
    audio: Vec<StreamInfo>,
    clock: Option<StreamClock>,
    /// Absolute seconds of position 0; unknown for live sources until the
    /// first timestamp arrives
    anchor_seconds: Mutex<Option<f64>>,
    queues: Arc<PacketQueues>,
    seek: SeekController,
    prefetcher: Mutex<Prefetcher>,
}

impl Session {
    pub fn open(backend: &dyn MediaBackend, source: &str, config: &ProducerConfig) -> Result<Self, ProducerError> {
        let mut demuxer = backend
            .open(source)
            .map_err(|e| ProducerError::Open(format!("{}: {}", source, e)))?;

        let video = select_video(demuxer.streams(), config.video_stream)?;
        let audio = select_audio(demuxer.streams(), config.audio_stream)?;
        if video.is_none() && audio.is_empty() {
            return Err(ProducerError::NoStream(format!("{} has no selected video or audio stream", source)));
        }

        let seekable = demuxer.is_seekable();
        let clock = match &video {
            Some(stream) => Some(anchor_clock(demuxer.as_mut(), stream, config, seekable)),
            None => None,
        };
        let anchor_seconds = match &clock {
            Some(clock) if clock.first_pts().is_some() => Some(clock.anchor_seconds()),
            Some(clock) if seekable => Some(clock.anchor_seconds()),
            Some(_) => None,
            None if seekable => Some(0.0),
            None => None,
        };

        tracing::info!(
            "Opened {} via {} (video {:?}, audio {:?}, seekable {})",
            source,
            demuxer.name(),
            video.as_ref().map(|s| s.index),
            audio.iter().map(|s| s.index).collect::<Vec<_>>(),
            seekable
        );

        let routing = Routing {
            video: video.as_ref().map(|s| s.index),
            audio: audio.iter().map(|s| s.index).collect(),
        };
        let primary = video
            .as_ref()
            .or_else(|| audio.first())
            .map(|s| (s.index, s.time_base));

        let queues = Arc::new(PacketQueues::new(routing, 1, config.audio_starve_video_cap));
        let demuxer: SharedDemuxer = Arc::new(Mutex::new(demuxer));
        let seek = SeekController::new(demuxer.clone(), queues.clone(), primary);
        let prefetcher = Prefetcher::spawn(demuxer, queues.clone())
            .map_err(|e| ProducerError::Open(format!("prefetch thread: {}", e)))?;

        Ok(Self {
            source: source.to_string(),
            video,
            audio,
            clock,
            anchor_seconds: Mutex::new(anchor_seconds),
            queues,
            seek,
            prefetcher: Mutex::new(prefetcher),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn video_stream(&self) -> Option<&StreamInfo> {
        self.video.as_ref()
    }

    pub fn audio_streams(&self) -> &[StreamInfo] {
        &self.audio
    }

    /// Anchored clock for the video stream
    pub fn clock(&self) -> Option<&StreamClock> {
        self.clock.as_ref()
    }

    pub fn anchor_seconds(&self) -> Option<f64> {
        *self.anchor_seconds.lock()
    }

    /// Set the anchor unless one exists; returns the anchor in effect.
    pub fn anchor_once(&self, seconds: f64) -> f64 {
        *self.anchor_seconds.lock().get_or_insert(seconds)
    }

    pub fn queues(&self) -> &Arc<PacketQueues> {
        &self.queues
    }

    pub fn seek(&self) -> &SeekController {
        &self.seek
    }

    pub fn is_seekable(&self) -> bool {
        self.seek.is_seekable()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queues.stats()
    }

    /// Stop and join the prefetch thread. Loops blocked on the queues wake
    /// with `Stopped`.
    pub fn shutdown(&self) {
        self.prefetcher.lock().stop();
    }

    /// Apply the disconnect policy after reading stopped. Seekable sources
    /// always drain.
    pub fn on_read_end(&self, policy: DisconnectPolicy, reason: &str) -> ReadEndAction {
        if self.is_seekable() {
            return ReadEndAction::Drain;
        }
        match policy {
            DisconnectPolicy::Drain => ReadEndAction::Drain,
            DisconnectPolicy::Reconnect => {
                tracing::info!("Live source {} stopped ({}), reconnecting", self.source, reason);
                ReadEndAction::Reopen
            }
            DisconnectPolicy::Exit => {
                tracing::error!("Exiting with error due to disconnected source {} ({})", self.source, reason);
                std::process::exit(1);
            }
        }
    }
}

/// What a decode loop does once the reader reports end of stream or failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEndAction {
    /// Flush buffered frames out of the decoder
    Drain,
    /// Tear the session down; the next request reopens
    Reopen,
}

fn select_video(streams: &[StreamInfo], selection: StreamSelection) -> Result<Option<StreamInfo>, ProducerError> {
    match selection {
        StreamSelection::None => Ok(None),
        StreamSelection::Auto | StreamSelection::All => Ok(first_stream_of(streams, StreamKind::Video).cloned()),
        StreamSelection::Index(index) => match find_stream(streams, index) {
            Some(stream) if stream.kind == StreamKind::Video => Ok(Some(stream.clone())),
            _ => Err(ProducerError::NoStream(format!("stream {} is not a video stream", index))),
        },
    }
}

fn select_audio(streams: &[StreamInfo], selection: StreamSelection) -> Result<Vec<StreamInfo>, ProducerError> {
    match selection {
        StreamSelection::None => Ok(Vec::new()),
        StreamSelection::Auto => Ok(first_stream_of(streams, StreamKind::Audio).cloned().into_iter().collect()),
        StreamSelection::Index(index) => match find_stream(streams, index) {
            Some(stream) if stream.kind == StreamKind::Audio => Ok(vec![stream.clone()]),
            _ => Err(ProducerError::NoStream(format!("stream {} is not an audio stream", index))),
        },
        StreamSelection::All => {
            let mut tracks: Vec<StreamInfo> = Vec::new();
            for stream in streams.iter().filter(|s| s.kind == StreamKind::Audio) {
                // Tracks are interleaved byte-wise, so they must agree
                let compatible = tracks.first().map_or(true, |first| {
                    first.sample_rate == stream.sample_rate
                        && first.sample_format.map(|f| f.packed()) == stream.sample_format.map(|f| f.packed())
                });
                if compatible {
                    tracks.push(stream.clone());
                } else {
                    tracing::warn!("Skipping audio stream {}: format differs from first track", stream.index);
                }
            }
            Ok(tracks)
        }
    }
}

/// Build the video clock and, on seekable sources, run the anchor scan and
/// rewind to the start.
fn anchor_clock(demuxer: &mut dyn Demuxer, stream: &StreamInfo, config: &ProducerConfig, seekable: bool) -> StreamClock {
    let source_fps = stream.frame_rate.filter(|r| r.is_valid()).map(|r| r.as_f64()).unwrap_or(0.0);
    let mut clock = StreamClock::new(stream.time_base, source_fps, config.output_fps())
        .with_start_time(stream.start_time)
        .with_delay(config.video_delay_seconds);

    if !seekable || stream.is_cover_art() {
        return clock;
    }

    let mut scan = AnchorScan::new(stream.index, config);
    while scan.wants_more(&clock) {
        match demuxer.read_next_packet() {
            Ok(Some(packet)) => scan.observe(&mut clock, &packet),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Anchor scan stopped: {}", e);
                break;
            }
        }
    }
    scan.finish(&mut clock);
    if clock.first_pts().is_none() {
        tracing::debug!("No key frame timestamp found, anchoring on start time");
    }

    if let Err(e) = demuxer.seek(stream.index, 0, SeekDirection::Backward) {
        tracing::warn!("Rewind after anchor scan failed: {}", e);
    }
    clock
}
