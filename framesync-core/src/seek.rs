//! # Seek Controller
//!
//! Decides whether a request is reached by decoding forward or needs the
//! demuxer repositioned, and performs repositions for both decode loops.
//!
//! Video and audio share one demuxer. Every reposition goes through the
//! primary stream (video when present), drains the packet queues and starts
//! a new queue generation. The target of the latest reposition is kept so
//! the loop that did not ask for it can judge whether the new read position
//! still serves its own request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::{seconds_to_timestamp, timestamp_to_seconds};
use crate::demuxer::{DemuxError, SeekDirection};
use crate::format::Rational;
use crate::packet_queue::PacketQueues;
use crate::prefetch::SharedDemuxer;

/// Cursor needs a real seek before anything else
pub const POSITION_INVALID: i64 = -1;
/// Nothing requested since open
pub const POSITION_INITIAL: i64 = -2;

/// What a request needs before decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekPlan {
    /// Repeat of the last delivered position
    Paused,
    /// Reachable by decoding forward
    Continue,
    /// Reposition the demuxer first
    Seek,
}

/// Video decision. `expected` is one past the last delivered position.
pub fn plan_video_seek(position: i64, expected: i64, have_frame: bool, threshold: i64, seekable: bool) -> SeekPlan {
    if !seekable {
        return SeekPlan::Continue;
    }
    if have_frame && expected >= 0 && position + 1 == expected {
        SeekPlan::Paused
    } else if expected < 0 || position < expected || position - expected >= threshold {
        SeekPlan::Seek
    } else {
        SeekPlan::Continue
    }
}

/// Audio decision. Repeats are only silent with `mute_on_pause`.
pub fn plan_audio_seek(position: i64, expected: i64, mute_on_pause: bool, threshold: i64, seekable: bool) -> SeekPlan {
    if !seekable || (position == expected && expected >= 0) {
        return SeekPlan::Continue;
    }
    if mute_on_pause && expected >= 0 && position + 1 == expected {
        SeekPlan::Paused
    } else if expected < 0 || position < expected || position - expected >= threshold {
        SeekPlan::Seek
    } else {
        SeekPlan::Continue
    }
}

/// Where the latest reposition aimed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landing {
    pub generation: u64,
    /// Absolute stream seconds
    pub seconds: f64,
}

pub struct SeekController {
    demuxer: SharedDemuxer,
    queues: Arc<PacketQueues>,
    seekable: bool,
    primary: Option<(u32, Rational)>,
    landing: Mutex<Option<Landing>>,
    seeks: AtomicU64,
    rejected: AtomicU64,
}

impl SeekController {
    /// `primary` is the stream every seek is issued on, with its time base.
    pub fn new(demuxer: SharedDemuxer, queues: Arc<PacketQueues>, primary: Option<(u32, Rational)>) -> Self {
        let seekable = demuxer.lock().is_seekable();
        Self {
            demuxer,
            queues,
            seekable,
            primary,
            landing: Mutex::new(None),
            seeks: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn is_seekable(&self) -> bool {
        self.seekable
    }

    pub fn primary_time_base(&self) -> Option<Rational> {
        self.primary.map(|(_, tb)| tb)
    }

    /// Reposition to `timestamp` in the primary stream's time base.
    ///
    /// The demuxer stays locked until the queues are reset, so the prefetch
    /// thread never tags a packet from the new position with the old
    /// generation. Returns the new generation.
    pub fn seek_to(&self, timestamp: i64) -> Result<u64, DemuxError> {
        let (stream, time_base) = self.primary.ok_or(DemuxError::NoSuchStream(u32::MAX))?;
        let timestamp = timestamp.max(0);

        let mut demuxer = self.demuxer.lock();
        if let Err(e) = demuxer.seek(stream, timestamp, SeekDirection::Backward) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Seek to {} on stream {} rejected: {}", timestamp, stream, e);
            return Err(e);
        }
        let generation = self.queues.reset();
        *self.landing.lock() = Some(Landing {
            generation,
            seconds: timestamp_to_seconds(timestamp, time_base),
        });
        drop(demuxer);

        self.seeks.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Seek stream {} to {} (generation {})", stream, timestamp, generation);
        Ok(generation)
    }

    /// Reposition to absolute stream seconds
    pub fn seek_to_seconds(&self, seconds: f64) -> Result<u64, DemuxError> {
        let time_base = self.primary_time_base().ok_or(DemuxError::NoSuchStream(u32::MAX))?;
        self.seek_to(seconds_to_timestamp(seconds.max(0.0), time_base))
    }

    /// Target of the reposition that started `generation`, if it was a seek
    pub fn landing(&self, generation: u64) -> Option<Landing> {
        self.landing.lock().filter(|l| l.generation == generation)
    }

    pub fn seek_count(&self) -> u64 {
        self.seeks.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn queues(&self) -> &Arc<PacketQueues> {
        &self.queues
    }

    pub fn demuxer(&self) -> &SharedDemuxer {
        &self.demuxer
    }
}
