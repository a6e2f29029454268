//! # Packet Queues - Prefetch / Decode Hand-off
//!
//! Compressed packets travel from the prefetch thread to the decode-sync
//! loops through two queues guarded by one mutex and one condition variable:
//!
//! ```text
//! ┌──────────┐    ┌──────────────┐    ┌────────────┐
//! │ Prefetch │───►│ video (1)    │───►│ Video loop │
//! │ Thread   │    ├──────────────┤    ├────────────┤
//! │          │───►│ audio (open) │───►│ Audio loop │
//! └──────────┘    └──────────────┘    └────────────┘
//! ```
//!
//! The video queue is bounded (backpressure); the audio queue takes whatever
//! audio is met while reading video. A starving audio consumer lets the
//! reader run past the video bound up to a hard cap. Past the cap the oldest
//! video packets are discarded and the next video pop reports a gap, so a
//! caller that only pulls audio never stalls the reader. Without a video
//! stream the audio queue carries the backpressure itself.
//!
//! A reset drains both queues and bumps the generation, so packets read
//! before a reposition are never delivered.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::demuxer::{DemuxError, Packet};

/// Reader state as last recorded by the prefetch thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStatus {
    Reading,
    EndOfStream,
    Failed(DemuxError),
}

/// Outcome of a consumer pop
#[derive(Debug)]
pub enum Popped {
    Packet(Packet),
    EndOfStream,
    Failed(DemuxError),
    TimedOut,
    Stopped,
    /// Video packets were discarded; the consumer must reposition
    Gap,
}

/// Which stream indexes feed which queue
#[derive(Debug, Clone, Default)]
pub struct Routing {
    pub video: Option<u32>,
    pub audio: Vec<u32>,
}

/// Queue statistics
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub video_enqueued: u64,
    pub audio_enqueued: u64,
    pub video_dequeued: u64,
    pub audio_dequeued: u64,
    /// Packets read for a generation that had already been reset
    pub stale_dropped: u64,
    /// Packets of streams nobody consumes
    pub unrouted_dropped: u64,
    /// Video packets discarded past the starve cap
    pub video_overrun_dropped: u64,
    pub max_video_depth: usize,
    pub generation: u64,
}

struct QueueState {
    video: VecDeque<Packet>,
    audio: VecDeque<Packet>,
    status: ReadStatus,
    stop: bool,
    generation: u64,
    audio_waiters: usize,
    video_gap: bool,
    stats: QueueStats,
}

pub struct PacketQueues {
    routing: Routing,
    video_depth: usize,
    starve_cap: usize,
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl PacketQueues {
    /// `video_depth` bounds undispatched video packets; `starve_cap` is the
    /// hard bound on video while an audio consumer is starving, and the
    /// audio bound when no video stream is routed.
    pub fn new(routing: Routing, video_depth: usize, starve_cap: usize) -> Self {
        let video_depth = video_depth.max(1);
        Self {
            routing,
            video_depth,
            starve_cap: starve_cap.max(video_depth),
            state: Mutex::new(QueueState {
                video: VecDeque::with_capacity(video_depth),
                audio: VecDeque::with_capacity(64),
                status: ReadStatus::Reading,
                stop: false,
                generation: 0,
                audio_waiters: 0,
                video_gap: false,
                stats: QueueStats::default(),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn routing(&self) -> &Routing {
        &self.routing
    }

    // ========================================================================
    // Producer API (Prefetch Thread)
    // ========================================================================

    fn has_space(&self, state: &QueueState) -> bool {
        if self.routing.video.is_none() {
            return state.audio.len() < self.starve_cap;
        }
        state.video.len() < self.video_depth || state.audio_waiters > 0
    }

    /// Block until another packet may be read.
    ///
    /// Returns the current generation, or `None` once a stop was requested.
    /// After end of stream or a read error the reader parks here until a
    /// reset or stop.
    pub fn wait_for_space(&self) -> Option<u64> {
        let mut state = self.state.lock();
        loop {
            if state.stop {
                return None;
            }
            if state.status == ReadStatus::Reading && self.has_space(&state) {
                return Some(state.generation);
            }
            self.cond.wait(&mut state);
        }
    }

    /// Publish a read result for `generation`. Stale results are dropped.
    pub fn deliver(&self, generation: u64, result: Result<Option<Packet>, DemuxError>) -> bool {
        let mut state = self.state.lock();
        if state.stop || generation != state.generation {
            state.stats.stale_dropped += 1;
            return false;
        }
        match result {
            Ok(Some(packet)) => {
                if Some(packet.stream_index) == self.routing.video {
                    if state.video.len() >= self.starve_cap {
                        state.video.pop_front();
                        state.stats.video_overrun_dropped += 1;
                        if !state.video_gap {
                            tracing::debug!("Video queue overrun, discarding from generation {}", generation);
                            state.video_gap = true;
                        }
                    }
                    state.video.push_back(packet);
                    state.stats.video_enqueued += 1;
                    state.stats.max_video_depth = state.stats.max_video_depth.max(state.video.len());
                } else if self.routing.audio.contains(&packet.stream_index) {
                    state.audio.push_back(packet);
                    state.stats.audio_enqueued += 1;
                } else {
                    state.stats.unrouted_dropped += 1;
                    return true;
                }
            }
            Ok(None) => {
                tracing::debug!("End of stream, generation {}", generation);
                state.status = ReadStatus::EndOfStream;
            }
            Err(e) => {
                tracing::debug!("Read error {}, generation {}", e, generation);
                state.status = ReadStatus::Failed(e);
            }
        }
        self.cond.notify_all();
        true
    }

    // ========================================================================
    // Consumer API (Decode-Sync Loops)
    // ========================================================================

    /// Pop the next video packet, blocking while the reader is still busy.
    pub fn pop_video(&self, timeout: Duration) -> (Popped, u64) {
        self.pop(timeout, false)
    }

    /// Pop the next audio packet, blocking while the reader is still busy.
    pub fn pop_audio(&self, timeout: Duration) -> (Popped, u64) {
        self.pop(timeout, true)
    }

    fn pop(&self, timeout: Duration, audio: bool) -> (Popped, u64) {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.stop {
                return (Popped::Stopped, state.generation);
            }
            if !audio && state.video_gap {
                state.video_gap = false;
                return (Popped::Gap, state.generation);
            }
            let packet = if audio {
                state.audio.pop_front()
            } else {
                state.video.pop_front()
            };
            if let Some(packet) = packet {
                if audio {
                    state.stats.audio_dequeued += 1;
                } else {
                    state.stats.video_dequeued += 1;
                }
                self.cond.notify_all();
                return (Popped::Packet(packet), state.generation);
            }
            match &state.status {
                ReadStatus::EndOfStream => return (Popped::EndOfStream, state.generation),
                ReadStatus::Failed(e) => return (Popped::Failed(e.clone()), state.generation),
                ReadStatus::Reading => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return (Popped::TimedOut, state.generation);
            }
            if audio {
                // Let the reader look past a full video queue
                state.audio_waiters += 1;
                self.cond.notify_all();
                self.cond.wait_for(&mut state, remaining);
                state.audio_waiters -= 1;
            } else {
                self.cond.wait_for(&mut state, remaining);
            }
        }
    }

    // ========================================================================
    // Control API
    // ========================================================================

    /// Drain both queues, clear the read status and start a new generation.
    pub fn reset(&self) -> u64 {
        let mut state = self.state.lock();
        let drained = state.video.len() + state.audio.len();
        state.video.clear();
        state.audio.clear();
        state.video_gap = false;
        state.status = ReadStatus::Reading;
        state.generation += 1;
        state.stats.generation = state.generation;
        self.cond.notify_all();
        tracing::debug!("Queues reset, generation {}, {} packets dropped", state.generation, drained);
        state.generation
    }

    /// Ask the reader to exit. Always signals after setting the flag.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stop = true;
        state.video.clear();
        state.audio.clear();
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stop
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn status(&self) -> ReadStatus {
        self.state.lock().status.clone()
    }

    pub fn video_len(&self) -> usize {
        self.state.lock().video.len()
    }

    pub fn audio_len(&self) -> usize {
        self.state.lock().audio.len()
    }

    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::thread;

    fn packet(stream_index: u32, pts: i64) -> Packet {
        Packet {
            stream_index,
            pts: Some(pts),
            dts: Some(pts),
            duration: Some(1),
            keyframe: true,
            data: Bytes::new(),
        }
    }

    fn queues() -> PacketQueues {
        PacketQueues::new(Routing { video: Some(0), audio: vec![1] }, 1, 8)
    }

    #[test]
    fn test_routing_and_order() {
        let q = queues();
        let generation = q.wait_for_space().unwrap();
        assert!(q.deliver(generation, Ok(Some(packet(1, 10)))));
        assert!(q.deliver(generation, Ok(Some(packet(1, 11)))));
        assert!(q.deliver(generation, Ok(Some(packet(2, 99)))));
        assert!(q.deliver(generation, Ok(Some(packet(0, 5)))));

        assert_eq!(q.video_len(), 1);
        assert_eq!(q.audio_len(), 2);
        assert_eq!(q.stats().unrouted_dropped, 1);

        match q.pop_audio(Duration::from_millis(10)).0 {
            Popped::Packet(p) => assert_eq!(p.pts, Some(10)),
            other => panic!("unexpected {:?}", other),
        }
        match q.pop_audio(Duration::from_millis(10)).0 {
            Popped::Packet(p) => assert_eq!(p.pts, Some(11)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reset_drops_stale_packets() {
        let q = queues();
        let old = q.wait_for_space().unwrap();
        q.deliver(old, Ok(Some(packet(0, 1))));
        let new = q.reset();

        assert_eq!(q.video_len(), 0);
        assert!(!q.deliver(old, Ok(Some(packet(0, 2)))));
        assert!(q.deliver(new, Ok(Some(packet(0, 3)))));
        assert_eq!(q.stats().stale_dropped, 1);
    }

    #[test]
    fn test_end_of_stream_after_packets() {
        let q = queues();
        let generation = q.wait_for_space().unwrap();
        q.deliver(generation, Ok(Some(packet(0, 1))));
        q.deliver(generation, Ok(None));

        assert!(matches!(q.pop_video(Duration::from_millis(10)).0, Popped::Packet(_)));
        assert!(matches!(q.pop_video(Duration::from_millis(10)).0, Popped::EndOfStream));

        q.reset();
        assert_eq!(q.status(), ReadStatus::Reading);
    }

    #[test]
    fn test_pop_times_out() {
        let q = queues();
        assert!(matches!(q.pop_video(Duration::from_millis(5)).0, Popped::TimedOut));
    }

    #[test]
    fn test_stop_wakes_blocked_reader() {
        let q = Arc::new(queues());
        let generation = q.wait_for_space().unwrap();
        q.deliver(generation, Ok(Some(packet(0, 1))));

        let reader = {
            let q = q.clone();
            thread::spawn(move || q.wait_for_space())
        };
        thread::sleep(Duration::from_millis(20));
        q.stop();
        assert!(q.is_stopped());
        assert_eq!(reader.join().unwrap(), None);
        assert!(matches!(q.pop_video(Duration::from_millis(5)).0, Popped::Stopped));
    }

    #[test]
    fn test_starving_audio_lifts_video_bound() {
        let q = Arc::new(queues());
        let generation = q.wait_for_space().unwrap();
        q.deliver(generation, Ok(Some(packet(0, 1))));

        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.pop_audio(Duration::from_secs(2)).0)
        };
        // The full video queue no longer blocks the reader
        let generation = q.wait_for_space().unwrap();
        q.deliver(generation, Ok(Some(packet(0, 2))));
        q.deliver(generation, Ok(Some(packet(1, 2))));

        assert!(matches!(consumer.join().unwrap(), Popped::Packet(_)));
        assert_eq!(q.stats().max_video_depth, 2);
    }

    #[test]
    fn test_video_overrun_reports_gap() {
        let q = PacketQueues::new(Routing { video: Some(0), audio: vec![1] }, 1, 3);
        let generation = q.wait_for_space().unwrap();
        for pts in 0..5 {
            q.deliver(generation, Ok(Some(packet(0, pts))));
        }
        assert_eq!(q.video_len(), 3);
        assert_eq!(q.stats().video_overrun_dropped, 2);

        // The gap is reported once, then the newest packets follow
        assert!(matches!(q.pop_video(Duration::from_millis(5)).0, Popped::Gap));
        match q.pop_video(Duration::from_millis(5)).0 {
            Popped::Packet(p) => assert_eq!(p.pts, Some(2)),
            other => panic!("unexpected {:?}", other),
        }

        q.deliver(generation, Ok(Some(packet(0, 5))));
        q.deliver(generation, Ok(Some(packet(0, 6))));
        q.reset();
        assert!(matches!(q.pop_video(Duration::from_millis(5)).0, Popped::TimedOut));
    }

    #[test]
    fn test_audio_only_is_bounded() {
        let q = Arc::new(PacketQueues::new(Routing { video: None, audio: vec![0] }, 1, 4));
        let reader = {
            let q = q.clone();
            thread::spawn(move || {
                while let Some(generation) = q.wait_for_space() {
                    q.deliver(generation, Ok(Some(packet(0, 0))));
                }
            })
        };
        thread::sleep(Duration::from_millis(30));
        assert_eq!(q.audio_len(), 4);
        assert!(matches!(q.pop_audio(Duration::from_millis(5)).0, Popped::Packet(_)));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(q.stats().audio_enqueued, 5);

        q.stop();
        reader.join().unwrap();
    }
}
