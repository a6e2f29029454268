//! # Position Translator
//!
//! Converts between application frame positions, source frame positions and
//! stream timestamps.
//!
//! - Application positions count frames at the output rate.
//! - Source positions count frames at the stream's nominal rate.
//! - Timestamps are in the stream time base and are anchored on the first
//!   key-frame timestamp so that position 0 is the first picture.
//!
//! Nothing here fails: an unresolvable timestamp is `None` and callers treat
//! it as "the requested position is correct".

use crate::config::ProducerConfig;
use crate::demuxer::Packet;
use crate::format::Rational;

/// Timeline state for the primary stream
#[derive(Debug, Clone)]
pub struct StreamClock {
    time_base: Rational,
    source_fps: f64,
    output_fps: f64,
    start_time: Option<i64>,
    first_pts: Option<i64>,
    invalid_pts_count: u32,
    invalid_dts_count: u32,
    variable_rate: bool,
    delay_seconds: f64,
}

impl StreamClock {
    pub fn new(time_base: Rational, source_fps: f64, output_fps: f64) -> Self {
        let source_fps = if source_fps > 0.0 { source_fps } else { output_fps };
        Self {
            time_base,
            source_fps,
            output_fps,
            start_time: None,
            first_pts: None,
            invalid_pts_count: 0,
            invalid_dts_count: 0,
            variable_rate: false,
            delay_seconds: 0.0,
        }
    }

    pub fn with_start_time(mut self, start_time: Option<i64>) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn with_output_fps(mut self, output_fps: f64) -> Self {
        if output_fps > 0.0 {
            self.output_fps = output_fps;
        }
        self
    }

    pub fn with_delay(mut self, delay_seconds: f64) -> Self {
        self.delay_seconds = delay_seconds;
        self
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn source_fps(&self) -> f64 {
        self.source_fps
    }

    pub fn output_fps(&self) -> f64 {
        self.output_fps
    }

    pub fn first_pts(&self) -> Option<i64> {
        self.first_pts
    }

    pub fn is_variable_rate(&self) -> bool {
        self.variable_rate
    }

    pub fn invalid_counts(&self) -> (u32, u32) {
        (self.invalid_pts_count, self.invalid_dts_count)
    }

    /// Pick the authoritative timestamp of a packet or frame.
    ///
    /// Every absent field bumps its counter; PTS wins unless it has been
    /// missing more often than DTS.
    pub fn best_pts(&mut self, pts: Option<i64>, dts: Option<i64>) -> Option<i64> {
        self.invalid_pts_count += pts.is_none() as u32;
        self.invalid_dts_count += dts.is_none() as u32;
        match pts {
            Some(pts) if self.invalid_pts_count <= self.invalid_dts_count || dts.is_none() => Some(pts),
            _ => dts,
        }
    }

    /// Set the anchor if none exists yet. Returns true when it was set.
    pub fn anchor(&mut self, pts: i64) -> bool {
        if self.first_pts.is_some() {
            return false;
        }
        tracing::debug!("Anchoring first_pts at {}", pts);
        self.first_pts = Some(pts);
        true
    }

    fn anchor_ts(&self) -> i64 {
        self.first_pts.or(self.start_time).unwrap_or(0)
    }

    /// Seconds of the anchor on the absolute stream timeline
    pub fn anchor_seconds(&self) -> f64 {
        self.anchor_ts() as f64 * self.time_base.as_f64()
    }

    /// Application position to source frame position
    pub fn source_position(&self, position: i64) -> i64 {
        (position as f64 / self.output_fps * self.source_fps + 0.5) as i64
    }

    /// Source frame position to seconds since the anchor
    pub fn source_seconds(&self, source_position: i64) -> f64 {
        source_position as f64 / self.source_fps
    }

    /// Seek target in stream time base for a source position.
    pub fn target_timestamp(&self, source_position: i64, preseek_seconds: Option<f64>) -> i64 {
        if !self.time_base.is_valid() {
            return 0;
        }
        // seconds * den / num keeps whole-second targets exact
        let ticks_per_second = self.time_base.den as f64 / self.time_base.num as f64;
        let mut timestamp = if source_position <= 0 {
            0
        } else {
            ((self.source_seconds(source_position) * ticks_per_second).round() as i64).saturating_add(self.anchor_ts())
        };
        if let Some(preseek) = preseek_seconds {
            timestamp = timestamp.saturating_sub((preseek * ticks_per_second).round() as i64);
        }
        timestamp.max(0)
    }

    /// Stream timestamp to source frame position
    pub fn timestamp_to_position(&self, timestamp: i64) -> i64 {
        // Corrupt timestamps may sit anywhere in the i64 range
        let seconds = self.time_base.as_f64() * timestamp.saturating_sub(self.anchor_ts()) as f64;
        ((seconds + self.delay_seconds) * self.source_fps + 0.5) as i64
    }

    /// Resolve a position from optional timestamps, updating the counters.
    pub fn resolve_position(&mut self, pts: Option<i64>, dts: Option<i64>) -> Option<i64> {
        self.best_pts(pts, dts).map(|ts| self.timestamp_to_position(ts))
    }
}

/// Absolute seconds to a timestamp in `time_base`
pub fn seconds_to_timestamp(seconds: f64, time_base: Rational) -> i64 {
    if !time_base.is_valid() {
        return 0;
    }
    (seconds * time_base.den as f64 / time_base.num as f64).round() as i64
}

pub fn timestamp_to_seconds(timestamp: i64, time_base: Rational) -> f64 {
    timestamp as f64 * time_base.as_f64()
}

// ============================================================================
// Anchor Scan
// ============================================================================

/// Bounded forward scan for the first key-frame timestamp, detecting
/// variable frame rate on the way.
#[derive(Debug)]
pub struct AnchorScan {
    video_index: u32,
    packets_left: usize,
    vfr_left: usize,
    vfr_threshold: usize,
    negative_dts_anchors_zero: bool,
    prev_duration: Option<i64>,
    duration_changes: usize,
    distinct_durations: Vec<i64>,
}

impl AnchorScan {
    pub fn new(video_index: u32, config: &ProducerConfig) -> Self {
        Self {
            video_index,
            packets_left: config.anchor_scan_packets,
            vfr_left: config.vfr_scan_packets,
            vfr_threshold: config.vfr_threshold.max(1),
            negative_dts_anchors_zero: config.negative_dts_anchors_zero,
            prev_duration: None,
            duration_changes: 0,
            distinct_durations: Vec::new(),
        }
    }

    fn vfr_detected(&self) -> bool {
        self.duration_changes >= self.vfr_threshold || self.distinct_durations.len() >= self.vfr_threshold
    }

    /// Whether another packet should be read
    pub fn wants_more(&self, clock: &StreamClock) -> bool {
        self.packets_left > 0
            && (clock.first_pts.is_none() || (!self.vfr_detected() && self.vfr_left > 0))
    }

    /// Feed one packet read from the demuxer.
    pub fn observe(&mut self, clock: &mut StreamClock, packet: &Packet) {
        self.packets_left = self.packets_left.saturating_sub(1);
        if packet.stream_index != self.video_index {
            return;
        }

        if self.vfr_left > 0 {
            if let Some(duration) = packet.duration.filter(|d| *d > 0) {
                if self.prev_duration.is_some_and(|prev| prev != duration) {
                    self.duration_changes += 1;
                }
                if !self.distinct_durations.contains(&duration) {
                    self.distinct_durations.push(duration);
                }
            }
            self.prev_duration = packet.duration.filter(|d| *d > 0);
            self.vfr_left -= 1;
        }

        if packet.keyframe && clock.first_pts.is_none() {
            tracing::debug!(
                "first key frame pts {:?} dts {:?}",
                packet.pts,
                packet.dts
            );
            let negative_dts = packet.dts.is_some_and(|dts| dts < 0);
            if negative_dts && self.negative_dts_anchors_zero {
                clock.anchor(0);
            } else if let Some(pts) = clock.best_pts(packet.pts, packet.dts) {
                clock.anchor(pts);
            }
        }
    }

    /// Publish the variable-rate verdict.
    pub fn finish(self, clock: &mut StreamClock) -> bool {
        if self.vfr_detected() {
            tracing::info!(
                "Variable frame rate detected ({} duration changes, {} distinct)",
                self.duration_changes,
                self.distinct_durations.len()
            );
            clock.variable_rate = true;
        }
        clock.variable_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn packet(pts: Option<i64>, dts: Option<i64>, duration: Option<i64>, keyframe: bool) -> Packet {
        Packet {
            stream_index: 0,
            pts,
            dts,
            duration,
            keyframe,
            data: Bytes::new(),
        }
    }

    fn scan(packets: &[Packet]) -> StreamClock {
        let config = ProducerConfig::default();
        let mut clock = StreamClock::new(Rational::new(1, 25), 25.0, 25.0);
        let mut scan = AnchorScan::new(0, &config);
        for p in packets {
            if !scan.wants_more(&clock) {
                break;
            }
            scan.observe(&mut clock, p);
        }
        scan.finish(&mut clock);
        clock
    }

    #[test]
    fn test_best_pts_prefers_dts_until_counts_cross() {
        let mut clock = StreamClock::new(Rational::new(1, 25), 25.0, 25.0);

        for i in 0..3 {
            assert_eq!(clock.best_pts(None, Some(i)), Some(i));
        }
        // PTS present again but has been missing more often than DTS
        assert_eq!(clock.best_pts(Some(100), Some(3)), Some(3));
        assert_eq!(clock.best_pts(Some(101), Some(4)), Some(4));

        // DTS now goes missing; once the counters meet, PTS wins
        assert_eq!(clock.best_pts(Some(102), None), Some(102));
        assert_eq!(clock.best_pts(Some(103), None), Some(103));
        assert_eq!(clock.invalid_counts(), (3, 2));
        assert_eq!(clock.best_pts(Some(104), Some(7)), Some(7));
        assert_eq!(clock.best_pts(Some(105), None), Some(105));
        assert_eq!(clock.invalid_counts(), (3, 3));
        assert_eq!(clock.best_pts(Some(106), Some(9)), Some(106));
    }

    #[test]
    fn test_best_pts_unknown() {
        let mut clock = StreamClock::new(Rational::new(1, 25), 25.0, 25.0);
        assert_eq!(clock.best_pts(None, None), None);
        assert_eq!(clock.resolve_position(None, None), None);
    }

    #[test]
    fn test_position_round_trip_with_anchor() {
        let mut clock = StreamClock::new(Rational::new(1, 90_000), 25.0, 25.0);
        clock.anchor(900);

        let ts = clock.target_timestamp(50, None);
        assert_eq!(ts, 50 * 3600 + 900);
        assert_eq!(clock.timestamp_to_position(ts), 50);
        assert_eq!(clock.target_timestamp(0, None), 0);

        // Preseek biases two seconds earlier, never below zero
        assert_eq!(clock.target_timestamp(50, Some(2.0)), 50 * 3600 + 900 - 180_000);
        assert_eq!(clock.target_timestamp(10, Some(2.0)), 0);
    }

    #[test]
    fn test_extreme_timestamps_saturate() {
        let mut clock = StreamClock::new(Rational::new(1, 25), 25.0, 25.0);
        clock.anchor(1000);
        assert!(clock.timestamp_to_position(i64::MIN + 5) < 0);
        assert!(clock.timestamp_to_position(i64::MAX) > 0);

        let mut late = StreamClock::new(Rational::new(1, 25), 25.0, 25.0);
        late.anchor(i64::MAX - 10);
        assert_eq!(late.target_timestamp(100, None), i64::MAX);
    }

    #[test]
    fn test_source_position_rate_conversion() {
        let clock = StreamClock::new(Rational::new(1, 50), 50.0, 25.0);
        assert_eq!(clock.source_position(10), 20);
        let clock = StreamClock::new(Rational::new(1, 24), 24.0, 25.0);
        assert_eq!(clock.source_position(25), 24);
    }

    #[test]
    fn test_anchor_negative_dts_is_zero() {
        let clock = scan(&[
            packet(None, Some(-2), Some(1), true),
            packet(Some(1), Some(-1), Some(1), false),
        ]);
        assert_eq!(clock.first_pts(), Some(0));
    }

    #[test]
    fn test_anchor_skips_leading_non_key() {
        let clock = scan(&[
            packet(Some(3), Some(3), Some(1), false),
            packet(Some(4), Some(4), Some(1), true),
            packet(Some(5), Some(5), Some(1), false),
        ]);
        assert_eq!(clock.first_pts(), Some(4));
        assert!(!clock.is_variable_rate());
    }

    #[test]
    fn test_vfr_three_distinct_durations() {
        let mut packets = Vec::new();
        for (i, d) in [1, 1, 2, 2, 3, 3].iter().enumerate() {
            packets.push(packet(Some(i as i64), Some(i as i64), Some(*d), i == 0));
        }
        assert!(scan(&packets).is_variable_rate());
    }

    #[test]
    fn test_cfr_not_flagged() {
        let constant: Vec<Packet> = (0..20)
            .map(|i| packet(Some(i), Some(i), Some(1), i == 0))
            .collect();
        assert!(!scan(&constant).is_variable_rate());

        let no_durations: Vec<Packet> = (0..20)
            .map(|i| packet(Some(i), Some(i), None, i == 0))
            .collect();
        assert!(!scan(&no_durations).is_variable_rate());
    }

    #[test]
    fn test_vfr_only_counts_first_window() {
        let mut packets: Vec<Packet> = (0..20)
            .map(|i| packet(Some(i), Some(i), Some(1), i == 0))
            .collect();
        for i in 20..30 {
            packets.push(packet(Some(i), Some(i), Some(i), false));
        }
        assert!(!scan(&packets).is_variable_rate());
    }
}
