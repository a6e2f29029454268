//! Producer configuration.
//!
//! Defaults match the empirically tuned values of the decode engine. Every
//! heuristic threshold is exposed so unusual streams can be tuned without
//! code changes.

use serde::{Deserialize, Serialize};

use crate::format::Rational;

pub const ENV_CACHE: &str = "FRAMESYNC_CACHE";
pub const ENV_SEEK_THRESHOLD: &str = "FRAMESYNC_SEEK_THRESHOLD";
pub const ENV_THREADS: &str = "FRAMESYNC_THREADS";
pub const ENV_DISCONNECT: &str = "FRAMESYNC_DISCONNECT";

/// What to do when a live source stops delivering packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectPolicy {
    /// Treat as end of stream and drain the decoder
    Drain,
    /// Tear down and reopen lazily on the next request
    Reconnect,
    /// Terminate the process
    Exit,
}

impl DisconnectPolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "drain" => Some(Self::Drain),
            "reconnect" => Some(Self::Reconnect),
            "exit" => Some(Self::Exit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamSelection {
    /// First stream of the matching kind
    Auto,
    Index(u32),
    /// Every audio stream, interleaved into one buffer
    All,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Application frame rate positions are expressed in
    pub output_fps: Rational,
    pub video_stream: StreamSelection,
    pub audio_stream: StreamSelection,

    /// Image cache entries, 0 disables
    pub cache_size: usize,
    /// Audio cache entries, 0 disables
    pub audio_cache_size: usize,
    /// Forward distance (frames) still reached by decoding instead of seeking
    pub seek_threshold: i64,
    pub decode_threads: usize,
    pub disconnect: DisconnectPolicy,

    /// Reconciled positions further than this from the request are replaced
    pub wild_timestamp_frames: i64,
    /// Consecutive decode errors tolerated per request
    pub decode_error_limit: u32,
    pub anchor_scan_packets: usize,
    pub vfr_scan_packets: usize,
    pub vfr_threshold: usize,
    pub negative_dts_anchors_zero: bool,
    /// Earlier seek target when the codec reorders frames
    pub preseek_seconds: f64,
    pub video_delay_seconds: f64,

    pub audio_preroll_seconds: f64,
    pub audio_resync_seconds: f64,
    pub audio_drift_frames: i64,
    pub mute_on_pause: bool,

    pub read_timeout_ms: u64,
    /// Video packets buffered beyond the backpressure bound while audio starves
    pub audio_starve_video_cap: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            output_fps: Rational::new(25, 1),
            video_stream: StreamSelection::Auto,
            audio_stream: StreamSelection::Auto,
            cache_size: 10,
            audio_cache_size: 4,
            seek_threshold: 64,
            decode_threads: 1,
            disconnect: DisconnectPolicy::Drain,
            wild_timestamp_frames: 999,
            decode_error_limit: 10,
            anchor_scan_packets: 500,
            vfr_scan_packets: 20,
            vfr_threshold: 3,
            negative_dts_anchors_zero: true,
            preseek_seconds: 2.0,
            video_delay_seconds: 0.0,
            audio_preroll_seconds: 0.25,
            audio_resync_seconds: 1.0,
            audio_drift_frames: 2,
            mute_on_pause: false,
            read_timeout_ms: 10_000,
            audio_starve_video_cap: 256,
        }
    }
}

impl ProducerConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_env(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key/value lookup
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(size) = lookup(ENV_CACHE).and_then(|v| v.trim().parse().ok()) {
            self.cache_size = size;
        }
        if let Some(threshold) = lookup(ENV_SEEK_THRESHOLD).and_then(|v| v.trim().parse().ok()) {
            self.seek_threshold = threshold;
        }
        if let Some(threads) = lookup(ENV_THREADS).and_then(|v| v.trim().parse().ok()) {
            self.decode_threads = threads;
        }
        if let Some(value) = lookup(ENV_DISCONNECT) {
            match DisconnectPolicy::parse(&value) {
                Some(policy) => self.disconnect = policy,
                None => tracing::warn!("Ignoring unknown {} value {:?}", ENV_DISCONNECT, value),
            }
        }
        self
    }

    pub fn output_fps(&self) -> f64 {
        if self.output_fps.is_valid() {
            self.output_fps.as_f64()
        } else {
            25.0
        }
    }

    /// Seek threshold, never below one frame
    pub fn seek_threshold(&self) -> i64 {
        self.seek_threshold.max(1)
    }
}
