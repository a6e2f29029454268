//! # Framesync Core
//!
//! Position-synchronized decode scheduling: hands out the picture and the
//! audio belonging to an application frame position, driving a demuxer and
//! decoders supplied through [`MediaBackend`].

// ============================================================================
// Collaborators
// ============================================================================
pub mod format;
pub mod demuxer;
pub mod decode;

// ============================================================================
// Timing
// ============================================================================
pub mod clock;
pub mod seek;

// ============================================================================
// Packet Flow
// ============================================================================
pub mod packet_queue;
pub mod prefetch;
pub mod session;

// ============================================================================
// Decode-Sync Loops
// ============================================================================
pub mod video;
pub mod audio;

// ============================================================================
// Output
// ============================================================================
pub mod cache;
pub mod conceal;
pub mod config;
pub mod producer;

#[cfg(feature = "synthetic")]
pub mod synthetic;

pub use config::{DisconnectPolicy, ProducerConfig, StreamSelection};
pub use decode::MediaBackend;
pub use format::{AudioBuffer, Image, ImageFormat, Rational, SampleFormat};
pub use producer::{Producer, ProducerError, ProducerStats};
pub use video::VideoOutput;

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
