//! # Video Decode-Sync Loop
//!
//! Turns "picture for application position P" into decoder work:
//!
//! ```text
//! NEED_PACKET ──► DECODING ──► HAVE_FRAME ──► convert, deliver
//!      ▲              │
//!      └── NEED_MORE ─┘
//!                     └──► DRAINING (end of stream) ──► concealment
//! ```
//!
//! Every decoded frame is reconciled to a source position. Frames before
//! the request are dropped (catching up after a seek landed on an earlier
//! key frame); the first frame at or past the request is delivered.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::StreamClock;
use crate::conceal::Concealment;
use crate::config::ProducerConfig;
use crate::decode::{ImageConverter, MediaBackend, Received, VideoDecoder, VideoFrame};
use crate::demuxer::{Packet, StreamInfo};
use crate::format::{pick_image_format, Image, ImageFormat, PixelFormat};
use crate::packet_queue::Popped;
use crate::producer::ProducerError;
use crate::seek::{plan_video_seek, SeekPlan, POSITION_INITIAL, POSITION_INVALID};
use crate::session::{ReadEndAction, Session};

/// A delivered picture
#[derive(Debug, Clone)]
pub struct VideoOutput {
    pub image: Arc<Image>,
    /// Requested application position
    pub position: i64,
    /// Reconciled source position of the picture
    pub frame_position: i64,
    /// Substituted from the last good picture after a failure
    pub concealed: bool,
}

/// Last good picture, kept with its decoded frame so a concealed
/// substitute can be converted to whatever format is asked for next
#[derive(Debug)]
pub struct GoodPicture {
    frame: VideoFrame,
    image: Arc<Image>,
}

/// Decoder position state
#[derive(Debug, Clone)]
pub struct DecodeCursor {
    /// Last requested source position
    pub last_requested: i64,
    /// Reconciled position of the last decoded frame
    pub last_decoded: i64,
    /// One past the last delivered application position
    pub expected: i64,
    /// Reconciled position of the last packet read
    pub last_packet: i64,
    /// Packet read across a reposition, replayed after re-planning
    pub pending: Option<Packet>,
    /// End of stream was sent and buffered frames are being drained
    pub draining: bool,
    pub skip_nonref: bool,
}

impl DecodeCursor {
    pub fn new() -> Self {
        Self {
            last_requested: POSITION_INITIAL,
            last_decoded: POSITION_INITIAL,
            expected: POSITION_INITIAL,
            last_packet: POSITION_INITIAL,
            pending: None,
            draining: false,
            skip_nonref: false,
        }
    }

    pub fn invalidate(&mut self) {
        self.last_decoded = POSITION_INVALID;
        self.expected = POSITION_INVALID;
        self.last_packet = POSITION_INVALID;
        self.pending = None;
        self.draining = false;
    }
}

impl Default for DecodeCursor {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoStats {
    pub frames_decoded: u64,
    pub frames_dropped: u64,
    pub duplicates: u64,
    pub decode_errors: u64,
    pub wild_timestamps: u64,
    pub concealed: u64,
}

enum Fetch {
    Packet(Packet),
    EndOfStream,
    /// The other loop moved the demuxer
    Repositioned,
    /// Packets were discarded while nobody pulled video
    Gap,
    Reopen,
    Closed,
}

enum DecodeEnd {
    Frame(VideoFrame, i64),
    Exhausted,
    Reopen,
    Closed,
}

pub struct VideoLoop {
    session: Arc<Session>,
    stream: StreamInfo,
    decoder: Box<dyn VideoDecoder>,
    clock: StreamClock,
    cursor: DecodeCursor,
    last_frame: Option<VideoFrame>,
    last_output: Option<Arc<Image>>,
    seen_generation: u64,
    must_decode: bool,
    still_image: bool,
    config: ProducerConfig,
    needs_reopen: bool,
    stats: VideoStats,
}

impl VideoLoop {
    pub fn new(session: Arc<Session>, backend: &dyn MediaBackend, config: &ProducerConfig) -> Result<Self, ProducerError> {
        let stream = session
            .video_stream()
            .cloned()
            .ok_or_else(|| ProducerError::NoStream("no video stream selected".into()))?;
        let clock = session
            .clock()
            .cloned()
            .ok_or_else(|| ProducerError::NoStream("video stream has no clock".into()))?
            .with_output_fps(config.output_fps());
        let decoder = backend
            .video_decoder(&stream, config.decode_threads.max(1))
            .map_err(|e| ProducerError::Open(format!("video decoder: {}", e)))?;
        tracing::debug!("Video loop using {} for stream {}", decoder.name(), stream.index);

        let seen_generation = session.queues().generation();
        Ok(Self {
            must_decode: !stream.intra_only,
            still_image: stream.is_cover_art(),
            session,
            stream,
            decoder,
            clock,
            cursor: DecodeCursor::new(),
            last_frame: None,
            last_output: None,
            seen_generation,
            config: config.clone(),
            needs_reopen: false,
            stats: VideoStats::default(),
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn cursor(&self) -> &DecodeCursor {
        &self.cursor
    }

    pub fn clock(&self) -> &StreamClock {
        &self.clock
    }

    pub fn stats(&self) -> VideoStats {
        self.stats
    }

    pub fn is_still_image(&self) -> bool {
        self.still_image
    }

    /// Source must be torn down and reopened before the next request
    pub fn needs_reopen(&self) -> bool {
        self.needs_reopen
    }

    /// Decoded pixel format the stream advertises
    pub fn source_pixel_format(&self) -> PixelFormat {
        self.stream.pixel_format.unwrap_or(PixelFormat::Yuv420p)
    }

    /// Produce the picture for application `position`.
    pub fn get(
        &mut self,
        position: i64,
        format: ImageFormat,
        converter: &dyn ImageConverter,
        conceal: &mut Concealment<GoodPicture>,
    ) -> Result<VideoOutput, ProducerError> {
        let req = if self.still_image { 0 } else { self.clock.source_position(position) };
        self.observe_generation();

        let mut paused = self.still_image && self.last_frame.is_some();
        match plan_video_seek(
            position,
            self.cursor.expected,
            self.last_frame.is_some(),
            self.config.seek_threshold(),
            self.session.is_seekable(),
        ) {
            SeekPlan::Paused => paused = true,
            SeekPlan::Seek if !self.still_image || self.last_frame.is_none() => self.seek(req),
            _ => {}
        }
        self.cursor.last_requested = req;

        let produced = if self.last_frame.is_some() && (paused || self.cursor.last_decoded >= req) {
            self.stats.duplicates += 1;
            self.duplicate(format, converter).map(|image| (image, self.cursor.last_decoded))
        } else {
            match self.decode_until(position, req) {
                DecodeEnd::Frame(frame, frame_position) => self.deliver(frame, frame_position, format, converter),
                DecodeEnd::Exhausted => None,
                DecodeEnd::Reopen => {
                    self.needs_reopen = true;
                    None
                }
                DecodeEnd::Closed => return Err(ProducerError::Closed),
            }
        };

        self.cursor.expected = position + 1;

        match produced {
            Some((image, frame_position)) => {
                if let Some(frame) = &self.last_frame {
                    let good = GoodPicture {
                        frame: frame.clone(),
                        image: image.clone(),
                    };
                    conceal.record(frame_position, Arc::new(good));
                }
                Ok(VideoOutput {
                    image,
                    position,
                    frame_position,
                    concealed: false,
                })
            }
            None => match conceal.conceal() {
                Some(good) => {
                    let Some(image) = reconvert(&good, format, converter) else {
                        return Err(ProducerError::NoImage(position));
                    };
                    self.stats.concealed += 1;
                    tracing::debug!("Concealing position {} with last good frame", position);
                    Ok(VideoOutput {
                        image,
                        position,
                        frame_position: conceal.last_good_position().unwrap_or(POSITION_INVALID),
                        concealed: true,
                    })
                }
                None => Err(ProducerError::NoImage(position)),
            },
        }
    }

    // ========================================================================
    // Seeking
    // ========================================================================

    fn seek(&mut self, req: i64) {
        let preseek = (self.must_decode && self.stream.has_b_frames).then_some(self.config.preseek_seconds);
        let timestamp = self.clock.target_timestamp(req, preseek);
        tracing::debug!(
            "Video seek to timestamp {} for position {} (expected {})",
            timestamp,
            req,
            self.cursor.expected
        );

        self.cursor.skip_nonref = true;
        self.decoder.set_skip_nonref(true);
        if let Ok(generation) = self.session.seek().seek_to(timestamp) {
            self.seen_generation = generation;
        }
        self.reset_decode_state();
    }

    fn reset_decode_state(&mut self) {
        self.decoder.flush();
        self.cursor.invalidate();
        self.last_frame = None;
        self.last_output = None;
    }

    /// Flush if the audio loop repositioned the demuxer since our last look.
    /// Returns true when something changed.
    fn observe_generation(&mut self) -> bool {
        let generation = self.session.queues().generation();
        if generation == self.seen_generation {
            return false;
        }
        self.seen_generation = generation;
        self.reset_decode_state();

        // Decoding forward from the other loop's target is fine when it is
        // at or before ours; the seek plan decides from this expectation.
        if let Some(landing) = self.session.seek().landing(generation) {
            let relative = landing.seconds - self.clock.anchor_seconds();
            self.cursor.expected = (relative * self.clock.output_fps()).round() as i64;
            tracing::debug!("Video follows reposition to {:.3}s", landing.seconds);
        }
        true
    }

    // ========================================================================
    // Decoding
    // ========================================================================

    fn decode_until(&mut self, position: i64, req: i64) -> DecodeEnd {
        let limit = self.config.decode_error_limit;
        let mut errors = 0u32;

        loop {
            match self.decoder.receive() {
                Ok(Received::Frame(frame)) => {
                    let frame_position = self.frame_position(&frame, req);
                    if frame_position >= req || self.still_image {
                        if self.cursor.skip_nonref {
                            self.cursor.skip_nonref = false;
                            self.decoder.set_skip_nonref(false);
                        }
                        return DecodeEnd::Frame(frame, frame_position);
                    }
                    self.stats.frames_dropped += 1;
                    continue;
                }
                Ok(Received::NeedMoreInput) => {}
                Ok(Received::EndOfStream) => return DecodeEnd::Exhausted,
                Err(e) => {
                    self.stats.decode_errors += 1;
                    errors += 1;
                    if errors > limit {
                        tracing::warn!("Video decoding error: {}", e);
                        return DecodeEnd::Exhausted;
                    }
                    continue;
                }
            }

            if self.cursor.draining {
                return DecodeEnd::Exhausted;
            }

            let packet = match self.next_packet() {
                Fetch::Packet(packet) => packet,
                Fetch::EndOfStream => {
                    self.cursor.draining = true;
                    if let Err(e) = self.decoder.send(None) {
                        tracing::debug!("Drain rejected: {}", e);
                        return DecodeEnd::Exhausted;
                    }
                    continue;
                }
                Fetch::Repositioned => {
                    if plan_video_seek(position, self.cursor.expected, false, self.config.seek_threshold(), true)
                        == SeekPlan::Seek
                    {
                        self.seek(req);
                    }
                    continue;
                }
                Fetch::Gap => {
                    if self.session.is_seekable() {
                        self.seek(req);
                    } else {
                        self.reset_decode_state();
                    }
                    continue;
                }
                Fetch::Reopen => return DecodeEnd::Reopen,
                Fetch::Closed => return DecodeEnd::Closed,
            };

            let packet_position = self.packet_position(&packet, req);
            if self.must_decode || packet_position >= req {
                match self.decoder.send(Some(&packet)) {
                    Ok(()) => errors = 0,
                    Err(e) => {
                        self.stats.decode_errors += 1;
                        errors += 1;
                        tracing::debug!("Decode error {} of {}: {}", errors, limit, e);
                        // Streams may start with pictures referencing data
                        // before the first key frame, so allow a few
                        if errors > limit {
                            tracing::warn!("Video decoding error: {}", e);
                            return DecodeEnd::Exhausted;
                        }
                    }
                }
            }
        }
    }

    fn next_packet(&mut self) -> Fetch {
        if let Some(packet) = self.cursor.pending.take() {
            return Fetch::Packet(packet);
        }

        let timeout = Duration::from_millis(self.config.read_timeout_ms);
        let (popped, generation) = self.session.queues().pop_video(timeout);
        if generation != self.seen_generation && self.observe_generation() {
            if let Popped::Packet(packet) = popped {
                self.cursor.pending = Some(packet);
            }
            return Fetch::Repositioned;
        }

        match popped {
            Popped::Packet(packet) => Fetch::Packet(packet),
            Popped::EndOfStream => self.on_disconnect("end of stream"),
            Popped::Failed(e) => {
                tracing::warn!("Video read failed: {}", e);
                self.on_disconnect("read error")
            }
            Popped::TimedOut => {
                tracing::warn!("No video packet within {:?}", timeout);
                self.on_disconnect("read timeout")
            }
            Popped::Gap => {
                tracing::debug!("Video packets were discarded, repositioning to {}", self.cursor.last_requested);
                Fetch::Gap
            }
            Popped::Stopped => Fetch::Closed,
        }
    }

    fn on_disconnect(&self, reason: &str) -> Fetch {
        match self.session.on_read_end(self.config.disconnect, reason) {
            ReadEndAction::Drain => Fetch::EndOfStream,
            ReadEndAction::Reopen => Fetch::Reopen,
        }
    }

    fn clamp_wild(&mut self, position: i64, req: i64) -> i64 {
        if req.abs_diff(position) > self.config.wild_timestamp_frames.max(0) as u64 {
            self.stats.wild_timestamps += 1;
            tracing::debug!("Wild timestamp: position {} for request {}", position, req);
            req
        } else {
            position
        }
    }

    fn packet_position(&mut self, packet: &Packet, req: i64) -> i64 {
        let Some(timestamp) = self.clock.best_pts(packet.pts, packet.dts) else {
            return if self.cursor.last_packet >= 0 { self.cursor.last_packet } else { req };
        };
        if !self.session.is_seekable() && self.clock.anchor(timestamp) {
            self.session.anchor_once(self.clock.anchor_seconds());
        }

        let mut position = self.clock.timestamp_to_position(timestamp);
        // Identical positions only make sense under a variable frame rate
        if position == self.cursor.last_packet && !self.clock.is_variable_rate() {
            position = position.saturating_add(1);
        }
        let position = self.clamp_wild(position, req);
        tracing::trace!(
            "V pts {:?} dts {:?} req {} cur {} pkt {}",
            packet.pts,
            packet.dts,
            req,
            self.cursor.last_decoded,
            position
        );
        self.cursor.last_packet = position;
        position
    }

    fn frame_position(&mut self, frame: &VideoFrame, req: i64) -> i64 {
        match self.clock.best_pts(frame.pts, frame.dts) {
            Some(timestamp) => {
                // Streams that do not flag key frames in the container
                if frame.key_frame && self.clock.anchor(timestamp) {
                    self.session.anchor_once(self.clock.anchor_seconds());
                }
                let position = self.clock.timestamp_to_position(timestamp);
                self.clamp_wild(position, req)
            }
            None if self.cursor.last_packet >= 0 => self.cursor.last_packet,
            None => req,
        }
    }

    // ========================================================================
    // Output
    // ========================================================================

    fn deliver(
        &mut self,
        frame: VideoFrame,
        frame_position: i64,
        format: ImageFormat,
        converter: &dyn ImageConverter,
    ) -> Option<(Arc<Image>, i64)> {
        self.stats.frames_decoded += 1;
        self.cursor.last_decoded = frame_position;
        let target = pick_image_format(format, frame.pixel_format);
        let result = converter.convert(&frame, target, frame.width, frame.height);
        self.last_frame = Some(frame);
        match result {
            Ok(image) => {
                let image = Arc::new(image);
                self.last_output = Some(image.clone());
                Some((image, frame_position))
            }
            Err(e) => {
                tracing::warn!("Image conversion failed: {}", e);
                self.last_output = None;
                None
            }
        }
    }

    /// Last picture again, converted anew if the format changed
    fn duplicate(&mut self, format: ImageFormat, converter: &dyn ImageConverter) -> Option<Arc<Image>> {
        let frame = self.last_frame.as_ref()?;
        let target = pick_image_format(format, frame.pixel_format);
        if let Some(image) = self.last_output.as_ref().filter(|image| image.format == target) {
            return Some(image.clone());
        }
        match converter.convert(frame, target, frame.width, frame.height) {
            Ok(image) => {
                let image = Arc::new(image);
                self.last_output = Some(image.clone());
                Some(image)
            }
            Err(e) => {
                tracing::warn!("Image conversion failed: {}", e);
                None
            }
        }
    }
}

/// The recorded picture in the format `format` resolves to now
fn reconvert(good: &GoodPicture, format: ImageFormat, converter: &dyn ImageConverter) -> Option<Arc<Image>> {
    let frame = &good.frame;
    let target = pick_image_format(format, frame.pixel_format);
    if good.image.format == target {
        return Some(good.image.clone());
    }
    match converter.convert(frame, target, frame.width, frame.height) {
        Ok(image) => Some(Arc::new(image)),
        Err(e) => {
            tracing::warn!("Concealment conversion failed: {}", e);
            None
        }
    }
}
