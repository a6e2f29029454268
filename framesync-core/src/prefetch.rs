//! Packet prefetch thread.
//!
//! One background reader per open session pulls packets from the demuxer and
//! routes them into the [`PacketQueues`]. Blocking I/O (devices, pipes,
//! network sources) therefore never runs on a caller's decode path.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::demuxer::Demuxer;
use crate::packet_queue::PacketQueues;

/// Demuxer shared by the reader and the seek controller
pub type SharedDemuxer = Arc<Mutex<Box<dyn Demuxer>>>;

pub struct Prefetcher {
    queues: Arc<PacketQueues>,
    handle: Option<JoinHandle<()>>,
}

impl Prefetcher {
    pub fn spawn(demuxer: SharedDemuxer, queues: Arc<PacketQueues>) -> std::io::Result<Self> {
        let handle = {
            let queues = queues.clone();
            thread::Builder::new()
                .name("framesync-prefetch".into())
                .spawn(move || run(demuxer, queues))?
        };
        Ok(Self {
            queues,
            handle: Some(handle),
        })
    }

    /// Stop the reader and wait for it. Queues stay valid until this returns.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.queues.stop();
            if handle.join().is_err() {
                tracing::error!("Prefetch thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(demuxer: SharedDemuxer, queues: Arc<PacketQueues>) {
    tracing::debug!("Prefetch thread started");
    while queues.wait_for_space().is_some() {
        let (generation, result) = {
            let mut demuxer = demuxer.lock();
            // Repositioning bumps the generation while holding the demuxer,
            // so this generation matches the read position.
            let generation = queues.generation();
            (generation, demuxer.read_next_packet())
        };
        queues.deliver(generation, result);
    }
    tracing::debug!("Prefetch thread stopped");
}
