//! Output sinks: where encoded packets go.
//!
//! Two sinks implement one interface: the direct writer (muxer plus the
//! optional TCP mirror) and the replay ring. A single mutex serializes
//! submissions from every producer thread; the pacer holds it for the
//! video stream, audio producers for theirs.

use std::io;
use std::sync::Arc;

use gpurec_encode::{EncodedPacket, TimeBase};
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::muxer::{rescale_packet, ContainerWriter};
use crate::replay::{ReplayRing, ReplaySnapshot};
use crate::stream_server::StreamServer;

/// One of the two packet destinations.
pub enum OutputSink {
    Direct(DirectSink),
    Replay(ReplaySink),
}

impl OutputSink {
    /// Submit one encoded packet.
    ///
    /// Output-file errors are fatal and propagate; side-channel errors are
    /// already swallowed below.
    pub fn submit(&mut self, packet: &EncodedPacket) -> io::Result<()> {
        match self {
            OutputSink::Direct(sink) => sink.submit(packet),
            OutputSink::Replay(sink) => {
                sink.submit(packet);
                Ok(())
            }
        }
    }

    /// Finish the sink at orderly shutdown.
    pub fn finish(&mut self) -> io::Result<()> {
        match self {
            OutputSink::Direct(sink) => sink.writer.write_trailer(),
            OutputSink::Replay(_) => Ok(()),
        }
    }

    /// Access the replay ring when in replay mode.
    pub fn replay_ring(&mut self) -> Option<&mut ReplayRing> {
        match self {
            OutputSink::Replay(sink) => Some(&mut sink.ring),
            OutputSink::Direct(_) => None,
        }
    }

    /// Snapshot the replay ring (replay mode only).
    pub fn replay_snapshot(&self) -> Option<ReplaySnapshot> {
        match self {
            OutputSink::Replay(sink) => Some(sink.ring.snapshot()),
            OutputSink::Direct(_) => None,
        }
    }

    /// Forward HDR metadata to the muxer (direct mode; replay attaches it
    /// at save time instead).
    pub fn set_hdr_metadata(&mut self, metadata: &gpurec_kms::HdrOutputMetadata) {
        if let OutputSink::Direct(sink) = self {
            sink.writer.set_hdr_metadata(metadata);
        }
    }
}

/// Muxer writer plus the best-effort TCP mirror.
pub struct DirectSink {
    writer: Box<dyn ContainerWriter>,
    codec_time_base: TimeBase,
    stream_time_base: TimeBase,
    stream_server: Option<Arc<StreamServer>>,
    write_failed: bool,
}

impl DirectSink {
    pub fn new(
        writer: Box<dyn ContainerWriter>,
        codec_time_base: TimeBase,
        stream_time_base: TimeBase,
        stream_server: Option<Arc<StreamServer>>,
    ) -> Self {
        Self {
            writer,
            codec_time_base,
            stream_time_base,
            stream_server,
            write_failed: false,
        }
    }

    fn submit(&mut self, packet: &EncodedPacket) -> io::Result<()> {
        // The raw payload goes to the side channel before muxing so a
        // consumer sees NAL units, not container chunks.
        if let Some(server) = &self.stream_server {
            server.send_data(&packet.data);
        }

        let rescaled = rescale_packet(packet, self.codec_time_base, self.stream_time_base);
        match self.writer.write_packet(&rescaled) {
            Ok(()) => Ok(()),
            Err(e) => {
                if !self.write_failed {
                    error!("Muxer write failed: {}", e);
                    self.write_failed = true;
                }
                Err(e)
            }
        }
    }
}

/// The replay ring behind the sink interface.
pub struct ReplaySink {
    ring: ReplayRing,
}

impl ReplaySink {
    pub fn new(ring: ReplayRing) -> Self {
        Self { ring }
    }

    fn submit(&mut self, packet: &EncodedPacket) {
        self.ring.push(packet);
    }
}

/// The sink shared across producer threads.
///
/// Everything that writes packets takes this mutex; see the concurrency
/// notes in the crate docs.
pub type SharedSink = Arc<Mutex<OutputSink>>;

/// Wrap a sink for sharing.
pub fn shared(sink: OutputSink) -> SharedSink {
    Arc::new(Mutex::new(sink))
}

/// Submit a batch of packets under one lock acquisition.
pub fn submit_all(sink: &SharedSink, packets: &[EncodedPacket]) -> io::Result<()> {
    if packets.is_empty() {
        return Ok(());
    }
    let mut guard = sink.lock();
    for packet in packets {
        if let Err(e) = guard.submit(packet) {
            // Replay pushes cannot fail; a direct write failure is fatal
            // for the session but we drain the batch first so packet
            // ordering stays intact for the error path.
            warn!("Dropping remainder of packet batch after write failure");
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::muxer::testing::MockFactory;
    use crate::muxer::ContainerFactory;
    use gpurec_encode::TimeBase;

    fn packet(pts: i64, keyframe: bool) -> EncodedPacket {
        EncodedPacket::new(0, pts, keyframe, vec![9u8; 4])
    }

    #[test]
    fn test_direct_sink_rescales() {
        let (factory, written) = MockFactory::new("mp4");
        let writer = factory.create(std::path::Path::new("ignored")).expect("writer");
        let mut sink = OutputSink::Direct(DirectSink::new(
            writer,
            TimeBase::per_frame(30),
            TimeBase { num: 1, den: 1000 },
            None,
        ));

        sink.submit(&packet(30, true)).expect("submit");
        sink.finish().expect("finish");

        let written = written.lock().expect("lock");
        assert_eq!(written.packets.len(), 1);
        // Frame 30 at 30fps = 1s = 1000ms ticks.
        assert_eq!(written.packets[0].pts, 1000);
        assert!(written.trailer);
    }

    #[test]
    fn test_replay_sink_accumulates() {
        let ring = ReplayRing::new(10, 2.0, TimeBase::per_frame(60), 0);
        let mut sink = OutputSink::Replay(ReplaySink::new(ring));

        for i in 0..10 {
            sink.submit(&packet(i, i == 0)).expect("submit");
        }
        assert_eq!(sink.replay_ring().expect("ring").len(), 10);
        assert!(sink.replay_snapshot().is_some());
    }

    #[test]
    fn test_direct_sink_has_no_ring() {
        let (factory, _written) = MockFactory::new("mp4");
        let writer = factory.create(std::path::Path::new("ignored")).expect("writer");
        let mut sink = OutputSink::Direct(DirectSink::new(
            writer,
            TimeBase::per_frame(30),
            TimeBase::per_frame(30),
            None,
        ));
        assert!(sink.replay_ring().is_none());
        assert!(sink.replay_snapshot().is_none());
    }

    #[test]
    fn test_submit_all_batches_under_one_lock() {
        let ring = ReplayRing::new(10, 2.0, TimeBase::per_frame(60), 0);
        let sink = shared(OutputSink::Replay(ReplaySink::new(ring)));
        let packets: Vec<_> = (0..5).map(|i| packet(i, i == 0)).collect();
        submit_all(&sink, &packets).expect("submit_all");
        assert_eq!(sink.lock().replay_ring().expect("ring").len(), 5);
    }
}
