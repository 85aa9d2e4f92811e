//! The container muxer contract.
//!
//! Muxing itself is delegated to an external AV library; the dataplane
//! only relies on this narrow surface. Writers must tolerate
//! non-seekable targets (pipes, network URLs) and take packets
//! non-interleaved in the order each stream produces them.

use std::io;
use std::path::Path;

use gpurec_encode::{CodecContext, EncodedPacket, TimeBase};

/// One open container being written.
pub trait ContainerWriter: Send {
    /// Register a video stream; returns its stream index.
    fn add_video_stream(&mut self, ctx: &CodecContext, time_base: TimeBase) -> usize;

    /// Write the container header. Called once, after all streams exist.
    fn write_header(&mut self) -> io::Result<()>;

    /// Write one packet whose timestamps are already in the stream time
    /// base. Non-interleaved by contract.
    fn write_packet(&mut self, packet: &EncodedPacket) -> io::Result<()>;

    /// Attach HDR10 mastering/light-level metadata to the video stream.
    /// Optional; containers without HDR support ignore it.
    fn set_hdr_metadata(&mut self, metadata: &gpurec_kms::HdrOutputMetadata) {
        let _ = metadata;
    }

    /// Finalize the container.
    fn write_trailer(&mut self) -> io::Result<()>;
}

/// Creates [`ContainerWriter`]s for a configured format.
pub trait ContainerFactory: Send + Sync {
    /// Open a writer for `path` (which may be `/dev/stdout`).
    fn create(&self, path: &Path) -> io::Result<Box<dyn ContainerWriter>>;

    /// The container's canonical file extension.
    fn extension(&self) -> &str;
}

/// Rescale a packet's timestamps from `from` into `to`.
pub fn rescale_packet(packet: &EncodedPacket, from: TimeBase, to: TimeBase) -> EncodedPacket {
    let mut rescaled = packet.clone();
    rescaled.pts = from.rescale(packet.pts, to);
    rescaled.dts = from.rescale(packet.dts, to);
    rescaled
}

#[cfg(test)]
pub(crate) mod testing {
    //! A muxer that records what was written, for pipeline tests.

    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    pub(crate) struct Written {
        pub header: bool,
        pub trailer: bool,
        pub packets: Vec<EncodedPacket>,
    }

    pub(crate) struct MockWriter {
        pub written: Arc<Mutex<Written>>,
    }

    impl ContainerWriter for MockWriter {
        fn add_video_stream(&mut self, _ctx: &CodecContext, _time_base: TimeBase) -> usize {
            0
        }

        fn write_header(&mut self) -> io::Result<()> {
            self.written.lock().expect("lock").header = true;
            Ok(())
        }

        fn write_packet(&mut self, packet: &EncodedPacket) -> io::Result<()> {
            self.written.lock().expect("lock").packets.push(packet.clone());
            Ok(())
        }

        fn write_trailer(&mut self) -> io::Result<()> {
            self.written.lock().expect("lock").trailer = true;
            Ok(())
        }
    }

    pub(crate) struct MockFactory {
        pub written: Arc<Mutex<Written>>,
        pub extension: &'static str,
    }

    impl MockFactory {
        pub(crate) fn new(extension: &'static str) -> (Self, Arc<Mutex<Written>>) {
            let written = Arc::new(Mutex::new(Written::default()));
            (
                Self {
                    written: Arc::clone(&written),
                    extension,
                },
                written,
            )
        }
    }

    impl ContainerFactory for MockFactory {
        fn create(&self, _path: &Path) -> io::Result<Box<dyn ContainerWriter>> {
            Ok(Box::new(MockWriter {
                written: Arc::clone(&self.written),
            }))
        }

        fn extension(&self) -> &str {
            self.extension
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rescale_packet() {
        let packet = EncodedPacket::new(0, 60, true, vec![1]);
        // 60 fps frame index 60 -> 1 second -> 1000 in millisecond base.
        let rescaled = rescale_packet(
            &packet,
            TimeBase::per_frame(60),
            TimeBase { num: 1, den: 1000 },
        );
        assert_eq!(rescaled.pts, 1000);
        assert_eq!(rescaled.dts, 1000);
        // Payload is shared, not copied.
        assert_eq!(rescaled.data.len(), 1);
    }
}
