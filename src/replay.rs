//! The rolling replay buffer and its save task.
//!
//! Packets are deep-copied into a bounded deque (the encoder may reuse its
//! buffers) and evicted once the buffered span exceeds the configured
//! replay length plus one keyframe interval. Whenever eviction happens a
//! "frames erased" flag latches so the save task knows the buffer no
//! longer starts at pts 0 and timestamps must be rebased.
//!
//! Saving snapshots the ring under the sink mutex and runs on its own
//! thread; the live ring keeps growing while the file is written.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::Local;
use gpurec_encode::{CodecContext, EncodedPacket, TimeBase};
use tracing::{debug, info};

use crate::muxer::ContainerFactory;

/// Bounded keyframe-aligned packet FIFO.
pub struct ReplayRing {
    packets: VecDeque<EncodedPacket>,
    frames_erased: bool,

    /// Seconds of video to retain: replay length + keyint headroom.
    span_budget: f64,
    time_base: TimeBase,
    video_stream_index: usize,
}

impl ReplayRing {
    pub fn new(
        replay_seconds: u32,
        keyint_seconds: f64,
        time_base: TimeBase,
        video_stream_index: usize,
    ) -> Self {
        Self {
            packets: VecDeque::new(),
            frames_erased: false,
            span_budget: f64::from(replay_seconds) + keyint_seconds,
            time_base,
            video_stream_index,
        }
    }

    /// Deep-copy `packet` into the ring and evict what fell out of the
    /// window.
    pub fn push(&mut self, packet: &EncodedPacket) {
        self.packets.push_back(packet.deep_copy());

        while self.span_seconds() > self.span_budget {
            self.packets.pop_front();
            self.frames_erased = true;
        }

        // Keep the head keyframe-aligned: a non-keyframe at the front of
        // the video stream is undecodable and only wastes memory.
        while let Some(front) = self.packets.front() {
            if front.stream_index == self.video_stream_index && !front.keyframe {
                self.packets.pop_front();
                self.frames_erased = true;
            } else {
                break;
            }
        }
    }

    /// Buffered span in seconds, measured on the video stream's pts.
    pub fn span_seconds(&self) -> f64 {
        let mut video = self
            .packets
            .iter()
            .filter(|p| p.stream_index == self.video_stream_index);
        let Some(first) = video.next() else { return 0.0 };
        let last = video.last().unwrap_or(first);
        let ticks = (last.pts - first.pts).max(0);
        ticks as f64 * self.time_base.num as f64 / self.time_base.den as f64
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn frames_erased(&self) -> bool {
        self.frames_erased
    }

    /// Copy the ring state out for a save task.
    pub fn snapshot(&self) -> ReplaySnapshot {
        ReplaySnapshot {
            packets: self.packets.iter().cloned().collect(),
            frames_erased: self.frames_erased,
            video_stream_index: self.video_stream_index,
            time_base: self.time_base,
        }
    }
}

/// A frozen copy of the ring taken under the sink mutex.
#[derive(Clone)]
pub struct ReplaySnapshot {
    pub packets: Vec<EncodedPacket>,
    pub frames_erased: bool,
    pub video_stream_index: usize,
    pub time_base: TimeBase,
}

/// Compose the replay output path:
/// `<dir>[/YYYY-MM-DD]/Replay_YYYY-MM-DD_HH-MM-SS.<ext>`.
fn replay_output_path(output_dir: &Path, extension: &str, date_folders: bool) -> PathBuf {
    let now = Local::now();
    if date_folders {
        output_dir
            .join(now.format("%Y-%m-%d").to_string())
            .join(format!("Replay_{}.{extension}", now.format("%H-%M-%S")))
    } else {
        output_dir.join(format!(
            "Replay_{}.{extension}",
            now.format("%Y-%m-%d_%H-%M-%S")
        ))
    }
}

/// Write a snapshot out as a complete container.
///
/// The stream starts at the first retained video keyframe; when frames
/// were erased all timestamps are rebased to it so the file starts near
/// zero.
pub fn save_replay_blocking(
    factory: &dyn ContainerFactory,
    snapshot: &ReplaySnapshot,
    ctx: &CodecContext,
    output_dir: &Path,
    date_folders: bool,
) -> io::Result<PathBuf> {
    let start_index = snapshot
        .packets
        .iter()
        .position(|p| p.stream_index == snapshot.video_stream_index && p.keyframe)
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "replay buffer has no keyframe")
        })?;

    let (start_index, pts_offset) = if snapshot.frames_erased {
        (start_index, snapshot.packets[start_index].pts)
    } else {
        (0, 0)
    };

    let path = replay_output_path(output_dir, factory.extension(), date_folders);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = factory.create(&path)?;
    writer.add_video_stream(ctx, snapshot.time_base);
    writer.write_header()?;

    for packet in &snapshot.packets[start_index..] {
        let mut rebased = packet.clone();
        rebased.pts -= pts_offset;
        rebased.dts -= pts_offset;
        writer.write_packet(&rebased)?;
    }
    writer.write_trailer()?;

    info!(
        "Replay saved: {} ({} packets)",
        path.display(),
        snapshot.packets.len() - start_index
    );
    Ok(path)
}

/// A replay save running on its own thread.
pub struct ReplaySaver {
    handle: Option<JoinHandle<io::Result<PathBuf>>>,
}

impl ReplaySaver {
    pub fn spawn(
        factory: Arc<dyn ContainerFactory>,
        snapshot: ReplaySnapshot,
        ctx: CodecContext,
        output_dir: PathBuf,
        date_folders: bool,
    ) -> Self {
        debug!("Spawning replay save ({} packets)", snapshot.packets.len());
        let handle = std::thread::Builder::new()
            .name("gpurec-replay-save".into())
            .spawn(move || {
                save_replay_blocking(&*factory, &snapshot, &ctx, &output_dir, date_folders)
            })
            .ok();
        Self { handle }
    }

    /// Whether the save thread has finished.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.is_finished())
    }

    /// Join and return the written path.
    pub fn join(mut self) -> io::Result<PathBuf> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "replay save panicked"))?,
            None => Err(io::Error::new(io::ErrorKind::Other, "save never started")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::muxer::testing::MockFactory;
    use gpurec_color::ColorRange;
    use gpurec_encode::VideoCodec;

    fn packet(pts: i64, keyframe: bool) -> EncodedPacket {
        EncodedPacket::new(0, pts, keyframe, vec![0u8; 8])
    }

    fn test_ctx() -> CodecContext {
        CodecContext {
            codec: VideoCodec::H264,
            width: 1920,
            height: 1080,
            framerate: 60,
            color_range: ColorRange::Limited,
            time_base: TimeBase::per_frame(60),
        }
    }

    /// 10s ring at 60 fps with a 2s keyint: budget 12s.
    fn test_ring() -> ReplayRing {
        ReplayRing::new(10, 2.0, TimeBase::per_frame(60), 0)
    }

    #[test]
    fn test_span_stays_within_budget() {
        let mut ring = test_ring();
        // 20 seconds of 60fps video, keyframe every 120 frames.
        for i in 0..1200i64 {
            ring.push(&packet(i, i % 120 == 0));
        }
        let span = ring.span_seconds();
        assert!(span <= 12.0 + 0.1, "span {span} exceeds budget");
        assert!(span >= 8.0, "span {span} evicted too much");
        assert!(ring.frames_erased());
    }

    #[test]
    fn test_head_is_always_keyframe_after_eviction() {
        let mut ring = test_ring();
        for i in 0..1200i64 {
            ring.push(&packet(i, i % 120 == 0));
        }
        let snapshot = ring.snapshot();
        let first_video = snapshot.packets.first().expect("non-empty");
        assert!(first_video.keyframe);
    }

    #[test]
    fn test_no_eviction_below_budget() {
        let mut ring = test_ring();
        for i in 0..300i64 {
            ring.push(&packet(i, i % 120 == 0));
        }
        assert!(!ring.frames_erased());
        assert_eq!(ring.len(), 300);
    }

    #[test]
    fn test_save_rebases_to_first_keyframe() {
        let mut ring = test_ring();
        for i in 0..1200i64 {
            ring.push(&packet(i, i % 120 == 0));
        }
        let snapshot = ring.snapshot();
        assert!(snapshot.frames_erased);

        let (factory, written) = MockFactory::new("mp4");
        let dir = std::env::temp_dir().join("gpurec-replay-test");
        let path = save_replay_blocking(&factory, &snapshot, &test_ctx(), &dir, false)
            .expect("save");

        let name = path.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.starts_with("Replay_"));
        assert!(name.ends_with(".mp4"));

        let written = written.lock().expect("lock");
        assert!(written.header);
        assert!(written.trailer);
        let first = written.packets.first().expect("packets");
        assert!(first.keyframe);
        assert_eq!(first.pts, 0);
        // Strictly increasing pts after rebase.
        for pair in written.packets.windows(2) {
            assert!(pair[1].pts > pair[0].pts);
        }
    }

    #[test]
    fn test_save_without_erasure_starts_at_zero() {
        let mut ring = test_ring();
        for i in 0..120i64 {
            ring.push(&packet(i, i == 0));
        }
        let snapshot = ring.snapshot();
        assert!(!snapshot.frames_erased);

        let (factory, written) = MockFactory::new("mkv");
        let dir = std::env::temp_dir().join("gpurec-replay-test2");
        save_replay_blocking(&factory, &snapshot, &test_ctx(), &dir, false).expect("save");

        let written = written.lock().expect("lock");
        assert_eq!(written.packets.len(), 120);
        assert_eq!(written.packets[0].pts, 0);
    }

    #[test]
    fn test_save_fails_without_keyframe() {
        let snapshot = ReplaySnapshot {
            packets: vec![packet(0, false), packet(1, false)],
            frames_erased: true,
            video_stream_index: 0,
            time_base: TimeBase::per_frame(60),
        };
        let (factory, _written) = MockFactory::new("mp4");
        let dir = std::env::temp_dir();
        assert!(
            save_replay_blocking(&factory, &snapshot, &test_ctx(), &dir, false).is_err()
        );
    }

    #[test]
    fn test_date_folder_path_shape() {
        let path = replay_output_path(Path::new("/tmp/captures"), "mp4", true);
        let parent = path.parent().expect("parent");
        // /tmp/captures/YYYY-MM-DD/Replay_HH-MM-SS.mp4
        let folder = parent.file_name().and_then(|n| n.to_str()).expect("folder");
        assert_eq!(folder.len(), 10);
        assert_eq!(folder.matches('-').count(), 2);
    }

    #[test]
    fn test_saver_thread_roundtrip() {
        let mut ring = test_ring();
        for i in 0..60i64 {
            ring.push(&packet(i, i == 0));
        }
        let (factory, written) = MockFactory::new("mp4");
        let saver = ReplaySaver::spawn(
            Arc::new(factory),
            ring.snapshot(),
            test_ctx(),
            std::env::temp_dir().join("gpurec-replay-test3"),
            false,
        );
        let path = saver.join().expect("join");
        assert!(path.to_string_lossy().contains("Replay_"));
        assert_eq!(written.lock().expect("lock").packets.len(), 60);
    }
}
