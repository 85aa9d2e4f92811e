//! # gpurec
//!
//! GPU screen recording pipeline for Linux: zero-copy capture, in-GPU
//! color conversion, hardware encoding, and a rolling replay buffer.
//!
//! This crate is the top of the [gpurec](https://github.com/gpurec/gpurec)
//! workspace and owns the control plane - frame pacing, output sinks, the
//! replay ring, signals, session wiring - while the heavy lifting lives in
//! the member crates:
//!
//! - **[`gpurec_gl`]** - runtime-loaded GL/EGL/GLX, monitors, GPU vendor
//! - **[`gpurec_kms`]** - the privileged KMS plane broker
//! - **[`gpurec_capture`]** - KMS / XComposite / portal / NvFBC backends,
//!   damage and cursor tracking
//! - **[`gpurec_color`]** - RGB to NV12/P010 conversion shaders
//! - **[`gpurec_encode`]** - VAAPI / CUDA / software destination surfaces
//!
//! # Dataflow
//!
//! ```text
//! capture backend ──► EGL image ──► color engine ──► encoder adapter
//!        ▲                              (Y + UV)           │
//!        │                                                 ▼
//!   frame pacer ◄── damage tracker            encoder (external impl)
//!        │                                                 │
//!        └────────────► output sink ◄──────── packets ─────┘
//!                      (muxer / replay ring / TCP mirror)
//! ```
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use gpurec::{RecordingSession, RecordConfig, CaptureTarget, OutputTarget};
//!
//! let config = RecordConfig::builder()
//!     .target(CaptureTarget::Monitor("DP-1".into()))
//!     .fps(60)
//!     .output(OutputTarget::File("out.mp4".into()))
//!     .build();
//!
//! // `encoder` and `muxer` implement the narrow external contracts in
//! // `gpurec::muxer` / `gpurec_encode::Encoder` on top of an AV library.
//! let mut session = RecordingSession::new(config, encoder, muxer)?;
//! session.run()?;
//! ```
//!
//! # Signals
//!
//! - `SIGINT` / `SIGTERM`: stop; an in-flight replay save completes first
//! - `SIGUSR1`: save the replay buffer; the file path is printed to stdout
//! - `SIGUSR2`: toggle pause
//!
//! # Concurrency
//!
//! The dataplane is single-threaded around the pacer loop. The PipeWire
//! loop thread (portal capture), the replay-save task and any audio
//! producer threads synchronize only through the sink mutex and the
//! latched-state mutexes documented in the member crates. The GL context
//! is pinned to the pacer thread.

pub mod clock;
pub mod config;
pub mod error;
pub mod muxer;
pub mod pacer;
pub mod replay;
pub mod session;
pub mod signal_flags;
pub mod sink;
pub mod stream_server;

pub use clock::RecordingClock;
pub use config::{
    exit_codes, BitrateMode, CaptureTarget, EncoderChoice, FramerateMode, OutputTarget,
    RecordConfig, RecordConfigBuilder, REPLAY_SECONDS_MAX, REPLAY_SECONDS_MIN,
};
pub use error::{RecordError, Result};
pub use muxer::{ContainerFactory, ContainerWriter};
pub use pacer::{FramePacer, PacerConfig, TickDecision};
pub use replay::{ReplayRing, ReplaySaver, ReplaySnapshot};
pub use session::RecordingSession;
pub use sink::{DirectSink, OutputSink, ReplaySink, SharedSink};
pub use stream_server::{StreamServer, STREAM_PORT};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
