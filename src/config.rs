//! Recording configuration.
//!
//! The CLI (or any other embedder) fills a [`RecordConfig`]; validation
//! happens here so every front end rejects the same nonsense the same way.

use std::path::PathBuf;

use gpurec_color::ColorRange;
use gpurec_encode::VideoCodec;

/// Process exit codes, part of the scripting surface.
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const UNSUPPORTED_CONFIG: i32 = 2;
    pub const CAPTURE_FAILED: i32 = 3;
    pub const GL_INIT_FAILED: i32 = 22;
    pub const NO_DRM_CARD: i32 = 23;
}

/// Replay buffer length bounds in seconds.
pub const REPLAY_SECONDS_MIN: u32 = 5;
pub const REPLAY_SECONDS_MAX: u32 = 1200;

/// What to capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureTarget {
    /// A monitor by connector name ("DP-1").
    Monitor(String),
    /// The first monitor / whole screen.
    Screen,
    /// A specific X11 window.
    Window(u64),
    /// Whatever window has focus, following focus changes.
    Focused,
    /// XDG desktop portal selection (Wayland).
    Portal,
}

impl CaptureTarget {
    /// Parse the `-w` argument form.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "portal" => Some(Self::Portal),
            "focused" => Some(Self::Focused),
            "screen" => Some(Self::Screen),
            other => {
                if let Some(hex) = other.strip_prefix("0x") {
                    u64::from_str_radix(hex, 16).ok().map(Self::Window)
                } else if other.chars().all(|c| c.is_ascii_digit()) && !other.is_empty() {
                    other.parse().ok().map(Self::Window)
                } else if other.is_empty() {
                    None
                } else {
                    Some(Self::Monitor(other.to_string()))
                }
            }
        }
    }
}

/// Frame pacing discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramerateMode {
    /// Constant: duplicate frames to hold the target rate.
    Constant,
    /// Variable: one packet per captured frame, wall-clock pts.
    #[default]
    Variable,
    /// Like variable but only when the damage tracker saw a change.
    Content,
}

/// Bitrate control handed to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitrateMode {
    #[default]
    Auto,
    Qp,
    Vbr,
}

/// Which encoder family to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncoderChoice {
    /// Hardware (VAAPI or NVENC depending on the GPU).
    #[default]
    Gpu,
    /// Software fallback.
    Cpu,
}

/// Where packets go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// A container file (or the replay output directory in replay mode).
    File(PathBuf),
    /// `/dev/stdout`; the muxer must not assume seekability.
    Stdout,
    /// A network URL the muxer understands.
    Url(String),
}

/// Complete recording configuration.
#[derive(Debug, Clone)]
pub struct RecordConfig {
    pub target: CaptureTarget,
    pub fps: u32,
    pub codec: VideoCodec,
    pub framerate_mode: FramerateMode,
    pub bitrate_mode: BitrateMode,
    pub color_range: ColorRange,

    /// Keyframe interval in seconds.
    pub keyint_seconds: f64,

    /// Rolling replay buffer length; `None` records directly.
    pub replay_seconds: Option<u32>,

    pub encoder: EncoderChoice,
    pub record_cursor: bool,
    pub output: OutputTarget,

    /// Container extension for generated filenames ("mp4", "mkv").
    pub container: String,

    /// Nest replay files under `YYYY-MM-DD/`.
    pub date_folders: bool,

    /// Re-use the portal session from last time.
    pub restore_portal_session: bool,

    /// Per-second capture/damage FPS logging.
    pub verbose: bool,

    /// Also mirror packets to the TCP side channel.
    pub streaming: bool,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            target: CaptureTarget::Screen,
            fps: 60,
            codec: VideoCodec::H264,
            framerate_mode: FramerateMode::default(),
            bitrate_mode: BitrateMode::default(),
            color_range: ColorRange::default(),
            keyint_seconds: 2.0,
            replay_seconds: None,
            encoder: EncoderChoice::default(),
            record_cursor: true,
            output: OutputTarget::File(PathBuf::from("video.mp4")),
            container: "mp4".to_string(),
            date_folders: false,
            restore_portal_session: false,
            verbose: false,
            streaming: false,
        }
    }
}

impl RecordConfig {
    #[must_use]
    pub fn builder() -> RecordConfigBuilder {
        RecordConfigBuilder::default()
    }

    /// Validate; returns the list of problems when invalid.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.fps == 0 || self.fps > 500 {
            issues.push(format!("fps must be within 1-500, got {}", self.fps));
        }
        if self.keyint_seconds <= 0.0 {
            issues.push("keyint must be positive".to_string());
        }
        if let Some(replay) = self.replay_seconds {
            if !(REPLAY_SECONDS_MIN..=REPLAY_SECONDS_MAX).contains(&replay) {
                issues.push(format!(
                    "replay buffer must be within {REPLAY_SECONDS_MIN}-{REPLAY_SECONDS_MAX} seconds, got {replay}"
                ));
            }
            if !matches!(self.output, OutputTarget::File(_)) {
                issues.push("replay mode needs an output directory".to_string());
            }
        }
        if self.container.is_empty() {
            issues.push("container extension cannot be empty".to_string());
        }
        if self.codec.is_hdr() && matches!(self.target, CaptureTarget::Window(_) | CaptureTarget::Focused) {
            issues.push("HDR capture only works for monitor capture".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

/// Builder for [`RecordConfig`].
#[derive(Debug, Clone, Default)]
pub struct RecordConfigBuilder {
    target: Option<CaptureTarget>,
    fps: Option<u32>,
    codec: Option<VideoCodec>,
    framerate_mode: Option<FramerateMode>,
    bitrate_mode: Option<BitrateMode>,
    color_range: Option<ColorRange>,
    keyint_seconds: Option<f64>,
    replay_seconds: Option<u32>,
    encoder: Option<EncoderChoice>,
    record_cursor: Option<bool>,
    output: Option<OutputTarget>,
    container: Option<String>,
    date_folders: Option<bool>,
    restore_portal_session: Option<bool>,
    verbose: Option<bool>,
    streaming: Option<bool>,
}

impl RecordConfigBuilder {
    #[must_use]
    pub fn target(mut self, target: CaptureTarget) -> Self {
        self.target = Some(target);
        self
    }

    #[must_use]
    pub fn fps(mut self, fps: u32) -> Self {
        self.fps = Some(fps);
        self
    }

    #[must_use]
    pub fn codec(mut self, codec: VideoCodec) -> Self {
        self.codec = Some(codec);
        self
    }

    #[must_use]
    pub fn framerate_mode(mut self, mode: FramerateMode) -> Self {
        self.framerate_mode = Some(mode);
        self
    }

    #[must_use]
    pub fn bitrate_mode(mut self, mode: BitrateMode) -> Self {
        self.bitrate_mode = Some(mode);
        self
    }

    #[must_use]
    pub fn color_range(mut self, range: ColorRange) -> Self {
        self.color_range = Some(range);
        self
    }

    #[must_use]
    pub fn keyint_seconds(mut self, keyint: f64) -> Self {
        self.keyint_seconds = Some(keyint);
        self
    }

    #[must_use]
    pub fn replay_seconds(mut self, seconds: u32) -> Self {
        self.replay_seconds = Some(seconds);
        self
    }

    #[must_use]
    pub fn encoder(mut self, encoder: EncoderChoice) -> Self {
        self.encoder = Some(encoder);
        self
    }

    #[must_use]
    pub fn record_cursor(mut self, cursor: bool) -> Self {
        self.record_cursor = Some(cursor);
        self
    }

    #[must_use]
    pub fn output(mut self, output: OutputTarget) -> Self {
        self.output = Some(output);
        self
    }

    #[must_use]
    pub fn container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    #[must_use]
    pub fn date_folders(mut self, enable: bool) -> Self {
        self.date_folders = Some(enable);
        self
    }

    #[must_use]
    pub fn restore_portal_session(mut self, enable: bool) -> Self {
        self.restore_portal_session = Some(enable);
        self
    }

    #[must_use]
    pub fn verbose(mut self, enable: bool) -> Self {
        self.verbose = Some(enable);
        self
    }

    #[must_use]
    pub fn streaming(mut self, enable: bool) -> Self {
        self.streaming = Some(enable);
        self
    }

    #[must_use]
    pub fn build(self) -> RecordConfig {
        let defaults = RecordConfig::default();
        RecordConfig {
            target: self.target.unwrap_or(defaults.target),
            fps: self.fps.unwrap_or(defaults.fps),
            codec: self.codec.unwrap_or(defaults.codec),
            framerate_mode: self.framerate_mode.unwrap_or(defaults.framerate_mode),
            bitrate_mode: self.bitrate_mode.unwrap_or(defaults.bitrate_mode),
            color_range: self.color_range.unwrap_or(defaults.color_range),
            keyint_seconds: self.keyint_seconds.unwrap_or(defaults.keyint_seconds),
            replay_seconds: self.replay_seconds.or(defaults.replay_seconds),
            encoder: self.encoder.unwrap_or(defaults.encoder),
            record_cursor: self.record_cursor.unwrap_or(defaults.record_cursor),
            output: self.output.unwrap_or(defaults.output),
            container: self.container.unwrap_or(defaults.container),
            date_folders: self.date_folders.unwrap_or(defaults.date_folders),
            restore_portal_session: self
                .restore_portal_session
                .unwrap_or(defaults.restore_portal_session),
            verbose: self.verbose.unwrap_or(defaults.verbose),
            streaming: self.streaming.unwrap_or(defaults.streaming),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_parsing() {
        assert_eq!(CaptureTarget::parse("portal"), Some(CaptureTarget::Portal));
        assert_eq!(CaptureTarget::parse("focused"), Some(CaptureTarget::Focused));
        assert_eq!(CaptureTarget::parse("screen"), Some(CaptureTarget::Screen));
        assert_eq!(
            CaptureTarget::parse("0x1600002"),
            Some(CaptureTarget::Window(0x160_0002))
        );
        assert_eq!(
            CaptureTarget::parse("23068674"),
            Some(CaptureTarget::Window(23_068_674))
        );
        assert_eq!(
            CaptureTarget::parse("DP-1"),
            Some(CaptureTarget::Monitor("DP-1".to_string()))
        );
        assert_eq!(CaptureTarget::parse(""), None);
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(RecordConfig::default().validate().is_ok());
    }

    #[test]
    fn test_replay_bounds() {
        let ok = RecordConfig::builder().replay_seconds(5).build();
        assert!(ok.validate().is_ok());

        let ok = RecordConfig::builder().replay_seconds(1200).build();
        assert!(ok.validate().is_ok());

        let too_short = RecordConfig::builder().replay_seconds(4).build();
        assert!(too_short.validate().is_err());

        let too_long = RecordConfig::builder().replay_seconds(1201).build();
        assert!(too_long.validate().is_err());
    }

    #[test]
    fn test_bad_fps_rejected() {
        let config = RecordConfig::builder().fps(0).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hdr_window_capture_rejected() {
        let config = RecordConfig::builder()
            .codec(VideoCodec::HevcHdr)
            .target(CaptureTarget::Window(0x123))
            .build();
        let issues = config.validate().expect_err("should be invalid");
        assert!(issues.iter().any(|issue| issue.contains("HDR")));
    }

    #[test]
    fn test_builder_overrides() {
        let config = RecordConfig::builder()
            .fps(30)
            .codec(VideoCodec::Hevc)
            .framerate_mode(FramerateMode::Content)
            .replay_seconds(30)
            .container("mkv")
            .build();
        assert_eq!(config.fps, 30);
        assert_eq!(config.codec, VideoCodec::Hevc);
        assert_eq!(config.framerate_mode, FramerateMode::Content);
        assert_eq!(config.replay_seconds, Some(30));
        assert_eq!(config.container, "mkv");
    }
}
