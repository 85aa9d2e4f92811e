//! Recording session orchestration.
//!
//! Wires the whole dataplane together in dependency order - GL runtime,
//! encoder adapter, capture backend, color engine, sinks - then runs the
//! pacer's main loop until a stop signal or a fatal error. Teardown is the
//! reverse: finish any in-flight replay save, flush the encoder, write the
//! trailer, drop GL last.

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use gpurec_capture::{
    Backend, CaptureBackend, CaptureError, CaptureStatus, DamageTracker, KmsCapture,
    KmsCaptureParams, NvFbcCapture, NvFbcParams, PortalCapture, PortalParams, StopReason,
    XCompositeCapture, XCompositeParams,
};
use gpurec_color::{ColorConversion, ColorConversionParams};
use gpurec_encode::{
    CodecContext, CudaEncoder, Encoder, EncoderAdapter, EncodeFrame, SoftwareEncoder, TimeBase,
    VaapiEncoder, VideoCodec, VideoEncoderAdapter,
};
use gpurec_gl::{DisplayServer, GlRuntime, GpuVendor, RuntimeOptions};
use tracing::{debug, info, warn};

use crate::clock::{monotonic_seconds, RecordingClock};
use crate::config::{
    CaptureTarget, EncoderChoice, FramerateMode, OutputTarget, RecordConfig,
};
use crate::error::{RecordError, Result};
use crate::muxer::ContainerFactory;
use crate::pacer::{FramePacer, PacerConfig, TickDecision};
use crate::replay::{ReplayRing, ReplaySaver};
use crate::signal_flags;
use crate::sink::{shared, submit_all, DirectSink, OutputSink, ReplaySink, SharedSink};
use crate::stream_server::StreamServer;

/// A fully wired recording session.
///
/// Field order is teardown order: the GL runtime must drop last because
/// every GPU-side object above it still references loaded driver state.
pub struct RecordingSession {
    config: RecordConfig,
    pacer: FramePacer,
    clock: RecordingClock,

    ctx: CodecContext,
    frame: EncodeFrame,
    encoder: Box<dyn Encoder>,
    sink: SharedSink,
    saver: Option<ReplaySaver>,
    muxer_factory: Arc<dyn ContainerFactory>,
    stream_server: Option<Arc<StreamServer>>,

    damage: Option<DamageTracker>,
    backend: Backend,
    color: ColorConversion,
    adapter: EncoderAdapter,

    hdr_attached: bool,
    capture_error_logged: bool,

    runtime: Rc<GlRuntime>,
}

impl RecordingSession {
    /// Build the full pipeline. The encoder and muxer implementations are
    /// supplied by the embedder; everything else is wired here.
    pub fn new(
        config: RecordConfig,
        mut encoder: Box<dyn Encoder>,
        muxer_factory: Arc<dyn ContainerFactory>,
    ) -> Result<Self> {
        config.validate().map_err(RecordError::Config)?;
        signal_flags::install();

        let is_monitor_capture = matches!(
            config.target,
            CaptureTarget::Monitor(_) | CaptureTarget::Screen
        );
        let runtime = Rc::new(GlRuntime::load(&RuntimeOptions {
            display_name: None,
            is_monitor_capture,
        })?);

        let mut adapter = Self::select_adapter(&config, &runtime)?;
        let codec = Self::negotiate_codec(&config, &mut adapter)?;

        let mut ctx = CodecContext {
            codec,
            width: 0,
            height: 0,
            framerate: config.fps,
            color_range: config.color_range,
            time_base: match config.framerate_mode {
                FramerateMode::Constant => TimeBase::per_frame(config.fps),
                FramerateMode::Variable | FramerateMode::Content => TimeBase::MICROSECONDS,
            },
        };

        let mut backend = Self::select_backend(&config, &runtime, codec)?;
        backend.start(&mut ctx).map_err(Self::map_start_error)?;
        debug!("Capture dimensions: {}x{}", ctx.width, ctx.height);

        let mut frame = adapter.start(&mut ctx)?;

        // The AMD direct blit needs the adapter's VA display, which exists
        // only after adapter start.
        if let (Backend::Kms(kms), EncoderAdapter::Vaapi(vaapi)) = (&mut backend, &adapter) {
            kms.set_fast_path(vaapi.fast_path());
        }

        let (textures, destination_color) = adapter.textures();
        let color = ColorConversion::new(
            Rc::clone(&runtime),
            ColorConversionParams {
                source_color: backend.source_color(),
                destination_color,
                color_range: config.color_range,
                destination_textures: textures,
                load_external_image_shader: backend.uses_external_image(),
            },
        )
        .map_err(CaptureError::Color)?;

        encoder.configure(&ctx, &mut frame)?;

        let stream_server = config.streaming.then(|| Arc::new(StreamServer::new()));
        let sink = Self::build_sink(&config, &ctx, &muxer_factory, stream_server.clone())?;

        let damage = Self::build_damage_tracker(&config, &runtime, &backend);

        let clock = RecordingClock::new();
        let pacer = FramePacer::new(
            PacerConfig {
                fps: config.fps,
                mode: config.framerate_mode,
            },
            clock.video_time(monotonic_seconds()),
        );

        info!(
            "Session ready: {:?} {}x{} @ {} fps, {:?}",
            codec, ctx.width, ctx.height, config.fps, config.framerate_mode
        );
        Ok(Self {
            config,
            pacer,
            clock,
            ctx,
            frame,
            encoder,
            sink,
            saver: None,
            muxer_factory,
            stream_server,
            damage,
            backend,
            color,
            adapter,
            hdr_attached: false,
            capture_error_logged: false,
            runtime,
        })
    }

    fn select_adapter(config: &RecordConfig, runtime: &Rc<GlRuntime>) -> Result<EncoderAdapter> {
        Ok(match config.encoder {
            EncoderChoice::Cpu => {
                EncoderAdapter::Software(SoftwareEncoder::new(Rc::clone(runtime)))
            }
            EncoderChoice::Gpu => match runtime.gpu_info().vendor {
                GpuVendor::Nvidia => EncoderAdapter::Cuda(CudaEncoder::new(Rc::clone(runtime))),
                GpuVendor::Amd | GpuVendor::Intel => {
                    let card = gpurec_kms::default_card_path().ok_or(RecordError::NoDrmCard)?;
                    EncoderAdapter::Vaapi(VaapiEncoder::new(Rc::clone(runtime), card))
                }
            },
        })
    }

    /// Walk the one-step capability fallbacks until a supported codec is
    /// found; the second miss in a row is fatal.
    fn negotiate_codec(config: &RecordConfig, adapter: &mut EncoderAdapter) -> Result<VideoCodec> {
        let caps = adapter.supported_codecs(true);
        let mut codec = config.codec;
        while !caps.supports(codec) {
            match codec.fallback() {
                Some(fallback) => {
                    warn!(
                        "{:?} is not supported by this GPU, falling back to {:?}",
                        codec, fallback
                    );
                    codec = fallback;
                }
                None => {
                    return Err(RecordError::UnsupportedCodec(format!(
                        "{:?} (and no fallback remains)",
                        config.codec
                    )))
                }
            }
        }
        Ok(codec)
    }

    fn select_backend(
        config: &RecordConfig,
        runtime: &Rc<GlRuntime>,
        codec: VideoCodec,
    ) -> Result<Backend> {
        let backend = match &config.target {
            CaptureTarget::Monitor(name) => {
                Self::monitor_backend(config, runtime, codec, name.clone())?
            }
            CaptureTarget::Screen => Self::monitor_backend(config, runtime, codec, "screen".into())?,
            CaptureTarget::Window(id) => {
                if runtime.display_server() != DisplayServer::X11 {
                    return Err(RecordError::Config(vec![
                        "window capture needs X11; use the portal on Wayland".into(),
                    ]));
                }
                Backend::XComposite(XCompositeCapture::new(
                    Rc::clone(runtime),
                    XCompositeParams {
                        window: *id,
                        follow_focused: false,
                        record_cursor: config.record_cursor,
                    },
                ))
            }
            CaptureTarget::Focused => {
                if runtime.display_server() != DisplayServer::X11 {
                    return Err(RecordError::Config(vec![
                        "focused-window capture needs X11; use the portal on Wayland".into(),
                    ]));
                }
                Backend::XComposite(XCompositeCapture::new(
                    Rc::clone(runtime),
                    XCompositeParams {
                        window: 0,
                        follow_focused: true,
                        record_cursor: config.record_cursor,
                    },
                ))
            }
            CaptureTarget::Portal => Backend::Portal(PortalCapture::new(
                Rc::clone(runtime),
                PortalParams {
                    record_cursor: config.record_cursor,
                    restore_session: config.restore_portal_session,
                    restore_token_path: None,
                },
            )),
        };
        Ok(backend)
    }

    fn monitor_backend(
        config: &RecordConfig,
        runtime: &Rc<GlRuntime>,
        codec: VideoCodec,
        monitor: String,
    ) -> Result<Backend> {
        // NVIDIA on X11 goes through NvFBC (the runtime is already on a
        // GLX context in that case); everything else reads KMS planes.
        if runtime.gpu_info().vendor == GpuVendor::Nvidia
            && runtime.display_server() == DisplayServer::X11
        {
            return Ok(Backend::NvFbc(NvFbcCapture::new(
                Rc::clone(runtime),
                NvFbcParams {
                    display_to_capture: monitor,
                    record_cursor: config.record_cursor,
                    direct_capture: false,
                },
            )));
        }
        Ok(Backend::Kms(KmsCapture::new(
            Rc::clone(runtime),
            KmsCaptureParams {
                monitor,
                record_cursor: config.record_cursor,
                hdr: codec.is_hdr(),
            },
            None,
        )))
    }

    fn build_sink(
        config: &RecordConfig,
        ctx: &CodecContext,
        muxer_factory: &Arc<dyn ContainerFactory>,
        stream_server: Option<Arc<StreamServer>>,
    ) -> Result<SharedSink> {
        let sink = match config.replay_seconds {
            Some(replay_seconds) => OutputSink::Replay(ReplaySink::new(ReplayRing::new(
                replay_seconds,
                config.keyint_seconds,
                ctx.time_base,
                0,
            ))),
            None => {
                let path: PathBuf = match &config.output {
                    OutputTarget::File(path) => path.clone(),
                    OutputTarget::Stdout => PathBuf::from("/dev/stdout"),
                    OutputTarget::Url(url) => PathBuf::from(url),
                };
                let mut writer = muxer_factory.create(&path)?;
                writer.add_video_stream(ctx, ctx.time_base);
                writer.write_header()?;
                OutputSink::Direct(DirectSink::new(
                    writer,
                    ctx.time_base,
                    ctx.time_base,
                    stream_server,
                ))
            }
        };
        Ok(shared(sink))
    }

    fn build_damage_tracker(
        config: &RecordConfig,
        runtime: &Rc<GlRuntime>,
        backend: &Backend,
    ) -> Option<DamageTracker> {
        if runtime.display_server() != DisplayServer::X11 {
            return None;
        }
        let mut tracker = match DamageTracker::new(Rc::clone(runtime), config.record_cursor) {
            Ok(tracker) => tracker,
            Err(e) => {
                warn!("Damage tracking unavailable: {} (capturing at full rate)", e);
                return None;
            }
        };
        match &config.target {
            CaptureTarget::Monitor(name) => tracker.set_target_monitor(name),
            CaptureTarget::Screen => {
                if let Some(first) = runtime.monitors().first() {
                    let name = first.name.clone();
                    tracker.set_target_monitor(&name);
                }
            }
            CaptureTarget::Window(_) | CaptureTarget::Focused => {
                let window = backend.window_id();
                if window != 0 {
                    tracker.set_target_window(window);
                }
            }
            CaptureTarget::Portal => {}
        }
        Some(tracker)
    }

    fn map_start_error(error: CaptureError) -> RecordError {
        match &error {
            CaptureError::Fatal(message) if message.contains("no DRM card") => {
                RecordError::NoDrmCard
            }
            _ => RecordError::Capture(error),
        }
    }

    /// Run the main loop until a stop signal, an orderly backend stop, or
    /// a fatal error.
    pub fn run(&mut self) -> Result<()> {
        let is_monitor_capture = matches!(
            self.config.target,
            CaptureTarget::Monitor(_) | CaptureTarget::Screen
        );
        // The loop ticks faster than the frame rate so damage and signals
        // are observed promptly.
        let tick_sleep =
            std::time::Duration::from_secs_f64((self.pacer.period() / 4.0).clamp(0.001, 0.05));

        let mut fps_window_start = monotonic_seconds();
        let mut capture_counter = 0u32;
        let mut damage_counter = 0u32;

        let result = loop {
            if !signal_flags::running() {
                break Ok(());
            }

            while let Some(event) = self.runtime.process_event() {
                if let Some(damage) = &mut self.damage {
                    damage.on_event(&event);
                }
                self.backend.on_event(&event);
            }
            if let Some(damage) = &mut self.damage {
                damage.tick();
            }
            self.backend.tick();

            // Window captures can re-target (follow focused); keep the
            // damage tracker pointed at the live window.
            if !is_monitor_capture {
                let window = self.backend.window_id();
                if window != 0 {
                    if let Some(damage) = &mut self.damage {
                        damage.set_target_window(window);
                    }
                }
            }

            match self.backend.should_stop() {
                StopReason::Continue => {}
                StopReason::Stop => break Ok(()),
                StopReason::StopWithError => {
                    break Err(RecordError::Capture(CaptureError::Fatal(
                        "capture source failed".into(),
                    )))
                }
            }

            let damaged = if self.config.framerate_mode != FramerateMode::Content {
                true
            } else if let Some(damage) = &self.damage {
                damage.is_damaged()
            } else if let Some(backend_damage) = self.backend.is_damaged() {
                backend_damage
            } else {
                true
            };
            if damaged {
                damage_counter += 1;
            }

            if signal_flags::take_toggle_pause() {
                let paused = self.clock.toggle_pause(monotonic_seconds());
                eprintln!("{}", if paused { "Paused" } else { "Unpaused" });
            }

            let now = monotonic_seconds();
            let decision =
                self.pacer
                    .tick(now, self.clock.video_time(now), damaged, self.clock.is_paused());

            if let TickDecision::Capture { pts } = decision {
                if let Some(damage) = &mut self.damage {
                    damage.clear();
                }
                self.backend.clear_damage();

                if let Err(e) = self.capture_and_encode(&pts) {
                    break Err(e);
                }
                capture_counter += 1;
            }

            self.poll_replay_save()?;

            if self.config.verbose && now - fps_window_start >= 1.0 {
                debug!(
                    "capture fps: {}, damage fps: {}",
                    capture_counter, damage_counter
                );
                fps_window_start = now;
                capture_counter = 0;
                damage_counter = 0;
            }

            std::thread::sleep(tick_sleep);
        };

        self.teardown(result)
    }

    fn capture_and_encode(&mut self, pts_list: &[i64]) -> Result<()> {
        match self.backend.capture(&mut self.frame, &self.color) {
            Ok(CaptureStatus::Captured) => {}
            Ok(CaptureStatus::Skipped) => return Ok(()),
            Err(e) if e.is_transient() => {
                if !self.capture_error_logged {
                    warn!("Transient capture failure: {}", e);
                    self.capture_error_logged = true;
                }
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        self.capture_error_logged = false;

        self.runtime.swap_buffers();
        self.adapter.copy_textures_to_frame(&mut self.frame)?;

        // HDR metadata attaches once, before the first packet, and only in
        // direct mode; replay attaches it at save time.
        if self.ctx.codec.is_hdr() && !self.hdr_attached && self.config.replay_seconds.is_none() {
            if let Some(metadata) = self.backend.hdr_metadata() {
                self.sink.lock().set_hdr_metadata(&metadata);
                self.hdr_attached = true;
            }
        }

        let mut packets = Vec::new();
        for &pts in pts_list {
            self.encoder.submit(&self.frame, pts)?;
            packets.extend(self.encoder.receive());
        }
        submit_all(&self.sink, &packets)?;
        Ok(())
    }

    fn poll_replay_save(&mut self) -> Result<()> {
        if self.saver.as_ref().is_some_and(ReplaySaver::is_finished) {
            if let Some(saver) = self.saver.take() {
                match saver.join() {
                    Ok(path) => {
                        // The output path on stdout is the scripting
                        // surface; everything else goes to stderr.
                        println!("{}", path.display());
                        use std::io::Write;
                        let _ = std::io::stdout().flush();
                    }
                    Err(e) => warn!("Replay save failed: {}", e),
                }
            }
        }

        if signal_flags::take_save_replay() && self.saver.is_none() {
            let snapshot = self.sink.lock().replay_snapshot();
            if let Some(snapshot) = snapshot {
                let output_dir = match &self.config.output {
                    OutputTarget::File(path) => path.clone(),
                    _ => std::env::temp_dir(),
                };
                self.saver = Some(ReplaySaver::spawn(
                    Arc::clone(&self.muxer_factory),
                    snapshot,
                    self.ctx.clone(),
                    output_dir,
                    self.config.date_folders,
                ));
            }
        }
        Ok(())
    }

    fn teardown(&mut self, result: Result<()>) -> Result<()> {
        info!("Tearing down recording session");

        // Never leave a partial replay file behind: the in-flight save
        // completes before exit.
        if let Some(saver) = self.saver.take() {
            match saver.join() {
                Ok(path) => {
                    println!("{}", path.display());
                    use std::io::Write;
                    let _ = std::io::stdout().flush();
                }
                Err(e) => warn!("Replay save failed during teardown: {}", e),
            }
        }

        let tail_packets = self.encoder.flush();
        if let Err(e) = submit_all(&self.sink, &tail_packets) {
            warn!("Failed to flush encoder tail: {}", e);
        }
        if let Err(e) = self.sink.lock().finish() {
            warn!("Failed to finalize container: {}", e);
        }
        if let Some(server) = &self.stream_server {
            server.shutdown();
        }
        // Backend, color engine, adapter and finally the GL runtime drop
        // in field order when the session does.
        result
    }

    /// The negotiated codec context (dimensions after alignment).
    pub fn codec_context(&self) -> &CodecContext {
        &self.ctx
    }
}
