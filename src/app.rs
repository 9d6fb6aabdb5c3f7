use crate::audio::{AtomicAudioState, AudioSystem, BeatConfig};
use crate::config::{AudioInput, Config, VideoInput};
use crate::control::{ControlBus, ControlEvent};
use crate::engine::{EffectEngine, EngineStatus};
use crate::frame::PatternSource;
use crate::pipeline::{Pipeline, PipelineOptions, SourceFactory, Tick};
use crate::registry::EffectRegistry;
use crate::render::TerminalSink;
use crate::segmentation::LumaSegmenter;
use crate::terminal::TerminalGuard;
use anyhow::Context;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub fn run(cfg: Config) -> anyhow::Result<()> {
    let registry = EffectRegistry::with_builtins();
    let effect_names: Vec<&'static str> = registry.names();

    let bus = ControlBus::new(64);

    // The cpal stream is !Send, so the audio system stays on this thread;
    // only the snapshot crosses into the pipeline.
    let audio_system = match cfg.audio {
        AudioInput::Mic => Some(
            AudioSystem::start(
                cfg.device.as_deref(),
                BeatConfig {
                    threshold: cfg.beat_threshold,
                    refractory: cfg.refractory(),
                    ..BeatConfig::default()
                },
            )
            .context("start audio capture")?,
        ),
        AudioInput::Off => None,
    };
    let snapshot = audio_system
        .as_ref()
        .map(|a| a.snapshot())
        .unwrap_or_else(|| Arc::new(AtomicAudioState::new()));

    let mut engine = EffectEngine::new(cfg.blend_curve, cfg.transition(), true);
    engine
        .activate(&registry, &cfg.effect)
        .with_context(|| format!("activate startup effect {:?}", cfg.effect))?;

    let (width, height) = (cfg.width, cfg.height);
    let make_source: SourceFactory = match cfg.video {
        VideoInput::Pattern => Box::new(move || Box::new(PatternSource::new(width, height))),
    };

    let frame_period = Duration::from_secs_f64(1.0 / cfg.fps.max(1) as f64);
    let opts = PipelineOptions {
        staleness: cfg.staleness(),
        deadline: cfg.deadline(),
        frame_timeout: (frame_period * 4).max(Duration::from_millis(50)),
        auto_switch: (cfg.auto_switch_secs > 0)
            .then(|| Duration::from_secs(cfg.auto_switch_secs)),
        distortion_level: cfg.distortion,
        rng_seed: None,
    };
    let mut pipeline = Pipeline::new(
        make_source,
        registry,
        engine,
        Some(Box::new(LumaSegmenter::new())),
        Arc::clone(&snapshot),
        bus.clone(),
        opts,
    );

    let _guard = TerminalGuard::new()?;
    let (cols, rows) = terminal::size().context("query terminal size")?;
    let mut sink = TerminalSink::new(TerminalGuard::stdout(), cols, rows);

    tracing::info!(fps = cfg.fps, effect = %cfg.effect, "pipeline starting");

    let mut distortion_level = cfg.distortion.min(100);
    loop {
        let tick_start = Instant::now();

        while event::poll(Duration::ZERO)? {
            match event::read()? {
                Event::Key(key) if key.kind != KeyEventKind::Release => {
                    handle_key(
                        key.code,
                        key.modifiers,
                        &bus,
                        &effect_names,
                        &mut distortion_level,
                    );
                }
                Event::Resize(c, r) => sink.resize(c, r),
                _ => {}
            }
        }

        let audio = snapshot.sample(cfg.staleness());
        sink.set_hud(hud_line(&pipeline, audio.beat, audio.tempo_bpm));

        match pipeline.tick(&mut sink)? {
            Tick::Shutdown => break,
            Tick::Frame | Tick::Skipped => {}
        }

        let spent = tick_start.elapsed();
        if spent < frame_period {
            std::thread::sleep(frame_period - spent);
        }
    }

    tracing::info!(
        frames = pipeline.stats.frames_out,
        timeouts = pipeline.stats.source_timeouts,
        over_deadline = pipeline.stats.over_deadline,
        "pipeline stopped"
    );
    Ok(())
}

fn handle_key(
    code: KeyCode,
    modifiers: KeyModifiers,
    bus: &ControlBus,
    effect_names: &[&'static str],
    distortion_level: &mut u8,
) {
    match code {
        KeyCode::Char('q') | KeyCode::Esc => bus.post(ControlEvent::Shutdown),
        KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => {
            bus.post(ControlEvent::Shutdown)
        }
        KeyCode::Char('r') | KeyCode::Char(' ') => bus.post(ControlEvent::RandomEffect),
        KeyCode::Char('d') => bus.post(ControlEvent::Deactivate),
        KeyCode::Char('s') => bus.post(ControlEvent::Stop),
        KeyCode::Char('a') => bus.post(ControlEvent::Start),
        KeyCode::Char('+') | KeyCode::Char('=') => {
            *distortion_level = (*distortion_level + 10).min(100);
            bus.post(ControlEvent::SetDistortion(*distortion_level));
        }
        KeyCode::Char('-') => {
            *distortion_level = distortion_level.saturating_sub(10);
            bus.post(ControlEvent::SetDistortion(*distortion_level));
        }
        KeyCode::Char(c @ '1'..='9') => {
            let idx = (c as usize) - ('1' as usize);
            if let Some(name) = effect_names.get(idx) {
                bus.post(ControlEvent::SetEffect(name.to_string()));
            }
        }
        _ => {}
    }
}

fn hud_line(pipeline: &Pipeline, beat: bool, bpm: f32) -> String {
    let status = if pipeline.is_stopped() {
        "stopped".to_string()
    } else {
        match pipeline.engine().status() {
            EngineStatus::Idle => "passthrough".to_string(),
            EngineStatus::Active(name) => name,
            EngineStatus::Transitioning { from, to } => {
                let from = if from.is_empty() { "passthrough" } else { &from };
                format!("{from} -> {to}")
            }
        }
    };
    format!(
        "videojockey | {:>3} fps | {} | dist {:>3} | {:>5.1} bpm {} | [1-9] effect [r]andom [d]rop [s]top [a]gain [q]uit",
        pipeline.fps.fps(),
        status,
        pipeline.distortion_level(),
        bpm,
        if beat { "*" } else { " " },
    )
}
