use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use videojockey::audio::AtomicAudioState;
use videojockey::config::{BlendCurve, SinkPolicy};
use videojockey::control::{ControlBus, ControlEvent};
use videojockey::engine::{EffectEngine, EngineStatus};
use videojockey::frame::{Frame, FrameSource, SourceError};
use videojockey::pipeline::{FrameSink, Pipeline, PipelineOptions, QueueSink, SourceFactory, Tick};
use videojockey::registry::EffectRegistry;

/// Source that replays a fixed script, then times out forever.
struct ScriptedSource {
    script: VecDeque<Result<Frame, SourceError>>,
}

impl ScriptedSource {
    fn new(script: Vec<Result<Frame, SourceError>>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl FrameSource for ScriptedSource {
    fn next_frame(&mut self, _timeout: Duration) -> Result<Frame, SourceError> {
        self.script.pop_front().unwrap_or(Err(SourceError::Timeout))
    }
}

struct CollectSink {
    frames: Vec<Frame>,
}

impl CollectSink {
    fn new() -> Self {
        Self { frames: Vec::new() }
    }
}

impl FrameSink for CollectSink {
    fn submit(&mut self, frame: Frame) -> anyhow::Result<()> {
        self.frames.push(frame);
        Ok(())
    }
}

fn frame_at(seq: u64, timestamp: Instant) -> Frame {
    let mut frame = Frame::new(4, 4, timestamp, seq);
    for px in frame.data.chunks_exact_mut(4) {
        px[0] = 100;
        px[1] = 100;
        px[2] = 100;
        px[3] = 255;
    }
    frame
}

fn options() -> PipelineOptions {
    PipelineOptions {
        staleness: Duration::from_millis(500),
        deadline: Duration::from_secs(10),
        frame_timeout: Duration::ZERO,
        auto_switch: None,
        distortion_level: 0,
        rng_seed: Some(7),
    }
}

fn build_pipeline(
    script: Vec<Result<Frame, SourceError>>,
    startup_effect: Option<&str>,
    opts: PipelineOptions,
) -> (Pipeline, ControlBus) {
    build_pipeline_scripts(vec![script], startup_effect, opts)
}

/// Each inner script feeds one source incarnation; a restart consumes the
/// next one.
fn build_pipeline_scripts(
    mut scripts: Vec<Vec<Result<Frame, SourceError>>>,
    startup_effect: Option<&str>,
    opts: PipelineOptions,
) -> (Pipeline, ControlBus) {
    let registry = EffectRegistry::with_builtins();
    let mut engine = EffectEngine::new(BlendCurve::Linear, Duration::from_millis(100), true);
    if let Some(name) = startup_effect {
        engine.activate(&registry, name).unwrap();
    }
    let bus = ControlBus::new(64);
    let make_source: SourceFactory = Box::new(move || {
        let script = if scripts.is_empty() {
            Vec::new()
        } else {
            scripts.remove(0)
        };
        Box::new(ScriptedSource::new(script))
    });
    let pipeline = Pipeline::new(
        make_source,
        registry,
        engine,
        None,
        Arc::new(AtomicAudioState::new()),
        bus.clone(),
        opts,
    );
    (pipeline, bus)
}

#[test]
fn random_selection_never_repeats_current() {
    let registry = EffectRegistry::with_builtins();
    let mut rng = fastrand::Rng::with_seed(42);
    for _ in 0..200 {
        let pick = registry.random_excluding(&mut rng, Some("invert")).unwrap();
        assert_ne!(pick.name, "invert");
    }
}

#[test]
fn random_selection_with_no_alternative_is_none() {
    let mut registry = EffectRegistry::with_builtins();
    for name in ["mirror", "pixelate", "hueshift", "trails", "background"] {
        registry.unregister(name).unwrap();
    }
    let mut rng = fastrand::Rng::with_seed(1);
    assert!(registry.random_excluding(&mut rng, Some("invert")).is_none());
}

#[test]
fn outage_skips_ticks_but_preserves_effect_state() {
    let t0 = Instant::now();
    let script = vec![
        Ok(frame_at(0, t0)),
        Err(SourceError::Unavailable),
        Ok(frame_at(1, t0 + Duration::from_millis(33))),
    ];
    let (mut pipeline, _bus) = build_pipeline(script, Some("invert"), options());
    let mut sink = CollectSink::new();

    assert_eq!(pipeline.tick(&mut sink).unwrap(), Tick::Frame);
    assert_eq!(pipeline.tick(&mut sink).unwrap(), Tick::Skipped);
    assert_eq!(pipeline.tick(&mut sink).unwrap(), Tick::Frame);

    // The effect survived the outage; output is still inverted.
    assert_eq!(pipeline.engine().status(), EngineStatus::Active("invert".into()));
    assert_eq!(sink.frames.len(), 2);
    assert_eq!(sink.frames[1].data[0], 155);
    assert_eq!(pipeline.stats.source_outages, 1);
}

#[test]
fn repeated_timeouts_escalate_to_outage() {
    let (mut pipeline, _bus) = build_pipeline(Vec::new(), None, options());
    let mut sink = CollectSink::new();

    for _ in 0..3 {
        assert_eq!(pipeline.tick(&mut sink).unwrap(), Tick::Skipped);
    }
    assert_eq!(pipeline.stats.source_timeouts, 3);
    assert_eq!(pipeline.stats.source_outages, 1);
}

#[test]
fn out_of_order_frames_are_discarded() {
    let t0 = Instant::now();
    let script = vec![
        Ok(frame_at(0, t0)),
        Ok(frame_at(0, t0 + Duration::from_millis(10))), // duplicate seq
        Ok(frame_at(5, t0 + Duration::from_millis(20))),
        Ok(frame_at(3, t0 + Duration::from_millis(30))), // seq went backwards
        Ok(frame_at(6, t0 + Duration::from_millis(5))),  // timestamp went backwards
        Ok(frame_at(7, t0 + Duration::from_millis(40))),
    ];
    let (mut pipeline, _bus) = build_pipeline(script, None, options());
    let mut sink = CollectSink::new();

    for _ in 0..6 {
        pipeline.tick(&mut sink).unwrap();
    }

    let seqs: Vec<u64> = sink.frames.iter().map(|f| f.seq).collect();
    assert_eq!(seqs, vec![0, 5, 7]);
    assert_eq!(pipeline.stats.frames_dropped_order, 3);
}

#[test]
fn control_events_coalesce_to_latest_per_kind() {
    let bus = ControlBus::new(64);
    bus.post(ControlEvent::SetDistortion(10));
    bus.post(ControlEvent::SetEffect("mirror".into()));
    bus.post(ControlEvent::SetDistortion(90));
    bus.post(ControlEvent::SetEffect("pixelate".into()));

    let drained = bus.drain();
    assert_eq!(
        drained,
        vec![
            ControlEvent::SetDistortion(90),
            ControlEvent::SetEffect("pixelate".into())
        ]
    );
    assert!(bus.is_empty());
}

#[test]
fn bus_overflow_drops_oldest() {
    let bus = ControlBus::new(3);
    for level in 1..=5u8 {
        bus.post(ControlEvent::SetDistortion(level));
    }
    assert_eq!(bus.len(), 3);
    assert_eq!(bus.drain(), vec![ControlEvent::SetDistortion(5)]);
}

#[test]
fn pipeline_applies_coalesced_controls() {
    let t0 = Instant::now();
    let script = vec![Ok(frame_at(0, t0))];
    let (mut pipeline, bus) = build_pipeline(script, Some("invert"), options());
    let mut sink = CollectSink::new();

    bus.post(ControlEvent::SetDistortion(20));
    bus.post(ControlEvent::SetDistortion(70));
    bus.post(ControlEvent::SetEffect("mirror".into()));
    pipeline.tick(&mut sink).unwrap();

    assert_eq!(pipeline.distortion_level(), 70);
    assert_eq!(
        pipeline.engine().status(),
        EngineStatus::Transitioning {
            from: "invert".into(),
            to: "mirror".into()
        }
    );
}

#[test]
fn unknown_effect_command_is_ignored() {
    let t0 = Instant::now();
    let script = vec![Ok(frame_at(0, t0))];
    let (mut pipeline, bus) = build_pipeline(script, Some("invert"), options());
    let mut sink = CollectSink::new();

    bus.post(ControlEvent::SetEffect("bogus".into()));
    assert_eq!(pipeline.tick(&mut sink).unwrap(), Tick::Frame);
    assert_eq!(pipeline.engine().status(), EngineStatus::Active("invert".into()));
}

#[test]
fn shutdown_event_stops_the_pipeline() {
    let t0 = Instant::now();
    let script = vec![Ok(frame_at(0, t0))];
    let (mut pipeline, bus) = build_pipeline(script, None, options());
    let mut sink = CollectSink::new();

    bus.post(ControlEvent::Shutdown);
    assert_eq!(pipeline.tick(&mut sink).unwrap(), Tick::Shutdown);
    assert!(sink.frames.is_empty());
}

#[test]
fn auto_switch_starts_a_transition() {
    let t0 = Instant::now();
    let script = vec![Ok(frame_at(0, t0))];
    let mut opts = options();
    opts.auto_switch = Some(Duration::ZERO);
    let (mut pipeline, _bus) = build_pipeline(script, Some("invert"), opts);
    let mut sink = CollectSink::new();

    pipeline.tick(&mut sink).unwrap();
    match pipeline.engine().status() {
        EngineStatus::Transitioning { from, to } => {
            assert_eq!(from, "invert");
            assert_ne!(to, "invert");
        }
        other => panic!("expected a transition, got {other:?}"),
    }
}

#[test]
fn stop_halts_output_and_start_reopens() {
    let t0 = Instant::now();
    let scripts = vec![
        vec![Ok(frame_at(0, t0))],
        // A fresh source restarts its sequence space.
        vec![Ok(frame_at(0, t0 + Duration::from_millis(100)))],
    ];
    let (mut pipeline, bus) = build_pipeline_scripts(scripts, Some("invert"), options());
    let mut sink = CollectSink::new();

    assert_eq!(pipeline.tick(&mut sink).unwrap(), Tick::Frame);

    bus.post(ControlEvent::Stop);
    assert_eq!(pipeline.tick(&mut sink).unwrap(), Tick::Skipped);
    assert!(pipeline.is_stopped());
    assert_eq!(pipeline.engine().status(), EngineStatus::Idle);
    assert_eq!(pipeline.tick(&mut sink).unwrap(), Tick::Skipped);

    bus.post(ControlEvent::Start);
    assert_eq!(pipeline.tick(&mut sink).unwrap(), Tick::Frame);
    assert!(!pipeline.is_stopped());
    assert_eq!(sink.frames.len(), 2);
}

#[test]
fn effect_failure_is_counted_and_frames_keep_flowing() {
    let t0 = Instant::now();
    let script = vec![
        Ok(frame_at(0, t0)),
        Ok(frame_at(1, t0 + Duration::from_millis(33))),
    ];
    // No segmenter is installed, so `background` fails on its first frame.
    let (mut pipeline, _bus) = build_pipeline(script, Some("background"), options());
    let mut sink = CollectSink::new();

    assert_eq!(pipeline.tick(&mut sink).unwrap(), Tick::Frame);
    assert_eq!(pipeline.stats.effect_failures, 1);
    assert_eq!(pipeline.engine().status(), EngineStatus::Idle);
    // Passthrough output, still flowing.
    assert_eq!(sink.frames[0].data[0], 100);
    assert_eq!(pipeline.tick(&mut sink).unwrap(), Tick::Frame);
    assert_eq!(sink.frames.len(), 2);
}

#[test]
fn queue_sink_drop_oldest_keeps_recent_frames() {
    let t0 = Instant::now();
    let mut sink = QueueSink::new(2, SinkPolicy::DropOldest);
    for seq in 0..3 {
        sink.submit(frame_at(seq, t0 + Duration::from_millis(seq))).unwrap();
    }
    assert_eq!(sink.dropped, 1);
    assert_eq!(sink.pop().unwrap().seq, 1);
    assert_eq!(sink.pop().unwrap().seq, 2);
    assert!(sink.pop().is_none());
}

#[test]
fn queue_sink_drop_newest_keeps_queued_frames() {
    let t0 = Instant::now();
    let mut sink = QueueSink::new(2, SinkPolicy::DropNewest);
    for seq in 0..3 {
        sink.submit(frame_at(seq, t0 + Duration::from_millis(seq))).unwrap();
    }
    assert_eq!(sink.dropped, 1);
    assert_eq!(sink.pop().unwrap().seq, 0);
    assert_eq!(sink.pop().unwrap().seq, 1);
    assert!(sink.pop().is_none());
}

#[test]
fn terminal_sink_truncates_wide_hud_on_a_char_boundary() {
    use videojockey::render::TerminalSink;

    // 4 columns, multi-byte status text well past the width.
    let mut sink = TerminalSink::new(Vec::new(), 4, 3);
    sink.set_hud("ビート 128 BPM ♪♪♪".to_string());
    sink.submit(frame_at(0, Instant::now())).unwrap();
}
