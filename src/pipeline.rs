use crate::audio::AtomicAudioState;
use crate::config::SinkPolicy;
use crate::control::{ControlBus, ControlEvent};
use crate::engine::EffectEngine;
use crate::frame::{Distortion, Frame, FrameSource, SourceError};
use crate::registry::EffectRegistry;
use crate::segmentation::SegmentationProvider;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Where processed frames go. Submission must not block the pipeline; slow
/// consumers shed frames according to their policy instead.
pub trait FrameSink {
    fn submit(&mut self, frame: Frame) -> anyhow::Result<()>;
}

/// Bounded in-memory sink decoupling the pipeline from a consumer thread.
pub struct QueueSink {
    queue: VecDeque<Frame>,
    capacity: usize,
    policy: SinkPolicy,
    pub dropped: u64,
}

impl QueueSink {
    pub fn new(capacity: usize, policy: SinkPolicy) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            policy,
            dropped: 0,
        }
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl FrameSink for QueueSink {
    fn submit(&mut self, frame: Frame) -> anyhow::Result<()> {
        if self.queue.len() >= self.capacity {
            self.dropped += 1;
            match self.policy {
                SinkPolicy::DropOldest => {
                    self.queue.pop_front();
                }
                SinkPolicy::DropNewest => return Ok(()),
            }
        }
        self.queue.push_back(frame);
        Ok(())
    }
}

/// Rolling one-second frame counter.
pub struct FpsCounter {
    times: VecDeque<Instant>,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self {
            times: VecDeque::with_capacity(128),
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.times.push_back(now);
        while let Some(front) = self.times.front() {
            if now.duration_since(*front) > Duration::from_secs(1) {
                self.times.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn fps(&self) -> usize {
        self.times.len()
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub frames_out: u64,
    pub frames_dropped_order: u64,
    pub source_timeouts: u64,
    pub source_outages: u64,
    pub over_deadline: u64,
    pub effect_failures: u64,
}

/// Knobs the pipeline needs beyond its collaborators.
pub struct PipelineOptions {
    pub staleness: Duration,
    pub deadline: Duration,
    pub frame_timeout: Duration,
    /// Start a random transition this often (None disables).
    pub auto_switch: Option<Duration>,
    pub distortion_level: u8,
    /// Seed for auto/random effect selection; None draws from the OS.
    pub rng_seed: Option<u64>,
}

/// Outcome of a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// A frame was processed and submitted.
    Frame,
    /// No frame this tick (timeout, outage backoff, or an out-of-order
    /// frame was discarded). The pipeline keeps running.
    Skipped,
    Shutdown,
}

/// Builds a fresh frame source; called at construction and on every
/// `ControlEvent::Start` after a `Stop`.
pub type SourceFactory = Box<dyn FnMut() -> Box<dyn FrameSource> + Send>;

/// Per-tick orchestrator: drain controls, pull a frame, distort, sample
/// audio, run the engine, submit. One frame in flight at a time; an outage
/// never resets the engine, so effect state survives reconnects. `Stop`
/// drops the source (releasing its device handle) and the running effect
/// instances; `Start` reopens through the factory.
pub struct Pipeline {
    make_source: SourceFactory,
    source: Option<Box<dyn FrameSource>>,
    distortion: Distortion,
    registry: EffectRegistry,
    engine: EffectEngine,
    segmenter: Option<Box<dyn SegmentationProvider>>,
    audio: Arc<AtomicAudioState>,
    bus: ControlBus,
    opts: PipelineOptions,
    rng: fastrand::Rng,

    start: Instant,
    last_tick: Option<Instant>,
    last_seq: Option<u64>,
    last_timestamp: Option<Instant>,
    last_switch: Instant,
    freeze_next: bool,
    consecutive_timeouts: u32,
    backoff: Duration,
    retry_at: Option<Instant>,

    pub stats: PipelineStats,
    pub fps: FpsCounter,
}

/// Timeouts in a row before a silent source is treated as an outage.
const TIMEOUTS_BEFORE_OUTAGE: u32 = 3;
const BACKOFF_START: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(2);

impl Pipeline {
    pub fn new(
        mut make_source: SourceFactory,
        registry: EffectRegistry,
        engine: EffectEngine,
        segmenter: Option<Box<dyn SegmentationProvider>>,
        audio: Arc<AtomicAudioState>,
        bus: ControlBus,
        opts: PipelineOptions,
    ) -> Self {
        let rng = match opts.rng_seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        let distortion = Distortion::new(opts.distortion_level);
        let source = Some(make_source());
        let now = Instant::now();
        Self {
            make_source,
            source,
            distortion,
            registry,
            engine,
            segmenter,
            audio,
            bus,
            opts,
            rng,
            start: now,
            last_tick: None,
            last_seq: None,
            last_timestamp: None,
            last_switch: now,
            freeze_next: false,
            consecutive_timeouts: 0,
            backoff: Duration::ZERO,
            retry_at: None,
            stats: PipelineStats::default(),
            fps: FpsCounter::new(),
        }
    }

    pub fn engine(&self) -> &EffectEngine {
        &self.engine
    }

    pub fn registry(&self) -> &EffectRegistry {
        &self.registry
    }

    pub fn distortion_level(&self) -> u8 {
        self.distortion.level()
    }

    pub fn is_stopped(&self) -> bool {
        self.source.is_none()
    }

    fn start(&mut self) {
        if self.source.is_some() {
            return;
        }
        tracing::info!("pipeline starting");
        self.source = Some((self.make_source)());
        // New source, new seq/timestamp space.
        self.last_seq = None;
        self.last_timestamp = None;
        self.consecutive_timeouts = 0;
        self.backoff = Duration::ZERO;
        self.retry_at = None;
        self.last_switch = Instant::now();
    }

    fn stop(&mut self) {
        if self.source.is_none() {
            return;
        }
        tracing::info!("pipeline stopped; source released");
        self.source = None;
        self.engine.deactivate();
    }

    fn apply_event(&mut self, event: ControlEvent) -> bool {
        match event {
            ControlEvent::Start => self.start(),
            ControlEvent::Stop => self.stop(),
            ControlEvent::SetEffect(name) => {
                if let Err(err) = self.engine.begin_transition(&self.registry, &name) {
                    tracing::warn!(%err, "effect switch rejected");
                }
            }
            ControlEvent::BeginTransition { name, duration_ms } => {
                let duration = Duration::from_millis(duration_ms.max(1));
                if let Err(err) =
                    self.engine
                        .begin_transition_timed(&self.registry, &name, duration)
                {
                    tracing::warn!(%err, "timed effect switch rejected");
                }
            }
            ControlEvent::RandomEffect => self.random_switch(),
            ControlEvent::Deactivate => self.engine.deactivate(),
            ControlEvent::SetDistortion(level) => self.distortion.set_level(level),
            ControlEvent::Shutdown => return true,
        }
        false
    }

    fn random_switch(&mut self) {
        let current = self.engine.active_name().map(|s| s.to_string());
        let pick = self
            .registry
            .random_excluding(&mut self.rng, current.as_deref())
            .map(|d| d.name);
        if let Some(name) = pick {
            if let Err(err) = self.engine.begin_transition(&self.registry, name) {
                tracing::warn!(%err, "random switch rejected");
            }
        }
    }

    fn handle_outage(&mut self, now: Instant) {
        self.stats.source_outages += 1;
        if self.backoff.is_zero() {
            // First failure retries on the next tick; only repeated
            // failures back off.
            self.backoff = BACKOFF_START;
            tracing::warn!("frame source unavailable; reconnecting");
        } else {
            self.retry_at = Some(now + self.backoff);
            self.backoff = (self.backoff * 2).min(BACKOFF_CAP);
        }
    }

    /// Run one tick against `sink`. Never blocks longer than the source
    /// timeout plus per-frame processing.
    pub fn tick(&mut self, sink: &mut dyn FrameSink) -> anyhow::Result<Tick> {
        let tick_start = Instant::now();

        for event in self.bus.drain() {
            if self.apply_event(event) {
                tracing::info!("shutdown requested");
                return Ok(Tick::Shutdown);
            }
        }

        let source = match self.source.as_mut() {
            Some(source) => source,
            None => return Ok(Tick::Skipped),
        };

        if let Some(at) = self.retry_at {
            if tick_start < at {
                return Ok(Tick::Skipped);
            }
            self.retry_at = None;
        }

        let mut frame = match source.next_frame(self.opts.frame_timeout) {
            Ok(frame) => {
                if self.consecutive_timeouts > 0 || !self.backoff.is_zero() {
                    tracing::info!("frame source recovered");
                }
                self.consecutive_timeouts = 0;
                self.backoff = Duration::ZERO;
                frame
            }
            Err(SourceError::Timeout) => {
                self.stats.source_timeouts += 1;
                self.consecutive_timeouts += 1;
                if self.consecutive_timeouts >= TIMEOUTS_BEFORE_OUTAGE {
                    self.consecutive_timeouts = 0;
                    self.handle_outage(tick_start);
                }
                return Ok(Tick::Skipped);
            }
            Err(SourceError::Unavailable) => {
                self.handle_outage(tick_start);
                return Ok(Tick::Skipped);
            }
        };

        // Late or replayed frames are discarded, never reordered.
        let stale_seq = self.last_seq.is_some_and(|s| frame.seq <= s);
        let stale_time = self.last_timestamp.is_some_and(|t| frame.timestamp < t);
        if stale_seq || stale_time {
            self.stats.frames_dropped_order += 1;
            return Ok(Tick::Skipped);
        }
        self.last_seq = Some(frame.seq);
        self.last_timestamp = Some(frame.timestamp);

        self.distortion.apply(&mut frame);

        let audio = self.audio.sample(self.opts.staleness);

        if let Some(interval) = self.opts.auto_switch {
            if tick_start.duration_since(self.last_switch) >= interval {
                self.last_switch = tick_start;
                self.random_switch();
            }
        }

        let mask = if self.engine.needs_mask() {
            self.segmenter.as_mut().map(|s| s.segment(&frame))
        } else {
            None
        };

        let dt = self
            .last_tick
            .map(|t| tick_start.duration_since(t))
            .unwrap_or(Duration::ZERO);
        self.last_tick = Some(tick_start);

        let time = tick_start.duration_since(self.start).as_secs_f32();
        let freeze = self.freeze_next;
        let out = self
            .engine
            .process(&frame, &audio, mask.as_ref(), time, dt, freeze);
        if self.engine.take_last_failure().is_some() {
            self.stats.effect_failures += 1;
        }

        sink.submit(out)?;
        self.stats.frames_out += 1;
        self.fps.record(tick_start);

        let spent = tick_start.elapsed();
        self.freeze_next = spent > self.opts.deadline;
        if self.freeze_next {
            self.stats.over_deadline += 1;
            tracing::debug!(spent_ms = spent.as_millis() as u64, "tick over deadline");
        }

        Ok(Tick::Frame)
    }
}
