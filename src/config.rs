use clap::{Parser, ValueEnum};
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "videojockey", version, about = "Audio-reactive live video effect pipeline")]
pub struct Config {
    /// Video input: synthetic test pattern (camera/RTSP backends plug in
    /// through the FrameSource trait).
    #[arg(long, value_enum, default_value_t = VideoInput::Pattern)]
    pub video: VideoInput,

    /// Audio input driving beat detection.
    #[arg(long, value_enum, default_value_t = AudioInput::Mic)]
    pub audio: AudioInput,

    #[arg(long, default_value_t = 320)]
    pub width: usize,

    #[arg(long, default_value_t = 180)]
    pub height: usize,

    #[arg(long, default_value_t = 30)]
    pub fps: u32,

    /// Effect selected at startup (name from the registry).
    #[arg(long, default_value = "invert")]
    pub effect: String,

    /// Cross-fade duration for effect switches, in milliseconds.
    #[arg(long, default_value_t = 2000)]
    pub transition_ms: u64,

    #[arg(long, value_enum, default_value_t = BlendCurve::Smoothstep)]
    pub blend_curve: BlendCurve,

    /// Begin a random-effect transition every N seconds (0 disables).
    #[arg(long, default_value_t = 0)]
    pub auto_switch_secs: u64,

    /// Beat threshold: instantaneous energy must exceed the local average
    /// times this factor.
    #[arg(long, default_value_t = 1.5)]
    pub beat_threshold: f32,

    /// Minimum interval between two beat flags, in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub beat_refractory_ms: u64,

    /// Audio older than this is treated as silence, in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub audio_staleness_ms: u64,

    /// Soft per-frame processing budget, in milliseconds. Over-budget ticks
    /// freeze transition progress for one tick but never stop output.
    #[arg(long, default_value_t = 50)]
    pub deadline_ms: u64,

    #[arg(long, value_enum, default_value_t = SinkPolicy::DropOldest)]
    pub sink_policy: SinkPolicy,

    /// Input distortion level (0-100) applied before the effect stage.
    #[arg(long, default_value_t = 0)]
    pub distortion: u8,

    #[arg(long, default_value_t = false)]
    pub list_devices: bool,

    #[arg(long, default_value_t = false)]
    pub list_effects: bool,

    /// Input device name substring (microphone selection).
    #[arg(long)]
    pub device: Option<String>,
}

impl Config {
    pub fn transition(&self) -> Duration {
        Duration::from_millis(self.transition_ms.max(1))
    }

    pub fn refractory(&self) -> Duration {
        Duration::from_millis(self.beat_refractory_ms)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_millis(self.audio_staleness_ms.max(1))
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VideoInput {
    Pattern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AudioInput {
    Mic,
    /// No audio capture; the pipeline runs on the staleness-silence path.
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BlendCurve {
    Linear,
    Smoothstep,
}

impl BlendCurve {
    /// Blend weight for a transition at `elapsed` out of `duration`.
    /// Monotonic non-decreasing, 0.0 before start, 1.0 at or past the end,
    /// and a pure function of its inputs.
    pub fn weight(self, elapsed: Duration, duration: Duration) -> f32 {
        let d = duration.as_secs_f32().max(1e-6);
        let t = (elapsed.as_secs_f32() / d).clamp(0.0, 1.0);
        match self {
            Self::Linear => t,
            Self::Smoothstep => t * t * (3.0 - 2.0 * t),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SinkPolicy {
    /// On a full sink queue, evict the oldest queued frame (favor recency).
    DropOldest,
    /// On a full sink queue, discard the newly published frame.
    DropNewest,
}
