use crate::audio::AudioState;
use crate::config::BlendCurve;
use crate::effects::{Capability, Effect, EffectCtx};
use crate::frame::Frame;
use crate::registry::EffectRegistry;
use crate::segmentation::Mask;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    EffectNotFound(String),
    /// The effect declares a capability the pipeline was not built with.
    CapabilityUnavailable {
        effect: String,
        capability: Capability,
    },
    /// The running instance returned an error; the engine dropped it and
    /// fell back to passthrough.
    EffectFailed { effect: String, reason: String },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EffectNotFound(name) => write!(f, "no such effect: {name}"),
            Self::CapabilityUnavailable { effect, capability } => {
                write!(f, "effect {effect} requires unavailable capability {capability:?}")
            }
            Self::EffectFailed { effect, reason } => {
                write!(f, "effect {effect} failed: {reason}")
            }
        }
    }
}

impl std::error::Error for EngineError {}

struct Slot {
    name: String,
    effect: Box<dyn Effect>,
    needs_mask: bool,
}

enum State {
    Idle,
    Active(Slot),
    Transitioning {
        from: Slot,
        to: Slot,
        elapsed: Duration,
        duration: Duration,
    },
}

/// Name of the engine's current mode plus the effects involved, for status
/// lines and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    Idle,
    Active(String),
    Transitioning { from: String, to: String },
}

/// Applies the active effect (or a cross-fade between two) to each frame.
/// Activation and transitions construct effect instances eagerly so a bad
/// name fails at the call site and never mid-stream; a runtime effect
/// failure deactivates to passthrough instead of stopping output.
pub struct EffectEngine {
    state: State,
    curve: BlendCurve,
    transition: Duration,
    has_segmentation: bool,
    last_failure: Option<EngineError>,
    tmp_a: Frame,
    tmp_b: Frame,
}

impl EffectEngine {
    pub fn new(curve: BlendCurve, transition: Duration, has_segmentation: bool) -> Self {
        Self {
            state: State::Idle,
            curve,
            transition: transition.max(Duration::from_millis(1)),
            has_segmentation,
            last_failure: None,
            tmp_a: Frame::new(1, 1, std::time::Instant::now(), 0),
            tmp_b: Frame::new(1, 1, std::time::Instant::now(), 0),
        }
    }

    fn build_slot(&self, registry: &EffectRegistry, name: &str) -> Result<Slot, EngineError> {
        let desc = registry
            .lookup(name)
            .map_err(|_| EngineError::EffectNotFound(name.to_string()))?;
        for cap in desc.capabilities {
            let available = match cap {
                Capability::SegmentationMask => self.has_segmentation,
            };
            if !available {
                return Err(EngineError::CapabilityUnavailable {
                    effect: name.to_string(),
                    capability: *cap,
                });
            }
        }
        Ok(Slot {
            name: name.to_string(),
            effect: (desc.factory)(),
            needs_mask: desc
                .capabilities
                .contains(&Capability::SegmentationMask),
        })
    }

    /// Replace whatever is running with a fresh instance of `name`, no
    /// cross-fade. On error the current state is untouched.
    pub fn activate(&mut self, registry: &EffectRegistry, name: &str) -> Result<(), EngineError> {
        let slot = self.build_slot(registry, name)?;
        self.state = State::Active(slot);
        Ok(())
    }

    /// Start a cross-fade to a fresh instance of `name` over the engine's
    /// configured duration.
    pub fn begin_transition(
        &mut self,
        registry: &EffectRegistry,
        name: &str,
    ) -> Result<(), EngineError> {
        self.begin_transition_timed(registry, name, self.transition)
    }

    /// Start a cross-fade from the current output to a fresh instance of
    /// `name` over `duration`. From Idle this fades in from passthrough. An
    /// in-flight transition snaps to its target first, then the new fade
    /// begins from there. On error the current state is untouched.
    pub fn begin_transition_timed(
        &mut self,
        registry: &EffectRegistry,
        name: &str,
        duration: Duration,
    ) -> Result<(), EngineError> {
        let incoming = self.build_slot(registry, name)?;
        let from = match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => Slot {
                name: String::new(),
                effect: Box::new(Passthrough),
                needs_mask: false,
            },
            State::Active(slot) => slot,
            State::Transitioning { to, .. } => to,
        };
        self.state = State::Transitioning {
            from,
            to: incoming,
            elapsed: Duration::ZERO,
            duration: duration.max(Duration::from_millis(1)),
        };
        Ok(())
    }

    pub fn deactivate(&mut self) {
        self.state = State::Idle;
    }

    pub fn status(&self) -> EngineStatus {
        match &self.state {
            State::Idle => EngineStatus::Idle,
            State::Active(slot) => EngineStatus::Active(slot.name.clone()),
            State::Transitioning { from, to, .. } => EngineStatus::Transitioning {
                from: from.name.clone(),
                to: to.name.clone(),
            },
        }
    }

    pub fn active_name(&self) -> Option<&str> {
        match &self.state {
            State::Idle => None,
            State::Active(slot) => Some(&slot.name),
            State::Transitioning { to, .. } => Some(&to.name),
        }
    }

    /// The `EffectFailed` from the most recent passthrough fallback, if any.
    pub fn take_last_failure(&mut self) -> Option<EngineError> {
        self.last_failure.take()
    }

    /// Whether the next `process` call will want a segmentation mask.
    pub fn needs_mask(&self) -> bool {
        match &self.state {
            State::Idle => false,
            State::Active(slot) => slot.needs_mask,
            State::Transitioning { from, to, .. } => from.needs_mask || to.needs_mask,
        }
    }

    /// Run one tick. `dt` advances the transition clock unless `freeze` is
    /// set (the over-deadline policy). A failing effect logs, deactivates,
    /// and yields the input unchanged.
    pub fn process(
        &mut self,
        input: &Frame,
        audio: &AudioState,
        mask: Option<&Mask>,
        time: f32,
        dt: Duration,
        freeze: bool,
    ) -> Frame {
        match &mut self.state {
            State::Idle => input.clone(),
            State::Active(slot) => {
                let ctx = EffectCtx {
                    audio,
                    mask: if slot.needs_mask { mask } else { None },
                    time,
                };
                let mut out = input.clone();
                match slot.effect.process(&ctx, input, &mut out) {
                    Ok(()) => out,
                    Err(err) => {
                        let failure = EngineError::EffectFailed {
                            effect: slot.name.clone(),
                            reason: err.to_string(),
                        };
                        tracing::warn!(%failure, "falling back to passthrough");
                        self.state = State::Idle;
                        self.last_failure = Some(failure);
                        input.clone()
                    }
                }
            }
            State::Transitioning {
                from,
                to,
                elapsed,
                duration,
            } => {
                if !freeze {
                    *elapsed += dt;
                }
                let weight = self.curve.weight(*elapsed, *duration);

                // Each side sees the mask only if it asked for it; a
                // mask-free effect must not start receiving one just
                // because the other side of the fade needs it.
                let ctx_from = EffectCtx {
                    audio,
                    mask: if from.needs_mask { mask } else { None },
                    time,
                };
                let ctx_to = EffectCtx {
                    audio,
                    mask: if to.needs_mask { mask } else { None },
                    time,
                };

                self.tmp_a = input.clone();
                self.tmp_b = input.clone();
                if let Err(err) = from.effect.process(&ctx_from, input, &mut self.tmp_a) {
                    let failure = EngineError::EffectFailed {
                        effect: from.name.clone(),
                        reason: err.to_string(),
                    };
                    tracing::warn!(%failure, "outgoing side failed; falling back to passthrough");
                    self.state = State::Idle;
                    self.last_failure = Some(failure);
                    return input.clone();
                }
                if let Err(err) = to.effect.process(&ctx_to, input, &mut self.tmp_b) {
                    let failure = EngineError::EffectFailed {
                        effect: to.name.clone(),
                        reason: err.to_string(),
                    };
                    tracing::warn!(%failure, "incoming side failed; falling back to passthrough");
                    self.state = State::Idle;
                    self.last_failure = Some(failure);
                    return input.clone();
                }

                let mut out = input.clone();
                blend_rgba(&self.tmp_a.data, &self.tmp_b.data, weight, &mut out.data);

                if weight >= 1.0 {
                    let done = std::mem::replace(
                        &mut self.state,
                        State::Idle,
                    );
                    if let State::Transitioning { to, .. } = done {
                        tracing::debug!(effect = %to.name, "transition complete");
                        self.state = State::Active(to);
                    }
                }
                out
            }
        }
    }
}

/// Identity effect standing in for "no effect" when a transition starts
/// from Idle.
struct Passthrough;

impl Effect for Passthrough {
    fn process(
        &mut self,
        _ctx: &EffectCtx,
        input: &Frame,
        out: &mut Frame,
    ) -> Result<(), crate::effects::EffectError> {
        if out.data.len() != input.data.len() {
            out.data.resize(input.data.len(), 0);
            out.width = input.width;
            out.height = input.height;
        }
        out.data.copy_from_slice(&input.data);
        Ok(())
    }
}

fn blend_rgba(a: &[u8], b: &[u8], weight: f32, out: &mut [u8]) {
    let w = weight.clamp(0.0, 1.0);
    for ((pa, pb), po) in a.iter().zip(b).zip(out.iter_mut()) {
        *po = (*pa as f32 + (*pb as f32 - *pa as f32) * w) as u8;
    }
}
