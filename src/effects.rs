use crate::audio::AudioState;
use crate::frame::Frame;
use crate::segmentation::Mask;
use std::fmt;

/// Everything an effect may read during one tick. The mask is present only
/// when the effect declared `Capability::SegmentationMask`.
pub struct EffectCtx<'a> {
    pub audio: &'a AudioState,
    pub mask: Option<&'a Mask>,
    /// Seconds since pipeline start, for phase animation.
    pub time: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectError {
    /// The effect needed a segmentation mask and none was supplied.
    MaskMissing,
    /// The effect could not produce output for this frame.
    Render(String),
}

impl fmt::Display for EffectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaskMissing => write!(f, "segmentation mask missing"),
            Self::Render(msg) => write!(f, "render failed: {msg}"),
        }
    }
}

impl std::error::Error for EffectError {}

/// A frame transform. Implementations may keep per-instance state (feedback
/// buffers, phase); the engine constructs a fresh instance on every
/// activation, so state never leaks across activations.
pub trait Effect: Send {
    fn process(&mut self, ctx: &EffectCtx, input: &Frame, out: &mut Frame)
        -> Result<(), EffectError>;
}

/// Optional pipeline services an effect needs per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    SegmentationMask,
}

/// Registry entry: a stable name, required capabilities, and a factory that
/// builds a fresh instance per activation.
#[derive(Clone)]
pub struct EffectDescriptor {
    pub name: &'static str,
    pub capabilities: &'static [Capability],
    pub factory: fn() -> Box<dyn Effect>,
}

pub fn builtin_effects() -> Vec<EffectDescriptor> {
    vec![
        EffectDescriptor {
            name: "invert",
            capabilities: &[],
            factory: || Box::new(Invert),
        },
        EffectDescriptor {
            name: "mirror",
            capabilities: &[],
            factory: || Box::new(Mirror::new()),
        },
        EffectDescriptor {
            name: "pixelate",
            capabilities: &[],
            factory: || Box::new(Pixelate::new()),
        },
        EffectDescriptor {
            name: "hueshift",
            capabilities: &[],
            factory: || Box::new(HueShift::new()),
        },
        EffectDescriptor {
            name: "trails",
            capabilities: &[],
            factory: || Box::new(Trails::new()),
        },
        EffectDescriptor {
            name: "background",
            capabilities: &[Capability::SegmentationMask],
            factory: || Box::new(Background::new()),
        },
    ]
}

pub(crate) fn lerp_u8(a: u8, b: u8, t: f32) -> u8 {
    let t = t.clamp(0.0, 1.0);
    (a as f32 + (b as f32 - a as f32) * t) as u8
}

fn fit_output(input: &Frame, out: &mut Frame) {
    if out.width != input.width || out.height != input.height {
        out.width = input.width;
        out.height = input.height;
        out.data.resize(input.len_bytes(), 0);
    }
    out.timestamp = input.timestamp;
    out.seq = input.seq;
}

/// Full color inversion.
pub struct Invert;

impl Effect for Invert {
    fn process(
        &mut self,
        _ctx: &EffectCtx,
        input: &Frame,
        out: &mut Frame,
    ) -> Result<(), EffectError> {
        fit_output(input, out);
        for (src, dst) in input.data.chunks_exact(4).zip(out.data.chunks_exact_mut(4)) {
            dst[0] = 255 - src[0];
            dst[1] = 255 - src[1];
            dst[2] = 255 - src[2];
            dst[3] = src[3];
        }
        Ok(())
    }
}

/// Mirrors one half of the frame onto the other; each beat flips the axis.
pub struct Mirror {
    flips: u32,
}

impl Mirror {
    pub fn new() -> Self {
        Self { flips: 0 }
    }
}

impl Effect for Mirror {
    fn process(
        &mut self,
        ctx: &EffectCtx,
        input: &Frame,
        out: &mut Frame,
    ) -> Result<(), EffectError> {
        fit_output(input, out);
        if ctx.audio.beat {
            self.flips = self.flips.wrapping_add(1);
        }
        let w = input.width;
        let h = input.height;
        let vertical = self.flips % 2 == 0;

        for y in 0..h {
            for x in 0..w {
                let (sx, sy) = if vertical {
                    (if x < w / 2 { x } else { w - 1 - x }, y)
                } else {
                    (x, if y < h / 2 { y } else { h - 1 - y })
                };
                let si = (sy * w + sx) * 4;
                let di = (y * w + x) * 4;
                out.data[di..di + 4].copy_from_slice(&input.data[si..si + 4]);
            }
        }
        Ok(())
    }
}

/// Beat-pulsed mosaic: each beat kicks the block size up, then it decays
/// back toward a passthrough.
pub struct Pixelate {
    pulse: f32,
}

impl Pixelate {
    pub fn new() -> Self {
        Self { pulse: 0.0 }
    }
}

impl Effect for Pixelate {
    fn process(
        &mut self,
        ctx: &EffectCtx,
        input: &Frame,
        out: &mut Frame,
    ) -> Result<(), EffectError> {
        fit_output(input, out);
        if ctx.audio.beat {
            self.pulse = (0.4 + ctx.audio.beat_strength).min(1.0);
        } else {
            self.pulse *= 0.85;
        }

        let block = 1 + (self.pulse * 24.0) as usize;
        if block <= 1 {
            out.data.copy_from_slice(&input.data);
            return Ok(());
        }

        let w = input.width;
        let h = input.height;
        for y in 0..h {
            let sy = (y / block) * block;
            for x in 0..w {
                let sx = (x / block) * block;
                let si = (sy * w + sx) * 4;
                let di = (y * w + x) * 4;
                out.data[di..di + 4].copy_from_slice(&input.data[si..si + 4]);
            }
        }
        Ok(())
    }
}

/// Continuous hue rotation whose speed follows energy. Implemented as a
/// fractional channel rotation (R -> G -> B), cheap enough for per-pixel
/// work at full resolution.
pub struct HueShift {
    phase: f32,
}

impl HueShift {
    pub fn new() -> Self {
        Self { phase: 0.0 }
    }
}

impl Effect for HueShift {
    fn process(
        &mut self,
        ctx: &EffectCtx,
        input: &Frame,
        out: &mut Frame,
    ) -> Result<(), EffectError> {
        fit_output(input, out);
        self.phase = (self.phase + 0.01 + ctx.audio.energy * 0.08) % 3.0;
        let step = self.phase as usize % 3;
        let frac = self.phase.fract();

        for (src, dst) in input.data.chunks_exact(4).zip(out.data.chunks_exact_mut(4)) {
            let rgb = [src[0], src[1], src[2]];
            for c in 0..3 {
                let a = rgb[(c + step) % 3];
                let b = rgb[(c + step + 1) % 3];
                dst[c] = lerp_u8(a, b, frac);
            }
            dst[3] = src[3];
        }
        Ok(())
    }
}

/// Feedback echo: bright pixels persist across frames and fade out. Higher
/// energy holds the trails longer.
pub struct Trails {
    prev: Vec<u8>,
}

impl Trails {
    pub fn new() -> Self {
        Self { prev: Vec::new() }
    }
}

impl Effect for Trails {
    fn process(
        &mut self,
        ctx: &EffectCtx,
        input: &Frame,
        out: &mut Frame,
    ) -> Result<(), EffectError> {
        fit_output(input, out);
        if self.prev.len() != input.data.len() {
            self.prev = input.data.clone();
        }

        let decay = 0.80 + ctx.audio.energy * 0.17;
        for i in (0..input.data.len()).step_by(4) {
            for c in 0..3 {
                let faded = (self.prev[i + c] as f32 * decay) as u8;
                out.data[i + c] = input.data[i + c].max(faded);
            }
            out.data[i + 3] = input.data[i + 3];
        }
        self.prev.copy_from_slice(&out.data);
        Ok(())
    }
}

/// Replaces the background (low mask coverage) with an animated gradient
/// while the foreground passes through. Requires a segmentation mask. The
/// gradient phase runs on the pipeline clock, nudged ahead by energy.
pub struct Background;

impl Background {
    pub fn new() -> Self {
        Self
    }
}

impl Effect for Background {
    fn process(
        &mut self,
        ctx: &EffectCtx,
        input: &Frame,
        out: &mut Frame,
    ) -> Result<(), EffectError> {
        let mask = ctx.mask.ok_or(EffectError::MaskMissing)?;
        if mask.width != input.width || mask.height != input.height {
            return Err(EffectError::Render(format!(
                "mask {}x{} does not match frame {}x{}",
                mask.width, mask.height, input.width, input.height
            )));
        }
        fit_output(input, out);
        let phase = ctx.time * 0.6 + ctx.audio.energy * 2.0;

        let w = input.width;
        let h = input.height;
        for y in 0..h {
            let fy = y as f32 / h.max(1) as f32;
            for x in 0..w {
                let fx = x as f32 / w.max(1) as f32;
                let p = y * w + x;
                let i = p * 4;
                let cover = mask.data[p] as f32 / 255.0;

                let bg_r = ((fx * 4.0 + phase).sin() * 0.5 + 0.5) * 180.0;
                let bg_g = ((fy * 3.0 - phase * 0.7).sin() * 0.5 + 0.5) * 120.0;
                let bg_b = (((fx + fy) * 3.0 + phase * 1.3).cos() * 0.5 + 0.5) * 220.0;

                out.data[i] = lerp_u8(bg_r as u8, input.data[i], cover);
                out.data[i + 1] = lerp_u8(bg_g as u8, input.data[i + 1], cover);
                out.data[i + 2] = lerp_u8(bg_b as u8, input.data[i + 2], cover);
                out.data[i + 3] = 255;
            }
        }
        Ok(())
    }
}
