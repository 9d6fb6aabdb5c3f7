use std::fmt;
use std::time::{Duration, Instant};

/// One captured video frame. Pixels are tightly packed RGBA. The timestamp
/// and sequence number are assigned by the source at capture time and are
/// never rewritten downstream, so late or duplicate frames stay detectable.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
    pub timestamp: Instant,
    pub seq: u64,
}

impl Frame {
    pub fn new(width: usize, height: usize, timestamp: Instant, seq: u64) -> Self {
        Self {
            width,
            height,
            data: vec![0; width * height * 4],
            timestamp,
            seq,
        }
    }

    pub fn len_bytes(&self) -> usize {
        self.width * self.height * 4
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceError {
    /// No data arrived within the bounded wait. Transient; retry.
    Timeout,
    /// The source is gone (camera unplugged, stream dropped). Recoverable:
    /// subsequent calls re-attempt the connection.
    Unavailable,
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "source read timed out"),
            Self::Unavailable => write!(f, "source unavailable"),
        }
    }
}

impl std::error::Error for SourceError {}

/// A camera or network video stream. `next_frame` blocks for at most
/// `timeout` and must never reassign capture timestamps. Implementations
/// signal disconnection with `SourceError::Unavailable` instead of
/// terminating, and reconnect internally on later calls.
pub trait FrameSource: Send {
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, SourceError>;
}

/// Deterministic procedural stand-in for a camera: a drifting color field
/// with enough structure that every built-in effect visibly does something.
/// Frame content is a pure function of the sequence number.
pub struct PatternSource {
    width: usize,
    height: usize,
    seq: u64,
}

impl PatternSource {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width: width.max(2),
            height: height.max(2),
            seq: 0,
        }
    }
}

impl FrameSource for PatternSource {
    fn next_frame(&mut self, _timeout: Duration) -> Result<Frame, SourceError> {
        let mut frame = Frame::new(self.width, self.height, Instant::now(), self.seq);
        let t = self.seq as f32 * (1.0 / 30.0);
        let wf = self.width as f32;
        let hf = self.height as f32;

        for y in 0..self.height {
            let ny = ((y as f32 + 0.5) / hf) * 2.0 - 1.0;
            for x in 0..self.width {
                let nx = ((x as f32 + 0.5) / wf) * 2.0 - 1.0;
                let r1 = (nx * 3.1 + t * 0.9).sin();
                let r2 = (ny * 2.7 - t * 0.7).cos();
                let r3 = ((nx * nx + ny * ny).sqrt() * 5.0 - t * 1.3).sin();
                let i = (y * self.width + x) * 4;
                frame.data[i] = ((r1 * 0.5 + 0.5) * 255.0) as u8;
                frame.data[i + 1] = ((r2 * 0.5 + 0.5) * 255.0) as u8;
                frame.data[i + 2] = ((r3 * 0.5 + 0.5) * 255.0) as u8;
                frame.data[i + 3] = 255;
            }
        }

        self.seq += 1;
        Ok(frame)
    }
}

/// Glitch processor applied to the raw stream before the effect stage.
/// Level 0 is a no-op passthrough; 100 is maximum block displacement and
/// chroma tearing. Deterministic given (level, frame seq).
pub struct Distortion {
    level: u8,
}

impl Distortion {
    pub fn new(level: u8) -> Self {
        Self {
            level: level.min(100),
        }
    }

    pub fn set_level(&mut self, level: u8) {
        self.level = level.min(100);
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn apply(&self, frame: &mut Frame) {
        if self.level == 0 {
            return;
        }
        let drive = self.level as f32 / 100.0;
        let w = frame.width;
        let h = frame.height;
        if w == 0 || h == 0 {
            return;
        }

        let block = ((12.0 - 8.0 * drive) as usize).max(3);
        let amp = (drive * 18.0).max(1.0);
        let seed = (frame.seq as u32).wrapping_mul(0x9E37_79B9);
        let src = frame.data.clone();

        for y in 0..h {
            let by = (y / block) as u32;
            for x in 0..w {
                let bx = (x / block) as u32;
                let r = hash_u32(bx, by, seed);
                // Only a fraction of blocks tear; the rest pass through.
                if (r & 0xFF) as f32 > drive * 255.0 {
                    continue;
                }
                let rx = (((r >> 8) & 0xFF) as f32 / 255.0) * 2.0 - 1.0;
                let ry = (((r >> 16) & 0xFF) as f32 / 255.0) * 2.0 - 1.0;
                let sx = (x as isize + (rx * amp) as isize).clamp(0, w as isize - 1) as usize;
                let sy = (y as isize + (ry * amp) as isize).clamp(0, h as isize - 1) as usize;

                let split = (1 + (drive * 2.0) as usize).min(4);
                let sxr = (sx + split).min(w - 1);
                let sxb = sx.saturating_sub(split);

                let di = (y * w + x) * 4;
                frame.data[di] = src[(sy * w + sxr) * 4];
                frame.data[di + 1] = src[(sy * w + sx) * 4 + 1];
                frame.data[di + 2] = src[(sy * w + sxb) * 4 + 2];
                frame.data[di + 3] = 255;
            }
        }
    }
}

fn hash_u32(x: u32, y: u32, seed: u32) -> u32 {
    // Deterministic 2D hash (not crypto).
    let mut n = x.wrapping_mul(374_761_393) ^ y.wrapping_mul(668_265_263) ^ seed.wrapping_mul(0x9E37_79B9);
    n ^= n >> 13;
    n = n.wrapping_mul(1_274_126_177);
    n ^ (n >> 16)
}
