use crate::frame::Frame;

/// Per-pixel foreground coverage, same dimensions as the frame it was
/// computed from. 0 = background, 255 = fully foreground.
#[derive(Debug, Clone)]
pub struct Mask {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl Mask {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0; width * height],
        }
    }
}

/// Produces a foreground mask for a frame. Called only on ticks where the
/// active effect declares the capability, so implementations may be
/// expensive relative to the effects themselves.
pub trait SegmentationProvider: Send {
    fn segment(&mut self, frame: &Frame) -> Mask;
}

/// Luminance-contrast segmenter: pixels far from the rolling scene mean are
/// treated as foreground. Crude next to a learned model, but it is cheap,
/// has no external runtime, and the smoothing keeps the mask stable enough
/// for background replacement on live input.
pub struct LumaSegmenter {
    mean_luma: f32,
    prev: Option<Mask>,
}

impl LumaSegmenter {
    pub fn new() -> Self {
        Self {
            mean_luma: 0.5,
            prev: None,
        }
    }
}

impl Default for LumaSegmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentationProvider for LumaSegmenter {
    fn segment(&mut self, frame: &Frame) -> Mask {
        let w = frame.width;
        let h = frame.height;
        let mut mask = Mask::new(w, h);

        let mut sum = 0.0f32;
        for (p, px) in frame.data.chunks_exact(4).enumerate() {
            let luma =
                (0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32) / 255.0;
            sum += luma;
            let dist = (luma - self.mean_luma).abs();
            // Soft ramp: deviation beyond ~0.15 counts as foreground.
            let v = ((dist - 0.15) * 6.0).clamp(0.0, 1.0);
            mask.data[p] = (v * 255.0) as u8;
        }

        let n = (w * h).max(1) as f32;
        self.mean_luma = self.mean_luma * 0.95 + (sum / n) * 0.05;

        // Temporal smoothing against flicker.
        if let Some(prev) = &self.prev {
            if prev.width == w && prev.height == h {
                for (m, p) in mask.data.iter_mut().zip(&prev.data) {
                    *m = ((*m as u16 * 3 + *p as u16) / 4) as u8;
                }
            }
        }
        self.prev = Some(mask.clone());
        mask
    }
}
