use crate::frame::SourceError;
use anyhow::{anyhow, Context};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SampleFormat};
use ringbuf::traits::{Consumer as _, Producer as _, Split as _};
use ringbuf::HeapRb;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Samples per published AudioBlock. At 44.1 kHz this is ~23 ms of audio.
pub const BLOCK_SIZE: usize = 1024;

/// Fixed-size window of mono samples with a source-assigned capture time.
#[derive(Debug, Clone)]
pub struct AudioBlock {
    pub samples: Vec<f32>,
    pub sample_rate_hz: u32,
    pub timestamp: Instant,
}

/// Latest rolling audio analysis, published after every AudioBlock.
/// `beat` is true for exactly one publish following a detected beat.
#[derive(Debug, Clone, Copy)]
pub struct AudioState {
    pub energy: f32,
    pub beat: bool,
    pub beat_strength: f32,
    pub bands: [f32; 8],
    pub tempo_bpm: f32,
}

impl Default for AudioState {
    fn default() -> Self {
        Self {
            energy: 0.0,
            beat: false,
            beat_strength: 0.0,
            bands: [0.0; 8],
            tempo_bpm: 0.0,
        }
    }
}

impl AudioState {
    /// Staleness policy applied at the reader: past the staleness window the
    /// beat flag is forced false and energy decays exponentially toward
    /// silence instead of sticking at its last value.
    pub fn degraded(mut self, age: Duration, staleness: Duration) -> Self {
        if age <= staleness {
            return self;
        }
        let over = (age - staleness).as_secs_f32();
        let scale = (-6.0 * over).exp();
        self.energy *= scale;
        for b in &mut self.bands {
            *b *= scale;
        }
        self.beat = false;
        self.beat_strength = 0.0;
        self
    }
}

/// Single-slot latest-wins snapshot: one writer (beat detector thread), many
/// readers (pipeline). Seqlock over f32-as-bits atomics; readers never block
/// the writer and never observe a torn state.
pub struct AtomicAudioState {
    seq: AtomicU64,
    energy: AtomicU32,
    beat: AtomicU32,
    beat_strength: AtomicU32,
    bands: [AtomicU32; 8],
    tempo_bpm: AtomicU32,
    updated_ms: AtomicU64,
}

impl AtomicAudioState {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            energy: AtomicU32::new(0),
            beat: AtomicU32::new(0),
            beat_strength: AtomicU32::new(0),
            bands: std::array::from_fn(|_| AtomicU32::new(0)),
            tempo_bpm: AtomicU32::new(0),
            updated_ms: AtomicU64::new(0),
        }
    }

    pub fn store(&self, s: AudioState) {
        self.seq.fetch_add(1, Ordering::Release); // odd => write in progress
        self.energy.store(s.energy.to_bits(), Ordering::Relaxed);
        self.beat.store(if s.beat { 1 } else { 0 }, Ordering::Relaxed);
        self.beat_strength
            .store(s.beat_strength.to_bits(), Ordering::Relaxed);
        for (dst, src) in self.bands.iter().zip(s.bands) {
            dst.store(src.to_bits(), Ordering::Relaxed);
        }
        self.tempo_bpm.store(s.tempo_bpm.to_bits(), Ordering::Relaxed);
        self.updated_ms.store(now_ms(), Ordering::Relaxed);
        self.seq.fetch_add(1, Ordering::Release); // even => stable
    }

    pub fn load(&self) -> AudioState {
        loop {
            let v1 = self.seq.load(Ordering::Acquire);
            if v1 & 1 == 1 {
                continue;
            }

            let energy = f32::from_bits(self.energy.load(Ordering::Relaxed));
            let beat = self.beat.load(Ordering::Relaxed) != 0;
            let beat_strength = f32::from_bits(self.beat_strength.load(Ordering::Relaxed));
            let mut bands = [0.0f32; 8];
            for (i, src) in self.bands.iter().enumerate() {
                bands[i] = f32::from_bits(src.load(Ordering::Relaxed));
            }
            let tempo_bpm = f32::from_bits(self.tempo_bpm.load(Ordering::Relaxed));

            let v2 = self.seq.load(Ordering::Acquire);
            if v1 == v2 {
                return AudioState {
                    energy,
                    beat,
                    beat_strength,
                    bands,
                    tempo_bpm,
                };
            }
        }
    }

    pub fn age(&self) -> Duration {
        let t = self.updated_ms.load(Ordering::Relaxed);
        if t == 0 {
            // Nothing published yet; report far in the past so readers treat
            // it as silence from the start.
            return Duration::from_secs(3600);
        }
        Duration::from_millis(now_ms().saturating_sub(t))
    }

    /// Latest state with the staleness policy applied.
    pub fn sample(&self, staleness: Duration) -> AudioState {
        self.load().degraded(self.age(), staleness)
    }
}

impl Default for AtomicAudioState {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_millis(0))
        .as_millis() as u64
}

/// A microphone-like input. `next_block` blocks for at most `timeout`;
/// disconnection surfaces as `SourceError::Unavailable`.
pub trait AudioSource: Send {
    fn next_block(&mut self, timeout: Duration) -> Result<AudioBlock, SourceError>;
    fn sample_rate_hz(&self) -> u32;
}

pub fn list_input_devices() -> anyhow::Result<()> {
    let host = cpal::default_host();
    let devices = host.input_devices().context("enumerate input devices")?;

    let mut out = io::stdout();
    writeln!(out, "Input devices:")?;
    for dev in devices {
        let name = dev.name().unwrap_or_else(|_| "<unknown>".to_string());
        writeln!(out, "  - {}", name)?;
    }
    Ok(())
}

/// Consumer side of the capture ring buffer; the half of the mic that is
/// allowed to cross into the detector thread (the cpal stream itself stays
/// with `AudioSystem`).
pub struct RingSource {
    cons: ringbuf::HeapCons<f32>,
    sample_rate_hz: u32,
    failed: Arc<AtomicBool>,
}

impl AudioSource for RingSource {
    fn next_block(&mut self, timeout: Duration) -> Result<AudioBlock, SourceError> {
        if self.failed.load(Ordering::Relaxed) {
            return Err(SourceError::Unavailable);
        }

        let deadline = Instant::now() + timeout;
        let mut samples = Vec::with_capacity(BLOCK_SIZE);
        loop {
            while samples.len() < BLOCK_SIZE {
                match self.cons.try_pop() {
                    Some(s) => samples.push(s),
                    None => break,
                }
            }
            if samples.len() == BLOCK_SIZE {
                return Ok(AudioBlock {
                    samples,
                    sample_rate_hz: self.sample_rate_hz,
                    timestamp: Instant::now(),
                });
            }
            if Instant::now() >= deadline {
                return Err(SourceError::Timeout);
            }
            if self.failed.load(Ordering::Relaxed) {
                return Err(SourceError::Unavailable);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }
}

/// Tunables for the energy-threshold beat detector.
#[derive(Debug, Clone, Copy)]
pub struct BeatConfig {
    /// Multiplier over the local average energy required to flag a beat.
    pub threshold: f32,
    /// Minimum interval between consecutive beat flags.
    pub refractory: Duration,
    /// Length of the rolling energy history, in blocks.
    pub history_len: usize,
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            threshold: 1.5,
            refractory: Duration::from_millis(100),
            history_len: 43,
        }
    }
}

/// Consumes AudioBlocks, maintains a rolling energy history, and produces an
/// AudioState per block. A beat fires when instantaneous energy exceeds the
/// local average by the configured factor (with a variance guard against
/// noisy floors), at most once per refractory interval.
pub struct BeatDetector {
    cfg: BeatConfig,
    energy_history: VecDeque<f32>,
    beat_times: VecDeque<Instant>,
    last_beat: Option<Instant>,
    tempo_bpm: f32,
    fft: Arc<dyn rustfft::Fft<f32>>,
    fft_buf: Vec<Complex<f32>>,
    hann: Vec<f32>,
}

impl BeatDetector {
    pub fn new(cfg: BeatConfig) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(BLOCK_SIZE);
        let hann = (0..BLOCK_SIZE)
            .map(|i| 0.5 - 0.5 * ((2.0 * PI * i as f32) / (BLOCK_SIZE as f32)).cos())
            .collect();
        Self {
            cfg,
            energy_history: VecDeque::with_capacity(cfg.history_len.max(1)),
            beat_times: VecDeque::with_capacity(20),
            last_beat: None,
            tempo_bpm: 0.0,
            fft,
            fft_buf: vec![Complex { re: 0.0, im: 0.0 }; BLOCK_SIZE],
            hann,
        }
    }

    /// Analyze one block at time `now` and return the state to publish.
    pub fn process_block(&mut self, block: &AudioBlock, now: Instant) -> AudioState {
        let energy = rms(&block.samples);
        let beat = self.detect_beat(energy, now);
        if beat {
            self.note_beat(now);
        }
        let bands = self.analyze_bands(&block.samples, block.sample_rate_hz);

        let beat_strength = if beat {
            let avg = self.local_average().max(1e-6);
            ((energy / avg - 1.0) / self.cfg.threshold).clamp(0.0, 1.0)
        } else {
            0.0
        };

        AudioState {
            energy: energy.clamp(0.0, 1.0),
            beat,
            beat_strength,
            bands,
            tempo_bpm: self.tempo_bpm,
        }
    }

    fn local_average(&self) -> f32 {
        let n = self.energy_history.len();
        if n == 0 {
            return 0.0;
        }
        self.energy_history.iter().sum::<f32>() / n as f32
    }

    fn detect_beat(&mut self, energy: f32, now: Instant) -> bool {
        // Local average over history *before* this block contributes.
        let n = self.energy_history.len();
        let avg = self.local_average();

        let variance_guard = if n >= 4 {
            let var = self
                .energy_history
                .iter()
                .map(|e| (e - avg) * (e - avg))
                .sum::<f32>()
                / n as f32;
            1.0 + var.sqrt() * 0.5
        } else {
            1.0
        };

        self.energy_history.push_back(energy);
        while self.energy_history.len() > self.cfg.history_len.max(1) {
            self.energy_history.pop_front();
        }

        // Need some history before trusting the average.
        if n < 10 {
            return false;
        }

        let threshold = self.cfg.threshold.max(variance_guard);
        if energy <= avg * threshold {
            return false;
        }

        match self.last_beat {
            Some(t) if now.duration_since(t) < self.cfg.refractory => false,
            _ => {
                self.last_beat = Some(now);
                true
            }
        }
    }

    fn note_beat(&mut self, now: Instant) {
        self.beat_times.push_back(now);
        while self.beat_times.len() > 20 {
            self.beat_times.pop_front();
        }
        if self.beat_times.len() > 4 {
            let mut total = Duration::ZERO;
            let mut n = 0u32;
            for pair in self.beat_times.iter().zip(self.beat_times.iter().skip(1)) {
                total += pair.1.duration_since(*pair.0);
                n += 1;
            }
            if n > 0 {
                let avg = total.as_secs_f32() / n as f32;
                if avg > 1e-3 {
                    let bpm = 60.0 / avg;
                    self.tempo_bpm = if self.tempo_bpm == 0.0 {
                        bpm
                    } else {
                        self.tempo_bpm * 0.8 + bpm * 0.2
                    };
                }
            }
        }
    }

    fn analyze_bands(&mut self, samples: &[f32], sample_rate_hz: u32) -> [f32; 8] {
        let n = BLOCK_SIZE;
        for i in 0..n {
            let s = samples.get(i).copied().unwrap_or(0.0);
            self.fft_buf[i].re = s * self.hann[i];
            self.fft_buf[i].im = 0.0;
        }
        self.fft.process(&mut self.fft_buf);

        let half = n / 2;
        let edges_hz = [20.0, 60.0, 150.0, 400.0, 1000.0, 2500.0, 6000.0, 12000.0, 20000.0];
        let mut bands = [0.0f32; 8];
        let mut counts = [0u32; 8];
        let sr = sample_rate_hz.max(1) as f32;
        for i in 1..half {
            let f = (i as f32) * sr / (n as f32);
            if f < edges_hz[0] {
                continue;
            }
            if f >= edges_hz[8] {
                break;
            }
            let mut band = 0usize;
            while band + 1 < edges_hz.len() - 1 && f >= edges_hz[band + 1] {
                band += 1;
            }
            let c = self.fft_buf[i];
            bands[band] += (c.re * c.re + c.im * c.im).sqrt();
            counts[band] += 1;
        }
        for i in 0..bands.len() {
            let denom = counts[i].max(1) as f32;
            bands[i] = ((bands[i] / denom) * 0.01).tanh();
        }
        bands
    }
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let acc = samples.iter().map(|s| s * s).sum::<f32>();
    (acc / samples.len() as f32).sqrt()
}

/// Detector loop body: pull blocks, analyze, publish. Timeouts simply skip a
/// publish (the reader's staleness policy covers the gap); `Unavailable`
/// ends the loop since the owning `AudioSystem` is being torn down anyway.
pub fn run_detector(
    mut source: impl AudioSource,
    mut detector: BeatDetector,
    snapshot: Arc<AtomicAudioState>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        match source.next_block(Duration::from_millis(200)) {
            Ok(block) => {
                let state = detector.process_block(&block, Instant::now());
                snapshot.store(state);
            }
            Err(SourceError::Timeout) => {}
            Err(SourceError::Unavailable) => {
                tracing::warn!("audio source unavailable; detector stopping");
                return;
            }
        }
    }
}

/// Microphone capture plus the beat-detection thread. The cpal stream lives
/// here for the whole lifetime; Drop stops the detector, joins it, and
/// releases the device handle.
pub struct AudioSystem {
    _stream: cpal::Stream,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    snapshot: Arc<AtomicAudioState>,
    pub sample_rate_hz: u32,
}

impl AudioSystem {
    pub fn start(device_query: Option<&str>, beat_cfg: BeatConfig) -> anyhow::Result<Self> {
        let host = cpal::default_host();
        let device = select_input_device(&host, device_query)?;
        let supported = device
            .default_input_config()
            .context("get default input config")?;
        let sample_rate_hz = supported.sample_rate().0;
        let channels = supported.channels() as usize;
        let config: cpal::StreamConfig = supported.clone().into();

        let rb = HeapRb::<f32>::new((sample_rate_hz as usize).saturating_mul(4));
        let (mut prod, cons) = rb.split();

        let failed = Arc::new(AtomicBool::new(false));
        let failed_for_err = Arc::clone(&failed);
        let err_fn = move |err| {
            tracing::warn!("audio stream error: {err}");
            failed_for_err.store(true, Ordering::Relaxed);
        };

        let stream = match supported.sample_format() {
            SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _| push_interleaved(data, channels, &mut prod),
                err_fn,
                None,
            )?,
            SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _| push_interleaved(data, channels, &mut prod),
                err_fn,
                None,
            )?,
            SampleFormat::U16 => device.build_input_stream(
                &config,
                move |data: &[u16], _| push_interleaved(data, channels, &mut prod),
                err_fn,
                None,
            )?,
            fmt => return Err(anyhow!("unsupported sample format: {fmt:?}")),
        };
        stream.play().context("start input stream")?;

        let snapshot = Arc::new(AtomicAudioState::new());
        let stop = Arc::new(AtomicBool::new(false));
        let ring = RingSource {
            cons,
            sample_rate_hz,
            failed,
        };
        let detector = BeatDetector::new(beat_cfg);
        let snapshot_for_thread = Arc::clone(&snapshot);
        let stop_for_thread = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            run_detector(ring, detector, snapshot_for_thread, stop_for_thread)
        });

        Ok(Self {
            _stream: stream,
            stop,
            handle: Some(handle),
            snapshot,
            sample_rate_hz,
        })
    }

    pub fn snapshot(&self) -> Arc<AtomicAudioState> {
        Arc::clone(&self.snapshot)
    }
}

impl Drop for AudioSystem {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn select_input_device(
    host: &cpal::Host,
    device_query: Option<&str>,
) -> anyhow::Result<cpal::Device> {
    let devices = host
        .input_devices()
        .context("enumerate input devices")?
        .collect::<Vec<_>>();

    let want = device_query.map(|s| s.to_lowercase());
    if let Some(want) = want.as_deref() {
        if let Some(dev) = devices.iter().find(|d| {
            d.name()
                .map(|n| n.to_lowercase().contains(want))
                .unwrap_or(false)
        }) {
            return Ok(dev.clone());
        }
        return Err(anyhow!("no input device matching: {want}"));
    }

    host.default_input_device()
        .ok_or_else(|| anyhow!("no default input device found"))
}

fn push_interleaved<T: Sample<Float = f32> + Copy>(
    data: &[T],
    channels: usize,
    prod: &mut ringbuf::HeapProd<f32>,
) {
    for frame in data.chunks(channels.max(1)) {
        let mut acc = 0.0f32;
        for s in frame {
            acc += (*s).to_float_sample();
        }
        let mono = acc / channels.max(1) as f32;
        let _ = prod.try_push(mono);
    }
}
