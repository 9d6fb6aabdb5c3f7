use std::time::Instant;
use videojockey::audio::AudioState;
use videojockey::effects::{builtin_effects, Capability, Effect, EffectCtx};
use videojockey::frame::Frame;
use videojockey::registry::{EffectRegistry, RegistryError};
use videojockey::segmentation::Mask;

fn gradient_frame(w: usize, h: usize) -> Frame {
    let mut frame = Frame::new(w, h, Instant::now(), 0);
    for y in 0..h {
        for x in 0..w {
            let i = (y * w + x) * 4;
            frame.data[i] = (x * 255 / w.max(1)) as u8;
            frame.data[i + 1] = (y * 255 / h.max(1)) as u8;
            frame.data[i + 2] = 128;
            frame.data[i + 3] = 255;
        }
    }
    frame
}

fn make(name: &str) -> Box<dyn Effect> {
    let desc = builtin_effects()
        .into_iter()
        .find(|d| d.name == name)
        .unwrap_or_else(|| panic!("missing builtin {name}"));
    (desc.factory)()
}

fn silent_ctx() -> AudioState {
    AudioState::default()
}

#[test]
fn builtin_set_is_complete_and_unique() {
    let descs = builtin_effects();
    assert_eq!(descs.len(), 6);
    for (i, a) in descs.iter().enumerate() {
        for b in &descs[i + 1..] {
            assert_ne!(a.name, b.name);
        }
    }
    let background = descs.iter().find(|d| d.name == "background").unwrap();
    assert_eq!(background.capabilities, &[Capability::SegmentationMask]);
}

#[test]
fn registry_rejects_duplicates_and_unknown_names() {
    let mut registry = EffectRegistry::with_builtins();
    let dup = builtin_effects().into_iter().next().unwrap();
    assert!(matches!(
        registry.register(dup),
        Err(RegistryError::DuplicateName(_))
    ));
    assert!(matches!(
        registry.unregister("nope"),
        Err(RegistryError::NotFound(_))
    ));
    assert!(matches!(
        registry.lookup("nope"),
        Err(RegistryError::NotFound(_))
    ));
    registry.unregister("trails").unwrap();
    assert!(registry.lookup("trails").is_err());
    assert_eq!(registry.len(), 5);
}

#[test]
fn invert_applied_twice_restores_the_input() {
    let audio = silent_ctx();
    let ctx = EffectCtx {
        audio: &audio,
        mask: None,
        time: 0.0,
    };
    let input = gradient_frame(16, 8);
    let mut once = input.clone();
    let mut twice = input.clone();
    make("invert").process(&ctx, &input, &mut once).unwrap();
    make("invert").process(&ctx, &once, &mut twice).unwrap();
    assert_eq!(twice.data, input.data);
    assert_ne!(once.data, input.data);
}

#[test]
fn mirror_output_is_symmetric() {
    let audio = silent_ctx();
    let ctx = EffectCtx {
        audio: &audio,
        mask: None,
        time: 0.0,
    };
    let input = gradient_frame(16, 8);
    let mut out = input.clone();
    make("mirror").process(&ctx, &input, &mut out).unwrap();

    let w = out.width;
    for y in 0..out.height {
        for x in 0..w / 2 {
            let a = (y * w + x) * 4;
            let b = (y * w + (w - 1 - x)) * 4;
            assert_eq!(&out.data[a..a + 4], &out.data[b..b + 4], "asymmetry at {x},{y}");
        }
    }
}

#[test]
fn pixelate_is_identity_in_silence() {
    let audio = silent_ctx();
    let ctx = EffectCtx {
        audio: &audio,
        mask: None,
        time: 0.0,
    };
    let input = gradient_frame(16, 8);
    let mut out = input.clone();
    make("pixelate").process(&ctx, &input, &mut out).unwrap();
    assert_eq!(out.data, input.data);
}

#[test]
fn pixelate_blocks_after_a_beat() {
    let audio = AudioState {
        energy: 0.8,
        beat: true,
        beat_strength: 1.0,
        bands: [0.5; 8],
        tempo_bpm: 120.0,
    };
    let ctx = EffectCtx {
        audio: &audio,
        mask: None,
        time: 0.0,
    };
    let input = gradient_frame(32, 16);
    let mut out = input.clone();
    make("pixelate").process(&ctx, &input, &mut out).unwrap();
    assert_ne!(out.data, input.data);
    // Within one block every pixel matches its block origin.
    assert_eq!(&out.data[0..4], &out.data[4..8]);
}

#[test]
fn hueshift_preserves_alpha() {
    let audio = silent_ctx();
    let ctx = EffectCtx {
        audio: &audio,
        mask: None,
        time: 0.0,
    };
    let input = gradient_frame(8, 8);
    let mut out = input.clone();
    make("hueshift").process(&ctx, &input, &mut out).unwrap();
    for px in out.data.chunks_exact(4) {
        assert_eq!(px[3], 255);
    }
}

#[test]
fn background_keeps_foreground_and_replaces_the_rest() {
    let audio = silent_ctx();
    let input = gradient_frame(8, 8);

    let mut foreground = Mask::new(8, 8);
    foreground.data.fill(255);
    let ctx = EffectCtx {
        audio: &audio,
        mask: Some(&foreground),
        time: 0.0,
    };
    let mut out = input.clone();
    make("background").process(&ctx, &input, &mut out).unwrap();
    assert_eq!(out.data, input.data, "full-coverage mask must pass through");

    let background_only = Mask::new(8, 8);
    let ctx = EffectCtx {
        audio: &audio,
        mask: Some(&background_only),
        time: 0.0,
    };
    let mut out = input.clone();
    make("background").process(&ctx, &input, &mut out).unwrap();
    assert_ne!(out.data, input.data, "zero-coverage mask must repaint");
}

#[test]
fn background_gradient_advances_with_the_clock() {
    let audio = silent_ctx();
    let input = gradient_frame(8, 8);
    let mask = Mask::new(8, 8);

    let mut early = input.clone();
    let ctx = EffectCtx {
        audio: &audio,
        mask: Some(&mask),
        time: 0.0,
    };
    make("background").process(&ctx, &input, &mut early).unwrap();

    let mut late = input.clone();
    let ctx = EffectCtx {
        audio: &audio,
        mask: Some(&mask),
        time: 5.0,
    };
    make("background").process(&ctx, &input, &mut late).unwrap();

    assert_ne!(early.data, late.data, "gradient must move even in silence");
}
