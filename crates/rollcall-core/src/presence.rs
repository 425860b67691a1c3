//! Presence detection strategies.
//!
//! A strategy is selected once per session by [`select_detector`] and held as
//! a `Box<dyn PresenceDetector>`; the sampler never re-probes per tick.

use crate::config::HeuristicConfig;
use crate::source::Frame;

/// Produces the boolean "subject present" signal from a luminance frame.
pub trait PresenceDetector: Send {
    /// Strategy identifier, reported in session status.
    fn name(&self) -> &'static str;

    fn is_present(&mut self, frame: &Frame) -> bool;
}

/// Mean and variance of luminance over a region of interest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LumaStats {
    pub mean: f32,
    pub variance: f32,
    pub pixels: usize,
}

/// Compute luminance statistics over a centred region covering `roi_fraction`
/// of each dimension (clamped to (0, 1]).
pub fn roi_stats(gray: &[u8], width: u32, height: u32, roi_fraction: f32) -> LumaStats {
    let w = width as usize;
    let h = height as usize;
    if w == 0 || h == 0 || gray.len() < w * h {
        return LumaStats {
            mean: 0.0,
            variance: 0.0,
            pixels: 0,
        };
    }

    let fraction = roi_fraction.clamp(f32::MIN_POSITIVE, 1.0);
    let roi_w = ((w as f32 * fraction).round() as usize).clamp(1, w);
    let roi_h = ((h as f32 * fraction).round() as usize).clamp(1, h);
    let x0 = (w - roi_w) / 2;
    let y0 = (h - roi_h) / 2;

    // Two-pass in f64: exact enough for 8-bit data at any realistic resolution.
    let mut sum = 0f64;
    for y in y0..y0 + roi_h {
        let row = &gray[y * w + x0..y * w + x0 + roi_w];
        sum += row.iter().map(|&p| p as f64).sum::<f64>();
    }
    let n = (roi_w * roi_h) as f64;
    let mean = sum / n;

    let mut sq = 0f64;
    for y in y0..y0 + roi_h {
        let row = &gray[y * w + x0..y * w + x0 + roi_w];
        sq += row.iter().map(|&p| (p as f64 - mean).powi(2)).sum::<f64>();
    }

    LumaStats {
        mean: mean as f32,
        variance: (sq / n) as f32,
        pixels: roi_w * roi_h,
    }
}

/// Luminance heuristic used when the platform has no face-presence primitive.
///
/// An empty, evenly lit (or dark) scene has low variance in the centre of the
/// frame; a face in the centre raises both mean and variance.
#[derive(Debug, Clone)]
pub struct HeuristicDetector {
    config: HeuristicConfig,
}

impl HeuristicDetector {
    pub fn new(config: HeuristicConfig) -> Self {
        Self { config }
    }

    pub fn evaluate(&self, frame: &Frame) -> (bool, LumaStats) {
        let stats = roi_stats(&frame.data, frame.width, frame.height, self.config.roi_fraction);
        let present = stats.pixels > 0
            && stats.mean > self.config.mean_threshold
            && stats.variance > self.config.variance_threshold;
        (present, stats)
    }
}

impl PresenceDetector for HeuristicDetector {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn is_present(&mut self, frame: &Frame) -> bool {
        let (present, stats) = self.evaluate(frame);
        tracing::trace!(
            mean = stats.mean,
            variance = stats.variance,
            present,
            "heuristic presence sample"
        );
        present
    }
}

/// Wrapper around a platform-provided face-presence primitive.
pub struct NativeDetector {
    name: &'static str,
    probe: Box<dyn FnMut(&Frame) -> bool + Send>,
}

impl NativeDetector {
    pub fn new(name: &'static str, probe: impl FnMut(&Frame) -> bool + Send + 'static) -> Self {
        Self {
            name,
            probe: Box::new(probe),
        }
    }
}

impl PresenceDetector for NativeDetector {
    fn name(&self) -> &'static str {
        self.name
    }

    fn is_present(&mut self, frame: &Frame) -> bool {
        (self.probe)(frame)
    }
}

/// Pick the presence strategy for a session: the native primitive when the
/// platform offers one, the luminance heuristic otherwise.
pub fn select_detector(
    native: Option<NativeDetector>,
    fallback: HeuristicConfig,
) -> Box<dyn PresenceDetector> {
    match native {
        Some(native) => {
            tracing::debug!(strategy = native.name(), "using native presence detector");
            Box::new(native)
        }
        None => {
            tracing::debug!(
                mean_threshold = fallback.mean_threshold,
                variance_threshold = fallback.variance_threshold,
                "no native presence primitive; using luminance heuristic"
            );
            Box::new(HeuristicDetector::new(fallback))
        }
    }
}
