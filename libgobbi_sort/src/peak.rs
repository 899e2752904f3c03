//! Peak search over the channel time histograms.
//!
//! The time calibration data is a pulser run, so every good channel should show two sharp
//! peaks on an almost empty spectrum. The search is done in three steps:
//!
//! 1. Remove the background with the SNIP algorithm (clipping on a log-log-sqrt scale)
//! 2. Smooth with a Markov chain filter, which keeps the peak shapes but removes the
//!    statistical fluctuations
//! 3. Convolve with the second derivative of a Gaussian and take the positive local maxima
//!
//! Peaks below a fraction of the largest peak are dropped. Positions are reported in axis
//! units at the bin center, and the amplitude is the histogram content of that bin.
use serde::{Deserialize, Serialize};

use super::error::ConfigError;
use super::histogram::ChannelTimeHistogram;

/// Tunable parameters of the peak search
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakSearchConfig {
    /// Expected width of the peaks, in bins
    pub sigma: f64,
    /// Peaks lower than this fraction of the highest peak are discarded
    pub threshold: f64,
    pub max_peaks: usize,
    pub remove_background: bool,
    /// Largest clipping window of the background estimate, in bins
    pub background_window: usize,
    pub markov_smoothing: bool,
    pub markov_window: usize,
}

impl Default for PeakSearchConfig {
    fn default() -> Self {
        Self {
            sigma: 2.0,
            threshold: 0.05,
            max_peaks: 100,
            remove_background: true,
            background_window: 20,
            markov_smoothing: true,
            markov_window: 3,
        }
    }
}

impl PeakSearchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.sigma >= 1.0) {
            return Err(ConfigError::InvalidParameter(format!(
                "peak search sigma must be at least 1 bin, found {}",
                self.sigma
            )));
        }
        if !(self.threshold > 0.0 && self.threshold < 1.0) {
            return Err(ConfigError::InvalidParameter(format!(
                "peak search threshold must be in (0, 1), found {}",
                self.threshold
            )));
        }
        if self.max_peaks == 0 || self.markov_window == 0 {
            return Err(ConfigError::InvalidParameter(String::from(
                "peak search needs max_peaks and markov_window of at least 1",
            )));
        }
        Ok(())
    }
}

/// A peak found in a histogram
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakCandidate {
    pub position: f64,
    pub amplitude: f64,
}

impl PeakCandidate {
    pub fn new(position: f64, amplitude: f64) -> Self {
        Self {
            position,
            amplitude,
        }
    }
}

/// Anything which can find peaks in a time histogram
pub trait PeakSearch: Sync {
    fn search(&self, histogram: &ChannelTimeHistogram) -> Vec<PeakCandidate>;
}

/// The two peaks used for a calibration, largest amplitude first
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakPair {
    pub first: PeakCandidate,
    pub second: PeakCandidate,
}

impl PeakPair {
    pub fn midpoint(&self) -> f64 {
        (self.first.position + self.second.position) / 2.0
    }
}

/// Pick the two largest peaks at or below the cutoff.
///
/// Comparisons are strict, so among peaks of equal amplitude the first one seen wins.
/// Peaks with zero amplitude are never selected. Returns None if fewer than two peaks
/// qualify.
pub fn select_peak_pair(peaks: &[PeakCandidate], cutoff: f64) -> Option<PeakPair> {
    let mut first: Option<PeakCandidate> = None;
    let mut second: Option<PeakCandidate> = None;
    let amplitude = |p: &Option<PeakCandidate>| p.map_or(0.0, |p| p.amplitude);
    for peak in peaks.iter() {
        if peak.position > cutoff {
            continue;
        }
        if peak.amplitude > amplitude(&first) {
            second = first;
            first = Some(*peak);
        } else if peak.amplitude > amplitude(&second) {
            second = Some(*peak);
        }
    }
    match (first, second) {
        (Some(first), Some(second)) => Some(PeakPair { first, second }),
        _ => None,
    }
}

/// The default peak search. See the module documentation.
#[derive(Debug, Clone, Default)]
pub struct PeakFinder {
    config: PeakSearchConfig,
}

impl PeakFinder {
    pub fn new(config: PeakSearchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PeakSearchConfig {
        &self.config
    }

    /// Find the bins of the peaks in a spectrum, in ascending order
    pub fn find_peak_bins(&self, spectrum: &[f64]) -> Vec<usize> {
        if spectrum.len() < 3 || spectrum.iter().all(|v| *v <= 0.0) {
            return vec![];
        }

        let signal: Vec<f64> = if self.config.remove_background {
            let background = snip_background(spectrum, self.config.background_window);
            spectrum
                .iter()
                .zip(background.iter())
                .map(|(s, b)| (s - b).max(0.0))
                .collect()
        } else {
            spectrum.iter().map(|v| v.max(0.0)).collect()
        };

        let smoothed = if self.config.markov_smoothing {
            markov_smooth(&signal, self.config.markov_window)
        } else {
            signal.clone()
        };

        let response = gaussian_second_derivative(&smoothed, self.config.sigma);
        let reach = (self.config.sigma.ceil() as usize).max(1);
        let last = response.len() - 1;

        let mut bins: Vec<usize> = Vec::new();
        for idx in 0..response.len() {
            let r = response[idx];
            if r <= 0.0 {
                continue;
            }
            let rising = idx == 0 || r > response[idx - 1];
            let falling = idx == last || r >= response[idx + 1];
            if !(rising && falling) {
                continue;
            }
            // Move to the highest bin of the signal near the filter maximum
            let low = idx.saturating_sub(reach);
            let high = (idx + reach).min(last);
            let mut best = low;
            for bin in low..=high {
                if signal[bin] > signal[best] {
                    best = bin;
                }
            }
            if !bins.contains(&best) {
                bins.push(best);
            }
        }

        let highest = bins.iter().map(|b| signal[*b]).fold(0.0, f64::max);
        let floor = highest * self.config.threshold;
        bins.retain(|b| signal[*b] > 0.0 && signal[*b] >= floor);

        if bins.len() > self.config.max_peaks {
            bins.sort_by(|a, b| signal[*b].total_cmp(&signal[*a]));
            bins.truncate(self.config.max_peaks);
        }
        bins.sort_unstable();
        bins
    }
}

impl PeakSearch for PeakFinder {
    fn search(&self, histogram: &ChannelTimeHistogram) -> Vec<PeakCandidate> {
        let spectrum: Vec<f64> = histogram.counts().iter().map(|c| *c as f64).collect();
        self.find_peak_bins(&spectrum)
            .into_iter()
            .map(|bin| {
                PeakCandidate::new(histogram.bin_center(bin), histogram.content(bin) as f64)
            })
            .collect()
    }
}

/// Estimate the background of a spectrum by iterative clipping with windows 1..=window.
///
/// The clipping is done on the log-log-sqrt transform of the data, which lets the same
/// window work for both strong and weak peaks.
fn snip_background(spectrum: &[f64], window: usize) -> Vec<f64> {
    let n = spectrum.len();
    let mut v: Vec<f64> = spectrum
        .iter()
        .map(|y| ((y.max(0.0) + 1.0).sqrt() + 1.0).ln().ln_1p())
        .collect();
    let mut clipped = v.clone();
    for p in 1..=window {
        if 2 * p >= n {
            break;
        }
        for i in p..(n - p) {
            let mean = (v[i - p] + v[i + p]) / 2.0;
            clipped[i] = v[i].min(mean);
        }
        v[p..(n - p)].copy_from_slice(&clipped[p..(n - p)]);
    }
    v.iter()
        .map(|w| {
            let inner = w.exp_m1().exp() - 1.0;
            inner * inner - 1.0
        })
        .collect()
}

/// Markov chain smoothing.
///
/// The spectrum is treated as the stationary distribution of a chain which only moves to
/// neighboring bins. Transition rates are estimated from the data within `window` bins,
/// and the distribution is then rebuilt from the rate ratios and scaled back to the
/// original area.
fn markov_smooth(spectrum: &[f64], window: usize) -> Vec<f64> {
    let n = spectrum.len();
    let peak = spectrum.iter().copied().fold(0.0, f64::max);
    if peak <= 0.0 || n < 2 {
        return spectrum.to_vec();
    }
    let area: f64 = spectrum.iter().sum();
    let norm = |idx: isize| -> f64 {
        let clamped = idx.clamp(0, n as isize - 1) as usize;
        spectrum[clamped] / peak
    };
    let step = |to: f64, from: f64| -> f64 {
        let scale = if to + from <= 0.0 {
            1.0
        } else {
            (to + from).sqrt()
        };
        ((to - from) / scale).exp()
    };

    let mut chain = vec![0.0; n];
    chain[0] = 1.0;
    let mut total = 1.0;
    for i in 0..(n - 1) {
        let here = norm(i as isize);
        let next = norm(i as isize + 1);
        let mut up = 0.0;
        let mut down = 0.0;
        for l in 1..=window as isize {
            up += step(norm(i as isize + l), here);
            down += step(norm(i as isize - l + 1), next);
        }
        chain[i + 1] = chain[i] * up / down;
        total += chain[i + 1];
    }
    chain.iter().map(|c| c / total * area).collect()
}

/// Convolve with the negative second derivative of a Gaussian. Peaks give a positive
/// response, and the zero-sum kernel ignores flat regions.
fn gaussian_second_derivative(spectrum: &[f64], sigma: f64) -> Vec<f64> {
    let half = (3.0 * sigma).ceil() as isize;
    let s2 = sigma * sigma;
    let mut kernel: Vec<f64> = (-half..=half)
        .map(|k| {
            let k2 = (k * k) as f64;
            (1.0 - k2 / s2) * (-0.5 * k2 / s2).exp()
        })
        .collect();
    let mean = kernel.iter().sum::<f64>() / kernel.len() as f64;
    kernel.iter_mut().for_each(|k| *k -= mean);

    let n = spectrum.len() as isize;
    (0..n)
        .map(|i| {
            kernel
                .iter()
                .enumerate()
                .map(|(j, k)| {
                    let idx = (i + j as isize - half).clamp(0, n - 1) as usize;
                    k * spectrum[idx]
                })
                .sum()
        })
        .collect()
}
