//! Two-Gaussian χ² fit of a pulser time spectrum.
//!
//! The model is `A1 exp(-(x-m1)²/2s1²) + A2 exp(-(x-m2)²/2s2²)`, evaluated at bin centers
//! and compared to the non-empty bins in the fit range with √N errors. Every parameter is
//! bounded; the minimizer works on internal parameters θ with
//! `p = low + (high - low)(sin θ + 1)/2`, so it can never step outside of the limits.
//! Minimization is Levenberg-Marquardt on the internal parameters, and convergence is
//! decided by the estimated distance to the minimum (EDM).
use nalgebra::{SMatrix, SVector};
use serde::{Deserialize, Serialize};

use super::histogram::ChannelTimeHistogram;
use super::peak::PeakPair;

pub const N_PARAMETERS: usize = 6;

type ParameterVector = SVector<f64, N_PARAMETERS>;
type ParameterMatrix = SMatrix<f64, N_PARAMETERS, N_PARAMETERS>;

const LAMBDA_START: f64 = 1.0e-3;
const LAMBDA_MIN: f64 = 1.0e-12;
const LAMBDA_MAX: f64 = 1.0e16;
// Keeps the start away from the exact limits, where the sine transform has no gradient
const BOUND_MARGIN: f64 = 1.0e-6;

/// Closed interval a parameter is held to
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub low: f64,
    pub high: f64,
}

impl Bounds {
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    fn is_valid(&self) -> bool {
        self.low.is_finite() && self.high.is_finite() && self.low < self.high
    }

    fn to_external(&self, theta: f64) -> f64 {
        self.low + (self.high - self.low) * (theta.sin() + 1.0) / 2.0
    }

    fn to_internal(&self, value: f64) -> f64 {
        let unit = 2.0 * (value - self.low) / (self.high - self.low) - 1.0;
        unit.clamp(-1.0 + BOUND_MARGIN, 1.0 - BOUND_MARGIN).asin()
    }

    /// d(external)/d(internal)
    fn derivative(&self, theta: f64) -> f64 {
        (self.high - self.low) * theta.cos() / 2.0
    }
}

/// One component of the model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianComponent {
    pub amplitude: f64,
    pub center: f64,
    pub sigma: f64,
}

impl GaussianComponent {
    pub fn value(&self, x: f64) -> f64 {
        if self.sigma.abs() < f64::EPSILON {
            return 0.0;
        }
        let z = (x - self.center) / self.sigma;
        self.amplitude * (-0.5 * z * z).exp()
    }

    /// Partial derivatives with respect to (amplitude, center, sigma)
    fn gradient(&self, x: f64) -> [f64; 3] {
        if self.sigma.abs() < f64::EPSILON {
            return [0.0; 3];
        }
        let z = (x - self.center) / self.sigma;
        let g = (-0.5 * z * z).exp();
        [
            g,
            self.amplitude * g * z / self.sigma,
            self.amplitude * g * z * z / self.sigma,
        ]
    }
}

/// Outcome of a fit. `code` gives the numeric status, where 0 is success, positive values
/// are minimizer problems and negative values mean the fit could not be set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitStatus {
    Converged,
    /// Stopped without the EDM reaching the tolerance, or χ² was not finite
    EdmAboveTolerance,
    IterationLimit,
    /// Not enough populated bins in range for the number of parameters
    TooFewBins,
    InvalidBounds,
}

impl FitStatus {
    pub fn code(&self) -> i32 {
        match self {
            Self::Converged => 0,
            Self::EdmAboveTolerance => 3,
            Self::IterationLimit => 4,
            Self::TooFewBins => -1,
            Self::InvalidBounds => -2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitResult {
    pub status: FitStatus,
    pub components: [GaussianComponent; 2],
    pub chi2: f64,
    pub ndf: usize,
    pub edm: f64,
    pub iterations: usize,
}

/// Stopping rules of the minimizer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitOptions {
    pub max_iterations: usize,
    pub edm_tolerance: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            edm_tolerance: 2.0e-5,
        }
    }
}

/// A bounded fit of two Gaussians over a range of a time histogram
#[derive(Debug, Clone, PartialEq)]
pub struct DoubleGaussianFit {
    pub initial: [GaussianComponent; 2],
    /// In parameter order: A1, m1, s1, A2, m2, s2
    pub bounds: [Bounds; N_PARAMETERS],
    pub range: (f64, f64),
    pub options: FitOptions,
}

impl DoubleGaussianFit {
    /// Set up a fit around a pair of peaks.
    ///
    /// The range is the midpoint of the peaks ± half_width. Amplitudes may move between 0.5
    /// and 1.5 times the peak height, centers anywhere in the range, and widths in
    /// [0, max_sigma].
    pub fn from_peaks(
        pair: &PeakPair,
        half_width: f64,
        initial_sigma: f64,
        max_sigma: f64,
    ) -> Self {
        let mid = pair.midpoint();
        let range = (mid - half_width, mid + half_width);
        let component = |amplitude: f64, center: f64| GaussianComponent {
            amplitude,
            center,
            sigma: initial_sigma,
        };
        let amplitude_bounds = |amplitude: f64| Bounds::new(amplitude * 0.5, amplitude * 1.5);
        Self {
            initial: [
                component(pair.first.amplitude, pair.first.position),
                component(pair.second.amplitude, pair.second.position),
            ],
            bounds: [
                amplitude_bounds(pair.first.amplitude),
                Bounds::new(range.0, range.1),
                Bounds::new(0.0, max_sigma),
                amplitude_bounds(pair.second.amplitude),
                Bounds::new(range.0, range.1),
                Bounds::new(0.0, max_sigma),
            ],
            range,
            options: FitOptions::default(),
        }
    }

    fn external(&self, theta: &ParameterVector) -> [GaussianComponent; 2] {
        let p: Vec<f64> = (0..N_PARAMETERS)
            .map(|i| self.bounds[i].to_external(theta[i]))
            .collect();
        [
            GaussianComponent {
                amplitude: p[0],
                center: p[1],
                sigma: p[2],
            },
            GaussianComponent {
                amplitude: p[3],
                center: p[4],
                sigma: p[5],
            },
        ]
    }

    fn chi2(&self, points: &[(f64, f64)], theta: &ParameterVector) -> f64 {
        let [c1, c2] = self.external(theta);
        points
            .iter()
            .map(|(x, y)| {
                let r = y - c1.value(*x) - c2.value(*x);
                r * r / y
            })
            .sum()
    }

    /// Gauss-Newton normal matrix JᵀWJ and the vector JᵀWr (which is -½∇χ²)
    fn normal_equations(
        &self,
        points: &[(f64, f64)],
        theta: &ParameterVector,
    ) -> (ParameterMatrix, ParameterVector) {
        let [c1, c2] = self.external(theta);
        let chain = ParameterVector::from_fn(|i, _| self.bounds[i].derivative(theta[i]));
        let mut jtj = ParameterMatrix::zeros();
        let mut jtr = ParameterVector::zeros();
        for (x, y) in points.iter() {
            let weight = 1.0 / y;
            let r = y - c1.value(*x) - c2.value(*x);
            let g1 = c1.gradient(*x);
            let g2 = c2.gradient(*x);
            let d =
                ParameterVector::from_column_slice(&[g1[0], g1[1], g1[2], g2[0], g2[1], g2[2]])
                    .component_mul(&chain);
            jtj += d * d.transpose() * weight;
            jtr += d * (r * weight);
        }
        (jtj, jtr)
    }

    /// Estimated distance to minimum
    fn edm(jtj: &ParameterMatrix, jtr: &ParameterVector) -> f64 {
        let scale = jtj.diagonal().max().max(1.0);
        let regularized = jtj + ParameterMatrix::identity() * (scale * 1.0e-12);
        match regularized.lu().solve(jtr) {
            Some(step) => jtr.dot(&step),
            None => f64::INFINITY,
        }
    }

    fn result(
        &self,
        status: FitStatus,
        theta: &ParameterVector,
        chi2: f64,
        ndf: usize,
        edm: f64,
        iterations: usize,
    ) -> FitResult {
        FitResult {
            status,
            components: self.external(theta),
            chi2,
            ndf,
            edm,
            iterations,
        }
    }

    /// Run the fit on a histogram
    pub fn fit(&self, histogram: &ChannelTimeHistogram) -> FitResult {
        let initial_theta = ParameterVector::from_fn(|i, _| {
            let c = &self.initial[i / 3];
            let value = match i % 3 {
                0 => c.amplitude,
                1 => c.center,
                _ => c.sigma,
            };
            if self.bounds[i].is_valid() {
                self.bounds[i].to_internal(value)
            } else {
                0.0
            }
        });

        if !self.bounds.iter().all(|b| b.is_valid()) || !(self.range.0 < self.range.1) {
            let mut result =
                self.result(FitStatus::InvalidBounds, &initial_theta, 0.0, 0, 0.0, 0);
            result.components = self.initial;
            return result;
        }

        let points: Vec<(f64, f64)> = (0..histogram.n_bins())
            .filter_map(|bin| {
                let x = histogram.bin_center(bin);
                let y = histogram.content(bin) as f64;
                (x >= self.range.0 && x <= self.range.1 && y > 0.0).then_some((x, y))
            })
            .collect();
        if points.len() < N_PARAMETERS {
            let mut result = self.result(FitStatus::TooFewBins, &initial_theta, 0.0, 0, 0.0, 0);
            result.components = self.initial;
            return result;
        }
        let ndf = points.len() - N_PARAMETERS;

        let mut theta = initial_theta;
        let mut chi2 = self.chi2(&points, &theta);
        let mut lambda = LAMBDA_START;
        if !chi2.is_finite() {
            let edm = f64::INFINITY;
            return self.result(FitStatus::EdmAboveTolerance, &theta, chi2, ndf, edm, 0);
        }

        for iteration in 0..self.options.max_iterations {
            let (jtj, jtr) = self.normal_equations(&points, &theta);
            let edm = Self::edm(&jtj, &jtr);
            if edm < self.options.edm_tolerance {
                return self.result(FitStatus::Converged, &theta, chi2, ndf, edm, iteration);
            }

            let floor = jtj.diagonal().max() * 1.0e-12;
            let mut improved = false;
            while lambda <= LAMBDA_MAX {
                let mut damped = jtj;
                for i in 0..N_PARAMETERS {
                    damped[(i, i)] += lambda * jtj[(i, i)].max(floor).max(f64::MIN_POSITIVE);
                }
                if let Some(step) = damped.lu().solve(&jtr) {
                    let trial = theta + step;
                    let trial_chi2 = self.chi2(&points, &trial);
                    if trial_chi2.is_finite() && trial_chi2 < chi2 {
                        theta = trial;
                        chi2 = trial_chi2;
                        lambda = (lambda / 10.0).max(LAMBDA_MIN);
                        improved = true;
                        break;
                    }
                }
                lambda *= 10.0;
            }
            if !improved {
                // No step lowers χ² any more, but the EDM says we are not at the minimum
                let status = FitStatus::EdmAboveTolerance;
                return self.result(status, &theta, chi2, ndf, edm, iteration);
            }
        }

        let (jtj, jtr) = self.normal_equations(&points, &theta);
        let edm = Self::edm(&jtj, &jtr);
        let status = if edm < self.options.edm_tolerance {
            FitStatus::Converged
        } else {
            FitStatus::IterationLimit
        };
        self.result(status, &theta, chi2, ndf, edm, self.options.max_iterations)
    }
}
