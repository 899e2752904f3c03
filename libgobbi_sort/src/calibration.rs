use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::error::{CalibrationError, CalibrationRecordError, ConfigError};
use super::fit::{DoubleGaussianFit, FitOptions, FitResult};
use super::histogram::{ChannelTimeHistogram, HistogramRegistry, HistogramSpec};
use super::layout::{ChannelAddress, DetectorLayout, DetectorSide};
use super::peak::{select_peak_pair, PeakCandidate, PeakSearch, PeakSearchConfig};
use super::progress::ProgressTracker;

pub const DEFAULT_FRONT_FILE: &str = "FrontTimecalPulser.txt";
pub const DEFAULT_BACK_FILE: &str = "BackTimecalPulser.txt";
pub const DEFAULT_DELTA_FILE: &str = "DeltaTimecalPulser.txt";
pub const DEFAULT_DIAGNOSTIC_FILE: &str = "timeCal_ConsoleOutput.txt";

/// Settings of the time calibration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Where the calibration files, the diagnostic log and histogram dumps are written
    pub output_dir: PathBuf,
    pub front_file: String,
    pub back_file: String,
    pub delta_file: String,
    pub diagnostic_file: String,
    /// Dump the histogram of every irregular or failed channel as CSV
    pub save_histograms: bool,
    pub histogram: HistogramSpec,
    pub peak_search: PeakSearchConfig,
    /// Peaks above this time are never used (a few channels have a spurious late peak)
    pub cutoff: f64,
    /// Half of the fit range, in time units
    pub fit_half_width: f64,
    pub initial_sigma: f64,
    pub max_sigma: f64,
    /// Physical time between the two pulser peaks, set by the delay cable
    pub reference_interval_ns: f64,
    /// Stopping rules of the two-Gaussian fit
    #[serde(default)]
    pub fit: FitOptions,
    /// Fit the channels on the rayon thread pool
    pub parallel: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            front_file: String::from(DEFAULT_FRONT_FILE),
            back_file: String::from(DEFAULT_BACK_FILE),
            delta_file: String::from(DEFAULT_DELTA_FILE),
            diagnostic_file: String::from(DEFAULT_DIAGNOSTIC_FILE),
            save_histograms: true,
            histogram: HistogramSpec::default(),
            peak_search: PeakSearchConfig::default(),
            cutoff: 15000.0,
            fit_half_width: 300.0,
            initial_sigma: 10.0,
            max_sigma: 100.0,
            reference_interval_ns: 20.0,
            fit: FitOptions::default(),
            parallel: false,
        }
    }
}

impl CalibrationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.histogram.validate()?;
        self.peak_search.validate()?;
        if !(self.fit_half_width > 0.0) {
            return Err(ConfigError::InvalidParameter(format!(
                "fit_half_width must be positive, found {}",
                self.fit_half_width
            )));
        }
        if !(self.initial_sigma > 0.0 && self.initial_sigma < self.max_sigma) {
            return Err(ConfigError::InvalidParameter(format!(
                "initial_sigma must be in (0, max_sigma), found {} with max_sigma {}",
                self.initial_sigma, self.max_sigma
            )));
        }
        if !(self.fit.edm_tolerance >= 0.0) {
            return Err(ConfigError::InvalidParameter(format!(
                "fit edm_tolerance must not be negative, found {}",
                self.fit.edm_tolerance
            )));
        }
        if !(self.reference_interval_ns > 0.0) {
            return Err(ConfigError::InvalidParameter(format!(
                "reference_interval_ns must be positive, found {}",
                self.reference_interval_ns
            )));
        }
        Ok(())
    }

    pub fn output_path(&self, side: DetectorSide) -> PathBuf {
        let name = match side {
            DetectorSide::Front => &self.front_file,
            DetectorSide::Back => &self.back_file,
            DetectorSide::Delta => &self.delta_file,
        };
        self.output_dir.join(name)
    }

    pub fn diagnostic_path(&self) -> PathBuf {
        self.output_dir.join(&self.diagnostic_file)
    }
}

/// One line of a calibration file: `<quadrant> <channel> <slope> <offset>`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationRecord {
    pub quadrant: u8,
    pub channel: u8,
    pub slope: f64,
    pub offset: f64,
}

impl Display for CalibrationRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.quadrant, self.channel, self.slope, self.offset
        )
    }
}

impl FromStr for CalibrationRecord {
    type Err = CalibrationRecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(CalibrationRecordError::WrongFieldCount(fields.len()));
        }
        Ok(Self {
            quadrant: fields[0].parse()?,
            channel: fields[1].parse()?,
            slope: fields[2].parse()?,
            offset: fields[3].parse()?,
        })
    }
}

/// Why a channel could not be calibrated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    TooFewPeaks,
    NoValidPeakPair,
    FitDivergence,
    FitNonMinimizerError,
    /// The fit worked, but the board does not belong to any detector side
    UnknownBoard,
}

impl Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooFewPeaks => write!(f, "too few peaks"),
            Self::NoValidPeakPair => write!(f, "no valid peak pair"),
            Self::FitDivergence => write!(f, "fit divergence"),
            Self::FitNonMinimizerError => write!(f, "fit non-minimizer error"),
            Self::UnknownBoard => write!(f, "unknown board"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationFailure {
    pub gate: String,
    pub reason: FailureReason,
    pub peaks: Vec<PeakCandidate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibratedChannel {
    pub side: DetectorSide,
    pub record: CalibrationRecord,
}

/// Everything learned about one channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelCalibration {
    pub address: ChannelAddress,
    pub peaks: Vec<PeakCandidate>,
    pub fit: Option<FitResult>,
    pub outcome: Result<CalibratedChannel, CalibrationFailure>,
}

impl ChannelCalibration {
    /// The search did not find exactly two peaks
    pub fn is_irregular(&self) -> bool {
        self.peaks.len() != 2
    }

    fn failed(
        address: ChannelAddress,
        peaks: Vec<PeakCandidate>,
        fit: Option<FitResult>,
        reason: FailureReason,
    ) -> Self {
        Self {
            address,
            outcome: Err(CalibrationFailure {
                gate: address.gate(),
                reason,
                peaks: peaks.clone(),
            }),
            peaks,
            fit,
        }
    }
}

/// The per channel calibration. Holds no state between channels, so channels can be done
/// in any order or in parallel.
pub struct CalibrationEngine<'a, P: PeakSearch> {
    search: &'a P,
    config: &'a CalibrationConfig,
}

impl<'a, P: PeakSearch> CalibrationEngine<'a, P> {
    pub fn new(search: &'a P, config: &'a CalibrationConfig) -> Self {
        Self { search, config }
    }

    /// Take one channel from its time histogram to a calibration record (or a failure)
    pub fn calibrate(&self, histogram: &ChannelTimeHistogram) -> ChannelCalibration {
        let address = histogram.address();
        let peaks = self.search.search(histogram);
        if peaks.len() < 2 {
            return ChannelCalibration::failed(address, peaks, None, FailureReason::TooFewPeaks);
        }

        let pair = match select_peak_pair(&peaks, self.config.cutoff) {
            Some(pair) => pair,
            None => {
                return ChannelCalibration::failed(
                    address,
                    peaks,
                    None,
                    FailureReason::NoValidPeakPair,
                )
            }
        };

        let mut setup = DoubleGaussianFit::from_peaks(
            &pair,
            self.config.fit_half_width,
            self.config.initial_sigma,
            self.config.max_sigma,
        );
        setup.options = self.config.fit;
        let fit = setup.fit(histogram);
        let code = fit.status.code();
        if code > 0 {
            return ChannelCalibration::failed(
                address,
                peaks,
                Some(fit),
                FailureReason::FitDivergence,
            );
        } else if code < 0 {
            return ChannelCalibration::failed(
                address,
                peaks,
                Some(fit),
                FailureReason::FitNonMinimizerError,
            );
        }

        let [first, second] = fit.components;
        let slope = (first.center - second.center).abs() / self.config.reference_interval_ns;
        match DetectorSide::route(address.board) {
            Some((side, quadrant)) => ChannelCalibration {
                address,
                peaks,
                fit: Some(fit),
                outcome: Ok(CalibratedChannel {
                    side,
                    record: CalibrationRecord {
                        quadrant,
                        channel: address.channel,
                        slope,
                        offset: 0.0,
                    },
                }),
            },
            None => ChannelCalibration::failed(
                address,
                peaks,
                Some(fit),
                FailureReason::UnknownBoard,
            ),
        }
    }
}

/// Counts of a calibration run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationSummary {
    pub channels: usize,
    pub front: usize,
    pub back: usize,
    pub delta: usize,
    pub irregular: usize,
    pub histograms_saved: usize,
    pub failures: Vec<CalibrationFailure>,
}

impl CalibrationSummary {
    pub fn calibrated(&self) -> usize {
        self.front + self.back + self.delta
    }

    pub fn has_errors(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn count_failures(&self, reason: FailureReason) -> usize {
        self.failures.iter().filter(|f| f.reason == reason).count()
    }
}

/// Where calibration results go: one stream per detector side, plus the diagnostic log.
///
/// Histograms of bad channels are dumped as `histogram_<board>-<channel>.csv` if a
/// histogram directory is given.
pub struct CalibrationWriter<W: Write> {
    front: W,
    back: W,
    delta: W,
    diagnostic: W,
    histogram_dir: Option<PathBuf>,
    summary: CalibrationSummary,
}

impl CalibrationWriter<BufWriter<File>> {
    /// Create the output files named in the configuration
    pub fn create(config: &CalibrationConfig) -> Result<Self, CalibrationError> {
        std::fs::create_dir_all(&config.output_dir)?;
        let open = |path: PathBuf| -> Result<BufWriter<File>, CalibrationError> {
            Ok(BufWriter::new(File::create(path)?))
        };
        Ok(Self::new(
            open(config.output_path(DetectorSide::Front))?,
            open(config.output_path(DetectorSide::Back))?,
            open(config.output_path(DetectorSide::Delta))?,
            open(config.diagnostic_path())?,
            config.save_histograms.then(|| config.output_dir.clone()),
        ))
    }
}

impl<W: Write> CalibrationWriter<W> {
    pub fn new(front: W, back: W, delta: W, diagnostic: W, histogram_dir: Option<PathBuf>) -> Self {
        Self {
            front,
            back,
            delta,
            diagnostic,
            histogram_dir,
            summary: CalibrationSummary::default(),
        }
    }

    /// Start the diagnostic log with a timestamp and the inputs
    pub fn write_header(&mut self, inputs: &[PathBuf]) -> Result<(), CalibrationError> {
        let now = OffsetDateTime::now_utc().format(&Rfc3339)?;
        writeln!(self.diagnostic, "Time calibration started {now}")?;
        for input in inputs.iter() {
            writeln!(self.diagnostic, "Input hit stream: {}", input.display())?;
        }
        Ok(())
    }

    /// End the diagnostic log with the error summary, if any channel failed
    pub fn write_footer(&mut self, diagnostic_path: &Path) -> Result<(), CalibrationError> {
        if self.summary.has_errors() {
            writeln!(
                self.diagnostic,
                "Time calibration errors present, {} channels skipped. See {} for detailed output.",
                self.summary.failures.len(),
                diagnostic_path.display()
            )?;
        }
        Ok(())
    }

    fn save_histogram(&mut self, histogram: &ChannelTimeHistogram) -> Result<(), CalibrationError> {
        let dir = match &self.histogram_dir {
            Some(dir) => dir,
            None => return Ok(()),
        };
        let address = histogram.address();
        let path = dir.join(format!(
            "histogram_{}-{}.csv",
            address.board, address.channel
        ));
        let mut file = BufWriter::new(File::create(&path)?);
        histogram.write_csv(&mut file)?;
        file.flush()?;
        writeln!(
            self.diagnostic,
            "\tHistogram saved to {} ({} entries, {} underflow, {} overflow)",
            path.display(),
            histogram.integral(),
            histogram.underflow(),
            histogram.overflow()
        )?;
        self.summary.histograms_saved += 1;
        Ok(())
    }

    /// Write the result of one channel to the right stream, and log anything unusual
    pub fn write_channel(
        &mut self,
        calibration: &ChannelCalibration,
        histogram: &ChannelTimeHistogram,
    ) -> Result<(), CalibrationError> {
        let gate = calibration.address.gate();
        self.summary.channels += 1;
        let mut save = false;

        if calibration.is_irregular() {
            self.summary.irregular += 1;
            writeln!(self.diagnostic, "Irregular time spectrum for ({gate})")?;
            writeln!(
                self.diagnostic,
                "{} time peaks found:",
                calibration.peaks.len()
            )?;
            for peak in calibration.peaks.iter() {
                writeln!(self.diagnostic, "\t{} {}", peak.position, peak.amplitude)?;
            }
            save = true;
        }

        match &calibration.outcome {
            Ok(channel) => {
                let stream = match channel.side {
                    DetectorSide::Front => {
                        self.summary.front += 1;
                        &mut self.front
                    }
                    DetectorSide::Back => {
                        self.summary.back += 1;
                        &mut self.back
                    }
                    DetectorSide::Delta => {
                        self.summary.delta += 1;
                        &mut self.delta
                    }
                };
                writeln!(stream, "{}", channel.record)?;
            }
            Err(failure) => {
                let status = calibration.fit.map(|f| f.status.code()).unwrap_or(0);
                match failure.reason {
                    FailureReason::TooFewPeaks => {
                        writeln!(
                            self.diagnostic,
                            "Fewer than two time peaks for ({gate}), skipping"
                        )?;
                        save = true;
                    }
                    FailureReason::NoValidPeakPair => {
                        writeln!(
                            self.diagnostic,
                            "No two valid time peaks for ({gate}), skipping"
                        )?;
                        save = true;
                    }
                    FailureReason::FitDivergence => {
                        writeln!(
                            self.diagnostic,
                            "Time spectrum fit failed for ({gate}) with status {status}, skipping"
                        )?;
                        save = true;
                    }
                    FailureReason::FitNonMinimizerError => {
                        writeln!(
                            self.diagnostic,
                            "Time spectrum fit could not run for ({gate}) with status {status}, skipping"
                        )?;
                    }
                    FailureReason::UnknownBoard => {
                        writeln!(
                            self.diagnostic,
                            "Board {} of ({gate}) has no detector side, skipping",
                            calibration.address.board
                        )?;
                    }
                }
                self.summary.failures.push(failure.clone());
            }
        }

        if save {
            self.save_histogram(histogram)?;
        }
        Ok(())
    }

    pub fn summary(&self) -> &CalibrationSummary {
        &self.summary
    }

    /// Flush every stream, returning them along with the summary
    pub fn finish(mut self) -> Result<(CalibrationSummary, [W; 4]), CalibrationError> {
        self.front.flush()?;
        self.back.flush()?;
        self.delta.flush()?;
        self.diagnostic.flush()?;
        Ok((
            self.summary,
            [self.front, self.back, self.delta, self.diagnostic],
        ))
    }
}

/// Calibrate every channel of the layout, in board then channel order.
///
/// Channels which never fired get an empty histogram (and fail with too few peaks). Each
/// channel advances the tracker by one whatever its outcome. Channel failures are written
/// to the diagnostic log; only I/O problems stop the run.
pub fn run_time_calibration<P: PeakSearch, W: Write>(
    config: &CalibrationConfig,
    layout: &DetectorLayout,
    registry: &HistogramRegistry,
    search: &P,
    writer: &mut CalibrationWriter<W>,
    tracker: &ProgressTracker,
) -> Result<(), CalibrationError> {
    let engine = CalibrationEngine::new(search, config);
    let addresses: Vec<ChannelAddress> = layout.addresses().collect();
    tracker.set_range(0.0, addresses.len() as f64);
    tracker.set_position(0.0);

    let histogram_for = |address: &ChannelAddress| -> ChannelTimeHistogram {
        match registry.get(address) {
            Some(histogram) => histogram.clone(),
            None => ChannelTimeHistogram::new(*address, *registry.spec()),
        }
    };

    if config.parallel {
        let results: Vec<(ChannelCalibration, ChannelTimeHistogram)> = addresses
            .par_iter()
            .map(|address| {
                let histogram = histogram_for(address);
                let calibration = engine.calibrate(&histogram);
                tracker.increment(1.0);
                tracker.render();
                (calibration, histogram)
            })
            .collect();
        for (calibration, histogram) in results.iter() {
            writer.write_channel(calibration, histogram)?;
        }
    } else {
        for address in addresses.iter() {
            let histogram = histogram_for(address);
            let calibration = engine.calibrate(&histogram);
            writer.write_channel(&calibration, &histogram)?;
            tracker.increment(1.0);
            tracker.render();
        }
    }

    let summary = writer.summary();
    log::info!(
        "Calibrated {} of {} channels ({} front, {} back, {} delta)",
        summary.calibrated(),
        summary.channels,
        summary.front,
        summary.back,
        summary.delta
    );
    if summary.has_errors() {
        log::warn!(
            "Time calibration errors present, {} channels skipped. See {} for detailed output.",
            summary.failures.len(),
            config.diagnostic_path().display()
        );
    }
    writer.write_footer(&config.diagnostic_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peak::tests::pulser_histogram;
    use crate::peak::PeakFinder;

    /// Always returns the same peaks
    struct FixedPeaks(Vec<PeakCandidate>);

    impl PeakSearch for FixedPeaks {
        fn search(&self, _histogram: &ChannelTimeHistogram) -> Vec<PeakCandidate> {
            self.0.clone()
        }
    }

    fn pulser_at(board: u8, channel: u8) -> ChannelTimeHistogram {
        let source = pulser_histogram(&[(1000.0, 4000.0, 12.0), (800.0, 4200.0, 12.0)]);
        let mut hist = ChannelTimeHistogram::new(ChannelAddress::new(board, channel), *source.spec());
        for bin in 0..source.n_bins() {
            hist.fill_n(source.bin_center(bin), source.content(bin));
        }
        hist
    }

    fn memory_writer() -> CalibrationWriter<Vec<u8>> {
        CalibrationWriter::new(Vec::new(), Vec::new(), Vec::new(), Vec::new(), None)
    }

    fn text(bytes: &[u8]) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_record_line_round_trip() {
        let record = CalibrationRecord {
            quadrant: 2,
            channel: 17,
            slope: 10.123456789012345,
            offset: 0.0,
        };
        let line = record.to_string();
        assert_eq!(line, "2 17 10.123456789012345 0");
        assert_eq!(line.parse::<CalibrationRecord>().unwrap(), record);
        assert!(matches!(
            "1 2 3".parse::<CalibrationRecord>(),
            Err(CalibrationRecordError::WrongFieldCount(3))
        ));
        assert!("1 x 3 0".parse::<CalibrationRecord>().is_err());
    }

    #[test]
    fn test_single_peak_is_too_few() {
        let config = CalibrationConfig::default();
        let finder = PeakFinder::default();
        let engine = CalibrationEngine::new(&finder, &config);
        let mut hist = ChannelTimeHistogram::new(ChannelAddress::new(4, 9), config.histogram);
        let source = pulser_histogram(&[(500.0, 9000.0, 10.0)]);
        for bin in 0..source.n_bins() {
            hist.fill_n(source.bin_center(bin), source.content(bin));
        }

        let calibration = engine.calibrate(&hist);
        let failure = calibration.outcome.clone().unwrap_err();
        assert_eq!(failure.reason, FailureReason::TooFewPeaks);
        assert_eq!(failure.gate, "board==4 && chan==9");
        assert_eq!(failure.peaks.len(), 1);

        let mut writer = memory_writer();
        writer.write_channel(&calibration, &hist).unwrap();
        let (summary, [front, back, delta, diagnostic]) = writer.finish().unwrap();
        assert!(front.is_empty() && back.is_empty() && delta.is_empty());
        assert!(summary.has_errors());
        assert_eq!(summary.count_failures(FailureReason::TooFewPeaks), 1);
        let log = text(&diagnostic);
        assert!(log.contains("Irregular time spectrum for (board==4 && chan==9)"));
        assert!(log.contains("Fewer than two time peaks for (board==4 && chan==9)"));
    }

    #[test]
    fn test_two_peaks_calibrate_and_route() {
        let config = CalibrationConfig::default();
        let finder = PeakFinder::default();
        let engine = CalibrationEngine::new(&finder, &config);

        let front = engine.calibrate(&pulser_at(3, 5));
        let channel = front.outcome.clone().unwrap();
        assert_eq!(channel.side, DetectorSide::Front);
        assert_eq!(channel.record.quadrant, 1);
        assert_eq!(channel.record.channel, 5);
        assert_eq!(channel.record.offset, 0.0);
        assert!((channel.record.slope - 10.0).abs() < 0.05);

        let back = engine.calibrate(&pulser_at(8, 0)).outcome.unwrap();
        assert_eq!((back.side, back.record.quadrant), (DetectorSide::Back, 3));
        let delta = engine.calibrate(&pulser_at(10, 31)).outcome.unwrap();
        assert_eq!((delta.side, delta.record.quadrant), (DetectorSide::Delta, 1));
    }

    #[test]
    fn test_no_valid_pair_over_cutoff() {
        let config = CalibrationConfig {
            cutoff: 3000.0,
            ..Default::default()
        };
        let finder = PeakFinder::default();
        let engine = CalibrationEngine::new(&finder, &config);
        let calibration = engine.calibrate(&pulser_at(1, 1));
        assert_eq!(
            calibration.outcome.unwrap_err().reason,
            FailureReason::NoValidPeakPair
        );
    }

    #[test]
    fn test_extra_peak_is_irregular_but_calibrated() {
        // A spurious late peak above the cutoff is ignored
        let search = FixedPeaks(vec![
            PeakCandidate::new(3998.0, 986.0),
            PeakCandidate::new(16000.0, 2000.0),
            PeakCandidate::new(4198.0, 789.0),
        ]);
        let config = CalibrationConfig::default();
        let engine = CalibrationEngine::new(&search, &config);
        let hist = pulser_at(2, 2);
        let calibration = engine.calibrate(&hist);
        assert!(calibration.is_irregular());
        let channel = calibration.outcome.clone().unwrap();
        assert!((channel.record.slope - 10.0).abs() < 0.05);

        let mut writer = memory_writer();
        writer.write_channel(&calibration, &hist).unwrap();
        let (summary, [_, back, _, diagnostic]) = writer.finish().unwrap();
        assert!(!summary.has_errors());
        assert_eq!(summary.irregular, 1);
        assert_eq!(summary.back, 1);
        let line = text(&back);
        let record: CalibrationRecord = line.trim().parse().unwrap();
        assert_eq!(record, channel.record);
        assert!(text(&diagnostic).contains("3 time peaks found:"));
    }

    #[test]
    fn test_bad_fit_setup_is_non_minimizer_error() {
        // Peaks reported on a dead channel leave nothing to fit
        let search = FixedPeaks(vec![
            PeakCandidate::new(4000.0, 50.0),
            PeakCandidate::new(4200.0, 30.0),
        ]);
        let config = CalibrationConfig::default();
        let engine = CalibrationEngine::new(&search, &config);
        let empty = ChannelTimeHistogram::new(ChannelAddress::new(1, 0), config.histogram);
        let calibration = engine.calibrate(&empty);
        assert_eq!(
            calibration.outcome.unwrap_err().reason,
            FailureReason::FitNonMinimizerError
        );
        assert_eq!(calibration.fit.unwrap().status.code(), -1);
    }

    #[test]
    fn test_stopped_fit_is_divergence() {
        let dir = tempfile::tempdir().unwrap();
        let search = FixedPeaks(vec![
            PeakCandidate::new(3998.0, 986.0),
            PeakCandidate::new(4198.0, 789.0),
        ]);
        // No iterations allowed, so the fit stops at its starting point
        let config = CalibrationConfig {
            fit: FitOptions {
                max_iterations: 0,
                edm_tolerance: 0.0,
            },
            ..Default::default()
        };
        let engine = CalibrationEngine::new(&search, &config);
        let hist = pulser_at(5, 6);
        let calibration = engine.calibrate(&hist);
        assert!(!calibration.is_irregular());
        assert_eq!(calibration.fit.unwrap().status.code(), 4);
        let failure = calibration.outcome.clone().unwrap_err();
        assert_eq!(failure.reason, FailureReason::FitDivergence);

        let mut writer = CalibrationWriter::new(
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Some(dir.path().to_path_buf()),
        );
        writer.write_channel(&calibration, &hist).unwrap();
        writer.write_footer(Path::new("diagnostic.txt")).unwrap();
        let (summary, [front, back, delta, diagnostic]) = writer.finish().unwrap();
        assert!(front.is_empty() && back.is_empty() && delta.is_empty());
        assert_eq!(summary.count_failures(FailureReason::FitDivergence), 1);
        assert_eq!(summary.histograms_saved, 1);
        assert!(dir.path().join("histogram_5-6.csv").exists());
        let log = text(&diagnostic);
        assert!(log.contains(
            "Time spectrum fit failed for (board==5 && chan==6) with status 4, skipping"
        ));
        assert!(log.contains(
            "Time calibration errors present, 1 channels skipped. See diagnostic.txt for detailed output."
        ));
    }

    #[test]
    fn test_no_valid_pair_is_logged_and_saved() {
        let dir = tempfile::tempdir().unwrap();
        let config = CalibrationConfig {
            cutoff: 3000.0,
            ..Default::default()
        };
        let finder = PeakFinder::default();
        let engine = CalibrationEngine::new(&finder, &config);
        let hist = pulser_at(9, 3);
        let calibration = engine.calibrate(&hist);

        let mut writer = CalibrationWriter::new(
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Some(dir.path().to_path_buf()),
        );
        writer.write_channel(&calibration, &hist).unwrap();
        let (summary, [_, _, delta, diagnostic]) = writer.finish().unwrap();
        assert!(delta.is_empty());
        assert_eq!(summary.count_failures(FailureReason::NoValidPeakPair), 1);
        let log = text(&diagnostic);
        assert!(log.contains("No two valid time peaks for (board==9 && chan==3), skipping"));
        assert!(log.contains("histogram_9-3.csv"));

        let dump = std::fs::read_to_string(dir.path().join("histogram_9-3.csv")).unwrap();
        assert!(dump.starts_with("# board==9 && chan==3 underflow=0 overflow=0"));
        assert_eq!(dump.lines().count(), 2 + 4096);
    }

    #[test]
    fn test_run_over_layout() {
        let layout = DetectorLayout {
            boards: 2,
            channels: 2,
            ..Default::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let config = CalibrationConfig {
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut registry = HistogramRegistry::new(config.histogram);
        // Board 1 channel 0 and board 2 channel 1 see the pulser, the others are dead
        for address in [ChannelAddress::new(1, 0), ChannelAddress::new(2, 1)] {
            let source = pulser_at(address.board, address.channel);
            for bin in 0..source.n_bins() {
                for _ in 0..source.content(bin) {
                    registry.fill(address, source.bin_center(bin));
                }
            }
        }

        let finder = PeakFinder::new(config.peak_search);
        let tracker = ProgressTracker::hidden();
        let mut writer = CalibrationWriter::create(&config).unwrap();
        writer.write_header(&[PathBuf::from("hits.h5")]).unwrap();
        run_time_calibration(&config, &layout, &registry, &finder, &mut writer, &tracker)
            .unwrap();
        let (summary, _) = writer.finish().unwrap();

        assert_eq!(tracker.position(), 4.0);
        assert_eq!(summary.channels, 4);
        assert_eq!(summary.front, 1);
        assert_eq!(summary.back, 1);
        assert_eq!(summary.count_failures(FailureReason::TooFewPeaks), 2);
        assert_eq!(summary.histograms_saved, 2);
        assert!(dir.path().join("histogram_1-1.csv").exists());
        assert!(dir.path().join("histogram_2-0.csv").exists());

        let front = std::fs::read_to_string(config.output_path(DetectorSide::Front)).unwrap();
        let record: CalibrationRecord = front.trim().parse().unwrap();
        assert_eq!((record.quadrant, record.channel), (0, 0));
        let back = std::fs::read_to_string(config.output_path(DetectorSide::Back)).unwrap();
        let record: CalibrationRecord = back.trim().parse().unwrap();
        assert_eq!((record.quadrant, record.channel), (0, 1));
        let delta = std::fs::read_to_string(config.output_path(DetectorSide::Delta)).unwrap();
        assert!(delta.is_empty());
        let log = std::fs::read_to_string(config.diagnostic_path()).unwrap();
        assert!(log.starts_with("Time calibration started"));
        assert!(log.contains("Input hit stream: hits.h5"));
        assert!(log
            .trim_end()
            .ends_with(&format!(
                "Time calibration errors present, 2 channels skipped. See {} for detailed output.",
                config.diagnostic_path().display()
            )));
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let layout = DetectorLayout {
            boards: 3,
            channels: 2,
            ..Default::default()
        };
        let mut registry = HistogramRegistry::new(HistogramSpec::default());
        for address in layout.addresses().filter(|a| a.channel == 1) {
            let source = pulser_at(address.board, address.channel);
            for bin in 0..source.n_bins() {
                for _ in 0..source.content(bin) {
                    registry.fill(address, source.bin_center(bin));
                }
            }
        }
        let finder = PeakFinder::default();
        let mut outputs = Vec::new();
        for parallel in [false, true] {
            let config = CalibrationConfig {
                parallel,
                ..Default::default()
            };
            let mut writer = memory_writer();
            let tracker = ProgressTracker::hidden();
            run_time_calibration(&config, &layout, &registry, &finder, &mut writer, &tracker)
                .unwrap();
            let (summary, streams) = writer.finish().unwrap();
            assert_eq!(summary.calibrated(), 3);
            outputs.push(streams);
        }
        assert_eq!(outputs[0], outputs[1]);
    }
}
