use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::calibration::CalibrationConfig;
use super::error::ConfigError;
use super::hdf_source::{DEFAULT_CHUNK_SIZE, DEFAULT_TREE_NAME};
use super::layout::DetectorLayout;

pub const DEFAULT_UPDATE_RATE: u64 = 10_000;
/// Replaced by the zero padded run number in run file templates
pub const RUN_PLACEHOLDER: &str = "{run}";

fn default_input_template() -> String {
    String::from("run-{run}.h5")
}

fn default_hit_template() -> String {
    String::from("hits-{run}.h5")
}

/// A range of runs sorted one after another. Each run gets its own input file and its own
/// hit stream, named from the templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunBatch {
    /// Directory holding the run input files
    pub input_dir: PathBuf,
    /// Directory the hit streams are written to
    pub hit_dir: PathBuf,
    pub first_run_number: i32,
    pub last_run_number: i32,
    #[serde(default = "default_input_template")]
    pub input_template: String,
    #[serde(default = "default_hit_template")]
    pub hit_template: String,
}

impl Default for RunBatch {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("None"),
            hit_dir: PathBuf::from("None"),
            first_run_number: 0,
            last_run_number: 0,
            input_template: default_input_template(),
            hit_template: default_hit_template(),
        }
    }
}

impl RunBatch {
    pub fn get_input_path(&self, run_number: i32) -> PathBuf {
        self.input_dir.join(fill_template(&self.input_template, run_number))
    }

    pub fn get_hit_path(&self, run_number: i32) -> PathBuf {
        self.hit_dir.join(fill_template(&self.hit_template, run_number))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.first_run_number > self.last_run_number {
            return Err(ConfigError::InvalidParameter(format!(
                "first_run_number ({}) is after last_run_number ({})",
                self.first_run_number, self.last_run_number
            )));
        }
        for template in [&self.input_template, &self.hit_template] {
            if !template.contains(RUN_PLACEHOLDER) {
                return Err(ConfigError::InvalidParameter(format!(
                    "run file template {template} does not contain {RUN_PLACEHOLDER}"
                )));
            }
        }
        if self.input_template == self.hit_template && self.input_dir == self.hit_dir {
            return Err(ConfigError::InvalidParameter(String::from(
                "run input files and hit streams would have the same path",
            )));
        }
        Ok(())
    }
}

/// Construct the run string the way SpecTcl names its run files
fn get_run_str(run_number: i32) -> String {
    format!("{run_number:0>4}")
}

fn fill_template(template: &str, run_number: i32) -> String {
    template.replace(RUN_PLACEHOLDER, &get_run_str(run_number))
}

/// Structure representing the application configuration. Contains pathing and run information
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// The input HDF5 file of SpecTcl columns
    pub input_path: PathBuf,
    /// Group of the input file holding the columns
    pub input_group: String,
    /// Where the hit stream is written by `sort` and read by `calibrate`
    pub hit_path: PathBuf,
    pub n_threads: usize,
    /// Number of records a worker processes between progress updates
    pub update_rate: u64,
    /// Number of records read from each column at a time
    pub chunk_size: usize,
    /// Width of the text progress bar. If None, a plain percentage is shown
    #[serde(default)]
    pub progress_width: Option<usize>,
    pub layout: DetectorLayout,
    pub calibration: CalibrationConfig,
    /// If given, `sort` works through these runs and `calibrate` reads all of their hit
    /// streams; input_path and hit_path are then unused
    #[serde(default)]
    pub runs: Option<RunBatch>,
}

impl Default for Config {
    /// Generate a new Config object. Paths will be placeholders
    fn default() -> Self {
        Self {
            input_path: PathBuf::from("None"),
            input_group: String::from(DEFAULT_TREE_NAME),
            hit_path: PathBuf::from("None"),
            n_threads: 1,
            update_rate: DEFAULT_UPDATE_RATE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_width: None,
            layout: DetectorLayout::default(),
            calibration: CalibrationConfig::default(),
            runs: None,
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        let config = serde_yaml::from_str::<Self>(&yaml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration to a YAML file
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    /// Check every tunable for sane values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.layout.validate()?;
        if !self.is_n_threads_valid() {
            return Err(ConfigError::InvalidParameter(format!(
                "n_threads must be at least 1, found {}",
                self.n_threads
            )));
        }
        if self.update_rate == 0 {
            return Err(ConfigError::InvalidParameter(String::from(
                "update_rate must be at least 1",
            )));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::InvalidParameter(String::from(
                "chunk_size must be at least 1",
            )));
        }
        if let Some(runs) = &self.runs {
            runs.validate()?;
        }
        self.calibration.validate()
    }

    /// The run numbers of the batch, in order. Empty if there is no batch
    pub fn run_numbers(&self) -> Vec<i32> {
        match &self.runs {
            Some(runs) => (runs.first_run_number..(runs.last_run_number + 1)).collect(),
            None => Vec::new(),
        }
    }

    /// Check if a specific run exists by evaluating the existence of its input file
    pub fn does_run_exist(&self, run_number: i32) -> bool {
        match &self.runs {
            Some(runs) => runs.get_input_path(run_number).exists(),
            None => false,
        }
    }

    /// The config of a single run of the batch, with the run's own input and hit paths
    pub fn run_config(&self, run_number: i32) -> Option<Self> {
        let runs = self.runs.as_ref()?;
        Some(Self {
            input_path: runs.get_input_path(run_number),
            hit_path: runs.get_hit_path(run_number),
            runs: None,
            ..self.clone()
        })
    }

    /// Every hit stream the calibration should read. For a batch these are the hit
    /// streams of the batch which exist on disk
    pub fn hit_stream_paths(&self) -> Vec<PathBuf> {
        match &self.runs {
            Some(runs) => self
                .run_numbers()
                .into_iter()
                .map(|run| runs.get_hit_path(run))
                .filter(|path| path.exists())
                .collect(),
            None => vec![self.hit_path.clone()],
        }
    }

    pub fn is_n_threads_valid(&self) -> bool {
        self.n_threads >= 1
    }

    /// Path of the yaml sidecar written next to the hit stream
    pub fn get_fileinfo_path(&self) -> PathBuf {
        self.hit_path.with_extension("yml")
    }
}
