use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Could not open input source because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Input source failed due to HDF5 error: {0}")]
    HDF5Error(#[from] hdf5::Error),
    #[error("Input source does not contain the group {0}")]
    MissingGroup(String),
    #[error("Input source is missing the column {0}")]
    MissingColumn(String),
    #[error("Input source column {column} has {ndim} dimensions; expected 1")]
    BadColumnShape { column: String, ndim: usize },
    #[error("Input source column {column} has {found} records; expected {expected}")]
    ColumnLengthMismatch {
        column: String,
        expected: u64,
        found: u64,
    },
    #[error("Input source contains column {0}, which is outside of the configured layout")]
    UnexpectedColumn(String),
    #[error("Requested records [{start}, {end}) but the source only has {count}")]
    RangeOutOfBounds { start: u64, end: u64, count: u64 },
    #[error("Record has layout {found:?} (boards, channels); expected {expected:?}")]
    LayoutMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },
}

#[derive(Debug, Error)]
pub enum HitBlockError {
    #[error("HitBlock column {column} has {found} entries; expected {expected}")]
    MisalignedColumn {
        column: String,
        expected: usize,
        found: usize,
    },
    #[error("HitBlock has {0} offsets for {1} events; expected one more offset than events")]
    BadOffsetCount(usize, usize),
    #[error("HitBlock offsets must start at zero and never decrease")]
    OffsetsNotMonotonic,
    #[error("HitBlock offsets end at {0}, but the block holds {1} hits")]
    OffsetOverrun(u64, u64),
}

#[derive(Debug, Error)]
pub enum MergerError {
    #[error("Merger writer failed: {0}")]
    Writer(String),
    #[error("Merger coordinator is no longer accepting blocks")]
    Disconnected,
    #[error("Merger coordinator thread panicked")]
    CoordinatorPanicked,
}

#[derive(Debug, Error)]
pub enum HDFWriterError {
    #[error("HDFWriter failed due to HDF5 error: {0}")]
    HDF5Error(#[from] hdf5::Error),
    #[error("HDFWriter failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("HDFWriter failed to convert a string attribute: {0}")]
    StringError(#[from] hdf5::types::StringError),
    #[error("HDFWriter failed to convert to yaml: {0}")]
    ParsingError(#[from] serde_yaml::Error),
}

impl From<HDFWriterError> for MergerError {
    fn from(value: HDFWriterError) -> Self {
        Self::Writer(value.to_string())
    }
}

#[derive(Debug, Error)]
pub enum HitReaderError {
    #[error("Could not open hit stream because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Hit stream reader failed due to HDF5 error: {0}")]
    HDF5Error(#[from] hdf5::Error),
    #[error("Hit stream does not contain the group {0}")]
    MissingGroup(String),
    #[error("Hit stream contains an invalid block: {0}")]
    BlockError(#[from] HitBlockError),
}

#[derive(Debug, Error)]
pub enum CalibrationRecordError {
    #[error("Calibration record has {0} fields; expected 4")]
    WrongFieldCount(usize),
    #[error("Calibration record has an invalid integer field: {0}")]
    BadInteger(#[from] std::num::ParseIntError),
    #[error("Calibration record has an invalid float field: {0}")]
    BadFloat(#[from] std::num::ParseFloatError),
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("Calibration failed due to hit stream error: {0}")]
    HitReader(#[from] HitReaderError),
    #[error("Calibration failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Calibration failed due to configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Calibration has no hit stream to read; none of the runs have been sorted")]
    NoHitStreams,
    #[error("Calibration failed to format a timestamp: {0}")]
    TimeFormat(#[from] time::error::Format),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config has an invalid detector layout: {0}")]
    InvalidLayout(String),
    #[error("Config has an invalid parameter: {0}")]
    InvalidParameter(String),
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed due to input source error: {0}")]
    Source(#[from] SourceError),
    #[error("Processor failed due to Merger error: {0}")]
    Merger(#[from] MergerError),
    #[error("Processor failed due to HDF writer error: {0}")]
    HDFWriter(#[from] HDFWriterError),
    #[error("Processor failed due to Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Processor has no run range configured")]
    NoRunBatch,
    #[error("Processor worker {0} panicked")]
    WorkerPanicked(usize),
    #[error("Processor failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}
