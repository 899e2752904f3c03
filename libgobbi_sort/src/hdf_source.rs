use hdf5::{Dataset, File};
use ndarray::{s, Array1};
use std::path::{Path, PathBuf};

use super::error::SourceError;
use super::hit::{ChannelReading, RawEvent};
use super::layout::{DetectorLayout, Parameter};
use super::source::{PartitionRange, PartitionReader, ReadStatus, RecordSource};

pub const DEFAULT_TREE_NAME: &str = "t";
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// HDFRecordSource reads the unpacked HINP data from an HDF5 file.
///
/// The file holds one group (the "tree", `t` by default) which contains one 1-D f64
/// dataset per column. Columns are named using DetectorLayout::column_name. Opening the
/// source checks the whole schema: every column must exist, and every column must have
/// the same length. Each partition reader opens its own handle to the file, so the source
/// itself only holds metadata.
#[derive(Debug, Clone)]
pub struct HDFRecordSource {
    path: PathBuf,
    tree_name: String,
    layout: DetectorLayout,
    record_count: u64,
    chunk_size: usize,
}

impl HDFRecordSource {
    /// Open and validate the input file
    pub fn open(
        path: &Path,
        tree_name: &str,
        layout: &DetectorLayout,
        chunk_size: usize,
    ) -> Result<Self, SourceError> {
        if !path.exists() {
            return Err(SourceError::BadFilePath(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let tree = file
            .group(tree_name)
            .map_err(|_| SourceError::MissingGroup(tree_name.to_string()))?;

        let mut record_count: Option<u64> = None;
        for parameter in Parameter::ALL {
            for name in layout.column_names(parameter) {
                let dset = tree
                    .dataset(&name)
                    .map_err(|_| SourceError::MissingColumn(name.clone()))?;
                let shape = dset.shape();
                if shape.len() != 1 {
                    return Err(SourceError::BadColumnShape {
                        column: name,
                        ndim: shape.len(),
                    });
                }
                let length = shape[0] as u64;
                match record_count {
                    None => record_count = Some(length),
                    Some(expected) if expected != length => {
                        return Err(SourceError::ColumnLengthMismatch {
                            column: name,
                            expected,
                            found: length,
                        })
                    }
                    _ => (),
                }
            }
        }

        // The file should not know about more boards or channels than we do
        for name in tree.member_names()? {
            if let Some((_, board, channel)) = layout.parse_column_name(&name) {
                if !layout.contains(board, channel) {
                    return Err(SourceError::UnexpectedColumn(name));
                }
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            tree_name: tree_name.to_string(),
            layout: layout.clone(),
            record_count: record_count.unwrap_or(0),
            chunk_size: chunk_size.max(1),
        })
    }

    /// Size of the input file on disk
    pub fn get_size_bytes(&self) -> u64 {
        self.path.metadata().map(|m| m.len()).unwrap_or(0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSource for HDFRecordSource {
    fn record_count(&self) -> u64 {
        self.record_count
    }

    fn layout(&self) -> &DetectorLayout {
        &self.layout
    }

    fn open_partition(
        &self,
        range: PartitionRange,
    ) -> Result<Box<dyn PartitionReader + '_>, SourceError> {
        self.check_range(&range)?;
        let file = File::open(&self.path)?;
        let tree = file.group(&self.tree_name)?;
        let mut columns: Vec<Vec<Dataset>> = Vec::with_capacity(Parameter::ALL.len());
        for parameter in Parameter::ALL {
            let mut datasets = Vec::with_capacity(self.layout.n_channels());
            for name in self.layout.column_names(parameter) {
                datasets.push(tree.dataset(&name)?);
            }
            columns.push(datasets);
        }
        Ok(Box::new(HDFPartitionReader {
            _file: file,
            columns,
            cursor: range.start,
            end: range.end,
            chunk_size: self.chunk_size as u64,
            chunk: None,
        }))
    }
}

/// A block of rows read from every column at once
struct Chunk {
    start: u64,
    stop: u64,
    // One array per column, per parameter, in Parameter::ALL order
    values: Vec<Vec<Array1<f64>>>,
    // Set if any column came back short for this chunk
    failure: Option<String>,
}

impl Chunk {
    /// Assemble a chunk from the columns read for [start, stop)
    fn new(start: u64, stop: u64, values: Vec<Vec<Array1<f64>>>) -> Self {
        let expected = (stop - start) as usize;
        let failure = values.iter().flatten().enumerate().find_map(|(column, array)| {
            (array.len() != expected).then(|| {
                format!(
                    "column {column} returned {} rows, expected {expected}",
                    array.len()
                )
            })
        });
        Self {
            start,
            stop,
            values,
            failure,
        }
    }

    fn contains(&self, index: u64) -> bool {
        index >= self.start && index < self.stop
    }
}

struct HDFPartitionReader {
    _file: File,
    columns: Vec<Vec<Dataset>>,
    cursor: u64,
    end: u64,
    chunk_size: u64,
    chunk: Option<Chunk>,
}

impl HDFPartitionReader {
    /// Read the next chunk of rows, starting at the cursor.
    ///
    /// A column which cannot be read at all is an I/O error and ends the partition.
    fn load_chunk(&mut self) -> Result<(), SourceError> {
        let start = self.cursor;
        let stop = (start + self.chunk_size).min(self.end);
        let mut values = Vec::with_capacity(self.columns.len());
        for datasets in self.columns.iter() {
            let mut parameter_values = Vec::with_capacity(datasets.len());
            for dset in datasets.iter() {
                parameter_values
                    .push(dset.read_slice_1d::<f64, _>(s![start as usize..stop as usize])?);
            }
            values.push(parameter_values);
        }
        self.chunk = Some(Chunk::new(start, stop, values));
        Ok(())
    }
}

impl PartitionReader for HDFPartitionReader {
    fn next_record(&mut self, event: &mut RawEvent) -> Result<ReadStatus, SourceError> {
        if self.cursor >= self.end {
            return Ok(ReadStatus::End);
        }
        if !self.chunk.as_ref().is_some_and(|c| c.contains(self.cursor)) {
            self.load_chunk()?;
        }
        let index = self.cursor;
        self.cursor += 1;

        let chunk = match self.chunk.as_ref() {
            Some(c) => c,
            None => return Ok(ReadStatus::End),
        };
        if let Some(reason) = &chunk.failure {
            return Ok(ReadStatus::Malformed {
                index,
                reason: reason.clone(),
            });
        }

        let row = (index - chunk.start) as usize;
        let energy = &chunk.values[0];
        let low_energy = &chunk.values[1];
        let time = &chunk.values[2];
        for (column, reading) in event.readings_mut().iter_mut().enumerate() {
            *reading = ChannelReading {
                energy: energy[column][row],
                low_energy: low_energy[column][row],
                time: time[column][row],
            };
        }
        Ok(ReadStatus::Record(index))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hdf5::types::VarLenUnicode;
    use std::str::FromStr;

    /// Write a HINP-style input file. `energy(record, column)` gives the energy of each
    /// column, time is the column index plus the record index and low energy is half the
    /// energy.
    pub(crate) fn write_input_file(
        path: &Path,
        layout: &DetectorLayout,
        n_records: usize,
        energy: impl Fn(usize, usize) -> f64,
    ) {
        let file = File::create(path).unwrap();
        let tree = file.create_group(DEFAULT_TREE_NAME).unwrap();
        for (column, addr) in layout.addresses().enumerate() {
            let board = addr.board as usize;
            let channel = addr.channel as usize;
            let e: Vec<f64> = (0..n_records).map(|r| energy(r, column)).collect();
            let elo: Vec<f64> = e.iter().map(|v| v / 2.0).collect();
            let t: Vec<f64> = (0..n_records).map(|r| (column + r) as f64).collect();
            for (parameter, data) in [
                (Parameter::Energy, &e),
                (Parameter::LowEnergy, &elo),
                (Parameter::Time, &t),
            ] {
                tree.new_dataset_builder()
                    .with_data(data.as_slice())
                    .create(layout.column_name(parameter, board, channel).as_str())
                    .unwrap();
            }
        }
    }

    /// Replace a column of an input file with strings, which cannot be read as numbers
    pub(crate) fn make_column_unreadable(
        path: &Path,
        layout: &DetectorLayout,
        parameter: Parameter,
        board: usize,
        channel: usize,
    ) {
        let file = File::open_rw(path).unwrap();
        let tree = file.group(DEFAULT_TREE_NAME).unwrap();
        let name = layout.column_name(parameter, board, channel);
        let length = tree.dataset(&name).unwrap().shape()[0];
        tree.unlink(&name).unwrap();
        let junk: Vec<VarLenUnicode> = (0..length)
            .map(|_| VarLenUnicode::from_str("junk").unwrap())
            .collect();
        tree.new_dataset_builder()
            .with_data(junk.as_slice())
            .create(name.as_str())
            .unwrap();
    }

    #[test]
    fn test_open_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run-0001.h5");
        let layout = DetectorLayout {
            boards: 2,
            channels: 4,
            ..Default::default()
        };
        write_input_file(&path, &layout, 10, |r, c| if c == r % 8 { 50.0 } else { 0.0 });

        let source = HDFRecordSource::open(&path, DEFAULT_TREE_NAME, &layout, 3).unwrap();
        assert_eq!(source.record_count(), 10);

        let mut reader = source.open_partition(PartitionRange::new(2, 7)).unwrap();
        let mut event = RawEvent::new(&layout);
        let mut seen = Vec::new();
        loop {
            match reader.next_record(&mut event).unwrap() {
                ReadStatus::Record(index) => {
                    let fired: Vec<usize> = event
                        .readings()
                        .iter()
                        .enumerate()
                        .filter(|(_, r)| r.energy != 0.0)
                        .map(|(c, _)| c)
                        .collect();
                    assert_eq!(fired, vec![index as usize % 8]);
                    assert_eq!(event.readings()[1].time, (1 + index) as f64);
                    seen.push(index);
                }
                ReadStatus::Malformed { .. } => panic!("unexpected malformed record"),
                ReadStatus::End => break,
            }
        }
        assert_eq!(seen, vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_missing_column_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run-0002.h5");
        let layout = DetectorLayout {
            boards: 2,
            channels: 4,
            ..Default::default()
        };
        write_input_file(&path, &layout, 5, |_, _| 1.0);

        let bigger = DetectorLayout {
            boards: 3,
            ..layout.clone()
        };
        let err = HDFRecordSource::open(&path, DEFAULT_TREE_NAME, &bigger, 16).unwrap_err();
        assert!(matches!(err, SourceError::MissingColumn(_)));

        let smaller = DetectorLayout {
            boards: 1,
            ..layout
        };
        let err = HDFRecordSource::open(&path, DEFAULT_TREE_NAME, &smaller, 16).unwrap_err();
        assert!(matches!(err, SourceError::UnexpectedColumn(_)));
    }

    #[test]
    fn test_extra_channels_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run-0003.h5");
        let layout = DetectorLayout {
            boards: 2,
            channels: 4,
            ..Default::default()
        };
        write_input_file(&path, &layout, 5, |_, _| 1.0);

        let fewer_channels = DetectorLayout {
            channels: 2,
            ..layout
        };
        let err =
            HDFRecordSource::open(&path, DEFAULT_TREE_NAME, &fewer_channels, 16).unwrap_err();
        match err {
            SourceError::UnexpectedColumn(name) => {
                let (_, board, channel) = fewer_channels.parse_column_name(&name).unwrap();
                assert!(board <= 2 && channel >= 2);
            }
            other => panic!("expected an unexpected column, found {other}"),
        }
    }

    #[test]
    fn test_unreadable_column_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run-0004.h5");
        let layout = DetectorLayout {
            boards: 1,
            channels: 2,
            ..Default::default()
        };
        write_input_file(&path, &layout, 6, |_, _| 1.0);
        make_column_unreadable(&path, &layout, Parameter::Time, 1, 1);

        // Same shape, so the schema is fine; the failure only shows up when reading
        let source = HDFRecordSource::open(&path, DEFAULT_TREE_NAME, &layout, 4).unwrap();
        let mut reader = source.open_partition(PartitionRange::new(0, 6)).unwrap();
        let mut event = RawEvent::new(&layout);
        let err = reader.next_record(&mut event).unwrap_err();
        assert!(matches!(err, SourceError::HDF5Error(_)));
    }

    #[test]
    fn test_short_column_is_malformed() {
        let full = || Array1::<f64>::zeros(3);
        let complete = Chunk::new(0, 3, vec![vec![full(), full()], vec![full(), full()]]);
        assert!(complete.failure.is_none());
        assert!(complete.contains(2) && !complete.contains(3));

        let short = Chunk::new(
            0,
            3,
            vec![vec![full(), full()], vec![full(), Array1::<f64>::zeros(1)]],
        );
        let reason = short.failure.unwrap();
        assert!(reason.contains("returned 1 rows, expected 3"));
    }

    #[test]
    fn test_missing_file_fails() {
        let err = HDFRecordSource::open(
            Path::new("/this/does/not/exist.h5"),
            DEFAULT_TREE_NAME,
            &DetectorLayout::default(),
            16,
        )
        .unwrap_err();
        assert!(matches!(err, SourceError::BadFilePath(_)));
    }
}
