use hdf5::types::VarLenUnicode;
use hdf5::File;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::error::{HDFWriterError, MergerError};
use super::hit_block::HitBlock;
use super::layout::DetectorLayout;
use super::merger::HitStreamWriter;

pub const HITS_NAME: &str = "hits";
pub const BLOCK_PREFIX: &str = "block_";
pub const EVENT_ID_NAME: &str = "event_id";
pub const OFFSETS_NAME: &str = "offsets";
pub const BOARD_NAME: &str = "board";
pub const CHAN_NAME: &str = "chan";
pub const ENERGY_NAME: &str = "e";
pub const LOW_ENERGY_NAME: &str = "eLo";
pub const TIME_NAME: &str = "t";

/// This is the version of the output format
const FORMAT_VERSION: &str = "1.0";

// Structure
// hits - n_blocks, n_events, n_hits, boards, channels, version
// |---- block_# - partition, first_event, n_events, n_hits
// |    |---- event_id(dset)
// |    |---- offsets(dset)
// |    |---- board(dset)
// |    |---- chan(dset)
// |    |---- e(dset)
// |    |---- eLo(dset)
// |    |---- t(dset)
// The hit columns are only written for blocks with at least one hit.

/// What was written once a hit stream is closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenHitStream {
    pub path: PathBuf,
    pub blocks: u64,
    pub events: u64,
    pub hits: u64,
}

/// A simple struct which wraps around the hdf5-rust library.
///
/// Opens an HDF5 file for writing the sorted hit stream, one group per HitBlock.
/// Only ever used by the merger's coordinator thread.
#[derive(Debug)]
pub struct HDFHitWriter {
    file_handle: File,
    path: PathBuf,
    hits_group: hdf5::Group,
    n_blocks: u64,
    n_events: u64,
    n_hits: u64,
}

impl HDFHitWriter {
    /// Create the writer, opening a file at path and creating the hits group
    pub fn new(path: &Path, layout: &DetectorLayout) -> Result<Self, HDFWriterError> {
        let file_handle = File::create(path)?;
        let version = format!("{}:{}", env!("CARGO_PKG_NAME"), FORMAT_VERSION);

        let hits_group = file_handle.create_group(HITS_NAME)?;
        hits_group.new_attr::<u64>().create("n_blocks")?;
        hits_group.new_attr::<u64>().create("n_events")?;
        hits_group.new_attr::<u64>().create("n_hits")?;
        hits_group
            .new_attr::<u64>()
            .create("boards")?
            .write_scalar(&(layout.boards as u64))?;
        hits_group
            .new_attr::<u64>()
            .create("channels")?
            .write_scalar(&(layout.channels as u64))?;
        hits_group
            .new_attr::<VarLenUnicode>()
            .create("version")?
            .write_scalar(&VarLenUnicode::from_str(&version)?)?;

        Ok(Self {
            file_handle,
            path: path.to_path_buf(),
            hits_group,
            n_blocks: 0,
            n_events: 0,
            n_hits: 0,
        })
    }

    /// Write a block in to its own group. Empty blocks are not written.
    pub fn write_hit_block(&mut self, block: &HitBlock) -> Result<(), HDFWriterError> {
        if block.is_empty() {
            log::debug!("Skipping empty block from partition {}", block.partition);
            return Ok(());
        }
        let block_group = self
            .hits_group
            .create_group(&format!("{BLOCK_PREFIX}{}", self.n_blocks))?;
        block_group
            .new_attr::<u64>()
            .create("partition")?
            .write_scalar(&(block.partition as u64))?;
        block_group
            .new_attr::<u64>()
            .create("first_event")?
            .write_scalar(&block.event_id[0])?;
        block_group
            .new_attr::<u64>()
            .create("n_events")?
            .write_scalar(&(block.n_events() as u64))?;
        block_group
            .new_attr::<u64>()
            .create("n_hits")?
            .write_scalar(&(block.n_hits() as u64))?;

        block_group
            .new_dataset_builder()
            .with_data(block.event_id.as_slice())
            .create(EVENT_ID_NAME)?;
        block_group
            .new_dataset_builder()
            .with_data(block.offsets.as_slice())
            .create(OFFSETS_NAME)?;
        if block.n_hits() > 0 {
            block_group
                .new_dataset_builder()
                .with_data(block.board.as_slice())
                .create(BOARD_NAME)?;
            block_group
                .new_dataset_builder()
                .with_data(block.chan.as_slice())
                .create(CHAN_NAME)?;
            block_group
                .new_dataset_builder()
                .with_data(block.energy.as_slice())
                .create(ENERGY_NAME)?;
            block_group
                .new_dataset_builder()
                .with_data(block.low_energy.as_slice())
                .create(LOW_ENERGY_NAME)?;
            block_group
                .new_dataset_builder()
                .with_data(block.time.as_slice())
                .create(TIME_NAME)?;
        }

        self.n_blocks += 1;
        self.n_events += block.n_events() as u64;
        self.n_hits += block.n_hits() as u64;
        Ok(())
    }

    /// Write the totals and close the file
    pub fn finalize(self) -> Result<WrittenHitStream, HDFWriterError> {
        self.hits_group
            .attr("n_blocks")?
            .write_scalar(&self.n_blocks)?;
        self.hits_group
            .attr("n_events")?
            .write_scalar(&self.n_events)?;
        self.hits_group.attr("n_hits")?.write_scalar(&self.n_hits)?;
        self.file_handle.flush()?;
        log::info!(
            "{} events ({} hits) written in {} blocks to {}",
            self.n_events,
            self.n_hits,
            self.n_blocks,
            self.path.display()
        );
        Ok(WrittenHitStream {
            path: self.path,
            blocks: self.n_blocks,
            events: self.n_events,
            hits: self.n_hits,
        })
    }
}

impl HitStreamWriter for HDFHitWriter {
    type Output = WrittenHitStream;

    fn write_block(&mut self, block: &HitBlock) -> Result<(), MergerError> {
        Ok(self.write_hit_block(block)?)
    }

    fn close(self) -> Result<Self::Output, MergerError> {
        Ok(self.finalize()?)
    }
}

/// Write the input file information in a yaml file next to the hit stream
///
/// The sidecar is named after the hit stream, e.g. `hits.h5` gets `hits.yml`.
pub fn write_fileinfo(hit_path: &Path, input_path: &Path) -> Result<PathBuf, HDFWriterError> {
    let stem = hit_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| String::from(HITS_NAME));
    let info_path = match hit_path.parent() {
        Some(parent) => parent.join(format!("{stem}.yml")),
        None => PathBuf::from(format!("{stem}.yml")),
    };

    let size = input_path.metadata()?.len();
    let mut file_map = BTreeMap::<String, String>::new();
    file_map.insert(
        String::from("input_file_name"),
        input_path.to_string_lossy().to_string(),
    );
    file_map.insert(
        String::from("input_file_size"),
        human_bytes::human_bytes(size as f64),
    );
    file_map.insert(
        String::from("version"),
        format!("{}:{}", env!("CARGO_PKG_NAME"), FORMAT_VERSION),
    );

    let mut info_file = std::fs::File::create(&info_path)?;
    info_file.write_all(serde_yaml::to_string(&file_map)?.as_bytes())?;
    Ok(info_path)
}
