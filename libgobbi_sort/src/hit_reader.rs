use hdf5::types::VarLenUnicode;
use hdf5::{File, Group};
use std::path::{Path, PathBuf};

use super::error::HitReaderError;
use super::hdf_writer::{
    BLOCK_PREFIX, BOARD_NAME, CHAN_NAME, ENERGY_NAME, EVENT_ID_NAME, HITS_NAME, LOW_ENERGY_NAME,
    OFFSETS_NAME, TIME_NAME,
};
use super::hit_block::HitBlock;

/// HitStreamReader reads a hit stream written by HDFHitWriter back, one block at a time.
#[derive(Debug)]
pub struct HitStreamReader {
    _file: File,
    path: PathBuf,
    hits_group: Group,
    n_blocks: u64,
    n_events: u64,
    n_hits: u64,
    boards: u64,
    channels: u64,
    version: String,
    next_block: u64,
}

impl HitStreamReader {
    pub fn open(path: &Path) -> Result<Self, HitReaderError> {
        if !path.exists() {
            return Err(HitReaderError::BadFilePath(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let hits_group = file
            .group(HITS_NAME)
            .map_err(|_| HitReaderError::MissingGroup(String::from(HITS_NAME)))?;
        let n_blocks = hits_group.attr("n_blocks")?.read_scalar::<u64>()?;
        let n_events = hits_group.attr("n_events")?.read_scalar::<u64>()?;
        let n_hits = hits_group.attr("n_hits")?.read_scalar::<u64>()?;
        let boards = hits_group.attr("boards")?.read_scalar::<u64>()?;
        let channels = hits_group.attr("channels")?.read_scalar::<u64>()?;
        let version = hits_group
            .attr("version")?
            .read_scalar::<VarLenUnicode>()?
            .as_str()
            .to_string();
        log::info!(
            "Opened hit stream {} ({version}) with {n_blocks} blocks, {n_events} events and {n_hits} hits",
            path.display()
        );
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
            hits_group,
            n_blocks,
            n_events,
            n_hits,
            boards,
            channels,
            version,
            next_block: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn n_blocks(&self) -> u64 {
        self.n_blocks
    }

    pub fn n_events(&self) -> u64 {
        self.n_events
    }

    pub fn n_hits(&self) -> u64 {
        self.n_hits
    }

    /// The (boards, channels) the stream was written with
    pub fn layout_shape(&self) -> (u64, u64) {
        (self.boards, self.channels)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Read the next block of the stream. Returns None once every block was read.
    pub fn next_block(&mut self) -> Result<Option<HitBlock>, HitReaderError> {
        if self.next_block >= self.n_blocks {
            return Ok(None);
        }
        let block = self.read_block(self.next_block)?;
        self.next_block += 1;
        Ok(Some(block))
    }

    fn read_block(&self, index: u64) -> Result<HitBlock, HitReaderError> {
        let name = format!("{BLOCK_PREFIX}{index}");
        let block_group = self
            .hits_group
            .group(&name)
            .map_err(|_| HitReaderError::MissingGroup(name.clone()))?;
        let partition = block_group.attr("partition")?.read_scalar::<u64>()? as usize;
        let n_hits = block_group.attr("n_hits")?.read_scalar::<u64>()?;

        let event_id = block_group.dataset(EVENT_ID_NAME)?.read_raw::<u64>()?;
        let offsets = block_group.dataset(OFFSETS_NAME)?.read_raw::<u64>()?;
        let block = if n_hits == 0 {
            HitBlock::from_columns(
                partition,
                event_id,
                offsets,
                Vec::new(),
                Vec::new(),
                Vec::new(),
                Vec::new(),
                Vec::new(),
            )?
        } else {
            HitBlock::from_columns(
                partition,
                event_id,
                offsets,
                block_group.dataset(BOARD_NAME)?.read_raw::<u8>()?,
                block_group.dataset(CHAN_NAME)?.read_raw::<u8>()?,
                block_group.dataset(ENERGY_NAME)?.read_raw::<u32>()?,
                block_group.dataset(LOW_ENERGY_NAME)?.read_raw::<i32>()?,
                block_group.dataset(TIME_NAME)?.read_raw::<i32>()?,
            )?
        };
        Ok(block)
    }
}

impl Iterator for HitStreamReader {
    type Item = Result<HitBlock, HitReaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_block().transpose()
    }
}
