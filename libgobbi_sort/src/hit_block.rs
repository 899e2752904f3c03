use super::error::HitBlockError;
use super::hit::Hit;

/// HitBlock is a columnar buffer of the hits of many events.
///
/// Each worker fills one HitBlock with the events of its partition, and hands it to the
/// merger when it is done. The same layout is used on disk. Event `k` of the block owns
/// the hits `offsets[k]..offsets[k + 1]` of the five hit columns, which are always the
/// same length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HitBlock {
    pub partition: usize,
    pub event_id: Vec<u64>,
    pub offsets: Vec<u64>,
    pub board: Vec<u8>,
    pub chan: Vec<u8>,
    pub energy: Vec<u32>,
    pub low_energy: Vec<i32>,
    pub time: Vec<i32>,
}

impl HitBlock {
    /// Create an empty block for a partition
    pub fn new(partition: usize) -> Self {
        Self {
            partition,
            event_id: Vec::new(),
            offsets: vec![0],
            board: Vec::new(),
            chan: Vec::new(),
            energy: Vec::new(),
            low_energy: Vec::new(),
            time: Vec::new(),
        }
    }

    /// Rebuild a block from its columns, checking that they are consistent
    #[allow(clippy::too_many_arguments)]
    pub fn from_columns(
        partition: usize,
        event_id: Vec<u64>,
        offsets: Vec<u64>,
        board: Vec<u8>,
        chan: Vec<u8>,
        energy: Vec<u32>,
        low_energy: Vec<i32>,
        time: Vec<i32>,
    ) -> Result<Self, HitBlockError> {
        let n_hits = board.len();
        for (name, len) in [
            ("chan", chan.len()),
            ("e", energy.len()),
            ("eLo", low_energy.len()),
            ("t", time.len()),
        ] {
            if len != n_hits {
                return Err(HitBlockError::MisalignedColumn {
                    column: name.to_string(),
                    expected: n_hits,
                    found: len,
                });
            }
        }
        if offsets.len() != event_id.len() + 1 {
            return Err(HitBlockError::BadOffsetCount(offsets.len(), event_id.len()));
        }
        if offsets[0] != 0 || offsets.windows(2).any(|w| w[0] > w[1]) {
            return Err(HitBlockError::OffsetsNotMonotonic);
        }
        if offsets[offsets.len() - 1] != n_hits as u64 {
            return Err(HitBlockError::OffsetOverrun(
                offsets[offsets.len() - 1],
                n_hits as u64,
            ));
        }
        Ok(Self {
            partition,
            event_id,
            offsets,
            board,
            chan,
            energy,
            low_energy,
            time,
        })
    }

    /// Append the hits of one event
    pub fn push_event(&mut self, event_id: u64, hits: &[Hit]) {
        self.event_id.push(event_id);
        for hit in hits {
            self.board.push(hit.board);
            self.chan.push(hit.channel);
            self.energy.push(hit.energy);
            self.low_energy.push(hit.low_energy);
            self.time.push(hit.time);
        }
        self.offsets.push(self.board.len() as u64);
    }

    pub fn n_events(&self) -> usize {
        self.event_id.len()
    }

    pub fn n_hits(&self) -> usize {
        self.board.len()
    }

    pub fn is_empty(&self) -> bool {
        self.event_id.is_empty()
    }

    /// The hit at a flat hit index
    pub fn hit(&self, idx: usize) -> Hit {
        Hit {
            board: self.board[idx],
            channel: self.chan[idx],
            energy: self.energy[idx],
            low_energy: self.low_energy[idx],
            time: self.time[idx],
        }
    }

    /// The source event id and the hits of the event at position `idx` in the block
    pub fn event(&self, idx: usize) -> Option<(u64, Vec<Hit>)> {
        let id = *self.event_id.get(idx)?;
        let start = self.offsets[idx] as usize;
        let stop = self.offsets[idx + 1] as usize;
        Some((id, (start..stop).map(|i| self.hit(i)).collect()))
    }

    /// Iterate over (event id, hits) in block order
    pub fn events(&self) -> impl Iterator<Item = (u64, Vec<Hit>)> + '_ {
        (0..self.n_events()).filter_map(|idx| self.event(idx))
    }

    /// Iterate over every hit in the block, ignoring event boundaries
    pub fn hits(&self) -> impl Iterator<Item = Hit> + '_ {
        (0..self.n_hits()).map(|idx| self.hit(idx))
    }
}
