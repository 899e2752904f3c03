use super::layout::DetectorLayout;

/// The raw values of one channel in one event, as they come out of the input file
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelReading {
    pub energy: f64,
    pub low_energy: f64,
    pub time: f64,
}

impl Default for ChannelReading {
    /// A channel that did not fire. The unpacker writes NaN for missing values.
    fn default() -> Self {
        Self {
            energy: f64::NAN,
            low_energy: f64::NAN,
            time: f64::NAN,
        }
    }
}

/// One event of the dense input data: one ChannelReading per (board, channel)
///
/// Readings are stored in dense index order (see DetectorLayout::index)
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    boards: usize,
    channels: usize,
    readings: Vec<ChannelReading>,
}

impl RawEvent {
    /// Create an empty event shaped like the layout
    pub fn new(layout: &DetectorLayout) -> Self {
        Self {
            boards: layout.boards,
            channels: layout.channels,
            readings: vec![ChannelReading::default(); layout.n_channels()],
        }
    }

    pub fn boards(&self) -> usize {
        self.boards
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Get the reading at a zero-based board index and channel
    pub fn reading(&self, board_idx: usize, channel: usize) -> Option<&ChannelReading> {
        if board_idx >= self.boards || channel >= self.channels {
            return None;
        }
        self.readings.get(board_idx * self.channels + channel)
    }

    /// Set the reading at a zero-based board index and channel. Out of range is ignored.
    pub fn set_reading(&mut self, board_idx: usize, channel: usize, reading: ChannelReading) {
        if board_idx < self.boards && channel < self.channels {
            self.readings[board_idx * self.channels + channel] = reading;
        }
    }

    /// All readings in dense index order
    pub fn readings(&self) -> &[ChannelReading] {
        &self.readings
    }

    pub fn readings_mut(&mut self) -> &mut [ChannelReading] {
        &mut self.readings
    }
}

/// A channel that fired in an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Hit {
    pub board: u8,
    pub channel: u8,
    pub energy: u32,
    pub low_energy: i32,
    pub time: i32,
}

/// The hits of one event, ordered by (board, channel)
pub type EventHitSet = Vec<Hit>;

/// HitExtractor reduces a dense RawEvent to the list of channels which fired.
///
/// A channel fired if its energy is a number and not zero. The extractor holds no state
/// so a single one can be shared by any number of workers.
#[derive(Debug, Clone, Copy, Default)]
pub struct HitExtractor;

impl HitExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract the hits of an event into a new EventHitSet
    pub fn extract(&self, event: &RawEvent) -> EventHitSet {
        let mut hits = EventHitSet::new();
        self.extract_into(event, &mut hits);
        hits
    }

    /// Extract the hits of an event into an existing EventHitSet, which is cleared first.
    ///
    /// Workers use this to avoid an allocation per event.
    pub fn extract_into(&self, event: &RawEvent, hits: &mut EventHitSet) {
        hits.clear();
        let mut index: usize;
        let mut reading: &ChannelReading;
        for board in 0..event.boards {
            for channel in 0..event.channels {
                index = board * event.channels + channel; // must match DetectorLayout::index
                reading = &event.readings[index];
                if reading.energy.is_nan() || reading.energy == 0.0 {
                    continue;
                }
                // float -> int casts truncate toward zero and saturate
                hits.push(Hit {
                    board: (board + 1) as u8,
                    channel: channel as u8,
                    energy: reading.energy as u32,
                    low_energy: reading.low_energy as i32,
                    time: reading.time as i32,
                });
            }
        }
    }
}
