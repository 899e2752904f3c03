use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::io::Write;

use super::error::{ConfigError, HitReaderError};
use super::hit_block::HitBlock;
use super::hit_reader::HitStreamReader;
use super::layout::ChannelAddress;

/// Binning of the time histograms. The HINP TDC range is 2^14 channels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistogramSpec {
    pub bins: usize,
    pub low: f64,
    pub high: f64,
}

impl Default for HistogramSpec {
    fn default() -> Self {
        Self {
            bins: 4096,
            low: 0.0,
            high: 16384.0,
        }
    }
}

impl HistogramSpec {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bins == 0 || !(self.low < self.high) {
            return Err(ConfigError::InvalidParameter(format!(
                "histogram needs at least one bin and low < high, found {} bins over [{}, {})",
                self.bins, self.low, self.high
            )));
        }
        Ok(())
    }

    pub fn bin_width(&self) -> f64 {
        (self.high - self.low) / self.bins as f64
    }
}

/// A 1-D histogram of the hit times of one channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelTimeHistogram {
    address: ChannelAddress,
    spec: HistogramSpec,
    counts: Vec<u64>,
    underflow: u64,
    overflow: u64,
}

impl ChannelTimeHistogram {
    pub fn new(address: ChannelAddress, spec: HistogramSpec) -> Self {
        Self {
            address,
            spec,
            counts: vec![0; spec.bins],
            underflow: 0,
            overflow: 0,
        }
    }

    pub fn address(&self) -> ChannelAddress {
        self.address
    }

    pub fn spec(&self) -> &HistogramSpec {
        &self.spec
    }

    pub fn fill(&mut self, x: f64) {
        self.fill_n(x, 1);
    }

    pub fn fill_n(&mut self, x: f64, n: u64) {
        if x.is_nan() {
            return;
        }
        if x < self.spec.low {
            self.underflow += n;
        } else if x >= self.spec.high {
            self.overflow += n;
        } else {
            let bin = ((x - self.spec.low) / self.spec.bin_width()) as usize;
            // Rounding can push values just under the upper edge in to the next bin
            let bin = bin.min(self.spec.bins - 1);
            self.counts[bin] += n;
        }
    }

    pub fn n_bins(&self) -> usize {
        self.counts.len()
    }

    pub fn bin_low_edge(&self, bin: usize) -> f64 {
        self.spec.low + bin as f64 * self.spec.bin_width()
    }

    pub fn bin_center(&self, bin: usize) -> f64 {
        self.bin_low_edge(bin) + 0.5 * self.spec.bin_width()
    }

    /// Bin holding the value x, if x is in range
    pub fn find_bin(&self, x: f64) -> Option<usize> {
        if x.is_nan() || x < self.spec.low || x >= self.spec.high {
            return None;
        }
        Some((((x - self.spec.low) / self.spec.bin_width()) as usize).min(self.spec.bins - 1))
    }

    pub fn content(&self, bin: usize) -> u64 {
        self.counts.get(bin).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn underflow(&self) -> u64 {
        self.underflow
    }

    pub fn overflow(&self) -> u64 {
        self.overflow
    }

    /// Number of in-range entries
    pub fn integral(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.integral() == 0
    }

    /// Dump the histogram as CSV: a header, then one line per bin
    pub fn write_csv<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writeln!(
            writer,
            "# {} underflow={} overflow={}",
            self.address.gate(),
            self.underflow,
            self.overflow
        )?;
        writeln!(writer, "bin_low,bin_center,content")?;
        for (bin, count) in self.counts.iter().enumerate() {
            writeln!(
                writer,
                "{},{},{}",
                self.bin_low_edge(bin),
                self.bin_center(bin),
                count
            )?;
        }
        Ok(())
    }
}

/// The time histograms of every channel which was hit, created on first use
#[derive(Debug, Clone)]
pub struct HistogramRegistry {
    spec: HistogramSpec,
    histograms: FxHashMap<ChannelAddress, ChannelTimeHistogram>,
}

impl HistogramRegistry {
    pub fn new(spec: HistogramSpec) -> Self {
        Self {
            spec,
            histograms: FxHashMap::default(),
        }
    }

    pub fn spec(&self) -> &HistogramSpec {
        &self.spec
    }

    pub fn fill(&mut self, address: ChannelAddress, time: f64) {
        let spec = self.spec;
        self.histograms
            .entry(address)
            .or_insert_with(|| ChannelTimeHistogram::new(address, spec))
            .fill(time);
    }

    /// Add the time of every hit in a block
    pub fn fill_block(&mut self, block: &HitBlock) {
        for hit in block.hits() {
            self.fill(ChannelAddress::new(hit.board, hit.channel), hit.time as f64);
        }
    }

    /// Accumulate an entire hit stream. Returns the number of blocks read.
    pub fn fill_stream(&mut self, reader: &mut HitStreamReader) -> Result<u64, HitReaderError> {
        let mut n_blocks = 0;
        for block in reader {
            self.fill_block(&block?);
            n_blocks += 1;
        }
        Ok(n_blocks)
    }

    pub fn get(&self, address: &ChannelAddress) -> Option<&ChannelTimeHistogram> {
        self.histograms.get(address)
    }

    /// Number of channels with a histogram
    pub fn len(&self) -> usize {
        self.histograms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histograms.is_empty()
    }
}
