// The HINP readout is addressed by (board, channel). Boards are numbered from 1 in every
// downstream product (hits, gates, calibration files), but internally the dense event
// arrays are indexed from 0, i.e.
// index = (board - 1) * channels + channel
// The same ordering is used to generate the column names of the input file, so if you
// change one you must change the other.
use serde::{Deserialize, Serialize};
use std::fmt::Display;

use super::error::ConfigError;

pub const DEFAULT_BOARD_COUNT: usize = 12;
pub const DEFAULT_CHANNEL_COUNT: usize = 32;
pub const DEFAULT_COLUMN_PREFIX: &str = "SpecTcl_hinp1_mb1_";

/// The three parameters recorded for each channel in the input data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parameter {
    Energy,
    LowEnergy,
    Time,
}

impl Parameter {
    pub const ALL: [Parameter; 3] = [Parameter::Energy, Parameter::LowEnergy, Parameter::Time];

    /// The keyword used for this parameter in the input column names
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Energy => "e",
            Self::LowEnergy => "eLo",
            Self::Time => "t",
        }
    }
}

/// The shape of the readout: how many boards, how many channels per board, and how the
/// input columns are named.
///
/// These used to be compile time constants. They are now part of the configuration and
/// are checked against the input file when it is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorLayout {
    pub boards: usize,
    pub channels: usize,
    pub column_prefix: String,
}

impl Default for DetectorLayout {
    fn default() -> Self {
        Self {
            boards: DEFAULT_BOARD_COUNT,
            channels: DEFAULT_CHANNEL_COUNT,
            column_prefix: String::from(DEFAULT_COLUMN_PREFIX),
        }
    }
}

impl DetectorLayout {
    /// Make sure the layout can be addressed by the hit format (u8 board and channel)
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.boards == 0 || self.boards > u8::MAX as usize {
            return Err(ConfigError::InvalidLayout(format!(
                "board count must be in [1, {}], found {}",
                u8::MAX,
                self.boards
            )));
        }
        if self.channels == 0 || self.channels > (u8::MAX as usize + 1) {
            return Err(ConfigError::InvalidLayout(format!(
                "channel count must be in [1, {}], found {}",
                u8::MAX as usize + 1,
                self.channels
            )));
        }
        Ok(())
    }

    /// Total number of (board, channel) pairs
    pub fn n_channels(&self) -> usize {
        self.boards * self.channels
    }

    /// Dense index of a zero-based board and a channel
    pub fn index(&self, board_idx: usize, channel: usize) -> usize {
        board_idx * self.channels + channel
    }

    /// Name of the input column for a parameter at a (one-based) board and channel
    pub fn column_name(&self, parameter: Parameter, board: usize, channel: usize) -> String {
        format!(
            "{}{}_{:0>2}.{:0>2}",
            self.column_prefix,
            parameter.keyword(),
            board,
            channel
        )
    }

    /// All column names for a parameter, in dense index order
    pub fn column_names(&self, parameter: Parameter) -> Vec<String> {
        self.addresses()
            .map(|addr| self.column_name(parameter, addr.board as usize, addr.channel as usize))
            .collect()
    }

    /// Split an input column name back in to its parameter, board and channel.
    ///
    /// Returns None for names which do not follow the column pattern at all. The board
    /// and channel are not checked against the layout.
    pub fn parse_column_name(&self, name: &str) -> Option<(Parameter, usize, usize)> {
        let rest = name.strip_prefix(self.column_prefix.as_str())?;
        let (keyword, address) = rest.rsplit_once('_')?;
        let parameter = Parameter::ALL
            .into_iter()
            .find(|p| p.keyword() == keyword)?;
        let (board, channel) = address.split_once('.')?;
        Some((parameter, board.parse().ok()?, channel.parse().ok()?))
    }

    /// Is a one-based board and channel part of this layout
    pub fn contains(&self, board: usize, channel: usize) -> bool {
        board >= 1 && board <= self.boards && channel < self.channels
    }

    /// Every channel address in dense index order
    pub fn addresses(&self) -> impl Iterator<Item = ChannelAddress> + '_ {
        (1..=self.boards).flat_map(move |board| {
            (0..self.channels).map(move |channel| ChannelAddress::new(board as u8, channel as u8))
        })
    }
}

/// A (board, channel) pair, with the board numbered from 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelAddress {
    pub board: u8,
    pub channel: u8,
}

impl ChannelAddress {
    pub fn new(board: u8, channel: u8) -> Self {
        Self { board, channel }
    }

    /// Human readable gate used in the diagnostic output
    pub fn gate(&self) -> String {
        format!("board=={} && chan=={}", self.board, self.channel)
    }
}

impl Display for ChannelAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.gate())
    }
}

/// Which silicon layer a board reads out.
///
/// The E detectors have a front and back side, read by alternating boards. The
/// delta E detectors are single sided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectorSide {
    Front,
    Back,
    Delta,
}

impl DetectorSide {
    pub const ALL: [DetectorSide; 3] = [DetectorSide::Front, DetectorSide::Back, DetectorSide::Delta];

    /// Map a board to its detector side and quadrant.
    ///
    /// Boards 1,3,5,7 are E fronts, 2,4,6,8 are E backs and 9-12 are delta E.
    /// Returns None for boards outside of the crate.
    pub fn route(board: u8) -> Option<(Self, u8)> {
        match board {
            1 | 3 | 5 | 7 => Some((Self::Front, (board - 1) / 2)),
            2 | 4 | 6 | 8 => Some((Self::Back, board / 2 - 1)),
            9..=12 => Some((Self::Delta, board - 9)),
            _ => None,
        }
    }
}

impl Display for DetectorSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Front => write!(f, "front"),
            Self::Back => write!(f, "back"),
            Self::Delta => write!(f, "delta"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_names_match_index_order() {
        let layout = DetectorLayout::default();
        let names = layout.column_names(Parameter::Time);
        assert_eq!(names.len(), 384);
        assert_eq!(names[0], "SpecTcl_hinp1_mb1_t_01.00");
        assert_eq!(names[layout.index(0, 31)], "SpecTcl_hinp1_mb1_t_01.31");
        assert_eq!(names[layout.index(9, 5)], "SpecTcl_hinp1_mb1_t_10.05");
        assert_eq!(
            layout.column_name(Parameter::LowEnergy, 12, 31),
            "SpecTcl_hinp1_mb1_eLo_12.31"
        );
    }

    #[test]
    fn test_column_names_parse_back() {
        let layout = DetectorLayout::default();
        assert_eq!(
            layout.parse_column_name("SpecTcl_hinp1_mb1_eLo_12.31"),
            Some((Parameter::LowEnergy, 12, 31))
        );
        assert_eq!(
            layout.parse_column_name("SpecTcl_hinp1_mb1_t_01.40"),
            Some((Parameter::Time, 1, 40))
        );
        assert!(!layout.contains(1, 40));
        assert!(!layout.contains(0, 0));
        assert!(layout.contains(12, 31));
        assert_eq!(layout.parse_column_name("SpecTcl_hinp1_mb1_x_01.00"), None);
        assert_eq!(layout.parse_column_name("run_number"), None);
        assert_eq!(layout.parse_column_name("SpecTcl_hinp1_mb1_e_01"), None);
    }

    #[test]
    fn test_board_routing() {
        assert_eq!(DetectorSide::route(1), Some((DetectorSide::Front, 0)));
        assert_eq!(DetectorSide::route(7), Some((DetectorSide::Front, 3)));
        assert_eq!(DetectorSide::route(2), Some((DetectorSide::Back, 0)));
        assert_eq!(DetectorSide::route(8), Some((DetectorSide::Back, 3)));
        assert_eq!(DetectorSide::route(9), Some((DetectorSide::Delta, 0)));
        assert_eq!(DetectorSide::route(12), Some((DetectorSide::Delta, 3)));
        assert_eq!(DetectorSide::route(0), None);
        assert_eq!(DetectorSide::route(13), None);
    }

    #[test]
    fn test_bad_layout() {
        let layout = DetectorLayout {
            boards: 300,
            ..Default::default()
        };
        assert!(layout.validate().is_err());
        assert!(DetectorLayout::default().validate().is_ok());
    }

    #[test]
    fn test_gate() {
        assert_eq!(ChannelAddress::new(3, 17).gate(), "board==3 && chan==17");
    }
}
