//! # gobbi_sort
//!
//! gobbi_sort is the hit sorter and time calibrator for the Gobbi silicon array, written in
//! Rust. It takes the unpacked HINP readout (one record per event, with an energy, low gain
//! energy, and time column for every board and channel) and reduces each event to the
//! list of channels which actually fired. The resulting hit stream is written to HDF5, and
//! can then be used to derive the per-channel time calibration from a pulser run.
//!
//! ## Installation
//!
//! The only method of install is from source.
//!
//! ### Rust
//!
//! If you have not used Rust before, you will most likely need to install the Rust tool
//! chain. See the [Rust docs](https://www.rust-lang.org/tools/install) for installation
//! instructions.
//!
//! ### HDF5
//!
//! Before building and running gobbi_sort, HDF5 must be installed. Typically this will
//! be installed using a package manager (homebrew, apt, etc), and the Rust libraries will
//! auto detect the location of the HDF install. If HDF5 lives somewhere custom, write the
//! following snippet into the file `.cargo/config.toml` in the repository:
//!
//! ```toml
//! [env]
//! HDF5_DIR="/path/to/my/hdf5/install/"
//!
//! [build]
//! rustflags="-C link-args=-Wl,-rpath,/path/to/my/hdf5/install/lib"
//! ```
//!
//! ### Building & Install
//!
//! To build and install the CLI use `cargo install --path ./gobbi_sort_cli` from the top
//! level of the repository.
//!
//! ## Usage
//!
//! The CLI has three subcommands, each taking a configuration file with `-p`:
//!
//! - `new`: write a template configuration
//! - `sort`: extract the hits of the input file and write the hit stream
//! - `calibrate`: build the per-channel time histograms from the hit stream and run the
//! pulser time calibration
//!
//! ## Configuration
//!
//! The YAML format of a configuration file is as follows:
//!
//! ```yml
//! input_path: /data/run_0042.h5
//! input_group: t
//! hit_path: /data/hits_0042.h5
//! n_threads: 4
//! update_rate: 10000
//! chunk_size: 4096
//! progress_width: null
//! layout:
//!   boards: 12
//!   channels: 32
//!   column_prefix: SpecTcl_hinp1_mb1_
//! calibration:
//!   output_dir: .
//!   front_file: FrontTimecalPulser.txt
//!   back_file: BackTimecalPulser.txt
//!   delta_file: DeltaTimecalPulser.txt
//!   diagnostic_file: timeCal_ConsoleOutput.txt
//!   save_histograms: true
//!   histogram:
//!     bins: 4096
//!     low: 0.0
//!     high: 16384.0
//!   peak_search:
//!     sigma: 2.0
//!     threshold: 0.05
//!     max_peaks: 100
//!     remove_background: true
//!     background_window: 20
//!     markov_smoothing: true
//!     markov_window: 3
//!   cutoff: 15000.0
//!   fit_half_width: 300.0
//!   initial_sigma: 10.0
//!   max_sigma: 100.0
//!   reference_interval_ns: 20.0
//!   fit:
//!     max_iterations: 1000
//!     edm_tolerance: 2.0e-5
//!   parallel: false
//! runs: null
//! ```
//!
//! `n_threads` is the number of partitions the input is split in to. Each partition gets
//! its own worker; if there are fewer records than partitions, only the workers with
//! something to do are created.
//!
//! ### Run batches
//!
//! To sort a range of runs in one go, give a `runs` section instead of relying on
//! `input_path` and `hit_path`:
//!
//! ```yml
//! runs:
//!   input_dir: /data/root/
//!   hit_dir: /data/hits/
//!   first_run_number: 40
//!   last_run_number: 45
//!   input_template: run-{run}.h5
//!   hit_template: hits-{run}.h5
//! ```
//!
//! `{run}` is replaced by the run number padded to four digits. `sort` then works through
//! the runs in order, writing one hit stream per run; runs without an input file, or whose
//! input fails its checks, are logged and skipped. `calibrate` fills the histograms from
//! every hit stream of the batch which exists. If a run fails while being sorted, its
//! partial hit stream is deleted.
//!
//! ## Input
//!
//! The input is an HDF5 file with a group (`input_group`) holding one 1-D float dataset per
//! column, named `<prefix><par>_<BB>.<CC>` where `par` is one of `e`, `eLo`, `t`, `BB` is
//! the board numbered from 01 and `CC` the channel numbered from 00. Every column of the
//! configured layout must be present, and all must have the same length.
//!
//! ## Output
//!
//! ### Hit stream
//!
//! ```text
//! hits.h5
//! hits - n_blocks, n_events, n_hits, boards, channels, version
//! |---- block_# - partition, first_event, n_events, n_hits
//! |    |---- event_id(dset)
//! |    |---- offsets(dset)
//! |    |---- board(dset)
//! |    |---- chan(dset)
//! |    |---- e(dset)
//! |    |---- eLo(dset)
//! |    |---- t(dset)
//! ```
//!
//! Event k of a block owns the hits `offsets[k]..offsets[k+1]`. A small yaml file with the
//! input file name and size is written next to the hit stream.
//!
//! ### Time calibration
//!
//! One text file per detector side (front, back, delta), with a line
//! `<quadrant> <channel> <slope> <offset>` for every calibrated channel. Channels which
//! could not be calibrated are listed in the diagnostic file, along with the peaks which
//! were found, and their time histogram is dumped as CSV next to it.
pub mod calibration;
pub mod config;
pub mod error;
pub mod fit;
pub mod hdf_source;
pub mod hdf_writer;
pub mod histogram;
pub mod hit;
pub mod hit_block;
pub mod hit_reader;
pub mod layout;
pub mod merger;
pub mod peak;
pub mod process;
pub mod progress;
pub mod source;
