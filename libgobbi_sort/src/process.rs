use std::path::{Path, PathBuf};

use super::calibration::{
    run_time_calibration, CalibrationSummary, CalibrationWriter,
};
use super::config::Config;
use super::error::{CalibrationError, ConfigError, ProcessorError};
use super::hdf_source::HDFRecordSource;
use super::hdf_writer::{write_fileinfo, HDFHitWriter, WrittenHitStream};
use super::histogram::HistogramRegistry;
use super::hit::{EventHitSet, HitExtractor, RawEvent};
use super::hit_block::HitBlock;
use super::hit_reader::HitStreamReader;
use super::merger::{MergeSummary, ResultMerger};
use super::peak::PeakFinder;
use super::progress::{ProgressSurface, ProgressTracker};
use super::source::{create_partitions, PartitionRange, ReadStatus, RecordSource};

/// Controls for a processing run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Number of partitions, and so the maximum number of workers
    pub n_partitions: usize,
    /// Records between progress updates of a worker
    pub update_rate: u64,
}

impl ProcessOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            n_partitions: config.n_threads,
            update_rate: config.update_rate,
        }
    }
}

/// What one worker did with its partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub partition: usize,
    pub range: PartitionRange,
    pub records_read: u64,
    pub records_skipped: u64,
    pub events: u64,
    pub hits: u64,
}

/// Totals of a processing run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub partitions: usize,
    pub records_read: u64,
    pub records_skipped: u64,
    pub events: u64,
    pub hits: u64,
    pub workers: Vec<WorkerReport>,
}

impl ProcessSummary {
    fn add(&mut self, report: WorkerReport) {
        self.partitions += 1;
        self.records_read += report.records_read;
        self.records_skipped += report.records_skipped;
        self.events += report.events;
        self.hits += report.hits;
        self.workers.push(report);
    }
}

/// The body of a worker: extract the hits of every record in a partition in to a private
/// HitBlock, then hand the block to the merger.
///
/// If anything fails the sink is dropped uncommitted and the merger discards whatever it
/// was given.
fn process_partition<S, O>(
    source: &S,
    range: PartitionRange,
    partition: usize,
    merger: &ResultMerger<O>,
    tracker: &ProgressTracker,
    update_rate: u64,
) -> Result<WorkerReport, ProcessorError>
where
    S: RecordSource + ?Sized,
    O: Send + 'static,
{
    let sink = merger.acquire_sink();
    let mut reader = source.open_partition(range)?;
    let extractor = HitExtractor::new();
    let mut event = RawEvent::new(source.layout());
    let mut hits = EventHitSet::new();
    let mut block = HitBlock::new(partition);
    let mut report = WorkerReport {
        partition,
        range,
        records_read: 0,
        records_skipped: 0,
        events: 0,
        hits: 0,
    };

    let mut since_update: u64 = 0;
    loop {
        match reader.next_record(&mut event)? {
            ReadStatus::Record(index) => {
                extractor.extract_into(&event, &mut hits);
                block.push_event(index, &hits);
                report.records_read += 1;
            }
            ReadStatus::Malformed { index, reason } => {
                log::warn!("Worker {partition} skipped malformed record {index}: {reason}");
                report.records_skipped += 1;
            }
            ReadStatus::End => break,
        }
        since_update += 1;
        if since_update >= update_rate {
            tracker.increment(since_update as f64);
            tracker.render();
            since_update = 0;
        }
    }
    if since_update > 0 {
        tracker.increment(since_update as f64);
        tracker.render();
    }

    report.events = block.n_events() as u64;
    report.hits = block.n_hits() as u64;
    sink.write(block)?;
    sink.commit()?;
    Ok(report)
}

/// The main loop of gobbi_sort.
///
/// Splits the source in to partitions and runs one worker thread per non-empty partition.
/// Each worker extracts hits in to its own buffer and flushes it through its own merger
/// sink once it reaches the end of its partition. Returns once every worker is done; the
/// caller still has to finish the merger.
pub fn process<S, O>(
    source: &S,
    merger: &ResultMerger<O>,
    tracker: &ProgressTracker,
    options: &ProcessOptions,
) -> Result<ProcessSummary, ProcessorError>
where
    S: RecordSource + ?Sized,
    O: Send + 'static,
{
    let record_count = source.record_count();
    let partitions: Vec<PartitionRange> = create_partitions(record_count, options.n_partitions)
        .into_iter()
        .filter(|range| !range.is_empty())
        .collect();
    let update_rate = options.update_rate.max(1);
    log::info!(
        "Processing {record_count} records with {} worker(s)...",
        partitions.len()
    );

    tracker.set_range(0.0, record_count as f64);
    tracker.set_position(0.0);
    tracker.render();

    let results: Vec<(usize, std::thread::Result<Result<WorkerReport, ProcessorError>>)> =
        std::thread::scope(|scope| {
            let handles: Vec<_> = partitions
                .iter()
                .enumerate()
                .map(|(partition, range)| {
                    let range = *range;
                    let handle = scope.spawn(move || {
                        process_partition(source, range, partition, merger, tracker, update_rate)
                    });
                    (partition, handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(partition, handle)| (partition, handle.join()))
                .collect()
        });

    let mut summary = ProcessSummary::default();
    let mut failure: Option<ProcessorError> = None;
    for (partition, result) in results {
        match result {
            Ok(Ok(report)) => summary.add(report),
            Ok(Err(e)) => {
                log::error!("Worker {partition} failed: {e}");
                failure.get_or_insert(e);
            }
            Err(_) => {
                log::error!("Worker {partition} panicked");
                failure.get_or_insert(ProcessorError::WorkerPanicked(partition));
            }
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }

    if summary.records_skipped > 0 {
        log::warn!(
            "{} malformed record(s) were skipped",
            summary.records_skipped
        );
    }
    log::info!(
        "Extracted {} hits from {} events",
        summary.hits,
        summary.events
    );
    Ok(summary)
}

/// Everything a sort run produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSummary {
    pub process: ProcessSummary,
    pub merge: MergeSummary,
    pub written: WrittenHitStream,
    pub fileinfo_path: PathBuf,
}

/// Open and check the input of a run, before anything is written
fn open_run_source(config: &Config) -> Result<HDFRecordSource, ProcessorError> {
    config.validate()?;
    let source = HDFRecordSource::open(
        &config.input_path,
        &config.input_group,
        &config.layout,
        config.chunk_size,
    )?;
    log::info!(
        "Input {} has {} records ({})",
        config.input_path.display(),
        source.record_count(),
        human_bytes::human_bytes(source.get_size_bytes() as f64)
    );
    Ok(source)
}

/// A hit stream which was not completely written must not look like a finished one
fn remove_incomplete_hit_stream(path: &Path) {
    if !path.exists() {
        return;
    }
    match std::fs::remove_file(path) {
        Ok(()) => log::warn!("Removed incomplete hit stream {}", path.display()),
        Err(e) => log::error!(
            "Could not remove incomplete hit stream {}: {e}",
            path.display()
        ),
    }
}

/// Extract the hits of an opened source in to the hit stream of the config
fn sort_source(
    config: &Config,
    source: &HDFRecordSource,
    surface: Box<dyn ProgressSurface>,
) -> Result<SortSummary, ProcessorError> {
    let hit_path = config.hit_path.clone();
    let layout = config.layout.clone();
    let merger = ResultMerger::spawn(move || Ok(HDFHitWriter::new(&hit_path, &layout)?))?;
    let tracker = ProgressTracker::new(surface);

    let result = process(source, &merger, &tracker, &ProcessOptions::from_config(config));
    // Always wind down the coordinator so the file is closed, even if a worker failed
    let finished = merger.finish();
    let outcome = match (result, finished) {
        (Ok(summary), Ok(finished)) => Ok((summary, finished)),
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => Err(ProcessorError::from(e)),
    };
    let (process_summary, (written, merge)) = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            remove_incomplete_hit_stream(&config.hit_path);
            return Err(e);
        }
    };

    let fileinfo_path = write_fileinfo(&config.hit_path, &config.input_path)?;
    log::info!(
        "Wrote {} events in {} blocks to {}",
        written.events,
        written.blocks,
        written.path.display()
    );
    Ok(SortSummary {
        process: process_summary,
        merge,
        written,
        fileinfo_path,
    })
}

/// Sort an input file in to a hit stream, as described by the config.
///
/// The input is opened and checked, and the output created, before any worker starts. If
/// a worker fails the partial hit stream is deleted.
pub fn sort_run(
    config: &Config,
    surface: Box<dyn ProgressSurface>,
) -> Result<SortSummary, ProcessorError> {
    let source = open_run_source(config)?;
    sort_source(config, &source, surface)
}

/// What a batch of runs produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Every run which was sorted, in run order
    pub runs: Vec<(i32, SortSummary)>,
    /// Runs which do not exist or whose input could not be opened
    pub skipped: Vec<i32>,
}

/// Sort every run of the configured run range, one hit stream per run.
///
/// Runs without an input file, or whose input fails its checks, are logged and skipped.
/// A failure while sorting a run stops the batch. `make_surface` is called once per run
/// which is actually sorted.
pub fn sort_batch(
    config: &Config,
    mut make_surface: impl FnMut(i32) -> Box<dyn ProgressSurface>,
) -> Result<BatchSummary, ProcessorError> {
    config.validate()?;
    let runs = config.runs.as_ref().ok_or(ProcessorError::NoRunBatch)?;
    if !runs.hit_dir.exists() {
        return Err(ConfigError::BadFilePath(runs.hit_dir.clone()).into());
    }

    let mut summary = BatchSummary::default();
    for run in config.run_numbers() {
        let run_config = match config.run_config(run) {
            Some(run_config) if config.does_run_exist(run) => run_config,
            _ => {
                log::info!("Run {} does not exist, skipping...", run);
                summary.skipped.push(run);
                continue;
            }
        };
        let source = match open_run_source(&run_config) {
            Ok(source) => source,
            Err(e) => {
                log::warn!("Run {} could not be opened, skipping: {e}", run);
                summary.skipped.push(run);
                continue;
            }
        };
        log::info!("Processing run {}...", run);
        let sorted = sort_source(&run_config, &source, make_surface(run))?;
        log::info!("Finished processing run {}.", run);
        summary.runs.push((run, sorted));
    }
    Ok(summary)
}

/// Run the time calibration, as described by the config.
///
/// The histograms are filled from every hit stream of the config: the hit stream of the
/// run, or each sorted run of the batch.
pub fn calibrate_run(
    config: &Config,
    surface: Box<dyn ProgressSurface>,
) -> Result<CalibrationSummary, CalibrationError> {
    config.validate()?;
    let inputs = config.hit_stream_paths();
    if inputs.is_empty() {
        return Err(CalibrationError::NoHitStreams);
    }

    let mut registry = HistogramRegistry::new(config.calibration.histogram);
    let mut n_blocks = 0;
    for path in inputs.iter() {
        let mut reader = HitStreamReader::open(path)?;
        let (boards, channels) = reader.layout_shape();
        if (boards as usize, channels as usize) != (config.layout.boards, config.layout.channels)
        {
            log::warn!(
                "Hit stream {} was written with {boards} boards and {channels} channels, but the configured layout has {} and {}",
                path.display(),
                config.layout.boards,
                config.layout.channels
            );
        }
        n_blocks += registry.fill_stream(&mut reader)?;
    }
    log::info!(
        "Filled time histograms of {} channels from {n_blocks} blocks in {} hit stream(s)",
        registry.len(),
        inputs.len()
    );

    let finder = PeakFinder::new(config.calibration.peak_search);
    let mut writer = CalibrationWriter::create(&config.calibration)?;
    writer.write_header(&inputs)?;
    let tracker = ProgressTracker::new(surface);
    run_time_calibration(
        &config.calibration,
        &config.layout,
        &registry,
        &finder,
        &mut writer,
        &tracker,
    )?;
    let (summary, _) = writer.finish()?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunBatch;
    use crate::error::SourceError;
    use crate::hdf_source::tests::{make_column_unreadable, write_input_file};
    use crate::hit::{ChannelReading, Hit};
    use crate::layout::{DetectorLayout, Parameter};
    use crate::merger::MemoryHitStream;
    use crate::progress::HiddenSurface;
    use crate::source::MemoryRecordSource;
    use fxhash::FxHashSet;

    fn small_layout() -> DetectorLayout {
        DetectorLayout {
            boards: 3,
            channels: 4,
            ..Default::default()
        }
    }

    /// Record r fires channel r % 12 and, for even records, also the last channel
    fn make_source(n_records: usize, malformed: &[usize]) -> MemoryRecordSource {
        let layout = small_layout();
        let records = (0..n_records)
            .map(|r| {
                if malformed.contains(&r) {
                    return None;
                }
                let mut event = RawEvent::new(&layout);
                let column = r % layout.n_channels();
                let reading = ChannelReading {
                    energy: (r + 1) as f64,
                    low_energy: r as f64 / 2.0,
                    time: 4000.0 + r as f64,
                };
                event.set_reading(column / layout.channels, column % layout.channels, reading);
                if r % 2 == 0 {
                    event.set_reading(layout.boards - 1, layout.channels - 1, reading);
                }
                Some(event)
            })
            .collect();
        MemoryRecordSource::new(layout, records).unwrap()
    }

    fn run_memory(
        source: &MemoryRecordSource,
        n_partitions: usize,
    ) -> (ProcessSummary, Vec<HitBlock>, MergeSummary) {
        let merger = ResultMerger::spawn(|| Ok(MemoryHitStream::new())).unwrap();
        let tracker = ProgressTracker::hidden();
        let options = ProcessOptions {
            n_partitions,
            update_rate: 64,
        };
        let summary = process(source, &merger, &tracker, &options).unwrap();
        assert_eq!(tracker.fraction(), 1.0);
        let (blocks, merge) = merger.finish().unwrap();
        (summary, blocks, merge)
    }

    /// Every (event, hit) in the stream, sorted, so runs can be compared
    fn flatten(blocks: &[HitBlock]) -> Vec<(u64, Hit)> {
        let mut all: Vec<(u64, Hit)> = blocks
            .iter()
            .flat_map(|b| b.events())
            .flat_map(|(id, hits)| hits.into_iter().map(move |h| (id, h)))
            .collect();
        all.sort_by_key(|(id, h)| (*id, h.board, h.channel));
        all
    }

    #[test]
    fn test_two_partitions_cover_every_event_once() {
        let source = make_source(1000, &[]);
        let (summary, blocks, merge) = run_memory(&source, 2);
        assert_eq!(summary.partitions, 2);
        assert_eq!(summary.records_read, 1000);
        assert_eq!(summary.events, 1000);
        assert_eq!(merge.committed_sinks, 2);
        assert_eq!(blocks.len(), 2);

        let mut ids: Vec<u64> = blocks.iter().flat_map(|b| b.event_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, (0..1000).collect::<Vec<u64>>());

        let hits = flatten(&blocks);
        let unique: FxHashSet<(u64, u8, u8)> =
            hits.iter().map(|(id, h)| (*id, h.board, h.channel)).collect();
        assert_eq!(unique.len(), hits.len());
        // every record fires once, evens fire twice except where both are the last channel
        let doubled = (0..1000usize).filter(|r| r % 2 == 0 && r % 12 != 11).count();
        assert_eq!(hits.len(), 1000 + doubled);
        assert_eq!(summary.hits as usize, hits.len());
    }

    #[test]
    fn test_within_partition_order_is_kept() {
        let source = make_source(500, &[]);
        let (_, blocks, _) = run_memory(&source, 4);
        for block in blocks.iter() {
            assert!(block.event_id.windows(2).all(|w| w[0] < w[1]));
            for (_, hits) in block.events() {
                assert!(hits
                    .windows(2)
                    .all(|w| (w[0].board, w[0].channel) < (w[1].board, w[1].channel)));
            }
        }
    }

    #[test]
    fn test_result_does_not_depend_on_partition_count() {
        let source = make_source(257, &[]);
        let (_, reference, _) = run_memory(&source, 1);
        let reference = flatten(&reference);
        for k in [2, 5, 257, 1000] {
            let (summary, blocks, _) = run_memory(&source, k);
            assert!(summary.partitions <= 257);
            assert_eq!(flatten(&blocks), reference, "partition count {k}");
        }
    }

    #[test]
    fn test_malformed_records_are_skipped_and_counted() {
        let source = make_source(100, &[3, 50, 99]);
        let (summary, blocks, _) = run_memory(&source, 3);
        assert_eq!(summary.records_read, 97);
        assert_eq!(summary.records_skipped, 3);
        let ids: FxHashSet<u64> = blocks.iter().flat_map(|b| b.event_id.clone()).collect();
        assert_eq!(ids.len(), 97);
        assert!(!ids.contains(&3) && !ids.contains(&50) && !ids.contains(&99));
    }

    #[test]
    fn test_empty_source_spawns_no_workers() {
        let source = make_source(0, &[]);
        let (summary, blocks, merge) = run_memory(&source, 4);
        assert_eq!(summary.partitions, 0);
        assert!(blocks.is_empty());
        assert_eq!(merge.committed_sinks, 0);
    }

    #[test]
    fn test_sort_then_calibrate_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DetectorLayout {
            boards: 2,
            channels: 2,
            ..Default::default()
        };
        let input_path = dir.path().join("run_0007.h5");
        // Column c fires in every record r with r % 4 == c
        write_input_file(&input_path, &layout, 40, |r, c| {
            if r % 4 == c {
                100.0 + r as f64
            } else {
                0.0
            }
        });

        let config = Config {
            input_path: input_path.clone(),
            hit_path: dir.path().join("hits_0007.h5"),
            n_threads: 3,
            update_rate: 5,
            chunk_size: 7,
            layout: layout.clone(),
            calibration: crate::calibration::CalibrationConfig {
                output_dir: dir.path().join("calibration"),
                ..Default::default()
            },
            ..Default::default()
        };

        let sorted = sort_run(&config, Box::new(HiddenSurface)).unwrap();
        assert_eq!(sorted.process.records_read, 40);
        assert_eq!(sorted.written.events, 40);
        assert_eq!(sorted.written.hits, 40);
        assert_eq!(sorted.written.blocks, 3);
        assert_eq!(sorted.fileinfo_path, config.get_fileinfo_path());
        assert!(sorted.fileinfo_path.exists());

        let mut reader = HitStreamReader::open(&config.hit_path).unwrap();
        assert_eq!(reader.n_events(), 40);
        let mut blocks = Vec::new();
        while let Some(block) = reader.next_block().unwrap() {
            blocks.push(block);
        }
        for (id, hit) in flatten(&blocks) {
            let column = (id % 4) as usize;
            assert_eq!(hit.board as usize, column / 2 + 1);
            assert_eq!(hit.channel as usize, column % 2);
            assert_eq!(hit.energy as u64, 100 + id);
            assert_eq!(hit.time as u64, column as u64 + id);
        }

        let calibrated = calibrate_run(&config, Box::new(HiddenSurface)).unwrap();
        assert_eq!(calibrated.channels, 4);
        assert_eq!(calibrated.calibrated() + calibrated.failures.len(), 4);
        assert!(config.calibration.diagnostic_path().exists());
    }

    #[test]
    fn test_sort_missing_input_fails_before_output() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            input_path: dir.path().join("missing.h5"),
            hit_path: dir.path().join("hits.h5"),
            ..Default::default()
        };
        let err = sort_run(&config, Box::new(HiddenSurface)).unwrap_err();
        assert!(matches!(err, ProcessorError::Source(_)));
        assert!(!config.hit_path.exists());
    }

    #[test]
    fn test_failed_sort_leaves_no_hit_stream() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DetectorLayout {
            boards: 2,
            channels: 2,
            ..Default::default()
        };
        let input_path = dir.path().join("run-0012.h5");
        write_input_file(&input_path, &layout, 20, |_, _| 10.0);
        make_column_unreadable(&input_path, &layout, Parameter::Energy, 2, 1);

        let config = Config {
            input_path,
            hit_path: dir.path().join("hits-0012.h5"),
            n_threads: 2,
            layout,
            ..Default::default()
        };
        let err = sort_run(&config, Box::new(HiddenSurface)).unwrap_err();
        assert!(matches!(
            err,
            ProcessorError::Source(SourceError::HDF5Error(_))
        ));
        assert!(!config.hit_path.exists());
        assert!(!config.get_fileinfo_path().exists());
    }

    #[test]
    fn test_batch_skips_missing_and_bad_runs() {
        let dir = tempfile::tempdir().unwrap();
        let input_dir = dir.path().join("root");
        let hit_dir = dir.path().join("hits");
        std::fs::create_dir_all(&input_dir).unwrap();
        std::fs::create_dir_all(&hit_dir).unwrap();
        let layout = DetectorLayout {
            boards: 2,
            channels: 2,
            ..Default::default()
        };
        let fire = |r: usize, c: usize| if r % 4 == c { 200.0 } else { 0.0 };
        write_input_file(&input_dir.join("run-0001.h5"), &layout, 12, fire);
        write_input_file(&input_dir.join("run-0003.h5"), &layout, 8, fire);
        // Written with one channel per board, so it is missing columns
        let narrow = DetectorLayout {
            channels: 1,
            ..layout.clone()
        };
        write_input_file(&input_dir.join("run-0004.h5"), &narrow, 8, fire);

        let config = Config {
            n_threads: 2,
            layout: layout.clone(),
            calibration: crate::calibration::CalibrationConfig {
                output_dir: dir.path().join("calibration"),
                ..Default::default()
            },
            runs: Some(RunBatch {
                input_dir,
                hit_dir: hit_dir.clone(),
                first_run_number: 1,
                last_run_number: 4,
                ..Default::default()
            }),
            ..Default::default()
        };

        let mut surfaces = Vec::new();
        let batch = sort_batch(&config, |run| {
            surfaces.push(run);
            Box::new(HiddenSurface)
        })
        .unwrap();
        assert_eq!(surfaces, vec![1, 3]);
        assert_eq!(batch.skipped, vec![2, 4]);
        let sorted: Vec<(i32, u64)> = batch
            .runs
            .iter()
            .map(|(run, summary)| (*run, summary.written.events))
            .collect();
        assert_eq!(sorted, vec![(1, 12), (3, 8)]);
        assert!(hit_dir.join("hits-0001.h5").exists());
        assert!(hit_dir.join("hits-0003.h5").exists());
        assert!(!hit_dir.join("hits-0002.h5").exists());
        assert!(!hit_dir.join("hits-0004.h5").exists());
        assert_eq!(config.hit_stream_paths().len(), 2);

        let calibrated = calibrate_run(&config, Box::new(HiddenSurface)).unwrap();
        assert_eq!(calibrated.channels, 4);
        let log = std::fs::read_to_string(config.calibration.diagnostic_path()).unwrap();
        assert!(log.contains(&format!(
            "Input hit stream: {}",
            hit_dir.join("hits-0001.h5").display()
        )));
        assert!(log.contains(&format!(
            "Input hit stream: {}",
            hit_dir.join("hits-0003.h5").display()
        )));
    }

    #[test]
    fn test_batch_needs_a_run_range() {
        let dir = tempfile::tempdir().unwrap();
        let err = sort_batch(&Config::default(), |_| Box::new(HiddenSurface)).unwrap_err();
        assert!(matches!(err, ProcessorError::NoRunBatch));

        let config = Config {
            runs: Some(RunBatch {
                input_dir: dir.path().to_path_buf(),
                hit_dir: dir.path().to_path_buf(),
                first_run_number: 1,
                last_run_number: 2,
                ..Default::default()
            }),
            calibration: crate::calibration::CalibrationConfig {
                output_dir: dir.path().to_path_buf(),
                ..Default::default()
            },
            ..Default::default()
        };
        let batch = sort_batch(&config, |_| Box::new(HiddenSurface)).unwrap();
        assert!(batch.runs.is_empty());
        assert_eq!(batch.skipped, vec![1, 2]);
        let err = calibrate_run(&config, Box::new(HiddenSurface)).unwrap_err();
        assert!(matches!(err, CalibrationError::NoHitStreams));
    }
}
