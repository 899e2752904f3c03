use clap::{Arg, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use libgobbi_sort::config::Config;
use libgobbi_sort::process::{calibrate_run, sort_batch, sort_run, SortSummary};
use libgobbi_sort::progress::{LogSurface, ProgressFrame, ProgressSurface, StreamSurface};

/// Shows the tracker's progress on an indicatif bar
struct BarSurface {
    bar: ProgressBar,
}

impl ProgressSurface for BarSurface {
    fn draw(&mut self, frame: &ProgressFrame) {
        match frame {
            ProgressFrame::Percent(percent) => self.bar.set_position(*percent as u64),
            ProgressFrame::Bar { percent, .. } => self.bar.set_position(*percent as u64),
        }
    }
}

/// Pick where progress goes. A configured width means a plain text bar on stderr. If
/// stderr is not a terminal progress goes to the log, otherwise to an indicatif bar
/// managed alongside the logger.
fn make_surface(
    config: &Config,
    pb_manager: &MultiProgress,
    message: String,
) -> (Box<dyn ProgressSurface>, Option<ProgressBar>) {
    if let Some(width) = config.progress_width {
        return (Box::new(StreamSurface::new(std::io::stderr(), width)), None);
    }
    if !std::io::stderr().is_terminal() {
        return (Box::new(LogSurface), None);
    }
    let bar = pb_manager.add(ProgressBar::new(100));
    if let Ok(style) =
        ProgressStyle::with_template("{msg} [{wide_bar:.cyan/blue}] {pos:>3}%")
    {
        bar.set_style(style.progress_chars("=>-"));
    }
    bar.set_message(message);
    (Box::new(BarSurface { bar: bar.clone() }), Some(bar))
}

fn report_sort(summary: &SortSummary) {
    log::info!(
        "Sorted {} records ({} skipped) in to {} events with {} hits",
        summary.process.records_read,
        summary.process.records_skipped,
        summary.written.events,
        summary.written.hits
    );
    log::info!(
        "File information written to {}",
        summary.fileinfo_path.to_string_lossy()
    );
}

fn make_template_config(path: &Path) {
    match Config::default().write_config_file(path) {
        Ok(()) => log::info!("Done."),
        Err(e) => log::error!("Could not write template config: {e}"),
    }
}

fn main() {
    // Create a cli
    let matches = Command::new("gobbi_sort_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .subcommand(
            Command::new("sort").about("Extract the hits of the input file, or of every run"),
        )
        .subcommand(Command::new("calibrate").about("Run the pulser time calibration"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .required(true)
                .global(true)
                .help("Path to the configuration file"),
        )
        .get_matches();

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    LogWrapper::new(pb_manager.clone(), logger)
        .try_init()
        .expect("Could not create logging/progress!");

    // Parse the cli
    let config_path = match matches.get_one::<String>("path") {
        Some(p) => PathBuf::from(p),
        None => {
            log::error!("A configuration path is required (-p)");
            return;
        }
    };

    let command = match matches.subcommand_name() {
        Some("new") => {
            log::info!(
                "Making a template config at {}...",
                config_path.to_string_lossy()
            );
            make_template_config(&config_path);
            return;
        }
        Some(name) => name.to_string(),
        None => {
            log::error!("No subcommand given; use new, sort or calibrate");
            return;
        }
    };

    // Load our config
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    log::info!("Config successfully loaded.");
    match &config.runs {
        Some(runs) => {
            log::info!("Input Directory: {}", runs.input_dir.to_string_lossy());
            log::info!("Hit Stream Directory: {}", runs.hit_dir.to_string_lossy());
            log::info!(
                "Runs: {} to {}",
                runs.first_run_number,
                runs.last_run_number
            );
        }
        None => {
            log::info!("Input Path: {}", config.input_path.to_string_lossy());
            log::info!("Hit Stream Path: {}", config.hit_path.to_string_lossy());
        }
    }
    log::info!(
        "Layout: {} boards x {} channels",
        config.layout.boards,
        config.layout.channels
    );
    log::info!("Number of Workers: {}", config.n_threads);

    match command.as_str() {
        "sort" if config.runs.is_some() => {
            let mut bars: Vec<ProgressBar> = Vec::new();
            let result = sort_batch(&config, |run| {
                let (surface, bar) = make_surface(&config, &pb_manager, format!("Run {run}"));
                bars.extend(bar);
                surface
            });
            for bar in bars {
                bar.finish();
            }
            match result {
                Ok(batch) => {
                    for (run, summary) in batch.runs.iter() {
                        log::info!("Run {run}:");
                        report_sort(summary);
                    }
                    if !batch.skipped.is_empty() {
                        log::warn!("Skipped runs: {:?}", batch.skipped);
                    }
                }
                Err(e) => log::error!("Sorting failed with error: {e}"),
            }
        }
        "sort" => {
            let (surface, bar) = make_surface(&config, &pb_manager, String::from("Sorting"));
            let result = sort_run(&config, surface);
            if let Some(bar) = bar {
                bar.finish();
            }
            match result {
                Ok(summary) => report_sort(&summary),
                Err(e) => log::error!("Sorting failed with error: {e}"),
            }
        }
        "calibrate" => {
            let (surface, bar) =
                make_surface(&config, &pb_manager, String::from("Calibrating"));
            let result = calibrate_run(&config, surface);
            if let Some(bar) = bar {
                bar.finish();
            }
            match result {
                Ok(summary) => log::info!(
                    "Calibrated {} of {} channels, {} failed",
                    summary.calibrated(),
                    summary.channels,
                    summary.failures.len()
                ),
                Err(e) => log::error!("Calibration failed with error: {e}"),
            }
        }
        other => log::error!("Unknown subcommand {other}"),
    }

    log::info!("Done.");
}
