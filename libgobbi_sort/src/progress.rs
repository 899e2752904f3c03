use std::io::Write;
use std::sync::{Mutex, PoisonError};

// Fixed characters of a drawn bar: "[", "] ", and "100 %"
const BAR_DECORATION_WIDTH: usize = 8;

/// What the tracker asks a surface to draw
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressFrame {
    /// A fully drawn bar line, and the percentage it represents
    Bar { line: String, percent: u32 },
    /// Just a percentage, for surfaces which draw their own bar or have no width
    Percent(u32),
}

/// Somewhere progress can be shown.
///
/// If a surface knows how many columns it has, the tracker draws a text bar sized to fit.
/// Otherwise it is only given a percentage.
pub trait ProgressSurface: Send {
    /// Current width of the surface in columns, if known. Asked on every render.
    fn columns(&self) -> Option<usize> {
        None
    }

    fn draw(&mut self, frame: &ProgressFrame);
}

/// A surface which shows nothing
#[derive(Debug, Default)]
pub struct HiddenSurface;

impl ProgressSurface for HiddenSurface {
    fn draw(&mut self, _frame: &ProgressFrame) {}
}

/// Report progress through the log at the info level
#[derive(Debug, Default)]
pub struct LogSurface;

impl ProgressSurface for LogSurface {
    fn draw(&mut self, frame: &ProgressFrame) {
        match frame {
            ProgressFrame::Bar { percent, .. } | ProgressFrame::Percent(percent) => {
                log::info!("Progress: {percent} %")
            }
        }
    }
}

/// Draw a text bar on a stream (typically stderr) with a fixed number of columns
pub struct StreamSurface<W: Write + Send> {
    stream: W,
    columns: usize,
}

impl<W: Write + Send> StreamSurface<W> {
    pub fn new(stream: W, columns: usize) -> Self {
        Self { stream, columns }
    }
}

impl<W: Write + Send> ProgressSurface for StreamSurface<W> {
    fn columns(&self) -> Option<usize> {
        Some(self.columns)
    }

    fn draw(&mut self, frame: &ProgressFrame) {
        let text = match frame {
            ProgressFrame::Bar { line, .. } => line.clone(),
            ProgressFrame::Percent(percent) => format!("Progress: {percent} %"),
        };
        // Progress is cosmetic, a failed write is not worth reporting
        let _ = write!(self.stream, "\x1b[2K\r{text}");
        let _ = self.stream.flush();
    }
}

struct TrackerState {
    min: f64,
    max: f64,
    position: f64,
    // What was drawn last, used to skip redundant renders
    last_width: Option<usize>,
    last_cells: Option<usize>,
    last_percent: Option<u32>,
    surface: Box<dyn ProgressSurface>,
}

impl TrackerState {
    fn clamp(&mut self) {
        self.position = self.position.max(self.min).min(self.max);
    }

    fn fraction(&self) -> f64 {
        let span = self.max - self.min;
        if span <= 0.0 {
            return 1.0;
        }
        ((self.position - self.min) / span).clamp(0.0, 1.0)
    }
}

/// ProgressTracker is the shared progress counter of a run.
///
/// Workers update it every so often (not every record), and anyone can ask it to render.
/// The values are only for display; nothing depends on them for correctness.
pub struct ProgressTracker {
    state: Mutex<TrackerState>,
}

impl ProgressTracker {
    /// Create a tracker over [0, 100] which draws on a surface
    pub fn new(surface: Box<dyn ProgressSurface>) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                min: 0.0,
                max: 100.0,
                position: 0.0,
                last_width: None,
                last_cells: None,
                last_percent: None,
                surface,
            }),
        }
    }

    /// A tracker which never draws
    pub fn hidden() -> Self {
        Self::new(Box::new(HiddenSurface))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        // A panicked worker can poison the lock; the counter is still fine to display
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the range of the tracker. The position is clamped to the new range.
    pub fn set_range(&self, a: f64, b: f64) {
        let mut state = self.lock();
        state.min = a.min(b);
        state.max = a.max(b);
        state.clamp();
    }

    pub fn set_position(&self, position: f64) {
        let mut state = self.lock();
        state.position = position;
        state.clamp();
    }

    pub fn increment(&self, delta: f64) {
        let mut state = self.lock();
        state.position += delta;
        state.clamp();
    }

    pub fn position(&self) -> f64 {
        self.lock().position
    }

    /// Progress through the range, in [0, 1]
    pub fn fraction(&self) -> f64 {
        self.lock().fraction()
    }

    /// Draw the current progress, if it visibly changed since the last render.
    ///
    /// Returns true if something was drawn.
    pub fn render(&self) -> bool {
        let mut state = self.lock();
        let fraction = state.fraction();
        let percent = (fraction * 100.0) as u32;
        match state.surface.columns() {
            Some(columns) => {
                if columns < BAR_DECORATION_WIDTH {
                    return false;
                }
                let width = columns - BAR_DECORATION_WIDTH;
                let cells = (width as f64 * fraction) as usize;
                if state.last_width == Some(width)
                    && state.last_cells == Some(cells)
                    && state.last_percent == Some(percent)
                {
                    return false;
                }
                state.last_width = Some(width);
                state.last_cells = Some(cells);
                state.last_percent = Some(percent);
                let line = draw_bar(width, cells, percent);
                state.surface.draw(&ProgressFrame::Bar { line, percent });
            }
            None => {
                if state.last_percent == Some(percent) {
                    return false;
                }
                state.last_percent = Some(percent);
                state.last_width = None;
                state.last_cells = None;
                state.surface.draw(&ProgressFrame::Percent(percent));
            }
        }
        true
    }
}

fn draw_bar(width: usize, cells: usize, percent: u32) -> String {
    let mut line = String::with_capacity(width + BAR_DECORATION_WIDTH);
    line.push('[');
    for i in 0..width {
        if i < cells {
            line.push('=');
        } else if i == cells {
            line.push('>');
        } else {
            line.push(' ');
        }
    }
    line.push_str(&format!("] {percent} %"));
    line
}
