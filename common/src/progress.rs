//! Byte-level progress tracking for a single transfer or a whole folder
//!
//! [`ProgressState`] holds the counters and derived figures (percent, rate, ETA). Reporters
//! implement [`ProgressReporter`] and render that state: a text line per update, an `indicatif`
//! bar, a user callback, or nothing at all. [`FolderProgress`] adds the overall figures of a
//! folder copy on top of any of them. Percent and ETA are `None` whenever the total is
//! unknown or zero, and every reporter falls back to an indeterminate rendering in that case.

use std::io::{IsTerminal, Write};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ProgressState {
    total: Option<u64>,
    transferred: u64,
    started: Instant,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ProgressState {
    pub fn new(total: Option<u64>) -> Self {
        Self {
            total,
            transferred: 0,
            started: Instant::now(),
        }
    }
    /// Starts tracking a new transfer; counters and the clock start over.
    pub fn reset(&mut self, total: Option<u64>) {
        *self = Self::new(total);
    }
    /// Records the cumulative byte count. Never moves backwards.
    pub fn set_transferred(&mut self, bytes_so_far: u64) {
        self.transferred = self.transferred.max(bytes_so_far);
    }
    pub fn total(&self) -> Option<u64> {
        self.total
    }
    pub fn transferred(&self) -> u64 {
        self.transferred
    }
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(total) if total > 0 => {
                Some((self.transferred as f64 / total as f64 * 100.0).min(100.0))
            }
            _ => None,
        }
    }
    /// Average rate in bytes per second since the transfer began.
    pub fn rate(&self) -> Option<f64> {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            Some(self.transferred as f64 / secs)
        } else {
            None
        }
    }
    pub fn eta(&self) -> Option<Duration> {
        let total = self.total.filter(|&t| t > 0)?;
        let rate = self.rate().filter(|&r| r > 0.0)?;
        let remaining = total.saturating_sub(self.transferred);
        Some(Duration::from_secs(
            (remaining as f64 / rate).ceil() as u64,
        ))
    }
    pub fn is_complete(&self) -> bool {
        self.total.is_some_and(|t| self.transferred >= t)
    }
}

/// One-line rendering of the progress state, used by the text reporter.
pub fn format_line(label: &str, state: &ProgressState) -> String {
    let transferred = bytesize::ByteSize(state.transferred());
    let rate = state
        .rate()
        .map(|r| format!("{}/s", bytesize::ByteSize(r as u64)))
        .unwrap_or_else(|| "-".to_string());
    match (state.total(), state.percent()) {
        (Some(total), Some(percent)) => {
            let eta = state
                .eta()
                .map(|d| humantime::format_duration(d).to_string())
                .unwrap_or_else(|| "-".to_string());
            format!(
                "{label}: {transferred} / {} ({percent:.0}%) {rate}, eta {eta}",
                bytesize::ByteSize(total)
            )
        }
        _ => format!("{label}: {transferred} transferred, {rate}"),
    }
}

/// Receives progress notifications for one transfer at a time.
///
/// `update` is called with the cumulative number of bytes moved so far, never with a delta.
pub trait ProgressReporter {
    fn begin(&mut self, label: &str, total: Option<u64>);
    fn update(&mut self, bytes_so_far: u64);
    fn finish(&mut self);
}

/// Discards all notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn begin(&mut self, _label: &str, _total: Option<u64>) {}
    fn update(&mut self, _bytes_so_far: u64) {}
    fn finish(&mut self) {}
}

/// Forwards every notification to a closure as `(label, total, bytes_so_far)`.
pub struct CallbackReporter<F>
where
    F: FnMut(&str, Option<u64>, u64),
{
    callback: F,
    label: String,
    state: ProgressState,
}

impl<F> CallbackReporter<F>
where
    F: FnMut(&str, Option<u64>, u64),
{
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            label: String::new(),
            state: ProgressState::default(),
        }
    }
}

impl<F> ProgressReporter for CallbackReporter<F>
where
    F: FnMut(&str, Option<u64>, u64),
{
    fn begin(&mut self, label: &str, total: Option<u64>) {
        self.label = label.to_string();
        self.state.reset(total);
        (self.callback)(&self.label, total, 0);
    }
    fn update(&mut self, bytes_so_far: u64) {
        self.state.set_transferred(bytes_so_far);
        (self.callback)(&self.label, self.state.total(), self.state.transferred());
    }
    fn finish(&mut self) {}
}

/// Prints a status line at most once per `delay`, plus a final line on finish.
pub struct TextReporter<W: Write> {
    out: W,
    delay: Duration,
    label: String,
    state: ProgressState,
    last_print: Option<Instant>,
}

impl<W: Write> TextReporter<W> {
    pub fn new(out: W, delay: Duration) -> Self {
        Self {
            out,
            delay,
            label: String::new(),
            state: ProgressState::default(),
            last_print: None,
        }
    }
    pub fn into_inner(self) -> W {
        self.out
    }
    fn print(&mut self, line: &str) {
        // a broken progress stream must not abort the transfer
        if let Err(error) = writeln!(self.out, "{line}") {
            tracing::debug!("failed to write progress: {error}");
        }
        self.last_print = Some(Instant::now());
    }
}

impl<W: Write> ProgressReporter for TextReporter<W> {
    fn begin(&mut self, label: &str, total: Option<u64>) {
        self.label = label.to_string();
        self.state.reset(total);
        let line = match total {
            Some(total) => format!("{label}: starting ({})", bytesize::ByteSize(total)),
            None => format!("{label}: starting (size unknown)"),
        };
        self.print(&line);
    }
    fn update(&mut self, bytes_so_far: u64) {
        self.state.set_transferred(bytes_so_far);
        let due = self
            .last_print
            .is_none_or(|last| last.elapsed() >= self.delay);
        if due {
            let line = format_line(&self.label, &self.state);
            self.print(&line);
        }
    }
    fn finish(&mut self) {
        let line = format!(
            "{}: done, {} in {}",
            self.label,
            bytesize::ByteSize(self.state.transferred()),
            humantime::format_duration(Duration::from_millis(
                self.state.elapsed().as_millis() as u64
            ))
        );
        self.print(&line);
    }
}

/// Renders an `indicatif` bar on stderr, or a spinner when the size is unknown.
pub struct BarReporter {
    refresh_hz: u8,
    bar: Option<indicatif::ProgressBar>,
    state: ProgressState,
}

const BAR_TEMPLATE: &str =
    "{msg} [{elapsed_precise}] [{wide_bar}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";
const SPINNER_TEMPLATE: &str = "{spinner} {msg} [{elapsed_precise}] {bytes} ({bytes_per_sec})";

impl BarReporter {
    pub fn new(delay: Duration) -> Self {
        let millis = delay.as_millis().max(1);
        let refresh_hz = (1000 / millis).clamp(1, 20) as u8;
        Self {
            refresh_hz,
            bar: None,
            state: ProgressState::default(),
        }
    }
}

impl ProgressReporter for BarReporter {
    fn begin(&mut self, label: &str, total: Option<u64>) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
        self.state.reset(total);
        let target = indicatif::ProgressDrawTarget::stderr_with_hz(self.refresh_hz);
        let determinate = total.filter(|&t| t > 0);
        let bar = indicatif::ProgressBar::with_draw_target(determinate, target);
        let style = match determinate {
            Some(_) => indicatif::ProgressStyle::with_template(BAR_TEMPLATE),
            None => indicatif::ProgressStyle::with_template(SPINNER_TEMPLATE),
        }
        .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_message(label.to_string());
        self.bar = Some(bar);
    }
    fn update(&mut self, bytes_so_far: u64) {
        self.state.set_transferred(bytes_so_far);
        if let Some(bar) = &self.bar {
            bar.set_position(self.state.transferred());
        }
    }
    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish();
        }
    }
}

/// Overall percent, rate and ETA of `state`, with `-` for figures that are not known yet.
fn overall_figures(state: &ProgressState) -> String {
    let percent = state
        .percent()
        .map_or_else(|| "-".to_string(), |p| format!("{p:.0}%"));
    let rate = state.rate().map_or_else(
        || "-".to_string(),
        |r| format!("{}/s", bytesize::ByteSize(r as u64)),
    );
    let eta = state.eta().map_or_else(
        || "-".to_string(),
        |d| humantime::format_duration(d).to_string(),
    );
    format!("{percent} overall, {rate}, eta {eta}")
}

/// Reports a whole-folder operation through a per-file reporter.
///
/// Every file still gets its own `begin`/`update`/`finish` cycle on the wrapped reporter. Its
/// label is prefixed with the file's position (`[3/10 files, ...]`) and the figures of the
/// folder so far, computed against the totals measured before copying started.
pub struct FolderProgress<'a> {
    inner: &'a mut dyn ProgressReporter,
    files_total: u64,
    files_started: u64,
    finished_bytes: u64,
    current: u64,
    state: ProgressState,
}

impl<'a> FolderProgress<'a> {
    pub fn new(inner: &'a mut dyn ProgressReporter, files_total: u64, bytes_total: u64) -> Self {
        Self {
            inner,
            files_total,
            files_started: 0,
            finished_bytes: 0,
            current: 0,
            state: ProgressState::new(Some(bytes_total)),
        }
    }
    /// Folder-wide counters; the total is the byte count of all files.
    pub fn state(&self) -> &ProgressState {
        &self.state
    }
}

impl ProgressReporter for FolderProgress<'_> {
    fn begin(&mut self, label: &str, total: Option<u64>) {
        self.files_started += 1;
        self.current = 0;
        let label = format!(
            "[{}/{} files, {}] {label}",
            self.files_started,
            self.files_total.max(self.files_started),
            overall_figures(&self.state)
        );
        self.inner.begin(&label, total);
    }
    fn update(&mut self, bytes_so_far: u64) {
        self.current = self.current.max(bytes_so_far);
        self.state.set_transferred(self.finished_bytes + self.current);
        self.inner.update(bytes_so_far);
    }
    fn finish(&mut self) {
        self.finished_bytes += self.current;
        self.current = 0;
        self.inner.finish();
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressType {
    /// bar on a terminal, text lines otherwise
    #[default]
    #[value(alias = "Auto")]
    Auto,
    #[value(alias = "ProgressBar")]
    ProgressBar,
    #[value(alias = "TextUpdates")]
    TextUpdates,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    /// minimum interval between text updates, or the bar redraw interval
    pub delay: Duration,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            progress_type: ProgressType::Auto,
            delay: Duration::from_millis(200),
        }
    }
}

/// Builds the reporter for the given settings; `None` disables progress output.
pub fn make_reporter(settings: Option<&ProgressSettings>) -> Box<dyn ProgressReporter> {
    let Some(settings) = settings else {
        return Box::new(NoProgress);
    };
    let use_bar = match settings.progress_type {
        ProgressType::Auto => std::io::stderr().is_terminal(),
        ProgressType::ProgressBar => true,
        ProgressType::TextUpdates => false,
    };
    if use_bar {
        Box::new(BarReporter::new(settings.delay))
    } else {
        Box::new(TextReporter::new(std::io::stderr(), settings.delay))
    }
}
