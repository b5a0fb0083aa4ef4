//! Progress reporting for remote file transfers.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Instant;

use derive_more::Deref;
use indicatif::{ProgressBar, ProgressStyle};

/// A byte-transfer progress bar.
///
/// In interactive terminals this renders a live bar; in non-interactive
/// environments (CI) it stays silent and the caller's structured logs carry
/// the signal instead.
#[derive(Deref)]
pub struct TransferBar {
    #[deref]
    progress: ProgressBar,
    start: Instant,
    operation: String,
    bytes: Arc<AtomicU64>,
}

impl TransferBar {
    /// Create a tracker for a transfer of `total` bytes; pass 0 when the
    /// size is unknown (e.g. no Content-Length header).
    pub fn new(total: u64, operation: impl Into<String>) -> Self {
        let operation = operation.into();
        let progress = if is_interactive() {
            ProgressBar::new(total)
        } else {
            ProgressBar::hidden()
        };
        let style = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {msg}")
            .expect("invalid progress bar template")
            .progress_chars("=> ");
        progress.set_style(style);
        progress.set_message(format!("{operation} (0 B at 0 MB/s)"));

        Self {
            progress,
            start: Instant::now(),
            operation,
            bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Add to the transferred byte count and update the display.
    pub fn add_bytes(&self, count: u64) {
        let bytes = self.bytes.fetch_add(count, Ordering::Relaxed) + count;
        self.progress.set_position(bytes);
        self.progress.set_message(format!(
            "{} ({} at {})",
            self.operation,
            format_size(bytes),
            format_transfer_rate(bytes, self.start)
        ));
    }

    /// Total bytes transferred so far.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Detects if running in an interactive terminal environment.
fn is_interactive() -> bool {
    console::Term::stderr().is_term()
}

/// Formats the transfer amount as a string like "10 MB".
pub fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::DECIMAL)
}

/// Formats the transfer rate as a string like "10 MB/s".
///
/// Returns "0 MB/s" if:
/// - Elapsed time is zero.
/// - Transferred bytes are zero.
pub fn format_transfer_rate(bytes: u64, start_time: Instant) -> String {
    let elapsed = start_time.elapsed().as_secs_f64();
    let size = if elapsed > 0.0 && bytes > 0 {
        format_size((bytes as f64 / elapsed) as u64)
    } else {
        String::from("0 MB")
    };
    format!("{size}/s")
}
