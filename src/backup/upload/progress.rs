use std::io;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Percent step between two progress log lines.
static REPORT_STEP: u64 = 25;

/// Byte counter for one transfer. Shared so that other threads can poll
/// [`TransferProgress::get_progress`] while the transfer runs.
#[derive(Debug)]
pub struct TransferProgress {
    path: PathBuf,
    total: u64,
    transferred: AtomicU64,
    next_report: AtomicU64,
}

impl TransferProgress {
    pub fn new<P: AsRef<Path>>(path: P, total: u64) -> Arc<Self> {
        Arc::new(Self {
            path: path.as_ref().to_path_buf(),
            total,
            transferred: AtomicU64::new(0),
            next_report: AtomicU64::new(REPORT_STEP),
        })
    }

    /// Returns `(transferred, total)`.
    pub fn get_progress(&self) -> (u64, u64) {
        (self.transferred.load(Ordering::SeqCst), self.total)
    }

    pub fn percent(&self) -> u64 {
        let (done, total) = self.get_progress();
        if total == 0 {
            100
        } else {
            done.saturating_mul(100) / total
        }
    }

    fn add(&self, n: u64) {
        self.transferred.fetch_add(n, Ordering::SeqCst);
        let percent = self.percent();
        let next = self.next_report.load(Ordering::SeqCst);
        if percent >= next && next <= 100 {
            let step_reached = percent - percent % REPORT_STEP;
            self.next_report
                .store(step_reached + REPORT_STEP, Ordering::SeqCst);
            tracing::debug!(
                "Upload of {:?}: {}% ({} of {} bytes)",
                self.path,
                step_reached,
                self.transferred.load(Ordering::SeqCst),
                self.total
            );
        }
    }
}

/// Counts every byte read from `inner` into a [`TransferProgress`].
pub struct ProgressReader<R> {
    inner: R,
    progress: Arc<TransferProgress>,
}

impl<R: Read> ProgressReader<R> {
    pub fn new(inner: R, progress: Arc<TransferProgress>) -> Self {
        Self { inner, progress }
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.progress.add(n as u64);
        Ok(n)
    }
}
