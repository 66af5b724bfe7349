//! Download progress tracking shared across concurrent range tasks

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Point-in-time view of a [`DownloadProgress`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    /// Bytes written so far
    pub transferred_bytes: u64,
    /// Bytes expected in total
    pub content_length: u64,
    /// Completion percentage
    pub percentage: f64,
    /// Throughput in MB/s since tracking started
    pub megabytes_per_sec: f64,
}

/// Tracks bytes received for one archive download.
///
/// Single-connection downloads advance segment by segment with
/// [`DownloadProgress::next_segment`]; concurrent range tasks share one
/// tracker and report through [`DownloadProgress::add_received_bytes`].
#[derive(Debug)]
pub struct DownloadProgress {
    content_length: u64,
    segment_index: AtomicUsize,
    segment_size: AtomicU64,
    segment_offset: AtomicU64,
    received_bytes: AtomicU64,
    displayed_complete: AtomicBool,
    started: Instant,
}

impl DownloadProgress {
    /// Start tracking a download of `content_length` bytes
    #[must_use]
    pub fn new(content_length: u64) -> Self {
        Self {
            content_length,
            segment_index: AtomicUsize::new(0),
            segment_size: AtomicU64::new(0),
            segment_offset: AtomicU64::new(0),
            received_bytes: AtomicU64::new(0),
            displayed_complete: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    /// Total bytes expected
    #[must_use]
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Index of the active segment
    #[must_use]
    pub fn segment_index(&self) -> usize {
        self.segment_index.load(Ordering::SeqCst)
    }

    /// Move to the next segment of `segment_size` bytes.
    ///
    /// Only call this once the previous segment is complete: the offset
    /// advances by the previous segment's full size.
    pub fn next_segment(&self, segment_size: u64) {
        let previous = self.segment_size.swap(segment_size, Ordering::SeqCst);
        let offset = self.segment_offset.fetch_add(previous, Ordering::SeqCst) + previous;
        self.segment_index.fetch_add(1, Ordering::SeqCst);
        self.received_bytes.store(0, Ordering::SeqCst);

        debug!(
            offset = offset,
            length = segment_size,
            "Downloading segment"
        );
    }

    /// Set the byte count received for the active segment
    pub fn set_received_bytes(&self, received_bytes: u64) {
        self.received_bytes.store(received_bytes, Ordering::SeqCst);
    }

    /// Record `bytes` more bytes for the active segment
    pub fn add_received_bytes(&self, bytes: u64) {
        self.received_bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    /// Take back bytes reported by a failed attempt that will be refetched
    pub fn remove_received_bytes(&self, bytes: u64) {
        let _ = self
            .received_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    /// Cumulative bytes transferred (`offset + received`)
    #[must_use]
    pub fn transferred_bytes(&self) -> u64 {
        self.segment_offset.load(Ordering::SeqCst) + self.received_bytes.load(Ordering::SeqCst)
    }

    /// Whether every expected byte has arrived
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.transferred_bytes() == self.content_length
    }

    /// Current stats
    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        let transferred_bytes = self.transferred_bytes();
        let percentage = if self.content_length == 0 {
            100.0
        } else {
            100.0 * (transferred_bytes as f64 / self.content_length as f64)
        };
        let elapsed = self.started.elapsed().as_secs_f64();
        let megabytes_per_sec = if elapsed > 0.0 {
            transferred_bytes as f64 / BYTES_PER_MB / elapsed
        } else {
            0.0
        };

        ProgressSnapshot {
            transferred_bytes,
            content_length: self.content_length,
            percentage,
            megabytes_per_sec,
        }
    }

    /// Log the current stats.
    ///
    /// Once the download is complete one final line is logged and later
    /// calls do nothing. Returns whether a line was logged.
    pub fn display(&self) -> bool {
        if self.displayed_complete.load(Ordering::SeqCst) {
            return false;
        }

        if self.is_done()
            && self
                .displayed_complete
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return false;
        }

        let stats = self.snapshot();
        info!(
            transferred = stats.transferred_bytes,
            total = stats.content_length,
            "Received {} of {} ({:.1}%), {:.1} MBs/sec",
            stats.transferred_bytes,
            stats.content_length,
            stats.percentage,
            stats.megabytes_per_sec
        );
        true
    }

    /// Log stats every `interval` until the download completes or the
    /// returned timer is stopped
    #[must_use]
    pub fn start_display_timer(self: &Arc<Self>, interval: Duration) -> DisplayTimer {
        let progress = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                progress.display();
                if progress.is_done() {
                    break;
                }
            }
        });

        DisplayTimer {
            progress: Arc::clone(self),
            handle: Some(handle),
        }
    }
}

/// Handle to a periodic progress display
#[derive(Debug)]
pub struct DisplayTimer {
    progress: Arc<DownloadProgress>,
    handle: Option<JoinHandle<()>>,
}

impl DisplayTimer {
    /// Stop the timer and log a last line unless the final line was
    /// already logged
    pub fn stop(mut self) {
        self.cancel();
        self.progress.display();
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for DisplayTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments_accumulate_offset() {
        let progress = DownloadProgress::new(300);
        progress.next_segment(100);
        progress.set_received_bytes(100);
        assert_eq!(progress.transferred_bytes(), 100);

        progress.next_segment(200);
        assert_eq!(progress.segment_index(), 2);
        assert_eq!(progress.transferred_bytes(), 100);
        progress.set_received_bytes(150);
        assert_eq!(progress.transferred_bytes(), 250);
        assert!(!progress.is_done());

        progress.set_received_bytes(200);
        assert!(progress.is_done());
    }

    #[test]
    fn test_display_final_line_once() {
        let progress = DownloadProgress::new(10);
        assert!(progress.display());
        progress.add_received_bytes(10);
        assert!(progress.display());
        assert!(!progress.display());
        assert!(!progress.display());
    }

    #[test]
    fn test_snapshot_percentage() {
        let progress = DownloadProgress::new(200);
        progress.add_received_bytes(50);
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.transferred_bytes, 50);
        assert!((snapshot.percentage - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_download_is_done() {
        let progress = DownloadProgress::new(0);
        assert!(progress.is_done());
        assert!((progress.snapshot().percentage - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let progress = Arc::new(DownloadProgress::new(8 * 1000));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let progress = Arc::clone(&progress);
            tasks.push(tokio::spawn(async move {
                for _ in 0..1000 {
                    progress.add_received_bytes(1);
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(progress.transferred_bytes(), 8000);
        assert!(progress.is_done());
    }

    #[tokio::test]
    async fn test_stop_timer_logs_final_line() {
        let progress = Arc::new(DownloadProgress::new(5));
        let timer = progress.start_display_timer(Duration::from_secs(60));
        progress.add_received_bytes(5);
        timer.stop();
        // Final line already logged by stop()
        assert!(!progress.display());
    }
}
