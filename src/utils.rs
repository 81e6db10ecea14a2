use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use time::{macros::format_description, OffsetDateTime};

/// Tracks bytes written to disk, with both
/// *all-time* counters and a *sliding 1 s window* rate.
#[derive(Debug)]
pub struct Counter {
    /// All-time total bytes
    pub total_size: usize,
    /// All-time number of blocks
    pub n_blocks: usize,
    /// Time when this counter was created or last reset
    pub t_begin: Instant,

    // --- sliding window fields ---
    window: Duration,
    samples: VecDeque<(Instant, usize)>,
    bytes_in_window: usize,
}

impl Default for Counter {
    fn default() -> Self {
        Counter {
            total_size: 0,
            n_blocks: 0,
            t_begin: Instant::now(),
            window: Duration::from_secs(1),
            samples: VecDeque::new(),
            bytes_in_window: 0,
        }
    }
}

impl Counter {
    /// Create a new Counter with a 1 s sliding window.
    pub fn new() -> Self {
        Default::default()
    }

    /// Long-term average rate since t_begin, in MB/s
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        (self.total_size as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Sliding-window rate over the last `window` duration (default 1 s), in MB/s
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        (self.bytes_in_window as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Record a drain of `blocks` blocks that put `size` bytes on disk.
    pub fn increment(&mut self, blocks: usize, size: usize) {
        let now = Instant::now();

        self.total_size += size;
        self.n_blocks += blocks;

        self.samples.push_back((now, size));
        self.bytes_in_window += size;

        while let Some(&(ts, sz)) = self.samples.front() {
            if now.duration_since(ts) > self.window {
                self.samples.pop_front();
                self.bytes_in_window -= sz;
            } else {
                break;
            }
        }
    }

    /// Reset both all-time counters and the sliding window.
    pub fn reset(&mut self) {
        self.total_size = 0;
        self.n_blocks = 0;
        self.t_begin = Instant::now();

        self.samples.clear();
        self.bytes_in_window = 0;
    }
}

/// `<base>_<yyMMdd>_<HHmmss>` in local time, falling back to UTC.
pub fn timestamped_stem(base: &str) -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let stamp = now
        .format(format_description!(
            "[year repr:last_two][month][day]_[hour][minute][second]"
        ))
        .unwrap_or_else(|_| now.unix_timestamp().to_string());
    format!("{base}_{stamp}")
}

/// `dir/stem + ext`, with `_1`, `_2`, ... appended while that path exists.
pub fn unique_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let mut candidate = dir.join(format!("{stem}{ext}"));
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{stem}_{n}{ext}"));
        n += 1;
    }
    candidate
}
