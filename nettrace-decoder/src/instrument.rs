use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::{Condvar, Mutex};
use tracing::warn;

/// Timing hooks around the decoder's two boundaries: pulls from the byte
/// source and dispatches into the sink. Implementations must stay cheap;
/// they run on the decode path.
pub trait DecodeHooks: Send + Sync {
    fn start_read(&self) {}
    fn stop_read(&self, _bytes: usize) {}
    fn start_dispatch(&self) {}
    fn stop_dispatch(&self) {}
}

/// The default: instrumentation disabled.
pub struct NoopHooks;

impl DecodeHooks for NoopHooks {}

pub const INSTRUMENTATION_ENV: &str = "TRACE_EVENT_ENABLE_INSTRUMENTATION";

/// Rollover applied when the variable is set but not a number.
const DEFAULT_ROLLOVER_MINUTES: u64 = 30;

/// How many rotated log files are retained.
const RETAINED_FILES: u32 = 2;

struct LogSink {
    encoder: GzEncoder<File>,
    path: PathBuf,
}

struct Shared {
    sink: Mutex<Option<LogSink>>,
    dir: PathBuf,
    started: Instant,
}

impl Shared {
    fn file_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("nettrace-decoder.{}.log.gz", index))
    }

    fn open_sink(&self, index: u32) -> io::Result<LogSink> {
        let path = self.file_path(index);
        let file = File::create(&path)?;
        Ok(LogSink {
            encoder: GzEncoder::new(file, Compression::default()),
            path,
        })
    }

    fn log_line(&self, line: &str) {
        let mut guard = self.sink.lock();
        if let Some(sink) = guard.as_mut() {
            let micros = self.started.elapsed().as_micros();
            // A failed log line must never disturb the decode pass.
            let _ = writeln!(sink.encoder, "{} {}", micros, line);
        }
    }

    /// Two-phase swap: the replacement sink is fully built before the write
    /// guard is taken, so log writers never observe a half-open file.
    fn rotate(&self, next_index: u32) {
        let fresh = match self.open_sink(next_index) {
            Ok(sink) => sink,
            Err(err) => {
                warn!(error = %err, "instrumentation log rotation failed");
                return;
            }
        };
        let old = {
            let mut guard = self.sink.lock();
            guard.replace(fresh)
        };
        if let Some(old) = old {
            let _ = old.encoder.finish();
        }
        if next_index >= RETAINED_FILES {
            let _ = fs::remove_file(self.file_path(next_index - RETAINED_FILES));
        }
    }
}

/// Opt-in decoder instrumentation: a gzip-compressed text log of read and
/// dispatch events, rotated on a timer with the two most recent files
/// retained. The timer thread is the only concurrency in the decoder and
/// shares nothing with it beyond the sink guard.
pub struct Instrumentation {
    shared: Arc<Shared>,
    stop: Arc<(Mutex<bool>, Condvar)>,
    timer: Option<JoinHandle<()>>,
}

impl Instrumentation {
    /// Read `TRACE_EVENT_ENABLE_INSTRUMENTATION`: a positive integer is a
    /// rollover interval in minutes, zero or unset disables, any other
    /// non-empty value keeps the legacy 30-minute default.
    pub fn from_env() -> Option<Instrumentation> {
        let value = std::env::var(INSTRUMENTATION_ENV).ok()?;
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        let minutes = match value.parse::<u64>() {
            Ok(0) => return None,
            Ok(minutes) => minutes,
            Err(_) => DEFAULT_ROLLOVER_MINUTES,
        };
        match Instrumentation::with_rollover(
            std::env::temp_dir(),
            Duration::from_secs(minutes * 60),
        ) {
            Ok(instrumentation) => Some(instrumentation),
            Err(err) => {
                warn!(error = %err, "failed to enable decoder instrumentation");
                None
            }
        }
    }

    pub fn with_rollover(dir: PathBuf, interval: Duration) -> io::Result<Instrumentation> {
        fs::create_dir_all(&dir)?;
        let shared = Arc::new(Shared {
            sink: Mutex::new(None),
            dir,
            started: Instant::now(),
        });
        *shared.sink.lock() = Some(shared.open_sink(0)?);

        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let timer = {
            let shared = shared.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("nettrace-instrument".to_string())
                .spawn(move || {
                    let (lock, condvar) = &*stop;
                    let mut next_index = 1u32;
                    let mut stopped = lock.lock();
                    while !*stopped {
                        if condvar.wait_for(&mut stopped, interval).timed_out() {
                            shared.rotate(next_index);
                            next_index += 1;
                        }
                    }
                })?
        };

        Ok(Instrumentation {
            shared,
            stop,
            timer: Some(timer),
        })
    }

    /// Wrap into the hook handle the decoder consumes, falling back to
    /// no-ops when the environment leaves instrumentation off.
    pub fn hooks_from_env() -> Arc<dyn DecodeHooks> {
        match Instrumentation::from_env() {
            Some(instrumentation) => Arc::new(instrumentation),
            None => Arc::new(NoopHooks),
        }
    }

    /// Path of the currently active log file.
    pub fn active_log_path(&self) -> Option<PathBuf> {
        self.shared.sink.lock().as_ref().map(|sink| sink.path.clone())
    }
}

impl DecodeHooks for Instrumentation {
    fn start_read(&self) {
        self.shared.log_line("read.start");
    }

    fn stop_read(&self, bytes: usize) {
        self.shared.log_line(&format!("read.stop bytes={}", bytes));
    }

    fn start_dispatch(&self) {
        self.shared.log_line("dispatch.start");
    }

    fn stop_dispatch(&self) {
        self.shared.log_line("dispatch.stop");
    }
}

impl Drop for Instrumentation {
    fn drop(&mut self) {
        {
            let (lock, condvar) = &*self.stop;
            *lock.lock() = true;
            condvar.notify_one();
        }
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
        let sink = self.shared.sink.lock().take();
        if let Some(sink) = sink {
            let _ = sink.encoder.finish();
        }
    }
}
