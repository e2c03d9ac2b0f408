use super::{ExecutorError, Failure, RunSummary};
use parking_lot::Mutex;
use rayon::{prelude::*, ThreadPoolBuilder};
use std::{
    process::{Command, Stdio},
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, trace, warn};

/// Executor that drains manifest lines on a local thread pool, without timeouts or retries
#[derive(Clone, Debug)]
pub struct LocalExecutor {
    threads: usize,
    pause: Duration,
}

impl LocalExecutor {
    pub fn new(threads: Option<usize>, pause: Duration) -> Self {
        Self {
            threads: threads.filter(|threads| *threads > 0).unwrap_or_else(num_cpus::get),
            pause,
        }
    }

    fn run_line(line: &str) -> Result<(), Failure> {
        let start = Instant::now();

        match Command::new("sh")
            .arg("-c")
            .arg(line)
            .stdin(Stdio::null())
            .output()
        {
            Ok(output) => {
                debug!(
                    "Finished in {} ms | status: {}",
                    start.elapsed().as_millis(),
                    output.status
                );
                trace!("Output: {}", String::from_utf8_lossy(&output.stdout));

                if output.status.success() {
                    Ok(())
                } else {
                    warn!(
                        line = line,
                        stderr = %String::from_utf8_lossy(&output.stderr).trim_end(),
                        "Job failed"
                    );
                    Err(Failure::from_code(output.status.code()))
                }
            }
            Err(e) => {
                warn!(line = line, "Failed with {e}");
                Err(Failure::Spawn)
            }
        }
    }

    /// execute lines concurrently with a thread pool
    #[instrument(skip_all, level = "info")]
    pub fn execute(&self, lines: Vec<String>) -> Result<RunSummary, ExecutorError> {
        debug!("Starting thread pool with {} threads", self.threads);

        let pool = ThreadPoolBuilder::new().num_threads(self.threads).build()?;

        // general counters to provide a progress log
        let total = lines.len() as u64;
        let processed = AtomicU64::new(0);
        let failed = Mutex::new(Vec::new());

        pool.install(|| {
            lines.par_iter().for_each(|line| {
                if !self.pause.is_zero() {
                    thread::sleep(self.pause);
                }

                if let Err(failure) = Self::run_line(line) {
                    failed.lock().push((line.clone(), failure));
                }

                info!(
                    "Done with {}/{}",
                    processed.fetch_add(1, Ordering::SeqCst) + 1,
                    total
                );
            });
        });

        let mut failed = failed.into_inner();
        // keep the manifest order in the summary
        failed.sort_by_key(|(line, _)| lines.iter().position(|candidate| candidate == line));

        info!(failed = failed.len(), "Done with processing");

        Ok(RunSummary {
            total: lines.len(),
            failed,
        })
    }
}
