use std::process::Stdio;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info_span, trace, warn};

use crate::queue::Queue;
use crate::schema::Job;

/// Grace period between the termination signal and the forcible kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Pause between back-to-back jobs, so a busy worker still yields to
/// signal handling and other pool members.
const BUSY_PAUSE: Duration = Duration::from_millis(100);

/// Outcome of one execution attempt, before it is reported to the queue.
enum Outcome {
    Success { stdout: String, elapsed_ms: i64 },
    Failure { message: String },
}

pub(crate) struct Worker {
    pub(crate) queue: Queue,
    pub(crate) shutdown: broadcast::Receiver<()>,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) shutdown_when_queue_empty: bool,
}

impl Worker {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::rng().random_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Claim and execute jobs until shutdown, or until the queue is empty if
    /// `shutdown_when_queue_empty` is set.
    ///
    /// A shutdown request never interrupts a running child process; the
    /// current attempt is reported before the loop exits.
    pub(crate) async fn run(mut self) {
        loop {
            match self.shutdown.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => {
                    debug!("Shutdown requested. Stopping the worker…");
                    break;
                }
            }

            match self.run_next_job().await {
                Ok(Some(_)) => sleep(BUSY_PAUSE).await,
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No eligible jobs found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No eligible jobs found. Polling again in {sleep_duration:?}…");
                    tokio::select! {
                        () = sleep(sleep_duration) => {}
                        _ = self.shutdown.recv() => {
                            debug!("Shutdown requested. Stopping the worker…");
                            break;
                        }
                    }
                }
                Err(error) => {
                    error!("Failed to run job: {error}");
                    sleep(self.sleep_duration_with_jitter()).await;
                }
            }
        }
    }

    /// Run the next job in the queue, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was run
    /// - `Ok(None)` if no jobs were eligible
    /// - `Err(...)` if claiming or reporting the outcome failed
    async fn run_next_job(&self) -> anyhow::Result<Option<String>> {
        let Some(job) = self.queue.claim().await? else {
            return Ok(None);
        };

        let span = info_span!("job", job.id = %job.id);
        async {
            debug!(command = %job.command, "Running job…");
            match execute(&job).await {
                Outcome::Success { stdout, elapsed_ms } => {
                    debug!(elapsed_ms, "Job succeeded");
                    self.queue.complete(&job.id, &stdout, elapsed_ms).await?;
                }
                Outcome::Failure { message } => {
                    warn!(%message, "Job attempt failed");
                    self.queue.fail(&job.id, &message).await?;
                }
            }
            anyhow::Ok(())
        }
        .instrument(span)
        .await?;

        Ok(Some(job.id))
    }
}

/// Spawn the job's command through the shell and supervise it to completion
/// or timeout. Stdout and stderr are captured separately.
async fn execute(job: &Job) -> Outcome {
    let started = Instant::now();

    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(&job.command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(error) => {
            return Outcome::Failure {
                message: format!("Failed to spawn command: {error}"),
            };
        }
    };

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    let timeout = Duration::from_secs(u64::try_from(job.timeout_seconds).unwrap_or(0));

    let wait = async {
        // Drain both pipes concurrently so neither can fill up and block the
        // child, then reap the exit status.
        let drain = async {
            tokio::try_join!(
                async {
                    match stdout_pipe.as_mut() {
                        Some(pipe) => pipe.read_to_end(&mut stdout).await.map(|_| ()),
                        None => Ok(()),
                    }
                },
                async {
                    match stderr_pipe.as_mut() {
                        Some(pipe) => pipe.read_to_end(&mut stderr).await.map(|_| ()),
                        None => Ok(()),
                    }
                },
            )?;
            Ok::<(), std::io::Error>(())
        };

        let (drained, status) = tokio::join!(drain, child.wait());
        drained?;
        status
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(Ok(status)) => {
            let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
            if status.success() {
                Outcome::Success {
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    elapsed_ms,
                }
            } else {
                let stderr = String::from_utf8_lossy(&stderr);
                let message = if stderr.trim().is_empty() {
                    match status.code() {
                        Some(code) => format!("Command failed with exit code {code}"),
                        None => "Command terminated by signal".to_string(),
                    }
                } else {
                    stderr.trim_end().to_string()
                };
                Outcome::Failure { message }
            }
        }
        Ok(Err(error)) => Outcome::Failure {
            message: format!("Failed to read command output: {error}"),
        },
        Err(_) => {
            terminate(&mut child).await;
            Outcome::Failure {
                message: format!("Job timed out after {} seconds", job.timeout_seconds),
            }
        }
    }
}

/// Two-stage shutdown of a timed-out child: a termination signal first, then
/// a forcible kill if it has not exited within [`KILL_GRACE`].
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let pid = nix::unistd::Pid::from_raw(pid as i32);
        if let Err(errno) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
            trace!(%errno, "Failed to signal timed-out child");
        }
    }

    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        if let Err(error) = child.kill().await {
            warn!(%error, "Failed to kill timed-out child");
        }
    }
}
