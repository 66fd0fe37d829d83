use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};

use crate::queue::Queue;
use crate::worker::Worker;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// The worker pool: spawns N polling workers plus the stale-job reaper.
///
/// The runner owns a [`Queue`] handle; the queue knows nothing about
/// workers. All cross-worker coordination happens through the store's
/// guarded claim update.
#[derive(Debug)]
pub struct Runner {
    queue: Queue,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    shutdown_when_queue_empty: bool,
    reap_interval: Duration,
}

impl Runner {
    /// Create a runner with `num_workers` concurrent workers.
    pub fn new(queue: Queue, num_workers: usize) -> Self {
        Self {
            queue,
            num_workers,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            shutdown_when_queue_empty: false,
            reap_interval: DEFAULT_REAP_INTERVAL,
        }
    }

    /// Set how often workers poll for new jobs when the queue is empty.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter added to each empty-poll sleep.
    ///
    /// Jitter spreads out polling when several workers go idle at the same
    /// moment. The applied value is uniform between zero and this duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Stop every worker once no eligible jobs remain, instead of polling
    /// forever. Useful for batch drains and tests.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Set how often the reaper scans for stuck `processing` jobs.
    pub fn reap_interval(mut self, reap_interval: Duration) -> Self {
        self.reap_interval = reap_interval;
        self
    }

    /// Start the workers and the reaper.
    ///
    /// Returns a [`RunHandle`] used to request shutdown and wait for the
    /// pool to drain.
    pub fn start(&self) -> RunHandle {
        let (shutdown_tx, _) = broadcast::channel(1);

        let mut workers = Vec::with_capacity(self.num_workers);
        for i in 1..=self.num_workers {
            let name = format!("worker-{i}");
            info!(worker.name = %name, "Starting worker…");

            let worker = Worker {
                queue: self.queue.clone(),
                shutdown: shutdown_tx.subscribe(),
                poll_interval: self.poll_interval,
                jitter: self.jitter,
                shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            };

            let span = info_span!("worker", worker.name = %name);
            workers.push(tokio::spawn(async move { worker.run().instrument(span).await }));
        }

        let reaper = tokio::spawn(reap_loop(
            self.queue.clone(),
            self.reap_interval,
            shutdown_tx.subscribe(),
        ));

        RunHandle {
            shutdown_tx,
            workers,
            reaper,
        }
    }
}

/// Handle to a running worker pool.
#[derive(Debug)]
pub struct RunHandle {
    shutdown_tx: broadcast::Sender<()>,
    workers: Vec<JoinHandle<()>>,
    reaper: JoinHandle<()>,
}

impl RunHandle {
    /// Request a graceful shutdown: workers stop claiming new jobs but let
    /// any in-flight child process run to natural completion.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Wait for every worker to drain and the reaper to stop.
    pub async fn wait_for_shutdown(self) {
        join_all(self.workers).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Worker task panicked");
            }
        });

        // The workers may have exited on their own (queue drained); make
        // sure the reaper gets a shutdown signal either way.
        let _ = self.shutdown_tx.send(());
        if let Err(error) = self.reaper.await {
            warn!(%error, "Reaper task panicked");
        }
    }
}

/// Periodically return long-stuck `processing` jobs to `pending`.
///
/// The first tick fires immediately, so a crash-orphaned job is recovered as
/// soon as a new pool starts. Re-queueing does not charge an attempt.
async fn reap_loop(queue: Queue, every: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let threshold = match queue.reaper_threshold().await {
                    Ok(threshold) => threshold,
                    Err(error) => {
                        error!(%error, "Failed to read reaper threshold");
                        continue;
                    }
                };
                match queue.requeue_stale(threshold).await {
                    Ok(0) => {}
                    Ok(count) => warn!(count, "Requeued stale processing jobs"),
                    Err(error) => error!(%error, "Failed to requeue stale jobs"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
