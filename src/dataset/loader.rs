//! Lazy sample generation.
//!
//! Samples are built from a [`Candidates`] iterator either on the calling thread
//! or on a small pool of worker threads. With workers, results are re-ordered by
//! sequence number before they are handed out, so the delivered order never
//! depends on thread scheduling.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::slice;
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use super::sampler::{CandidateGrid, Candidates, SamplingPolicy};
use super::Sample;
use crate::data::{PvDataSource, POWER};
use crate::domain::{Horizons, PvId, PvX, PvY, Timestamp};
use crate::error::{PspError, Result};
use crate::ml::GetFeatures;
use crate::telemetry::StopFlag;

/// Jobs kept in flight per worker.
const IN_FLIGHT_PER_WORKER: usize = 4;

/// Builds a single sample: ground truth from the data source, features from the model.
pub struct SampleBuilder {
    source: Arc<dyn PvDataSource>,
    horizons: Horizons,
    features: Arc<dyn GetFeatures>,
}

impl SampleBuilder {
    pub fn new(
        source: Arc<dyn PvDataSource>,
        horizons: Horizons,
        features: Arc<dyn GetFeatures>,
    ) -> Self {
        Self {
            source,
            horizons,
            features,
        }
    }

    pub fn build(&self, x: PvX) -> Result<Sample> {
        let y = self.ground_truth(&x)?;
        let features = self.features.get_features(&x)?;
        Ok(Sample { x, y, features })
    }

    /// Mean observed power over each horizon.
    pub fn ground_truth(&self, x: &PvX) -> Result<PvY> {
        let end = x.ts + self.horizons.span();
        let series = self.source.get(slice::from_ref(&x.pv_id), x.ts, end)?;

        let mut powers = Vec::with_capacity(self.horizons.len());
        for (i, h) in self.horizons.iter().enumerate() {
            let power = series
                .mean_between(POWER, x.ts + h.start(), x.ts + h.end())
                .ok_or_else(|| {
                    PspError::missing_data(
                        &x.pv_id,
                        x.ts,
                        format!("no power observed in horizon {i}"),
                    )
                })?;
            powers.push(power);
        }
        Ok(PvY::new(powers))
    }
}

struct WorkerPool {
    jobs: Option<mpsc::Sender<(usize, PvX)>>,
    results: mpsc::Receiver<(usize, Result<Sample>)>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn new(size: usize, builder: Arc<SampleBuilder>) -> Result<Self> {
        let (job_tx, job_rx) = mpsc::channel::<(usize, PvX)>();
        let (result_tx, result_rx) = mpsc::channel();
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut handles = Vec::with_capacity(size);
        for id in 0..size {
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            let builder = Arc::clone(&builder);
            let handle = thread::Builder::new()
                .name(format!("psp-sampler-{id}"))
                .spawn(move || loop {
                    let job = match job_rx.lock() {
                        Ok(guard) => guard.recv(),
                        Err(_) => break,
                    };
                    let Ok((seq, x)) = job else { break };

                    let pv_id = x.pv_id.clone();
                    let result = panic::catch_unwind(AssertUnwindSafe(|| builder.build(x)))
                        .unwrap_or_else(|_| {
                            Err(PspError::Worker(format!(
                                "worker {id} panicked while building a sample for {pv_id}"
                            )))
                        });
                    if result_tx.send((seq, result)).is_err() {
                        break;
                    }
                })?;
            handles.push(handle);
        }

        Ok(Self {
            jobs: Some(job_tx),
            results: result_rx,
            handles,
        })
    }

    fn submit(&self, seq: usize, x: PvX) -> Result<()> {
        self.jobs
            .as_ref()
            .and_then(|tx| tx.send((seq, x)).ok())
            .ok_or_else(|| PspError::Worker("sample workers are gone".into()))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the job channel lets workers drain what is queued and exit.
        self.jobs.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("sample worker exited abnormally");
            }
        }
    }
}

/// Counts of built and skipped candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleStats {
    pub kept: usize,
    pub skipped: usize,
}

/// Entry point of sample generation.
pub struct SampleGenerator {
    builder: Arc<SampleBuilder>,
    num_workers: usize,
    stop: Option<StopFlag>,
}

impl SampleGenerator {
    pub fn new(
        source: Arc<dyn PvDataSource>,
        horizons: Horizons,
        features: Arc<dyn GetFeatures>,
    ) -> Self {
        Self {
            builder: Arc::new(SampleBuilder::new(source, horizons, features)),
            num_workers: 0,
            stop: None,
        }
    }

    /// `0` builds samples synchronously on the consuming thread.
    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// End every stream early once `stop` is raised.
    pub fn with_stop(mut self, stop: StopFlag) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Lazily generate samples for `pv_ids` with reference times in `[start_ts, end_ts]`.
    pub fn generate(
        &self,
        pv_ids: &[PvId],
        start_ts: Timestamp,
        end_ts: Timestamp,
        policy: &SamplingPolicy,
    ) -> Result<SampleStream> {
        policy.validate()?;
        let grid = CandidateGrid::new(pv_ids, start_ts, end_ts, policy.step)?;
        let candidates = Candidates::new(grid, policy.clone())?;

        let pool = match self.num_workers {
            0 => None,
            n => Some(WorkerPool::new(n, Arc::clone(&self.builder))?),
        };

        debug!(
            sites = pv_ids.len(),
            candidates = candidates.total(),
            workers = self.num_workers,
            shuffle = policy.shuffle,
            "starting sample generation"
        );

        Ok(SampleStream {
            candidates,
            builder: Arc::clone(&self.builder),
            pool,
            window: self.num_workers.max(1) * IN_FLIGHT_PER_WORKER,
            dispatched: 0,
            next_seq: 0,
            reorder: BTreeMap::new(),
            limit: policy.limit,
            stop: self.stop.clone(),
            stats: SampleStats::default(),
            finished: false,
        })
    }
}

/// Finite, single-use stream of samples in candidate order.
pub struct SampleStream {
    candidates: Candidates,
    builder: Arc<SampleBuilder>,
    pool: Option<WorkerPool>,
    window: usize,
    dispatched: usize,
    next_seq: usize,
    reorder: BTreeMap<usize, Result<Sample>>,
    limit: Option<usize>,
    stop: Option<StopFlag>,
    stats: SampleStats,
    finished: bool,
}

impl SampleStream {
    pub fn stats(&self) -> SampleStats {
        self.stats
    }

    /// Group into batches of exactly `batch_size`, dropping the final partial batch.
    pub fn batches(self, batch_size: usize) -> Result<Batches<Self>> {
        Batches::new(self, batch_size)
    }

    fn next_built(&mut self) -> Option<Result<Sample>> {
        let Some(pool) = self.pool.as_ref() else {
            let (_, x) = self.candidates.next()?;
            return Some(self.builder.build(x));
        };

        while self.dispatched - self.next_seq < self.window {
            let Some((_, x)) = self.candidates.next() else {
                break;
            };
            if let Err(e) = pool.submit(self.dispatched, x) {
                return Some(Err(e));
            }
            self.dispatched += 1;
        }
        if self.next_seq == self.dispatched {
            return None;
        }

        loop {
            if let Some(result) = self.reorder.remove(&self.next_seq) {
                self.next_seq += 1;
                return Some(result);
            }
            match pool.results.recv() {
                Ok((seq, result)) => {
                    self.reorder.insert(seq, result);
                }
                Err(_) => {
                    return Some(Err(PspError::Worker("all sample workers exited".into())));
                }
            }
        }
    }

    fn should_stop(&self) -> bool {
        self.limit.is_some_and(|limit| self.stats.kept >= limit)
            || self.stop.as_ref().is_some_and(StopFlag::is_stopped)
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        // Release the workers right away rather than when the stream is dropped.
        self.pool.take();

        let SampleStats { kept, skipped } = self.stats;
        if kept == 0 && skipped > 0 {
            warn!(skipped, "every candidate sample was skipped for missing data");
        } else {
            info!(kept, skipped, "sample generation finished");
        }
    }
}

impl Iterator for SampleStream {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            if self.should_stop() {
                self.finish();
                return None;
            }
            match self.next_built() {
                None => {
                    self.finish();
                    return None;
                }
                Some(Ok(sample)) => {
                    self.stats.kept += 1;
                    return Some(Ok(sample));
                }
                Some(Err(e)) if e.is_skippable() => {
                    self.stats.skipped += 1;
                    debug!(error = %e, "skipping sample");
                }
                Some(Err(e)) => {
                    self.finish();
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Fixed-size batches over a sample iterator.
pub struct Batches<I> {
    inner: I,
    batch_size: usize,
}

impl<I> Batches<I>
where
    I: Iterator<Item = Result<Sample>>,
{
    pub fn new(inner: I, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(PspError::InvalidInput("batch_size must be at least 1".into()));
        }
        Ok(Self { inner, batch_size })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl<I> Iterator for Batches<I>
where
    I: Iterator<Item = Result<Sample>>,
{
    type Item = Result<Vec<Sample>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            match self.inner.next()? {
                Ok(sample) => batch.push(sample),
                Err(e) => return Some(Err(e)),
            }
        }
        Some(Ok(batch))
    }
}
