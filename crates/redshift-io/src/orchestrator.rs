//! Flush orchestrator (§4.7): decides when a stream's batch is
//! sealed and handed to a worker, runs those workers with bounded
//! parallelism, and tracks which flush sequence numbers have
//! committed so the message loop knows when a captured `STATE` is
//! safe to emit (§5's ordering guarantee).
//!
//! Flushes for distinct streams may run concurrently; flushes for the
//! same stream are serialized by a per-stream `tokio::sync::Mutex` so
//! that rotating a stream's stage file (done by the registry before
//! a flush is submitted) never races with the worker still draining
//! the previous one.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;
use tokio::sync::{Mutex as AsyncMutex, Notify, Semaphore};
use tracing::{error, info};

use redshift_core::error::{Result, TargetError};

use crate::registry::StreamRegistry;
use crate::stage::SealedBatch;
use crate::sync::{LoadContext, WarehouseSync};

struct Inner {
    sync: Arc<WarehouseSync>,
    semaphore: Arc<Semaphore>,
    permits: AtomicUsize,
    stream_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    next_seq: AtomicU64,
    completed: StdMutex<BTreeSet<u64>>,
    watermark: AtomicU64,
    failure: StdMutex<Option<String>>,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Bounded worker pool for §4.5's `load` plus the sequence/watermark
/// bookkeeping for state-gating. Cheaply `Clone`able: every clone
/// shares the same pool and counters.
#[derive(Clone)]
pub struct FlushOrchestrator {
    inner: Arc<Inner>,
}

impl FlushOrchestrator {
    pub fn new(sync: Arc<WarehouseSync>, pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            inner: Arc::new(Inner {
                sync,
                semaphore: Arc::new(Semaphore::new(pool_size)),
                permits: AtomicUsize::new(pool_size),
                stream_locks: DashMap::new(),
                next_seq: AtomicU64::new(0),
                completed: StdMutex::new(BTreeSet::new()),
                watermark: AtomicU64::new(0),
                failure: StdMutex::new(None),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn sync(&self) -> &Arc<WarehouseSync> {
        &self.inner.sync
    }

    /// Grow the bounded pool toward `target` permits (§4.7:
    /// `parallelism=0` tracks the current count of active streams, so
    /// the target drifts up as new streams register). Only grows.
    /// `tokio::sync::Semaphore` has no safe way to revoke permits
    /// already lent to in-flight flushes, and a pool briefly larger
    /// than strictly necessary doesn't violate the bound in practice
    /// (`max_parallelism` is enforced by `Config::effective_parallelism`
    /// before this is ever called).
    pub fn resize(&self, target: usize) {
        let target = target.max(1);
        let current = self.inner.permits.load(Ordering::SeqCst);
        if target > current {
            self.inner.semaphore.add_permits(target - current);
            self.inner.permits.store(target, Ordering::SeqCst);
        }
    }

    /// The highest flush sequence assigned so far. Used as the gate
    /// for a `STATE` message received right now (§5: "a state
    /// checkpoint received at loop time T is emitted only after every
    /// flush submitted at time <= T has succeeded").
    pub fn current_seq(&self) -> u64 {
        self.inner.next_seq.load(Ordering::SeqCst)
    }

    /// The highest sequence `N` such that every flush `1..=N` has
    /// committed. A `STATE` whose gate is `<= watermark` may be
    /// emitted.
    pub fn watermark(&self) -> u64 {
        self.inner.watermark.load(Ordering::SeqCst)
    }

    /// Non-blocking: surfaces the first flush failure, if any, as a
    /// fresh `Fatal` error (§7: "worker errors surface to the
    /// orchestrator, which sets a failure flag read by the message
    /// loop before submitting further flushes"). Call before every
    /// new submission and after draining state.
    pub fn check(&self) -> Result<()> {
        match self.inner.failure.lock().unwrap().as_ref() {
            Some(message) => Err(TargetError::Fatal(anyhow::anyhow!(message.clone()))),
            None => Ok(()),
        }
    }

    /// Seal `stream`'s current batch through the registry and submit
    /// it to a worker. Returns `None` if the stream had no rows to
    /// flush, else the sequence number assigned to the flush.
    pub async fn flush_stream(&self, registry: &StreamRegistry, stream: &str, scratch_dir: &Path) -> Result<Option<u64>> {
        self.check()?;
        match registry.seal_batch(stream, scratch_dir).await? {
            Some((batch, ctx)) => Ok(Some(self.submit(stream.to_string(), ctx, batch))),
            None => Ok(None),
        }
    }

    /// Hand a sealed batch to a worker task. The task acquires a pool
    /// permit and this stream's serialization lock before running
    /// §4.5's `load`; submission itself never blocks the caller.
    fn submit(&self, stream: String, ctx: LoadContext, batch: SealedBatch) -> u64 {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);

        let inner = self.inner.clone();
        let stream_lock = inner
            .stream_locks
            .entry(stream.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();

        info!(stream = %stream, seq, rows = batch.row_count, "flush submitted");

        tokio::spawn(async move {
            let permit = inner.semaphore.clone().acquire_owned().await;
            let _stream_guard = stream_lock.lock().await;

            let result = match permit {
                Ok(_permit) => inner.sync.load(&ctx, batch).await,
                Err(_) => Err(TargetError::Fatal(anyhow::anyhow!("flush worker pool closed"))),
            };

            match &result {
                Ok(outcome) => info!(stream = %outcome.stream, rows = outcome.rows, seq, "flush committed"),
                Err(e) => error!(stream = %stream, seq, error = %e, "flush failed"),
            }

            inner.complete(seq, result);
        });

        seq
    }

    /// Block until every flush submitted so far has completed, then
    /// surface the first failure if any occurred. Used at
    /// end-of-input, and with a bounded timeout on signal (§5).
    pub async fn wait_idle(&self) -> Result<()> {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return self.check();
            }
            notified.await;
        }
    }
}

impl Inner {
    fn complete(&self, seq: u64, result: Result<crate::sync::LoadOutcome>) {
        if let Err(e) = result {
            let mut failure = self.failure.lock().unwrap();
            if failure.is_none() {
                *failure = Some(e.to_string());
            }
        }

        {
            let mut completed = self.completed.lock().unwrap();
            completed.insert(seq);
            let mut watermark = self.watermark.load(Ordering::SeqCst);
            while completed.contains(&(watermark + 1)) {
                watermark += 1;
            }
            self.watermark.store(watermark, Ordering::SeqCst);
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.idle.notify_waiters();
    }
}
