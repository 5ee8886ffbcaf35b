//! Data-parallel phases over a fixed pool of worker threads.
//!
//! A phase splits an output slice into contiguous [`WorkRange`]s, hands one
//! disjoint sub-slice to each spawned task and waits for all of them inside a
//! rayon scope. Kernels read shared state through an immutable context and
//! write only their own sub-slice, so a phase needs no locking beyond the
//! per-worker scratch slots.

use crate::error::{FluidError, FluidResult};
use log::{debug, warn};
use parking_lot::Mutex;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

// MARK: Work Ranges
/// Inclusive index range `[first, last]` of one unit of phase work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkRange {
    pub first: usize,
    pub last: usize,
}

impl WorkRange {
    pub fn len(&self) -> usize {
        self.last - self.first + 1
    }

    pub fn indices(&self) -> RangeInclusive<usize> {
        self.first..=self.last
    }
}

/// Partition `[0, n_items)` into at most `n_workers` contiguous ranges.
///
/// Every range gets `n_items / n_ranges` items and the last one absorbs the
/// remainder. No items (or no workers) gives no ranges; fewer items than
/// workers gives one range per item.
pub fn divide_work(n_items: usize, n_workers: usize) -> Vec<WorkRange> {
    if n_items == 0 || n_workers == 0 {
        return Vec::new();
    }
    let n_ranges = n_workers.min(n_items);
    let block = n_items / n_ranges;

    let mut ranges = Vec::with_capacity(n_ranges);
    let mut first = 0;
    for i in 0..n_ranges {
        let last = if i + 1 == n_ranges {
            n_items - 1
        } else {
            first + block - 1
        };
        ranges.push(WorkRange { first, last });
        first = last + 1;
    }
    ranges
}

/// One range of a phase as seen by a kernel. `items[k]` is the output slot
/// for global index `range.first + k`.
pub struct RangeTask<'a, O, C: ?Sized> {
    pub range: WorkRange,
    pub items: &'a mut [O],
    pub context: &'a C,
}

impl<O, C: ?Sized> RangeTask<'_, O, C> {
    /// Global indices paired with their output slots.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut O)> {
        let first = self.range.first;
        self.items
            .iter_mut()
            .enumerate()
            .map(move |(k, item)| (first + k, item))
    }
}

// MARK: Worker Pool
/// Fixed set of worker threads shared by every phase of one or more
/// simulations. Created once and passed in by the caller.
#[derive(Debug)]
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    n_workers: usize,
    shut_down: AtomicBool,
}

impl WorkerPool {
    /// Pool sized to the host's available parallelism.
    pub fn new() -> FluidResult<Self> {
        let n_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        WorkerPool::with_workers(n_workers)
    }

    pub fn with_workers(n_workers: usize) -> FluidResult<Self> {
        if n_workers == 0 {
            return Err(FluidError::invalid("worker pool needs at least one thread"));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_workers)
            .thread_name(|i| format!("vorton-worker-{}", i))
            .build()?;
        debug!("started worker pool with {} threads", n_workers);
        Ok(WorkerPool {
            pool,
            n_workers,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    /// Stop accepting work. Ranges of a running phase that have not started
    /// yet are skipped and the phase reports [`FluidError::PhaseAborted`].
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            debug!("worker pool shutting down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

// MARK: Kernel Group
/// Timing and size of a completed phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseReport {
    pub phase: &'static str,
    pub ranges: usize,
    pub items: usize,
    pub elapsed: Duration,
}

impl PhaseReport {
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }
}

/// A pool bound to one kind of kernel, with private scratch state for each
/// worker thread.
pub struct KernelGroup<S> {
    pool: Arc<WorkerPool>,
    phase: &'static str,
    n_ranges: usize,
    // one slot per worker plus one for a caller outside the pool
    scratch: Vec<Mutex<S>>,
    #[cfg(test)]
    stop_after_first_range: bool,
}

impl<S: Send> KernelGroup<S> {
    pub fn new(pool: Arc<WorkerPool>, phase: &'static str, factory: impl Fn() -> S) -> Self {
        let n_ranges = pool.n_workers();
        let scratch = (0..=pool.n_workers()).map(|_| Mutex::new(factory())).collect();
        KernelGroup {
            pool,
            phase,
            n_ranges,
            scratch,
            #[cfg(test)]
            stop_after_first_range: false,
        }
    }

    /// Shut the pool down as soon as one range of the next phase finishes.
    #[cfg(test)]
    pub(crate) fn stop_pool_after_first_range(&mut self) {
        self.stop_after_first_range = true;
    }

    /// Split each phase into `n_ranges` ranges instead of one per worker.
    /// More ranges than workers evens out uneven per-item cost.
    pub fn with_range_count(mut self, n_ranges: usize) -> Self {
        self.n_ranges = n_ranges.max(1);
        self
    }

    pub fn phase(&self) -> &'static str {
        self.phase
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Run `kernel` over `items`, one task per work range, and block until
    /// every range has finished or been skipped.
    ///
    /// Takes `&mut self` so a group never has two phases in flight. Zero
    /// items returns immediately without touching the pool.
    pub fn run<O, C, F>(&mut self, items: &mut [O], context: &C, kernel: F) -> FluidResult<PhaseReport>
    where
        O: Send,
        C: Sync + ?Sized,
        F: Fn(RangeTask<'_, O, C>, &mut S) + Sync,
    {
        let phase = self.phase;
        if self.pool.is_shut_down() {
            return Err(FluidError::PoolShutDown { phase });
        }

        let start = Instant::now();
        let n_items = items.len();
        let ranges = divide_work(n_items, self.n_ranges);
        let total = ranges.len();
        if total == 0 {
            return Ok(PhaseReport {
                phase,
                ranges: 0,
                items: 0,
                elapsed: start.elapsed(),
            });
        }

        let skipped = AtomicUsize::new(0);
        let shut_down = &self.pool.shut_down;
        let scratch = &self.scratch;
        let kernel = &kernel;
        let skipped_ref = &skipped;
        #[cfg(test)]
        let stop_after_first_range = self.stop_after_first_range;

        self.pool.pool.scope(|scope| {
            let mut rest: &mut [O] = items;
            for range in ranges {
                let (chunk, tail) = std::mem::take(&mut rest).split_at_mut(range.len());
                rest = tail;
                scope.spawn(move |_| {
                    if shut_down.load(Ordering::Acquire) {
                        skipped_ref.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    let slot = rayon::current_thread_index()
                        .unwrap_or(scratch.len() - 1)
                        .min(scratch.len() - 1);
                    let mut state = scratch[slot].lock();
                    kernel(
                        RangeTask {
                            range,
                            items: chunk,
                            context,
                        },
                        &mut *state,
                    );
                    #[cfg(test)]
                    if stop_after_first_range {
                        shut_down.store(true, Ordering::Release);
                    }
                    drop(state);
                });
            }
        });

        let skipped = skipped.into_inner();
        if skipped > 0 {
            warn!("phase `{}` aborted with {} of {} ranges skipped", phase, skipped, total);
            return Err(FluidError::PhaseAborted {
                phase,
                skipped,
                total,
            });
        }

        let report = PhaseReport {
            phase,
            ranges: total,
            items: n_items,
            elapsed: start.elapsed(),
        };
        debug!(
            "phase `{}`: {} items in {} ranges, {:.3} ms",
            phase,
            n_items,
            total,
            report.elapsed_ms()
        );
        Ok(report)
    }
}
