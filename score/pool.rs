// ========================================================================================
//
//                          THE WORKER POOL AND ITS REDUCER
//
// ========================================================================================
//
// ### Purpose ###
//
// A fixed-width fan-out/fan-in barrier. The caller's tasks are numbered and pushed
// into a bounded queue; each worker owns one long-lived piece of state (its file
// handles) built by `init_worker`; results come back over a second channel to a
// single reducer running on the calling thread.
//
// The reducer releases results in submission order through a `ReorderBuffer`, so
// the floating-point totals are bit-identical to `run_sequential` regardless of
// which worker finished first. The submitter needs a credit for every task it
// queues and the reducer hands one back per released result, so at most
// `window()` tasks are between submission and release. A slow early task
// therefore stalls the pool instead of letting later results pile up.
//
// A fatal error from any worker or from the reducer raises the cancel flag: the
// submitter stops feeding the queue, idle workers stop taking tasks, and the
// reducer keeps draining the result channel until every worker has exited. The
// first error is then returned. No thread is abandoned mid-task.

use crate::accumulate::ReorderBuffer;
use crate::error::ScoreError;
use crossbeam_channel::bounded;
use log::debug;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// The width of the pool and the depth of its task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_bound: usize,
}

impl PoolConfig {
    /// `2 × logical cores` workers, optionally capped.
    pub fn for_this_machine(max_concurrency: Option<usize>) -> Self {
        let mut workers = 2 * num_cpus::get().max(1);
        if let Some(limit) = max_concurrency.filter(|&l| l > 0) {
            workers = workers.min(limit);
        }
        Self {
            workers,
            queue_bound: 4 * workers,
        }
    }

    /// The most tasks that may be submitted but not yet reduced. Never narrower
    /// than the pool, so every worker can be busy.
    pub fn window(&self) -> usize {
        self.queue_bound.max(self.workers).max(1)
    }
}

enum Message<R> {
    Result(u64, R),
    Failed(ScoreError),
}

/// Runs every task on the pool and feeds each result, in task order, to `reduce`.
///
/// `init_worker` runs once per worker, on the worker's own thread. A worker that
/// fails to initialize cancels the run.
pub fn run_pool<T, W, R>(
    config: PoolConfig,
    tasks: Vec<T>,
    init_worker: impl Fn(usize) -> Result<W, ScoreError> + Sync,
    work: impl Fn(&mut W, T) -> Result<R, ScoreError> + Sync,
    mut reduce: impl FnMut(R) -> Result<(), ScoreError>,
) -> Result<(), ScoreError>
where
    T: Send,
    R: Send,
{
    if tasks.is_empty() {
        return Ok(());
    }
    let workers = config.workers.max(1).min(tasks.len());
    let queue_bound = config.queue_bound.max(1);
    let window = config.window();

    let (task_tx, task_rx) = bounded::<(u64, T)>(queue_bound);
    let (result_tx, result_rx) = bounded::<Message<R>>(queue_bound);
    let (credit_tx, credit_rx) = bounded::<()>(window);
    for _ in 0..window {
        // The channel has room for exactly this many credits.
        let _ = credit_tx.send(());
    }
    // Dropped on the first error, which wakes a submitter waiting for credit.
    let mut credit_tx = Some(credit_tx);
    let cancel = AtomicBool::new(false);

    thread::scope(|s| {
        for worker_id in 0..workers {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let cancel = &cancel;
            let init_worker = &init_worker;
            let work = &work;
            s.spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<(), ScoreError> {
                    let mut state = init_worker(worker_id)?;
                    for (sequence, task) in task_rx.iter() {
                        if cancel.load(Ordering::Relaxed) {
                            break;
                        }
                        let result = work(&mut state, task)?;
                        if result_tx.send(Message::Result(sequence, result)).is_err() {
                            break;
                        }
                    }
                    Ok(())
                }));
                let failure = match outcome {
                    Ok(Ok(())) => return,
                    Ok(Err(err)) => err,
                    Err(payload) => ScoreError::WorkerPanicked(panic_message(payload.as_ref())),
                };
                cancel.store(true, Ordering::Relaxed);
                debug!("Worker {worker_id} stopped: {failure}");
                let _ = result_tx.send(Message::Failed(failure));
            });
        }
        // Only the workers hold these now; the channels close when they exit.
        drop(task_rx);
        drop(result_tx);

        let cancel = &cancel;
        s.spawn(move || {
            for (sequence, task) in (0u64..).zip(tasks) {
                if credit_rx.recv().is_err() || cancel.load(Ordering::Relaxed) {
                    break;
                }
                if task_tx.send((sequence, task)).is_err() {
                    break;
                }
            }
        });

        let mut reorder = ReorderBuffer::new();
        let mut first_error: Option<ScoreError> = None;
        for message in result_rx.iter() {
            match message {
                Message::Result(sequence, result) => {
                    if first_error.is_some() {
                        continue;
                    }
                    let ready = reorder.push(sequence, result);
                    debug_assert!(reorder.pending() < window);
                    for item in ready {
                        if let Err(err) = reduce(item) {
                            cancel.store(true, Ordering::Relaxed);
                            credit_tx = None;
                            first_error = Some(err);
                            break;
                        }
                        if let Some(credits) = &credit_tx {
                            let _ = credits.send(());
                        }
                    }
                }
                Message::Failed(err) => {
                    cancel.store(true, Ordering::Relaxed);
                    credit_tx = None;
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    })
}

/// Runs every task on the calling thread with a single worker state. Results
/// reach `reduce` in the same order as with `run_pool`.
pub fn run_sequential<T, W, R>(
    tasks: Vec<T>,
    init_worker: impl Fn(usize) -> Result<W, ScoreError>,
    work: impl Fn(&mut W, T) -> Result<R, ScoreError>,
    mut reduce: impl FnMut(R) -> Result<(), ScoreError>,
) -> Result<(), ScoreError> {
    if tasks.is_empty() {
        return Ok(());
    }
    let mut state = init_worker(0)?;
    for task in tasks {
        reduce(work(&mut state, task)?)?;
    }
    Ok(())
}

/// Runs on the pool, or on the calling thread when the pool is one worker wide.
pub fn run_tasks<T, W, R>(
    config: PoolConfig,
    tasks: Vec<T>,
    init_worker: impl Fn(usize) -> Result<W, ScoreError> + Sync,
    work: impl Fn(&mut W, T) -> Result<R, ScoreError> + Sync,
    reduce: impl FnMut(R) -> Result<(), ScoreError>,
) -> Result<(), ScoreError>
where
    T: Send,
    R: Send,
{
    if config.workers <= 1 {
        run_sequential(tasks, init_worker, work, reduce)
    } else {
        run_pool(config, tasks, init_worker, work, reduce)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
