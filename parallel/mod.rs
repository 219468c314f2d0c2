// parallel/mod.rs

//! # Parallel Block Processor
//!
//! A fixed pool of long-lived worker threads, each owning the blocks assigned to it.
//! Block `i` always goes to worker `i % n_workers`, so a worker loads each of its blocks
//! once and keeps it in a private cache for its whole lifetime. The coordinator talks to
//! workers only through channels: it broadcasts immutable parameters (`Arc<Params>`)
//! with the list of blocks to run, and each worker answers with one immutable record
//! per block.
//!
//! Dispatches are synchronous. Per-block failures (task errors, panics, timeouts) are
//! returned next to the successful results instead of aborting sibling blocks, and the
//! results always come back sorted by block id so that any reduction over them is
//! independent of worker completion order.
//!
//! Workers are threads of this process, not child processes. Panics are caught per
//! block and a hung worker is abandoned after the timeout, but a stack overflow or an
//! abort inside a task takes the whole fit down with it. Blocks are shared with workers
//! as `Arc`s instead of being copied into separate address spaces.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Work executed for every block of a dispatch.
///
/// `load` runs at most once per block and worker (and again only after a failed load or
/// a panic); `process` runs once per dispatch with that dispatch's parameters.
pub trait BlockTask: Send + Sync + 'static {
    type Descriptor: Send + Sync + 'static;
    type Loaded: 'static;
    type Params: Send + Sync + 'static;
    type Output: Send + 'static;
    type Error: Send + 'static;

    fn load(&self, descriptor: &Self::Descriptor) -> Result<Self::Loaded, Self::Error>;

    fn process(
        &self,
        loaded: &mut Self::Loaded,
        params: &Self::Params,
    ) -> Result<Self::Output, Self::Error>;
}

/// Why a block produced no output.
#[derive(Error, Debug)]
pub enum BlockFailure<E> {
    #[error("{0}")]
    Task(E),

    #[error("worker panicked: {0}")]
    Panicked(String),

    #[error("no result within {0:?}")]
    TimedOut(Duration),

    #[error("worker thread is no longer running")]
    Disconnected,
}

impl<E> BlockFailure<E> {
    /// Whether the block's worker will never answer for it again.
    pub fn is_permanent(&self) -> bool {
        matches!(self, BlockFailure::TimedOut(_) | BlockFailure::Disconnected)
    }
}

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("failed to spawn block worker {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("block {block} does not exist (the processor holds {n_blocks} blocks)")]
    UnknownBlock { block: usize, n_blocks: usize },
}

#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    /// Upper bound on the number of worker threads.
    pub max_workers: usize,
    /// Wall-clock limit for one dispatch; blocks still pending afterwards are failed.
    pub timeout: Option<Duration>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get(),
            timeout: None,
        }
    }
}

/// Outcome of one block within a dispatch.
#[derive(Debug)]
pub struct BlockResult<O, E> {
    pub block: usize,
    pub outcome: Result<O, BlockFailure<E>>,
}

struct RunBlocks<P> {
    epoch: u64,
    params: Arc<P>,
    blocks: Vec<usize>,
}

struct Reply<O, E> {
    epoch: u64,
    block: usize,
    outcome: Result<O, BlockFailure<E>>,
}

struct Worker<P> {
    commands: Option<Sender<RunBlocks<P>>>,
    handle: Option<JoinHandle<()>>,
    /// Set once the worker missed a deadline; it is never sent work again.
    stalled: bool,
}

pub struct BlockProcessor<T: BlockTask> {
    workers: Vec<Worker<T::Params>>,
    replies: Receiver<Reply<T::Output, T::Error>>,
    n_blocks: usize,
    epoch: u64,
    timeout: Option<Duration>,
}

impl<T: BlockTask> BlockProcessor<T> {
    /// Spawns `min(max_workers, descriptors.len())` workers (at least one).
    pub fn new(
        task: T,
        descriptors: Vec<T::Descriptor>,
        config: &ProcessorConfig,
    ) -> Result<Self, ProcessorError> {
        let n_blocks = descriptors.len();
        let n_workers = config.max_workers.min(n_blocks).max(1);
        let task = Arc::new(task);
        let descriptors = Arc::new(descriptors);
        let (reply_tx, replies) = unbounded();

        let mut workers = Vec::with_capacity(n_workers);
        for index in 0..n_workers {
            let (command_tx, command_rx) = unbounded();
            let task = Arc::clone(&task);
            let descriptors = Arc::clone(&descriptors);
            let reply_tx = reply_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("block-worker-{index}"))
                .spawn(move || worker_loop(task, descriptors, command_rx, reply_tx))
                .map_err(|source| ProcessorError::Spawn { index, source })?;
            workers.push(Worker {
                commands: Some(command_tx),
                handle: Some(handle),
                stalled: false,
            });
        }
        log::info!(
            "Started {} block worker(s) for {} block(s)",
            n_workers,
            n_blocks
        );

        Ok(Self {
            workers,
            replies,
            n_blocks,
            epoch: 0,
            timeout: config.timeout,
        })
    }

    pub fn n_blocks(&self) -> usize {
        self.n_blocks
    }

    pub fn n_workers(&self) -> usize {
        self.workers.len()
    }

    /// Runs every block with `params`.
    pub fn dispatch(
        &mut self,
        params: T::Params,
    ) -> Result<Vec<BlockResult<T::Output, T::Error>>, ProcessorError> {
        let all: Vec<usize> = (0..self.n_blocks).collect();
        self.dispatch_selected(params, &all)
    }

    /// Runs the given blocks with `params` and waits for all of them. Results are sorted
    /// by block id; repeated ids are run once.
    pub fn dispatch_selected(
        &mut self,
        params: T::Params,
        blocks: &[usize],
    ) -> Result<Vec<BlockResult<T::Output, T::Error>>, ProcessorError> {
        if let Some(&block) = blocks.iter().find(|&&block| block >= self.n_blocks) {
            return Err(ProcessorError::UnknownBlock {
                block,
                n_blocks: self.n_blocks,
            });
        }
        let started = Instant::now();
        self.epoch += 1;
        let epoch = self.epoch;
        let params = Arc::new(params);
        let n_workers = self.workers.len();

        let mut assignments: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut seen = HashSet::new();
        for &block in blocks {
            if seen.insert(block) {
                assignments.entry(block % n_workers).or_default().push(block);
            }
        }

        let mut outcomes: BTreeMap<usize, Result<T::Output, BlockFailure<T::Error>>> =
            BTreeMap::new();
        let mut pending: HashSet<usize> = HashSet::new();
        for (worker_index, assigned) in assignments {
            let worker = &mut self.workers[worker_index];
            if worker.stalled {
                for block in assigned {
                    outcomes.insert(block, Err(BlockFailure::TimedOut(Duration::ZERO)));
                }
                continue;
            }
            let message = RunBlocks {
                epoch,
                params: Arc::clone(&params),
                blocks: assigned.clone(),
            };
            let sent = worker
                .commands
                .as_ref()
                .is_some_and(|commands| commands.send(message).is_ok());
            if sent {
                pending.extend(assigned);
            } else {
                for block in assigned {
                    outcomes.insert(block, Err(BlockFailure::Disconnected));
                }
            }
        }

        let deadline = self.timeout.map(|timeout| started + timeout);
        while !pending.is_empty() {
            let received = match deadline {
                Some(deadline) => self.replies.recv_deadline(deadline),
                None => self
                    .replies
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(reply) => {
                    if reply.epoch == epoch && pending.remove(&reply.block) {
                        outcomes.insert(reply.block, reply.outcome);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    let limit = self.timeout.unwrap_or_default();
                    for block in pending.drain() {
                        let worker = &mut self.workers[block % n_workers];
                        if !worker.stalled {
                            log::warn!(
                                "Block worker {} missed the {:?} deadline and will receive no further work",
                                block % n_workers,
                                limit
                            );
                        }
                        worker.stalled = true;
                        outcomes.insert(block, Err(BlockFailure::TimedOut(limit)));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    for block in pending.drain() {
                        outcomes.insert(block, Err(BlockFailure::Disconnected));
                    }
                }
            }
        }

        log::debug!(
            "Dispatch {} over {} block(s) finished in {:.2?}",
            epoch,
            outcomes.len(),
            started.elapsed()
        );
        Ok(outcomes
            .into_iter()
            .map(|(block, outcome)| BlockResult { block, outcome })
            .collect())
    }
}

impl<T: BlockTask> Drop for BlockProcessor<T> {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            worker.commands.take();
        }
        for worker in &mut self.workers {
            // A stalled worker may never return; leave it detached.
            if worker.stalled {
                continue;
            }
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

fn worker_loop<T: BlockTask>(
    task: Arc<T>,
    descriptors: Arc<Vec<T::Descriptor>>,
    commands: Receiver<RunBlocks<T::Params>>,
    replies: Sender<Reply<T::Output, T::Error>>,
) {
    let mut cache: HashMap<usize, T::Loaded> = HashMap::new();
    while let Ok(RunBlocks {
        epoch,
        params,
        blocks,
    }) = commands.recv()
    {
        for block in blocks {
            let result = catch_unwind(AssertUnwindSafe(|| {
                run_block(task.as_ref(), &descriptors[block], block, &mut cache, &params)
            }));
            let outcome = match result {
                Ok(outcome) => outcome.map_err(BlockFailure::Task),
                Err(payload) => {
                    cache.remove(&block);
                    Err(BlockFailure::Panicked(panic_message(payload.as_ref())))
                }
            };
            if replies
                .send(Reply {
                    epoch,
                    block,
                    outcome,
                })
                .is_err()
            {
                return;
            }
        }
    }
}

fn run_block<T: BlockTask>(
    task: &T,
    descriptor: &T::Descriptor,
    block: usize,
    cache: &mut HashMap<usize, T::Loaded>,
    params: &T::Params,
) -> Result<T::Output, T::Error> {
    let loaded = match cache.entry(block) {
        std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
        std::collections::hash_map::Entry::Vacant(entry) => entry.insert(task.load(descriptor)?),
    };
    task.process(loaded, params)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
