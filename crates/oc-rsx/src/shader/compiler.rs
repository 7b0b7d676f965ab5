//! Asynchronous shader compiler
//!
//! A pool of worker threads turns generated source into backend bytecode.
//! Workers never touch graphics objects: finished units come back through a
//! result queue and their completion handlers run on whichever thread calls
//! [`AsyncCompiler::poll`], which must be the thread owning the graphics
//! context.

use super::types::{CompileFlags, ShaderStage};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// How long `wait_for_finish` blocks before re-checking the pending count
const FINISH_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One shader to compile
#[derive(Debug, Clone)]
pub struct CompileUnit {
    pub stage: ShaderStage,
    /// Human readable identity for logs and dumps
    pub label: String,
    pub source: String,
    pub entry_point: &'static str,
    /// Backend target profile, e.g. `vs_5_0`
    pub target: String,
    pub flags: CompileFlags,
}

/// Source -> bytecode step of a backend. Runs on worker threads.
pub trait ShaderCompiler: Send + Sync {
    /// Compile a unit; on failure return the compiler's diagnostics
    fn compile(&self, unit: &CompileUnit) -> Result<Vec<u8>, String>;
}

/// What a worker hands back for one unit
#[derive(Debug)]
pub struct CompileOutput {
    pub unit: CompileUnit,
    pub result: Result<Vec<u8>, String>,
}

/// Completion handler, run on the polling thread with the backend context
pub type Completion<C> = Box<dyn FnOnce(&C, CompileOutput) + Send>;

struct Job<C> {
    unit: CompileUnit,
    on_complete: Completion<C>,
}

enum Message<C> {
    Compile(Job<C>),
    Shutdown,
}

struct Finished<C> {
    output: CompileOutput,
    on_complete: Completion<C>,
}

/// Background compiler pool shared by all caches of one backend
pub struct AsyncCompiler<C> {
    compiler: Arc<dyn ShaderCompiler>,
    jobs: Sender<Message<C>>,
    results: Receiver<Finished<C>>,
    /// Kept for compiling inline if the pool is gone
    results_tx: Sender<Finished<C>>,
    /// Submitted units whose completion hasn't run yet
    pending: AtomicUsize,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl<C: 'static> AsyncCompiler<C> {
    /// Start a pool with `threads` workers (0 = pick from host CPU count)
    pub fn new(compiler: Arc<dyn ShaderCompiler>, threads: usize) -> std::io::Result<Self> {
        let worker_count = if threads == 0 {
            default_worker_count()
        } else {
            threads
        };

        let (jobs, job_rx) = channel::unbounded::<Message<C>>();
        let (results_tx, results) = channel::unbounded::<Finished<C>>();

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let compiler = Arc::clone(&compiler);
            let job_rx = job_rx.clone();
            let results_tx = results_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("oc-shader-compiler-{}", index))
                .spawn(move || worker_loop(compiler, job_rx, results_tx))?;
            workers.push(handle);
        }

        debug!("Shader compiler pool started with {} workers", worker_count);

        Ok(Self {
            compiler,
            jobs,
            results,
            results_tx,
            pending: AtomicUsize::new(0),
            workers: Mutex::new(workers),
            worker_count,
        })
    }

    /// Queue a unit; `on_complete` runs during a later `poll`
    pub fn submit(&self, unit: CompileUnit, on_complete: Completion<C>) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        trace!("Queued {} for compilation", unit.label);

        let message = Message::Compile(Job { unit, on_complete });
        if let Err(channel::SendError(message)) = self.jobs.send(message) {
            // All workers are gone; compile here so the unit still completes
            if let Message::Compile(job) = message {
                warn!("Shader compiler pool unavailable, compiling {} inline", job.unit.label);
                let finished = run_job(self.compiler.as_ref(), job);
                let _ = self.results_tx.send(finished);
            }
        }
    }

    /// Run completion handlers for every finished unit. Returns how many ran.
    pub fn poll(&self, ctx: &C) -> usize {
        let mut count = 0;
        while let Ok(finished) = self.results.try_recv() {
            self.complete(ctx, finished);
            count += 1;
        }
        count
    }

    /// Block until every submitted unit has completed
    pub fn wait_for_finish(&self, ctx: &C) {
        while self.pending() > 0 {
            match self.results.recv_timeout(FINISH_POLL_INTERVAL) {
                Ok(finished) => self.complete(ctx, finished),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn complete(&self, ctx: &C, finished: Finished<C>) {
        // Counted down even if the handler unwinds
        let _done = PendingGuard(&self.pending);
        (finished.on_complete)(ctx, finished.output);
    }

    /// Units submitted but not yet completed
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }
}

impl<C> Drop for AsyncCompiler<C> {
    fn drop(&mut self) {
        let mut workers = self.workers.lock();
        for _ in 0..workers.len() {
            let _ = self.jobs.send(Message::Shutdown);
        }
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                error!("Shader compiler worker panicked during shutdown");
            }
        }
    }
}

struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Host CPU count minus the thread that renders, at least one
pub fn default_worker_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

fn worker_loop<C>(
    compiler: Arc<dyn ShaderCompiler>,
    jobs: Receiver<Message<C>>,
    results: Sender<Finished<C>>,
) {
    while let Ok(Message::Compile(job)) = jobs.recv() {
        let finished = run_job(compiler.as_ref(), job);
        if results.send(finished).is_err() {
            break;
        }
    }
}

fn run_job<C>(compiler: &dyn ShaderCompiler, job: Job<C>) -> Finished<C> {
    let result = panic::catch_unwind(AssertUnwindSafe(|| compiler.compile(&job.unit)))
        .unwrap_or_else(|_| Err("shader compiler panicked".to_string()));
    Finished {
        output: CompileOutput { unit: job.unit, result },
        on_complete: job.on_complete,
    }
}
