//! Named execution contexts
//!
//! Work runs on one of four dispatchers: Default (general worker pool),
//! Main (single serialized thread), Io (wider pool for blocking work)
//! or Unconfined (inline on the calling stack, no rescheduling). The
//! pools are plain worker threads draining a shared mpsc channel.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex, OnceLock};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A named execution context selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatcher {
    /// General-purpose worker pool.
    Default,
    /// Single serialized logical thread.
    Main,
    /// Pool tuned for blocking operations.
    Io,
    /// Runs inline on the calling thread, no queue.
    Unconfined,
}

impl Dispatcher {
    /// Schedules a job on this context. Unconfined runs it inline
    /// before returning.
    pub(crate) fn execute(self, job: Job) {
        match self {
            Dispatcher::Unconfined => job(),
            Dispatcher::Default => pools().general.submit(job),
            Dispatcher::Main => pools().main.submit(job),
            Dispatcher::Io => pools().io.submit(job),
        }
    }

    /// Runs `f` on this context and blocks the caller until it
    /// finishes, handing back its result. `None` means the job died
    /// before reporting (it panicked on the worker).
    pub(crate) fn run_sync<T, F>(self, f: F) -> Option<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        match self {
            Dispatcher::Unconfined => Some(f()),
            other => {
                let (tx, rx) = mpsc::channel();
                other.execute(Box::new(move || {
                    let _ = tx.send(f());
                }));
                rx.recv().ok()
            }
        }
    }

    pub fn is_unconfined(self) -> bool {
        self == Dispatcher::Unconfined
    }
}

/// Fixed pool of worker threads draining a shared channel.
struct WorkerPool {
    sender: Mutex<mpsc::Sender<Job>>,
}

impl WorkerPool {
    fn new(name: &str, workers: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        for worker_id in 0..workers {
            let receiver = Arc::clone(&receiver);
            thread::Builder::new()
                .name(format!("pledge-{}-{}", name, worker_id))
                .spawn(move || loop {
                    let job = {
                        let receiver = receiver.lock().unwrap();
                        receiver.recv()
                    };
                    match job {
                        Ok(job) => {
                            // A panicking job must not take the worker down.
                            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                                tracing::warn!("dispatcher job panicked; worker continues");
                            }
                        }
                        Err(_) => break,
                    }
                })
                .expect("failed to spawn dispatcher worker");
        }

        Self {
            sender: Mutex::new(sender),
        }
    }

    fn submit(&self, job: Job) {
        let _ = self.sender.lock().unwrap().send(job);
    }
}

struct Pools {
    general: WorkerPool,
    main: WorkerPool,
    io: WorkerPool,
}

static POOLS: OnceLock<Pools> = OnceLock::new();

fn pools() -> &'static Pools {
    POOLS.get_or_init(|| Pools {
        general: WorkerPool::new("default", num_cpus::get().max(2)),
        main: WorkerPool::new("main", 1),
        io: WorkerPool::new("io", (num_cpus::get() * 2).max(4)),
    })
}

/// Process-wide default dispatcher per promise stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDefaults {
    pub launch: Dispatcher,
    pub then: Dispatcher,
    pub catch: Dispatcher,
    pub progress: Dispatcher,
    pub close: Dispatcher,
}

impl Default for StageDefaults {
    fn default() -> Self {
        Self {
            launch: Dispatcher::Io,
            then: Dispatcher::Main,
            catch: Dispatcher::Main,
            progress: Dispatcher::Main,
            close: Dispatcher::Main,
        }
    }
}

static DEFAULTS: OnceLock<Mutex<StageDefaults>> = OnceLock::new();

fn defaults_cell() -> &'static Mutex<StageDefaults> {
    DEFAULTS.get_or_init(|| Mutex::new(StageDefaults::default()))
}

/// Current process-wide stage defaults.
pub fn stage_defaults() -> StageDefaults {
    *defaults_cell().lock().unwrap()
}

/// Replaces the process-wide stage defaults.
pub fn set_stage_defaults(defaults: StageDefaults) {
    *defaults_cell().lock().unwrap() = defaults;
}
