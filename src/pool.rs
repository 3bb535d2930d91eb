//! A bounded pool of worker threads, to run blocking work off the protocol engine.
//!
//! The pool keeps at least [`Config::min`] workers alive once started, spawns more on
//! backlog up to [`Config::max`], and retires workers above the minimum after they
//! stayed idle for [`Config::idle`].

use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::JoinHandle,
    time::Duration,
};

use flume::{Receiver, RecvTimeoutError, Sender};
use futures::{channel::oneshot, Future};
use thiserror::Error;

use crate::{Error, Result};

/// A boxed error returned by work submitted to the [`Pool`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The reason why a piece of work did not yield a value.
#[derive(Debug, Error)]
pub enum WorkError {
    /// The work returned an error.
    #[error("The work failed: {0}")]
    Failed(#[source] BoxError),

    /// The work panicked.
    #[error("The work panicked: {0}")]
    Panicked(String),

    /// The pool was stopped before the work could run.
    #[error("The pool was stopped before running the work")]
    Cancelled,
}

/// The configuration of a [`Pool`].
#[derive(Debug, Clone)]
pub struct Config {
    /// The minimum number of workers kept alive once started.
    pub min: usize,

    /// The maximum number of concurrent workers.
    pub max: usize,

    /// How long a worker above the minimum waits for work before retiring.
    pub idle: Duration,

    /// The name of the pool, used as a prefix for the worker threads names.
    pub name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min: 5,
            max: 20,
            idle: Duration::from_secs(60),
            name: "userauth".into(),
        }
    }
}

/// A snapshot of the pool bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    /// Workers currently alive, excluding the ones asked to stop.
    pub workers: usize,

    /// Workers currently running a piece of work.
    pub busy: usize,

    /// Workers currently waiting for work.
    pub idle: usize,

    /// Pieces of work waiting for a worker.
    pub queued: usize,
}

/// A queued piece of work, told whether to run or to report its cancellation.
type Work = Box<dyn FnOnce(bool) + Send>;

enum Job {
    Work(Work),
    Stop,
}

#[derive(Default)]
struct State {
    min: usize,
    max: usize,

    workers: usize,
    stopping: usize,
    busy: usize,
    queued: usize,

    spawned: usize,
    started: bool,
    closed: bool,

    handles: Vec<JoinHandle<()>>,
}

impl State {
    fn alive(&self) -> usize {
        self.workers - self.stopping
    }
}

struct Shared {
    name: String,
    idle: Duration,

    state: Mutex<State>,
    sender: Sender<Job>,
    receiver: Receiver<Job>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn work(&self) {
        tracing::trace!("Worker started in pool `{}`", self.name);

        loop {
            let job = self.receiver.recv_timeout(self.idle);
            let mut state = self.lock();

            match job {
                Ok(Job::Work(work)) => {
                    state.queued = state.queued.saturating_sub(1);
                    state.busy += 1;
                    drop(state);

                    self.call(work, true);

                    self.lock().busy -= 1;
                }
                Ok(Job::Stop) => {
                    state.workers -= 1;
                    state.stopping -= 1;

                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if state.queued == 0 && state.alive() > state.min {
                        state.workers -= 1;

                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    state.workers -= 1;

                    break;
                }
            }
        }

        let stranded = self.stranded(&mut self.lock());
        self.cancel(stranded);

        tracing::trace!("Worker exited in pool `{}`", self.name);
    }

    fn call(&self, work: Work, run: bool) {
        if std::panic::catch_unwind(AssertUnwindSafe(move || work(run))).is_err() {
            tracing::error!("A result callback panicked in pool `{}`", self.name);
        }
    }

    /// Take the queued jobs out of a closed pool with no worker left to run them.
    fn stranded(&self, state: &mut State) -> Vec<Job> {
        if !state.closed || state.workers > 0 {
            return Vec::new();
        }

        state.queued = 0;
        state.stopping = 0;

        self.receiver.try_iter().collect()
    }

    /// Report the cancellation of the stranded work, without holding the lock.
    fn cancel(&self, jobs: Vec<Job>) {
        for job in jobs {
            if let Job::Work(work) = job {
                self.call(work, false);
            }
        }
    }
}

/// A bounded pool of worker threads.
pub struct Pool {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.shared.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Pool {
    /// Create a [`Pool`] from the `config`, no worker is spawned until [`Self::start`].
    pub fn new(config: Config) -> Result<Self> {
        let Config {
            min,
            max,
            idle,
            name,
        } = config;

        if min > max {
            return Err(Error::PoolSize { min, max });
        }

        let (sender, receiver) = flume::unbounded();

        Ok(Self {
            shared: Arc::new(Shared {
                name,
                idle,
                state: Mutex::new(State {
                    min,
                    max,
                    ..Default::default()
                }),
                sender,
                receiver,
            }),
        })
    }

    fn spawn(&self, state: &mut State) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name(format!("{}-{}", self.shared.name, state.spawned))
            .spawn(move || shared.work())?;

        state.spawned += 1;
        state.workers += 1;

        state.handles.retain(|handle| !handle.is_finished());
        state.handles.push(handle);

        Ok(())
    }

    /// Spawn workers up to the minimum, and more to absorb the backlog.
    fn grow(&self, state: &mut State) -> Result<()> {
        let needed = state.min.max(state.queued + state.busy).min(state.max);

        while state.alive() < needed {
            self.spawn(state)?;
        }

        Ok(())
    }

    /// Ask workers above the maximum to exit once done with their current work.
    fn shrink(&self, state: &mut State) {
        while state.alive() > state.max {
            state.stopping += 1;

            // The receiver lives in `self`, sending cannot fail.
            let _ = self.shared.sender.send(Job::Stop);
        }
    }

    /// Start the pool, spawning the minimum number of workers.
    pub fn start(&self) -> Result<()> {
        let mut state = self.shared.lock();

        if state.closed {
            return Err(Error::Disconnected);
        }

        state.started = true;
        tracing::debug!(
            "Starting pool `{}` with {}..={} workers",
            self.shared.name,
            state.min,
            state.max
        );

        self.grow(&mut state)
    }

    /// Change the bounds of the pool.
    ///
    /// New workers are spawned immediately when below the new minimum, and workers
    /// above the new maximum exit after their current work, which is never interrupted.
    pub fn adjust(&self, min: usize, max: usize) -> Result<()> {
        if min > max {
            return Err(Error::PoolSize { min, max });
        }

        let mut state = self.shared.lock();
        state.min = min;
        state.max = max;

        tracing::debug!(
            "Adjusting pool `{}` to {min}..={max} workers",
            self.shared.name
        );

        if state.started && !state.closed {
            self.grow(&mut state)?;
            self.shrink(&mut state);
        }

        Ok(())
    }

    /// Queue `work`, whose outcome is handed to `on_result` **on the worker thread**.
    ///
    /// Work submitted before [`Self::start`] is kept until workers are spawned,
    /// and work submitted after [`Self::stop`] is silently dropped.
    /// Work left without any worker to run it when the pool stops gets [`WorkError::Cancelled`].
    pub fn submit<T, F, C>(&self, work: F, on_result: C)
    where
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
        C: FnOnce(Result<T, WorkError>) + Send + 'static,
    {
        self.enqueue(Box::new(move |run| {
            let result = if !run {
                Err(WorkError::Cancelled)
            } else {
                match std::panic::catch_unwind(AssertUnwindSafe(work)) {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(WorkError::Failed(err)),
                    Err(panic) => Err(WorkError::Panicked(panic_message(panic))),
                }
            };

            on_result(result);
        }));
    }

    /// Queue `work` without caring about its outcome, failures are only logged.
    pub fn execute<F>(&self, work: F)
    where
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        self.submit(work, |result| {
            if let Err(err) = result {
                tracing::error!("Detached work failed: {err}");
            }
        });
    }

    /// Run `work` on the pool, and await its outcome from the calling task.
    pub fn run<T, F>(&self, work: F) -> impl Future<Output = Result<T, WorkError>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        self.submit(work, move |result| {
            // The awaiting side may have gone away, the result is then useless.
            let _ = sender.send(result);
        });

        async move { receiver.await.unwrap_or(Err(WorkError::Cancelled)) }
    }

    fn enqueue(&self, work: Work) {
        let mut state = self.shared.lock();

        if state.closed {
            tracing::trace!(
                "Dropping work submitted to the stopped pool `{}`",
                self.shared.name
            );

            return;
        }

        state.queued += 1;

        // The receiver lives in `self`, sending cannot fail.
        let _ = self.shared.sender.send(Job::Work(work));

        if state.started {
            if let Err(err) = self.grow(&mut state) {
                tracing::warn!(
                    "Unable to spawn a worker in pool `{}`: {err}",
                    self.shared.name
                );
            }
        }
    }

    /// A snapshot of the pool bookkeeping.
    pub fn stats(&self) -> Stats {
        let state = self.shared.lock();

        Stats {
            workers: state.alive(),
            busy: state.busy,
            idle: state.alive().saturating_sub(state.busy),
            queued: state.queued,
        }
    }

    fn close(&self) -> Vec<JoinHandle<()>> {
        let mut state = self.shared.lock();

        if !state.closed {
            tracing::debug!("Stopping pool `{}`", self.shared.name);
        }

        state.closed = true;
        state.started = false;
        state.max = 0;
        state.min = 0;
        self.shrink(&mut state);

        let stranded = self.shared.stranded(&mut state);
        let handles = std::mem::take(&mut state.handles);
        drop(state);

        self.shared.cancel(stranded);

        handles
    }

    /// Close the pool, and wait for every worker to finish its current work.
    ///
    /// Work already queued is still run before the workers exit, unless no worker
    /// is left to run it, as when the pool was never started or adjusted to zero workers.
    pub fn stop(&self) {
        for handle in self.close() {
            if handle.join().is_err() {
                tracing::error!("A worker of pool `{}` panicked", self.shared.name);
            }
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Joining here could deadlock when dropped from a worker.
        self.close();
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(message) => *message,
        Err(panic) => panic
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .unwrap_or_else(|| "unknown panic payload".into()),
    }
}
