//! Exponential backoff, to govern reconnection attempts after a connection loss.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures::{
    future::{AbortHandle, Abortable},
    Future,
};
use rand::Rng;
use thiserror::Error;

/// The reason why a [`Reconnect`] gave up.
#[derive(Debug, Error)]
pub enum Error<E> {
    /// The maximum number of retries has been exceeded.
    #[error("Abandoning reconnection after {retries} retries: {source}")]
    Abandoned {
        /// The number of retries performed.
        retries: u32,

        /// The error of the last attempt.
        #[source]
        source: E,
    },

    /// Retrying was halted from a [`Stopper`].
    #[error("Reconnection was stopped")]
    Stopped,
}

/// The configuration of a [`Backoff`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    /// The delay before the first retry.
    pub initial_delay: Duration,

    /// The upper bound of the delay.
    pub max_delay: Duration,

    /// The multiplier applied to the delay on each failure.
    pub factor: f64,

    /// The proportion of the delay by which it is randomly perturbed.
    pub jitter: f64,

    /// The maximum number of retries, unbounded if `None`.
    pub max_retries: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
            factor: std::f64::consts::E,
            jitter: 0.11962656472,
            max_retries: None,
        }
    }
}

/// The delay bookkeeping between retries.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: Config,

    delay: Duration,
    retries: u32,
    trying: bool,
}

impl Backoff {
    /// Create a [`Backoff`] from the `config`.
    pub fn new(config: Config) -> Self {
        Self {
            delay: config.initial_delay,
            retries: 0,
            trying: true,
            config,
        }
    }

    /// The current, unperturbed, delay.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// The number of retries since the last [`Self::reset`].
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Whether retrying has been halted with [`Self::stop`].
    pub fn is_stopped(&self) -> bool {
        !self.trying
    }

    /// Register a failure, and compute the delay to wait before the next attempt.
    ///
    /// Returns `None` when stopped or when the retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.trying {
            return None;
        }

        self.retries += 1;
        if let Some(max) = self.config.max_retries {
            if self.retries > max {
                tracing::info!("Abandoning reconnection after {max} retries");

                return None;
            }
        }

        let grown = self.delay.as_secs_f64() * self.config.factor;
        self.delay = Duration::try_from_secs_f64(grown)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay);

        Some(self.jittered())
    }

    fn jittered(&self) -> Duration {
        let jitter = self.config.jitter.abs();
        if jitter == 0.0 {
            return self.delay;
        }

        let secs = self.delay.as_secs_f64();
        let low = (secs * (1.0 - jitter)).max(0.0);
        let high = secs * (1.0 + jitter);

        Duration::try_from_secs_f64(rand::thread_rng().gen_range(low..=high))
            .unwrap_or(self.delay)
            .min(self.config.max_delay)
    }

    /// Reset the delay and the retries after a successful connection, and resume trying.
    pub fn reset(&mut self) {
        self.delay = self.config.initial_delay;
        self.retries = 0;
        self.trying = true;
    }

    /// Halt retrying until the next [`Self::reset`].
    pub fn stop(&mut self) {
        self.trying = false;
    }
}

#[derive(Debug, Default)]
struct Halt {
    stopped: bool,
    pending: Option<AbortHandle>,
}

/// A handle to halt a [`Reconnect`] from anywhere, cancelling any pending attempt.
#[derive(Debug, Clone, Default)]
pub struct Stopper {
    inner: Arc<Mutex<Halt>>,
}

impl Stopper {
    /// Stop retrying, aborting the wait for the next attempt if any.
    pub fn stop(&self) {
        let mut halt = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        halt.stopped = true;

        if let Some(handle) = halt.pending.take() {
            handle.abort();
        }
    }

    /// Whether [`Self::stop`] has been called since the last reset.
    pub fn is_stopped(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stopped
    }

    fn arm(&self, handle: AbortHandle) -> bool {
        let mut halt = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if halt.stopped {
            false
        } else {
            halt.pending = Some(handle);
            true
        }
    }

    fn clear(&self) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Halt::default();
    }
}

/// A reconnection driver, retrying a connection with a [`Backoff`] between attempts.
#[derive(Debug)]
pub struct Reconnect {
    backoff: Backoff,
    stopper: Stopper,
}

impl Reconnect {
    /// Create a [`Reconnect`] driver from the `config`.
    pub fn new(config: Config) -> Self {
        Self {
            backoff: Backoff::new(config),
            stopper: Default::default(),
        }
    }

    /// The underlying [`Backoff`].
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// A [`Stopper`] to halt this driver.
    pub fn stopper(&self) -> Stopper {
        self.stopper.clone()
    }

    /// Reset the backoff and make a stopped driver usable again.
    pub fn reset(&mut self) {
        self.backoff.reset();
        self.stopper.clear();
    }

    /// Attempt `connect` until it succeeds, waiting with backoff between failures.
    pub async fn connect<T, E, F, Fut>(&mut self, mut connect: F) -> Result<T, Error<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        loop {
            if self.stopper.is_stopped() {
                self.backoff.stop();

                return Err(Error::Stopped);
            }

            let err = match connect().await {
                Ok(value) => {
                    tracing::debug!(
                        "Connected after {} retries, resetting the backoff",
                        self.backoff.retries()
                    );
                    self.backoff.reset();

                    return Ok(value);
                }
                Err(err) => err,
            };

            let Some(delay) = self.backoff.next_delay() else {
                if self.backoff.is_stopped() {
                    return Err(Error::Stopped);
                }

                return Err(Error::Abandoned {
                    retries: self.backoff.retries() - 1,
                    source: err,
                });
            };

            tracing::warn!("Connection attempt failed: {err}, retrying in {delay:?}");

            let (handle, registration) = AbortHandle::new_pair();
            if !self.stopper.arm(handle) {
                continue;
            }

            let sleep = futures_time::task::sleep(delay.into());
            if Abortable::new(sleep, registration).await.is_err() {
                tracing::debug!("Pending reconnection was aborted");
            }
        }
    }
}
