//! Bounded-concurrency fan-out of one operation over many miners.
//!
//! [`Launcher`] runs an async operation once per target with at most
//! `batch_size` targets in flight, a per-attempt deadline and a retry policy.
//! Every target yields exactly one [`LaunchResult`]: a failing target never
//! aborts the batch, and the result order is completion order.
//!
//! Cancelling the launcher's token stops launching new targets, aborts the
//! in-flight ones and returns the results collected so far.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::address::Address;
use crate::config::LaunchOptions;
use crate::error::{ErrorKind, MinerError};

/// Details of a target whose attempts were exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LaunchFailure {
    /// One-line description of the last failure.
    pub brief: String,
    /// The full cause chain of the last failure.
    pub traceback: String,
    /// Classification of the last failure when it came from this crate.
    pub kind: Option<ErrorKind>,
    /// Number of attempts made.
    pub attempts: u32,
}

impl LaunchFailure {
    fn from_error(err: &anyhow::Error, attempts: u32) -> Self {
        Self {
            brief: err.to_string(),
            traceback: format!("{err:?}"),
            kind: miner_kind(err),
            attempts,
        }
    }
}

impl fmt::Display for LaunchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (after {} attempt(s))", self.brief, self.attempts)
    }
}

/// Final state of one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome<T> {
    Success { data: T },
    Error(LaunchFailure),
    Timeout(LaunchFailure),
}

/// Per-target outcome of a batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LaunchResult<T> {
    #[serde(flatten)]
    pub address: Address,
    #[serde(flatten)]
    pub outcome: Outcome<T>,
}

impl<T> LaunchResult<T> {
    pub fn host(&self) -> &str {
        &self.address.host
    }

    pub fn port(&self) -> u16 {
        self.address.port
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.outcome, Outcome::Timeout(_))
    }

    /// The operation's value, for successful targets.
    pub fn data(&self) -> Option<&T> {
        match &self.outcome {
            Outcome::Success { data } => Some(data),
            _ => None,
        }
    }

    /// The failure details, for failed or timed out targets.
    pub fn failure(&self) -> Option<&LaunchFailure> {
        match &self.outcome {
            Outcome::Success { .. } => None,
            Outcome::Error(failure) | Outcome::Timeout(failure) => Some(failure),
        }
    }
}

/// All results of one batch run.
#[derive(Debug, Clone)]
pub struct LaunchReport<T> {
    /// One entry per finished target, in completion order.
    pub results: Vec<LaunchResult<T>>,
    /// Whether the run was cut short by its cancellation token.
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl<T> LaunchReport<T> {
    pub fn successes(&self) -> impl Iterator<Item = &LaunchResult<T>> {
        self.results.iter().filter(|r| r.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &LaunchResult<T>> {
        self.results.iter().filter(|r| !r.is_success())
    }

    /// True when the run was not cancelled and every target succeeded.
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.results.iter().all(LaunchResult::is_success)
    }

    /// Groups results by target; duplicated targets map to several entries.
    pub fn by_address(&self) -> HashMap<Address, Vec<&LaunchResult<T>>> {
        let mut grouped: HashMap<Address, Vec<&LaunchResult<T>>> = HashMap::new();
        for result in &self.results {
            grouped
                .entry(result.address.clone())
                .or_default()
                .push(result);
        }
        grouped
    }
}

type ProgressFn<T> = Arc<dyn Fn(&LaunchResult<T>) + Send + Sync>;

/// Runs one operation over many targets.
pub struct Launcher<T> {
    options: LaunchOptions,
    cancel: CancellationToken,
    progress: Option<ProgressFn<T>>,
}

impl<T: Send + 'static> Launcher<T> {
    pub fn new(options: LaunchOptions) -> Self {
        Self {
            options,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Uses `token` to cancel the run from outside.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Calls `f` once per finished target, as soon as it finishes.
    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(&LaunchResult<T>) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(f));
        self
    }

    pub fn options(&self) -> &LaunchOptions {
        &self.options
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs `operation` once per address and collects one result per target.
    pub async fn run<I, F, Fut>(&self, addresses: I, operation: F) -> LaunchReport<T>
    where
        I: IntoIterator<Item = Address>,
        F: Fn(Address) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let started = Instant::now();
        let operation = Arc::new(operation);
        let limit = match self.options.batch_size {
            0 => usize::MAX,
            n => n,
        };

        let mut pending = addresses.into_iter();
        let mut in_flight: HashMap<Id, InFlight> = HashMap::new();
        let mut tasks = JoinSet::new();
        let mut results = Vec::new();
        let mut cancelled = false;

        loop {
            while tasks.len() < limit && !self.cancel.is_cancelled() {
                let Some(address) = pending.next() else {
                    break;
                };
                let operation = Arc::clone(&operation);
                let options = self.options.clone();
                let target = address.clone();
                let attempts = Arc::new(AtomicU32::new(0));
                let counter = Arc::clone(&attempts);
                let handle = tasks.spawn(async move {
                    run_target(target, operation.as_ref(), &options, &counter).await
                });
                in_flight.insert(handle.id(), InFlight { address, attempts });
            }

            if tasks.is_empty() {
                cancelled = self.cancel.is_cancelled();
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    cancelled = true;
                    tasks.abort_all();
                    while let Some(joined) = tasks.join_next_with_id().await {
                        if let Some(result) = settle(joined, &mut in_flight) {
                            self.report(&result);
                            results.push(result);
                        }
                    }
                    break;
                }
                joined = tasks.join_next_with_id() => {
                    let Some(joined) = joined else {
                        break;
                    };
                    if let Some(result) = settle(joined, &mut in_flight) {
                        self.report(&result);
                        results.push(result);
                    }
                }
            }
        }

        let elapsed = started.elapsed();
        let failed = results.iter().filter(|r| !r.is_success()).count();
        info!(
            "launch finished: {} result(s), {} failed, cancelled={}, {}ms",
            results.len(),
            failed,
            cancelled,
            elapsed.as_millis()
        );

        LaunchReport {
            results,
            cancelled,
            elapsed,
        }
    }

    /// Like [`run`](Self::run) over resolver output.
    ///
    /// Addresses are resolved before anything is launched; the first
    /// resolution error fails the whole call.
    pub async fn run_resolved<I, F, Fut>(
        &self,
        addresses: I,
        operation: F,
    ) -> Result<LaunchReport<T>, MinerError>
    where
        I: IntoIterator<Item = Result<Address, MinerError>>,
        F: Fn(Address) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let addresses = addresses.into_iter().collect::<Result<Vec<_>, _>>()?;
        Ok(self.run(addresses, operation).await)
    }

    fn report(&self, result: &LaunchResult<T>) {
        match result.failure() {
            None => debug!("{} done", result.address),
            Some(failure) => debug!("{} failed: {}", result.address, failure),
        }
        if let Some(progress) = self.progress.as_ref() {
            progress(result);
        }
    }
}

/// Runs `operation` over `addresses` with `options` and returns the results
/// in completion order.
pub async fn launch<T, I, F, Fut>(
    addresses: I,
    operation: F,
    options: &LaunchOptions,
) -> Vec<LaunchResult<T>>
where
    T: Send + 'static,
    I: IntoIterator<Item = Address>,
    F: Fn(Address) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    Launcher::new(options.clone())
        .run(addresses, operation)
        .await
        .results
}

/// First crate error found in the cause chain.
fn miner_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<MinerError>())
        .map(MinerError::kind)
}

/// A spawned target and the number of attempts it has started.
struct InFlight {
    address: Address,
    attempts: Arc<AtomicU32>,
}

async fn run_target<T, F, Fut>(
    address: Address,
    operation: &F,
    options: &LaunchOptions,
    attempts: &AtomicU32,
) -> LaunchResult<T>
where
    F: Fn(Address) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = options.max_attempts();
    let mut attempt = 0;
    loop {
        attempt += 1;
        attempts.store(attempt, Ordering::SeqCst);
        let started = Instant::now();
        let err = match tokio::time::timeout(options.timeout, operation(address.clone())).await {
            Ok(Ok(data)) => {
                return LaunchResult {
                    address,
                    outcome: Outcome::Success { data },
                };
            }
            Ok(Err(err)) => err,
            Err(_) => anyhow::Error::new(MinerError::CommandTimeout {
                address: address.clone(),
                elapsed_ms: started.elapsed().as_millis(),
            }),
        };

        let kind = miner_kind(&err);
        let retryable = kind.is_none_or(ErrorKind::is_retryable);
        if attempt >= max_attempts || !retryable {
            let failure = LaunchFailure::from_error(&err, attempt);
            let outcome = if kind.is_some_and(ErrorKind::is_timeout) {
                Outcome::Timeout(failure)
            } else {
                Outcome::Error(failure)
            };
            return LaunchResult { address, outcome };
        }

        debug!(
            "{} attempt {}/{} failed, retrying in {}ms: {}",
            address,
            attempt,
            max_attempts,
            options.retry_delay.as_millis(),
            err
        );
        tokio::time::sleep(options.retry_delay).await;
    }
}

/// Turns a joined task into a result; aborted tasks yield nothing.
fn settle<T>(
    joined: Result<(Id, LaunchResult<T>), JoinError>,
    in_flight: &mut HashMap<Id, InFlight>,
) -> Option<LaunchResult<T>> {
    match joined {
        Ok((id, result)) => {
            in_flight.remove(&id);
            Some(result)
        }
        Err(e) => {
            let target = in_flight.remove(&e.id());
            if e.is_cancelled() {
                if let Some(target) = target {
                    debug!("{} aborted", target.address);
                }
                return None;
            }
            let Some(InFlight { address, attempts }) = target else {
                warn!("task {} failed without a known target: {}", e.id(), e);
                return None;
            };
            Some(LaunchResult {
                address,
                outcome: Outcome::Error(LaunchFailure {
                    brief: format!("operation panicked: {e}"),
                    traceback: format!("{e:?}"),
                    kind: None,
                    attempts: attempts.load(Ordering::SeqCst).max(1),
                }),
            })
        }
    }
}
