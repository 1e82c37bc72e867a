//! Sequential test execution with per-test usage sampling.
//!
//! Every test gets a fresh [`Sampler`] and a bounded [`ExecutionContext`]
//! derived from the shared session. The test body runs on a worker thread so
//! the harness can record a failure as soon as the bound expires; the sampler
//! is stopped on every exit path, and the worker is joined before the next
//! test starts.

use std::any::Any;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::{info, info_span, warn};

use crate::config::{HarnessSettings, SamplingSettings};
use crate::context::{ContextError, ExecutionContext};
use crate::probe::{ProbeProvider, UsageScope};
use crate::result::TestResult;
use crate::sampler::{DEFAULT_SAMPLE_INTERVAL, Sampler};

pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(20 * 60);
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(30);

/// A benchmark runnable against a shared session of type `S`.
pub trait BenchTest<S>: Send + Sync {
    fn name(&self) -> &str;

    /// What the sampler should measure while this test runs.
    fn usage_scope(&self) -> UsageScope;

    /// Run to completion. A returned `TestResult` may itself be a failure;
    /// an `Err` means the test could not produce a result at all.
    fn run(&self, ctx: &ExecutionContext<S>) -> Result<TestResult>;
}

/// Timing knobs for a harness run.
#[derive(Debug, Clone, Copy)]
pub struct HarnessOptions {
    pub test_timeout: Duration,
    pub cancel_grace: Duration,
    pub sample_interval: Duration,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            test_timeout: DEFAULT_TEST_TIMEOUT,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }
}

impl HarnessOptions {
    pub fn from_settings(harness: &HarnessSettings, sampling: &SamplingSettings) -> Self {
        Self {
            test_timeout: harness.test_timeout(),
            cancel_grace: harness.cancel_grace(),
            sample_interval: sampling.interval(),
        }
    }
}

pub struct TestHarness<S> {
    session: Arc<S>,
    tests: Vec<Arc<dyn BenchTest<S>>>,
    probes: Arc<dyn ProbeProvider>,
    options: HarnessOptions,
}

impl<S: Send + Sync + 'static> TestHarness<S> {
    pub fn new(
        session: Arc<S>,
        tests: Vec<Arc<dyn BenchTest<S>>>,
        probes: Arc<dyn ProbeProvider>,
        options: HarnessOptions,
    ) -> Self {
        Self {
            session,
            tests,
            probes,
            options,
        }
    }

    /// Run every test in order. The report has one entry per test, in the same order.
    pub fn run_all(&self) -> Vec<TestResult> {
        self.run_all_with(|_, _| {})
    }

    /// Like [`run_all`](Self::run_all), calling `on_start` with the index and
    /// name of each test just before it runs.
    pub fn run_all_with(&self, mut on_start: impl FnMut(usize, &str)) -> Vec<TestResult> {
        let mut results = Vec::with_capacity(self.tests.len());
        for (index, test) in self.tests.iter().enumerate() {
            let span = info_span!("harness.test", test = %test.name(), index);
            let _guard = span.enter();
            on_start(index, test.name());
            let result = self.run_one(test);
            info!(
                success = result.success,
                samples = result.samples.len(),
                duration_ms = result.duration().num_milliseconds(),
                "test finished"
            );
            results.push(result);
        }
        results
    }

    fn run_one(&self, test: &Arc<dyn BenchTest<S>>) -> TestResult {
        let name = test.name().to_string();
        let scope = test.usage_scope();
        let started = Utc::now();
        let ctx =
            ExecutionContext::with_timeout(Arc::clone(&self.session), self.options.test_timeout);
        let bound = chrono::Duration::from_std(self.options.test_timeout)
            .ok()
            .and_then(|timeout| started.checked_add_signed(timeout));

        let probe = self.probes.probe_for(&scope);
        let mut sampler = Sampler::new(probe, self.options.sample_interval);
        if let Err(err) = sampler.start() {
            warn!(error = %err, scope = %scope, "sampler failed to start; continuing without samples");
        }

        let outcome = match Worker::spawn(test, &ctx) {
            Ok(worker) => worker.wait_until(ctx.deadline()),
            Err(err) => WaitOutcome::Finished(Err(err)),
        };

        if let Err(err) = sampler.stop() {
            warn!(error = %err, "sampler did not stop cleanly");
        }

        let outcome = match outcome {
            WaitOutcome::Finished(outcome) => outcome,
            WaitOutcome::Expired(worker) => {
                ctx.cancel();
                warn!(
                    timeout_s = self.options.test_timeout.as_secs(),
                    "test exceeded its time bound; cancelling"
                );
                if !worker.drain(self.options.cancel_grace) {
                    warn!(
                        grace_s = self.options.cancel_grace.as_secs(),
                        "timed-out test is still running after grace period; waiting for it to exit"
                    );
                }
                // The next test must not start while this one is still running.
                worker.join();
                Err(anyhow!(ContextError::DeadlineExceeded))
            }
        };
        ctx.cancel();

        let mut result = match outcome {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "test returned no result");
                TestResult::failed(name, started, Utc::now(), &err)
            }
        };
        let mut samples = sampler.read_samples();
        // A probe call in flight at the deadline may land after it.
        if let Some(bound) = bound {
            samples.retain(|sample| sample.timestamp <= bound);
        }
        result.samples = samples;
        result
    }
}

enum WaitOutcome {
    Finished(Result<TestResult>),
    Expired(Worker),
}

/// A test body running on its own thread.
struct Worker {
    rx: Receiver<Result<TestResult>>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn<S: Send + Sync + 'static>(
        test: &Arc<dyn BenchTest<S>>,
        ctx: &ExecutionContext<S>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let test = Arc::clone(test);
        let ctx = ctx.clone();
        let handle = thread::Builder::new()
            .name(format!("bench-{}", test.name()))
            .spawn(move || {
                let _ = tx.send(test.run(&ctx));
            })?;
        Ok(Self { rx, handle })
    }

    fn wait_until(self, deadline: Instant) -> WaitOutcome {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.rx.recv_timeout(remaining) {
            Ok(outcome) => {
                let _ = self.handle.join();
                WaitOutcome::Finished(outcome)
            }
            Err(RecvTimeoutError::Timeout) => WaitOutcome::Expired(self),
            Err(RecvTimeoutError::Disconnected) => {
                let outcome = match self.handle.join() {
                    Err(payload) => Err(anyhow!("test panicked: {}", panic_message(payload.as_ref()))),
                    Ok(()) => Err(anyhow!("test worker exited without a result")),
                };
                WaitOutcome::Finished(outcome)
            }
        }
    }

    /// Wait up to `grace` for the worker to finish. Returns false if it is still running.
    fn drain(&self, grace: Duration) -> bool {
        !matches!(self.rx.recv_timeout(grace), Err(RecvTimeoutError::Timeout))
    }

    /// Block until the worker thread has exited.
    fn join(self) {
        let _ = self.handle.join();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
