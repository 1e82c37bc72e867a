//! Background CPU sampler.
//!
//! A [`Sampler`] polls a [`UsageProbe`] on its own thread at a fixed interval
//! and appends successful readings to a [`SampleBuffer`]. `stop()` joins the
//! polling thread, so once it returns no further samples can appear.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::probe::UsageProbe;

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// One usage observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub usage: f64,
}

/// Append-only sample storage shared between the polling thread and readers.
#[derive(Debug, Default)]
pub struct SampleBuffer {
    samples: Mutex<Vec<Sample>>,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, sample: Sample) {
        self.lock().push(sample);
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<Sample> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Sample>> {
        // A panic while pushing cannot leave a torn Vec, so poisoning is ignored.
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for SamplerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SamplerState::Idle => "idle",
            SamplerState::Running => "running",
            SamplerState::Stopping => "stopping",
            SamplerState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("cannot {operation} sampler in state {state}")]
    InvalidState {
        operation: &'static str,
        state: SamplerState,
    },
    #[error("failed to spawn sampler thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("sampler polling loop panicked")]
    LoopPanicked,
}

/// Periodic usage collector for a single benchmark run.
pub struct Sampler {
    buffer: Arc<SampleBuffer>,
    probe: Option<Box<dyn UsageProbe>>,
    interval: Duration,
    state: SamplerState,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Sampler {
    pub fn new(probe: Box<dyn UsageProbe>, interval: Duration) -> Self {
        Self {
            buffer: Arc::new(SampleBuffer::new()),
            probe: Some(probe),
            interval,
            state: SamplerState::Idle,
            stop_tx: None,
            handle: None,
        }
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    /// Launch the polling loop. Returns immediately.
    pub fn start(&mut self) -> Result<(), SamplerError> {
        if self.state != SamplerState::Idle {
            return Err(SamplerError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        let Some(probe) = self.probe.take() else {
            return Err(SamplerError::InvalidState {
                operation: "start",
                state: self.state,
            });
        };

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let buffer = Arc::clone(&self.buffer);
        let interval = self.interval;
        let handle = thread::Builder::new()
            .name("usage-sampler".into())
            .spawn(move || poll_loop(probe, buffer, interval, stop_rx))
            .map_err(SamplerError::Spawn)?;

        self.stop_tx = Some(stop_tx);
        self.handle = Some(handle);
        self.state = SamplerState::Running;
        debug!(interval_ms = interval.as_millis() as u64, "sampler started");
        Ok(())
    }

    /// Signal the loop and wait for it to exit.
    pub fn stop(&mut self) -> Result<(), SamplerError> {
        if !matches!(self.state, SamplerState::Running | SamplerState::Stopping) {
            return Err(SamplerError::InvalidState {
                operation: "stop",
                state: self.state,
            });
        }
        self.state = SamplerState::Stopping;
        self.shutdown_loop()
    }

    /// Copy of every sample recorded so far.
    pub fn read_samples(&self) -> Vec<Sample> {
        self.buffer.snapshot()
    }

    fn shutdown_loop(&mut self) -> Result<(), SamplerError> {
        if let Some(stop_tx) = self.stop_tx.take() {
            // The loop exits on either a message or a disconnect.
            let _ = stop_tx.send(());
        }
        let joined = match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| SamplerError::LoopPanicked),
            None => Ok(()),
        };
        self.state = SamplerState::Stopped;
        debug!(samples = self.buffer.len(), "sampler stopped");
        joined
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        if matches!(self.state, SamplerState::Running | SamplerState::Stopping) {
            let _ = self.shutdown_loop();
        }
    }
}

fn poll_loop(
    mut probe: Box<dyn UsageProbe>,
    buffer: Arc<SampleBuffer>,
    interval: Duration,
    stop_rx: mpsc::Receiver<()>,
) {
    loop {
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }

        match probe.sample() {
            Ok(usage) => buffer.push(Sample {
                timestamp: Utc::now(),
                usage,
            }),
            Err(err) => debug!(error = %err, "usage probe failed; skipping tick"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    const FAST: Duration = Duration::from_millis(10);

    fn constant_probe(value: f64) -> Box<dyn UsageProbe> {
        Box::new(move || Ok::<f64, ProbeError>(value))
    }

    #[test]
    fn start_twice_is_invalid() {
        let mut sampler = Sampler::new(constant_probe(1.0), FAST);
        sampler.start().unwrap();
        let err = sampler.start().unwrap_err();
        assert!(matches!(
            err,
            SamplerError::InvalidState {
                operation: "start",
                state: SamplerState::Running
            }
        ));
        sampler.stop().unwrap();
    }

    #[test]
    fn stop_before_start_is_invalid() {
        let mut sampler = Sampler::new(constant_probe(1.0), FAST);
        let err = sampler.stop().unwrap_err();
        assert!(matches!(
            err,
            SamplerError::InvalidState {
                state: SamplerState::Idle,
                ..
            }
        ));
    }

    #[test]
    fn stop_twice_is_invalid() {
        let mut sampler = Sampler::new(constant_probe(1.0), FAST);
        sampler.start().unwrap();
        sampler.stop().unwrap();
        assert_eq!(sampler.state(), SamplerState::Stopped);
        assert!(sampler.stop().is_err());
        assert!(sampler.start().is_err());
    }

    #[test]
    fn samples_grow_while_running_and_freeze_after_stop() {
        let mut sampler = Sampler::new(constant_probe(42.0), FAST);
        sampler.start().unwrap();

        let mut last = 0;
        for _ in 0..10 {
            thread::sleep(FAST);
            let count = sampler.read_samples().len();
            assert!(count >= last);
            last = count;
        }
        sampler.stop().unwrap();

        let frozen = sampler.read_samples().len();
        assert!(frozen > 0);
        thread::sleep(FAST * 5);
        assert_eq!(sampler.read_samples().len(), frozen);
        assert!(sampler.read_samples().iter().all(|s| s.usage == 42.0));
    }

    #[test]
    fn sample_timestamps_fall_between_start_and_stop() {
        let mut sampler = Sampler::new(constant_probe(3.0), FAST);
        let before_start = Utc::now();
        sampler.start().unwrap();
        thread::sleep(FAST * 8);
        sampler.stop().unwrap();
        let after_stop = Utc::now();

        let samples = sampler.read_samples();
        assert!(!samples.is_empty());
        for sample in samples {
            assert!(sample.timestamp >= before_start);
            assert!(sample.timestamp <= after_stop);
        }
    }

    #[test]
    fn failing_probe_yields_no_samples_and_keeps_polling() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let probe = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<f64, _>(ProbeError::Unavailable("no counters".into()))
        };
        let mut sampler = Sampler::new(Box::new(probe), FAST);
        sampler.start().unwrap();
        thread::sleep(FAST * 8);
        sampler.stop().unwrap();

        assert!(sampler.read_samples().is_empty());
        assert!(calls.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn stop_returns_within_about_one_interval() {
        let mut sampler = Sampler::new(constant_probe(1.0), Duration::from_millis(200));
        sampler.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        sampler.stop().unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn panicking_probe_surfaces_on_stop() {
        let probe = || -> Result<f64, ProbeError> { panic!("probe exploded") };
        let mut sampler = Sampler::new(Box::new(probe), FAST);
        sampler.start().unwrap();
        thread::sleep(FAST * 4);
        let err = sampler.stop().unwrap_err();
        assert!(matches!(err, SamplerError::LoopPanicked));
        assert_eq!(sampler.state(), SamplerState::Stopped);
    }

    #[test]
    fn dropping_running_sampler_joins_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let probe = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<f64, ProbeError>(1.0)
        };
        let mut sampler = Sampler::new(Box::new(probe), FAST);
        sampler.start().unwrap();
        thread::sleep(FAST * 3);
        drop(sampler);
        let after_drop = calls.load(Ordering::SeqCst);
        thread::sleep(FAST * 5);
        assert_eq!(calls.load(Ordering::SeqCst), after_drop);
    }

    #[test]
    fn read_copy_is_detached_from_buffer() {
        let buffer = SampleBuffer::new();
        buffer.push(Sample {
            timestamp: Utc::now(),
            usage: 1.0,
        });
        let mut copy = buffer.snapshot();
        copy.clear();
        assert_eq!(buffer.len(), 1);
    }
}
