//! Periodic resource sampling of a live process.
//!
//! The [`Sampler`] polls a [`ProcessProbe`] every period and pushes one
//! `etype=metric` point per tick into a bounded channel. It stops when the
//! probe can no longer see the process, or when the cancellation token fires
//! because the runner observed the exit. Stopping drops the sender, which is
//! how the consumer learns there are no more samples.

use std::time::Duration;

use error_stack::Report;
use sysinfo::Pid;
use sysinfo::ProcessesToUpdate;
use sysinfo::System;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::ProbeError;
use crate::point::current_time;
use crate::point::Point;
use crate::point::PointFactory;

/// Samples buffered between the sampler and the collector before new ones are dropped.
pub const SAMPLE_BUFFER: usize = 1024;

/// Resource usage of a process at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessUsage {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

/// Source of per-process resource usage.
pub trait ProcessProbe: Send + 'static {
    fn usage(&mut self, pid: u32) -> Result<ProcessUsage, Report<ProbeError>>;
}

/// [`ProcessProbe`] backed by `sysinfo`.
pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SysinfoProbe {
    fn usage(&mut self, pid: u32) -> Result<ProcessUsage, Report<ProbeError>> {
        let sys_pid = Pid::from_u32(pid);
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);

        let process = self
            .system
            .process(sys_pid)
            .ok_or_else(|| Report::new(ProbeError::NotFound { pid }))?;

        Ok(ProcessUsage {
            cpu_percent: f64::from(process.cpu_usage()),
            memory_bytes: process.memory(),
        })
    }
}

/// Receiving end of the sample channel.
pub struct SampleStream {
    receiver: mpsc::Receiver<Point>,
    handle: Option<JoinHandle<()>>,
}

impl SampleStream {
    /// A stream that is already closed, used when sampling is disabled.
    pub fn closed() -> Self {
        let (_, receiver) = mpsc::channel(1);
        Self {
            receiver,
            handle: None,
        }
    }

    /// Next sample, or `None` once the sampler has stopped.
    pub async fn recv(&mut self) -> Option<Point> {
        self.receiver.recv().await
    }

    /// Drains every remaining sample in capture order, then waits for the
    /// sampler task to finish.
    pub async fn collect(mut self) -> Vec<Point> {
        let mut points = Vec::new();
        while let Some(point) = self.receiver.recv().await {
            points.push(point);
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!("sampler task failed: {e}");
            }
        }
        points
    }
}

pub struct Sampler<P> {
    probe: P,
    pid: u32,
    period: Duration,
    factory: PointFactory,
    buffer: usize,
}

impl<P: ProcessProbe> Sampler<P> {
    pub fn new(probe: P, pid: u32, period: Duration, factory: PointFactory) -> Self {
        Self {
            probe,
            pid,
            period,
            factory,
            buffer: SAMPLE_BUFFER,
        }
    }

    /// Overrides the channel capacity, [`SAMPLE_BUFFER`] by default.
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    /// Starts sampling on a background task. A zero period disables sampling
    /// and returns a closed stream.
    pub fn spawn(self, cancellation_token: CancellationToken) -> SampleStream {
        if self.period.is_zero() {
            tracing::debug!("sampling disabled");
            return SampleStream::closed();
        }

        let (sender, receiver) = mpsc::channel(self.buffer);
        let handle = tokio::spawn(self.run(sender, cancellation_token));

        SampleStream {
            receiver,
            handle: Some(handle),
        }
    }

    async fn run(mut self, sender: mpsc::Sender<Point>, cancellation_token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // first tick completes immediately
        ticker.tick().await;

        tracing::debug!(
            pid = self.pid,
            period_ms = self.period.as_millis() as u64,
            "sampler started"
        );
        let mut taken = 0usize;

        loop {
            tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => {
                    tracing::debug!(pid = self.pid, "sampler cancelled");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let usage = match self.probe.usage(self.pid) {
                Ok(usage) if usage.memory_bytes == 0 => {
                    tracing::debug!(pid = self.pid, "process reports no memory, assuming exit");
                    break;
                }
                Ok(usage) => usage,
                Err(e) => {
                    tracing::debug!(pid = self.pid, "process no longer observable: {e:?}");
                    break;
                }
            };

            let sample =
                self.factory
                    .metric(usage.cpu_percent, usage.memory_bytes, current_time());
            let point = match sample {
                Ok(point) => point,
                Err(e) => {
                    tracing::warn!(pid = self.pid, "dropping sample: {e}");
                    continue;
                }
            };

            match sender.try_send(point) {
                Ok(()) => taken += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(pid = self.pid, "sample buffer full, dropping sample");
                }
                Err(TrySendError::Closed(_)) => break,
            }
        }

        tracing::debug!(pid = self.pid, samples = taken, "sampler stopped");
    }
}
