//! Sequences one run: execute, sample, summarize, publish.

use std::time::Duration;
use std::time::Instant;

use derive_more::Display;
use error_stack::Report;
use tokio_util::sync::CancellationToken;

use crate::error::PublishError;
use crate::error::RunError;
use crate::point::Point;
use crate::point::PointFactory;
use crate::publisher::Endpoint;
use crate::publisher::Publisher;
use crate::publisher::PublisherConfig;
use crate::runner::Command;
use crate::runner::ExitStatus;
use crate::runner::OutputMode;
use crate::runner::ProcessRunner;
use crate::sampler::ProcessProbe;
use crate::sampler::SampleStream;
use crate::sampler::Sampler;

/// Exit code when the endpoint rejected or never received the points.
pub const EXIT_PUBLISH_FAILURE: u8 = 75;
/// Exit code for a command killed at its deadline.
pub const EXIT_TIMEOUT: u8 = 124;

/// Everything one run needs, resolved from configuration.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub command: Command,
    pub timeout: Option<Duration>,
    pub sample_period: Option<Duration>,
    pub output: OutputMode,
    pub factory: PointFactory,
    pub endpoint: Option<Endpoint>,
    pub publisher: PublisherConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Phase {
    #[display("idle")]
    Idle,
    #[display("running")]
    Running,
    #[display("collecting")]
    Collecting,
    #[display("publishing")]
    Publishing,
    #[display("done")]
    Done,
}

/// Result of a run that got past process start.
#[derive(Debug)]
pub struct Outcome {
    pub status: ExitStatus,
    pub duration: Duration,
    pub points: Vec<Point>,
    /// `None` when publishing was skipped.
    pub published: Option<Result<usize, Report<PublishError>>>,
}

impl Outcome {
    /// Code this process should exit with.
    ///
    /// The child's own code wins unless publishing failed, which is reported
    /// as a separate failure class.
    pub fn exit_code(&self) -> u8 {
        if matches!(self.published, Some(Err(_))) {
            return EXIT_PUBLISH_FAILURE;
        }
        status_exit_code(self.status)
    }
}

fn status_exit_code(status: ExitStatus) -> u8 {
    match status {
        ExitStatus::Exited(code) => (code & 0xff) as u8,
        ExitStatus::TimedOut => EXIT_TIMEOUT,
        ExitStatus::Signaled(signal) => (128 + signal).clamp(0, 255) as u8,
    }
}

/// Tracks the current phase of a run.
#[derive(Debug)]
struct PhaseTracker(Phase);

impl PhaseTracker {
    fn enter(&mut self, phase: Phase) {
        tracing::debug!(from = %self.0, to = %phase, "phase change");
        self.0 = phase;
    }
}

/// Drives one run through its phases.
pub struct Orchestrator<P> {
    plan: RunPlan,
    probe: P,
}

impl<P: ProcessProbe> Orchestrator<P> {
    pub fn new(plan: RunPlan, probe: P) -> Self {
        Self { plan, probe }
    }

    /// Runs the command and reports it.
    ///
    /// Only a failure to start or supervise the command is an error; a
    /// failed publish is carried in [`Outcome::published`].
    pub async fn run(self) -> Result<Outcome, Report<RunError>> {
        let Self { plan, probe } = self;
        let mut phase = PhaseTracker(Phase::Idle);

        phase.enter(Phase::Running);
        let started = Instant::now();
        let process = ProcessRunner::new(plan.output).spawn(&plan.command)?;

        let cancellation_token = CancellationToken::new();
        let period = plan.sample_period.unwrap_or_default();
        let samples = match process.pid() {
            Some(pid) if !period.is_zero() => {
                let sampler = Sampler::new(probe, pid, period, plan.factory.clone());
                sampler.spawn(cancellation_token.clone())
            }
            _ => SampleStream::closed(),
        };
        let collector = tokio::spawn(samples.collect());

        let result = process.wait(plan.timeout).await;
        let duration = started.elapsed();
        cancellation_token.cancel();

        // collector ends once the sampler drops its sender
        phase.enter(Phase::Collecting);
        let mut points = match collector.await {
            Ok(points) => points,
            Err(e) => {
                tracing::warn!("sample collector failed: {e}");
                Vec::new()
            }
        };
        let result = result?;

        for error in &result.errors {
            tracing::warn!("{error:?}");
        }
        if result.status == ExitStatus::TimedOut {
            tracing::warn!("command has been killed due to timeout");
        }

        let summary = plan
            .factory
            .event(duration.as_secs_f64(), result.status.status_value());
        match summary {
            Ok(point) => points.push(point),
            Err(e) => tracing::error!("failed to build summary point: {e}"),
        }

        let published = match &plan.endpoint {
            None => {
                tracing::info!(
                    status = result.status.status_value(),
                    "not writing points to influx since database or url is not set"
                );
                None
            }
            Some(endpoint) => {
                phase.enter(Phase::Publishing);
                let publisher = Publisher::new(endpoint.clone(), plan.publisher.clone());
                let published = match publisher {
                    Ok(publisher) => publisher.publish(&points).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = &published {
                    tracing::error!("unable to write to influxdb: {e:?}");
                }
                Some(published)
            }
        };

        phase.enter(Phase::Done);
        Ok(Outcome {
            status: result.status,
            duration,
            points,
            published,
        })
    }
}
