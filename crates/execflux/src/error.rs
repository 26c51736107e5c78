//! Error taxonomy for the run and publish stages.

use core::error::Error;

use derive_more::Display;

/// Errors raised while starting or supervising the wrapped command.
#[derive(Debug, Display)]
pub enum RunError {
    #[display("no command specified")]
    EmptyCommand,

    /// The binary could not be started (missing, not executable, ...).
    #[display("failed to start `{program}`")]
    Spawn { program: String },

    #[display("failed to wait for `{program}`")]
    Wait { program: String },

    #[display("failed to kill `{program}` after timeout")]
    Kill { program: String },

    #[display("failed to forward child {stream}")]
    Forward { stream: &'static str },
}

impl Error for RunError {}

/// Errors raised while delivering points to the metrics endpoint.
#[derive(Debug, Display)]
pub enum PublishError {
    #[display("failed to build HTTP client")]
    Client,

    /// Network level failure, including request timeouts.
    #[display("transport error: {message}")]
    Transport { message: String },

    /// The endpoint answered with something other than 204.
    #[display("unexpected response {status}: {body}")]
    Status { status: u16, body: String },

    #[display("failed to write dry-run output")]
    DryRun,

    #[display("batch {batch} failed after {attempts} attempt(s)")]
    Exhausted { batch: usize, attempts: u32 },
}

impl Error for PublishError {}

/// Errors raised by the process usage collaborator.
#[derive(Debug, Display)]
pub enum ProbeError {
    #[display("process {pid} is not observable")]
    NotFound { pid: u32 },
}

impl Error for ProbeError {}

/// Errors raised while resolving configuration.
#[derive(Debug, Display)]
pub enum ConfigError {
    #[display("failed to read config file {path}")]
    ReadFile { path: String },

    #[display("failed to parse config file {path}")]
    ParseFile { path: String },

    #[display("invalid value for {option}")]
    Invalid { option: &'static str },
}

impl Error for ConfigError {}
