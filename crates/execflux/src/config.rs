use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use clap::ArgAction;
use clap::Parser;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use utils::version;

use crate::error::ConfigError;
use crate::orchestrator::RunPlan;
use crate::point::PointFactory;
use crate::point::TagSet;
use crate::publisher::Endpoint;
use crate::publisher::PublisherConfig;
use crate::publisher::DEFAULT_BATCH_SIZE;
use crate::publisher::DEFAULT_REQUEST_TIMEOUT;
use crate::publisher::DEFAULT_RETRIES;
use crate::runner::Command;
use crate::runner::OutputMode;

pub const DEFAULT_MEASUREMENT: &str = "events";

#[derive(Parser, Debug)]
#[command(
    name = "execflux",
    about = "Run a command and report its duration, exit status and resource usage to InfluxDB",
    version = &**version::VERSION
)]
pub struct Cli {
    #[arg(
        long,
        short = 'c',
        env = "EXECFLUX_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "YAML config file, overridden by environment and flags"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        env = "EXECFLUX_TIMEOUT",
        allow_negative_numbers = true,
        help = "Command timeout in seconds (default: 0, no timeout)"
    )]
    pub timeout: Option<f64>,

    #[arg(
        long,
        env = "EXECFLUX_SAMPLE_PERIOD",
        allow_negative_numbers = true,
        help = "CPU/memory sampling period in ms, <= 0 disables sampling (default: 0)"
    )]
    pub sample_period: Option<i64>,

    #[arg(
        long,
        env = "EXECFLUX_PREFIX_OUTPUT",
        help = "Prefix forwarded lines with `out: ` or `err: `"
    )]
    pub prefix_output: bool,

    #[arg(
        long,
        env = "EXECFLUX_DRY_RUN",
        help = "Print the InfluxDB requests instead of sending them"
    )]
    pub dry_run: bool,

    #[arg(short, long, action = ArgAction::Count, help = "Increase log verbosity")]
    pub verbose: u8,

    #[arg(
        long,
        env = "EXECFLUX_HOST",
        help = "Value of the host tag (default: system hostname)"
    )]
    pub host: Option<String>,

    #[arg(
        long,
        env = "INFLUX_URL",
        help = "InfluxDB server URL (no points are sent if not set)"
    )]
    pub influx_url: Option<String>,

    #[arg(
        long,
        env = "INFLUX_DB",
        help = "InfluxDB database (no points are sent if not set)"
    )]
    pub influx_db: Option<String>,

    #[arg(long, env = "INFLUX_USER", help = "InfluxDB username (default: none)")]
    pub influx_user: Option<String>,

    #[arg(
        long,
        env = "INFLUX_PASSWORD",
        hide_env_values = true,
        help = "InfluxDB password (default: none)"
    )]
    pub influx_password: Option<String>,

    #[arg(
        long,
        env = "INFLUX_MEASUREMENT",
        help = "InfluxDB measurement (default: events)"
    )]
    pub influx_measurement: Option<String>,

    #[arg(
        long,
        env = "INFLUX_TAGS",
        help = "Comma-separated k=v pairs of InfluxDB tags, e.g. 'foo=bar,fizz=buzz'"
    )]
    pub influx_tags: Option<String>,

    #[arg(
        long,
        env = "INFLUX_RETRIES",
        allow_negative_numbers = true,
        help = "Attempts per batch, values <= 0 mean 3 (default: 3)"
    )]
    pub influx_retries: Option<i64>,

    #[arg(
        long,
        env = "INFLUX_TIMEOUT",
        help = "InfluxDB request timeout in milliseconds (default: 5000)"
    )]
    pub influx_timeout: Option<u64>,

    #[arg(
        long,
        env = "INFLUX_BATCH_SIZE",
        help = "Maximum points per write request (default: 500)"
    )]
    pub influx_batch_size: Option<usize>,

    #[arg(last = true, required = true, num_args = 1.., value_name = "COMMAND")]
    pub command: Vec<String>,
}

/// Settings read from the YAML config file. Every key is optional.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub timeout: Option<f64>,
    pub sample_period: Option<i64>,
    pub prefix_output: Option<bool>,
    pub dry_run: Option<bool>,
    pub host: Option<String>,
    pub influx: InfluxFileConfig,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InfluxFileConfig {
    pub url: Option<String>,
    pub db: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub measurement: Option<String>,
    pub tags: Option<String>,
    pub retries: Option<i64>,
    pub timeout: Option<u64>,
    pub batch_size: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, Report<ConfigError>> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path)
            .change_context_lazy(|| ConfigError::ReadFile { path: display.clone() })?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&raw).change_context(ConfigError::ParseFile { path: display })
    }
}

/// Hostname reported by the OS, if any.
fn system_host_name() -> Option<String> {
    sysinfo::System::host_name().filter(|h| !h.is_empty())
}

impl Cli {
    /// Loads the config file named by `--config`, if any, and resolves.
    pub fn into_plan(self) -> Result<RunPlan, Report<ConfigError>> {
        let file = match &self.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        self.resolve(file)
    }

    /// Merges flags and environment (already folded together by clap) over
    /// the file, over the defaults.
    pub fn resolve(self, file: FileConfig) -> Result<RunPlan, Report<ConfigError>> {
        let influx = file.influx;

        let seconds = self.timeout.or(file.timeout).unwrap_or(0.0);
        let timeout = Duration::try_from_secs_f64(seconds).change_context_lazy(|| {
            ConfigError::Invalid { option: "timeout" }
        })?;
        let timeout = (!timeout.is_zero()).then_some(timeout);

        let sample_period = self
            .sample_period
            .or(file.sample_period)
            .and_then(|ms| u64::try_from(ms).ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        let output = if self.prefix_output || file.prefix_output.unwrap_or(false) {
            OutputMode::Prefixed
        } else {
            OutputMode::Passthrough
        };

        let host = self
            .host
            .or(file.host)
            .or_else(system_host_name)
            .unwrap_or_else(|| "unknown".to_string());

        let tags = self.influx_tags.or(influx.tags).unwrap_or_default();
        let tags = TagSet::parse(&tags).map_err(|e| {
            Report::new(ConfigError::Invalid {
                option: "influx-tags",
            })
            .attach_printable(e.to_string())
        })?;

        let measurement = self
            .influx_measurement
            .or(influx.measurement)
            .unwrap_or_else(|| DEFAULT_MEASUREMENT.to_string());
        let factory = PointFactory::new(measurement, &host, &tags).map_err(|e| {
            Report::new(ConfigError::Invalid {
                option: "influx-measurement",
            })
            .attach_printable(e.to_string())
        })?;

        let url = self.influx_url.or(influx.url);
        let database = self.influx_db.or(influx.db);
        let user = self.influx_user.or(influx.user);
        let password = self.influx_password.or(influx.password);
        let endpoint = Endpoint::from_parts(
            url.as_deref(),
            database.as_deref(),
            user.as_deref(),
            password.as_deref(),
        );

        let retries = self
            .influx_retries
            .or(influx.retries)
            .unwrap_or(i64::from(DEFAULT_RETRIES));
        let retries = u32::try_from(retries.max(0)).unwrap_or(u32::MAX);

        let request_timeout = self
            .influx_timeout
            .or(influx.timeout)
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let batch_size = self
            .influx_batch_size
            .or(influx.batch_size)
            .unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(Report::new(ConfigError::Invalid {
                option: "influx-batch-size",
            })
            .attach_printable("batch size must be at least 1"));
        }

        let command = Command::from_argv(self.command).map_err(|e| {
            Report::new(ConfigError::Invalid { option: "command" }).attach_printable(e.to_string())
        })?;

        Ok(RunPlan {
            command,
            timeout,
            sample_period,
            output,
            factory,
            endpoint,
            publisher: PublisherConfig {
                batch_size,
                retries,
                request_timeout,
                dry_run: self.dry_run || file.dry_run.unwrap_or(false),
            },
        })
    }
}
