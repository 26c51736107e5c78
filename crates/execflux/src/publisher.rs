//! Batched, retried delivery of points to an InfluxDB `/write` endpoint.

use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;

use crate::error::PublishError;
use crate::metrics::encoders::InfluxEncoder;
use crate::metrics::encoders::MetricsEncoder;
use crate::point::Point;

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

pub type PublishResult<T> = Result<T, Report<PublishError>>;

/// InfluxDB write target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Endpoint {
    /// Builds an endpoint when both URL and database are set.
    pub fn from_parts(
        url: Option<&str>,
        database: Option<&str>,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Option<Self> {
        let url = url.filter(|u| !u.is_empty())?;
        let database = database.filter(|d| !d.is_empty())?;
        Some(Self {
            url: url.to_string(),
            database: database.to_string(),
            user: user.filter(|u| !u.is_empty()).map(str::to_string),
            password: password.map(str::to_string),
        })
    }

    /// `{url}/write?db={database}[&u={user}&p={password}]`
    ///
    /// Trailing slashes on the base URL collapse to the single separator.
    /// Query values are appended verbatim, without percent-encoding.
    pub fn write_url(&self) -> String {
        self.build_url(self.password.as_deref().unwrap_or_default())
    }

    /// Same as [`Endpoint::write_url`] with the password masked, for logs.
    pub fn redacted_url(&self) -> String {
        self.build_url("***")
    }

    fn build_url(&self, password: &str) -> String {
        let mut uri = format!(
            "{}/write?db={}",
            self.url.trim_end_matches('/'),
            self.database
        );
        if let Some(user) = &self.user {
            uri.push_str(&format!("&u={user}&p={password}"));
        }
        uri
    }
}

/// Delivery tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    pub batch_size: usize,
    /// Attempts per batch. Zero falls back to [`DEFAULT_RETRIES`].
    pub retries: u32,
    pub request_timeout: Duration,
    pub dry_run: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            retries: DEFAULT_RETRIES,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            dry_run: false,
        }
    }
}

impl PublisherConfig {
    /// Attempts made per batch before giving up.
    pub fn attempts(&self) -> u32 {
        if self.retries == 0 {
            DEFAULT_RETRIES
        } else {
            self.retries
        }
    }

    fn batch_size(&self) -> usize {
        self.batch_size.max(1)
    }
}

/// Sink receiving the would-be requests in dry-run mode.
pub type DryRunSink = Arc<Mutex<dyn Write + Send>>;

enum Transport {
    Http(reqwest::Client),
    DryRun(DryRunSink),
}

impl Transport {
    async fn post(&self, url: &str, body: String) -> PublishResult<StatusCode> {
        match self {
            Transport::Http(client) => {
                let response = client
                    .post(url)
                    .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| {
                        Report::new(PublishError::Transport {
                            message: e.without_url().to_string(),
                        })
                    })?;
                let status = response.status();
                if status != StatusCode::NO_CONTENT {
                    let body = response.text().await.unwrap_or_default();
                    return Err(Report::new(PublishError::Status {
                        status: status.as_u16(),
                        body: body.trim().to_string(),
                    }));
                }
                Ok(status)
            }
            Transport::DryRun(sink) => {
                let mut sink = sink
                    .lock()
                    .map_err(|_| Report::new(PublishError::DryRun))?;
                writeln!(sink, "POST {url}")
                    .and_then(|_| writeln!(sink, "{body}"))
                    .and_then(|_| sink.flush())
                    .change_context(PublishError::DryRun)?;
                Ok(StatusCode::NO_CONTENT)
            }
        }
    }
}

/// Splits points into batches and writes them in order.
pub struct Publisher {
    endpoint: Endpoint,
    config: PublisherConfig,
    encoder: InfluxEncoder,
    transport: Transport,
}

impl Publisher {
    /// Creates a publisher. In dry-run mode requests are printed to stdout.
    pub fn new(endpoint: Endpoint, config: PublisherConfig) -> PublishResult<Self> {
        let transport = if config.dry_run {
            Transport::DryRun(Arc::new(Mutex::new(std::io::stdout())))
        } else {
            let client = reqwest::Client::builder()
                .timeout(config.request_timeout)
                .build()
                .change_context(PublishError::Client)?;
            Transport::Http(client)
        };

        Ok(Self {
            endpoint,
            config,
            encoder: InfluxEncoder::new(),
            transport,
        })
    }

    /// Dry-run publisher writing requests to `sink` instead of the network.
    pub fn dry_run(endpoint: Endpoint, config: PublisherConfig, sink: DryRunSink) -> Self {
        Self {
            endpoint,
            config: PublisherConfig {
                dry_run: true,
                ..config
            },
            encoder: InfluxEncoder::new(),
            transport: Transport::DryRun(sink),
        }
    }

    /// Writes every point, batch by batch, stopping at the first batch that
    /// exhausts its attempts. Returns the number of batches written.
    pub async fn publish(&self, points: &[Point]) -> PublishResult<usize> {
        let url = self.endpoint.write_url();
        let batches = points.chunks(self.config.batch_size());
        let total = batches.len();

        tracing::info!(
            url = %self.endpoint.redacted_url(),
            points = points.len(),
            batches = total,
            dry_run = self.config.dry_run,
            "publishing points"
        );

        for (index, batch) in batches.enumerate() {
            let body = self.encoder.encode_batch(batch);
            self.send_with_retry(&url, body, index).await?;
            tracing::debug!(batch = index, size = batch.len(), "batch written");
        }

        Ok(total)
    }

    async fn send_with_retry(&self, url: &str, body: String, batch: usize) -> PublishResult<()> {
        let attempts = self.config.attempts();
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.transport.post(url, body.clone()).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    tracing::warn!(batch, attempt, attempts, "write failed: {e}");
                    last_error = Some(e);
                }
            }
        }

        let exhausted = PublishError::Exhausted { batch, attempts };
        Err(match last_error {
            Some(e) => e.change_context(exhausted),
            None => Report::new(exhausted),
        })
    }
}
