//! Typed contracts at the edge of the core: the shapes the ingester, template
//! engine, CLI and observability sinks hand to (or receive from) the
//! dispatch/scheduling engine. The core never parses CSVs, template syntax,
//! filter expressions or JSON config files itself — it only consumes and
//! produces the structures in this module.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single recipient produced by the (out-of-scope) ingestion step. `fields`
/// holds every column from the source row, keyed by lowercased header name;
/// `email` is the already-identified primary address column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub email: String,
    pub fields: HashMap<String, String>,
}

impl Recipient {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into().to_lowercase(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(&key.to_lowercase()).map(String::as_str)
    }
}

/// Applied to each `Recipient` before a `Task` is built for it. Filter
/// expression parsing lives outside the core; this is just the evaluated
/// predicate.
pub trait Filter: Send + Sync {
    fn accept(&self, recipient: &Recipient) -> bool;
}

impl<F> Filter for F
where
    F: Fn(&Recipient) -> bool + Send + Sync,
{
    fn accept(&self, recipient: &Recipient) -> bool {
        self(recipient)
    }
}

/// Renders a recipient's body. Template syntax and variable substitution are
/// out of scope for the core; this trait is the seam the template collaborator
/// plugs into.
pub trait Render: Send + Sync {
    fn render(&self, recipient: &Recipient) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// STARTTLS on a plaintext port (typically 587).
    Starttls,
    /// TLS applied immediately on connect (typically 465).
    Implicit,
    /// No TLS at all. Never used against a real relay; exists for local
    /// dev/test SMTP listeners that don't speak TLS.
    Plain,
}

/// Everything needed to dial and authenticate against the outbound SMTP
/// relay. Loading this from JSON/env is out of scope; the core only consumes
/// the constructed struct.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    pub tls: TlsMode,
    pub helo_name: Option<String>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Number of messages a single dialed session may carry before it is
    /// retired and redialed.
    pub max_messages_per_session: u32,
}

impl SmtpConfig {
    /// The tightest of the three timeouts, used to bound a single dial since
    /// `mail-send` exposes one timeout knob per connection.
    pub fn dial_timeout(&self) -> Duration {
        self.connect_timeout
            .min(self.read_timeout)
            .min(self.write_timeout)
    }
}

/// Parallelism, retry and rate-limit knobs for a single dispatch run.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Number of workers / pooled SMTP sessions.
    pub parallelism: usize,
    /// Retries granted to each task beyond its first attempt.
    pub retry_budget: u32,
    /// Base backoff for the retry pipeline.
    pub retry_base_backoff: Duration,
    /// Cap on a single retry's computed backoff.
    pub retry_max_backoff: Duration,
    pub rate_per_second: f64,
    pub burst: u32,
    /// Depth of the work queue feeding the worker pool, decoupled from
    /// `parallelism`: how many tasks may be read ahead of the workers
    /// actually dialing/sending. Floored at `parallelism` when used.
    pub batch_size: usize,
    /// Offset marks are flushed to disk after this many `mark_sent` calls.
    pub flush_every: usize,
    /// Path to the durable offset file.
    pub offset_path: std::path::PathBuf,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            retry_budget: 2,
            retry_base_backoff: Duration::from_millis(500),
            retry_max_backoff: Duration::from_secs(60),
            rate_per_second: 0.0,
            burst: 1,
            batch_size: 10,
            flush_every: 10,
            offset_path: std::path::PathBuf::from(".mailgrid_offset"),
        }
    }
}

/// Best-effort, non-blocking observability hooks. Implementations must not
/// perform network I/O inline — the metrics/observability sink itself is out
/// of scope for the core.
pub trait MetricsSink: Send + Sync {
    fn record_sent(&self, _dur: Duration) {}
    fn record_failed(&self, _err: &str) {}
    fn record_retry(&self, _err: &str) {}
    fn record_connection(&self, _ok: bool) {}
}

/// No-op sink used when the caller does not wire up metrics.
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {}

/// End-of-run summary mirrored to an external webhook. Building the JSON body
/// and POSTing it is the sink implementation's job (an HTTP client is out of
/// scope for the core); the core only assembles this record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignResult {
    pub job_id: uuid::Uuid,
    pub status: String,
    pub total_recipients: usize,
    pub successful_deliveries: usize,
    pub failed_deliveries: usize,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csv_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sheet_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_file: Option<String>,
    pub concurrent_workers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[async_trait::async_trait]
pub trait WebhookSink: Send + Sync {
    async fn send(&self, result: &CampaignResult) -> Result<(), WebhookError>;
}

#[derive(Debug, thiserror::Error)]
#[error("webhook delivery failed: {0}")]
pub struct WebhookError(pub String);
