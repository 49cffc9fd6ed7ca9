//! Mailgrid: a batch email dispatch and scheduling engine. Given a list of
//! already-resolved recipients, a rendered body and an SMTP endpoint, it
//! delivers at bounded throughput with retries, rate limiting and resumable
//! progress, optionally deferred to a durable schedule.
//!
//! Ingestion (CSV/spreadsheet parsing), template rendering, filter-expression
//! parsing, CLI argument handling and webhook delivery are all out of scope
//! for this crate; see [`boundary`] for the typed seams those collaborators
//! plug into.

pub mod boundary;
pub mod dispatcher;
pub mod error;
pub mod offset;
pub mod pool;
pub mod rate_limiter;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod smtp_stub;

pub use boundary::{
    CampaignResult, DispatchConfig, Filter, MetricsSink, NullMetricsSink, Recipient, Render,
    SmtpConfig, TlsMode, WebhookError, WebhookSink,
};
pub use dispatcher::{Dispatcher, Outcome, Summary, Task};
pub use offset::OffsetTracker;
pub use pool::ConnectionPool;
pub use rate_limiter::{RateLimiter, WaitOutcome};
pub use scheduler::{Handler, Job, JobStatus, Recurrence, Scheduler};

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initializes a JSON-structured `tracing` subscriber, honoring `RUST_LOG`
/// and defaulting to `info` for this crate when unset.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Resolves once Ctrl+C or SIGTERM is received, or `token` is cancelled by
/// some other caller. Intended to be raced against a `Dispatcher::run` or
/// `Scheduler` loop via the shared `CancellationToken`.
pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    token.cancel();
}
