//! Prometheus metrics for the store, locks, projections and commands.
//!
//! Components record through the small recorder types below so metric names
//! live in one place. [`MetricsServer`] installs the Prometheus recorder and
//! renders the scrape output.
//!
//! # Example
//!
//! ```rust,no_run
//! use eventide_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! let body = server.render();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics setup.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build the exporter.
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install the exporter.
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder handle for scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server for `addr`; nothing is installed yet.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Address the scrape endpoint is served on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// A recorder that is already installed (several servers in one test
    /// binary) is tolerated with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                register_metrics();
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(msg))
                }
            }
        }
    }

    /// Recorder handle, if this server installed it.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render the current metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!("eventide_events_appended_total", "Events committed to the event store");
    describe_counter!(
        "eventide_append_conflicts_total",
        "Appends rejected because an expected sequence was stale"
    );
    describe_histogram!("eventide_append_duration_seconds", "Time taken to commit an append batch");

    describe_counter!("eventide_lock_acquired_total", "Leases acquired");
    describe_counter!("eventide_lock_held_total", "Acquire attempts rejected because another owner holds the lease");
    describe_counter!("eventide_lock_renewed_total", "Leases renewed");
    describe_counter!("eventide_lock_lost_total", "Leases lost to another owner");
    describe_counter!("eventide_lock_expired_total", "Leases that lapsed without renewal");

    describe_counter!("eventide_projection_batches_total", "Projection batches committed");
    describe_counter!("eventide_projection_events_total", "Events applied to views");
    describe_counter!("eventide_projection_skipped_total", "Undecodable events skipped by views");
    describe_counter!("eventide_projection_dead_lettered_total", "Undecodable events sent to the dead-letter queue");
    describe_counter!(
        "eventide_projection_checkpoint_moved_total",
        "Batches discarded because the checkpoint moved"
    );
    describe_histogram!("eventide_projection_batch_duration_seconds", "Time taken to process one batch");

    describe_counter!("eventide_commands_committed_total", "Commands that appended events");
    describe_counter!("eventide_commands_unchanged_total", "Commands that found nothing to change");
    describe_counter!("eventide_command_conflict_retries_total", "Command retries after a concurrency conflict");
}

fn count(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

/// Event store recorder.
pub struct StoreMetrics;

impl StoreMetrics {
    /// Record a committed append.
    pub fn record_append(events: usize, duration: Duration) {
        counter!("eventide_events_appended_total").increment(count(events));
        histogram!("eventide_append_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an append rejected by a concurrency conflict.
    pub fn record_conflict() {
        counter!("eventide_append_conflicts_total").increment(1);
    }
}

/// Lease recorder.
pub struct LockMetrics;

impl LockMetrics {
    /// Lease acquired.
    pub fn record_acquired() {
        counter!("eventide_lock_acquired_total").increment(1);
    }

    /// Acquire rejected, another owner holds the lease.
    pub fn record_held() {
        counter!("eventide_lock_held_total").increment(1);
    }

    /// Lease renewed.
    pub fn record_renewed() {
        counter!("eventide_lock_renewed_total").increment(1);
    }

    /// Lease lost.
    pub fn record_lost() {
        counter!("eventide_lock_lost_total").increment(1);
    }

    /// Lease lapsed.
    pub fn record_expired() {
        counter!("eventide_lock_expired_total").increment(1);
    }
}

/// Projection runner recorder; every metric is labelled with the view.
pub struct ProjectionMetrics;

impl ProjectionMetrics {
    /// Record a committed batch.
    pub fn record_batch(view: &str, events: usize, duration: Duration) {
        counter!("eventide_projection_batches_total", "view" => view.to_string()).increment(1);
        counter!("eventide_projection_events_total", "view" => view.to_string()).increment(count(events));
        histogram!("eventide_projection_batch_duration_seconds", "view" => view.to_string())
            .record(duration.as_secs_f64());
    }

    /// Record a skipped event.
    pub fn record_skipped(view: &str) {
        counter!("eventide_projection_skipped_total", "view" => view.to_string()).increment(1);
    }

    /// Record a dead-lettered event.
    pub fn record_dead_lettered(view: &str) {
        counter!("eventide_projection_dead_lettered_total", "view" => view.to_string()).increment(1);
    }

    /// Record a discarded batch.
    pub fn record_checkpoint_moved(view: &str) {
        counter!("eventide_projection_checkpoint_moved_total", "view" => view.to_string()).increment(1);
    }
}

/// Command executor recorder.
pub struct CommandMetrics;

impl CommandMetrics {
    /// Command appended events.
    pub fn record_committed() {
        counter!("eventide_commands_committed_total").increment(1);
    }

    /// Command had nothing to do.
    pub fn record_unchanged() {
        counter!("eventide_commands_unchanged_total").increment(1);
    }

    /// Command is retried after a conflict.
    pub fn record_conflict_retry() {
        counter!("eventide_command_conflict_retries_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn server_starts_without_handle() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn recorded_metrics_are_rendered() {
        let mut server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        server.start().unwrap();

        StoreMetrics::record_append(3, Duration::from_millis(5));
        LockMetrics::record_acquired();
        ProjectionMetrics::record_batch("users", 2, Duration::from_millis(1));

        // Another test may own the global recorder.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("eventide_events_appended_total"));
            assert!(rendered.contains("eventide_lock_acquired_total"));
            assert!(rendered.contains("eventide_projection_batches_total"));
        }
    }
}
