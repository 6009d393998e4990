//! Lightweight metrics collection with Prometheus text exposition, health and
//! display-state endpoints.
//!
//! No external metrics crate -- atomic counters rendered directly as
//! Prometheus text format. Decode latency uses microsecond buckets, strategy
//! latency uses second-range buckets since it is dominated by the model call.

use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::time::{Duration, Instant};

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::presentation::{PresentationReader, PresentationView};
use crate::types::{SOURCE_COUNT, SourceId};

// ---------------------------------------------------------------------------
// Prometheus histogram
// ---------------------------------------------------------------------------

/// Upper bound in nanoseconds + Prometheus `le` label.
type Bucket = (u64, &'static str);

/// 1-2-5 progression from 1μs to 10ms.
pub const DECODE_BUCKETS: &[Bucket] = &[
    (1_000, "0.000001"),
    (2_000, "0.000002"),
    (5_000, "0.000005"),
    (10_000, "0.00001"),
    (25_000, "0.000025"),
    (50_000, "0.00005"),
    (100_000, "0.0001"),
    (250_000, "0.00025"),
    (500_000, "0.0005"),
    (1_000_000, "0.001"),
    (5_000_000, "0.005"),
    (10_000_000, "0.01"),
];

/// 50ms to 30s.
pub const STRATEGY_BUCKETS: &[Bucket] = &[
    (50_000_000, "0.05"),
    (100_000_000, "0.1"),
    (250_000_000, "0.25"),
    (500_000_000, "0.5"),
    (1_000_000_000, "1"),
    (2_500_000_000, "2.5"),
    (5_000_000_000, "5"),
    (10_000_000_000, "10"),
    (30_000_000_000, "30"),
];

pub struct PromHistogram {
    bounds: &'static [Bucket],
    /// Cumulative bucket counters. Index i counts observations <= `bounds[i]`.
    buckets: Vec<AtomicU64>,
    sum_ns: AtomicU64,
    count: AtomicU64,
}

impl PromHistogram {
    #[must_use]
    pub fn new(bounds: &'static [Bucket]) -> Self {
        Self {
            bounds,
            buckets: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_ns: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a duration observation. Increments all cumulative buckets
    /// whose upper bound >= the observed value.
    pub fn record(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);

        if let Some(first) = self.bounds.iter().position(|&(bound, _)| nanos <= bound) {
            for bucket in &self.buckets[first..] {
                bucket.fetch_add(1, Relaxed);
            }
        }

        self.sum_ns.fetch_add(nanos, Relaxed);
        self.count.fetch_add(1, Relaxed);
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Relaxed)
    }

    /// Render as Prometheus histogram lines. `labels` is empty or e.g. `source="overtake"`.
    fn render(&self, name: &str, labels: &str, out: &mut String) {
        let sep = if labels.is_empty() { "" } else { "," };
        for (i, &(_, le)) in self.bounds.iter().enumerate() {
            let count = self.buckets[i].load(Relaxed);
            let _ = writeln!(out, "{name}_bucket{{{labels}{sep}le=\"{le}\"}} {count}");
        }

        let total = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{{labels}{sep}le=\"+Inf\"}} {total}");

        #[allow(clippy::cast_precision_loss)]
        let sum_secs = self.sum_ns.load(Relaxed) as f64 / 1_000_000_000.0;
        if labels.is_empty() {
            let _ = writeln!(out, "{name}_sum {sum_secs}");
            let _ = writeln!(out, "{name}_count {total}");
        } else {
            let _ = writeln!(out, "{name}_sum{{{labels}}} {sum_secs}");
            let _ = writeln!(out, "{name}_count{{{labels}}} {total}");
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Per-source counters, shared with that source's connection task.
pub struct SourceMetrics {
    pub source: SourceId,
    pub messages: AtomicU64,
    pub errors: AtomicU64,
    pub reconnections: AtomicU64,
    pub connected: AtomicBool,
    pub decode_latency: PromHistogram,
}

impl SourceMetrics {
    #[must_use]
    pub fn new(source: SourceId) -> Self {
        Self {
            source,
            messages: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            reconnections: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            decode_latency: PromHistogram::new(DECODE_BUCKETS),
        }
    }
}

pub struct Metrics {
    sources: [Arc<SourceMetrics>; SOURCE_COUNT],

    pub ingests: AtomicU64,
    pub ordering_anomalies: AtomicU64,
    pub cache_errors: AtomicU64,
    pub triggers: AtomicU64,
    pub strategy_ok: AtomicU64,
    pub strategy_failures: AtomicU64,
    pub strategy_discarded: AtomicU64,

    start_time: Instant,
    pub strategy_latency: PromHistogram,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            sources: SourceId::ALL.map(|s| Arc::new(SourceMetrics::new(s))),
            ingests: AtomicU64::new(0),
            ordering_anomalies: AtomicU64::new(0),
            cache_errors: AtomicU64::new(0),
            triggers: AtomicU64::new(0),
            strategy_ok: AtomicU64::new(0),
            strategy_failures: AtomicU64::new(0),
            strategy_discarded: AtomicU64::new(0),
            start_time: Instant::now(),
            strategy_latency: PromHistogram::new(STRATEGY_BUCKETS),
        }
    }
}

impl Metrics {
    /// Handle for one source's connection task.
    #[must_use]
    pub fn source(&self, source: SourceId) -> Arc<SourceMetrics> {
        Arc::clone(&self.sources[source.index()])
    }

    fn connected_count(&self) -> usize {
        self.sources
            .iter()
            .filter(|s| s.connected.load(Relaxed))
            .count()
    }

    /// Render all metrics in Prometheus text exposition format.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let mut out = String::with_capacity(4096);

        // -- Per-source --
        let per_source: [(&str, &str, &str, fn(&SourceMetrics) -> u64); 4] = [
            ("race_messages_total", "counter", "Snapshots decoded and forwarded", |s| s.messages.load(Relaxed)),
            ("race_errors_total", "counter", "Decode/connection errors", |s| s.errors.load(Relaxed)),
            ("race_reconnections_total", "counter", "Stream reconnection attempts", |s| s.reconnections.load(Relaxed)),
            ("race_source_up", "gauge", "Stream connection status (1=connected)", |s| u64::from(s.connected.load(Relaxed))),
        ];
        for (name, kind, help, value) in per_source {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} {kind}");
            for s in &self.sources {
                let _ = writeln!(out, "{name}{{source=\"{}\"}} {}", s.source, value(s));
            }
        }

        // -- Aggregator --
        let globals = [
            ("race_ingests_total", "Snapshots ingested by the aggregator", &self.ingests),
            ("race_ordering_anomalies_total", "Revision regressions observed", &self.ordering_anomalies),
            ("race_cache_errors_total", "Latest-value cache write failures", &self.cache_errors),
            ("race_triggers_total", "Strategy computations dispatched", &self.triggers),
            ("race_strategy_ok_total", "Successful strategy computations", &self.strategy_ok),
            ("race_strategy_failures_total", "Failed strategy computations", &self.strategy_failures),
            ("race_strategy_discarded_total", "Strategy results discarded (stale or shutdown)", &self.strategy_discarded),
        ];
        for (name, help, counter) in globals {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {}", counter.load(Relaxed));
        }

        let _ = writeln!(out, "# HELP race_uptime_seconds Seconds since process start");
        let _ = writeln!(out, "# TYPE race_uptime_seconds gauge");
        let _ = writeln!(out, "race_uptime_seconds {}", self.start_time.elapsed().as_secs());

        // -- Histograms --
        let _ = writeln!(out, "# HELP race_decode_duration_seconds Stream message decode latency");
        let _ = writeln!(out, "# TYPE race_decode_duration_seconds histogram");
        for s in &self.sources {
            let labels = format!("source=\"{}\"", s.source);
            s.decode_latency.render("race_decode_duration_seconds", &labels, &mut out);
        }

        let _ = writeln!(out, "# HELP race_strategy_duration_seconds Strategy request latency");
        let _ = writeln!(out, "# TYPE race_strategy_duration_seconds histogram");
        self.strategy_latency.render("race_strategy_duration_seconds", "", &mut out);

        out
    }
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct AppState {
    metrics: Arc<Metrics>,
    presentation: PresentationReader,
}

/// Routes for `/health`, `/metrics` and the display read endpoint `/api/state`.
pub fn router(metrics: Arc<Metrics>, presentation: PresentationReader) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prom_metrics))
        .route("/api/state", get(state_view))
        .with_state(AppState {
            metrics,
            presentation,
        })
}

/// Serve [`router`] on an already-bound listener until cancelled.
pub async fn serve_http(
    listener: tokio::net::TcpListener,
    metrics: Arc<Metrics>,
    presentation: PresentationReader,
    cancel: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "metrics/health HTTP server listening");
    }

    axum::serve(listener, router(metrics, presentation))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .ok();
}

async fn health(State(app): State<AppState>) -> (StatusCode, &'static str) {
    match app.metrics.connected_count() {
        SOURCE_COUNT => (StatusCode::OK, "OK\n"),
        0 => (StatusCode::SERVICE_UNAVAILABLE, "DOWN\n"),
        _ => (StatusCode::OK, "DEGRADED\n"),
    }
}

async fn prom_metrics(State(app): State<AppState>) -> String {
    app.metrics.to_prometheus()
}

async fn state_view(State(app): State<AppState>) -> Json<PresentationView> {
    Json(app.presentation.view())
}
