//! Metrics helpers and per-resource telemetry bookkeeping.

// std
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "prometheus")] use std::sync::OnceLock;
// crates.io
use metrics::Label;
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use smallvec::SmallVec;
// self
use crate::{_prelude::*, resource::Resource};

type LabelSet = SmallVec<[Label; 2]>;

const METRIC_REQUESTS_TOTAL: &str = "oidc_reflector_requests_total";
const METRIC_HITS_TOTAL: &str = "oidc_reflector_cache_hits_total";
const METRIC_STALE_TOTAL: &str = "oidc_reflector_stale_total";
const METRIC_MISSES_TOTAL: &str = "oidc_reflector_misses_total";
const METRIC_REFRESH_TOTAL: &str = "oidc_reflector_refresh_total";
const METRIC_REFRESH_DURATION: &str = "oidc_reflector_refresh_duration_seconds";
const METRIC_REJECTIONS_TOTAL: &str = "oidc_reflector_rejections_total";

/// Shared Prometheus handle installed by [`install_default_exporter`].
#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Thread-safe metrics accumulator for a single resource.
#[derive(Debug, Default)]
pub struct ResourceMetrics {
	total_requests: AtomicU64,
	cache_hits: AtomicU64,
	stale_serves: AtomicU64,
	refresh_successes: AtomicU64,
	refresh_errors: AtomicU64,
	last_refresh_micros: AtomicU64,
}
impl ResourceMetrics {
	/// Record a hit outcome.
	pub fn record_hit(&self, stale: bool) {
		self.total_requests.fetch_add(1, Ordering::Relaxed);
		self.cache_hits.fetch_add(1, Ordering::Relaxed);

		if stale {
			self.stale_serves.fetch_add(1, Ordering::Relaxed);
		}
	}

	/// Record a miss outcome.
	pub fn record_miss(&self) {
		self.total_requests.fetch_add(1, Ordering::Relaxed);
	}

	/// Record a successful refresh and latency.
	pub fn record_refresh_success(&self, duration: Duration) {
		self.refresh_successes.fetch_add(1, Ordering::Relaxed);
		self.last_refresh_micros.store(duration.as_micros() as u64, Ordering::Relaxed);
	}

	/// Record refresh failure.
	pub fn record_refresh_error(&self) {
		self.refresh_errors.fetch_add(1, Ordering::Relaxed);
	}

	/// Take a point-in-time snapshot for status reporting.
	pub fn snapshot(&self) -> ResourceMetricsSnapshot {
		ResourceMetricsSnapshot {
			total_requests: self.total_requests.load(Ordering::Relaxed),
			cache_hits: self.cache_hits.load(Ordering::Relaxed),
			stale_serves: self.stale_serves.load(Ordering::Relaxed),
			refresh_successes: self.refresh_successes.load(Ordering::Relaxed),
			refresh_errors: self.refresh_errors.load(Ordering::Relaxed),
			last_refresh_micros: match self.last_refresh_micros.load(Ordering::Relaxed) {
				0 => None,
				value => Some(value),
			},
		}
	}
}

/// Read-only snapshot of per-resource telemetry counters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceMetricsSnapshot {
	/// Total number of cache lookups observed.
	pub total_requests: u64,
	/// Count of lookups served from the cache.
	pub cache_hits: u64,
	/// Count of lookups served from stale payloads.
	pub stale_serves: u64,
	/// Count of successful refresh operations.
	pub refresh_successes: u64,
	/// Count of refresh attempts that resulted in errors.
	pub refresh_errors: u64,
	/// Microsecond latency of the most recent refresh.
	pub last_refresh_micros: Option<u64>,
}
impl ResourceMetricsSnapshot {
	/// Convenience method to compute the cache hit rate.
	pub fn hit_rate(&self) -> f64 {
		if self.total_requests == 0 {
			0.0
		} else {
			self.cache_hits as f64 / self.total_requests as f64
		}
	}
}

/// Install the default Prometheus recorder backed by `metrics`.
///
/// Multiple invocations are safe; subsequent calls become no-ops once the recorder is installed.
#[cfg(feature = "prometheus")]
pub fn install_default_exporter() -> Result<()> {
	if PROMETHEUS_HANDLE.get().is_some() {
		return Ok(());
	}

	let handle = PrometheusBuilder::new()
		.install_recorder()
		.map_err(|err| Error::Metrics(err.to_string()))?;
	let _ = PROMETHEUS_HANDLE.set(handle);

	Ok(())
}

/// Access the global Prometheus exporter handle when installed.
#[cfg(feature = "prometheus")]
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
	PROMETHEUS_HANDLE.get()
}

/// Record a cache hit, tagging whether it was served stale.
pub fn record_resolve_hit(resource: Resource, stale: bool) {
	let labels = resource_labels(resource);

	metrics::counter!(METRIC_REQUESTS_TOTAL, labels.iter()).increment(1);
	metrics::counter!(METRIC_HITS_TOTAL, labels.iter()).increment(1);

	if stale {
		metrics::counter!(METRIC_STALE_TOTAL, labels.iter()).increment(1);
	}
}

/// Record a lookup that had to wait for an upstream fetch.
pub fn record_resolve_miss(resource: Resource) {
	let labels = resource_labels(resource);

	metrics::counter!(METRIC_REQUESTS_TOTAL, labels.iter()).increment(1);
	metrics::counter!(METRIC_MISSES_TOTAL, labels.iter()).increment(1);
}

/// Record a successful refresh along with its latency.
pub fn record_refresh_success(resource: Resource, duration: Duration) {
	metrics::counter!(METRIC_REFRESH_TOTAL, status_labels(resource, "success").iter())
		.increment(1);
	metrics::histogram!(METRIC_REFRESH_DURATION, resource_labels(resource).iter())
		.record(duration.as_secs_f64());
}

/// Record a failed refresh, labelled with the error kind.
pub fn record_refresh_error(resource: Resource, kind: &'static str) {
	metrics::counter!(METRIC_REFRESH_TOTAL, status_labels(resource, kind).iter()).increment(1);
}

/// Record a request turned away by the access gate or the rate limiter.
pub fn record_rejection(reason: &'static str) {
	metrics::counter!(METRIC_REJECTIONS_TOTAL, "reason" => reason).increment(1);
}

fn resource_labels(resource: Resource) -> LabelSet {
	let mut labels = LabelSet::new();

	labels.push(Label::new("resource", resource.as_str()));

	labels
}

fn status_labels(resource: Resource, status: &'static str) -> LabelSet {
	let mut labels = resource_labels(resource);

	labels.push(Label::new("status", status));

	labels
}
