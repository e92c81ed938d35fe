//! Metadata cache coordinating single-flight refresh and stale serving.

// crates.io
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use url::Url;
// self
use crate::{
	_prelude::*,
	cache::{
		entry::{CacheEntry, RefreshOutcome, RefreshReceiver},
		state::{CachedDocument, Freshness},
	},
	http::client::{DEFAULT_CONTENT_TYPE, UpstreamBody, UpstreamFetcher},
	metrics::{self, ResourceMetrics, ResourceMetricsSnapshot},
	resource::Resource,
	rewrite,
};

#[derive(Debug)]
struct ResourceSlot {
	entry: Mutex<CacheEntry>,
	metrics: ResourceMetrics,
}
impl ResourceSlot {
	fn new(resource: Resource) -> Self {
		Self { entry: Mutex::new(CacheEntry::new(resource)), metrics: ResourceMetrics::default() }
	}
}

#[derive(Debug)]
struct CacheInner {
	fetcher: UpstreamFetcher,
	issuer: Url,
	ttl: Duration,
	discovery: ResourceSlot,
	jwks: ResourceSlot,
}

/// Holds the rewritten issuer documents and keeps them fresh.
///
/// At most one upstream fetch runs per resource. The fetch runs on its own task and publishes
/// its outcome to every waiting caller, so a caller going away never cancels it. Entry locks are
/// only held for bookkeeping, never across the network call.
#[derive(Clone, Debug)]
pub struct MetadataCache {
	inner: Arc<CacheInner>,
}
impl MetadataCache {
	/// Build a cache fetching through `fetcher` and re-anchoring the discovery document at
	/// `issuer`.
	pub fn new(fetcher: UpstreamFetcher, issuer: Url, ttl: Duration) -> Self {
		Self {
			inner: Arc::new(CacheInner {
				fetcher,
				issuer,
				ttl,
				discovery: ResourceSlot::new(Resource::Discovery),
				jwks: ResourceSlot::new(Resource::Jwks),
			}),
		}
	}

	/// Freshness window applied to each successful fetch.
	pub fn ttl(&self) -> Duration {
		self.inner.ttl
	}

	/// Return the best available copy of `resource`.
	///
	/// A fresh copy is returned without touching the network. Otherwise the caller joins (or
	/// starts) the resource's refresh. When that refresh fails transiently and a stale copy
	/// exists, the stale copy is returned and left stale so the next call retries.
	pub async fn get(&self, resource: Resource) -> Result<Arc<CachedDocument>> {
		let slot = self.slot(resource);
		let (stale, receiver) = {
			let mut entry = slot.entry.lock();

			if let Some(document) = entry.fresh(Instant::now()) {
				self.observe_hit(resource, false);

				return Ok(document);
			}

			(entry.document(), self.join_or_start(resource, &mut entry))
		};

		match self.wait(resource, receiver).await {
			Ok(document) => {
				self.observe_miss(resource);

				Ok(document)
			},
			Err(err) => match stale {
				Some(document) if err.allows_stale() => {
					tracing::warn!(
						resource = %resource,
						error = %err,
						fetched_at = %document.fetched_at,
						"refresh failed, serving stale document"
					);

					self.observe_hit(resource, true);

					Ok(document)
				},
				_ => {
					self.observe_miss(resource);

					Err(err)
				},
			},
		}
	}

	/// Repopulate `resource` regardless of freshness.
	///
	/// Joins a refresh that is already running. Failures are returned as-is, without stale
	/// fallback.
	pub async fn refresh(&self, resource: Resource) -> Result<Arc<CachedDocument>> {
		let receiver = {
			let mut entry = self.slot(resource).entry.lock();

			self.join_or_start(resource, &mut entry)
		};

		self.wait(resource, receiver).await
	}

	/// Fetch both resources concurrently, logging rather than returning failures.
	pub async fn prime(&self) {
		let (discovery, jwks) =
			tokio::join!(self.refresh(Resource::Discovery), self.refresh(Resource::Jwks));

		for (resource, outcome) in [(Resource::Discovery, discovery), (Resource::Jwks, jwks)] {
			match outcome {
				Ok(document) => tracing::info!(
					resource = %resource,
					bytes = document.payload.len(),
					"primed issuer document"
				),
				Err(err) => tracing::warn!(
					resource = %resource,
					error = %err,
					"failed to prime issuer document; will retry on demand"
				),
			}
		}
	}

	/// Whether both resources have been fetched and neither last attempt hard-failed.
	pub fn is_ready(&self) -> bool {
		Resource::ALL.into_iter().all(|resource| self.slot(resource).entry.lock().is_ready())
	}

	/// Capture the current state of `resource` for status reporting.
	pub fn status(&self, resource: Resource) -> ResourceStatus {
		let slot = self.slot(resource);
		let now = Instant::now();
		let entry = slot.entry.lock();
		let document = entry.document();
		let refresh = entry.refresh_state();

		ResourceStatus {
			resource,
			freshness: entry.freshness(now),
			fetched_at: document.as_ref().map(|document| document.fetched_at),
			remaining_ttl: document
				.as_ref()
				.map(|document| document.remaining_ttl(now))
				.unwrap_or_default(),
			refreshing: refresh.in_flight.is_some(),
			last_known_good: document.is_some() && refresh.error_count == 0,
			last_attempt_at: refresh.last_attempt_at,
			hard_failed: refresh.hard_failed,
			error_count: refresh.error_count,
			last_error: refresh.last_error,
			metrics: slot.metrics.snapshot(),
		}
	}

	/// Status of every resource.
	pub fn statuses(&self) -> Vec<ResourceStatus> {
		Resource::ALL.into_iter().map(|resource| self.status(resource)).collect()
	}

	fn slot(&self, resource: Resource) -> &ResourceSlot {
		match resource {
			Resource::Discovery => &self.inner.discovery,
			Resource::Jwks => &self.inner.jwks,
		}
	}

	fn join_or_start(&self, resource: Resource, entry: &mut CacheEntry) -> RefreshReceiver {
		if let Some(receiver) = entry.in_flight() {
			tracing::debug!(resource = %resource, "joining in-flight refresh");

			return receiver;
		}

		let (sender, receiver) = watch::channel(None);
		let cache = self.clone();

		entry.begin_refresh(receiver.clone());

		tokio::spawn(async move {
			let outcome = cache.run_refresh(resource).await;

			// Nobody listening is fine; the outcome is already committed to the entry.
			let _ = sender.send(Some(outcome));
		});

		receiver
	}

	async fn wait(&self, resource: Resource, mut receiver: RefreshReceiver) -> RefreshOutcome {
		let settled = match receiver.wait_for(Option::is_some).await {
			Ok(outcome) => outcome.clone(),
			Err(_) => None,
		};

		match settled {
			Some(outcome) => outcome,
			None => {
				self.slot(resource).entry.lock().abandon_refresh(&receiver);

				Err(Error::UpstreamUnreachable {
					url: resource.path().into(),
					reason: "Refresh task ended without an outcome.".into(),
				})
			},
		}
	}

	#[tracing::instrument(skip(self), fields(resource = %resource))]
	async fn run_refresh(&self, resource: Resource) -> RefreshOutcome {
		let started = Instant::now();
		let result = self.fetch_document(resource).await;
		let slot = self.slot(resource);

		match result {
			Ok(document) => {
				let document = Arc::new(document);

				slot.entry.lock().refresh_success(document.clone());
				self.observe_refresh_success(resource, started.elapsed());

				tracing::debug!(
					bytes = document.payload.len(),
					ttl = ?self.inner.ttl,
					"refreshed issuer document"
				);

				Ok(document)
			},
			Err(err) => {
				let hard_failed = {
					let mut entry = slot.entry.lock();

					entry.refresh_failure(&err);
					entry.refresh_state().hard_failed
				};

				self.observe_refresh_error(resource, &err);

				if hard_failed {
					tracing::error!(error = %err, "refresh failed with no usable fallback");
				} else {
					tracing::warn!(error = %err, "refresh failed; stale copy retained");
				}

				Err(err)
			},
		}
	}

	async fn fetch_document(&self, resource: Resource) -> Result<CachedDocument> {
		let fetch = self.inner.fetcher.fetch(resource).await?;

		tracing::debug!(url = %fetch.url, elapsed = ?fetch.elapsed, "fetched upstream document");

		let (payload, content_type) = match fetch.body {
			UpstreamBody::Document(document) => {
				let rewritten = rewrite::rewrite_discovery(&document, &self.inner.issuer)?;
				let payload = serde_json::to_vec_pretty(&rewritten)
					.map_err(|err| Error::RewriteError(err.to_string()))?;

				(Bytes::from(payload), DEFAULT_CONTENT_TYPE.to_owned())
			},
			UpstreamBody::Opaque(bytes) => (bytes, fetch.content_type),
		};

		Ok(CachedDocument::new(payload, content_type, Instant::now(), self.inner.ttl))
	}

	fn observe_hit(&self, resource: Resource, stale: bool) {
		metrics::record_resolve_hit(resource, stale);

		self.slot(resource).metrics.record_hit(stale);
	}

	fn observe_miss(&self, resource: Resource) {
		metrics::record_resolve_miss(resource);

		self.slot(resource).metrics.record_miss();
	}

	fn observe_refresh_success(&self, resource: Resource, duration: Duration) {
		metrics::record_refresh_success(resource, duration);

		self.slot(resource).metrics.record_refresh_success(duration);
	}

	fn observe_refresh_error(&self, resource: Resource, err: &Error) {
		metrics::record_refresh_error(resource, err.kind());

		self.slot(resource).metrics.record_refresh_error();
	}
}

/// Snapshot of a resource's cache state.
#[derive(Clone, Debug)]
pub struct ResourceStatus {
	/// Resource described.
	pub resource: Resource,
	/// Freshness at capture time.
	pub freshness: Freshness,
	/// When the cached copy was fetched.
	pub fetched_at: Option<DateTime<Utc>>,
	/// Freshness left on the cached copy.
	pub remaining_ttl: Duration,
	/// Whether a refresh is running.
	pub refreshing: bool,
	/// Whether the held copy came from the most recent attempt, i.e. no refresh has failed
	/// since it was stored.
	pub last_known_good: bool,
	/// When the last refresh settled.
	pub last_attempt_at: Option<DateTime<Utc>>,
	/// Whether the last refresh surfaced an error to callers.
	pub hard_failed: bool,
	/// Consecutive failed refreshes.
	pub error_count: u32,
	/// Kind of the last failure.
	pub last_error: Option<&'static str>,
	/// Lookup and refresh counters.
	pub metrics: ResourceMetricsSnapshot,
}
