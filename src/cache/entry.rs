//! Per-resource cache entry and refresh bookkeeping.

// crates.io
use tokio::sync::watch;
// self
use crate::{
	_prelude::*,
	cache::state::{CachedDocument, Freshness},
	resource::Resource,
};

/// Outcome shared by every caller waiting on one refresh.
pub type RefreshOutcome = Result<Arc<CachedDocument>>;

/// Receiving half of an in-flight refresh; `None` until the refresh settles.
pub type RefreshReceiver = watch::Receiver<Option<RefreshOutcome>>;

/// Refresh coordination state for one resource.
#[derive(Debug, Default)]
pub struct RefreshState {
	/// Present while a refresh is running; callers clone it to await the outcome.
	pub in_flight: Option<RefreshReceiver>,
	/// UTC timestamp of the most recently settled attempt.
	pub last_attempt_at: Option<DateTime<Utc>>,
	/// Whether the most recent attempt surfaced an error to callers.
	pub hard_failed: bool,
	/// Count of consecutive failed attempts.
	pub error_count: u32,
	/// Error kind of the most recent failure, cleared on success.
	pub last_error: Option<&'static str>,
}

/// Cached document plus refresh bookkeeping for a resource.
#[derive(Debug)]
pub struct CacheEntry {
	resource: Resource,
	document: Option<Arc<CachedDocument>>,
	refresh: RefreshState,
}
impl CacheEntry {
	/// Create a new empty cache entry.
	pub fn new(resource: Resource) -> Self {
		Self { resource, document: None, refresh: RefreshState::default() }
	}

	/// Resource tracked by this entry.
	pub fn resource(&self) -> Resource {
		self.resource
	}

	/// Current document, fresh or stale.
	pub fn document(&self) -> Option<Arc<CachedDocument>> {
		self.document.clone()
	}

	/// Current document when still inside its TTL.
	pub fn fresh(&self, now: Instant) -> Option<Arc<CachedDocument>> {
		self.document.as_ref().filter(|document| !document.is_expired(now)).cloned()
	}

	/// Freshness classification at `now`.
	pub fn freshness(&self, now: Instant) -> Freshness {
		Freshness::of(self.document.as_deref(), now)
	}

	/// Refresh bookkeeping.
	pub fn refresh_state(&self) -> &RefreshState {
		&self.refresh
	}

	/// Receiver of the running refresh, if any.
	pub fn in_flight(&self) -> Option<RefreshReceiver> {
		self.refresh.in_flight.clone()
	}

	/// Mark a refresh as running.
	pub fn begin_refresh(&mut self, receiver: RefreshReceiver) {
		self.refresh.in_flight = Some(receiver);
	}

	/// Drop the in-flight marker if it still refers to `receiver`'s channel.
	///
	/// Returns whether the marker was cleared.
	pub fn abandon_refresh(&mut self, receiver: &RefreshReceiver) -> bool {
		match &self.refresh.in_flight {
			Some(current) if current.same_channel(receiver) => {
				self.refresh.in_flight = None;

				true
			},
			_ => false,
		}
	}

	/// Store a new document and clear failure bookkeeping.
	pub fn refresh_success(&mut self, document: Arc<CachedDocument>) {
		self.document = Some(document);
		self.refresh.in_flight = None;
		self.refresh.last_attempt_at = Some(Utc::now());
		self.refresh.hard_failed = false;
		self.refresh.error_count = 0;
		self.refresh.last_error = None;
	}

	/// Record a failed refresh, keeping any stale copy in place.
	///
	/// The failure is hard when callers cannot be given a stale copy instead.
	pub fn refresh_failure(&mut self, error: &Error) {
		self.refresh.in_flight = None;
		self.refresh.last_attempt_at = Some(Utc::now());
		self.refresh.hard_failed = !(error.allows_stale() && self.document.is_some());
		self.refresh.error_count = self.refresh.error_count.saturating_add(1);
		self.refresh.last_error = Some(error.kind());
	}

	/// Whether this resource can currently report ready.
	pub fn is_ready(&self) -> bool {
		self.document.is_some() && !self.refresh.hard_failed
	}
}
