//! Cached document and freshness classification.

// crates.io
use bytes::Bytes;
// self
use crate::_prelude::*;

/// A served copy of an issuer document.
#[derive(Clone, Debug)]
pub struct CachedDocument {
	/// Bytes returned to relying parties.
	pub payload: Bytes,
	/// Content type returned alongside the payload.
	pub content_type: String,
	/// UTC timestamp when the payload was fetched.
	pub fetched_at: DateTime<Utc>,
	/// Monotonic instant the payload was stored.
	pub stored_at: Instant,
	/// Freshness window measured from `stored_at`.
	pub ttl: Duration,
}
impl CachedDocument {
	/// Wrap a freshly fetched payload valid for `ttl` from `now`.
	pub fn new(
		payload: Bytes,
		content_type: impl Into<String>,
		now: Instant,
		ttl: Duration,
	) -> Self {
		Self {
			payload,
			content_type: content_type.into(),
			fetched_at: Utc::now(),
			stored_at: now,
			ttl,
		}
	}

	/// Time since the payload was stored.
	pub fn age(&self, now: Instant) -> Duration {
		now.saturating_duration_since(self.stored_at)
	}

	/// Whether the payload has exceeded its freshness window.
	pub fn is_expired(&self, now: Instant) -> bool {
		self.age(now) >= self.ttl
	}

	/// Freshness left at `now`, zero once stale.
	pub fn remaining_ttl(&self, now: Instant) -> Duration {
		self.ttl.saturating_sub(self.age(now))
	}
}

/// Freshness classification of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum Freshness {
	/// Never fetched successfully.
	Empty,
	/// Cached and within its TTL.
	Fresh,
	/// Cached but past its TTL; still served when refresh fails.
	Stale,
}
impl Freshness {
	/// Classify an optional cached document at `now`.
	pub fn of(document: Option<&CachedDocument>, now: Instant) -> Self {
		match document {
			None => Self::Empty,
			Some(document) if document.is_expired(now) => Self::Stale,
			Some(_) => Self::Fresh,
		}
	}
}
