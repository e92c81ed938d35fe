//! Per-client fixed-window rate limiting.
//!
//! Each client key owns a bucket counting requests inside the current window. A burst straddling
//! a window boundary can admit up to twice the limit; the scheme keeps O(1) state per client.

// std
use std::{
	collections::HashMap,
	fmt::{Display, Formatter, Result as FmtResult},
	str::FromStr,
};
// crates.io
use parking_lot::Mutex;
// self
use crate::_prelude::*;

/// Default limit applied when none is configured.
pub const DEFAULT_RATE_LIMIT: &str = "10 per second";
/// Buckets whose window closed more than this many windows ago are evicted.
pub const EVICTION_WINDOWS: u32 = 4;
/// Longest accepted window.
pub const MAX_RATE_WINDOW: Duration = Duration::from_secs(60 * 60 * 24 * 31);

/// Rate expressed as `limit` requests per `window`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateSpec {
	/// Requests admitted per window.
	pub limit: u32,
	/// Window length.
	pub window: Duration,
}
impl RateSpec {
	/// Construct a spec, rejecting zero limits and windows that are empty or longer than
	/// [`MAX_RATE_WINDOW`].
	pub fn new(limit: u32, window: Duration) -> Result<Self> {
		if limit == 0 {
			return Err(Error::Validation {
				field: "rate_limit",
				reason: "Limit must be greater than zero.".into(),
			});
		}
		if window.is_zero() {
			return Err(Error::Validation {
				field: "rate_limit",
				reason: "Window must be greater than zero.".into(),
			});
		}
		if window > MAX_RATE_WINDOW {
			return Err(Error::Validation {
				field: "rate_limit",
				reason: format!("Window must not exceed {} days.", MAX_RATE_WINDOW.as_secs() / 86_400),
			});
		}

		Ok(Self { limit, window })
	}
}
impl FromStr for RateSpec {
	type Err = Error;

	/// Parse `"10 per second"`, `"100/minute"` or `"5 per 30 seconds"`.
	fn from_str(raw: &str) -> Result<Self> {
		let invalid = || Error::Validation {
			field: "rate_limit",
			reason: format!("Expected '<count> per <unit>' or '<count>/<unit>', got {raw:?}."),
		};
		let normalized = raw.trim().to_ascii_lowercase();
		let (count, unit) = normalized
			.split_once('/')
			.or_else(|| normalized.split_once(" per "))
			.ok_or_else(invalid)?;
		let limit = count.trim().parse::<u32>().map_err(|_| invalid())?;
		let unit = unit.trim();
		let (multiplier, unit) = match unit.split_once(char::is_whitespace) {
			Some((n, rest)) => (n.parse::<u64>().map_err(|_| invalid())?, rest.trim()),
			None => (1, unit),
		};
		let seconds: u64 = match unit {
			"s" | "sec" | "second" | "seconds" => 1,
			"m" | "min" | "minute" | "minutes" => 60,
			"h" | "hour" | "hours" => 60 * 60,
			"d" | "day" | "days" => 60 * 60 * 24,
			_ => return Err(invalid()),
		};

		let seconds = seconds.checked_mul(multiplier).ok_or_else(invalid)?;

		Self::new(limit, Duration::from_secs(seconds))
	}
}
impl Display for RateSpec {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		write!(f, "{} per {}s", self.limit, self.window.as_secs_f64())
	}
}

/// Counter state for one client key.
#[derive(Clone, Copy, Debug)]
pub struct RateLimitBucket {
	/// Start of the active window.
	pub window_start: Instant,
	/// Requests admitted in the active window.
	pub count: u32,
}
impl RateLimitBucket {
	fn new(now: Instant) -> Self {
		Self { window_start: now, count: 0 }
	}

	fn elapsed(&self, now: Instant) -> Duration {
		now.saturating_duration_since(self.window_start)
	}
}

#[derive(Debug)]
struct BucketTable {
	buckets: HashMap<String, RateLimitBucket>,
	last_sweep: Instant,
}

/// Shared fixed-window limiter keyed by client identity.
#[derive(Debug)]
pub struct RateLimiter {
	spec: Option<RateSpec>,
	table: Mutex<BucketTable>,
}
impl RateLimiter {
	/// Create a limiter enforcing `spec`.
	pub fn new(spec: RateSpec) -> Self {
		Self::build(Some(spec))
	}

	/// Create a limiter that admits every request.
	pub fn disabled() -> Self {
		Self::build(None)
	}

	fn build(spec: Option<RateSpec>) -> Self {
		Self {
			spec,
			table: Mutex::new(BucketTable { buckets: HashMap::new(), last_sweep: Instant::now() }),
		}
	}

	/// Configured rate, if limiting is enabled.
	pub fn spec(&self) -> Option<RateSpec> {
		self.spec
	}

	/// Admit or reject a request from `client` at the current time.
	pub fn allow(&self, client: &str) -> bool {
		self.allow_at(client, Instant::now())
	}

	/// Admit or reject a request from `client` at `now`.
	pub fn allow_at(&self, client: &str, now: Instant) -> bool {
		let Some(spec) = self.spec else {
			return true;
		};
		let mut table = self.table.lock();

		if now.saturating_duration_since(table.last_sweep) >= spec.window {
			Self::sweep(&mut table.buckets, spec.window, now);

			table.last_sweep = now;
		}

		let bucket =
			table.buckets.entry(client.to_owned()).or_insert_with(|| RateLimitBucket::new(now));

		if bucket.elapsed(now) >= spec.window {
			*bucket = RateLimitBucket::new(now);
		}
		if bucket.count < spec.limit {
			bucket.count += 1;

			true
		} else {
			false
		}
	}

	/// Like [`allow`](Self::allow) but yields the rejection as an error.
	pub fn check(&self, client: &str) -> Result<()> {
		if self.allow(client) {
			Ok(())
		} else {
			let retry_after = self.spec.map(|spec| spec.window).unwrap_or_default();

			Err(Error::RateLimited { client: client.to_owned(), retry_after })
		}
	}

	/// Number of tracked client buckets.
	pub fn tracked_clients(&self) -> usize {
		self.table.lock().buckets.len()
	}

	fn sweep(buckets: &mut HashMap<String, RateLimitBucket>, window: Duration, now: Instant) {
		let horizon = window.saturating_mul(EVICTION_WINDOWS + 1);
		let before = buckets.len();

		buckets.retain(|_, bucket| bucket.elapsed(now) < horizon);

		let evicted = before - buckets.len();

		if evicted > 0 {
			tracing::debug!(evicted, remaining = buckets.len(), "evicted idle rate limit buckets");
		}
	}
}
