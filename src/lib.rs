//! Reflects a Kubernetes cluster's service-account OIDC issuer metadata to external relying
//! parties, rewriting the internal issuer to a public one behind caching, rate limiting, and
//! user-agent filtering.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod gate;
pub mod http;
pub mod limit;
pub mod metrics;
pub mod resource;
pub mod rewrite;
pub mod server;

mod error;
mod _prelude {
	pub use std::{sync::Arc, time::Duration};

	pub use chrono::{DateTime, Utc};
	pub use tokio::time::Instant;

	pub use crate::{Error, Result};
}

// crates.io
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub use crate::{
	cache::{
		manager::{MetadataCache, ResourceStatus},
		state::{CachedDocument, Freshness},
	},
	cli::{Cli, LogFormat},
	config::{ReflectorConfig, UpstreamConfig},
	error::{Error, Result},
	gate::{AccessGate, UserAgentMatcher},
	http::client::UpstreamFetcher,
	limit::{RateLimiter, RateSpec},
	resource::Resource,
	server::{AppState, router, serve},
};
#[cfg(feature = "prometheus")] pub use crate::metrics::install_default_exporter;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level` when set.
pub fn setup_tracing(level: &str, format: LogFormat) -> Result<()> {
	let filter = match EnvFilter::try_from_default_env() {
		Ok(filter) => filter,
		Err(_) => EnvFilter::try_new(level).map_err(|err| Error::Validation {
			field: "log_level",
			reason: format!("Invalid filter directive {level:?}: {err}."),
		})?,
	};
	let subscriber = tracing_subscriber::registry().with(filter);
	let result = match format {
		LogFormat::Json => subscriber.with(fmt::layer().json().flatten_event(true)).try_init(),
		LogFormat::Text => subscriber.with(fmt::layer()).try_init(),
	};

	result.map_err(|err| Error::Logging(err.to_string()))
}
