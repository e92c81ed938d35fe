//! Runtime configuration and validation.
//!
//! Every value here is fixed at process start. The binary assembles a [`ReflectorConfig`] from
//! flags and environment; tests construct one directly.

// std
use std::{
	net::{IpAddr, Ipv4Addr, SocketAddr},
	path::PathBuf,
};
// crates.io
use http::HeaderName;
use url::Url;
// self
use crate::{_prelude::*, gate::UserAgentMatcher, limit::RateSpec};

/// Default bind address.
pub const DEFAULT_LISTEN: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080);
/// Default freshness window for cached documents.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
/// Longest accepted freshness window.
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(60 * 60 * 24);
/// Default per-call deadline for upstream requests.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);
/// Longest accepted upstream deadline.
pub const MAX_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Default size guard (1 MiB).
pub const DEFAULT_MAX_RESPONSE_BYTES: u64 = 1_048_576;
/// Mounted service-account token.
pub const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
/// Mounted cluster certificate authority bundle.
pub const SERVICE_ACCOUNT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
/// API server address used when the in-cluster service variables are absent.
pub const DEFAULT_API_SERVER: &str = "https://kubernetes.default.svc";

/// Connection settings for the in-cluster API server.
#[derive(Clone, Debug)]
pub struct UpstreamConfig {
	/// Base URL of the API server.
	pub api_server: Url,
	/// Bearer token file; `None` sends unauthenticated requests.
	pub token_file: Option<PathBuf>,
	/// PEM bundle used as the only trust anchors; `None` uses the built-in roots.
	pub ca_file: Option<PathBuf>,
	/// Deadline applied to each upstream call.
	pub timeout: Duration,
	/// Largest accepted response body.
	pub max_response_bytes: u64,
	/// Whether the API server URL must use HTTPS.
	pub require_https: bool,
}
impl UpstreamConfig {
	/// Settings for a pod with the default service-account mount.
	///
	/// The API server address comes from `KUBERNETES_SERVICE_HOST`/`KUBERNETES_SERVICE_PORT`
	/// when present.
	pub fn in_cluster() -> Result<Self> {
		let host = std::env::var("KUBERNETES_SERVICE_HOST").ok();
		let port = std::env::var("KUBERNETES_SERVICE_PORT").ok();

		Ok(Self::new(in_cluster_api_server(host.as_deref(), port.as_deref())?)
			.with_token_file(SERVICE_ACCOUNT_TOKEN_PATH)
			.with_ca_file(SERVICE_ACCOUNT_CA_PATH))
	}

	/// Settings for an explicit API server with no credentials.
	pub fn new(api_server: Url) -> Self {
		Self {
			api_server,
			token_file: None,
			ca_file: None,
			timeout: DEFAULT_UPSTREAM_TIMEOUT,
			max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
			require_https: true,
		}
	}

	/// Authenticate with the bearer token stored at `path`.
	pub fn with_token_file(mut self, path: impl Into<PathBuf>) -> Self {
		self.token_file = Some(path.into());

		self
	}

	/// Trust only the certificates in the PEM bundle at `path`.
	pub fn with_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
		self.ca_file = Some(path.into());

		self
	}

	/// Set HTTPS requirement to the desired value.
	pub fn with_require_https(mut self, require_https: bool) -> Self {
		self.require_https = require_https;

		self
	}

	/// Validate the upstream settings.
	pub fn validate(&self) -> Result<()> {
		if self.require_https {
			enforce_https("api_server", &self.api_server)?;
		}
		if self.api_server.host_str().is_none() {
			return Err(Error::Validation {
				field: "api_server",
				reason: "Must include a host component.".into(),
			});
		}
		if self.timeout < Duration::from_millis(100) || self.timeout > MAX_UPSTREAM_TIMEOUT {
			return Err(Error::Validation {
				field: "upstream_timeout",
				reason: format!(
					"Must be between 100 ms and {} s.",
					MAX_UPSTREAM_TIMEOUT.as_secs()
				),
			});
		}
		if self.max_response_bytes == 0 {
			return Err(Error::Validation {
				field: "max_response_bytes",
				reason: "Must be greater than zero.".into(),
			});
		}

		Ok(())
	}
}

/// Complete reflector configuration.
#[derive(Clone, Debug)]
pub struct ReflectorConfig {
	/// Socket address the HTTP front door binds to.
	pub listen: SocketAddr,
	/// Externally reachable issuer that replaces the internal one.
	pub issuer: Url,
	/// Per-client rate; `None` disables limiting.
	pub rate_limit: Option<RateSpec>,
	/// User-agent allow-list; empty admits everyone.
	pub allowed_user_agents: Vec<UserAgentMatcher>,
	/// Header carrying the client address (first entry wins); `None` uses the socket peer.
	pub client_ip_header: Option<HeaderName>,
	/// Freshness window for cached documents.
	pub cache_ttl: Duration,
	/// API server connection settings.
	pub upstream: UpstreamConfig,
	/// Whether to fetch both documents before serving.
	pub prime: bool,
}
impl ReflectorConfig {
	/// Construct a configuration with defaults for everything but the issuer and upstream.
	pub fn new(issuer: Url, upstream: UpstreamConfig) -> Self {
		Self {
			listen: DEFAULT_LISTEN,
			issuer,
			rate_limit: Some(RateSpec { limit: 10, window: Duration::from_secs(1) }),
			allowed_user_agents: Vec::new(),
			client_ip_header: None,
			cache_ttl: DEFAULT_CACHE_TTL,
			upstream,
			prime: true,
		}
	}

	/// Validate the configuration against the documented constraints.
	pub fn validate(&self) -> Result<()> {
		enforce_https("issuer", &self.issuer)?;

		if self.issuer.host_str().is_none() {
			return Err(Error::Validation {
				field: "issuer",
				reason: "Must include a host component.".into(),
			});
		}
		if self.issuer.query().is_some() || self.issuer.fragment().is_some() {
			return Err(Error::Validation {
				field: "issuer",
				reason: "Must not carry a query or fragment.".into(),
			});
		}
		if self.issuer.path() != "/" {
			return Err(Error::Validation {
				field: "issuer",
				reason: "Must be a bare scheme and host; paths are carried over from the cluster \
				         issuer."
					.into(),
			});
		}
		if self.cache_ttl.is_zero() || self.cache_ttl > MAX_CACHE_TTL {
			return Err(Error::Validation {
				field: "cache_ttl",
				reason: format!("Must be between 1 s and {} s.", MAX_CACHE_TTL.as_secs()),
			});
		}
		if let Some(spec) = self.rate_limit {
			RateSpec::new(spec.limit, spec.window)?;
		}

		self.upstream.validate()
	}
}

/// Parse the external issuer, accepting a bare FQDN as shorthand for `https://<fqdn>`.
pub fn parse_issuer(raw: &str) -> Result<Url> {
	let trimmed = raw.trim();

	if trimmed.is_empty() {
		return Err(Error::Validation { field: "issuer", reason: "Must not be empty.".into() });
	}

	let url = if trimmed.contains("://") {
		Url::parse(trimmed)?
	} else {
		Url::parse(&format!("https://{trimmed}"))?
	};

	enforce_https("issuer", &url)?;

	Ok(url)
}

/// Ensure the provided URL uses HTTPS.
pub fn enforce_https(field: &'static str, url: &Url) -> Result<()> {
	if url.scheme() == "https" {
		Ok(())
	} else {
		Err(Error::Validation { field, reason: format!("URL {url} must use HTTPS.") })
	}
}

fn in_cluster_api_server(host: Option<&str>, port: Option<&str>) -> Result<Url> {
	let Some(host) = host.map(str::trim).filter(|host| !host.is_empty()) else {
		return Ok(Url::parse(DEFAULT_API_SERVER)?);
	};
	let host = if host.contains(':') && !host.starts_with('[') {
		format!("[{host}]")
	} else {
		host.to_owned()
	};
	let port = port.map(str::trim).filter(|port| !port.is_empty()).unwrap_or("443");

	Ok(Url::parse(&format!("https://{host}:{port}"))?)
}
