//! Command-line and environment configuration for the binary.

// std
use std::{net::SocketAddr, path::PathBuf};
// crates.io
use clap::{Parser, ValueEnum};
use http::HeaderName;
use url::Url;
// self
use crate::{
	_prelude::*,
	config::{self, DEFAULT_LISTEN, ReflectorConfig, UpstreamConfig},
	gate::UserAgentMatcher,
	limit::{DEFAULT_RATE_LIMIT, RateSpec},
};

const RATE_LIMIT_OFF: [&str; 3] = ["off", "none", "disabled"];

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
	/// Human-readable lines.
	Text,
	/// One JSON object per event.
	#[default]
	Json,
}

/// Serve a cluster's service-account OIDC issuer metadata under a public issuer.
#[derive(Debug, Parser)]
#[command(name = "oidc-reflector", version, about)]
pub struct Cli {
	/// Socket address to bind.
	#[arg(long, env = "REFLECTOR_LISTEN", default_value_t = DEFAULT_LISTEN)]
	pub listen: SocketAddr,
	/// Public issuer URL or bare FQDN (promoted to https).
	#[arg(long, env = "REFLECTOR_ISSUER")]
	pub issuer: String,
	/// Per-client rate such as "10 per second" or "100/minute"; "off" disables limiting.
	#[arg(long, env = "DEFAULT_RATE_LIMIT", default_value = DEFAULT_RATE_LIMIT)]
	pub rate_limit: String,
	/// Allowed user agents; a trailing `*` matches by prefix. Empty admits everyone.
	#[arg(
		long = "allowed-user-agent",
		env = "REFLECTOR_ALLOWED_USER_AGENTS",
		value_delimiter = ','
	)]
	pub allowed_user_agents: Vec<String>,
	/// Header whose first address identifies the client, e.g. X-Forwarded-For.
	#[arg(long, env = "REFLECTOR_CLIENT_IP_HEADER")]
	pub client_ip_header: Option<String>,
	/// Cache freshness window in seconds.
	#[arg(long, env = "REFLECTOR_CACHE_TTL", default_value_t = 60)]
	pub cache_ttl: u64,
	/// Upstream request deadline in seconds.
	#[arg(long, env = "REFLECTOR_UPSTREAM_TIMEOUT", default_value_t = 5)]
	pub upstream_timeout: u64,
	/// API server base URL; defaults to the in-cluster service address.
	#[arg(long, env = "REFLECTOR_API_SERVER")]
	pub api_server: Option<String>,
	/// Bearer token file; an empty value disables authentication.
	#[arg(long, env = "REFLECTOR_TOKEN_FILE")]
	pub token_file: Option<String>,
	/// CA bundle for the API server; an empty value uses the built-in roots.
	#[arg(long, env = "REFLECTOR_CA_FILE")]
	pub ca_file: Option<String>,
	/// Log filter used when RUST_LOG is unset.
	#[arg(long, env = "REFLECTOR_LOG_LEVEL", default_value = "info")]
	pub log_level: String,
	/// Log output format.
	#[arg(long, env = "REFLECTOR_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
	pub log_format: LogFormat,
	/// Skip fetching both documents at startup.
	#[arg(long, env = "REFLECTOR_NO_PRIME")]
	pub no_prime: bool,
}
impl Cli {
	/// Resolve flags into a validated configuration.
	pub fn into_config(self) -> Result<ReflectorConfig> {
		let issuer = config::parse_issuer(&self.issuer)?;
		let mut upstream = UpstreamConfig::in_cluster()?;

		if let Some(raw) = &self.api_server {
			upstream.api_server = Url::parse(raw.trim())?;
		}
		if let Some(path) = &self.token_file {
			upstream.token_file = optional_path(path);
		}
		if let Some(path) = &self.ca_file {
			upstream.ca_file = optional_path(path);
		}

		upstream.timeout = Duration::from_secs(self.upstream_timeout);

		let mut config = ReflectorConfig::new(issuer, upstream);

		config.listen = self.listen;
		config.rate_limit = parse_rate_limit(&self.rate_limit)?;
		config.allowed_user_agents = self
			.allowed_user_agents
			.iter()
			.map(|raw| raw.trim())
			.filter(|raw| !raw.is_empty())
			.map(str::parse::<UserAgentMatcher>)
			.collect::<Result<_>>()?;
		config.client_ip_header = self
			.client_ip_header
			.as_deref()
			.map(str::trim)
			.filter(|raw| !raw.is_empty())
			.map(|raw| {
				HeaderName::try_from(raw).map_err(|err| Error::Validation {
					field: "client_ip_header",
					reason: format!("Invalid header name {raw:?}: {err}."),
				})
			})
			.transpose()?;
		config.cache_ttl = Duration::from_secs(self.cache_ttl);
		config.prime = !self.no_prime;

		config.validate()?;

		Ok(config)
	}
}

fn optional_path(raw: &str) -> Option<PathBuf> {
	let trimmed = raw.trim();

	(!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
}

fn parse_rate_limit(raw: &str) -> Result<Option<RateSpec>> {
	let trimmed = raw.trim();

	if RATE_LIMIT_OFF.iter().any(|off| trimmed.eq_ignore_ascii_case(off)) {
		return Ok(None);
	}

	trimmed.parse().map(Some)
}
