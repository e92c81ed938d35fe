//! Authenticated retrieval of issuer documents from the in-cluster API server.

// crates.io
use bytes::Bytes;
use http::{StatusCode, header::CONTENT_TYPE};
use reqwest::{Certificate, Client, redirect::Policy};
use serde_json::{Map, Value};
// self
use crate::{_prelude::*, config::UpstreamConfig, resource::Resource, rewrite};

/// Content type assumed when the API server does not send one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

const ERROR_BODY_LIMIT: usize = 512;

/// Body returned by a successful fetch.
#[derive(Clone, Debug)]
pub enum UpstreamBody {
	/// Parsed discovery document, awaiting rewrite.
	Document(Map<String, Value>),
	/// Opaque payload passed through untouched.
	Opaque(Bytes),
}

/// Metadata and body of a successful upstream fetch.
#[derive(Clone, Debug)]
pub struct UpstreamFetch {
	/// URL that was requested.
	pub url: String,
	/// Content type advertised by the API server.
	pub content_type: String,
	/// Response body.
	pub body: UpstreamBody,
	/// Round-trip duration of the exchange.
	pub elapsed: Duration,
}

/// Issues GETs against the API server's well-known OIDC paths.
#[derive(Clone, Debug)]
pub struct UpstreamFetcher {
	config: Arc<UpstreamConfig>,
	client: Client,
}
impl UpstreamFetcher {
	/// Build a fetcher trusting only the configured CA bundle.
	///
	/// A configured but unreadable bundle falls back to the built-in roots with a warning, which
	/// keeps local runs against a port-forwarded API server usable.
	pub fn new(config: UpstreamConfig) -> Result<Self> {
		config.validate()?;

		let mut builder = Client::builder()
			.redirect(Policy::none())
			.user_agent(format!("oidc-reflector/{}", env!("CARGO_PKG_VERSION")))
			.connect_timeout(config.timeout)
			.timeout(config.timeout)
			.pool_max_idle_per_host(2);

		if let Some(path) = &config.ca_file {
			match std::fs::read(path) {
				Ok(pem) => {
					let certificates = Certificate::from_pem_bundle(&pem)?;

					tracing::debug!(
						path = %path.display(),
						certificates = certificates.len(),
						"loaded cluster certificate authority"
					);

					builder = builder.tls_built_in_root_certs(false);

					for certificate in certificates {
						builder = builder.add_root_certificate(certificate);
					}
				},
				Err(err) => {
					tracing::warn!(
						path = %path.display(),
						error = %err,
						"cluster certificate authority unavailable; using built-in roots"
					);
				},
			}
		}

		Ok(Self::with_client(config, builder.build()?))
	}

	/// Build a fetcher using the supplied HTTP client (primarily for tests).
	pub fn with_client(config: UpstreamConfig, client: Client) -> Self {
		Self { config: Arc::new(config), client }
	}

	/// Connection settings in use.
	pub fn config(&self) -> &UpstreamConfig {
		&self.config
	}

	/// Absolute upstream URL for `resource`.
	pub fn url_for(&self, resource: Resource) -> Result<url::Url> {
		Ok(self.config.api_server.join(resource.path())?)
	}

	/// Fetch `resource` once, bounded by the configured deadline.
	///
	/// The discovery document must be a JSON object; the key set is returned as raw bytes.
	#[tracing::instrument(skip(self), fields(resource = %resource))]
	pub async fn fetch(&self, resource: Resource) -> Result<UpstreamFetch> {
		let url = self.url_for(resource)?;
		let url_string = url.to_string();
		let mut request = self.client.get(url).header(http::header::ACCEPT, DEFAULT_CONTENT_TYPE);

		if let Some(token) = self.read_token(&url_string).await? {
			request = request.bearer_auth(token);
		}

		let start = Instant::now();
		let response = request
			.timeout(self.config.timeout)
			.send()
			.await
			.map_err(|err| transport_error(&url_string, &err))?;
		let status = response.status();

		if status != StatusCode::OK {
			let body = response.text().await.ok().map(|text| truncate(text, ERROR_BODY_LIMIT));

			return Err(Error::UpstreamError { status, url: url_string, body });
		}

		let content_type = response
			.headers()
			.get(CONTENT_TYPE)
			.and_then(|value| value.to_str().ok())
			.unwrap_or(DEFAULT_CONTENT_TYPE)
			.to_owned();
		let bytes = response.bytes().await.map_err(|err| transport_error(&url_string, &err))?;
		let elapsed = start.elapsed();

		if bytes.len() as u64 > self.config.max_response_bytes {
			return Err(Error::UpstreamMalformed {
				url: url_string,
				reason: format!(
					"Response size {size} bytes exceeds the configured guard of {limit} bytes.",
					size = bytes.len(),
					limit = self.config.max_response_bytes
				),
			});
		}

		let body = if resource.is_rewritten() {
			UpstreamBody::Document(rewrite::parse_document(&url_string, &bytes)?)
		} else {
			UpstreamBody::Opaque(bytes)
		};

		tracing::debug!(status = %status, "upstream fetch complete");

		Ok(UpstreamFetch { url: url_string, content_type, body, elapsed })
	}

	// Re-read on every call so rotated projected tokens are picked up.
	async fn read_token(&self, url: &str) -> Result<Option<String>> {
		let Some(path) = &self.config.token_file else {
			return Ok(None);
		};
		let token = tokio::fs::read_to_string(path).await.map_err(|err| {
			Error::UpstreamUnreachable {
				url: url.to_owned(),
				reason: format!("Failed to read service account token {}: {err}.", path.display()),
			}
		})?;
		let token = token.trim();

		if token.is_empty() {
			return Err(Error::UpstreamUnreachable {
				url: url.to_owned(),
				reason: format!("Service account token {} is empty.", path.display()),
			});
		}

		Ok(Some(token.to_owned()))
	}
}

fn transport_error(url: &str, err: &reqwest::Error) -> Error {
	let reason = if err.is_timeout() {
		format!("Timed out: {err}.")
	} else if err.is_connect() {
		format!("Connection failed: {err}.")
	} else {
		err.to_string()
	};

	Error::UpstreamUnreachable { url: url.to_owned(), reason }
}

fn truncate(mut text: String, limit: usize) -> String {
	if text.len() > limit {
		let mut end = limit;

		while !text.is_char_boundary(end) {
			end -= 1;
		}

		text.truncate(end);
	}

	text
}
