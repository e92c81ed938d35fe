//! Crate-wide error types and `Result` alias.

// crates.io
use axum::{
	Json,
	response::{IntoResponse, Response},
};
use http::{HeaderValue, StatusCode, header::RETRY_AFTER};
// self
use crate::_prelude::*;

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the reflector.
///
/// The type is `Clone` so a single refresh outcome can be handed to every caller waiting on it;
/// non-cloneable sources are shared behind an [`Arc`].
#[allow(missing_docs)]
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Io(Arc<std::io::Error>),
	#[error(transparent)]
	Reqwest(Arc<reqwest::Error>),
	#[error(transparent)]
	Url(#[from] url::ParseError),

	#[error("Upstream {url} is unreachable: {reason}")]
	UpstreamUnreachable { url: String, reason: String },
	#[error("Upstream HTTP status {status} from {url}: {body:?}")]
	UpstreamError { status: StatusCode, url: String, body: Option<String> },
	#[error("Upstream document from {url} is malformed: {reason}")]
	UpstreamMalformed { url: String, reason: String },
	#[error("Issuer rewrite failed: {0}")]
	RewriteError(String),
	#[error("Rate limit exceeded for client '{client}'.")]
	RateLimited { client: String, retry_after: Duration },
	#[error("User agent {user_agent:?} is not allowed.")]
	Forbidden { user_agent: Option<String> },
	#[error("Validation failed for {field}: {reason}")]
	Validation { field: &'static str, reason: String },
	#[error("Metrics error: {0}")]
	Metrics(String),
	#[error("Logging setup failed: {0}")]
	Logging(String),
}
impl Error {
	/// Short machine-readable identifier used in response bodies and logs.
	pub fn kind(&self) -> &'static str {
		match self {
			Self::Io(_) => "io",
			Self::Reqwest(_) => "client",
			Self::Url(_) => "url",
			Self::UpstreamUnreachable { .. } => "upstream_unreachable",
			Self::UpstreamError { .. } => "upstream_error",
			Self::UpstreamMalformed { .. } => "upstream_malformed",
			Self::RewriteError(_) => "rewrite_error",
			Self::RateLimited { .. } => "rate_limited",
			Self::Forbidden { .. } => "forbidden",
			Self::Validation { .. } => "validation",
			Self::Metrics(_) => "metrics",
			Self::Logging(_) => "logging",
		}
	}

	/// HTTP status the front door answers with for this error.
	pub fn status(&self) -> StatusCode {
		match self {
			Self::UpstreamUnreachable { .. }
			| Self::UpstreamError { .. }
			| Self::UpstreamMalformed { .. }
			| Self::RewriteError(_) => StatusCode::BAD_GATEWAY,
			Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
			Self::Forbidden { .. } => StatusCode::FORBIDDEN,
			_ => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// Whether a previously cached copy may stand in for this failure.
	///
	/// Transport failures and upstream status errors are transient; a malformed document or a
	/// broken issuer means the upstream contract changed and is always surfaced.
	pub fn allows_stale(&self) -> bool {
		matches!(self, Self::UpstreamUnreachable { .. } | Self::UpstreamError { .. })
	}
}
impl From<std::io::Error> for Error {
	fn from(value: std::io::Error) -> Self {
		Self::Io(Arc::new(value))
	}
}
impl From<reqwest::Error> for Error {
	fn from(value: reqwest::Error) -> Self {
		Self::Reqwest(Arc::new(value))
	}
}
impl IntoResponse for Error {
	fn into_response(self) -> Response {
		let status = self.status();
		// Upstream details stay in the logs; relying parties only learn the failure class.
		let message = match &self {
			Self::UpstreamUnreachable { .. }
			| Self::UpstreamError { .. }
			| Self::UpstreamMalformed { .. }
			| Self::RewriteError(_) => "Upstream issuer metadata is unavailable.".to_owned(),
			Self::RateLimited { .. } => "Too many requests.".to_owned(),
			Self::Forbidden { .. } => "Client is not allowed.".to_owned(),
			other => other.to_string(),
		};
		let body = serde_json::json!({ "error": self.kind(), "message": message });
		let mut response = (status, Json(body)).into_response();

		if let Self::RateLimited { retry_after, .. } = &self {
			let seconds = retry_after.as_secs().max(1);

			if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
				response.headers_mut().insert(RETRY_AFTER, value);
			}
		}

		response
	}
}
