//! Public HTTP front door: access gate, rate limiter, then the metadata cache.

// std
use std::net::SocketAddr;
// crates.io
use axum::{
	Json, Router,
	extract::{ConnectInfo, Request, State},
	response::{IntoResponse, Response},
	routing::get,
};
use http::{
	HeaderMap, HeaderName, HeaderValue, StatusCode,
	header::{CACHE_CONTROL, CONTENT_TYPE, USER_AGENT},
};
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;
// self
use crate::{
	_prelude::*,
	cache::{manager::MetadataCache, state::CachedDocument},
	config::ReflectorConfig,
	gate::AccessGate,
	http::client::{DEFAULT_CONTENT_TYPE, UpstreamFetcher},
	limit::RateLimiter,
	metrics,
	resource::Resource,
};

const UNKNOWN_CLIENT: &str = "unknown";

/// Process-wide state shared by every handler.
#[derive(Clone, Debug)]
pub struct AppState {
	/// Issuer document cache.
	pub cache: MetadataCache,
	/// Per-client limiter.
	pub limiter: Arc<RateLimiter>,
	/// User-agent allow-list.
	pub gate: AccessGate,
	/// Header identifying the client in place of the socket peer.
	pub client_ip_header: Option<HeaderName>,
}
impl AppState {
	/// Assemble state from its parts.
	pub fn new(cache: MetadataCache, limiter: RateLimiter, gate: AccessGate) -> Self {
		Self { cache, limiter: Arc::new(limiter), gate, client_ip_header: None }
	}

	/// Identify clients by the first address in `header`.
	pub fn with_client_ip_header(mut self, header: HeaderName) -> Self {
		self.client_ip_header = Some(header);

		self
	}

	/// Build the upstream fetcher, cache, limiter, and gate described by `config`.
	pub fn from_config(config: &ReflectorConfig) -> Result<Self> {
		let fetcher = UpstreamFetcher::new(config.upstream.clone())?;
		let cache = MetadataCache::new(fetcher, config.issuer.clone(), config.cache_ttl);
		let limiter = match config.rate_limit {
			Some(spec) => RateLimiter::new(spec),
			None => RateLimiter::disabled(),
		};
		let gate = AccessGate::new(config.allowed_user_agents.iter().cloned());
		let state = Self::new(cache, limiter, gate);

		Ok(match &config.client_ip_header {
			Some(header) => state.with_client_ip_header(header.clone()),
			None => state,
		})
	}

	/// Key the rate limiter buckets this request under.
	///
	/// The configured header wins when present; otherwise the socket peer address is used.
	pub fn client_key(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
		self.client_ip_header
			.as_ref()
			.and_then(|name| headers.get(name))
			.and_then(|value| value.to_str().ok())
			.and_then(|value| value.split(',').map(str::trim).find(|entry| !entry.is_empty()))
			.map(str::to_owned)
			.or_else(|| peer.map(|peer| peer.ip().to_string()))
			.unwrap_or_else(|| UNKNOWN_CLIENT.to_owned())
	}
}

/// Build the router serving both documents and the health endpoints.
///
/// Document requests are logged at `info`; health endpoints only at `debug`.
pub fn router(state: AppState) -> Router {
	let documents = Router::new()
		.route(Resource::Discovery.path(), get(discovery))
		.route(Resource::Jwks.path(), get(jwks))
		.layer(
			TraceLayer::new_for_http()
				.make_span_with(DefaultMakeSpan::new().level(Level::INFO))
				.on_request(DefaultOnRequest::new().level(Level::INFO))
				.on_response(DefaultOnResponse::new().level(Level::INFO)),
		);
	let health = Router::new().route("/livez", get(livez)).route("/readyz", get(readyz));
	#[cfg(feature = "prometheus")]
	let health = health.route("/metrics", get(prometheus_metrics));

	documents
		.merge(health.layer(TraceLayer::new_for_http()))
		.fallback(not_found)
		.with_state(state)
}

/// Bind the listener and serve until SIGINT or SIGTERM.
pub async fn serve(config: ReflectorConfig) -> Result<()> {
	config.validate()?;

	#[cfg(feature = "prometheus")]
	metrics::install_default_exporter()?;

	let state = AppState::from_config(&config)?;
	let listener = TcpListener::bind(config.listen).await?;

	tracing::info!(
		listen = %listener.local_addr()?,
		issuer = %config.issuer,
		api_server = %config.upstream.api_server,
		cache_ttl = ?config.cache_ttl,
		rate_limit = ?config.rate_limit.map(|spec| spec.to_string()),
		allowed_user_agents = config.allowed_user_agents.len(),
		"serving issuer metadata"
	);

	if config.prime {
		let cache = state.cache.clone();

		tokio::spawn(async move { cache.prime().await });
	}

	axum::serve(listener, router(state).into_make_service_with_connect_info::<SocketAddr>())
		.with_graceful_shutdown(shutdown_signal())
		.await?;

	tracing::info!("server stopped");

	Ok(())
}

async fn discovery(State(state): State<AppState>, request: Request) -> Response {
	serve_resource(state, Resource::Discovery, request).await
}

async fn jwks(State(state): State<AppState>, request: Request) -> Response {
	serve_resource(state, Resource::Jwks, request).await
}

async fn serve_resource(state: AppState, resource: Resource, request: Request) -> Response {
	let peer = request.extensions().get::<ConnectInfo<SocketAddr>>().map(|info| info.0);
	let client = state.client_key(request.headers(), peer);
	let user_agent = request
		.headers()
		.get(USER_AGENT)
		.and_then(|value| value.to_str().ok())
		.map(str::to_owned);

	drop(request);

	match admit(&state, user_agent.as_deref(), &client) {
		Ok(()) => match state.cache.get(resource).await {
			Ok(document) => document_response(&document),
			Err(err) => {
				tracing::error!(resource = %resource, error = %err, "no document to serve");

				err.into_response()
			},
		},
		Err(err) => err.into_response(),
	}
}

fn admit(state: &AppState, user_agent: Option<&str>, client: &str) -> Result<()> {
	if let Err(err) = state.gate.check(user_agent) {
		metrics::record_rejection(err.kind());
		tracing::info!(client, user_agent, "rejected user agent");

		return Err(err);
	}
	if let Err(err) = state.limiter.check(client) {
		metrics::record_rejection(err.kind());
		tracing::info!(client, "rate limited");

		return Err(err);
	}

	Ok(())
}

fn document_response(document: &CachedDocument) -> Response {
	let max_age = document.remaining_ttl(Instant::now()).as_secs();
	let content_type = HeaderValue::from_str(&document.content_type)
		.unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
	let mut response = (StatusCode::OK, document.payload.clone()).into_response();
	let headers = response.headers_mut();

	headers.insert(CONTENT_TYPE, content_type);

	if let Ok(value) = HeaderValue::from_str(&format!("public, max-age={max_age}")) {
		headers.insert(CACHE_CONTROL, value);
	}

	response
}

async fn livez() -> StatusCode {
	StatusCode::OK
}

async fn readyz(State(state): State<AppState>) -> Response {
	let ready = state.cache.is_ready();
	let resources = state
		.cache
		.statuses()
		.into_iter()
		.map(|status| {
			(
				status.resource.as_str().to_owned(),
				json!({
					"freshness": status.freshness,
					"fetched_at": status.fetched_at,
					"remaining_ttl_seconds": status.remaining_ttl.as_secs(),
					"refreshing": status.refreshing,
					"last_known_good": status.last_known_good,
					"last_attempt_at": status.last_attempt_at,
					"hard_failed": status.hard_failed,
					"error_count": status.error_count,
					"last_error": status.last_error,
					"metrics": {
						"requests": status.metrics.total_requests,
						"hits": status.metrics.cache_hits,
						"stale_serves": status.metrics.stale_serves,
						"hit_rate": status.metrics.hit_rate(),
						"refresh_successes": status.metrics.refresh_successes,
						"refresh_errors": status.metrics.refresh_errors,
						"last_refresh_micros": status.metrics.last_refresh_micros,
					},
				}),
			)
		})
		.collect::<Map<String, Value>>();
	let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

	(status, Json(json!({ "ready": ready, "resources": resources }))).into_response()
}

#[cfg(feature = "prometheus")]
async fn prometheus_metrics() -> Response {
	match metrics::prometheus_handle() {
		Some(handle) => (
			StatusCode::OK,
			[(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"))],
			handle.render(),
		)
			.into_response(),
		None => not_found().await,
	}
}

async fn not_found() -> Response {
	(
		StatusCode::NOT_FOUND,
		Json(json!({ "error": "not_found", "message": "No such resource." })),
	)
		.into_response()
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(err) = tokio::signal::ctrl_c().await {
			tracing::error!(error = %err, "failed to listen for ctrl-c");
			std::future::pending::<()>().await;
		}
	};
	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut signal) => {
				signal.recv().await;
			},
			Err(err) => {
				tracing::error!(error = %err, "failed to listen for SIGTERM");
				std::future::pending::<()>().await;
			},
		}
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => {},
		() = terminate => {},
	}

	tracing::info!("shutdown signal received; draining connections");
}
