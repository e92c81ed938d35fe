//! End-to-end requests through the router.

// std
use std::time::Duration;
// crates.io
use axum::{
	Router,
	body::{Body, to_bytes},
	http::{Request, Response, StatusCode, header},
};
use oidc_reflector::{AccessGate, AppState, RateLimiter, RateSpec, UserAgentMatcher, router};
use serde_json::{Value, json};
use tower::ServiceExt;
use wiremock::{MockServer, ResponseTemplate};
// self
use super::*;

fn app(server: &MockServer, limiter: RateLimiter, gate: AccessGate) -> Router {
	router(AppState::new(cache(server, Duration::from_secs(60)), limiter, gate))
}

fn request(uri: &str, user_agent: Option<&str>) -> Request<Body> {
	let mut builder = Request::builder().uri(uri);

	if let Some(user_agent) = user_agent {
		builder = builder.header(header::USER_AGENT, user_agent);
	}

	builder.body(Body::empty()).expect("request")
}

async fn send(app: &Router, uri: &str) -> Response<Body> {
	app.clone().oneshot(request(uri, None)).await.expect("response")
}

async fn body_json(response: Response<Body>) -> Value {
	let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");

	serde_json::from_slice(&bytes).expect("json")
}

#[tokio::test]
async fn serves_rewritten_discovery_and_verbatim_jwks() {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	mount(&server, DISCOVERY_PATH, json_ok(DISCOVERY_BODY), 1).await;
	mount(&server, JWKS_PATH, json_ok(JWKS_BODY), 1).await;

	let app = app(&server, RateLimiter::disabled(), AccessGate::default());

	assert_eq!(send(&app, "/readyz").await.status(), StatusCode::SERVICE_UNAVAILABLE);

	let discovery = send(&app, DISCOVERY_PATH).await;

	assert_eq!(discovery.status(), StatusCode::OK);
	assert_eq!(discovery.headers()[header::CONTENT_TYPE], "application/json");
	assert!(
		discovery.headers()[header::CACHE_CONTROL]
			.to_str()
			.expect("cache-control")
			.starts_with("public, max-age=")
	);

	let document = body_json(discovery).await;

	assert_eq!(document["issuer"], json!("https://issuer.example.com"));
	assert_eq!(document["jwks_uri"], json!("https://issuer.example.com/openid/v1/jwks"));

	let jwks = send(&app, JWKS_PATH).await;

	assert_eq!(jwks.status(), StatusCode::OK);

	let bytes = to_bytes(jwks.into_body(), usize::MAX).await.expect("body");

	assert_eq!(bytes.as_ref(), JWKS_BODY.as_bytes());

	let ready = send(&app, "/readyz").await;

	assert_eq!(ready.status(), StatusCode::OK);

	let body = body_json(ready).await;
	let discovery = &body["resources"]["discovery"];

	assert_eq!(discovery["freshness"], json!("Fresh"));
	assert_eq!(discovery["last_known_good"], json!(true));
	assert_eq!(discovery["hard_failed"], json!(false));
	assert!(discovery["remaining_ttl_seconds"].as_u64().is_some_and(|ttl| ttl > 0 && ttl <= 60));
	assert_eq!(discovery["metrics"]["requests"], json!(1));
	assert_eq!(discovery["metrics"]["refresh_successes"], json!(1));

	// Both documents are now cached; further requests stay off the network.
	assert_eq!(send(&app, DISCOVERY_PATH).await.status(), StatusCode::OK);
	assert_eq!(send(&app, JWKS_PATH).await.status(), StatusCode::OK);

	server.verify().await;
}

#[tokio::test]
async fn upstream_failure_without_copy_is_bad_gateway() {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	mount(&server, JWKS_PATH, ResponseTemplate::new(500).set_body_string("boom"), 1).await;

	let app = app(&server, RateLimiter::disabled(), AccessGate::default());
	let response = send(&app, JWKS_PATH).await;

	assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

	let body = body_json(response).await;

	assert_eq!(body["error"], json!("upstream_error"));
	assert!(!body["message"].as_str().unwrap_or_default().contains("boom"));
	assert_eq!(send(&app, "/readyz").await.status(), StatusCode::SERVICE_UNAVAILABLE);
	assert_eq!(send(&app, "/livez").await.status(), StatusCode::OK);
}

#[tokio::test]
async fn rate_limits_per_window() {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	mount(&server, JWKS_PATH, json_ok(JWKS_BODY), 1).await;

	let limiter = RateLimiter::new("10 per second".parse::<RateSpec>().expect("rate"));
	let app = app(&server, limiter, AccessGate::default());

	for _ in 0..10 {
		assert_eq!(send(&app, JWKS_PATH).await.status(), StatusCode::OK);
	}

	let limited = send(&app, JWKS_PATH).await;

	assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
	assert_eq!(limited.headers()[header::RETRY_AFTER], "1");

	tokio::time::sleep(Duration::from_millis(1_100)).await;

	assert_eq!(send(&app, JWKS_PATH).await.status(), StatusCode::OK);

	server.verify().await;
}

#[tokio::test]
async fn gates_on_user_agent() {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	mount(&server, JWKS_PATH, json_ok(JWKS_BODY), 1).await;

	let gate = AccessGate::new([
		"kube-*".parse::<UserAgentMatcher>().expect("matcher"),
		"aws-sdk-go/1.55.5".parse::<UserAgentMatcher>().expect("matcher"),
	]);
	let app = app(&server, RateLimiter::disabled(), gate);
	let admitted = |user_agent: &'static str| {
		let app = app.clone();

		async move {
			app.oneshot(request(JWKS_PATH, Some(user_agent))).await.expect("response").status()
		}
	};

	assert_eq!(admitted("kube-apiserver/v1.30.2").await, StatusCode::OK);
	assert_eq!(admitted("aws-sdk-go/1.55.5").await, StatusCode::OK);
	assert_eq!(admitted("aws-sdk-go/1.55.6").await, StatusCode::FORBIDDEN);
	assert_eq!(admitted("curl/8.5.0").await, StatusCode::FORBIDDEN);
	assert_eq!(send(&app, JWKS_PATH).await.status(), StatusCode::FORBIDDEN);

	server.verify().await;
}
