//! Cache freshness, single-flight, and stale-serve behaviour.

// std
use std::{sync::Arc, time::Duration};
// crates.io
use oidc_reflector::{Error, Freshness, MetadataCache, Resource, Result, UpstreamFetcher};
use serde_json::{Value, json};
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{header, method, path},
};
// self
use super::*;

#[tokio::test]
async fn serves_cached_copy_within_ttl() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	mount(&server, JWKS_PATH, json_ok(JWKS_BODY), 1).await;

	let cache = cache(&server, Duration::from_secs(60));
	let first = cache.get(Resource::Jwks).await?;
	let second = cache.get(Resource::Jwks).await?;

	assert!(Arc::ptr_eq(&first, &second));
	assert_eq!(first.payload.as_ref(), JWKS_BODY.as_bytes());
	assert_eq!(first.content_type, "application/json");

	let status = cache.status(Resource::Jwks);

	assert_eq!(status.freshness, Freshness::Fresh);
	assert_eq!(status.metrics.refresh_successes, 1);
	assert_eq!(status.metrics.cache_hits, 1);

	server.verify().await;

	Ok(())
}

#[tokio::test]
async fn concurrent_requests_share_one_upstream_fetch() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	mount(&server, JWKS_PATH, json_ok(JWKS_BODY).set_delay(Duration::from_millis(200)), 2).await;

	let cache = cache(&server, Duration::from_millis(400));

	for _ in 0..2 {
		let handles = (0..16)
			.map(|_| {
				let cache = cache.clone();

				tokio::spawn(async move { cache.get(Resource::Jwks).await })
			})
			.collect::<Vec<_>>();
		let mut documents = Vec::new();

		for handle in handles {
			documents.push(handle.await.expect("task")?);
		}

		assert!(documents.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));

		// Let the copy expire so the second round has to refresh again.
		tokio::time::sleep(Duration::from_millis(500)).await;
	}

	server.verify().await;

	Ok(())
}

#[tokio::test]
async fn serves_stale_copy_when_upstream_fails() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path(JWKS_PATH))
		.respond_with(json_ok(JWKS_BODY))
		.up_to_n_times(1)
		.expect(1)
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path(JWKS_PATH))
		.respond_with(ResponseTemplate::new(500).set_body_string("etcd unavailable"))
		.expect(2)
		.mount(&server)
		.await;
	mount(&server, DISCOVERY_PATH, json_ok(DISCOVERY_BODY), 1).await;

	let cache = cache(&server, Duration::from_millis(200));
	let first = cache.get(Resource::Jwks).await?;

	cache.get(Resource::Discovery).await?;
	tokio::time::sleep(Duration::from_millis(300)).await;

	let stale = cache.get(Resource::Jwks).await?;

	assert!(Arc::ptr_eq(&first, &stale));
	assert!(cache.is_ready());

	// Still stale, so the next lookup retries upstream.
	let again = cache.get(Resource::Jwks).await?;

	assert!(Arc::ptr_eq(&first, &again));

	let status = cache.status(Resource::Jwks);

	assert_eq!(status.freshness, Freshness::Stale);
	assert!(!status.last_known_good);
	assert!(!status.hard_failed);
	assert_eq!(status.error_count, 2);
	assert_eq!(status.last_error, Some("upstream_error"));
	assert_eq!(status.metrics.stale_serves, 2);

	server.verify().await;

	Ok(())
}

#[tokio::test]
async fn first_failure_is_surfaced_and_blocks_readiness() {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	mount(&server, JWKS_PATH, ResponseTemplate::new(503), 1).await;

	let cache = cache(&server, Duration::from_secs(60));
	let err = cache.get(Resource::Jwks).await.expect_err("no copy to fall back on");

	assert!(matches!(err, Error::UpstreamError { status, .. } if status.as_u16() == 503));
	assert!(!cache.is_ready());
	assert_eq!(cache.status(Resource::Jwks).freshness, Freshness::Empty);

	server.verify().await;
}

#[tokio::test]
async fn malformed_discovery_is_never_masked_by_stale_copy() {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path(DISCOVERY_PATH))
		.respond_with(json_ok(DISCOVERY_BODY))
		.up_to_n_times(1)
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path(DISCOVERY_PATH))
		.respond_with(json_ok("[]"))
		.mount(&server)
		.await;
	mount(&server, JWKS_PATH, json_ok(JWKS_BODY), 1).await;

	let cache = cache(&server, Duration::from_millis(200));

	cache.get(Resource::Discovery).await.expect("initial discovery");
	cache.get(Resource::Jwks).await.expect("initial jwks");

	assert!(cache.is_ready());

	tokio::time::sleep(Duration::from_millis(300)).await;

	let err = cache.get(Resource::Discovery).await.expect_err("malformed document");

	assert!(matches!(err, Error::UpstreamMalformed { .. }));
	assert!(!cache.is_ready());
}

#[tokio::test]
async fn rewrites_discovery_issuer_and_sends_bearer_token() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;
	let token_file =
		std::env::temp_dir().join(format!("oidc-reflector-token-{}", std::process::id()));

	std::fs::write(&token_file, "projected-token\n")?;

	Mock::given(method("GET"))
		.and(path(DISCOVERY_PATH))
		.and(header("authorization", "Bearer projected-token"))
		.respond_with(json_ok(DISCOVERY_BODY))
		.expect(1)
		.mount(&server)
		.await;

	let fetcher = UpstreamFetcher::new(upstream(&server).with_token_file(&token_file))?;
	let cache = MetadataCache::new(fetcher, external_issuer(), Duration::from_secs(60));
	let document = cache.get(Resource::Discovery).await?;
	let body: Value = serde_json::from_slice(&document.payload).expect("json");

	assert_eq!(body["issuer"], json!(EXTERNAL_ISSUER));
	assert_eq!(body["jwks_uri"], json!(format!("{EXTERNAL_ISSUER}/openid/v1/jwks")));
	assert_eq!(body["response_types_supported"], json!(["id_token"]));
	assert!(!String::from_utf8_lossy(&document.payload).contains(INTERNAL_ISSUER));

	let _ = std::fs::remove_file(&token_file);

	server.verify().await;

	Ok(())
}

#[tokio::test]
async fn refresh_ignores_freshness_and_skips_stale_fallback() {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path(JWKS_PATH))
		.respond_with(json_ok(JWKS_BODY))
		.up_to_n_times(2)
		.expect(2)
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path(JWKS_PATH))
		.respond_with(ResponseTemplate::new(502))
		.expect(1)
		.mount(&server)
		.await;

	let cache = cache(&server, Duration::from_secs(60));
	let first = cache.get(Resource::Jwks).await.expect("initial fetch");
	let refreshed = cache.refresh(Resource::Jwks).await.expect("forced refresh");

	assert!(!Arc::ptr_eq(&first, &refreshed));
	assert_eq!(first.payload, refreshed.payload);

	let err = cache.refresh(Resource::Jwks).await.expect_err("failure is returned as-is");

	assert!(err.allows_stale());

	let served = cache.get(Resource::Jwks).await.expect("fresh copy is still served");

	assert!(Arc::ptr_eq(&refreshed, &served));

	server.verify().await;
}

#[tokio::test]
async fn upstream_deadline_surfaces_as_unreachable() {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	mount(&server, JWKS_PATH, json_ok(JWKS_BODY).set_delay(Duration::from_secs(1)), 1).await;

	let mut config = upstream(&server);

	config.timeout = Duration::from_millis(200);

	let fetcher = UpstreamFetcher::new(config).expect("fetcher");
	let cache = MetadataCache::new(fetcher, external_issuer(), Duration::from_secs(60));
	let err = cache.get(Resource::Jwks).await.expect_err("deadline exceeded");

	assert!(matches!(err, Error::UpstreamUnreachable { .. }), "unexpected error: {err:?}");
	assert!(!cache.is_ready());
	assert_eq!(cache.status(Resource::Jwks).last_error, Some("upstream_unreachable"));
}

#[tokio::test]
async fn aborted_caller_does_not_cancel_the_shared_refresh() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	mount(&server, JWKS_PATH, json_ok(JWKS_BODY).set_delay(Duration::from_millis(300)), 1).await;

	let cache = cache(&server, Duration::from_secs(60));
	let abandoned = {
		let cache = cache.clone();

		tokio::spawn(async move { cache.get(Resource::Jwks).await })
	};

	tokio::time::sleep(Duration::from_millis(50)).await;
	abandoned.abort();

	assert!(abandoned.await.expect_err("aborted").is_cancelled());
	assert!(cache.status(Resource::Jwks).refreshing);

	let document = cache.get(Resource::Jwks).await?;

	assert_eq!(document.payload.as_ref(), JWKS_BODY.as_bytes());
	assert_eq!(cache.status(Resource::Jwks).metrics.refresh_successes, 1);

	server.verify().await;

	Ok(())
}

#[tokio::test]
async fn unbounded_ttl_is_served_without_overflow() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	mount(&server, JWKS_PATH, json_ok(JWKS_BODY), 1).await;

	let cache = cache(&server, Duration::from_secs(u64::MAX / 2));
	let first = cache.get(Resource::Jwks).await?;
	let second = cache.get(Resource::Jwks).await?;

	assert!(Arc::ptr_eq(&first, &second));
	assert_eq!(cache.status(Resource::Jwks).freshness, Freshness::Fresh);

	server.verify().await;

	Ok(())
}
