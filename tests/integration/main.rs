//! Integration tests driving the reflector against a mock API server.

mod cache_refresh;
mod front_door;

// std
use std::time::Duration;
// crates.io
use oidc_reflector::{MetadataCache, UpstreamConfig, UpstreamFetcher};
use url::Url;
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{method, path},
};

const INTERNAL_ISSUER: &str = "https://kubernetes.default.svc.cluster.local";
const EXTERNAL_ISSUER: &str = "https://issuer.example.com";
const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";
const JWKS_PATH: &str = "/openid/v1/jwks";
const DISCOVERY_BODY: &str = r#"{
    "issuer": "https://kubernetes.default.svc.cluster.local",
    "jwks_uri": "https://kubernetes.default.svc.cluster.local/openid/v1/jwks",
    "response_types_supported": ["id_token"],
    "subject_types_supported": ["public"],
    "id_token_signing_alg_values_supported": ["RS256"]
}"#;
const JWKS_BODY: &str = r#"{"keys":[{"use":"sig","kty":"RSA","kid":"u3bVvJ6QkXh4","alg":"RS256","n":"AQIDBAUGBwgJCgsMDQ4PEBESExQVFhcYGRobHB0eHyAhIiMkJSYnKCkqKywtLi8wMTIzNDU2Nzg5Ojs8PT4_QEFCQ0RFRkdISUpLTE1OT1BRUlNUVVZXWFlaW1xdXl9gYWJjZGVmZ2hpamtsbW5vcHFyc3R1dnd4eXp7fH1-f4A","e":"AQAB"}]}"#;

fn upstream(server: &MockServer) -> UpstreamConfig {
	UpstreamConfig::new(Url::parse(&server.uri()).expect("mock server uri")).with_require_https(false)
}

fn external_issuer() -> Url {
	Url::parse(EXTERNAL_ISSUER).expect("external issuer")
}

fn cache(server: &MockServer, ttl: Duration) -> MetadataCache {
	let fetcher = UpstreamFetcher::new(upstream(server)).expect("fetcher");

	MetadataCache::new(fetcher, external_issuer(), ttl)
}

fn json_ok(body: &str) -> ResponseTemplate {
	ResponseTemplate::new(200)
		.set_body_raw(body.to_owned(), "application/json")
}

async fn mount(server: &MockServer, route: &str, template: ResponseTemplate, calls: u64) {
	Mock::given(method("GET"))
		.and(path(route))
		.respond_with(template)
		.expect(calls)
		.mount(server)
		.await;
}
