//! Issuer rewriting for the discovery document.
//!
//! The API server advertises URLs anchored at its internal issuer (for example
//! `https://kubernetes.default.svc.cluster.local`). Relying parties outside the cluster need the
//! same document with every such URL re-anchored at the externally reachable issuer. Key material
//! is never touched; the key set is served verbatim.

// crates.io
use serde_json::{Map, Value};
use url::Url;
// self
use crate::_prelude::*;

/// Internal and external issuer authorities used for a rewrite.
///
/// An authority is the scheme, host and (non-default) port of an issuer URL. Paths are never part
/// of it, so they carry over unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuerRewriteConfig {
	/// Authority of the issuer advertised by the upstream document.
	pub internal: String,
	/// Authority of the operator-configured issuer.
	pub external: String,
}
impl IssuerRewriteConfig {
	/// Derive the rewrite pair from a fetched document and the configured external issuer.
	pub fn from_document(document: &Map<String, Value>, external: &Url) -> Result<Self> {
		let issuer = document
			.get("issuer")
			.ok_or_else(|| Error::RewriteError("Document has no 'issuer' field.".into()))?
			.as_str()
			.ok_or_else(|| Error::RewriteError("Field 'issuer' is not a string.".into()))?;
		let parsed = Url::parse(issuer).map_err(|err| {
			Error::RewriteError(format!("Field 'issuer' is not an absolute URL: {err}."))
		})?;

		if parsed.cannot_be_a_base() || parsed.host_str().is_none() {
			return Err(Error::RewriteError(format!("Issuer {issuer:?} has no authority.")));
		}
		if external.host_str().is_none() {
			return Err(Error::RewriteError(format!("External issuer {external} has no authority.")));
		}

		Ok(Self {
			internal: parsed.origin().ascii_serialization(),
			external: external.origin().ascii_serialization(),
		})
	}

	/// Re-anchor `value` at the external issuer when it is a URL under the internal one.
	pub fn rewrite_str(&self, value: &str) -> Option<String> {
		let rest = value.strip_prefix(self.internal.as_str())?;

		if rest.is_empty() || rest.starts_with(['/', '?', '#']) {
			Some(format!("{}{rest}", self.external))
		} else {
			None
		}
	}

	fn rewrite_value(&self, value: &mut Value) -> usize {
		match value {
			Value::String(s) => match self.rewrite_str(s) {
				Some(rewritten) if rewritten != *s => {
					*s = rewritten;

					1
				},
				_ => 0,
			},
			Value::Array(items) => items.iter_mut().map(|item| self.rewrite_value(item)).sum(),
			Value::Object(fields) => fields.values_mut().map(|field| self.rewrite_value(field)).sum(),
			_ => 0,
		}
	}
}

/// Parse a discovery document body into a JSON object.
pub fn parse_document(url: &str, body: &[u8]) -> Result<Map<String, Value>> {
	match serde_json::from_slice::<Value>(body) {
		Ok(Value::Object(map)) => Ok(map),
		Ok(other) => Err(Error::UpstreamMalformed {
			url: url.to_owned(),
			reason: format!("Expected a JSON object, got {}.", json_kind(&other)),
		}),
		Err(err) => Err(Error::UpstreamMalformed { url: url.to_owned(), reason: err.to_string() }),
	}
}

/// Produce a copy of `document` re-anchored at `external`.
///
/// Every string value, at any depth, that equals the internal authority or continues it with a
/// path, query or fragment has that authority replaced; everything else is preserved. Applying
/// the rewrite to its own output yields the same document.
pub fn rewrite_discovery(
	document: &Map<String, Value>,
	external: &Url,
) -> Result<Map<String, Value>> {
	let config = IssuerRewriteConfig::from_document(document, external)?;
	let mut rewritten = document.clone();

	if config.internal == config.external {
		return Ok(rewritten);
	}

	let replaced: usize = rewritten.values_mut().map(|value| config.rewrite_value(value)).sum();

	tracing::debug!(
		internal = %config.internal,
		external = %config.external,
		replaced,
		"rewrote discovery document"
	);

	Ok(rewritten)
}

fn json_kind(value: &Value) -> &'static str {
	match value {
		Value::Null => "null",
		Value::Bool(_) => "a boolean",
		Value::Number(_) => "a number",
		Value::String(_) => "a string",
		Value::Array(_) => "an array",
		Value::Object(_) => "an object",
	}
}
