//! The two issuer documents the reflector tracks.

// std
use std::fmt::{Display, Formatter, Result as FmtResult};

/// Tracked OIDC issuer document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Resource {
	/// `/.well-known/openid-configuration`, served with the issuer rewritten.
	Discovery,
	/// `/openid/v1/jwks`, served verbatim.
	Jwks,
}
impl Resource {
	/// Both resources, in readiness order.
	pub const ALL: [Self; 2] = [Self::Discovery, Self::Jwks];

	/// Well-known path, identical on the API server and on the public front door.
	pub fn path(self) -> &'static str {
		match self {
			Self::Discovery => "/.well-known/openid-configuration",
			Self::Jwks => "/openid/v1/jwks",
		}
	}

	/// Label used in logs and metrics.
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Discovery => "discovery",
			Self::Jwks => "jwks",
		}
	}

	/// Whether the body must be parsed (and rewritten) rather than passed through.
	pub fn is_rewritten(self) -> bool {
		matches!(self, Self::Discovery)
	}
}
impl Display for Resource {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.write_str(self.as_str())
	}
}
