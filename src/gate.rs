//! User-agent allow-list enforced before any other request processing.

// std
use std::{
	fmt::{Display, Formatter, Result as FmtResult},
	str::FromStr,
};
// self
use crate::_prelude::*;

/// Single allow-list entry.
///
/// The textual form `kube-*` is a prefix matcher; anything else matches exactly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserAgentMatcher {
	/// Header must equal the value.
	Exact(String),
	/// Header must start with the value.
	Prefix(String),
}
impl UserAgentMatcher {
	/// Whether the given header value satisfies this matcher.
	pub fn matches(&self, user_agent: &str) -> bool {
		match self {
			Self::Exact(value) => user_agent == value,
			Self::Prefix(prefix) => user_agent.starts_with(prefix.as_str()),
		}
	}
}
impl FromStr for UserAgentMatcher {
	type Err = Error;

	fn from_str(raw: &str) -> Result<Self> {
		let trimmed = raw.trim();

		if trimmed.is_empty() {
			return Err(Error::Validation {
				field: "allowed_user_agents",
				reason: "Entries must not be empty.".into(),
			});
		}

		Ok(match trimmed.strip_suffix('*') {
			Some(prefix) => Self::Prefix(prefix.to_owned()),
			None => Self::Exact(trimmed.to_owned()),
		})
	}
}
impl Display for UserAgentMatcher {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		match self {
			Self::Exact(value) => write!(f, "{value}"),
			Self::Prefix(prefix) => write!(f, "{prefix}*"),
		}
	}
}

/// Ordered user-agent allow-list. An empty list disables the gate.
#[derive(Clone, Debug, Default)]
pub struct AccessGate {
	matchers: Arc<[UserAgentMatcher]>,
}
impl AccessGate {
	/// Build a gate from the configured matchers.
	pub fn new(matchers: impl IntoIterator<Item = UserAgentMatcher>) -> Self {
		Self { matchers: matchers.into_iter().collect() }
	}

	/// Whether the gate admits every client.
	pub fn is_disabled(&self) -> bool {
		self.matchers.is_empty()
	}

	/// Decide whether a request carrying `user_agent` may proceed.
	///
	/// A missing header never matches a non-empty allow-list.
	pub fn permit(&self, user_agent: Option<&str>) -> bool {
		if self.is_disabled() {
			return true;
		}

		let Some(user_agent) = user_agent else {
			return false;
		};

		self.matchers.iter().any(|matcher| matcher.matches(user_agent))
	}

	/// Like [`permit`](Self::permit) but yields the rejection as an error.
	pub fn check(&self, user_agent: Option<&str>) -> Result<()> {
		if self.permit(user_agent) {
			Ok(())
		} else {
			Err(Error::Forbidden { user_agent: user_agent.map(str::to_owned) })
		}
	}
}
