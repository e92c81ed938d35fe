//! Issuer document cache with single-flight refresh and stale fallback.

pub mod entry;
pub mod manager;
pub mod state;
