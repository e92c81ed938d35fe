//! HTTP plumbing towards the in-cluster API server.

pub mod client;
