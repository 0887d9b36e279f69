//! nodevault - keeps node template secrets out of node template resources
//!
//! A NodeTemplate carries the provider configuration used to provision the
//! nodes of a node pool. Some of that configuration (SSH keys, API secrets,
//! passwords) must never be stored on the template itself. nodevault moves
//! those values into secret records, leaves reference tokens in their place,
//! and keeps the two sides consistent.
//!
//! # Modules
//!
//! - [`classify`] - Versioned table of sensitive fields per provider schema
//! - [`engine`] - Redaction engine: create, update and read templates
//! - [`guard`] - Reference-count guard between templates and node pools
//! - [`controller`] - Reconciliation loop and orphan sweep
//! - [`store`] - Resource and secret store capabilities (Kubernetes and in-memory)
//! - [`api`] - HTTP surface over the engine and guard
//! - [`wait`] - Bounded polling for callers awaiting convergence
//! - [`crd`] - NodeTemplate and NodePool custom resources
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod api;
pub mod classify;
pub mod config;
pub mod context;
pub mod controller;
pub mod crd;
pub mod engine;
pub mod error;
pub mod guard;
pub mod retry;
pub mod store;
pub mod wait;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label marking secret records managed by nodevault
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Default port for the HTTP API
pub const DEFAULT_API_PORT: u16 = 8080;
