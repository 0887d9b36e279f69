//! Integration tests for nodevault against a real API server
//!
//! Tests are organized by the story they tell:
//!
//! - `template_operations`: creating, reading, updating and deleting
//!   NodeTemplates, with their secrets landing in Kubernetes Secrets
//! - `pool_lifecycle`: node pools holding templates in place and the
//!   reconciliation loop cleaning up after them
//!
//! ```bash
//! cargo test --test kind -- --ignored
//! ```

mod helpers;
mod pool_lifecycle;
mod template_operations;
