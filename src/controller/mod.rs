//! Reconciliation loop for NodeTemplates
//!
//! [`reconcile`] and [`error_policy`] plug into a `kube::runtime::Controller`
//! watching NodeTemplates. [`run_sweeper`] reclaims orphaned secret records
//! on a timer, and [`reconcile_all`] runs both halves once.

mod sweep;
mod template;

pub use sweep::{reconcile_all, run_sweeper, sweep_orphans, ReconcileReport};
pub use template::{error_policy, reconcile, reconcile_template, TemplateOutcome, SECRETS_RESOLVED};
