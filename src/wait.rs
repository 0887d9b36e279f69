//! Bounded polling for callers awaiting convergence
//!
//! The engine and the reconciliation loop never push notifications; callers
//! re-read state until it looks the way they expect. `NotFound` is treated as
//! "not yet" because objects appear asynchronously, while any other error ends
//! the wait immediately.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::context::Context;
use crate::crd::{template_resource, TemplateId};
use crate::store::SecretRecord;
use crate::Error;

/// Default time to wait for convergence
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default interval between polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How the interval between polls evolves
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Backoff {
    /// Same interval every time
    Fixed,
    /// Interval multiplied after every poll, capped at `max_interval`
    Exponential {
        /// Growth factor
        multiplier: f64,
        /// Upper bound for a single interval
        max_interval: Duration,
    },
}

/// Timeout and interval for [`wait_for`]
#[derive(Clone, Debug, PartialEq)]
pub struct PollConfig {
    /// Give up after this long
    pub timeout: Duration,
    /// First interval between polls
    pub interval: Duration,
    /// Interval growth
    pub backoff: Backoff,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::fixed(DEFAULT_WAIT_TIMEOUT, DEFAULT_POLL_INTERVAL)
    }
}

impl PollConfig {
    /// Poll every `interval` until `timeout`
    pub fn fixed(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            backoff: Backoff::Fixed,
        }
    }

    /// Poll with doubling intervals from `initial` up to `max_interval`
    pub fn exponential(timeout: Duration, initial: Duration, max_interval: Duration) -> Self {
        Self {
            timeout,
            interval: initial,
            backoff: Backoff::Exponential {
                multiplier: 2.0,
                max_interval,
            },
        }
    }

    fn next_interval(&self, current: Duration) -> Duration {
        match self.backoff {
            Backoff::Fixed => current,
            Backoff::Exponential {
                multiplier,
                max_interval,
            } => Duration::from_secs_f64(
                (current.as_secs_f64() * multiplier).min(max_interval.as_secs_f64()),
            ),
        }
    }
}

/// Invoke `predicate` until it yields a value or `config.timeout` elapses
///
/// The predicate returns `Ok(Some(value))` when done and `Ok(None)` to keep
/// waiting. `Err(NotFound)` also keeps waiting; any other error is returned
/// as-is. The predicate always runs at least once.
pub async fn wait_for<T, F, Fut>(
    config: &PollConfig,
    description: &str,
    mut predicate: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, Error>>,
{
    let deadline = Instant::now() + config.timeout;
    let mut interval = config.interval;

    loop {
        match predicate().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => trace!(what = %description, "condition not met yet"),
            Err(e) if e.is_not_found() => trace!(what = %description, error = %e, "not present yet"),
            Err(e) => return Err(e),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::timeout(format!(
                "{description} after {:?}",
                config.timeout
            )));
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
        interval = config.next_interval(interval);
    }
}

/// Wait until a secret record exists
pub async fn wait_for_secret(
    ctx: &Context,
    namespace: &str,
    name: &str,
    config: &PollConfig,
) -> Result<SecretRecord, Error> {
    wait_for(config, &format!("secret {namespace}/{name}"), move || async move {
        ctx.secrets.get_secret(namespace, name).await.map(Some)
    })
    .await
}

/// Wait until a template is gone
pub async fn wait_for_template_deleted(
    ctx: &Context,
    id: &TemplateId,
    config: &PollConfig,
) -> Result<(), Error> {
    let resource = &template_resource();
    wait_for(config, &format!("deletion of node template {id}"), move || async move {
        match ctx.resources.get(resource, &id.namespace, &id.name).await {
            Ok(_) => Ok(None),
            Err(e) if e.is_not_found() => Ok(Some(())),
            Err(e) => Err(e),
        }
    })
    .await
}
