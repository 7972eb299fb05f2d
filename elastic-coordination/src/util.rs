use std::future::Future;
use std::net::{IpAddr, UdpSocket};
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Validate that an identifier is safe for use in etcd key paths.
///
/// Job ids are interpolated into every key the manager touches. Without
/// validation, a name like `../other-job` could read or delete another job's
/// membership.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(Error::invalid_config("identifier must be 1-128 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::invalid_config(
            "identifier contains invalid characters (only alphanumeric, dash, underscore allowed)",
        ));
    }
    Ok(())
}

/// Bounded exponential backoff for coordination-service calls.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl Backoff {
    /// Unbounded jittered delays: `initial`, doubling, capped at `max`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let half = u64::try_from(self.initial.as_millis() / 2).unwrap_or(u64::MAX);
        ExponentialBackoff::from_millis(2)
            .factor(half.max(1))
            .max_delay(self.max)
            .map(jitter)
    }

    /// Delays between attempts, one fewer than `max_attempts`.
    pub fn strategy(&self) -> impl Iterator<Item = Duration> {
        let retries = usize::try_from(self.max_attempts.saturating_sub(1)).unwrap_or(usize::MAX);
        self.delays().take(retries)
    }
}

/// Run `op` until it succeeds, retrying transient failures with backoff.
///
/// Gives up with the last error after `max_attempts`, or with
/// `Error::ShuttingDown` as soon as `cancel` fires.
pub async fn retry_with_backoff<T, F, Fut>(
    what: &str,
    backoff: Backoff,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let retry = Retry::spawn(backoff.strategy(), || {
        attempt += 1;
        let attempt = attempt;
        let call = op();
        async move {
            call.await.inspect_err(|e| {
                tracing::warn!(operation = what, attempt, error = %e, "coordination call failed");
            })
        }
    });

    tokio::select! {
        _ = cancel.cancelled() => Err(Error::ShuttingDown),
        result = retry => result.inspect_err(|e| {
            tracing::error!(operation = what, error = %e, "giving up after retries");
        }),
    }
}

/// Best guess at the address other nodes can reach this one on: the local
/// address of the interface that routes outbound traffic.
///
/// No packet is sent; connecting a UDP socket only selects a route.
pub fn resolve_local_host() -> Result<String> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .map_err(|e| Error::invalid_config(format!("cannot resolve local host: {e}")))?;
    socket
        .connect("8.8.8.8:80")
        .map_err(|e| Error::invalid_config(format!("cannot resolve local host: {e}")))?;
    let ip = socket
        .local_addr()
        .map_err(|e| Error::invalid_config(format!("cannot resolve local host: {e}")))?
        .ip();
    match ip {
        IpAddr::V4(v4) if !v4.is_unspecified() => Ok(v4.to_string()),
        other => Err(Error::invalid_config(format!(
            "resolved unusable local address {other}, set HOST or POD_IP"
        ))),
    }
}

/// Random per-process tag for this node's registration key.
pub fn node_tag() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
