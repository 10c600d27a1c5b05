//! Reconnection with exponential backoff

use super::events::ConnectionEvent;
use crate::config::ReconnectConfig;
use crate::connection::Connection;
use crate::error::{RpcError, RpcResult};
use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Builds a fresh connection to the same peer
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> RpcResult<Connection>;
}

#[async_trait]
impl<F, Fut> Connector for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = RpcResult<Connection>> + Send,
{
    async fn connect(&self) -> RpcResult<Connection> {
        (self)().await
    }
}

/// Delay schedule: `initial_delay * multiplier^attempt`, capped at
/// `max_delay`, then spread by up to `jitter_ratio` either way
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: ReconnectConfig,
}

impl ExponentialBackoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    /// Delay before the given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.config.initial_delay.as_secs_f64()
            * self.config.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped = base.min(self.config.max_delay.as_secs_f64());

        let range = capped * self.config.jitter_ratio;
        let jitter = if range > 0.0 {
            rand::thread_rng().gen_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_secs_f64((capped + jitter).max(0.0))
    }
}

type AttemptHook = Arc<dyn Fn(u32, Duration) + Send + Sync>;
type FailureHook = Arc<dyn Fn(&RpcError) + Send + Sync>;

/// Retry budget plus optional progress hooks
#[derive(Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    backoff: ExponentialBackoff,
    on_attempt: Option<AttemptHook>,
    on_failure: Option<FailureHook>,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            backoff: ExponentialBackoff::new(config.clone()),
            config,
            on_attempt: None,
            on_failure: None,
        }
    }

    /// Called with `(attempt, delay)` before every attempt; attempts count from 1
    pub fn on_attempt<F>(mut self, hook: F) -> Self
    where
        F: Fn(u32, Duration) + Send + Sync + 'static,
    {
        self.on_attempt = Some(Arc::new(hook));
        self
    }

    /// Called once when the retry budget is exhausted
    pub fn on_failure<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RpcError) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(hook));
        self
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Try `connector` until it succeeds, the budget runs out, or `cancel`
    /// fires. `emit` sees a `Reconnecting` event per attempt.
    pub(crate) async fn run(
        &self,
        connector: &dyn Connector,
        cancel: &CancellationToken,
        emit: impl Fn(ConnectionEvent),
    ) -> RpcResult<Connection> {
        let mut last_error = None;

        for attempt in 0..self.config.max_retries {
            let delay = self.backoff.delay_for_attempt(attempt);
            let number = attempt + 1;
            if let Some(hook) = &self.on_attempt {
                hook(number, delay);
            }
            emit(ConnectionEvent::Reconnecting {
                attempt: number,
                delay,
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RpcError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            match connector.connect().await {
                Ok(connection) => {
                    info!(attempt = number, "reconnected");
                    return Ok(connection);
                }
                Err(e) => {
                    warn!(attempt = number, max_retries = self.config.max_retries, error = %e, "reconnection attempt failed");
                    last_error = Some(e);
                }
            }
        }

        let err = RpcError::other(format!(
            "gave up reconnecting after {} attempts: {}",
            self.config.max_retries,
            last_error.map_or_else(|| "no attempts allowed".to_string(), |e| e.to_string())
        ));
        if let Some(hook) = &self.on_failure {
            hook(&err);
        }
        Err(err)
    }
}

impl std::fmt::Debug for ReconnectPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectPolicy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
