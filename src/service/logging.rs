//! Logging decorator for the adapter service

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

use super::Service;
use crate::channel::Channel;
use crate::connection::ConnectionContext;
use crate::error::AdapterResult;
use crate::registry::Subscription;

/// Logs every service call with its duration and outcome
pub struct LoggingMiddleware<S> {
    inner: S,
}

impl<S: Service> LoggingMiddleware<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

fn log_outcome<T>(
    method: &str,
    ctx: &ConnectionContext,
    channel: &Channel,
    started: Instant,
    result: &AdapterResult<T>,
) {
    let took_ms = started.elapsed().as_secs_f64() * 1000.0;
    match result {
        Ok(_) => tracing::info!(
            method,
            connection_id = %ctx.id(),
            channel = %channel,
            took_ms,
            "Method completed without errors"
        ),
        Err(e) => tracing::warn!(
            method,
            connection_id = %ctx.id(),
            channel = %channel,
            took_ms,
            error = %e,
            "Method failed"
        ),
    }
}

#[async_trait]
impl<S: Service> Service for LoggingMiddleware<S> {
    async fn publish(
        &self,
        ctx: &Arc<ConnectionContext>,
        channel: &Channel,
        token: &str,
        content_type: &str,
        payload: Vec<u8>,
    ) -> AdapterResult<()> {
        let started = Instant::now();
        let result = self
            .inner
            .publish(ctx, channel, token, content_type, payload)
            .await;
        log_outcome("publish", ctx, channel, started, &result);
        result
    }

    async fn subscribe(
        &self,
        ctx: &Arc<ConnectionContext>,
        channel: &Channel,
        token: &str,
    ) -> AdapterResult<Subscription> {
        let started = Instant::now();
        let result = self.inner.subscribe(ctx, channel, token).await;
        log_outcome("subscribe", ctx, channel, started, &result);
        result
    }

    async fn unsubscribe(
        &self,
        ctx: &Arc<ConnectionContext>,
        channel: &Channel,
    ) -> AdapterResult<bool> {
        let started = Instant::now();
        let result = self.inner.unsubscribe(ctx, channel).await;
        log_outcome("unsubscribe", ctx, channel, started, &result);
        result
    }
}
