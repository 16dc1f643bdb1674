//! Metrics decorator for the adapter service

use ::metrics::{counter, histogram};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

use super::Service;
use crate::channel::Channel;
use crate::connection::ConnectionContext;
use crate::error::AdapterResult;
use crate::metrics::{REQUEST_COUNT, REQUEST_ERRORS, REQUEST_LATENCY_SECONDS};
use crate::registry::Subscription;

/// Counts calls and records their latency, labelled by method
pub struct MetricsMiddleware<S> {
    inner: S,
}

impl<S: Service> MetricsMiddleware<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

fn record<T>(method: &'static str, started: Instant, result: &AdapterResult<T>) {
    counter!(REQUEST_COUNT, "method" => method).increment(1);
    histogram!(REQUEST_LATENCY_SECONDS, "method" => method)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = result {
        counter!(REQUEST_ERRORS, "method" => method, "error" => e.code()).increment(1);
    }
}

#[async_trait]
impl<S: Service> Service for MetricsMiddleware<S> {
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
        record("publish", started, &result);
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
        record("subscribe", started, &result);
        result
    }

    async fn unsubscribe(
        &self,
        ctx: &Arc<ConnectionContext>,
        channel: &Channel,
    ) -> AdapterResult<bool> {
        let started = Instant::now();
        let result = self.inner.unsubscribe(ctx, channel).await;
        record("unsubscribe", started, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdapterError;
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn test_records_requests_and_errors() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        ::metrics::with_local_recorder(&recorder, || {
            let ok: AdapterResult<()> = Ok(());
            let err: AdapterResult<()> = Err(AdapterError::Unauthorized("denied".into()));
            record("publish", Instant::now(), &ok);
            record("publish", Instant::now(), &err);
        });

        let output = handle.render();
        assert!(output.contains("ws_adapter_api_request_count{method=\"publish\"} 2"));
        assert!(output.contains("ws_adapter_api_request_errors"));
        assert!(output.contains("error=\"unauthorized\""));
        assert!(output.contains("ws_adapter_api_request_latency_seconds"));
    }
}
