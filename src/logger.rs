use std::{path::Path, time::Instant};

use anyhow::Result;
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use tracing::{info, warn};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

/// Install the global subscriber: console output plus, with a `log_dir`, a
/// daily rolling text log and a JSON log of RPC calls.
///
/// Keep the returned guards alive for as long as logs should be flushed.
pub fn init_tracing(log_level: &str, log_dir: Option<&Path>) -> Result<Vec<WorkerGuard>> {
    let console = fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::try_new(log_level)?);

    let mut guards = Vec::new();
    let files = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let (txt_writer, txt_guard) = tracing_appender::non_blocking(
                RollingFileAppender::new(Rotation::DAILY, dir, "pipeline_bridge.log"),
            );
            let (json_writer, json_guard) = tracing_appender::non_blocking(
                RollingFileAppender::new(Rotation::DAILY, dir, "rpc_calls.json"),
            );
            guards.push(txt_guard);
            guards.push(json_guard);

            let txt = fmt::layer()
                .with_writer(txt_writer)
                .with_ansi(false)
                .with_filter(EnvFilter::try_new(log_level)?);
            // one line per call, emitted by `RpcTelemetry`
            let json = fmt::layer()
                .json()
                .with_writer(json_writer)
                .with_target(true)
                .with_filter(EnvFilter::new("rpc=info"));
            Some(txt.and_then(json))
        }
        None => None,
    };

    Registry::default().with(console).with(files).try_init()?;
    Ok(guards)
}

/// Counters and latency for calls made to external applications.
#[derive(Clone)]
pub struct RpcTelemetry {
    calls_started: Counter<u64>,
    calls_succeeded: Counter<u64>,
    calls_failed: Counter<u64>,
    call_latency_ms: Histogram<f64>,
}

impl RpcTelemetry {
    pub fn new() -> Self {
        // no-op provider unless the embedding process installs one
        let meter = global::meter("pipeline_bridge");
        Self {
            calls_started: meter
                .u64_counter("rpc_calls_started")
                .with_description("Calls sent to external applications")
                .build(),
            calls_succeeded: meter.u64_counter("rpc_calls_succeeded").build(),
            calls_failed: meter.u64_counter("rpc_calls_failed").build(),
            call_latency_ms: meter
                .f64_histogram("rpc_call_latency_ms")
                .with_description("Latency per call in ms")
                .with_unit("ms")
                .build(),
        }
    }

    /// Run `call`, recording its outcome and latency under `method`.
    pub async fn instrument<F, Fut, T, E>(&self, method: &str, call: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attrs = [KeyValue::new("method", method.to_string())];
        self.calls_started.add(1, &attrs);
        let start = Instant::now();

        let result = call().await;

        let elapsed = start.elapsed().as_secs_f64() * 1_000.0;
        self.call_latency_ms.record(elapsed, &attrs);
        match &result {
            Ok(_) => {
                self.calls_succeeded.add(1, &attrs);
                info!(target: "rpc", method, latency_ms = elapsed, ok = true, "rpc call finished");
            }
            Err(e) => {
                self.calls_failed.add(1, &attrs);
                warn!(target: "rpc", method, latency_ms = elapsed, ok = false, error = %e, "rpc call failed");
            }
        }
        result
    }
}

impl Default for RpcTelemetry {
    fn default() -> Self {
        Self::new()
    }
}
