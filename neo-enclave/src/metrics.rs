//! Prometheus metrics for the enclave.
//!
//! Each [`crate::Enclave`] owns its own [`Registry`], so several enclaves in
//! one process (tests, side-by-side deployments) never share counters. The
//! host pulls the text exposition through the `get_metrics` boundary call.
//! Label values are drawn from closed sets: error codes, op tags and
//! trigger kinds.

use crate::triggers::TriggerKind;
use prometheus::{
    exponential_buckets, Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

const NAMESPACE: &str = "neo_enclave";

/// Outcome label of a successful execution; failures use their error code.
pub const OUTCOME_SUCCESS: &str = "success";

/// Status label of a boundary call that succeeded; failures use their error code.
pub const STATUS_OK: &str = "ok";

/// Counters and histograms of one enclave.
#[derive(Clone)]
pub struct EnclaveMetrics {
    registry: Registry,
    executions: IntCounterVec,
    execution_gas: Histogram,
    execution_seconds: Histogram,
    gas_used: IntCounterVec,
    triggers_processed: IntCounterVec,
    boundary_calls: IntCounterVec,
}

impl EnclaveMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let executions = IntCounterVec::new(
            Opts::new("executions_total", "Script executions by outcome").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let execution_gas = Histogram::with_opts(
            HistogramOpts::new("execution_gas_used", "Gas consumed per script execution")
                .namespace(NAMESPACE)
                .buckets(exponential_buckets(1_000.0, 4.0, 10)?),
        )?;
        let execution_seconds = Histogram::with_opts(
            HistogramOpts::new("execution_duration_seconds", "Wall-clock time per script execution")
                .namespace(NAMESPACE)
                .buckets(exponential_buckets(0.001, 2.0, 14)?),
        )?;
        let gas_used = IntCounterVec::new(
            Opts::new("gas_used_total", "Gas consumed by script executions").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let triggers_processed = IntCounterVec::new(
            Opts::new("triggers_processed_total", "Successful trigger executions by kind")
                .namespace(NAMESPACE),
            &["kind"],
        )?;
        let boundary_calls = IntCounterVec::new(
            Opts::new("boundary_calls_total", "Boundary requests by op and status")
                .namespace(NAMESPACE),
            &["op", "status"],
        )?;

        registry.register(Box::new(executions.clone()))?;
        registry.register(Box::new(execution_gas.clone()))?;
        registry.register(Box::new(execution_seconds.clone()))?;
        registry.register(Box::new(gas_used.clone()))?;
        registry.register(Box::new(triggers_processed.clone()))?;
        registry.register(Box::new(boundary_calls.clone()))?;

        Ok(Self {
            registry,
            executions,
            execution_gas,
            execution_seconds,
            gas_used,
            triggers_processed,
            boundary_calls,
        })
    }

    /// Record one finished execution. `outcome` is [`OUTCOME_SUCCESS`] or
    /// the execution's error code.
    pub fn observe_execution(&self, outcome: &str, gas_used: u64, elapsed: Duration) {
        self.executions.with_label_values(&[outcome]).inc();
        self.gas_used.with_label_values(&[outcome]).inc_by(gas_used);
        self.execution_gas.observe(gas_used as f64);
        self.execution_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn observe_triggers(&self, kind: TriggerKind, processed: usize) {
        self.triggers_processed
            .with_label_values(&[kind.as_str()])
            .inc_by(processed as u64);
    }

    /// Record a boundary request. `status` is [`STATUS_OK`] or the error code.
    pub fn observe_call(&self, op: &str, status: &str) {
        self.boundary_calls.with_label_values(&[op, status]).inc();
    }

    pub fn executions(&self, outcome: &str) -> u64 {
        self.executions.with_label_values(&[outcome]).get()
    }

    pub fn total_gas_used(&self) -> u64 {
        self.registry
            .gather()
            .iter()
            .filter(|family| family.get_name() == format!("{NAMESPACE}_gas_used_total"))
            .flat_map(|family| family.get_metric())
            .map(|metric| metric.get_counter().get_value() as u64)
            .sum()
    }

    pub fn triggers_processed(&self, kind: TriggerKind) -> u64 {
        self.triggers_processed
            .with_label_values(&[kind.as_str()])
            .get()
    }

    pub fn boundary_calls(&self, op: &str, status: &str) -> u64 {
        self.boundary_calls.with_label_values(&[op, status]).get()
    }

    /// Everything in the Prometheus text exposition format.
    pub fn gather_text(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl std::fmt::Debug for EnclaveMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnclaveMetrics").finish_non_exhaustive()
    }
}
