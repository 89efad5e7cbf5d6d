//! Script execution engine.
//!
//! Owns the per-call sandbox lifecycle: validate the context, start an
//! isolated interpreter on its own thread, bind `INPUT`/`SECRETS`, run
//! `main(INPUT)` under the gas and time caps, and tear everything down on
//! every exit path. Errors leaving this module carry sanitized messages only.
//!
//! With a [`GasLedger`] attached, every execution that passes validation is
//! charged to its user and function, failed runs included. With
//! [`EnclaveMetrics`] attached, every execution is counted by outcome.

use crate::config::ExecutionConfig;
use crate::error::{ExecutionError, ExecutionResult};
use crate::gas::GasLedger;
use crate::metrics::{EnclaveMetrics, OUTCOME_SUCCESS};
use crate::script::{run_script, Limits};
use crate::secrets::{Redactor, SecretSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Longest error message handed back to callers, in characters.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 256;

const INTERPRETER_STACK_BYTES: usize = 16 * 1024 * 1024;

/// Collapse whitespace, strip control characters and bound the length of a
/// message that is about to leave the enclave.
pub fn sanitize_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len().min(MAX_ERROR_MESSAGE_CHARS + 3));
    let mut count = 0;
    let mut last_was_space = true;
    for c in message.chars() {
        let c = if c.is_control() || c.is_whitespace() { ' ' } else { c };
        if c == ' ' {
            if last_was_space {
                continue;
            }
            last_was_space = true;
        } else {
            last_was_space = false;
        }
        if count == MAX_ERROR_MESSAGE_CHARS {
            out.push_str("...");
            break;
        }
        out.push(c);
        count += 1;
    }
    out.trim_end().to_string()
}

/// Inputs and accounting of one execution. Created right before a run and
/// discarded after it.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub function_id: String,
    pub user_id: String,
    pub code: String,
    pub input: Value,
    pub secrets: SecretSet,
    pub gas_limit: u64,
    /// Gas consumed by the last run, including failed runs.
    pub gas_used: u64,
    /// Result of the last successful run.
    pub result: Option<Value>,
}

impl ExecutionContext {
    pub fn new(
        function_id: impl Into<String>,
        user_id: impl Into<String>,
        code: impl Into<String>,
        input: Value,
        gas_limit: u64,
    ) -> Self {
        Self {
            function_id: function_id.into(),
            user_id: user_id.into(),
            code: code.into(),
            input,
            secrets: SecretSet::new(),
            gas_limit,
            gas_used: 0,
            result: None,
        }
    }

    pub fn with_secrets(mut self, secrets: SecretSet) -> Self {
        self.secrets = secrets;
        self
    }

    fn validate(&self) -> ExecutionResult<()> {
        if self.function_id.is_empty() {
            return Err(ExecutionError::InvalidContext("function id is required".into()));
        }
        if self.user_id.is_empty() {
            return Err(ExecutionError::InvalidContext("user id is required".into()));
        }
        if self.code.trim().is_empty() {
            return Err(ExecutionError::InvalidContext("code is required".into()));
        }
        if self.gas_limit == 0 {
            return Err(ExecutionError::InvalidContext("gas limit must be positive".into()));
        }
        Ok(())
    }
}

/// Result of a successful execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub result: Value,
    pub gas_used: u64,
    pub logs: Vec<String>,
    /// Hex SHA-256 of the executed code.
    pub code_hash: String,
}

/// Runs scripts under the configured limits.
#[derive(Debug, Clone)]
pub struct ScriptEngine {
    config: ExecutionConfig,
    ledger: Option<Arc<GasLedger>>,
    metrics: Option<Arc<EnclaveMetrics>>,
}

impl ScriptEngine {
    pub fn new(config: ExecutionConfig) -> Self {
        Self {
            config,
            ledger: None,
            metrics: None,
        }
    }

    /// Charge every execution to the ledger.
    pub fn with_gas_ledger(mut self, ledger: Arc<GasLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EnclaveMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Execute `context.code`, recording gas use and the result on the context.
    pub fn execute(&self, context: &mut ExecutionContext) -> ExecutionResult<ExecutionOutput> {
        let started = Instant::now();
        let result = self.execute_accounted(context);
        if let Some(metrics) = &self.metrics {
            let outcome = match &result {
                Ok(_) => OUTCOME_SUCCESS,
                Err(err) => err.code(),
            };
            metrics.observe_execution(outcome, context.gas_used, started.elapsed());
        }
        result
    }

    fn execute_accounted(&self, context: &mut ExecutionContext) -> ExecutionResult<ExecutionOutput> {
        context.gas_used = 0;
        context.result = None;
        context.validate()?;

        let Some(ledger) = &self.ledger else {
            return self.run(context);
        };
        let session = ledger.start_accounting(&context.function_id, &context.user_id)?;
        let requested = context.gas_limit;
        context.gas_limit = session.gas_limit(requested);
        let result = self.run(context);
        context.gas_limit = requested;

        if let Err(err) = ledger.stop_accounting(session, context.gas_used) {
            error!(
                function_id = %context.function_id,
                gas_used = context.gas_used,
                error = %err,
                "failed to record gas usage"
            );
        }
        result
    }

    fn run(&self, context: &mut ExecutionContext) -> ExecutionResult<ExecutionOutput> {
        let code_hash = hex::encode(Sha256::digest(context.code.as_bytes()));
        let limits = Limits {
            max_call_depth: self.config.max_call_depth,
            max_log_lines: self.config.max_log_lines,
            timeout: self.config.timeout(),
        };
        let code = context.code.clone();
        let input = context.input.clone();
        let secrets = context.secrets.to_json();
        let gas_limit = context.gas_limit;

        let handle = std::thread::Builder::new()
            .name("script-interpreter".to_string())
            .stack_size(INTERPRETER_STACK_BYTES)
            .spawn(move || run_script(&code, &input, &secrets, gas_limit, limits))
            .map_err(|e| ExecutionError::runtime(format!("cannot start interpreter: {}", e)))?;
        let outcome = handle
            .join()
            .map_err(|_| ExecutionError::runtime("interpreter fault"))?;

        context.gas_used = outcome.gas_used;
        let redactor = context.secrets.redactor();
        let mut redacted = 0;
        let logs: Vec<String> = outcome
            .logs
            .into_iter()
            .map(|line| match redactor.redact_str(&line) {
                Some(clean) => {
                    redacted += 1;
                    clean
                }
                None => line,
            })
            .collect();
        let result = outcome.result.map(|mut value| {
            redacted += redactor.redact_json(&mut value);
            value
        });
        if redacted > 0 {
            warn!(
                function_id = %context.function_id,
                redacted,
                "secret values removed from script output"
            );
        }

        let result = result.and_then(|value| {
            let size = serde_json::to_vec(&value).map(|bytes| bytes.len()).unwrap_or(usize::MAX);
            if size > self.config.max_output_bytes {
                return Err(ExecutionError::runtime(format!(
                    "output exceeds {} bytes",
                    self.config.max_output_bytes
                )));
            }
            Ok(value)
        });

        match result {
            Ok(value) => {
                debug!(
                    function_id = %context.function_id,
                    gas_used = outcome.gas_used,
                    "script executed"
                );
                context.result = Some(value.clone());
                Ok(ExecutionOutput {
                    result: value,
                    gas_used: outcome.gas_used,
                    logs,
                    code_hash,
                })
            }
            Err(err) => {
                let err = sanitize(err, &redactor);
                warn!(
                    function_id = %context.function_id,
                    gas_used = outcome.gas_used,
                    code = err.code(),
                    "script execution failed"
                );
                Err(err)
            }
        }
    }
}

fn sanitize(err: ExecutionError, redactor: &Redactor) -> ExecutionError {
    let clean = |message: String| {
        let message = redactor.redact_str(&message).unwrap_or(message);
        sanitize_message(&message)
    };
    match err {
        ExecutionError::Runtime { message } => ExecutionError::Runtime {
            message: clean(message),
        },
        ExecutionError::Syntax {
            message,
            line,
            column,
        } => ExecutionError::Syntax {
            message: clean(message),
            line,
            column,
        },
        other => other,
    }
}
