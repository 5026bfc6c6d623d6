//! Invocation runtime: one logical agent call around the generator.
//!
//! Per call: circuit check, then `BUDGETING -> CALLING -> (RETRY_WAIT ->
//! CALLING)* -> PARSING -> VALIDATING -> (REPAIR -> BUDGETING)*`, ending in an
//! accepted envelope or one of the [`InvokeError`] variants.

pub mod breaker;
pub mod retry;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::core::budget::{BudgetLevel, TokenBudget};
use crate::core::parser::{ParseTier, extract_thinking, parse_response};
use crate::core::quality::check_quality;
use crate::core::types::{
    CIRCUIT_OPEN, MessageEnvelope, ResponseEnvelope, Status, ValidatedResponse,
};
use crate::core::validator::validate_for_mode;
use crate::io::config::{ForgeConfig, LimitsConfig};
use crate::io::generator::{CompletionRequest, Generator, TransportError};
use crate::io::prompt::PromptRenderer;

use breaker::{BreakerKey, BreakerStore, InMemoryBreakerStore, is_open};
use retry::{RetryPolicy, Sleeper, ThreadSleeper};

/// An accepted agent response.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub envelope: ResponseEnvelope,
    /// Generator calls made, retries included.
    pub attempts: u32,
    pub repairs: u32,
    pub tier: ParseTier,
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("circuit open for {key} after {failures} consecutive failures")]
    CircuitOpen { key: BreakerKey, failures: u32 },
    #[error("response still invalid after {repairs} repair attempts: {}", .errors.join("; "))]
    RepairsExhausted {
        /// Terminal `BLOCKED` envelope with the errors appended to its summary.
        envelope: Box<ResponseEnvelope>,
        errors: Vec<String>,
        repairs: u32,
    },
    #[error("response unparseable after {repairs} repair attempts: {}", .errors.join("; "))]
    Unparseable {
        envelope: Box<ResponseEnvelope>,
        errors: Vec<String>,
        repairs: u32,
    },
    #[error("generator call failed after {attempts} attempts")]
    Transport {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl InvokeError {
    pub fn kind(&self) -> &'static str {
        match self {
            InvokeError::CircuitOpen { .. } => CIRCUIT_OPEN,
            InvokeError::RepairsExhausted { .. } => "repairs_exhausted",
            InvokeError::Unparseable { .. } => "unparseable",
            InvokeError::Transport { source, .. } => source.kind(),
            InvokeError::Other(_) => "internal",
        }
    }

    /// Diagnostics to attach beside the terminal envelope.
    pub fn diagnostics(&self) -> Vec<String> {
        match self {
            InvokeError::RepairsExhausted { errors, .. }
            | InvokeError::Unparseable { errors, .. } => errors.clone(),
            InvokeError::Transport { attempts, source } => {
                vec![format!("{source} (after {attempts} attempts)")]
            }
            other => vec![other.to_string()],
        }
    }

    /// Render the failure as the terminal envelope callers hand onwards:
    /// `BLOCKED` for an open circuit or exhausted repairs, `FAIL` otherwise.
    pub fn into_envelope(self, request_id: &str) -> ResponseEnvelope {
        match self {
            InvokeError::CircuitOpen { key, failures } => {
                let summary = format!(
                    "circuit breaker open for {key} after {failures} consecutive failures; \
                     reset required before retrying"
                );
                ResponseEnvelope::terminal(request_id, Status::Blocked, summary)
            }
            InvokeError::RepairsExhausted { envelope, .. }
            | InvokeError::Unparseable { envelope, .. } => *envelope,
            InvokeError::Transport { attempts, source } => ResponseEnvelope::terminal(
                request_id,
                Status::Fail,
                format!(
                    "generator call failed after {attempts} attempts ({}): {source}",
                    source.kind()
                ),
            ),
            InvokeError::Other(err) => ResponseEnvelope::terminal(
                request_id,
                Status::Fail,
                format!("internal error: {err:#}"),
            ),
        }
    }
}

/// Something that turns a request into a validated response: the in-process
/// runtime or the remote invocation service.
pub trait AgentInvoker: Send + Sync {
    /// Terminal failures come back as `BLOCKED`/`FAIL` envelopes; `Err` is
    /// reserved for failures that produced no envelope at all.
    fn dispatch(&self, request: &MessageEnvelope) -> Result<ValidatedResponse>;
}

impl<T: AgentInvoker + ?Sized> AgentInvoker for Arc<T> {
    fn dispatch(&self, request: &MessageEnvelope) -> Result<ValidatedResponse> {
        (**self).dispatch(request)
    }
}

pub struct InvocationRuntime<G: Generator> {
    generator: G,
    prompts: PromptRenderer,
    breaker: Arc<dyn BreakerStore>,
    sleeper: Arc<dyn Sleeper>,
    retry: RetryPolicy,
    max_repairs: u32,
    breaker_threshold: u32,
    timeout: Duration,
    limits: LimitsConfig,
}

impl<G: Generator> InvocationRuntime<G> {
    pub fn new(generator: G, config: &ForgeConfig) -> Result<Self> {
        Ok(Self {
            generator,
            prompts: PromptRenderer::new(config.runtime.prompts_dir.clone())?,
            breaker: Arc::new(InMemoryBreakerStore::new()),
            sleeper: Arc::new(ThreadSleeper),
            retry: RetryPolicy::from_config(&config.runtime),
            max_repairs: config.runtime.max_repairs,
            breaker_threshold: config.breaker.threshold,
            timeout: config.generator.timeout(),
            limits: config.limits.clone(),
        })
    }

    pub fn with_breaker_store(mut self, store: Arc<dyn BreakerStore>) -> Self {
        self.breaker = store;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Per-call timeout: the configured generator timeout, tightened by the
    /// request's own limit when it sets one.
    fn call_timeout(&self, request: &MessageEnvelope) -> Duration {
        match request.limits.timeout_secs {
            0 => self.timeout,
            secs => self.timeout.min(Duration::from_secs(secs)),
        }
    }

    #[instrument(
        skip_all,
        fields(role = %request.agent, mode = %request.mode, request_id = %request.request_id)
    )]
    pub fn invoke(&self, request: &MessageEnvelope) -> Result<Invocation, InvokeError> {
        let started = Instant::now();
        let key = BreakerKey::new(&request.project_id, request.agent, request.mode);
        let failures = self.breaker.failures(&key);
        if is_open(failures, self.breaker_threshold) {
            warn!(key = %key, failures, "circuit open; skipping generator call");
            let err = InvokeError::CircuitOpen { key, failures };
            log_agent_call(request, started, None, &CallSummary::failed(&err, 0, 0));
            return Err(err);
        }

        let system = self.prompts.system_prompt(request.agent, request.mode)?;
        let base_user = self.prompts.user_message(request)?;
        let mut user = base_user.clone();
        let mut attempts = 0u32;
        let mut repairs = 0u32;

        loop {
            let budget = TokenBudget::calculate(
                &system,
                &user,
                self.generator.model(),
                self.limits.ceiling_for(request.mode),
            );
            match budget.level() {
                BudgetLevel::Normal => {}
                BudgetLevel::Warn => warn!(
                    utilization_pct = budget.utilization_pct,
                    input_tokens = budget.input_total,
                    "prompt uses a large share of the context window"
                ),
                BudgetLevel::Escalate => error!(
                    utilization_pct = budget.utilization_pct,
                    input_tokens = budget.input_total,
                    max_tokens = budget.effective_max_tokens(),
                    "prompt near context limit; output ceiling clamped"
                ),
            }

            let completion_request = CompletionRequest {
                system: system.clone(),
                user: user.clone(),
                max_tokens: budget.effective_max_tokens(),
                timeout: self.call_timeout(request),
            };
            let completion = match self.complete_with_retry(&completion_request) {
                Ok((completion, used)) => {
                    attempts += used;
                    completion
                }
                Err((used, source)) => {
                    attempts += used;
                    self.breaker.record_failure(&key);
                    let err = InvokeError::Transport { attempts, source };
                    let summary = CallSummary::failed(&err, attempts, repairs);
                    log_agent_call(request, started, Some(&budget), &summary);
                    return Err(err);
                }
            };

            let thinking = extract_thinking(&completion.text);
            debug!(
                thinking_chars = thinking.len(),
                response_chars = completion.text.len(),
                stop_reason = ?completion.stop_reason,
                "completion received"
            );

            let outcome = parse_response(&completion.text, &request.request_id);
            let (errors, reason) = if outcome.tier == ParseTier::Failed {
                (
                    outcome.errors.clone(),
                    "response could not be parsed as a ResponseEnvelope",
                )
            } else {
                let errors = validate_for_mode(
                    &outcome.envelope,
                    request.agent,
                    request.mode,
                    request.task_id.as_deref(),
                );
                if errors.is_empty() {
                    (
                        check_quality(request.agent, &outcome.envelope),
                        "artifacts failed the quality check",
                    )
                } else {
                    (errors, "response failed validation for this mode")
                }
            };

            if errors.is_empty() {
                self.breaker.record_success(&key);
                let invocation = Invocation {
                    envelope: outcome.envelope,
                    attempts,
                    repairs,
                    tier: outcome.tier,
                };
                let summary = CallSummary::accepted(&invocation);
                log_agent_call(request, started, Some(&budget), &summary);
                return Ok(invocation);
            }

            if repairs >= self.max_repairs {
                self.breaker.record_failure(&key);
                let err = exhausted(outcome.envelope, outcome.tier, errors, repairs);
                let summary = CallSummary::failed(&err, attempts, repairs);
                log_agent_call(request, started, Some(&budget), &summary);
                return Err(err);
            }

            repairs += 1;
            warn!(
                repair = repairs,
                tier = outcome.tier.as_str(),
                errors = errors.len(),
                reason,
                "requesting repair"
            );
            let block = self.prompts.repair_block(repairs, reason, &errors)?;
            user = format!("{base_user}\n\n{block}");
        }
    }

    /// Returns the completion and the number of calls it took, or the calls
    /// made and the last error.
    fn complete_with_retry(
        &self,
        request: &CompletionRequest,
    ) -> Result<(crate::io::generator::Completion, u32), (u32, TransportError)> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.generator.complete(request) {
                Ok(completion) => return Ok((completion, attempt)),
                Err(err) if err.is_retryable() && self.retry.has_attempts_left(attempt) => {
                    let wait = self.retry.backoff(attempt);
                    warn!(
                        attempt,
                        kind = err.kind(),
                        wait_secs = wait.as_secs(),
                        "transient generator failure; retrying"
                    );
                    self.sleeper.sleep(wait);
                }
                Err(err) => {
                    warn!(
                        attempt,
                        kind = err.kind(),
                        retryable = err.is_retryable(),
                        "generator call failed"
                    );
                    return Err((attempt, err));
                }
            }
        }
    }
}

impl<G: Generator> AgentInvoker for InvocationRuntime<G> {
    fn dispatch(&self, request: &MessageEnvelope) -> Result<ValidatedResponse> {
        match self.invoke(request) {
            Ok(invocation) => Ok(ValidatedResponse::new(invocation.envelope, Vec::new())),
            Err(InvokeError::Other(err)) => Err(err),
            Err(err) => {
                let diagnostics = err.diagnostics();
                let kind = err.kind();
                let envelope = err.into_envelope(&request.request_id);
                Ok(ValidatedResponse::new(envelope, diagnostics).with_failure_kind(kind))
            }
        }
    }
}

fn exhausted(
    mut envelope: ResponseEnvelope,
    tier: ParseTier,
    errors: Vec<String>,
    repairs: u32,
) -> InvokeError {
    if tier == ParseTier::Failed {
        return InvokeError::Unparseable {
            envelope: Box::new(envelope),
            errors,
            repairs,
        };
    }
    let enforcement = format!(
        "[validator] rejected after {repairs} repair attempts: {}",
        errors.join("; ")
    );
    let summary = match envelope.summary.take() {
        Some(summary) if !summary.trim().is_empty() => {
            format!("{}\n\n{enforcement}", summary.trim())
        }
        _ => enforcement,
    };
    envelope.summary = Some(summary);
    envelope.status = Status::Blocked;
    InvokeError::RepairsExhausted {
        envelope: Box::new(envelope),
        errors,
        repairs,
    }
}

struct CallSummary {
    status: String,
    artifacts: usize,
    attempts: u32,
    repairs: u32,
    outcome: &'static str,
}

impl CallSummary {
    fn accepted(invocation: &Invocation) -> Self {
        Self {
            status: invocation.envelope.status.to_string(),
            artifacts: invocation.envelope.artifacts.len(),
            attempts: invocation.attempts,
            repairs: invocation.repairs,
            outcome: invocation.tier.as_str(),
        }
    }

    fn failed(err: &InvokeError, attempts: u32, repairs: u32) -> Self {
        let status = match err {
            InvokeError::CircuitOpen { .. } | InvokeError::RepairsExhausted { .. } => {
                Status::Blocked
            }
            _ => Status::Fail,
        };
        Self {
            status: status.to_string(),
            artifacts: 0,
            attempts,
            repairs,
            outcome: err.kind(),
        }
    }
}

fn log_agent_call(
    request: &MessageEnvelope,
    started: Instant,
    budget: Option<&TokenBudget>,
    summary: &CallSummary,
) {
    info!(
        event = "agent_call",
        project_id = %request.project_id,
        role = %request.agent,
        mode = %request.mode,
        request_id = %request.request_id,
        task_id = request.task_id.as_deref().unwrap_or(""),
        duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        system_tokens = budget.map_or(0, |b| b.system_tokens),
        user_tokens = budget.map_or(0, |b| b.user_tokens),
        utilization_pct = budget.map_or(0.0, |b| b.utilization_pct),
        status = %summary.status,
        artifacts = summary.artifacts,
        attempts = summary.attempts,
        repairs = summary.repairs,
        outcome = summary.outcome,
        "agent call finished"
    );
}
