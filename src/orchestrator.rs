//! Drives the round/model loop for one request: classifies the tier, orders
//! the model list, attempts each eligible model in turn, and interprets
//! failures into exclude/round-skip/cooldown verdicts. The error → (reason,
//! penalty, cooldown, policy) table below is a fixed classification table.

use crate::config::{ConfigSnapshot, TierId};
use crate::error::UpstreamError;
use crate::health::HealthStore;
use crate::metrics::{ACTIVE_ATTEMPTS, FAILURES_TOTAL, REQUESTS_TOTAL, REQUEST_DURATION_SECONDS};
use crate::protocol::openai::{ChatCompletionRequest, ChatCompletionResponse};
use crate::strategy::order_models;
use crate::tier::{TierClassifier, TraceEmitter};
use crate::trace::{now_unix_ms, EventStatus, Stage, TraceBus, TraceEvent};
use crate::upstream::{AttemptTrace, UpstreamCaller};
use std::collections::HashSet;
use std::time::Instant;
use uuid::Uuid;

pub struct FailoverOrchestrator {
    classifier: TierClassifier,
    caller: UpstreamCaller,
    health: std::sync::Arc<HealthStore>,
    bus: std::sync::Arc<TraceBus>,
}

/// What to do with a model after one failed attempt.
enum Verdict {
    HardExclude,
    RoundSkip,
}

fn classify_error(error: &UpstreamError) -> (String, f64, u64, Verdict) {
    match error {
        UpstreamError::FirstTokenTimeout => (error.reason(), 0.5, 0, Verdict::RoundSkip),
        UpstreamError::TotalTimeout => (error.reason(), 0.5, 0, Verdict::RoundSkip),
        UpstreamError::ConnectTimeout => (error.reason(), 0.5, 0, Verdict::RoundSkip),
        UpstreamError::StatusCode(429) => (error.reason(), 10.0, 60, Verdict::HardExclude),
        UpstreamError::StatusCode(401) | UpstreamError::StatusCode(403) => {
            (error.reason(), 50.0, 300, Verdict::HardExclude)
        }
        UpstreamError::StatusCode(404) => (error.reason(), 1.0, 0, Verdict::HardExclude),
        UpstreamError::StatusCode(_) => (error.reason(), 1.0, 0, Verdict::RoundSkip),
        UpstreamError::Keyword(_) => (error.reason(), 10.0, 60, Verdict::RoundSkip),
        UpstreamError::EmptyResponse => (error.reason(), 1.0, 0, Verdict::RoundSkip),
        UpstreamError::Other(_) => (error.reason(), 1.0, 0, Verdict::RoundSkip),
    }
}

struct EventSink<'a> {
    bus: &'a TraceBus,
    trace_id: &'a str,
    events: parking_lot::Mutex<Vec<TraceEvent>>,
}

impl<'a> EventSink<'a> {
    fn emit(
        &self,
        stage: Stage,
        status: EventStatus,
        duration_ms: u64,
        retry_count: u32,
        model: Option<String>,
        reason: Option<String>,
    ) {
        let event = TraceEvent {
            stage,
            timestamp_unix_ms: now_unix_ms(),
            duration_ms,
            status,
            retry_count,
            model,
            reason,
            details: None,
            trace_id: self.trace_id.to_string(),
        };
        self.bus.publish(&event);
        self.events.lock().push(event);
    }
}

impl<'a> TraceEmitter for EventSink<'a> {
    fn router_start(&self) {
        self.emit(Stage::RouterStart, EventStatus::Success, 0, 0, None, None);
    }
    fn router_end(&self, duration_ms: u64) {
        self.emit(Stage::RouterEnd, EventStatus::Success, duration_ms, 0, None, None);
    }
    fn router_fail(&self) {
        self.emit(Stage::RouterFail, EventStatus::Fail, 0, 0, None, None);
    }
}

struct FirstTokenSink<'a, 'b> {
    sink: &'b EventSink<'a>,
    model: String,
    retry_count: u32,
    /// Recorded by `first_token` so the orchestrator can later compute
    /// `FULL_RESPONSE.duration_ms` relative to it (generation time only)
    /// instead of the whole attempt's elapsed time.
    first_token_at: std::cell::Cell<Option<Instant>>,
}

impl<'a, 'b> AttemptTrace for FirstTokenSink<'a, 'b> {
    fn first_token(&self, duration_ms: u64, at: Instant) {
        self.first_token_at.set(Some(at));
        self.sink.emit(
            Stage::FirstToken,
            EventStatus::Success,
            duration_ms,
            self.retry_count,
            Some(self.model.clone()),
            None,
        );
    }
}

/// Outcome when every eligible (round, model) pair in the request failed.
pub struct ExhaustedError {
    pub attempt_errors: Vec<String>,
}

impl std::fmt::Display for ExhaustedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "all upstream models exhausted: {}", self.attempt_errors.join("; "))
    }
}
impl std::error::Error for ExhaustedError {}

/// Returned when the classified tier has no configured models. Not
/// retryable — the orchestrator fails immediately rather than entering the
/// round loop.
#[derive(Debug)]
pub struct ConfigurationError {
    pub tier: TierId,
}

impl std::fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no models configured for tier {}", self.tier)
    }
}
impl std::error::Error for ConfigurationError {}

pub enum RouteError {
    Configuration(ConfigurationError),
    Exhausted(ExhaustedError),
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteError::Configuration(e) => e.fmt(f),
            RouteError::Exhausted(e) => e.fmt(f),
        }
    }
}
impl std::error::Error for RouteError {}

impl FailoverOrchestrator {
    pub fn new(
        classifier: TierClassifier,
        caller: UpstreamCaller,
        health: std::sync::Arc<HealthStore>,
        bus: std::sync::Arc<TraceBus>,
    ) -> Self {
        Self {
            classifier,
            caller,
            health,
            bus,
        }
    }

    pub async fn handle(
        &self,
        request: &ChatCompletionRequest,
        config: &ConfigSnapshot,
    ) -> Result<ChatCompletionResponse, RouteError> {
        let trace_id = Uuid::new_v4().to_string();
        let sink = EventSink {
            bus: &self.bus,
            trace_id: &trace_id,
            events: parking_lot::Mutex::new(Vec::new()),
        };

        let start = Instant::now();
        sink.emit(Stage::ReqReceived, EventStatus::Success, 0, 0, None, None);

        let tier = self
            .classifier
            .classify(request, config.router(), config.models(), &sink)
            .await;
        REQUESTS_TOTAL.with_label_values(&[tier.as_str()]).inc();

        let models = config.models().tier(tier);
        if models.is_empty() {
            return Err(RouteError::Configuration(ConfigurationError { tier }));
        }

        let strategy = config.strategy_for(tier);
        let ordered = order_models(models, strategy, &self.health);
        let rounds = config.retries().rounds_for(tier);

        let mut excluded: HashSet<String> = HashSet::new();
        let mut retry_count: u32 = 0;
        let mut attempt_errors: Vec<String> = Vec::new();

        for _round in 1..=rounds {
            let mut round_failed: HashSet<String> = HashSet::new();

            for entry in &ordered {
                if excluded.contains(entry) || round_failed.contains(entry) {
                    continue;
                }
                if self.health.is_cooling_down(entry) {
                    continue;
                }

                let display_name = self.caller.display_name(entry, config);
                sink.emit(
                    Stage::ModelCallStart,
                    EventStatus::Success,
                    start.elapsed().as_millis() as u64,
                    retry_count,
                    Some(display_name.clone()),
                    None,
                );

                let attempt_start = Instant::now();
                let first_token_sink = FirstTokenSink {
                    sink: &sink,
                    model: display_name.clone(),
                    retry_count,
                    first_token_at: std::cell::Cell::new(None),
                };

                let active = ACTIVE_ATTEMPTS.with_label_values(&[tier.as_str()]);
                active.inc();
                let outcome = self.caller.call(entry, tier, request, config, &first_token_sink).await;
                active.dec();

                match outcome {
                    Ok(response) => {
                        self.health.record_success(entry);
                        // Generation time only: elapsed since this attempt's
                        // FIRST_TOKEN, not since dispatch. Falls back to the
                        // whole attempt's elapsed time if, somehow, a success
                        // was returned without a recorded first-token instant.
                        let generation_duration_ms = first_token_sink
                            .first_token_at
                            .get()
                            .map(|at| at.elapsed().as_millis() as u64)
                            .unwrap_or_else(|| attempt_start.elapsed().as_millis() as u64);
                        sink.emit(
                            Stage::FullResponse,
                            EventStatus::Success,
                            generation_duration_ms,
                            retry_count,
                            Some(display_name),
                            None,
                        );
                        self.persist_trace(&sink, &trace_id);
                        REQUEST_DURATION_SECONDS
                            .with_label_values(&[tier.as_str(), "success"])
                            .observe(start.elapsed().as_secs_f64());
                        return Ok(response);
                    }
                    Err(error) => {
                        let (reason, penalty, cooldown, verdict) = classify_error(&error);
                        self.health.record_failure(entry, penalty, cooldown);
                        FAILURES_TOTAL
                            .with_label_values(&[tier.as_str(), error.reason_kind()])
                            .inc();
                        sink.emit(
                            Stage::ModelFail,
                            EventStatus::Fail,
                            attempt_start.elapsed().as_millis() as u64,
                            retry_count,
                            Some(display_name.clone()),
                            Some(reason.clone()),
                        );
                        attempt_errors.push(format!("{display_name}: {reason}"));

                        match verdict {
                            Verdict::HardExclude => {
                                excluded.insert(entry.clone());
                            }
                            Verdict::RoundSkip => {
                                round_failed.insert(entry.clone());
                            }
                        }
                        retry_count += 1;
                    }
                }
            }
        }

        sink.emit(
            Stage::AllFailed,
            EventStatus::Fail,
            start.elapsed().as_millis() as u64,
            retry_count,
            None,
            None,
        );

        self.persist_trace(&sink, &trace_id);
        REQUEST_DURATION_SECONDS
            .with_label_values(&[tier.as_str(), "failure"])
            .observe(start.elapsed().as_secs_f64());
        Err(RouteError::Exhausted(ExhaustedError { attempt_errors }))
    }

    /// Hands the lossless per-request trace vector off to the log persistor.
    /// The persistor itself (a relational store) is an external
    /// collaborator this crate only writes to; here that hand-off is a
    /// structured log line carrying the event count, synchronous with
    /// returning so the terminal state is recorded before the caller sees
    /// a response.
    fn persist_trace(&self, sink: &EventSink<'_>, trace_id: &str) {
        let events = sink.events.lock();
        tracing::info!(
            trace_id = %trace_id,
            event_count = events.len(),
            "request trace complete"
        );
    }
}
