//! Request dispatch: route, execute, record
//!
//! The dispatcher wires the routing engine to the adapters and to both
//! telemetry ledgers. It never retries; a failed call is recorded and
//! handed back so the caller can decide what to do next.

use crate::adapter::{ErrorKind, ToolResponse};
use crate::db::{InvocationRecord, PrivacyLevel, TelemetryStore};
use crate::error::DispatchError;
use crate::events::{Event, EventLog, EventType};
use crate::routing::{estimate_tokens, RoutingDecision, RoutingEngine};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

/// One request to run
#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    pub agent: String,
    pub prompt: String,
    pub task_type: Option<String>,
    /// Correlates every event of a larger run
    pub run_id: Option<String>,
    /// Defaults to the invocation id
    pub task_id: Option<String>,
}

impl DispatchRequest {
    pub fn new(agent: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

/// What happened for one request
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub invocation_id: String,
    pub decision: RoutingDecision,
    pub response: ToolResponse,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
}

/// Routes requests to tools and records what they cost
#[derive(Debug)]
pub struct Dispatcher {
    engine: RoutingEngine,
    telemetry: Option<Arc<TelemetryStore>>,
    events: Option<Arc<EventLog>>,
    privacy: PrivacyLevel,
}

impl Dispatcher {
    pub fn new(engine: RoutingEngine) -> Self {
        Self {
            engine,
            telemetry: None,
            events: None,
            privacy: PrivacyLevel::default(),
        }
    }

    pub fn with_telemetry(mut self, store: Arc<TelemetryStore>) -> Self {
        self.telemetry = Some(store);
        self
    }

    pub fn with_events(mut self, log: Arc<EventLog>) -> Self {
        self.events = Some(log);
        self
    }

    pub fn with_privacy(mut self, level: PrivacyLevel) -> Self {
        self.privacy = level;
        self
    }

    pub fn engine(&self) -> &RoutingEngine {
        &self.engine
    }

    /// Route and run `request`, then log the invocation and its events.
    ///
    /// Tool failures come back as an error-status response inside `Ok`;
    /// routing, adapter and telemetry failures are `Err`.
    pub fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchOutcome, DispatchError> {
        let prompt_tokens = estimate_tokens(&request.prompt);
        let decision = self.engine.route(
            &request.agent,
            request.task_type.as_deref(),
            Some(prompt_tokens),
        )?;
        let adapter = self
            .engine
            .adapter(&decision.tool)
            .ok_or_else(|| DispatchError::MissingAdapter(decision.tool.clone()))?;

        let invocation_id = Uuid::new_v4().to_string();
        let task_id = request.task_id.clone().unwrap_or_else(|| invocation_id.clone());
        let base_event = |kind: EventType| {
            let mut event = Event::new(kind)
                .task_id(task_id.clone())
                .invocation_id(invocation_id.clone())
                .agent(request.agent.clone());
            event.run_id = request.run_id.clone();
            event
        };

        if decision.fallback_used {
            self.emit(
                base_event(EventType::FallbackUsed)
                    .summary(decision.reason.clone())
                    .data(json!({
                        "original_tool": decision.original_tool,
                        "original_model": decision.original_model,
                        "tool": decision.tool,
                        "model": decision.model,
                    })),
            )?;
        }

        self.emit(base_event(EventType::TaskStarted).data(json!({
            "tool": decision.tool,
            "model": decision.model,
            "reason": decision.reason,
            "fallback_used": decision.fallback_used,
        })))?;

        let start = Instant::now();
        let response = match adapter.execute(&request.prompt, &decision.model) {
            Ok(response) => response,
            Err(e) => {
                self.emit(
                    base_event(EventType::TaskFailed)
                        .status("error")
                        .summary(e.to_string()),
                )?;
                return Err(e.into());
            }
        };
        let latency_ms = response
            .duration_ms
            .unwrap_or_else(|| u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX));

        // A call that never started a process consumed nothing.
        let ran = !matches!(
            response.error_kind,
            Some(
                ErrorKind::CommandBuild
                    | ErrorKind::CommandNotFound
                    | ErrorKind::InvalidCommand
                    | ErrorKind::ExecutionFailed
            )
        );
        let input_tokens = metadata_u64(&response, "input_tokens")
            .unwrap_or(if ran { prompt_tokens } else { 0 });
        let output_tokens = metadata_u64(&response, "output_tokens")
            .or_else(|| metadata_u64(&response, "tokens").map(|t| t.saturating_sub(input_tokens)))
            .unwrap_or_else(|| {
                if response.is_success() {
                    estimate_tokens(&response.output)
                } else {
                    0
                }
            });
        let cost_usd = response
            .metadata
            .get("cost_usd")
            .and_then(Value::as_f64)
            .or_else(|| {
                if ran {
                    self.engine.estimate_cost(&decision.model, input_tokens, output_tokens)
                } else {
                    None
                }
            })
            .unwrap_or(0.0);

        let mut record = InvocationRecord::new(&request.agent, &decision.tool, &decision.model)
            .with_prompt(&request.prompt, self.privacy);
        record.id = invocation_id.clone();
        record.task_type = request.task_type.clone();
        record.input_tokens = input_tokens;
        record.output_tokens = output_tokens;
        record.cost_usd = cost_usd;
        record.latency_ms = latency_ms;
        record.status = response.status.as_str().to_string();
        record.error = response.error.clone();
        record.fallback_used = decision.fallback_used;

        if let Some(store) = &self.telemetry {
            store.log_invocation(&record)?;
        }

        let finished = if response.is_success() {
            base_event(EventType::TaskCompleted)
                .status("success")
                .summary(summarize(&response.output))
        } else {
            base_event(EventType::TaskFailed)
                .status("error")
                .summary(response.error.clone().unwrap_or_default())
        };
        self.emit(finished.data(json!({
            "tool": decision.tool,
            "model": decision.model,
            "cost_usd": cost_usd,
            "latency_ms": latency_ms,
        })))?;

        info!(
            agent = %request.agent,
            tool = %decision.tool,
            model = %decision.model,
            status = response.status.as_str(),
            "dispatch finished"
        );

        Ok(DispatchOutcome {
            invocation_id,
            decision,
            response,
            input_tokens,
            output_tokens,
            cost_usd,
            latency_ms,
        })
    }

    fn emit(&self, event: Event) -> Result<(), DispatchError> {
        if let Some(log) = &self.events {
            log.append(&event)?;
        }
        Ok(())
    }
}

fn metadata_u64(response: &ToolResponse, key: &str) -> Option<u64> {
    response.metadata.get(key).and_then(Value::as_u64)
}

/// First line of the output, capped for the event log
fn summarize(output: &str) -> String {
    const MAX: usize = 120;
    let first = output.lines().next().unwrap_or_default();
    if first.chars().count() > MAX {
        let mut s: String = first.chars().take(MAX).collect();
        s.push('…');
        s
    } else {
        first.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterRegistry, ResponseStatus, ToolAdapter};
    use crate::error::{AdapterError, RoutingError};
    use crate::registry::{AgentConfig, ModelConfig, PoliciesConfig, TokenCost};
    use serde_json::Map;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct CannedAdapter {
        name: String,
        models: Vec<String>,
        response: ToolResponse,
    }

    impl ToolAdapter for CannedAdapter {
        fn execute(&self, _prompt: &str, model: &str) -> Result<ToolResponse, AdapterError> {
            if !self.supports_model(model) {
                return Err(AdapterError::InvalidModel {
                    tool: self.name.clone(),
                    model: model.to_string(),
                    supported: self.models.clone(),
                });
            }
            Ok(self.response.clone())
        }
        fn validate_config(&self) -> Result<(), AdapterError> {
            Ok(())
        }
        fn tool_name(&self) -> &str {
            &self.name
        }
        fn supported_models(&self) -> &[String] {
            &self.models
        }
    }

    fn response(status: ResponseStatus, output: &str, metadata: Value) -> ToolResponse {
        let metadata: Map<String, Value> = match metadata {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        ToolResponse {
            status,
            output: output.to_string(),
            tool: "claude".to_string(),
            model: "sonnet".to_string(),
            exit_code: Some(0),
            stdout: None,
            stderr: None,
            duration_ms: Some(42),
            metadata,
            error: (status == ResponseStatus::Error).then(|| output.to_string()),
            error_kind: (status == ResponseStatus::Error).then_some(ErrorKind::NonZeroExit),
        }
    }

    fn engine(canned: ToolResponse) -> RoutingEngine {
        let mut agents = BTreeMap::new();
        agents.insert(
            "coder".to_string(),
            AgentConfig {
                preferred_tool: "claude".to_string(),
                preferred_model: "sonnet".to_string(),
                ..Default::default()
            },
        );
        let mut models = BTreeMap::new();
        models.insert(
            "sonnet".to_string(),
            ModelConfig {
                provider: "anthropic".to_string(),
                cost_per_1k_tokens: TokenCost { input: 1.0, output: 2.0 },
                ..Default::default()
            },
        );
        let mut adapters = AdapterRegistry::new();
        adapters.insert(Arc::new(CannedAdapter {
            name: "claude".to_string(),
            models: vec!["sonnet".to_string()],
            response: canned,
        }));
        RoutingEngine::new(agents, models, PoliciesConfig::default(), adapters)
    }

    fn wired(canned: ToolResponse) -> (TempDir, Arc<TelemetryStore>, Arc<EventLog>, Dispatcher) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TelemetryStore::open_at(dir.path().join("t.db")).unwrap());
        let log = Arc::new(EventLog::new(dir.path().join("events.jsonl")));
        let dispatcher = Dispatcher::new(engine(canned))
            .with_telemetry(Arc::clone(&store))
            .with_events(Arc::clone(&log))
            .with_privacy(PrivacyLevel::Minimal);
        (dir, store, log, dispatcher)
    }

    #[test]
    fn test_success_records_reported_usage() {
        let canned = response(
            ResponseStatus::Success,
            "done",
            json!({"input_tokens": 1000, "output_tokens": 500, "cost_usd": 0.5}),
        );
        let (_dir, store, log, dispatcher) = wired(canned);

        let mut request = DispatchRequest::new("coder", "write a test");
        request.run_id = Some("run-7".to_string());
        let outcome = dispatcher.dispatch(&request).unwrap();
        assert_eq!(outcome.response.output, "done");
        assert_eq!(outcome.cost_usd, 0.5);
        assert_eq!(outcome.latency_ms, 42);

        let row = store.get_invocation(&outcome.invocation_id).unwrap().unwrap();
        assert_eq!(row.input_tokens, 1000);
        assert_eq!(row.output_tokens, 500);
        assert_eq!(row.status, "success");
        assert_eq!(row.privacy_level, "minimal");
        assert!(row.prompt_digest.is_none());

        let events = log.replay().unwrap().events;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::TaskStarted);
        assert_eq!(events[1].event_type, EventType::TaskCompleted);
        assert_eq!(events[1].run_id.as_deref(), Some("run-7"));
        assert_eq!(events[1].task_id.as_deref(), Some(outcome.invocation_id.as_str()));
    }

    #[test]
    fn test_cost_estimated_from_pricing_when_not_reported() {
        let canned = response(ResponseStatus::Success, "ok", json!({"input_tokens": 2000, "tokens": 3000}));
        let (_dir, _store, _log, dispatcher) = wired(canned);
        let outcome = dispatcher.dispatch(&DispatchRequest::new("coder", "x")).unwrap();
        assert_eq!(outcome.output_tokens, 1000);
        assert!((outcome.cost_usd - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_failed_call_is_recorded_not_raised() {
        let canned = response(ResponseStatus::Error, "exit 1: boom", json!({}));
        let (_dir, store, log, dispatcher) = wired(canned);
        let outcome = dispatcher.dispatch(&DispatchRequest::new("coder", "x")).unwrap();
        assert!(!outcome.response.is_success());
        assert_eq!(outcome.output_tokens, 0);

        let row = store.get_invocation(&outcome.invocation_id).unwrap().unwrap();
        assert_eq!(row.status, "error");
        assert_eq!(row.error.as_deref(), Some("exit 1: boom"));

        let events = log.replay().unwrap().events;
        assert_eq!(events[1].event_type, EventType::TaskFailed);
    }

    #[test]
    fn test_call_that_never_ran_costs_nothing() {
        let mut canned = response(ResponseStatus::Error, "Command not found: 'claude'", json!({}));
        canned.exit_code = None;
        canned.duration_ms = None;
        canned.error_kind = Some(ErrorKind::CommandNotFound);
        let (_dir, store, _log, dispatcher) = wired(canned);

        let outcome = dispatcher
            .dispatch(&DispatchRequest::new("coder", "a prompt long enough to estimate"))
            .unwrap();
        assert_eq!(outcome.input_tokens, 0);
        assert_eq!(outcome.cost_usd, 0.0);

        let costs = store.daily_costs(None).unwrap();
        assert_eq!(costs[0].invocations, 1);
        assert_eq!(costs[0].total_cost_usd, 0.0);
        assert_eq!(costs[0].total_tokens, 0);
    }

    #[test]
    fn test_failed_run_still_charges_prompt() {
        let canned = response(ResponseStatus::Error, "exit 1: boom", json!({}));
        let (_dir, _store, _log, dispatcher) = wired(canned);
        let outcome = dispatcher.dispatch(&DispatchRequest::new("coder", "abcdefgh")).unwrap();
        assert_eq!(outcome.input_tokens, 2);
        assert!((outcome.cost_usd - 0.002).abs() < 1e-9);
    }

    #[test]
    fn test_fallback_emits_event_before_task() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(EventLog::new(dir.path().join("events.jsonl")));
        let mut agents = BTreeMap::new();
        agents.insert(
            "coder".to_string(),
            AgentConfig {
                preferred_tool: "missing".to_string(),
                preferred_model: "sonnet".to_string(),
                fallback_chain: vec!["claude:sonnet".to_string()],
                ..Default::default()
            },
        );
        let base = engine(response(ResponseStatus::Success, "ok", json!({})));
        let models = BTreeMap::from([(
            "sonnet".to_string(),
            base.model("sonnet").cloned().unwrap(),
        )]);
        let fallback_engine =
            RoutingEngine::new(agents, models, PoliciesConfig::default(), base.adapters().clone());
        let dispatcher = Dispatcher::new(fallback_engine).with_events(Arc::clone(&log));

        let outcome = dispatcher.dispatch(&DispatchRequest::new("coder", "x")).unwrap();
        assert!(outcome.decision.fallback_used);

        let events = log.replay().unwrap().events;
        let kinds: Vec<EventType> = events.iter().map(|e| e.event_type.clone()).collect();
        assert_eq!(
            kinds,
            vec![EventType::FallbackUsed, EventType::TaskStarted, EventType::TaskCompleted]
        );
        assert_eq!(events[0].data.as_ref().unwrap()["original_tool"], "missing");
    }

    #[test]
    fn test_routing_error_propagates_without_records() {
        let (_dir, store, log, dispatcher) = wired(response(ResponseStatus::Success, "", json!({})));
        let err = dispatcher.dispatch(&DispatchRequest::new("ghost", "x")).unwrap_err();
        assert!(matches!(err, DispatchError::Routing(RoutingError::UnknownAgent { .. })));
        assert_eq!(store.count_invocations().unwrap(), 0);
        assert!(log.replay().unwrap().events.is_empty());
    }

    #[test]
    fn test_without_ledgers() {
        let dispatcher = Dispatcher::new(engine(response(ResponseStatus::Success, "hi", json!({}))));
        let outcome = dispatcher.dispatch(&DispatchRequest::new("coder", "abcd")).unwrap();
        assert_eq!(outcome.input_tokens, 1);
        assert_eq!(outcome.output_tokens, 1);
    }

    #[test]
    fn test_summarize() {
        assert_eq!(summarize("first\nsecond"), "first");
        assert_eq!(summarize(&"a".repeat(200)).chars().count(), 121);
    }
}
