//! toolroute - Route prompts to command-line LLM tools
//!
//! Pick a (tool, model) pair per agent policy, run the tool safely as a
//! subprocess, normalize whatever it prints, and record what it cost.
//!
//! # Overview
//!
//! | Component | Purpose |
//! |-----------|---------|
//! | [`TemplateParser`] | Command template + values → argv, no shell |
//! | [`SubprocessExecutor`] | Run an argv with timeout and extra env |
//! | [`OutputNormalizer`] | Raw output → text, metadata, errors, warnings |
//! | [`CliToolAdapter`] | One tool's convention behind [`ToolAdapter`] |
//! | [`RoutingEngine`] | Preferred pair, overrides, cost optimization, fallback |
//! | [`TelemetryStore`] | SQLite invocation ledger + daily cost aggregates |
//! | [`EventLog`] | Append-only JSONL lifecycle events |
//! | [`Dispatcher`] | All of the above for one request |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use toolroute::{AdapterRegistry, Dispatcher, DispatchRequest, OutputNormalizer, Registry, RoutingEngine, TelemetryStore};
//!
//! let registry = Registry::load_dir(".toolroute".as_ref()).unwrap();
//! let (adapters, _skipped) = AdapterRegistry::from_tools(&registry.tools, Arc::new(OutputNormalizer::new()));
//! let engine = RoutingEngine::from_registry(&registry, adapters);
//!
//! let store = Arc::new(TelemetryStore::open_at(".toolroute/telemetry.db").unwrap());
//! let dispatcher = Dispatcher::new(engine).with_telemetry(store);
//!
//! let outcome = dispatcher.dispatch(&DispatchRequest::new("coder", "Explain this stack trace")).unwrap();
//! println!("{} via {}:{}", outcome.response.output, outcome.decision.tool, outcome.decision.model);
//! ```

pub mod adapter;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod executor;
pub mod normalize;
pub mod registry;
pub mod routing;
pub mod schema;
pub mod template;

pub use adapter::{AdapterRegistry, CliToolAdapter, ErrorKind, ResponseStatus, ToolAdapter, ToolResponse};
pub use config::Config;
pub use db::{
    AgentCostSummary, DailyCost, InvocationRecord, PrivacyLevel, StoredInvocation, TelemetryStore,
    CURRENT_SCHEMA,
};
pub use dispatch::{DispatchOutcome, DispatchRequest, Dispatcher};
pub use error::{
    AdapterError, ConfigError, DispatchError, ExecError, RoutingError, TelemetryError, TemplateError,
};
pub use events::{Event, EventLog, EventType, Replay};
pub use executor::{ExecutionResult, SubprocessExecutor, TIMEOUT_EXIT_CODE};
pub use normalize::{NormalizedOutput, OutputNormalizer};
pub use registry::{AgentConfig, ModelConfig, PoliciesConfig, Registry, ToolConfig};
pub use routing::{estimate_tokens, RoutingDecision, RoutingEngine};
pub use template::{TemplateContext, TemplateParser};
