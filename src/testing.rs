//! Test doubles and fixtures shared by the unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::config::{AgentConfig, Config, LLMConfig, SandboxConfig, ServerConfig, SessionConfig, StoreConfig};
use crate::dataset::Dataset;
use crate::llm::{LLMAdapter, LLM};
use crate::models::AppState;
use crate::orchestrator::AgentOrchestrator;
use crate::sandbox::{CodeSandbox, SandboxError, SandboxLimits, SandboxOutput};
use crate::session::SessionStore;
use crate::store::{FlightDatabase, FlightMessages, FlightTable, QueryLimits, QueryResult, StoreError, TableSchema};
use crate::types::{AppError, AppResult, LLMRequest, LLMResponse, TokenUsage};
use crate::validator::{self, ValidatedQuery};

/// Completion adapter that replays a fixed script and records every request.
#[derive(Clone)]
pub struct ScriptedLLM {
    replies: Arc<Mutex<VecDeque<AppResult<String>>>>,
    requests: Arc<Mutex<Vec<LLMRequest>>>,
}

impl ScriptedLLM {
    pub fn new(replies: Vec<AppResult<String>>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn llm(&self) -> LLM {
        LLM::with_adapter(Arc::new(self.clone()), "scripted", Duration::from_secs(5))
    }

    pub fn requests(&self) -> Vec<LLMRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

#[async_trait]
impl LLMAdapter for ScriptedLLM {
    async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AppError::UpstreamUnavailable("script exhausted".to_string())));
        reply.map(|content| LLMResponse {
            content,
            finish_reason: "stop".to_string(),
            usage: TokenUsage::default(),
        })
    }
}

/// Sandbox that replays canned results and records the code it was given.
#[derive(Clone, Default)]
pub struct ScriptedSandbox {
    results: Arc<Mutex<VecDeque<Result<String, SandboxError>>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedSandbox {
    pub fn new(results: Vec<Result<String, SandboxError>>) -> Self {
        Self {
            results: Arc::new(Mutex::new(results.into())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CodeSandbox for ScriptedSandbox {
    async fn run(&self, code: &str, _dataset: &Dataset, _limits: &SandboxLimits) -> Result<SandboxOutput, SandboxError> {
        self.calls.lock().unwrap().push(code.to_string());
        let result = self
            .results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SandboxError::Unavailable("script exhausted".to_string())));
        result.map(|stdout| SandboxOutput {
            stdout,
            stderr: String::new(),
            truncated: false,
            duration_ms: 1,
        })
    }
}

/// Table engine that is always down.
pub struct UnavailableTable;

#[async_trait]
impl FlightTable for UnavailableTable {
    async fn describe(&self) -> Result<TableSchema, StoreError> {
        Err(StoreError::Unavailable("engine offline".to_string()))
    }

    async fn execute(&self, _query: &ValidatedQuery, _limits: &QueryLimits) -> Result<QueryResult, StoreError> {
        Err(StoreError::Unavailable("engine offline".to_string()))
    }
}

/// A short flight: climb to 152.4 m while the battery sags.
pub fn sample_messages() -> FlightMessages {
    let mut messages = BTreeMap::new();

    let mut position = BTreeMap::new();
    position.insert(
        "time_boot_ms".to_string(),
        vec![json!(1000), json!(2000), json!(3000), json!(4000), json!(5000)],
    );
    position.insert(
        "alt".to_string(),
        vec![json!(100.0), json!(120.5), json!(152.4), json!(140.2), json!(98.7)],
    );
    position.insert(
        "relative_alt".to_string(),
        vec![json!(0), json!(20500), json!(52400), json!(40200), json!(-1300)],
    );
    position.insert(
        "lat".to_string(),
        vec![json!(473977418), json!(473977500), json!(473977600), json!(473977700), json!(473977800)],
    );
    position.insert(
        "lon".to_string(),
        vec![json!(85455939), json!(85456000), json!(85456100), json!(85456200), json!(85456300)],
    );
    messages.insert("GLOBAL_POSITION_INT".to_string(), position);

    let mut status = BTreeMap::new();
    status.insert(
        "time_boot_ms".to_string(),
        vec![json!(1000), json!(2000), json!(3000), json!(4000), json!(5000)],
    );
    status.insert(
        "voltage_battery".to_string(),
        vec![json!(12600), json!(12450), json!(12200), json!(11900), json!(11650)],
    );
    status.insert(
        "current_battery".to_string(),
        vec![json!(1500), json!(1800), json!(2100), json!(1700), json!(900)],
    );
    status.insert(
        "load".to_string(),
        vec![json!(310), json!(330), json!(350), json!(340), json!(300)],
    );
    messages.insert("SYS_STATUS".to_string(), status);

    let mut heartbeat = BTreeMap::new();
    heartbeat.insert("custom_mode".to_string(), vec![json!(0), json!(3), json!(6)]);
    heartbeat.insert("armed".to_string(), vec![json!(false), json!(true), json!(true)]);
    messages.insert("HEARTBEAT".to_string(), heartbeat);

    messages
}

pub async fn sample_database() -> Arc<FlightDatabase> {
    let db = FlightDatabase::in_memory().await.unwrap();
    db.load_messages(&sample_messages()).await.unwrap();
    Arc::new(db)
}

pub async fn validated_for(db: &FlightDatabase, sql: &str) -> ValidatedQuery {
    let schema = db.describe().await.unwrap();
    validator::validate(sql, &schema).unwrap()
}

pub fn test_config() -> Config {
    Config {
        server: ServerConfig {
            port: 0,
            host: "127.0.0.1".into(),
            cors_allowed_origins: vec!["*".into()],
        },
        llm: LLMConfig {
            provider: "openai".into(),
            model: "scripted".into(),
            openai_api_key: String::new(),
            groq_api_key: String::new(),
            openrouter_api_key: String::new(),
            anthropic_api_key: String::new(),
            api_base: None,
            timeout_ms: 5000,
        },
        agent: AgentConfig::default(),
        store: StoreConfig::default(),
        sandbox: SandboxConfig::default(),
        sessions: SessionConfig::default(),
    }
}

/// Application state wired to scripted collaborators.
pub fn test_state(llm: &ScriptedLLM, sandbox: &ScriptedSandbox) -> AppState {
    test_state_with(test_config(), llm, sandbox)
}

pub fn test_state_with(config: Config, llm: &ScriptedLLM, sandbox: &ScriptedSandbox) -> AppState {
    let sessions = Arc::new(SessionStore::new(&config.sessions, &config.store, None));
    let orchestrator = AgentOrchestrator::new(&config, Arc::new(llm.llm()), Arc::new(sandbox.clone()), sessions);
    AppState {
        config,
        orchestrator: Arc::new(orchestrator),
    }
}
