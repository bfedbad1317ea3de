use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub llm: LLMConfig,
    pub agent: AgentConfig,
    pub store: StoreConfig,
    pub sandbox: SandboxConfig,
    pub sessions: SessionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub cors_allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LLMConfig {
    pub provider: String,
    pub model: String,
    pub openai_api_key: String,
    pub groq_api_key: String,
    pub openrouter_api_key: String,
    pub anthropic_api_key: String,
    pub api_base: Option<String>,
    pub timeout_ms: u64,
}

impl LLMConfig {
    /// API key for the configured provider, if one is set.
    pub fn active_api_key(&self) -> Option<String> {
        let key = match self.provider.as_str() {
            "openai" => &self.openai_api_key,
            "groq" => &self.groq_api_key,
            "openrouter" => &self.openrouter_api_key,
            "anthropic" => &self.anthropic_api_key,
            _ => return None,
        };
        if key.is_empty() {
            None
        } else {
            Some(key.clone())
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Knobs shared by the classifier and the agent chains.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Number of most recent exchanges rendered into the conversation context.
    pub history_window: usize,
    /// Ask the completion service whether a question needs clarification
    /// before generating SQL.
    pub clarification_check: bool,
    /// Rows serialised into summarisation / code-generation prompts.
    pub prompt_max_rows: usize,
    /// Rows shown to the code generator as a sample of the extracted dataset.
    pub sample_rows: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            history_window: 10,
            clarification_check: false,
            prompt_max_rows: 50,
            sample_rows: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Directory for per-session database files. In-memory when unset.
    pub data_dir: Option<PathBuf>,
    pub knowledge_base_path: Option<PathBuf>,
    pub max_rows: usize,
    pub query_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            knowledge_base_path: None,
            max_rows: 1000,
            query_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    /// Interpreter argv; the script path is appended as the last argument.
    pub interpreter: Vec<String>,
    pub timeout_ms: u64,
    pub memory_mb: u64,
    /// Run inside a bubblewrap namespace that sees only the interpreter and
    /// the scratch directory, with no network.
    pub isolate: bool,
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: vec!["python3".to_string(), "-I".to_string()],
            timeout_ms: 20_000,
            memory_mb: 512,
            isolate: true,
            max_output_bytes: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub max_sessions: usize,
    pub idle_timeout_seconds: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            idle_timeout_seconds: 3600,
        }
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(key: &str, default: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var_or(key, default)
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}", key))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let provider = var_or("LLM_PROVIDER", "openai").to_lowercase();
        let interpreter: Vec<String> = var_or("SANDBOX_INTERPRETER", "python3 -I")
            .split_whitespace()
            .map(|s| s.to_string())
            .collect();
        if interpreter.is_empty() {
            anyhow::bail!("SANDBOX_INTERPRETER must not be empty");
        }

        Ok(Self {
            server: ServerConfig {
                port: parse_var("PORT", "3000")?,
                host: var_or("HOST", "0.0.0.0"),
                cors_allowed_origins: var_or(
                    "ALLOWED_ORIGINS",
                    "http://localhost:3000,http://localhost:5173",
                )
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            },
            llm: LLMConfig {
                provider,
                model: var_or("LLM_MODEL", "gpt-4o-mini"),
                openai_api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
                groq_api_key: env::var("GROQ_API_KEY").unwrap_or_default(),
                openrouter_api_key: env::var("OPENROUTER_API_KEY").unwrap_or_default(),
                anthropic_api_key: env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
                api_base: env::var("LLM_API_BASE").ok().filter(|s| !s.is_empty()),
                timeout_ms: parse_var("LLM_TIMEOUT_MS", "60000")?,
            },
            agent: AgentConfig {
                history_window: parse_var("HISTORY_WINDOW", "10")?,
                clarification_check: parse_var("SQL_CLARIFICATION_CHECK", "false")?,
                prompt_max_rows: parse_var("PROMPT_MAX_ROWS", "50")?,
                sample_rows: parse_var("SAMPLE_ROWS", "5")?,
            },
            store: StoreConfig {
                data_dir: env::var("FLIGHT_DATA_DIR").ok().map(PathBuf::from),
                knowledge_base_path: env::var("KNOWLEDGE_BASE_PATH").ok().map(PathBuf::from),
                max_rows: parse_var("QUERY_MAX_ROWS", "1000")?,
                query_timeout_ms: parse_var("QUERY_TIMEOUT_MS", "10000")?,
            },
            sandbox: SandboxConfig {
                interpreter,
                timeout_ms: parse_var("SANDBOX_TIMEOUT_MS", "20000")?,
                memory_mb: parse_var("SANDBOX_MEMORY_MB", "512")?,
                isolate: parse_var("SANDBOX_ISOLATE", "true")?,
                max_output_bytes: parse_var("SANDBOX_MAX_OUTPUT_BYTES", "16384")?,
            },
            sessions: SessionConfig {
                max_sessions: parse_var("MAX_SESSIONS", "100")?,
                idle_timeout_seconds: parse_var("SESSION_IDLE_TIMEOUT_SECS", "3600")?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn llm_config(provider: &str) -> LLMConfig {
        LLMConfig {
            provider: provider.to_string(),
            model: "gpt-4o-mini".to_string(),
            openai_api_key: "sk-openai".to_string(),
            groq_api_key: String::new(),
            openrouter_api_key: String::new(),
            anthropic_api_key: "sk-ant".to_string(),
            api_base: None,
            timeout_ms: 1500,
        }
    }

    #[test]
    fn test_active_api_key() {
        assert_eq!(llm_config("openai").active_api_key(), Some("sk-openai".to_string()));
        assert_eq!(llm_config("anthropic").active_api_key(), Some("sk-ant".to_string()));
        assert_eq!(llm_config("groq").active_api_key(), None);
        assert_eq!(llm_config("unknown").active_api_key(), None);
        assert_eq!(llm_config("openai").timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn test_defaults() {
        let agent = AgentConfig::default();
        assert_eq!(agent.history_window, 10);
        assert!(!agent.clarification_check);

        let sandbox = SandboxConfig::default();
        assert_eq!(sandbox.interpreter, vec!["python3", "-I"]);
        assert!(sandbox.isolate);
    }
}
