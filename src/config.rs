//! Environment-driven configuration, loaded with an optional-override →
//! env → hardcoded-default layering.

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// `ORCH_RUNSTORE`: `memory` or a persistent-backend selector (`redis`).
    pub runstore_backend: String,
    /// `REDIS_URL`, consulted only when `runstore_backend == "redis"`.
    pub redis_url: String,
    /// `ORCH_MAX_RETRIES_DEFAULT`: default `max_retries` when a plan node omits it.
    pub max_retries_default: u32,
    /// `ORCH_BACKOFF_SECONDS_DEFAULT`: default `backoff_seconds` when a plan node omits it.
    pub backoff_seconds_default: u64,
    /// `ORCH_EXECUTION_ID_HEADER`: HTTP header name for execution-id propagation.
    pub execution_id_header: String,
    /// Global parallelism cap shared across runs; `None` is unbounded.
    /// Not environment-driven; exposed here so callers (the `dagrund`
    /// binary, tests) can set it explicitly.
    pub max_parallelism: Option<usize>,
}

impl OrchestratorConfig {
    /// Load configuration from the process environment, after attempting
    /// to load a `.env` file via `dotenvy` (ignored if absent).
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            runstore_backend: env_or("ORCH_RUNSTORE", "memory"),
            redis_url: env_or("REDIS_URL", "redis://localhost:6379/0"),
            max_retries_default: env_or("ORCH_MAX_RETRIES_DEFAULT", "0").parse().unwrap_or(0),
            backoff_seconds_default: env_or("ORCH_BACKOFF_SECONDS_DEFAULT", "2").parse().unwrap_or(2),
            execution_id_header: env_or("ORCH_EXECUTION_ID_HEADER", "X-Execution-Id"),
            max_parallelism: std::env::var("ORCH_MAX_PARALLELISM").ok().and_then(|v| v.parse().ok()),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            runstore_backend: "memory".to_string(),
            redis_url: "redis://localhost:6379/0".to_string(),
            max_retries_default: 0,
            backoff_seconds_default: 2,
            execution_id_header: "X-Execution-Id".to_string(),
            max_parallelism: None,
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}
