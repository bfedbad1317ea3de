// Flight Insight - natural-language questions over UAV flight logs

pub mod config;
pub mod models;
pub mod types;
pub mod agents;
pub mod llm;
pub mod orchestrator;
pub mod session;
pub mod store;
pub mod dataset;
pub mod validator;
pub mod sandbox;
pub mod routes;
pub mod middleware;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use config::Config;
pub use models::AppState;
pub use orchestrator::AgentOrchestrator;

pub fn create_router(state: AppState) -> axum::Router {
    routes::create_router(state)
}
