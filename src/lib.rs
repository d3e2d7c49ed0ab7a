// Core modules
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod plan;
pub mod types;
mod utils;

// Execution
pub mod adviser;
pub mod correlator;
pub mod dispatcher;
pub mod engine;
pub mod facilitator;
pub mod resource;
pub mod steps;

pub mod api;

// Re-export key types and functions
pub use config::EngineConfig;
pub use db::{DatabaseConfig, ExecutionStore, MemoryStore, SurrealStore, create_connection, ensure_schema};
pub use engine::{Engine, EngineBuilder, RunHandle, SweepReport};
pub use error::{EngineError, EngineResult};
pub use model::{FailureInfo, FailureKind, NodeExecution, RunOutcome, RunStatus, Status};
pub use plan::{Plan, PlanNode};

use std::sync::Arc;
use anyhow::Result;

/// Convenience function to create an engine backed by SurrealDB.
///
/// Connects with the configured database settings, makes sure the schema
/// exists and registers the built-in steps, facilitators and advisers.
pub async fn create_engine(config: &EngineConfig) -> Result<Arc<Engine>> {
    let db = create_connection(config.database.clone()).await?;
    ensure_schema(&db).await?;
    let store: Arc<dyn ExecutionStore> = Arc::new(SurrealStore::new(db));

    Ok(Engine::builder(store).with_config(config).build())
}
