use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use surrealdb::Surreal;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;

use super::schema::{NODE_EXECUTION_TABLE, PERMIT_TABLE, PLAN_TABLE, RUN_TABLE, TASK_TABLE, WAIT_TABLE};

pub type Db = Surreal<Any>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: env::var("SURREALDB_URL").unwrap_or_else(|_| "memory".to_string()),
            namespace: env::var("SURREALDB_NAMESPACE").unwrap_or_else(|_| "pipeline".to_string()),
            database: env::var("SURREALDB_DATABASE").unwrap_or_else(|_| "engine".to_string()),
            username: env::var("SURREALDB_USERNAME").ok(),
            password: env::var("SURREALDB_PASSWORD").ok(),
        }
    }
}

pub async fn create_connection(config: DatabaseConfig) -> Result<Db> {
    let db = surrealdb::engine::any::connect(config.url).await?;

    // Sign in if credentials are provided
    if let (Some(username), Some(password)) = (config.username, config.password) {
        db.signin(Root {
            username: &username,
            password: &password,
        })
        .await?;
    }

    db.use_ns(config.namespace).use_db(config.database).await?;

    Ok(db)
}

/// Define the engine tables and the indexes the expiry sweeps rely on.
/// Safe to run on every start.
pub async fn ensure_schema(db: &Db) -> Result<()> {
    let schema_queries = [
        format!("DEFINE TABLE IF NOT EXISTS {PLAN_TABLE} SCHEMALESS;"),
        format!(
            "DEFINE TABLE IF NOT EXISTS {RUN_TABLE} SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS run_finished ON TABLE {RUN_TABLE} COLUMNS finished;"
        ),
        format!(
            "DEFINE TABLE IF NOT EXISTS {NODE_EXECUTION_TABLE} SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS node_execution_run ON TABLE {NODE_EXECUTION_TABLE} COLUMNS run_id;"
        ),
        // Waits are looked up by key (the record id), by owner, by run and by deadline.
        format!(
            "DEFINE TABLE IF NOT EXISTS {WAIT_TABLE} SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS wait_waiter ON TABLE {WAIT_TABLE} COLUMNS waiter_id;
             DEFINE INDEX IF NOT EXISTS wait_run ON TABLE {WAIT_TABLE} COLUMNS run_id;
             DEFINE INDEX IF NOT EXISTS wait_deadline ON TABLE {WAIT_TABLE} COLUMNS deadline_ms;"
        ),
        format!(
            "DEFINE TABLE IF NOT EXISTS {TASK_TABLE} SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS task_status ON TABLE {TASK_TABLE} COLUMNS status;
             DEFINE INDEX IF NOT EXISTS task_expires ON TABLE {TASK_TABLE} COLUMNS expires_ms;"
        ),
        format!(
            "DEFINE TABLE IF NOT EXISTS {PERMIT_TABLE} SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS permit_key ON TABLE {PERMIT_TABLE} COLUMNS resource_key;
             DEFINE INDEX IF NOT EXISTS permit_holder ON TABLE {PERMIT_TABLE} COLUMNS holder_id;"
        ),
    ];

    for query in schema_queries {
        db.query(query).await?.check()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_connection_and_schema() {
        let config = DatabaseConfig {
            url: "memory".to_string(),
            namespace: "test".to_string(),
            database: "engine".to_string(),
            username: None,
            password: None,
        };
        let db = create_connection(config).await.unwrap();
        ensure_schema(&db).await.unwrap();
        // Second run must be a no-op.
        ensure_schema(&db).await.unwrap();
    }
}
