use serde::Deserialize;

pub const PLAN_TABLE: &str = "plan";
pub const RUN_TABLE: &str = "run";
pub const NODE_EXECUTION_TABLE: &str = "node_execution";
pub const WAIT_TABLE: &str = "wait";
pub const TASK_TABLE: &str = "task";
pub const PERMIT_TABLE: &str = "permit";

/// Every engine record is stored as a JSON document in `body`, next to the
/// scalar columns queries filter on. Only `body` is ever read back.
#[derive(Debug, Clone, Deserialize)]
pub struct BodyRow {
    pub body: String,
}

impl BodyRow {
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.body)
    }
}
